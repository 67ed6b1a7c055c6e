//! The execution layer: every operation opens its own SQLite connection and
//! drops it before returning.

use std::{
    fmt,
    ops::ControlFlow,
    path::{Path, PathBuf},
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use indexmap::IndexMap;
use itertools::Itertools;
use rusqlite::{
    params_from_iter,
    types::{ToSqlOutput, Value as SqlValue, ValueRef},
    Connection, OpenFlags, ToSql,
};

use crate::{
    ast::{quote_identifier, ColumnName, Literal, Term},
    compiler::CompiledQuery,
    config::{Config, StoreLocation},
    registry::PredicateHook,
    Result,
};

/// One row, keyed by column name in column order.
pub type Row = IndexMap<ColumnName, Literal>;

/// Values of the variables of one query result row.
pub type Binding = IndexMap<ColumnName, Literal>;

static NEXT_MEMORY_DATABASE: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
enum Target {
    File(PathBuf),
    Memory(String),
}

#[derive(Debug)]
struct Inner {
    target: Target,
    // Keeps a shared-cache in-memory database alive between operations.
    _anchor: Option<Connection>,
}

/// Handle to the backing SQLite database.
///
/// Cloning is cheap; clones refer to the same database.
#[derive(Clone, Debug)]
pub struct Store {
    inner: Rc<Inner>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            inner: Rc::new(Inner {
                target: Target::File(path.as_ref().to_owned()),
                _anchor: None,
            }),
        };
        // Fail early on an unusable path.
        drop(store.connect()?);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:logicdb-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            NEXT_MEMORY_DATABASE.fetch_add(1, Ordering::Relaxed)
        );
        let anchor = Connection::open_with_flags(&uri, Self::flags())?;
        Ok(Self {
            inner: Rc::new(Inner {
                target: Target::Memory(uri),
                _anchor: Some(anchor),
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        match &config.location {
            StoreLocation::File(path) => Self::open(path),
            StoreLocation::Memory => Self::open_in_memory(),
        }
    }

    fn flags() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    }

    fn connect(&self) -> Result<Connection> {
        let conn = match &self.inner.target {
            Target::File(path) => Connection::open(path)?,
            Target::Memory(uri) => Connection::open_with_flags(uri, Self::flags())?,
        };
        Ok(conn)
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session<'_>) -> Result<T>) -> Result<T> {
        let conn = self.connect()?;
        f(&Session { conn: &conn })
    }

    /// Runs `f` inside one transaction on one connection. Nothing `f` wrote
    /// is kept unless it returns `Ok`.
    pub fn transaction<T>(&self, f: impl FnOnce(&Session<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let value = f(&Session { conn: &tx })?;
        tx.commit()?;
        Ok(value)
    }

    pub fn ensure_table(&self, table: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.with_session(|session| session.ensure_table(table, fields))
    }

    pub fn insert_row(&self, table: &str, fields: &[(&str, Literal)]) -> Result<()> {
        self.with_session(|session| session.insert_row(table, fields))
    }

    pub fn select_rows<F>(&self, table: &str, filters: &[(&str, Literal)], f: F) -> Result<()>
    where
        F: FnMut(Row) -> Result<ControlFlow<()>>,
    {
        self.with_session(|session| session.select_rows(table, filters, f))
    }

    pub fn collect_rows(&self, table: &str, filters: &[(&str, Literal)]) -> Result<Vec<Row>> {
        self.with_session(|session| session.collect_rows(table, filters))
    }

    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.with_session(|session| session.execute_raw(sql))
    }

    pub fn visit<I, F>(&self, sql: &str, params: I, f: F) -> Result<()>
    where
        I: IntoIterator,
        I::Item: ToSql,
        F: FnMut(&[ColumnName], &rusqlite::Row<'_>) -> Result<ControlFlow<()>>,
    {
        self.with_session(|session| session.visit(sql, params, f))
    }
}

/// Statements over one open connection, possibly inside a transaction.
pub struct Session<'c> {
    conn: &'c Connection,
}

impl Session<'_> {
    /// `CREATE TABLE IF NOT EXISTS` with the given `(name, type)` columns.
    pub fn ensure_table(&self, table: &str, fields: &[(&str, &str)]) -> Result<()> {
        let columns = fields
            .iter()
            .map(|(name, field_type)| format!("{} {}", quote_identifier(name), field_type))
            .join(", ");
        self.execute_raw(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(table),
            columns
        ))
    }

    pub fn insert_row(&self, table: &str, fields: &[(&str, Literal)]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            fields.iter().map(|(name, _)| quote_identifier(name)).join(", "),
            (1..=fields.len()).map(|i| format!("?{}", i)).join(", ")
        );
        tracing::debug!(%sql, "insert");
        self.conn
            .execute(&sql, params_from_iter(fields.iter().map(|(_, value)| value)))?;
        Ok(())
    }

    /// Streams the rows of `table` whose columns equal the given values to
    /// `f`, until it breaks or the rows run out.
    pub fn select_rows<F>(&self, table: &str, filters: &[(&str, Literal)], mut f: F) -> Result<()>
    where
        F: FnMut(Row) -> Result<ControlFlow<()>>,
    {
        let mut sql = format!("SELECT * FROM {}", quote_identifier(table));
        if !filters.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(
                &filters
                    .iter()
                    .enumerate()
                    .map(|(i, (name, _))| format!("{} = ?{}", quote_identifier(name), i + 1))
                    .join(" AND "),
            );
        }

        self.visit(
            &sql,
            filters.iter().map(|(_, value)| value),
            |columns, row| {
                let row = columns
                    .iter()
                    .enumerate()
                    .map(|(i, name)| Ok((name.clone(), Literal::from(row.get_ref(i)?))))
                    .collect::<Result<Row>>()?;
                f(row)
            },
        )
    }

    pub fn collect_rows(&self, table: &str, filters: &[(&str, Literal)]) -> Result<Vec<Row>> {
        let mut rows = vec![];
        self.select_rows(table, filters, |row| {
            rows.push(row);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(rows)
    }

    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        tracing::debug!(%sql, "execute");
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Runs `sql` and feeds each row to `f` until it breaks or the rows run
    /// out. The cursor is released before returning.
    pub fn visit<I, F>(&self, sql: &str, params: I, mut f: F) -> Result<()>
    where
        I: IntoIterator,
        I::Item: ToSql,
        F: FnMut(&[ColumnName], &rusqlite::Row<'_>) -> Result<ControlFlow<()>>,
    {
        tracing::debug!(%sql, "query");
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<ColumnName> = stmt
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let mut rows = stmt.query(params_from_iter(params))?;
        while let Some(row) = rows.next()? {
            if f(&columns, row)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl From<ValueRef<'_>> for Literal {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Literal::Null,
            ValueRef::Integer(x) => Literal::Integer(x.into()),
            ValueRef::Real(x) => Literal::Real(x),
            ValueRef::Text(s) => Literal::String(String::from_utf8_lossy(s).into_owned()),
            ValueRef::Blob(b) => Literal::Blob(b.to_vec()),
        }
    }
}

impl ToSql for Literal {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Literal::Null => ToSqlOutput::Owned(SqlValue::Null),
            Literal::Integer(n) => {
                let n = i64::try_from(n)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                ToSqlOutput::Owned(SqlValue::Integer(n))
            }
            Literal::Real(x) => ToSqlOutput::Owned(SqlValue::Real(*x)),
            Literal::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Literal::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

enum Source {
    Sql {
        store: Store,
        query: CompiledQuery,
    },
    Hook {
        hook: Rc<dyn PredicateHook>,
        terms: Vec<Term>,
    },
}

/// The result of a query: a lazy, restartable sequence of bindings.
///
/// Nothing runs until the sequence is traversed, and every traversal runs the
/// query again against the current contents of the store.
pub struct Bindings {
    goal: String,
    source: Source,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Bindings");
        s.field("goal", &self.goal);
        match &self.source {
            Source::Sql { query, .. } => s.field("sql", &query.sql),
            Source::Hook { hook, .. } => s.field("hook", hook),
        };
        s.finish()
    }
}

impl Bindings {
    pub(crate) fn from_query(goal: String, store: Store, query: CompiledQuery) -> Self {
        Self {
            goal,
            source: Source::Sql { store, query },
        }
    }

    pub(crate) fn from_hook(goal: String, hook: Rc<dyn PredicateHook>, terms: Vec<Term>) -> Self {
        Self {
            goal,
            source: Source::Hook { hook, terms },
        }
    }

    /// The goal these bindings answer, as written.
    pub fn goal(&self) -> &str {
        &self.goal
    }

    /// The generated SQL, unless the predicate is served by a host hook.
    pub fn sql(&self) -> Option<&str> {
        match &self.source {
            Source::Sql { query, .. } => Some(&query.sql),
            Source::Hook { .. } => None,
        }
    }

    /// Feeds each binding to `f` until it breaks or the results run out.
    pub fn try_for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Binding) -> ControlFlow<()>,
    {
        match &self.source {
            Source::Sql { store, query } => {
                store.visit(&query.sql, std::iter::empty::<Literal>(), |_, row| {
                    let binding = query
                        .columns
                        .iter()
                        .enumerate()
                        .map(|(i, name)| Ok((name.clone(), Literal::from(row.get_ref(i)?))))
                        .collect::<Result<Binding>>()?;
                    Ok(f(binding))
                })
            }
            Source::Hook { hook, terms } => {
                for binding in hook.query(terms)? {
                    if f(binding).is_break() {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    pub fn to_vec(&self) -> Result<Vec<Binding>> {
        let mut bindings = vec![];
        self.try_for_each(|binding| {
            bindings.push(binding);
            ControlFlow::Continue(())
        })?;
        Ok(bindings)
    }

    pub fn first(&self) -> Result<Option<Binding>> {
        let mut first = None;
        self.try_for_each(|binding| {
            first = Some(binding);
            ControlFlow::Break(())
        })?;
        Ok(first)
    }

    /// Stops at the first row.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.first()?.is_none())
    }

    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        self.try_for_each(|_| {
            count += 1;
            ControlFlow::Continue(())
        })?;
        Ok(count)
    }
}
