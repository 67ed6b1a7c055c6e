//! The self-describing catalog.
//!
//! Predicates, their fields, rules, goals and links are stored in ordinary
//! tables, and each of those tables is itself declared as a predicate, so the
//! catalog can be queried like any user data.

use std::{collections::HashMap, ops::ControlFlow};

use itertools::Itertools;

use crate::{
    ast::{Literal, Term},
    registry::{Field, Link, Predicate, PredicateId, Registry, Rule, Subgoal},
    store::{Row, Session, Store},
    Error, Result,
};

/// The name and `(column, type)` list of a catalog table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub fields: &'static [(&'static str, &'static str)],
}

const ID: (&str, &str) = ("id", "INTEGER PRIMARY KEY AUTOINCREMENT");

pub const PREDICATE: TableSpec = TableSpec {
    name: "predicate",
    fields: &[ID, ("name", "TEXT"), ("arity", "INTEGER"), ("table_name", "TEXT")],
};

pub const PREDICATE_PART: TableSpec = TableSpec {
    name: "predicate_part",
    fields: &[
        ID,
        ("predicate_id", "INTEGER"),
        ("seq", "INTEGER"),
        ("field_name", "TEXT"),
        ("field_type", "TEXT"),
    ],
};

pub const RULE: TableSpec = TableSpec {
    name: "rule",
    fields: &[ID, ("predicate_id", "INTEGER")],
};

pub const RULE_ARGUMENT: TableSpec = TableSpec {
    name: "rule_argument",
    fields: &[
        ID,
        ("rule_id", "INTEGER"),
        ("seq", "INTEGER"),
        ("argument", "TEXT"),
        ("argument_type", "TEXT"),
    ],
};

pub const QUERY: TableSpec = TableSpec {
    name: "query",
    fields: &[
        ID,
        ("rule_id", "INTEGER"),
        ("seq", "INTEGER"),
        ("predicate_id", "INTEGER"),
    ],
};

pub const QUERY_ARGUMENT: TableSpec = TableSpec {
    name: "query_argument",
    fields: &[
        ID,
        ("query_id", "INTEGER"),
        ("seq", "INTEGER"),
        ("argument", "TEXT"),
        ("argument_type", "TEXT"),
    ],
};

pub const LINK: TableSpec = TableSpec {
    name: "link",
    fields: &[
        ID,
        ("link_name", "TEXT"),
        ("local_part_id", "INTEGER"),
        ("remote_part_id", "INTEGER"),
    ],
};

pub const BUILTIN_TABLES: [TableSpec; 7] = [
    PREDICATE,
    PREDICATE_PART,
    RULE,
    RULE_ARGUMENT,
    QUERY,
    QUERY_ARGUMENT,
    LINK,
];

const VARIABLE: &str = "VAR";
const CONSTANT: &str = "CONST";

#[derive(Clone, Debug)]
pub struct Catalog {
    store: Store,
}

impl Catalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Creates the catalog tables if needed, loads every stored predicate and
    /// declares the catalog's own tables as predicates. Safe to repeat
    /// against the same store.
    pub fn bootstrap(&self) -> Result<Registry> {
        self.store.transaction(|session| {
            for table in &BUILTIN_TABLES {
                session.ensure_table(table.name, table.fields)?;
            }
            Ok(())
        })?;

        let mut registry = self.load()?;
        for table in &BUILTIN_TABLES {
            registry.declare_predicate(self, table.name, Some(table.name), table.fields)?;
        }

        tracing::info!(
            predicates = registry.predicates().count(),
            links = registry.links().len(),
            "catalog loaded"
        );
        Ok(registry)
    }

    /// Rebuilds the predicate graph from the catalog rows, read in one
    /// transaction.
    pub fn load(&self) -> Result<Registry> {
        self.store.transaction(load)
    }

    /// Writes a predicate row and one row per field, creating `table_name`
    /// first if given, and reads them back. Either everything is written or
    /// nothing is.
    pub(crate) fn insert_predicate(
        &self,
        name: &str,
        table_name: Option<&str>,
        fields: &[(&str, &str)],
    ) -> Result<(i64, Vec<Field>)> {
        self.store.transaction(|session| {
            if let Some(table_name) = table_name {
                session.ensure_table(table_name, fields)?;
            }

            let arity = fields.len();
            session.insert_row(
                PREDICATE.name,
                &[
                    ("name", name.into()),
                    ("arity", arity.into()),
                    ("table_name", table_name.map_or(Literal::Null, Literal::from)),
                ],
            )?;
            let rows = session.collect_rows(
                PREDICATE.name,
                &[("name", name.into()), ("arity", arity.into())],
            )?;
            let predicate_id = latest_id(&rows, PREDICATE.name)?;

            for (seq, (name, field_type)) in fields.iter().enumerate() {
                session.insert_row(
                    PREDICATE_PART.name,
                    &[
                        ("predicate_id", predicate_id.into()),
                        ("seq", seq.into()),
                        ("field_name", (*name).into()),
                        ("field_type", (*field_type).into()),
                    ],
                )?;
            }

            let fields = session
                .collect_rows(PREDICATE_PART.name, &[("predicate_id", predicate_id.into())])?
                .iter()
                .map(field_from_row)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .sorted_by_key(|field| field.position)
                .collect();
            Ok((predicate_id, fields))
        })
    }

    /// Writes `rule` for `head` (rule, rule_argument, query and
    /// query_argument rows) in one transaction and reads it back.
    pub(crate) fn insert_rule(
        &self,
        registry: &Registry,
        head: PredicateId,
        rule: &Rule,
    ) -> Result<Rule> {
        let head_id = persistent_id(registry.predicate(head))?;
        let goal_ids = rule
            .goals()
            .iter()
            .map(|goal| persistent_id(registry.predicate(goal.predicate())))
            .collect::<Result<Vec<_>>>()?;

        self.store.transaction(|session| {
            session.insert_row(RULE.name, &[("predicate_id", head_id.into())])?;
            let rows = session.collect_rows(RULE.name, &[("predicate_id", head_id.into())])?;
            let rule_id = latest_id(&rows, RULE.name)?;

            insert_terms(session, RULE_ARGUMENT.name, "rule_id", rule_id, rule.arguments())?;

            for (seq, (goal, predicate_id)) in rule.goals().iter().zip(goal_ids).enumerate() {
                session.insert_row(
                    QUERY.name,
                    &[
                        ("rule_id", rule_id.into()),
                        ("seq", seq.into()),
                        ("predicate_id", predicate_id.into()),
                    ],
                )?;
                let rows = session.collect_rows(
                    QUERY.name,
                    &[("rule_id", rule_id.into()), ("seq", seq.into())],
                )?;
                let query_id = latest_id(&rows, QUERY.name)?;
                insert_terms(session, QUERY_ARGUMENT.name, "query_id", query_id, goal.terms())?;
            }

            let (_, rule) = read_rule(session, registry, rule_id)?;
            Ok(rule)
        })
    }

    /// Writes one link row per `(local, remote)` pair of predicate_part ids.
    pub(crate) fn insert_link(&self, name: &str, pairs: &[(i64, i64)]) -> Result<()> {
        self.store.transaction(|session| {
            for (local_part_id, remote_part_id) in pairs {
                session.insert_row(
                    LINK.name,
                    &[
                        ("link_name", name.into()),
                        ("local_part_id", (*local_part_id).into()),
                        ("remote_part_id", (*remote_part_id).into()),
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub(crate) fn read_links(&self, registry: &Registry) -> Result<Vec<Link>> {
        self.store
            .transaction(|session| read_links(session, registry))
    }
}

fn load(session: &Session<'_>) -> Result<Registry> {
    let mut registry = Registry::default();

    let mut fields: HashMap<i64, Vec<Field>> = HashMap::new();
    session.select_rows(PREDICATE_PART.name, &[], |row| {
        let predicate_id = integer(&row, PREDICATE_PART.name, "predicate_id")?;
        fields
            .entry(predicate_id)
            .or_default()
            .push(field_from_row(&row)?);
        Ok(ControlFlow::Continue(()))
    })?;

    let predicate_rows = session.collect_rows(PREDICATE.name, &[])?;
    for row in sorted_by_id(predicate_rows, PREDICATE.name)? {
        let id = integer(&row, PREDICATE.name, "id")?;
        let name = text(&row, PREDICATE.name, "name")?;
        let arity = integer(&row, PREDICATE.name, "arity")?;
        let table_name = optional_text(&row, PREDICATE.name, "table_name")?;

        let fields = fields
            .remove(&id)
            .unwrap_or_default()
            .into_iter()
            .sorted_by_key(|field| field.position)
            .collect::<Vec<_>>();
        let positions_match = fields
            .iter()
            .enumerate()
            .all(|(i, field)| field.position == i);
        if fields.len() as i64 != arity || !positions_match {
            return Err(Error::Catalog(format!(
                "predicate {}/{} has {} stored fields",
                name,
                arity,
                fields.len()
            )));
        }

        registry.insert(Predicate::new(Some(id), name, table_name, fields));
    }
    if let Some(predicate_id) = fields.keys().next() {
        return Err(Error::Catalog(format!(
            "fields refer to unknown predicate {}",
            predicate_id
        )));
    }

    let rule_rows = session.collect_rows(RULE.name, &[])?;
    for row in sorted_by_id(rule_rows, RULE.name)? {
        let (head, rule) = read_rule(session, &registry, integer(&row, RULE.name, "id")?)?;
        registry.attach_rule(head, rule)?;
    }

    for link in read_links(session, &registry)? {
        registry.push_link(link);
    }

    Ok(registry)
}

fn insert_terms(
    session: &Session<'_>,
    table: &str,
    owner: &str,
    owner_id: i64,
    terms: &[Term],
) -> Result<()> {
    for (seq, term) in terms.iter().enumerate() {
        let argument_type = match term {
            Term::Variable(_) => VARIABLE,
            Term::Constant(_) => CONSTANT,
        };
        session.insert_row(
            table,
            &[
                (owner, owner_id.into()),
                ("seq", seq.into()),
                ("argument", term.text().into()),
                ("argument_type", argument_type.into()),
            ],
        )?;
    }
    Ok(())
}

fn read_terms(session: &Session<'_>, table: &str, owner: &str, owner_id: i64) -> Result<Vec<Term>> {
    let mut terms = vec![];
    session.select_rows(table, &[(owner, owner_id.into())], |row| {
        let seq = integer(&row, table, "seq")?;
        let argument = text(&row, table, "argument")?;
        let term = match text(&row, table, "argument_type")?.as_str() {
            VARIABLE => Term::Variable(argument),
            CONSTANT => Term::Constant(argument),
            other => {
                return Err(Error::Catalog(format!(
                    "{} row has unknown argument type {:?}",
                    table, other
                )))
            }
        };
        terms.push((seq, term));
        Ok(ControlFlow::Continue(()))
    })?;

    Ok(terms
        .into_iter()
        .sorted_by_key(|(seq, _)| *seq)
        .map(|(_, term)| term)
        .collect())
}

fn read_rule(session: &Session<'_>, registry: &Registry, rule_id: i64) -> Result<(PredicateId, Rule)> {
    let row = session
        .collect_rows(RULE.name, &[("id", rule_id.into())])?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Catalog(format!("rule {} not found", rule_id)))?;
    let head = predicate_by_catalog_id(registry, integer(&row, RULE.name, "predicate_id")?)?;

    let arguments = read_terms(session, RULE_ARGUMENT.name, "rule_id", rule_id)?;

    let goals = session
        .collect_rows(QUERY.name, &[("rule_id", rule_id.into())])?
        .iter()
        .map(|row| {
            let query_id = integer(row, QUERY.name, "id")?;
            let seq = integer(row, QUERY.name, "seq")?;
            let predicate =
                predicate_by_catalog_id(registry, integer(row, QUERY.name, "predicate_id")?)?;
            let terms = read_terms(session, QUERY_ARGUMENT.name, "query_id", query_id)?;
            Ok((
                seq,
                Subgoal {
                    catalog_id: Some(query_id),
                    predicate,
                    terms,
                },
            ))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sorted_by_key(|(seq, _)| *seq)
        .map(|(_, goal)| goal)
        .collect();

    Ok((
        head,
        Rule {
            catalog_id: Some(rule_id),
            arguments,
            goals,
        },
    ))
}

fn read_links(session: &Session<'_>, registry: &Registry) -> Result<Vec<Link>> {
    let mut locations = HashMap::new();
    for (id, predicate) in registry.predicates() {
        for field in predicate.fields() {
            if let Some(part_id) = field.catalog_id() {
                locations.insert(part_id, (id, field.position()));
            }
        }
    }
    let locate = |row: &Row, column: &str| -> Result<(PredicateId, usize)> {
        let part_id = integer(row, LINK.name, column)?;
        locations.get(&part_id).copied().ok_or_else(|| {
            Error::Catalog(format!("link refers to unknown field {}", part_id))
        })
    };

    let rows = session.collect_rows(LINK.name, &[])?;
    sorted_by_id(rows, LINK.name)?
        .iter()
        .map(|row| {
            Ok(Link {
                catalog_id: integer(row, LINK.name, "id")?,
                name: text(row, LINK.name, "link_name")?,
                local: locate(row, "local_part_id")?,
                remote: locate(row, "remote_part_id")?,
            })
        })
        .collect()
}

fn persistent_id(predicate: &Predicate) -> Result<i64> {
    predicate.catalog_id().ok_or_else(|| Error::NotPersistent {
        name: predicate.name().to_owned(),
        arity: predicate.arity(),
    })
}

fn predicate_by_catalog_id(registry: &Registry, catalog_id: i64) -> Result<PredicateId> {
    registry
        .find_by_catalog_id(catalog_id)
        .ok_or_else(|| Error::Catalog(format!("unknown predicate id {}", catalog_id)))
}

fn field_from_row(row: &Row) -> Result<Field> {
    let table = PREDICATE_PART.name;
    let seq = integer(row, table, "seq")?;
    Ok(Field {
        catalog_id: Some(integer(row, table, "id")?),
        position: usize::try_from(seq)
            .map_err(|_| Error::Catalog(format!("negative field position {}", seq)))?,
        name: text(row, table, "field_name")?,
        field_type: optional_text(row, table, "field_type")?.unwrap_or_default(),
    })
}

fn column<'r>(row: &'r Row, table: &str, column: &str) -> Result<&'r Literal> {
    row.get(column)
        .ok_or_else(|| Error::Catalog(format!("{} has no column {}", table, column)))
}

fn integer(row: &Row, table: &str, name: &str) -> Result<i64> {
    let value = column(row, table, name)?;
    value.as_i64().ok_or_else(|| {
        Error::Catalog(format!("{}.{} is not an integer: {:?}", table, name, value))
    })
}

fn text(row: &Row, table: &str, name: &str) -> Result<String> {
    optional_text(row, table, name)?
        .ok_or_else(|| Error::Catalog(format!("{}.{} is null", table, name)))
}

fn optional_text(row: &Row, table: &str, name: &str) -> Result<Option<String>> {
    match column(row, table, name)? {
        Literal::Null => Ok(None),
        Literal::String(s) => Ok(Some(s.clone())),
        other => Err(Error::Catalog(format!(
            "{}.{} is not text: {:?}",
            table, name, other
        ))),
    }
}

fn sorted_by_id(rows: Vec<Row>, table: &str) -> Result<Vec<Row>> {
    let keyed = rows
        .into_iter()
        .map(|row| Ok((integer(&row, table, "id")?, row)))
        .collect::<Result<Vec<_>>>()?;
    Ok(keyed
        .into_iter()
        .sorted_by_key(|(id, _)| *id)
        .map(|(_, row)| row)
        .collect())
}

/// Ids come from AUTOINCREMENT, so the newest matching row has the largest.
fn latest_id(rows: &[Row], table: &str) -> Result<i64> {
    rows.iter()
        .map(|row| integer(row, table, "id"))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .max()
        .ok_or_else(|| Error::Catalog(format!("row written to {} was not found", table)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_declares_the_catalog_tables_as_predicates() {
        let catalog = Catalog::new(Store::open_in_memory().unwrap());
        let registry = catalog.bootstrap().unwrap();

        for table in &BUILTIN_TABLES {
            let id = registry.resolve(table.name, table.fields.len()).unwrap();
            let predicate = registry.predicate(id);
            assert_eq!(predicate.table_name(), Some(table.name));
            assert_eq!(
                predicate
                    .fields()
                    .iter()
                    .map(|field| (field.name(), field.field_type()))
                    .collect::<Vec<_>>(),
                table.fields.to_vec()
            );
        }
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let catalog = Catalog::new(Store::open_in_memory().unwrap());
        catalog.bootstrap().unwrap();
        let registry = catalog.bootstrap().unwrap();
        catalog.bootstrap().unwrap();

        let rows = catalog.store().collect_rows(PREDICATE.name, &[]).unwrap();
        assert_eq!(rows.len(), BUILTIN_TABLES.len());
        assert_eq!(registry.predicates().count(), BUILTIN_TABLES.len());

        let parts = catalog.store().collect_rows(PREDICATE_PART.name, &[]).unwrap();
        let expected: usize = BUILTIN_TABLES.iter().map(|table| table.fields.len()).sum();
        assert_eq!(parts.len(), expected);
    }

    #[test]
    fn rules_are_written_and_reloaded() {
        let catalog = Catalog::new(Store::open_in_memory().unwrap());
        let mut registry = catalog.bootstrap().unwrap();
        let edge = registry
            .declare_predicate(&catalog, "edge", Some("edge"), &[("a", "TEXT"), ("b", "TEXT")])
            .unwrap();
        let hop = registry
            .declare_predicate(&catalog, "hop", None, &[("a", "TEXT"), ("c", "TEXT")])
            .unwrap();
        let rule = Rule::new(
            vec![Term::variable("X"), Term::variable("Z")],
            vec![
                Subgoal::new(edge, vec![Term::variable("X"), Term::variable("Y")]),
                Subgoal::new(edge, vec![Term::variable("Y"), Term::variable("Z")]),
            ],
        );

        let stored = catalog.insert_rule(&registry, hop, &rule).unwrap();
        assert!(stored.catalog_id().is_some());
        assert_eq!(stored.arguments(), rule.arguments());
        assert_eq!(
            stored.goals().iter().map(Subgoal::terms).collect::<Vec<_>>(),
            rule.goals().iter().map(Subgoal::terms).collect::<Vec<_>>()
        );
        assert!(stored.goals().iter().all(|goal| goal.catalog_id.is_some()));

        let reloaded = catalog.load().unwrap();
        let hop = reloaded.resolve("hop", 2).unwrap();
        let rules = reloaded.predicate(hop).rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], stored);
    }

    #[test]
    fn failed_declarations_write_nothing() {
        let catalog = Catalog::new(Store::open_in_memory().unwrap());
        let mut registry = catalog.bootstrap().unwrap();
        let before = catalog.store().collect_rows(PREDICATE.name, &[]).unwrap().len();

        catalog
            .store()
            .execute_raw(
                "CREATE TRIGGER refuse_parts BEFORE INSERT ON predicate_part \
                 BEGIN SELECT RAISE(ABORT, 'refused'); END",
            )
            .unwrap();
        let err = registry
            .declare_predicate(&catalog, "pair", Some("pair"), &[("a", "TEXT"), ("b", "TEXT")])
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert!(registry.find("pair", 2).is_none());

        let after = catalog.store().collect_rows(PREDICATE.name, &[]).unwrap();
        assert_eq!(after.len(), before);
        // The backing table was rolled back with the rows.
        assert!(catalog.store().collect_rows("pair", &[]).is_err());

        catalog.store().execute_raw("DROP TRIGGER refuse_parts").unwrap();
        let reloaded = catalog.load().unwrap();
        assert!(reloaded.find("pair", 2).is_none());
        registry
            .declare_predicate(&catalog, "pair", Some("pair"), &[("a", "TEXT"), ("b", "TEXT")])
            .unwrap();
    }

    #[test]
    fn failed_rules_write_nothing() {
        let catalog = Catalog::new(Store::open_in_memory().unwrap());
        let mut registry = catalog.bootstrap().unwrap();
        let thing = registry
            .declare_predicate(&catalog, "thing", Some("thing"), &[("x", "TEXT")])
            .unwrap();
        let alias = registry
            .declare_predicate(&catalog, "alias", None, &[("x", "TEXT")])
            .unwrap();
        let rule = Rule::new(
            vec![Term::variable("X")],
            vec![Subgoal::new(thing, vec![Term::variable("X")])],
        );

        catalog
            .store()
            .execute_raw(
                "CREATE TRIGGER refuse_goals BEFORE INSERT ON query \
                 BEGIN SELECT RAISE(ABORT, 'refused'); END",
            )
            .unwrap();
        assert!(catalog.insert_rule(&registry, alias, &rule).is_err());
        for table in [RULE.name, RULE_ARGUMENT.name, QUERY.name] {
            assert!(catalog.store().collect_rows(table, &[]).unwrap().is_empty());
        }
        assert!(catalog.load().is_ok());
    }

    #[test]
    fn unknown_argument_types_are_catalog_errors() {
        let catalog = Catalog::new(Store::open_in_memory().unwrap());
        let mut registry = catalog.bootstrap().unwrap();
        let thing = registry
            .declare_predicate(&catalog, "thing", Some("thing"), &[("x", "TEXT")])
            .unwrap();
        let alias = registry
            .declare_predicate(&catalog, "alias", None, &[("x", "TEXT")])
            .unwrap();
        let rule = Rule::new(
            vec![Term::variable("X")],
            vec![Subgoal::new(thing, vec![Term::variable("X")])],
        );
        catalog.insert_rule(&registry, alias, &rule).unwrap();

        catalog
            .store()
            .execute_raw("UPDATE rule_argument SET argument_type = 'WHAT'")
            .unwrap();
        assert!(matches!(catalog.load(), Err(Error::Catalog(_))));
    }
}
