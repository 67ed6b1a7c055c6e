//! [`LogicDb`], the entry point for hosts.

use std::rc::Rc;

use crate::{
    ast::{Goal, Literal, RuleDefinition, Statement},
    catalog::Catalog,
    compiler::{self, CompiledQuery},
    config::Config,
    parser,
    registry::{PredicateHook, PredicateId, Registry, Rule, Subgoal},
    store::{Bindings, Store},
    Error, Result,
};

/// What [`LogicDb::run`] did with a statement.
#[derive(Debug)]
pub enum Outcome {
    /// A ground fact was stored.
    Asserted,
    /// The statement had variables and was answered as a query.
    Bindings(Bindings),
}

impl Outcome {
    pub fn into_bindings(self) -> Option<Bindings> {
        match self {
            Outcome::Asserted => None,
            Outcome::Bindings(bindings) => Some(bindings),
        }
    }
}

/// Names a field of a predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    pub predicate: String,
    pub arity: usize,
    pub field: String,
}

impl FieldRef {
    pub fn new(predicate: impl Into<String>, arity: usize, field: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            arity,
            field: field.into(),
        }
    }
}

/// A deductive database over one SQLite store.
#[derive(Debug)]
pub struct LogicDb {
    catalog: Catalog,
    registry: Registry,
}

impl LogicDb {
    pub fn open(config: &Config) -> Result<Self> {
        Self::with_store(Store::from_config(config)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_store(Store::open_in_memory()?)
    }

    pub fn with_store(store: Store) -> Result<Self> {
        let catalog = Catalog::new(store);
        let registry = catalog.bootstrap()?;
        Ok(Self { catalog, registry })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Declares a predicate stored in a table of the same name. Another
    /// arity of the same name needs its own table, see
    /// [`LogicDb::declare_stored_predicate`].
    pub fn declare_predicate(&mut self, name: &str, fields: &[(&str, &str)]) -> Result<PredicateId> {
        self.declare_stored_predicate(name, name, fields)
    }

    pub fn declare_stored_predicate(
        &mut self,
        name: &str,
        table: &str,
        fields: &[(&str, &str)],
    ) -> Result<PredicateId> {
        self.registry
            .declare_predicate(&self.catalog, name, Some(table), fields)
    }

    /// Declares a predicate defined only by rules.
    pub fn declare_virtual_predicate(
        &mut self,
        name: &str,
        fields: &[(&str, &str)],
    ) -> Result<PredicateId> {
        self.registry.declare_predicate(&self.catalog, name, None, fields)
    }

    /// Adds an in-memory predicate whose facts and queries go to `hook`.
    pub fn register_hook(
        &mut self,
        name: &str,
        fields: &[&str],
        hook: Rc<dyn PredicateHook>,
    ) -> Result<PredicateId> {
        self.registry.register_hook(name, fields, hook)
    }

    /// Validates, stores and attaches a rule.
    pub fn declare_rule(&mut self, definition: &RuleDefinition) -> Result<()> {
        let head = self.resolve(&definition.head)?;
        let goals = definition
            .body
            .iter()
            .map(|goal| Ok(Subgoal::new(self.resolve(goal)?, goal.terms.clone())))
            .collect::<Result<Vec<_>>>()?;
        let rule = Rule::new(definition.head.terms.clone(), goals);

        self.registry.validate_rule(head, &rule)?;
        let rule = self.catalog.insert_rule(&self.registry, head, &rule)?;
        self.registry.declare_rule(head, rule)
    }

    /// Runs one statement: ground facts are asserted, facts with variables
    /// are queried. Rules are resolved but not accepted here, see
    /// [`LogicDb::declare_rule`].
    pub fn run(&mut self, statement: &Statement) -> Result<Outcome> {
        match statement {
            Statement::Fact(goal) if goal.is_ground() => {
                self.assert_fact(goal)?;
                Ok(Outcome::Asserted)
            }
            Statement::Fact(goal) => self.query(goal).map(Outcome::Bindings),
            Statement::Rule(definition) => {
                self.resolve(&definition.head)?;
                Err(Error::RuleAssertionUnsupported {
                    name: definition.head.predicate.clone(),
                    arity: definition.head.arity(),
                })
            }
        }
    }

    /// Parses and runs one statement.
    pub fn execute(&mut self, code: &str) -> Result<Outcome> {
        let statement = parser::parse_statement(code)?;
        self.run(&statement)
    }

    /// Asserts every fact and declares every rule of `code`.
    pub fn load_program(&mut self, code: &str) -> Result<()> {
        for statement in parser::parse_program(code)? {
            match &statement {
                Statement::Fact(goal) if goal.is_ground() => self.assert_fact(goal)?,
                Statement::Fact(goal) => {
                    let predicate = self.resolve(goal)?;
                    return Err(Error::compilation(
                        &goal.predicate,
                        self.registry.predicate(predicate).arity(),
                        format!("{} is a query, programs may only hold facts and rules", goal),
                    ));
                }
                Statement::Rule(definition) => self.declare_rule(definition)?,
            }
        }
        Ok(())
    }

    pub fn assert_fact(&self, goal: &Goal) -> Result<()> {
        let id = self.resolve(goal)?;
        let predicate = self.registry.predicate(id);

        let mut values = Vec::with_capacity(goal.terms.len());
        for term in &goal.terms {
            if term.is_variable() {
                return Err(Error::compilation(
                    predicate.name(),
                    predicate.arity(),
                    format!("fact argument {} is a variable", term),
                ));
            }
            values.push(term.text().to_owned());
        }

        if let Some(hook) = predicate.hook() {
            return hook.assert_fact(&values);
        }
        let table = predicate.table_name().ok_or_else(|| Error::NotInsertable {
            name: predicate.name().to_owned(),
            arity: predicate.arity(),
        })?;

        let row: Vec<(&str, Literal)> = predicate
            .fields()
            .iter()
            .zip(values)
            .map(|(field, value)| (field.name(), Literal::String(value)))
            .collect();
        self.catalog.store().insert_row(table, &row)?;
        tracing::debug!(fact = %goal, "asserted");
        Ok(())
    }

    /// Answers `goal` lazily; nothing is executed until the bindings are
    /// traversed.
    pub fn query(&self, goal: &Goal) -> Result<Bindings> {
        let id = self.resolve(goal)?;
        let predicate = self.registry.predicate(id);
        if let Some(hook) = predicate.hook() {
            return Ok(Bindings::from_hook(
                goal.to_string(),
                hook.clone(),
                goal.terms.clone(),
            ));
        }

        let query = compiler::compile_goal(&self.registry, id, &goal.terms)?;
        Ok(Bindings::from_query(
            goal.to_string(),
            self.catalog.store().clone(),
            query,
        ))
    }

    /// Whether `goal` has at least one answer.
    pub fn exists(&self, goal: &Goal) -> Result<bool> {
        Ok(!self.query(goal)?.is_empty()?)
    }

    /// The SQL `goal` compiles to.
    pub fn compile(&self, goal: &Goal) -> Result<CompiledQuery> {
        let id = self.resolve(goal)?;
        compiler::compile_goal(&self.registry, id, &goal.terms)
    }

    /// Records a named link between pairs of fields.
    pub fn link(&mut self, name: &str, pairs: &[(FieldRef, FieldRef)]) -> Result<()> {
        let part_ids = pairs
            .iter()
            .map(|(local, remote)| Ok((self.part_id(local)?, self.part_id(remote)?)))
            .collect::<Result<Vec<_>>>()?;

        self.catalog.insert_link(name, &part_ids)?;
        for link in self.catalog.read_links(&self.registry)? {
            self.registry.push_link(link);
        }
        tracing::info!(link = name, pairs = pairs.len(), "declared link");
        Ok(())
    }

    fn part_id(&self, field_ref: &FieldRef) -> Result<i64> {
        let id = self
            .registry
            .resolve(&field_ref.predicate, field_ref.arity)?;
        let predicate = self.registry.predicate(id);
        let field = predicate.field(&field_ref.field).ok_or_else(|| Error::UnknownField {
            name: predicate.name().to_owned(),
            arity: predicate.arity(),
            field: field_ref.field.clone(),
        })?;
        field.catalog_id().ok_or_else(|| Error::NotPersistent {
            name: predicate.name().to_owned(),
            arity: predicate.arity(),
        })
    }

    fn resolve(&self, goal: &Goal) -> Result<PredicateId> {
        self.registry.resolve(&goal.predicate, goal.arity())
    }
}
