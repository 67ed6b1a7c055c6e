//! The in-memory predicate graph.

use std::{collections::HashSet, fmt, rc::Rc};

use itertools::Itertools;

use crate::{
    ast::{ColumnName, Identifier, PredicateName, Term},
    catalog::Catalog,
    compiler,
    store::Binding,
    Error, Result,
};

/// Index of a predicate inside its [`Registry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PredicateId(pub(crate) usize);

/// Host-supplied behaviour for a predicate that is not stored in tables.
pub trait PredicateHook: fmt::Debug {
    /// Receives a ground fact asserted against the predicate.
    fn assert_fact(&self, values: &[String]) -> Result<()>;

    /// Answers a goal; each binding maps the goal's variables to values.
    fn query(&self, terms: &[Term]) -> Result<Vec<Binding>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub(crate) catalog_id: Option<i64>,
    pub(crate) position: usize,
    pub(crate) name: ColumnName,
    pub(crate) field_type: String,
}

impl Field {
    pub fn catalog_id(&self) -> Option<i64> {
        self.catalog_id
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &str {
        &self.field_type
    }
}

/// One invocation inside a rule body. Its index in the body is its sequence
/// number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subgoal {
    pub(crate) catalog_id: Option<i64>,
    pub(crate) predicate: PredicateId,
    pub(crate) terms: Vec<Term>,
}

impl Subgoal {
    pub fn new(predicate: PredicateId, terms: Vec<Term>) -> Self {
        Self {
            catalog_id: None,
            predicate,
            terms,
        }
    }

    pub fn predicate(&self) -> PredicateId {
        self.predicate
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn variables(&self) -> Vec<&str> {
        self.terms
            .iter()
            .filter_map(Term::variable_name)
            .unique()
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub(crate) catalog_id: Option<i64>,
    pub(crate) arguments: Vec<Term>,
    pub(crate) goals: Vec<Subgoal>,
}

impl Rule {
    /// `arguments` holds one term per head field.
    pub fn new(arguments: Vec<Term>, goals: Vec<Subgoal>) -> Self {
        Self {
            catalog_id: None,
            arguments,
            goals,
        }
    }

    pub fn catalog_id(&self) -> Option<i64> {
        self.catalog_id
    }

    pub fn arguments(&self) -> &[Term] {
        &self.arguments
    }

    pub fn goals(&self) -> &[Subgoal] {
        &self.goals
    }
}

#[derive(Clone, Debug)]
pub struct Predicate {
    pub(crate) catalog_id: Option<i64>,
    pub(crate) name: PredicateName,
    pub(crate) table_name: Option<Identifier>,
    pub(crate) fields: Vec<Field>,
    pub(crate) rules: Vec<Rule>,
    pub(crate) hook: Option<Rc<dyn PredicateHook>>,
}

impl Predicate {
    pub(crate) fn new(
        catalog_id: Option<i64>,
        name: impl Into<String>,
        table_name: Option<String>,
        fields: Vec<Field>,
    ) -> Self {
        Self {
            catalog_id,
            name: name.into(),
            table_name,
            fields,
            rules: vec![],
            hook: None,
        }
    }

    pub fn catalog_id(&self) -> Option<i64> {
        self.catalog_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table_name.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn hook(&self) -> Option<&Rc<dyn PredicateHook>> {
        self.hook.as_ref()
    }

    pub fn is_virtual(&self) -> bool {
        self.table_name.is_none()
    }

    fn same_fields(&self, fields: &[(&str, &str)]) -> bool {
        self.fields.len() == fields.len()
            && self
                .fields
                .iter()
                .zip(fields)
                .all(|(field, (name, field_type))| {
                    field.name == *name && field.field_type == *field_type
                })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.arity())
    }
}

/// A descriptive annotation tying a field of one predicate to a field of
/// another. Fields are given as `(predicate, position)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub(crate) catalog_id: i64,
    pub(crate) name: Identifier,
    pub(crate) local: (PredicateId, usize),
    pub(crate) remote: (PredicateId, usize),
}

impl Link {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local(&self) -> (PredicateId, usize) {
        self.local
    }

    pub fn remote(&self) -> (PredicateId, usize) {
        self.remote
    }
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
    predicates: Vec<Predicate>,
    links: Vec<Link>,
}

impl Registry {
    pub fn find(&self, name: &str, arity: usize) -> Option<PredicateId> {
        self.predicates
            .iter()
            .position(|predicate| predicate.name == name && predicate.arity() == arity)
            .map(PredicateId)
    }

    pub fn resolve(&self, name: &str, arity: usize) -> Result<PredicateId> {
        self.find(name, arity).ok_or_else(|| Error::UnknownPredicate {
            name: name.to_owned(),
            arity,
        })
    }

    pub fn find_by_catalog_id(&self, catalog_id: i64) -> Option<PredicateId> {
        self.predicates
            .iter()
            .position(|predicate| predicate.catalog_id == Some(catalog_id))
            .map(PredicateId)
    }

    /// Panics if `id` was not handed out by this registry.
    pub fn predicate(&self, id: PredicateId) -> &Predicate {
        &self.predicates[id.0]
    }

    pub fn predicates(&self) -> impl Iterator<Item = (PredicateId, &Predicate)> {
        self.predicates
            .iter()
            .enumerate()
            .map(|(i, predicate)| (PredicateId(i), predicate))
    }

    /// The predicate stored in `table`. SQLite table names are
    /// case-insensitive.
    pub fn table_owner(&self, table: &str) -> Option<&Predicate> {
        self.predicates.iter().find(|predicate| {
            predicate
                .table_name()
                .map_or(false, |owned| owned.eq_ignore_ascii_case(table))
        })
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub(crate) fn insert(&mut self, predicate: Predicate) -> PredicateId {
        let id = PredicateId(self.predicates.len());
        self.predicates.push(predicate);
        id
    }

    pub(crate) fn push_link(&mut self, link: Link) {
        if !self.links.iter().any(|known| known.catalog_id == link.catalog_id) {
            self.links.push(link);
        }
    }

    /// Declares a predicate, creating its backing table when `table_name` is
    /// given. The catalog rows are written first and read back to build the
    /// in-memory predicate.
    ///
    /// Declaring a known predicate again with identical fields returns it
    /// unchanged.
    pub fn declare_predicate(
        &mut self,
        catalog: &Catalog,
        name: &str,
        table_name: Option<&str>,
        fields: &[(&str, &str)],
    ) -> Result<PredicateId> {
        check_fields(name, fields)?;
        let arity = fields.len();

        if let Some(id) = self.find(name, arity) {
            let predicate = self.predicate(id);
            return if predicate.same_fields(fields) && predicate.table_name() == table_name {
                Ok(id)
            } else {
                Err(Error::Conflict {
                    name: name.to_owned(),
                    arity,
                })
            };
        }

        if let Some(table_name) = table_name {
            if let Some(owner) = self.table_owner(table_name) {
                return Err(Error::TableInUse {
                    name: name.to_owned(),
                    arity,
                    table: table_name.to_owned(),
                    owner: owner.to_string(),
                });
            }
        }
        let (catalog_id, fields) = catalog.insert_predicate(name, table_name, fields)?;

        tracing::info!(predicate = name, arity, table = ?table_name, "declared predicate");
        Ok(self.insert(Predicate::new(
            Some(catalog_id),
            name,
            table_name.map(str::to_owned),
            fields,
        )))
    }

    /// Adds a predicate served by a host hook. It has no table and no
    /// catalog rows.
    pub fn register_hook(
        &mut self,
        name: &str,
        fields: &[&str],
        hook: Rc<dyn PredicateHook>,
    ) -> Result<PredicateId> {
        let typed: Vec<(&str, &str)> = fields.iter().map(|field| (*field, "")).collect();
        check_fields(name, &typed)?;
        if self.find(name, fields.len()).is_some() {
            return Err(Error::Conflict {
                name: name.to_owned(),
                arity: fields.len(),
            });
        }

        let fields = fields
            .iter()
            .enumerate()
            .map(|(position, field)| Field {
                catalog_id: None,
                position,
                name: (*field).to_owned(),
                field_type: String::new(),
            })
            .collect();
        let mut predicate = Predicate::new(None, name, None, fields);
        predicate.hook = Some(hook);
        Ok(self.insert(predicate))
    }

    /// Checks that `rule` can be attached to `head` without changing
    /// anything.
    pub fn validate_rule(&self, head: PredicateId, rule: &Rule) -> Result<()> {
        let predicate = self.predicate(head);
        if rule.arguments.len() != predicate.arity() {
            return Err(Error::ArityMismatch {
                name: predicate.name.clone(),
                arity: predicate.arity(),
                got: rule.arguments.len(),
            });
        }
        for goal in &rule.goals {
            let target = self.predicate(goal.predicate);
            if goal.terms.len() != target.arity() {
                return Err(Error::ArityMismatch {
                    name: target.name.clone(),
                    arity: target.arity(),
                    got: goal.terms.len(),
                });
            }
        }
        compiler::compile_rule(self, head, rule).map(|_| ())
    }

    /// Attaches `rule` to `head` in memory. Durability is up to the caller.
    pub fn declare_rule(&mut self, head: PredicateId, rule: Rule) -> Result<()> {
        self.validate_rule(head, &rule)?;
        let predicate = &mut self.predicates[head.0];
        tracing::info!(
            predicate = %predicate,
            goals = rule.goals.len(),
            "declared rule"
        );
        predicate.rules.push(rule);
        Ok(())
    }

    /// Attaches a rule read back from the catalog, checking only arities.
    pub(crate) fn attach_rule(&mut self, head: PredicateId, rule: Rule) -> Result<()> {
        let predicate = self.predicate(head);
        if rule.arguments.len() != predicate.arity()
            || rule
                .goals
                .iter()
                .any(|goal| goal.terms.len() != self.predicate(goal.predicate).arity())
        {
            return Err(Error::Catalog(format!(
                "rule {:?} of {} does not match the arity of its predicates",
                rule.catalog_id, predicate
            )));
        }
        self.predicates[head.0].rules.push(rule);
        Ok(())
    }
}

fn check_fields(name: &str, fields: &[(&str, &str)]) -> Result<()> {
    if fields.is_empty() {
        return Err(Error::EmptyPredicate {
            name: name.to_owned(),
        });
    }
    // SQLite column names are case-insensitive.
    let mut seen = HashSet::new();
    for (field, _) in fields {
        if !seen.insert(field.to_lowercase()) {
            return Err(Error::DuplicateField {
                name: name.to_owned(),
                field: (*field).to_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn catalog() -> (Catalog, Registry) {
        let catalog = Catalog::new(Store::open_in_memory().unwrap());
        let registry = catalog.bootstrap().unwrap();
        (catalog, registry)
    }

    #[test]
    fn declare_and_resolve() {
        let (catalog, mut registry) = catalog();
        let id = registry
            .declare_predicate(&catalog, "parent", Some("parent"), &[("p", "TEXT"), ("c", "TEXT")])
            .unwrap();

        assert_eq!(registry.resolve("parent", 2).unwrap(), id);
        let predicate = registry.predicate(id);
        assert_eq!(predicate.arity(), 2);
        assert_eq!(predicate.table_name(), Some("parent"));
        assert!(predicate.catalog_id().is_some());
        assert!(predicate.fields().iter().all(|field| field.catalog_id().is_some()));
        assert_eq!(
            predicate
                .fields()
                .iter()
                .map(|field| (field.position(), field.name()))
                .collect::<Vec<_>>(),
            vec![(0, "p"), (1, "c")]
        );
    }

    #[test]
    fn subgoal_variables_are_unique_in_order() {
        let goal = Subgoal::new(
            PredicateId(0),
            vec![
                Term::variable("Y"),
                Term::constant("a"),
                Term::variable("X"),
                Term::variable("Y"),
            ],
        );
        assert_eq!(goal.variables(), vec!["Y", "X"]);
    }

    #[test]
    fn unknown_predicate_is_reported() {
        let (_, registry) = catalog();
        assert!(matches!(
            registry.resolve("parent", 2),
            Err(Error::UnknownPredicate { name, arity: 2 }) if name == "parent"
        ));
    }

    #[test]
    fn redeclaring_is_idempotent_but_conflicts_are_errors() {
        let (catalog, mut registry) = catalog();
        let fields = [("k", "TEXT"), ("v", "TEXT")];
        let first = registry
            .declare_predicate(&catalog, "kv", Some("kv"), &fields)
            .unwrap();
        let again = registry
            .declare_predicate(&catalog, "kv", Some("kv"), &fields)
            .unwrap();
        assert_eq!(first, again);

        let err = registry
            .declare_predicate(&catalog, "kv", Some("kv"), &[("k", "TEXT"), ("w", "TEXT")])
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { arity: 2, .. }));

        // Same name, different arity is a different predicate.
        registry
            .declare_predicate(&catalog, "kv", None, &[("k", "TEXT")])
            .unwrap();
        assert_eq!(registry.predicates().filter(|(_, p)| p.name() == "kv").count(), 2);
    }

    #[test]
    fn field_lists_are_checked() {
        let (catalog, mut registry) = catalog();
        assert!(matches!(
            registry.declare_predicate(&catalog, "nothing", None, &[]),
            Err(Error::EmptyPredicate { .. })
        ));
        assert!(matches!(
            registry.declare_predicate(&catalog, "twice", None, &[("a", "TEXT"), ("A", "TEXT")]),
            Err(Error::DuplicateField { field, .. }) if field == "A"
        ));
    }

    #[test]
    fn rules_need_goals_and_matching_arity() {
        let (catalog, mut registry) = catalog();
        let edge = registry
            .declare_predicate(&catalog, "edge", Some("edge"), &[("a", "TEXT"), ("b", "TEXT")])
            .unwrap();
        let reach = registry
            .declare_predicate(&catalog, "reach", None, &[("a", "TEXT"), ("b", "TEXT")])
            .unwrap();

        let empty = Rule::new(vec![Term::variable("X"), Term::variable("Y")], vec![]);
        assert!(matches!(
            registry.declare_rule(reach, empty),
            Err(Error::Compilation { .. })
        ));

        let short_head = Rule::new(
            vec![Term::variable("X")],
            vec![Subgoal::new(edge, vec![Term::variable("X"), Term::variable("Y")])],
        );
        assert!(matches!(
            registry.declare_rule(reach, short_head),
            Err(Error::ArityMismatch { arity: 2, got: 1, .. })
        ));

        let short_goal = Rule::new(
            vec![Term::variable("X"), Term::variable("X")],
            vec![Subgoal::new(edge, vec![Term::variable("X")])],
        );
        assert!(matches!(
            registry.declare_rule(reach, short_goal),
            Err(Error::ArityMismatch { arity: 2, got: 1, .. })
        ));
        assert!(registry.predicate(reach).rules().is_empty());

        let ok = Rule::new(
            vec![Term::variable("X"), Term::variable("Y")],
            vec![Subgoal::new(edge, vec![Term::variable("X"), Term::variable("Y")])],
        );
        registry.declare_rule(reach, ok).unwrap();
        assert_eq!(registry.predicate(reach).rules().len(), 1);
    }
}
