use std::collections::{hash_map, HashMap};

use itertools::Itertools;

use crate::{
    ast::{quote_identifier, quote_literal, ColumnName, Identifier, Term},
    registry::{Predicate, PredicateId, Registry, Rule},
    Error, Result,
};

const SOURCE_ALIAS: &str = "S";

/// SQL for one goal, with the names of its result columns (the goal's
/// variables, in order of first appearance).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledQuery {
    pub sql: String,
    pub columns: Vec<ColumnName>,
}

/// Compiles an invocation of `predicate` with `terms` into a query over the
/// union of the predicate's table and rules.
pub fn compile_goal(
    registry: &Registry,
    predicate: PredicateId,
    terms: &[Term],
) -> Result<CompiledQuery> {
    let query = QueryBuilder::default().compile_goal(registry, predicate, terms)?;
    Ok(CompiledQuery {
        sql: query.to_sql(),
        columns: query.columns(),
    })
}

/// Compiles the body of `rule` into a query whose columns are the fields of
/// `head`.
pub fn compile_rule(registry: &Registry, head: PredicateId, rule: &Rule) -> Result<String> {
    let query = QueryBuilder::default().compile_rule(registry, head, rule)?;
    Ok(query.to_sql())
}

fn goal_alias(index: usize) -> String {
    format!("Q{}", index)
}

#[derive(Clone, Debug)]
struct ColumnProjection {
    src: ColumnName,
    dst: ColumnName,
}

#[derive(Clone, Debug)]
enum Value {
    Column { source: String, column: ColumnName },
    Literal(String),
}

impl Value {
    fn column(source: impl Into<String>, column: &str) -> Self {
        Value::Column {
            source: source.into(),
            column: column.to_owned(),
        }
    }

    fn to_sql(&self) -> String {
        match self {
            Value::Column { source, column } => {
                format!("{}.{}", quote_identifier(source), quote_identifier(column))
            }
            Value::Literal(s) => quote_literal(s),
        }
    }
}

#[derive(Clone, Debug)]
struct Condition {
    lhs: Value,
    rhs: Value,
}

impl Condition {
    fn to_sql(&self) -> String {
        format!("{} = {}", self.lhs.to_sql(), self.rhs.to_sql())
    }
}

#[derive(Clone, Debug)]
enum Source {
    Table(Identifier),
    Rule(RuleQuery),
}

impl Source {
    fn to_sql(&self, columns: &[ColumnName]) -> String {
        match self {
            Source::Table(table) => format!(
                "SELECT {} FROM {}",
                columns.iter().map(|column| quote_identifier(column)).join(", "),
                quote_identifier(table)
            ),
            Source::Rule(rule) => rule.to_sql(),
        }
    }
}

/// Everything that defines a predicate, with the predicate's field names as
/// columns.
#[derive(Clone, Debug)]
struct SourceUnion {
    columns: Vec<ColumnName>,
    sources: Vec<Source>,
}

impl SourceUnion {
    fn to_sql(&self) -> String {
        if self.sources.is_empty() {
            return format!(
                "SELECT {} WHERE 0",
                self.columns
                    .iter()
                    .map(|column| format!("NULL AS {}", quote_identifier(column)))
                    .join(", ")
            );
        }

        self.sources
            .iter()
            .map(|source| source.to_sql(&self.columns))
            .join("\nUNION ALL\n")
    }
}

#[derive(Clone, Debug)]
struct GoalQuery {
    projection: Vec<ColumnProjection>,
    sources: SourceUnion,
    selection: Vec<Condition>,
}

impl GoalQuery {
    fn columns(&self) -> Vec<ColumnName> {
        self.projection
            .iter()
            .map(|column| column.dst.clone())
            .collect()
    }

    fn to_sql(&self) -> String {
        let mut s = String::new();
        s.push_str("SELECT ");
        if self.projection.is_empty() {
            s.push('1');
        } else {
            s.push_str(
                &self
                    .projection
                    .iter()
                    .map(|column| {
                        format!(
                            "{} AS {}",
                            Value::column(SOURCE_ALIAS, &column.src).to_sql(),
                            quote_identifier(&column.dst)
                        )
                    })
                    .join(", "),
            );
        }

        s.push_str("\nFROM (\n");
        s.push_str(&self.sources.to_sql());
        s.push_str("\n) AS ");
        s.push_str(&quote_identifier(SOURCE_ALIAS));

        if !self.selection.is_empty() {
            s.push_str("\nWHERE ");
            s.push_str(
                &self
                    .selection
                    .iter()
                    .map(Condition::to_sql)
                    .join("\n  AND "),
            );
        }

        s
    }
}

/// A rule body as a chain of joined goals, projected onto the head fields.
#[derive(Clone, Debug)]
struct RuleQuery {
    head: Vec<(Value, ColumnName)>,
    goals: Vec<GoalQuery>,
    // joins[i] holds the variables goal i + 1 shares with goal i.
    joins: Vec<Vec<ColumnName>>,
}

impl RuleQuery {
    fn to_sql(&self) -> String {
        let mut s = String::new();
        s.push_str("SELECT ");
        s.push_str(
            &self
                .head
                .iter()
                .map(|(value, field)| format!("{} AS {}", value.to_sql(), quote_identifier(field)))
                .join(", "),
        );

        for (index, goal) in self.goals.iter().enumerate() {
            let alias = quote_identifier(&goal_alias(index));
            if index == 0 {
                s.push_str("\nFROM (\n");
            } else if self.joins[index - 1].is_empty() {
                s.push_str("\nCROSS JOIN (\n");
            } else {
                s.push_str("\nJOIN (\n");
            }
            s.push_str(&goal.to_sql());
            s.push_str("\n) AS ");
            s.push_str(&alias);

            if index > 0 && !self.joins[index - 1].is_empty() {
                s.push_str(" ON ");
                s.push_str(
                    &self.joins[index - 1]
                        .iter()
                        .map(|variable| {
                            Condition {
                                lhs: Value::column(goal_alias(index - 1), variable),
                                rhs: Value::column(goal_alias(index), variable),
                            }
                            .to_sql()
                        })
                        .join(" AND "),
                );
            }
        }

        s
    }
}

#[derive(Clone, Debug, Default)]
struct QueryBuilder {
    // Predicates whose definitions are being compiled.
    stack: Vec<PredicateId>,
}

impl QueryBuilder {
    fn compile_goal(
        &mut self,
        registry: &Registry,
        id: PredicateId,
        terms: &[Term],
    ) -> Result<GoalQuery> {
        let predicate = registry.predicate(id);
        if terms.len() != predicate.arity() {
            return Err(Error::ArityMismatch {
                name: predicate.name().to_owned(),
                arity: predicate.arity(),
                got: terms.len(),
            });
        }
        if predicate.hook().is_some() {
            return Err(Error::compilation(
                predicate.name(),
                predicate.arity(),
                "predicate is served by a host hook and has no SQL form",
            ));
        }

        let mut first_column: HashMap<&str, &ColumnName> = HashMap::new();
        let mut projection = vec![];
        let mut selection = vec![];

        for (field, term) in predicate.fields().iter().zip(terms) {
            match term {
                Term::Variable(name) => {
                    if name.is_empty() {
                        return Err(Error::compilation(
                            predicate.name(),
                            predicate.arity(),
                            format!("empty variable at position {}", field.position()),
                        ));
                    }

                    match first_column.entry(name.as_str()) {
                        hash_map::Entry::Vacant(vacant) => {
                            vacant.insert(&field.name);
                            projection.push(ColumnProjection {
                                src: field.name.clone(),
                                dst: name.clone(),
                            });
                        }

                        hash_map::Entry::Occupied(occupied) => {
                            // A repeated variable means the two columns must
                            // be equal.
                            selection.push(Condition {
                                lhs: Value::column(SOURCE_ALIAS, occupied.get()),
                                rhs: Value::column(SOURCE_ALIAS, &field.name),
                            });
                        }
                    }
                }

                Term::Constant(value) => selection.push(Condition {
                    lhs: Value::column(SOURCE_ALIAS, &field.name),
                    rhs: Value::Literal(value.clone()),
                }),
            }
        }

        let sources = self.compile_sources(registry, id)?;

        Ok(GoalQuery {
            projection,
            sources,
            selection,
        })
    }

    fn compile_sources(&mut self, registry: &Registry, id: PredicateId) -> Result<SourceUnion> {
        let predicate = registry.predicate(id);
        if self.stack.contains(&id) {
            return Err(recursion_error(predicate));
        }

        self.stack.push(id);
        let rules = predicate
            .rules()
            .iter()
            .map(|rule| self.compile_rule(registry, id, rule).map(Source::Rule))
            .collect::<Result<Vec<_>>>();
        self.stack.pop();

        let mut sources: Vec<Source> = predicate
            .table_name()
            .map(|table| Source::Table(table.to_owned()))
            .into_iter()
            .collect();
        sources.extend(rules?);

        Ok(SourceUnion {
            columns: predicate
                .fields()
                .iter()
                .map(|field| field.name.clone())
                .collect(),
            sources,
        })
    }

    fn compile_rule(&mut self, registry: &Registry, head: PredicateId, rule: &Rule) -> Result<RuleQuery> {
        let predicate = registry.predicate(head);
        if rule.goals().is_empty() {
            return Err(Error::compilation(
                predicate.name(),
                predicate.arity(),
                "rule has no goals",
            ));
        }
        if predicate.hook().is_some() {
            return Err(Error::compilation(
                predicate.name(),
                predicate.arity(),
                "rules cannot extend a predicate served by a host hook",
            ));
        }
        if rule.arguments().len() != predicate.arity() {
            return Err(Error::ArityMismatch {
                name: predicate.name().to_owned(),
                arity: predicate.arity(),
                got: rule.arguments().len(),
            });
        }

        self.stack.push(head);
        let goals = rule
            .goals()
            .iter()
            .map(|goal| self.compile_goal(registry, goal.predicate(), goal.terms()))
            .collect::<Result<Vec<_>>>();
        self.stack.pop();
        let goals = goals?;

        // Only adjacent goals are joined: a variable shared by goals i and
        // i + 2 but absent from i + 1 is not equated.
        let joins: Vec<Vec<ColumnName>> = rule
            .goals()
            .iter()
            .tuple_windows()
            .map(|(previous, next)| {
                let previous = previous.variables();
                next.variables()
                    .into_iter()
                    .filter(|variable| previous.contains(variable))
                    .map(str::to_owned)
                    .collect()
            })
            .collect();

        for (index, shared) in joins.iter().enumerate() {
            if shared.is_empty() {
                tracing::warn!(
                    predicate = %predicate,
                    goal = index + 1,
                    "goal shares no variables with the previous goal, joining as a cross product"
                );
            }
        }

        let head = predicate
            .fields()
            .iter()
            .zip(rule.arguments())
            .map(|(field, argument)| {
                let value = match argument {
                    Term::Variable(name) => {
                        let index = rule
                            .goals()
                            .iter()
                            .position(|goal| {
                                goal.terms().iter().any(|term| term.variable_name() == Some(name.as_str()))
                            })
                            .ok_or_else(|| {
                                Error::compilation(
                                    predicate.name(),
                                    predicate.arity(),
                                    format!("head variable {} is not bound by any goal", name),
                                )
                            })?;
                        Value::column(goal_alias(index), name)
                    }
                    Term::Constant(value) => Value::Literal(value.clone()),
                };
                Ok((value, field.name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RuleQuery { head, goals, joins })
    }
}

fn recursion_error(predicate: &Predicate) -> Error {
    Error::compilation(
        predicate.name(),
        predicate.arity(),
        "recursive definitions are not supported",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Field, Predicate, Subgoal};

    fn predicate(registry: &mut Registry, name: &str, table: Option<&str>, fields: &[&str]) -> PredicateId {
        let fields = fields
            .iter()
            .enumerate()
            .map(|(position, name)| Field {
                catalog_id: None,
                position,
                name: (*name).to_owned(),
                field_type: "TEXT".to_owned(),
            })
            .collect();
        registry.insert(Predicate::new(None, name, table.map(str::to_owned), fields))
    }

    fn var(name: &str) -> Term {
        Term::variable(name)
    }

    fn constant(value: &str) -> Term {
        Term::constant(value)
    }

    #[test]
    fn projects_variables_and_filters_constants() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", Some("p"), &["k", "v"]);

        let query = compile_goal(&registry, p, &[constant("a"), var("X")]).unwrap();
        assert_eq!(query.columns, vec!["X"]);
        assert_eq!(
            query.sql,
            "SELECT \"S\".\"v\" AS \"X\"\n\
             FROM (\n\
             SELECT \"k\", \"v\" FROM \"p\"\n\
             ) AS \"S\"\n\
             WHERE \"S\".\"k\" = 'a'"
        );
    }

    #[test]
    fn no_constants_means_no_where_clause() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", Some("p"), &["k", "v"]);

        let query = compile_goal(&registry, p, &[var("K"), var("V")]).unwrap();
        assert_eq!(query.columns, vec!["K", "V"]);
        assert!(!query.sql.contains("WHERE"));
    }

    #[test]
    fn ground_goals_project_a_constant() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", Some("p"), &["k", "v"]);

        let query = compile_goal(&registry, p, &[constant("a"), constant("b")]).unwrap();
        assert!(query.columns.is_empty());
        assert!(query.sql.starts_with("SELECT 1\n"));
        assert!(query.sql.contains("\"S\".\"k\" = 'a'\n  AND \"S\".\"v\" = 'b'"));
    }

    #[test]
    fn repeated_variables_are_equated() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", Some("p"), &["k", "v"]);

        let query = compile_goal(&registry, p, &[var("X"), var("X")]).unwrap();
        assert_eq!(query.columns, vec!["X"]);
        assert!(query.sql.contains("WHERE \"S\".\"k\" = \"S\".\"v\""));
    }

    #[test]
    fn constants_are_escaped() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", Some("p"), &["k"]);

        let query = compile_goal(&registry, p, &[constant("o'brien")]).unwrap();
        assert!(query.sql.contains("'o''brien'"));
    }

    #[test]
    fn undefined_predicates_compile_to_an_empty_source() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", None, &["k", "v"]);

        let query = compile_goal(&registry, p, &[var("K"), var("V")]).unwrap();
        assert!(query
            .sql
            .contains("SELECT NULL AS \"k\", NULL AS \"v\" WHERE 0"));
    }

    #[test]
    fn arity_is_checked() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", Some("p"), &["k", "v"]);

        let err = compile_goal(&registry, p, &[var("X")]).unwrap_err();
        assert!(matches!(err, Error::ArityMismatch { arity: 2, got: 1, .. }));
    }

    #[test]
    fn empty_variables_are_rejected() {
        let mut registry = Registry::default();
        let p = predicate(&mut registry, "p", Some("p"), &["k"]);

        let err = compile_goal(&registry, p, &[var("")]).unwrap_err();
        assert!(matches!(err, Error::Compilation { .. }));
    }

    #[test]
    fn table_and_rules_are_unioned() {
        let mut registry = Registry::default();
        let base = predicate(&mut registry, "base", Some("base"), &["x"]);
        let p = predicate(&mut registry, "p", Some("p"), &["x"]);
        registry
            .declare_rule(p, Rule::new(vec![var("X")], vec![Subgoal::new(base, vec![var("X")])]))
            .unwrap();

        let query = compile_goal(&registry, p, &[var("Y")]).unwrap();
        assert!(query.sql.contains("SELECT \"x\" FROM \"p\"\nUNION ALL\nSELECT \"Q0\".\"X\" AS \"x\""));
    }

    #[test]
    fn adjacent_goals_join_on_shared_variables() {
        let mut registry = Registry::default();
        let parent = predicate(&mut registry, "parent", Some("parent"), &["p", "c"]);
        let grandparent = predicate(&mut registry, "grandparent", None, &["g", "c"]);
        let rule = Rule::new(
            vec![var("G"), var("C")],
            vec![
                Subgoal::new(parent, vec![var("G"), var("M")]),
                Subgoal::new(parent, vec![var("M"), var("C")]),
            ],
        );

        let sql = compile_rule(&registry, grandparent, &rule).unwrap();
        assert!(sql.starts_with("SELECT \"Q0\".\"G\" AS \"g\", \"Q1\".\"C\" AS \"c\"\nFROM (\n"));
        assert!(sql.ends_with(") AS \"Q1\" ON \"Q0\".\"M\" = \"Q1\".\"M\""));
    }

    #[test]
    fn only_the_previous_goal_is_joined() {
        let mut registry = Registry::default();
        let a = predicate(&mut registry, "a", Some("a"), &["x", "y"]);
        let b = predicate(&mut registry, "b", Some("b"), &["y", "z"]);
        let c = predicate(&mut registry, "c", Some("c"), &["z", "x"]);
        let head = predicate(&mut registry, "h", None, &["x", "z"]);
        let rule = Rule::new(
            vec![var("X"), var("Z")],
            vec![
                Subgoal::new(a, vec![var("X"), var("Y")]),
                Subgoal::new(b, vec![var("Y"), var("Z")]),
                Subgoal::new(c, vec![var("Z"), var("X")]),
            ],
        );

        let sql = compile_rule(&registry, head, &rule).unwrap();
        assert!(sql.contains("ON \"Q0\".\"Y\" = \"Q1\".\"Y\""));
        assert!(sql.contains("ON \"Q1\".\"Z\" = \"Q2\".\"Z\""));
        assert!(!sql.contains("\"Q0\".\"X\" = \"Q2\".\"X\""));
    }

    #[test]
    fn unrelated_goals_cross_join() {
        let mut registry = Registry::default();
        let a = predicate(&mut registry, "a", Some("a"), &["x"]);
        let b = predicate(&mut registry, "b", Some("b"), &["y"]);
        let head = predicate(&mut registry, "h", None, &["x", "y"]);
        let rule = Rule::new(
            vec![var("X"), var("Y")],
            vec![
                Subgoal::new(a, vec![var("X")]),
                Subgoal::new(b, vec![var("Y")]),
            ],
        );

        let sql = compile_rule(&registry, head, &rule).unwrap();
        assert!(sql.contains("\nCROSS JOIN (\n"));
        assert!(!sql.contains(" ON "));
    }

    #[test]
    fn constant_head_arguments_are_literals() {
        let mut registry = Registry::default();
        let a = predicate(&mut registry, "a", Some("a"), &["x"]);
        let head = predicate(&mut registry, "h", None, &["kind", "x"]);
        let rule = Rule::new(
            vec![constant("from_a"), var("X")],
            vec![Subgoal::new(a, vec![var("X")])],
        );

        let sql = compile_rule(&registry, head, &rule).unwrap();
        assert!(sql.starts_with("SELECT 'from_a' AS \"kind\", \"Q0\".\"X\" AS \"x\""));
    }

    #[test]
    fn rules_without_goals_do_not_compile() {
        let mut registry = Registry::default();
        let head = predicate(&mut registry, "h", None, &["x"]);

        let err = compile_rule(&registry, head, &Rule::new(vec![var("X")], vec![])).unwrap_err();
        assert!(matches!(err, Error::Compilation { reason, .. } if reason == "rule has no goals"));
    }

    #[test]
    fn unbound_head_variables_do_not_compile() {
        let mut registry = Registry::default();
        let a = predicate(&mut registry, "a", Some("a"), &["x"]);
        let head = predicate(&mut registry, "h", None, &["x"]);
        let rule = Rule::new(vec![var("Y")], vec![Subgoal::new(a, vec![var("X")])]);

        let err = compile_rule(&registry, head, &rule).unwrap_err();
        assert!(matches!(err, Error::Compilation { reason, .. } if reason.contains("Y")));
    }

    #[test]
    fn recursive_rules_are_rejected() {
        let mut registry = Registry::default();
        let edge = predicate(&mut registry, "edge", Some("edge"), &["a", "b"]);
        let path = predicate(&mut registry, "path", None, &["a", "b"]);
        registry
            .declare_rule(
                path,
                Rule::new(
                    vec![var("X"), var("Y")],
                    vec![Subgoal::new(edge, vec![var("X"), var("Y")])],
                ),
            )
            .unwrap();

        let recursive = Rule::new(
            vec![var("X"), var("Z")],
            vec![
                Subgoal::new(path, vec![var("X"), var("Y")]),
                Subgoal::new(edge, vec![var("Y"), var("Z")]),
            ],
        );
        let err = registry.declare_rule(path, recursive).unwrap_err();
        assert!(matches!(err, Error::Compilation { reason, .. } if reason.contains("recursive")));
        assert_eq!(registry.predicate(path).rules().len(), 1);
    }
}
