use std::fmt;

use itertools::Itertools;
use num_bigint::BigInt;

use crate::error::{Error, Result};

pub type Identifier = String;
pub type PredicateName = Identifier;
pub type ColumnName = Identifier;

/// A value read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Integer(BigInt),
    Real(f64),
    String(String),
    Blob(Vec<u8>),
}

impl Literal {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Integer(n) => i64::try_from(n).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Literal::Null)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("null"),
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::Real(x) => write!(f, "{}", x),
            Literal::String(s) => f.write_str(s),
            Literal::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_owned())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Literal::String(s)
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Integer(n.into())
    }
}

impl From<usize> for Literal {
    fn from(n: usize) -> Self {
        Literal::Integer(n.into())
    }
}

/// An argument of a predicate invocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Term {
    Variable(Identifier),
    Constant(String),
}

/// Classifies a bare word: it is a variable iff it has no lowercase letters.
///
/// Words without any letters (`"42"`, `"-"`, `""`) are therefore variables.
/// Use [`Term::constant`] to force a constant.
pub fn classify(text: &str) -> Term {
    if text.to_uppercase() == text {
        Term::Variable(text.to_owned())
    } else {
        Term::Constant(text.to_owned())
    }
}

impl Term {
    pub fn variable(name: impl Into<String>) -> Self {
        Term::Variable(name.into())
    }

    pub fn constant(value: impl Into<String>) -> Self {
        Term::Constant(value.into())
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Term::Variable(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Term::Constant(_))
    }

    pub fn variable_name(&self) -> Option<&str> {
        match self {
            Term::Variable(name) => Some(name),
            Term::Constant(_) => None,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Term::Variable(text) | Term::Constant(text) => text,
        }
    }

    /// Renders the term for use in generated SQL: constants become quoted
    /// literals, variables become column aliases.
    pub fn to_sql(&self) -> String {
        match self {
            Term::Variable(name) => quote_identifier(name),
            Term::Constant(value) => quote_literal(value),
        }
    }
}

/// Constants print bare only when they would read back as the same
/// constant; otherwise they are double-quoted with `"` doubled inside.
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Variable(name) => f.write_str(name),
            Term::Constant(value) if is_word(value) && classify(value).is_constant() => {
                f.write_str(value)
            }
            Term::Constant(value) => write!(f, "\"{}\"", value.replace('"', "\"\"")),
        }
    }
}

fn is_word(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One predicate invocation, by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Goal {
    pub predicate: PredicateName,
    pub terms: Vec<Term>,
}

impl Goal {
    pub fn new(predicate: impl Into<String>, terms: Vec<Term>) -> Self {
        Self {
            predicate: predicate.into(),
            terms,
        }
    }

    /// Builds a goal from a term list: the predicate name followed by its
    /// arguments, each classified with [`classify`].
    pub fn from_words<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        let (name, args) = words.split_first().ok_or(Error::EmptyTermList)?;
        Ok(Self::new(
            name.as_ref(),
            args.iter().map(|arg| classify(arg.as_ref())).collect(),
        ))
    }

    pub fn arity(&self) -> usize {
        self.terms.len()
    }

    pub fn is_ground(&self) -> bool {
        self.terms.iter().all(Term::is_constant)
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(Term::variable_name).unique()
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.predicate, self.terms.iter().join(", "))
    }
}

/// `head :- body₀, body₁, ...`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleDefinition {
    pub head: Goal,
    pub body: Vec<Goal>,
}

impl RuleDefinition {
    pub fn new(head: Goal, body: Vec<Goal>) -> Self {
        Self { head, body }
    }
}

impl fmt::Display for RuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :- {}", self.head, self.body.iter().join(", "))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Statement {
    Fact(Goal),
    Rule(RuleDefinition),
}

impl Statement {
    pub fn from_words<S: AsRef<str>>(words: &[S]) -> Result<Self> {
        Goal::from_words(words).map(Statement::Fact)
    }

    pub fn rule(head: Goal, body: Vec<Goal>) -> Self {
        Statement::Rule(RuleDefinition::new(head, body))
    }
}

impl From<Goal> for Statement {
    fn from(goal: Goal) -> Self {
        Statement::Fact(goal)
    }
}

impl From<RuleDefinition> for Statement {
    fn from(rule: RuleDefinition) -> Self {
        Statement::Rule(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_words_are_constants() {
        for word in ["a", "alice", "bob", "zzz", "parent"] {
            assert_eq!(classify(word), Term::constant(word));
        }
    }

    #[test]
    fn uppercase_words_are_variables() {
        for word in ["X", "CHILD", "M", "ABC"] {
            assert_eq!(classify(word), Term::variable(word));
        }
    }

    #[test]
    fn mixed_case_words_are_constants() {
        assert_eq!(classify("Alice"), Term::constant("Alice"));
        assert_eq!(classify("xY"), Term::constant("xY"));
    }

    #[test]
    fn words_without_letters_are_variables() {
        assert_eq!(classify("42"), Term::variable("42"));
        assert_eq!(classify("-"), Term::variable("-"));
        assert_eq!(classify(""), Term::variable(""));
        assert_eq!(classify("X_1"), Term::variable("X_1"));
    }

    #[test]
    fn constants_render_as_quoted_literals() {
        assert_eq!(Term::constant("alice").to_sql(), "'alice'");
        assert_eq!(Term::constant("o'brien").to_sql(), "'o''brien'");
        assert_eq!(Term::variable("X").to_sql(), "\"X\"");
    }

    #[test]
    fn goal_from_words() {
        let goal = Goal::from_words(&["age", "alice", "X"]).unwrap();
        assert_eq!(goal.predicate, "age");
        assert_eq!(
            goal.terms,
            vec![Term::constant("alice"), Term::variable("X")]
        );
        assert!(!goal.is_ground());
        assert_eq!(goal.variables().collect::<Vec<_>>(), vec!["X"]);

        assert!(matches!(
            Goal::from_words::<&str>(&[]),
            Err(Error::EmptyTermList)
        ));
    }

    #[test]
    fn goal_display_quotes_constants_that_would_read_as_variables() {
        let goal = Goal::new("age", vec![Term::constant("alice"), Term::constant("30")]);
        assert_eq!(goal.to_string(), "age(alice, \"30\")");
    }

    #[test]
    fn constant_display_doubles_embedded_quotes() {
        assert_eq!(Term::constant("HI").to_string(), "\"HI\"");
        assert_eq!(Term::constant("say \"HI\"").to_string(), "\"say \"\"HI\"\"\"");
        assert_eq!(Term::constant("two words").to_string(), "\"two words\"");
        assert_eq!(Term::constant("o'brien").to_string(), "\"o'brien\"");
        assert_eq!(Term::constant("bob").to_string(), "bob");
    }
}
