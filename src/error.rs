//! Error type for `logicdb`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("predicate {name}/{arity} not found")]
    UnknownPredicate { name: String, arity: usize },

    #[error("predicate {name}/{arity} takes {arity} arguments, got {got}")]
    ArityMismatch {
        name: String,
        arity: usize,
        got: usize,
    },

    /// Facts can only be inserted into predicates with a backing table.
    #[error("predicate {name}/{arity} has no backing table, facts cannot be inserted")]
    NotInsertable { name: String, arity: usize },

    #[error("cannot compile {name}/{arity}: {reason}")]
    Compilation {
        name: String,
        arity: usize,
        reason: String,
    },

    #[error("predicate {name}/{arity} is already declared with different fields")]
    Conflict { name: String, arity: usize },

    /// Each table backs at most one predicate.
    #[error("cannot declare {name}/{arity}: table {table:?} already stores {owner}")]
    TableInUse {
        name: String,
        arity: usize,
        table: String,
        owner: String,
    },

    #[error("predicate {name} must have at least one field")]
    EmptyPredicate { name: String },

    #[error("predicate {name} declares field {field:?} more than once")]
    DuplicateField { name: String, field: String },

    #[error("predicate {name}/{arity} has no field {field:?}")]
    UnknownField {
        name: String,
        arity: usize,
        field: String,
    },

    #[error("predicate {name}/{arity} is not stored in the catalog")]
    NotPersistent { name: String, arity: usize },

    #[error("rules for {name}/{arity} cannot be asserted through run, declare them directly")]
    RuleAssertionUnsupported { name: String, arity: usize },

    #[error("empty term list")]
    EmptyTermList,

    #[error("catalog is inconsistent: {0}")]
    Catalog(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("host hook failed: {0}")]
    Hook(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("invalid settings: {0}")]
    Settings(#[from] ::config::ConfigError),
}

impl Error {
    pub(crate) fn compilation(name: &str, arity: usize, reason: impl Into<String>) -> Self {
        Error::Compilation {
            name: name.to_owned(),
            arity,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
