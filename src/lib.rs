//! A small deductive database: predicates, facts and rules compiled to SQL
//! over SQLite, with a catalog that describes itself.

pub mod ast;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod parser;
pub mod registry;
pub mod store;

pub use ast::{classify, Goal, Literal, RuleDefinition, Statement, Term};
pub use crate::config::Config;
pub use engine::{FieldRef, LogicDb, Outcome};
pub use error::{Error, Result};
pub use parser::{parse_program, parse_statement};
pub use registry::{PredicateHook, PredicateId, Registry};
pub use store::{Binding, Bindings, Store};
