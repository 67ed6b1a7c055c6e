use std::borrow::BorrowMut;

use pest::Parser as _;
use pest_derive::Parser;

use crate::{
    ast::{classify, Goal, Identifier, Statement, Term},
    Error, Result,
};

#[derive(Parser)]
#[grammar = "logic.pest"]
struct Parser;

type Pair<'a> = pest::iterators::Pair<'a, Rule>;
type Pairs<'a> = pest::iterators::Pairs<'a, Rule>;

/// Parses one fact, query or rule; the trailing `.` is optional.
pub fn parse_statement(code: &str) -> Result<Statement> {
    let mut pairs = Parser::parse(Rule::statement, code).map_err(parse_error)?;
    let statement = expect_next_rule(&mut pairs, Rule::statement);
    let clause = expect_next_rule(statement.into_inner(), Rule::clause);
    Ok(Statement::from(clause))
}

/// Parses a sequence of `.`-terminated statements.
pub fn parse_program(code: &str) -> Result<Vec<Statement>> {
    let pairs = Parser::parse(Rule::program, code).map_err(parse_error)?;
    let program = expect_next_rule(pairs, Rule::program);

    Ok(program
        .into_inner()
        .take_while(|pair| pair.as_rule() != Rule::EOI)
        .map(Statement::from)
        .collect())
}

fn parse_error(error: pest::error::Error<Rule>) -> Error {
    Error::Parse(error.to_string())
}

fn expect_next_rule<'a, P: BorrowMut<Pairs<'a>>>(mut pairs: P, rule: Rule) -> Pair<'a> {
    let pair = pairs.borrow_mut().next().expect("missing pair");
    assert_eq!(pair.as_rule(), rule);
    pair
}

fn convert_identifier(pair: Pair) -> Identifier {
    assert_eq!(pair.as_rule(), Rule::word);
    pair.as_str().to_string()
}

fn expect_identifier<'a, P: BorrowMut<Pairs<'a>>>(pairs: P) -> Identifier {
    convert_identifier(expect_next_rule(pairs, Rule::word))
}

impl From<Pair<'_>> for Term {
    fn from(pair: Pair<'_>) -> Self {
        assert_eq!(pair.as_rule(), Rule::term);
        let pair = pair.into_inner().next().unwrap();

        match pair.as_rule() {
            Rule::word => classify(pair.as_str()),

            // Numbers and quoted strings are constants whatever their case.
            Rule::number => Term::Constant(pair.as_str().to_string()),

            Rule::string_literal => {
                let interior = expect_next_rule(pair.into_inner(), Rule::string_interior);
                Term::Constant(interior.as_str().replace("\"\"", "\""))
            }

            _ => unreachable!(),
        }
    }
}

impl From<Pair<'_>> for Goal {
    fn from(pair: Pair<'_>) -> Self {
        assert_eq!(pair.as_rule(), Rule::goal);
        let mut pairs = pair.into_inner();
        let predicate = expect_identifier(&mut pairs);
        let terms = pairs.map(Term::from).collect();

        Self { predicate, terms }
    }
}

impl From<Pair<'_>> for Statement {
    fn from(pair: Pair<'_>) -> Self {
        assert_eq!(pair.as_rule(), Rule::clause);
        let mut pairs = pair.into_inner();
        let head = Goal::from(expect_next_rule(&mut pairs, Rule::goal));

        match pairs.next() {
            None => Statement::Fact(head),
            Some(body) => Statement::rule(head, body.into_inner().map(Goal::from).collect()),
        }
    }
}
