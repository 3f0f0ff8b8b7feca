//! Structured query expressions.
//!
//! A [`QueryExpression`] is the intermediate representation the translator
//! works on: it knows about search clauses and boolean structure, but nothing
//! about how a particular index engine executes them. Backends either consume
//! it directly (see [`crate::memory::MemoryCore`]) or lower it with
//! [`crate::composed::ComposedQuery::try_convert_with`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// The term that matches every document.
pub const MATCH_ALL_TERM: &str = "*";

/// A single `index relation term` clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchClause {
    /// The field searched, or `None` for unqualified terms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    /// The relation (`=`, `==`, `exact`, `<`, ...), `None` for unqualified terms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,

    /// The searched value.
    pub term: String,
}

impl SearchClause {
    /// Creates an unqualified clause.
    pub fn term(term: impl Into<String>) -> Self {
        Self {
            index: None,
            relation: None,
            term: term.into(),
        }
    }

    /// Creates a qualified clause.
    pub fn new(
        index: impl Into<String>,
        relation: impl Into<String>,
        term: impl Into<String>,
    ) -> Self {
        Self {
            index: Some(index.into()),
            relation: Some(relation.into()),
            term: term.into(),
        }
    }
}

/// A boolean query expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryExpression {
    /// A leaf search clause.
    Term(SearchClause),
    /// All operands must match.
    And(Vec<QueryExpression>),
    /// Any operand must match.
    Or(Vec<QueryExpression>),
    /// The operand must not match.
    Not(Box<QueryExpression>),
}

impl QueryExpression {
    /// The universal match-all query (`*`).
    pub fn match_all() -> Self {
        QueryExpression::Term(SearchClause::term(MATCH_ALL_TERM))
    }

    /// An unqualified term.
    pub fn term(term: impl Into<String>) -> Self {
        QueryExpression::Term(SearchClause::term(term))
    }

    /// A `index = term` clause.
    pub fn field(index: impl Into<String>, term: impl Into<String>) -> Self {
        QueryExpression::Term(SearchClause::new(index, "=", term))
    }

    /// Returns true if this is exactly the match-all query.
    pub fn is_match_all(&self) -> bool {
        *self == Self::match_all()
    }

    /// Combines expressions with OR, flattening nested ORs.
    ///
    /// A single operand is returned unchanged; an empty list yields `None`.
    pub fn or_all(operands: impl IntoIterator<Item = QueryExpression>) -> Option<Self> {
        Self::combine(operands, true)
    }

    /// Combines expressions with AND, flattening nested ANDs.
    pub fn and_all(operands: impl IntoIterator<Item = QueryExpression>) -> Option<Self> {
        Self::combine(operands, false)
    }

    fn combine(operands: impl IntoIterator<Item = QueryExpression>, or: bool) -> Option<Self> {
        let mut flat = Vec::new();
        for operand in operands {
            match (operand, or) {
                (QueryExpression::Or(inner), true) | (QueryExpression::And(inner), false) => {
                    flat.extend(inner)
                }
                (other, _) => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ if or => Some(QueryExpression::Or(flat)),
            _ => Some(QueryExpression::And(flat)),
        }
    }

    /// Visits every search clause in the tree, depth first.
    pub fn clauses(&self) -> Vec<&SearchClause> {
        let mut out = Vec::new();
        self.collect_clauses(&mut out);
        out
    }

    fn collect_clauses<'a>(&'a self, out: &mut Vec<&'a SearchClause>) {
        match self {
            QueryExpression::Term(clause) => out.push(clause),
            QueryExpression::And(operands) | QueryExpression::Or(operands) => {
                for operand in operands {
                    operand.collect_clauses(out);
                }
            }
            QueryExpression::Not(inner) => inner.collect_clauses(out),
        }
    }

    /// Rewrites every clause index with `f`.
    pub fn map_indexes(self, f: &impl Fn(String) -> String) -> Self {
        match self {
            QueryExpression::Term(mut clause) => {
                clause.index = clause.index.map(f);
                QueryExpression::Term(clause)
            }
            QueryExpression::And(operands) => {
                QueryExpression::And(operands.into_iter().map(|o| o.map_indexes(f)).collect())
            }
            QueryExpression::Or(operands) => {
                QueryExpression::Or(operands.into_iter().map(|o| o.map_indexes(f)).collect())
            }
            QueryExpression::Not(inner) => QueryExpression::Not(Box::new(inner.map_indexes(f))),
        }
    }
}

fn write_term(f: &mut fmt::Formatter<'_>, term: &str) -> fmt::Result {
    let needs_quotes = term.is_empty()
        || term
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '"' | '=' | '<' | '>'));
    if needs_quotes {
        write!(f, "\"{}\"", term.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        f.write_str(term)
    }
}

impl fmt::Display for SearchClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(index) = &self.index {
            let relation = self.relation.as_deref().unwrap_or("=");
            if relation.chars().all(|c| c.is_alphabetic()) {
                write!(f, "{} {} ", index, relation)?;
            } else {
                write!(f, "{}{}", index, relation)?;
            }
        }
        write_term(f, &self.term)
    }
}

impl fmt::Display for QueryExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn operand(f: &mut fmt::Formatter<'_>, expr: &QueryExpression) -> fmt::Result {
            match expr {
                QueryExpression::Term(_) => write!(f, "{}", expr),
                _ => write!(f, "({})", expr),
            }
        }
        fn joined(f: &mut fmt::Formatter<'_>, operands: &[QueryExpression], op: &str) -> fmt::Result {
            for (i, expr) in operands.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", op)?;
                }
                operand(f, expr)?;
            }
            Ok(())
        }

        match self {
            QueryExpression::Term(clause) => write!(f, "{}", clause),
            QueryExpression::And(operands) => {
                // `a AND NOT b` renders as the CQL binary form `a NOT b`
                for (i, expr) in operands.iter().enumerate() {
                    match expr {
                        QueryExpression::Not(inner) if i > 0 => {
                            f.write_str(" NOT ")?;
                            operand(f, inner)?;
                        }
                        _ => {
                            if i > 0 {
                                f.write_str(" AND ")?;
                            }
                            operand(f, expr)?;
                        }
                    }
                }
                Ok(())
            }
            QueryExpression::Or(operands) => joined(f, operands, "OR"),
            QueryExpression::Not(inner) => {
                write!(f, "{} NOT ", MATCH_ALL_TERM)?;
                operand(f, inner)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_all() {
        assert!(QueryExpression::match_all().is_match_all());
        assert!(!QueryExpression::term("fiets").is_match_all());
        assert!(!QueryExpression::field("title", "*").is_match_all());
    }

    #[test]
    fn test_or_all_flattens() {
        let combined = QueryExpression::or_all(vec![
            QueryExpression::field("a", "1"),
            QueryExpression::Or(vec![
                QueryExpression::field("b", "2"),
                QueryExpression::field("c", "3"),
            ]),
        ])
        .unwrap();
        assert_eq!(
            combined,
            QueryExpression::Or(vec![
                QueryExpression::field("a", "1"),
                QueryExpression::field("b", "2"),
                QueryExpression::field("c", "3"),
            ])
        );
        assert_eq!(QueryExpression::or_all(vec![]), None);
        assert_eq!(
            QueryExpression::or_all(vec![QueryExpression::term("x")]),
            Some(QueryExpression::term("x"))
        );
    }

    #[test]
    fn test_display() {
        let expr = QueryExpression::And(vec![
            QueryExpression::field("title", "harry potter"),
            QueryExpression::Or(vec![
                QueryExpression::term("a"),
                QueryExpression::Term(SearchClause::new("genre", "exact", "fantasy")),
            ]),
            QueryExpression::Not(Box::new(QueryExpression::field("lang", "en"))),
        ]);
        assert_eq!(
            expr.to_string(),
            "title=\"harry potter\" AND (a OR genre exact fantasy) NOT lang=en"
        );
    }

    #[test]
    fn test_map_indexes() {
        let expr = QueryExpression::And(vec![
            QueryExpression::field("authors.country", "NL"),
            QueryExpression::term("x"),
        ]);
        let mapped = expr.map_indexes(&|index: String| index.trim_start_matches("authors.").to_string());
        assert_eq!(
            mapped.clauses()[0].index.as_deref(),
            Some("country")
        );
        assert_eq!(mapped.clauses()[1].index, None);
    }
}
