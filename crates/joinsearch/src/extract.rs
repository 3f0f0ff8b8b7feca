//! Extraction of filter clauses that belong to other cores.
//!
//! A caller writes one query in the results core's namespace, but may embed
//! clauses prefixed with another core's name (`authors.country=NL`). The
//! [`FilterExtractor`] moves those clauses out of the query and hands them back
//! as filters for the owning core, with the prefix removed.

use std::collections::{BTreeMap, BTreeSet};

use crate::expression::QueryExpression;

/// Filters per core, in extraction order.
pub type CoreFilters = BTreeMap<String, Vec<QueryExpression>>;

/// Splits a query into a results-core query and per-core filters.
#[derive(Debug, Clone)]
pub struct FilterExtractor {
    cores: BTreeSet<String>,
}

impl FilterExtractor {
    /// Creates an extractor recognizing the given core names as prefixes.
    pub fn new<I, S>(cores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cores: cores.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits `query`.
    ///
    /// Top-level AND operands (or a lone clause) whose clauses all carry the
    /// same `core.` prefix of a core other than `results_from` become filters
    /// of that core. Returns `None` as query when nothing else remains.
    pub fn convert(
        &self,
        query: QueryExpression,
        results_from: &str,
    ) -> (Option<QueryExpression>, CoreFilters) {
        let operands = match query {
            QueryExpression::And(operands) => operands,
            other => vec![other],
        };

        let mut remaining = Vec::new();
        let mut filters = CoreFilters::new();
        for operand in operands {
            match self.owning_core(&operand, results_from) {
                Some(core) => {
                    let prefix = format!("{}.", core);
                    let stripped = operand.map_indexes(&|index: String| {
                        index
                            .strip_prefix(prefix.as_str())
                            .map(str::to_string)
                            .unwrap_or(index)
                    });
                    filters.entry(core).or_default().push(stripped);
                }
                None => remaining.push(operand),
            }
        }

        (QueryExpression::and_all(remaining), filters)
    }

    /// Returns the single foreign core every clause of `expr` is prefixed with.
    fn owning_core(&self, expr: &QueryExpression, results_from: &str) -> Option<String> {
        let mut owner: Option<&str> = None;
        for clause in expr.clauses() {
            let (prefix, _) = clause.index.as_deref()?.split_once('.')?;
            if prefix == results_from || !self.cores.contains(prefix) {
                return None;
            }
            match owner {
                Some(existing) if existing != prefix => return None,
                _ => owner = Some(prefix),
            }
        }
        owner.map(str::to_string)
    }
}
