//! In-memory core backend.
//!
//! [`MemoryCore`] keeps its documents in a vector behind a
//! [`parking_lot::RwLock`] and evaluates [`QueryExpression`]s directly. It
//! implements the full [`CoreBackend`] contract: filters, drilldowns, key
//! filters, key collection, rank boosts, sorting, paging, deduplication and
//! hierarchical facet counts.
//!
//! # Relations
//!
//! | Relation | Matches when |
//! |----------|--------------|
//! | `=`, unqualified | a value or one of its words equals the term, ignoring case |
//! | `==`, `exact` | a value equals the term exactly |
//! | `<>` | `=` does not match |
//! | `<`, `<=`, `>`, `>=` | a value compares accordingly, numerically when both parse |
//! | `any`, `all` | any/all words of the term match a word of a value |
//! | `adj` | a value contains the term as a phrase, ignoring case |
//!
//! The term `*` matches every document, or every document with the field
//! when qualified.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::error::BackendError;
use crate::expression::{MATCH_ALL_TERM, QueryExpression, SearchClause};
use crate::federator::CoreBackend;
use crate::types::{
    CoreResponse, CoreSearch, DrilldownQuery, FacetRequest, FacetResult, FacetSort, FacetTerm,
    Hit, KeySet, QueryOptions, SortKey,
};

/// Number of hits returned when no `stop` is given.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Score added to documents matching the rank query.
const RANK_BOOST: f32 = 1.0;

/// A document stored in a [`MemoryCore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    id: String,
    fields: BTreeMap<String, Vec<String>>,
    facets: BTreeMap<String, Vec<Vec<String>>>,
}

impl Document {
    /// Creates an empty document.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
            facets: BTreeMap::new(),
        }
    }

    /// Adds a field value; fields may hold several values.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Categorizes the document under a facet path.
    pub fn facet(mut self, name: impl Into<String>, path: &[&str]) -> Self {
        self.facets
            .entry(name.into())
            .or_default()
            .push(path.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Returns the document identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the values of a field.
    pub fn values(&self, name: &str) -> &[String] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    fn paths(&self, name: &str) -> &[Vec<String>] {
        self.facets.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    fn stored_fields(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|(name, values)| {
                let value = match values.as_slice() {
                    [single] => Value::String(single.clone()),
                    many => Value::Array(many.iter().cloned().map(Value::String).collect()),
                };
                (name.clone(), value)
            })
            .collect()
    }
}

/// A core held entirely in memory.
#[derive(Debug)]
pub struct MemoryCore {
    name: String,
    documents: RwLock<Vec<Document>>,
}

impl MemoryCore {
    /// Creates an empty core.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: RwLock::new(Vec::new()),
        }
    }

    /// Creates a core holding `documents`.
    pub fn with_documents(name: impl Into<String>, documents: Vec<Document>) -> Self {
        let core = Self::new(name);
        for document in documents {
            core.add(document);
        }
        core
    }

    /// Returns the core name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a document, replacing one with the same id.
    pub fn add(&self, document: Document) {
        let mut documents = self.documents.write();
        match documents.iter_mut().find(|d| d.id == document.id) {
            Some(existing) => *existing = document,
            None => documents.push(document),
        }
    }

    /// Deletes a document, returning whether it existed.
    pub fn delete(&self, id: &str) -> bool {
        let mut documents = self.documents.write();
        let before = documents.len();
        documents.retain(|d| d.id != id);
        documents.len() != before
    }

    /// Returns the number of documents.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Returns true if the core holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    fn execute(&self, search: &CoreSearch<QueryExpression>) -> Result<CoreResponse, BackendError> {
        let documents = self.documents.read();

        let mut matched: Vec<(&Document, f32)> = Vec::new();
        for document in documents.iter() {
            if !self.admits(document, search)? {
                continue;
            }
            let mut score = 1.0;
            if let Some(rank_query) = &search.rank_query {
                if self.evaluate(rank_query, document)? {
                    score += RANK_BOOST;
                }
            }
            matched.push((document, score));
        }

        let collected_keys = search.collect_keys.as_ref().map(|key_name| {
            matched
                .iter()
                .flat_map(|(document, _)| document.values(key_name).iter().cloned())
                .collect::<KeySet>()
        });

        let drilldown_data = (!search.facets.is_empty()).then(|| {
            let members: Vec<&Document> = matched.iter().map(|(document, _)| *document).collect();
            search
                .facets
                .iter()
                .map(|request| count_facet(request, &members))
                .collect()
        });

        let options = &search.options;
        rank(&mut matched, &options.sort_keys);
        if let Some(dedup_field) = &options.dedup_field {
            matched = dedup(matched, dedup_field, options.dedup_sort_field.as_deref());
        }
        if options.grouping_field.is_some() || options.clustering {
            debug!(core = %self.name, "Grouping and clustering are not applied in memory");
        }

        let total = matched.len() as u64;
        let start = options.start.unwrap_or(0);
        let stop = options.stop.unwrap_or(start + DEFAULT_PAGE_SIZE);
        let hits = matched
            .iter()
            .skip(start)
            .take(stop.saturating_sub(start))
            .map(|(document, score)| Hit {
                id: document.id.clone(),
                score: *score,
                stored_fields: document.stored_fields(),
            })
            .collect();

        Ok(CoreResponse {
            total,
            hits,
            drilldown_data,
            collected_keys,
            suggestions: suggest(options, &documents),
        })
    }

    /// Applies the query, filters, drilldowns and key filters.
    fn admits(
        &self,
        document: &Document,
        search: &CoreSearch<QueryExpression>,
    ) -> Result<bool, BackendError> {
        if let Some(query) = &search.query {
            if !self.evaluate(query, document)? {
                return Ok(false);
            }
        }
        for filter in &search.filter_queries {
            if !self.evaluate(filter, document)? {
                return Ok(false);
            }
        }
        if !search
            .drilldown_queries
            .iter()
            .all(|drilldown| drills_down(document, drilldown))
        {
            return Ok(false);
        }
        Ok(search.key_filters.iter().all(|filter| {
            document
                .values(&filter.key_name)
                .iter()
                .any(|value| filter.keys.contains(value))
        }))
    }

    fn evaluate(&self, expr: &QueryExpression, document: &Document) -> Result<bool, BackendError> {
        match expr {
            QueryExpression::Term(clause) => self.matches_clause(clause, document),
            QueryExpression::And(operands) => {
                for operand in operands {
                    if !self.evaluate(operand, document)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            QueryExpression::Or(operands) => {
                for operand in operands {
                    if self.evaluate(operand, document)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            QueryExpression::Not(inner) => Ok(!self.evaluate(inner, document)?),
        }
    }

    fn matches_clause(&self, clause: &SearchClause, document: &Document) -> Result<bool, BackendError> {
        let term = clause.term.as_str();
        let Some(index) = &clause.index else {
            if term == MATCH_ALL_TERM {
                return Ok(true);
            }
            return Ok(document
                .fields
                .values()
                .flatten()
                .any(|value| loosely_equal(value, term)));
        };

        let values = document.values(index);
        if term == MATCH_ALL_TERM {
            return Ok(!values.is_empty());
        }

        let relation = clause.relation.as_deref().unwrap_or("=");
        let matched = match relation {
            "=" => values.iter().any(|value| loosely_equal(value, term)),
            "==" | "exact" => values.iter().any(|value| value == term),
            "<>" => !values.iter().any(|value| loosely_equal(value, term)),
            "<" => values.iter().any(|value| compare(value, term) == Ordering::Less),
            "<=" => values.iter().any(|value| compare(value, term) != Ordering::Greater),
            ">" => values.iter().any(|value| compare(value, term) == Ordering::Greater),
            ">=" => values.iter().any(|value| compare(value, term) != Ordering::Less),
            "any" => term
                .split_whitespace()
                .any(|word| values.iter().any(|value| loosely_equal(value, word))),
            "all" => term
                .split_whitespace()
                .all(|word| values.iter().any(|value| loosely_equal(value, word))),
            "adj" => {
                let phrase = term.to_lowercase();
                values
                    .iter()
                    .any(|value| value.to_lowercase().contains(&phrase))
            }
            other => {
                return Err(BackendError::search_failed(
                    self.name.clone(),
                    format!("unsupported relation '{}'", other),
                ));
            }
        };
        Ok(matched)
    }
}

#[async_trait]
impl CoreBackend<QueryExpression> for MemoryCore {
    async fn search(
        &self,
        search: CoreSearch<QueryExpression>,
    ) -> Result<CoreResponse, BackendError> {
        let response = self.execute(&search)?;
        debug!(
            core = %self.name,
            total = response.total,
            collected = response.collected_keys.as_ref().map(KeySet::len),
            "Memory search completed"
        );
        Ok(response)
    }
}

/// Equal ignoring case, either as a whole value or as one of its words.
fn loosely_equal(value: &str, term: &str) -> bool {
    value.eq_ignore_ascii_case(term)
        || value
            .split_whitespace()
            .any(|word| word.eq_ignore_ascii_case(term))
}

/// Compares numerically when both sides parse, lexicographically otherwise.
fn compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

fn drills_down(document: &Document, drilldown: &DrilldownQuery) -> bool {
    document
        .paths(&drilldown.fieldname)
        .iter()
        .any(|path| path.starts_with(&drilldown.path))
}

/// Orders by sort keys, then by score, keeping insertion order for ties.
/// Documents without a sort value come last.
fn rank(matched: &mut [(&Document, f32)], sort_keys: &[SortKey]) {
    matched.sort_by(|(a, score_a), (b, score_b)| {
        for key in sort_keys {
            let ordering = match (a.values(&key.sort_by).first(), b.values(&key.sort_by).first()) {
                (Some(x), Some(y)) if key.sort_descending => compare(y, x),
                (Some(x), Some(y)) => compare(x, y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        score_b.partial_cmp(score_a).unwrap_or(Ordering::Equal)
    });
}

/// Keeps one document per dedup value: the one with the highest
/// `sort_field` value, or the best ranked one. Documents without a dedup
/// value are always kept.
fn dedup<'a>(
    matched: Vec<(&'a Document, f32)>,
    field: &str,
    sort_field: Option<&str>,
) -> Vec<(&'a Document, f32)> {
    let mut best: HashMap<&str, usize> = HashMap::new();
    for (position, (document, _)) in matched.iter().enumerate() {
        let Some(value) = document.values(field).first() else {
            continue;
        };
        match best.get(value.as_str()) {
            Some(&current) => {
                let better = sort_field.is_some_and(|sort_field| {
                    match (
                        document.values(sort_field).first(),
                        matched[current].0.values(sort_field).first(),
                    ) {
                        (Some(candidate), Some(kept)) => compare(candidate, kept) == Ordering::Greater,
                        (Some(_), None) => true,
                        _ => false,
                    }
                });
                if better {
                    best.insert(value.as_str(), position);
                }
            }
            None => {
                best.insert(value.as_str(), position);
            }
        }
    }

    let keep: HashSet<usize> = best.into_values().collect();
    matched
        .into_iter()
        .enumerate()
        .filter(|(position, (document, _))| {
            document.values(field).is_empty() || keep.contains(position)
        })
        .map(|(_, entry)| entry)
        .collect()
}

fn count_facet(request: &FacetRequest, members: &[&Document]) -> FacetResult {
    let depth = request.path.len();
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for document in members {
        let terms: HashSet<&str> = document
            .paths(&request.fieldname)
            .iter()
            .filter(|path| path.len() > depth && path.starts_with(&request.path))
            .map(|path| path[depth].as_str())
            .collect();
        for term in terms {
            *counts.entry(term).or_default() += 1;
        }
    }

    let mut terms: Vec<FacetTerm> = counts
        .into_iter()
        .map(|(term, count)| FacetTerm::new(term, count))
        .collect();
    if request.sort_by == Some(FacetSort::Count) {
        terms.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
    }
    if request.max_terms > 0 {
        terms.truncate(request.max_terms);
    }

    FacetResult {
        core: None,
        fieldname: request.fieldname.clone(),
        path: request.path.clone(),
        terms,
    }
}

/// Suggests field words sharing a prefix with each requested term.
fn suggest(options: &QueryOptions, documents: &[Document]) -> Option<BTreeMap<String, Vec<String>>> {
    let request = options.suggestion_request.as_ref()?;
    let mut words: Vec<String> = documents
        .iter()
        .flat_map(|document| document.values(&request.field))
        .flat_map(|value| value.split_whitespace())
        .map(str::to_lowercase)
        .collect();
    words.sort();
    words.dedup();

    Some(
        request
            .suggests
            .iter()
            .map(|term| {
                let lowered = term.to_lowercase();
                let prefix: String = lowered.chars().take(2).collect();
                let suggestions = words
                    .iter()
                    .filter(|word| word.starts_with(&prefix) && **word != lowered)
                    .take(request.count)
                    .cloned()
                    .collect();
                (term.clone(), suggestions)
            })
            .collect(),
    )
}
