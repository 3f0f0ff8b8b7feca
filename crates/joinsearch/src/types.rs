//! Core types shared by the composed query model, the translator and the
//! federator.
//!
//! - [`FacetRequest`] / [`FacetResult`] - drilldown requests and counts
//! - [`SortKey`], [`SuggestionRequest`], [`QueryOptions`] - response shaping
//! - [`KeySet`], [`KeyFilter`] - join artifacts
//! - [`CoreSearch`], [`CoreResponse`] - the per-core backend contract
//! - [`SearchResponse`] - the merged response returned to callers

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RequestError, RequestResult};

/// Ordering applied to facet terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacetSort {
    /// Highest count first.
    Count,
}

impl FacetSort {
    /// Parses a caller supplied `sortBy` value.
    pub fn parse(value: &str) -> RequestResult<Self> {
        match value {
            "count" => Ok(FacetSort::Count),
            other => Err(RequestError::UnsupportedFacetSort {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for FacetSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacetSort::Count => write!(f, "count"),
        }
    }
}

/// A request for facet counts on a (hierarchical) drilldown field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetRequest {
    /// The drilldown field name, in the namespace of the owning core.
    pub fieldname: String,

    /// Path below which terms are counted; empty for the top level.
    #[serde(default)]
    pub path: Vec<String>,

    /// Maximum number of terms returned; 0 means unlimited.
    pub max_terms: usize,

    /// Term ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<FacetSort>,
}

impl FacetRequest {
    /// Creates a top-level facet request.
    pub fn new(fieldname: impl Into<String>, max_terms: usize) -> Self {
        Self {
            fieldname: fieldname.into(),
            path: Vec::new(),
            max_terms,
            sort_by: None,
        }
    }

    /// Sets the path below which terms are counted.
    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    /// Sets the term ordering.
    pub fn with_sort(mut self, sort_by: FacetSort) -> Self {
        self.sort_by = Some(sort_by);
        self
    }
}

/// An exact-path facet restriction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrilldownQuery {
    /// The drilldown field name.
    pub fieldname: String,
    /// The exact path segments a document must be categorized under.
    pub path: Vec<String>,
}

impl DrilldownQuery {
    /// Creates a drilldown query.
    pub fn new(fieldname: impl Into<String>, path: Vec<String>) -> Self {
        Self {
            fieldname: fieldname.into(),
            path,
        }
    }
}

/// A sort key, already resolved to the core owning the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    /// The core the sort field belongs to.
    pub core: String,
    /// The field to sort by.
    pub sort_by: String,
    /// Descending when true.
    #[serde(default)]
    pub sort_descending: bool,
}

/// A request for query suggestions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestionRequest {
    /// Number of suggestions per term.
    pub count: usize,
    /// Field the suggestions are drawn from.
    pub field: String,
    /// Terms to suggest alternatives for.
    pub suggests: Vec<String>,
}

/// Response shaping options of a composed query.
///
/// Every recognized option has an explicit default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    /// Index of the first hit returned.
    pub start: Option<usize>,
    /// Index one past the last hit returned.
    pub stop: Option<usize>,
    /// Sort keys, in priority order.
    pub sort_keys: Vec<SortKey>,
    /// Suggestion request.
    pub suggestion_request: Option<SuggestionRequest>,
    /// Field whose equal values collapse into one hit.
    pub dedup_field: Option<String>,
    /// Field deciding which hit survives deduplication.
    pub dedup_sort_field: Option<String>,
    /// Field hits are grouped by.
    pub grouping_field: Option<String>,
    /// Whether results should be clustered.
    pub clustering: bool,
}

/// A set of join-key values collected from one core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet(HashSet<String>);

impl KeySet {
    /// Creates an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key value.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.0.insert(key.into())
    }

    /// Returns true if the key value was collected.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no key was collected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds every key of `other`.
    pub fn union_with(&mut self, other: &KeySet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Keeps only the keys also present in `other`.
    pub fn intersect_with(&mut self, other: &KeySet) {
        self.0.retain(|key| other.contains(key));
    }

    /// Iterates over the keys in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for KeySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Restricts a search to documents whose key field value is in a key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFilter {
    /// The key field checked on the filtered core.
    pub key_name: String,
    /// The admitted key values. Shared read-only between sub-searches.
    pub keys: Arc<KeySet>,
}

impl KeyFilter {
    /// Creates a key filter.
    pub fn new(key_name: impl Into<String>, keys: Arc<KeySet>) -> Self {
        Self {
            key_name: key_name.into(),
            keys,
        }
    }
}

/// A search against a single core, as handed to a backend.
///
/// A document matches when it matches `query` (or every document when `query`
/// is `None`), every filter query, every drilldown query and every key filter.
#[derive(Debug, Clone)]
pub struct CoreSearch<Q> {
    /// The main query; `None` matches all documents.
    pub query: Option<Q>,
    /// Additional restrictions that do not contribute to scoring.
    pub filter_queries: Vec<Q>,
    /// Boost-only query: affects ranking, never membership.
    pub rank_query: Option<Q>,
    /// Exact-path facet restrictions.
    pub drilldown_queries: Vec<DrilldownQuery>,
    /// Key filters; all must admit a document.
    pub key_filters: Vec<KeyFilter>,
    /// Key field to collect from every matching document.
    pub collect_keys: Option<String>,
    /// Facets to count over the matching documents.
    pub facets: Vec<FacetRequest>,
    /// Paging, sorting and feature options.
    pub options: QueryOptions,
}

impl<Q> CoreSearch<Q> {
    /// Creates a search for `query` with no further restrictions.
    pub fn new(query: Option<Q>) -> Self {
        Self {
            query,
            filter_queries: Vec::new(),
            rank_query: None,
            drilldown_queries: Vec::new(),
            key_filters: Vec::new(),
            collect_keys: None,
            facets: Vec::new(),
            options: QueryOptions::default(),
        }
    }
}

/// A single ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hit {
    /// Document identifier.
    pub id: String,
    /// Relevance score.
    pub score: f32,
    /// Stored field values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stored_fields: BTreeMap<String, Value>,
}

impl Hit {
    /// Creates a hit without stored fields.
    pub fn new(id: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score,
            stored_fields: BTreeMap::new(),
        }
    }
}

/// One facet term and its count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetTerm {
    /// The term.
    pub term: String,
    /// Number of matching documents categorized under the term.
    pub count: u64,
    /// Terms one level deeper, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subterms: Option<Vec<FacetTerm>>,
}

impl FacetTerm {
    /// Creates a term without subterms.
    pub fn new(term: impl Into<String>, count: u64) -> Self {
        Self {
            term: term.into(),
            count,
            subterms: None,
        }
    }
}

/// Facet counts for one requested field and path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetResult {
    /// The core the counts were taken from, set by the federator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core: Option<String>,
    /// The field name.
    pub fieldname: String,
    /// The path the terms were counted below.
    #[serde(default)]
    pub path: Vec<String>,
    /// The counted terms.
    pub terms: Vec<FacetTerm>,
}

/// What a backend returns for a [`CoreSearch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreResponse {
    /// Total number of matching documents.
    pub total: u64,
    /// Ranked hits for the requested page.
    pub hits: Vec<Hit>,
    /// Facet counts; `None` when the backend produced no facet data.
    pub drilldown_data: Option<Vec<FacetResult>>,
    /// Keys collected for [`CoreSearch::collect_keys`].
    pub collected_keys: Option<KeySet>,
    /// Suggestions per requested term.
    pub suggestions: Option<BTreeMap<String, Vec<String>>>,
}

/// The merged response returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// Total number of matching documents in the results core.
    pub total: u64,
    /// Wall-clock duration of the whole request, in milliseconds.
    pub query_time: u64,
    /// Ranked hits.
    pub hits: Vec<Hit>,
    /// Facet counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drilldown_data: Option<Vec<FacetResult>>,
    /// Suggestions per requested term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<BTreeMap<String, Vec<String>>>,
}

impl From<CoreResponse> for SearchResponse {
    fn from(response: CoreResponse) -> Self {
        Self {
            total: response.total,
            query_time: 0,
            hits: response.hits,
            drilldown_data: response.drilldown_data,
            suggestions: response.suggestions,
        }
    }
}
