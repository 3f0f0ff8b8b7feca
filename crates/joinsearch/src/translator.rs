//! Translation of caller-facing search requests into composed queries.
//!
//! Callers address a single logical index: one query in the results core's
//! namespace, plus facets, sort keys and filters whose names may carry a
//! `core.` prefix to target another core. The [`ComposedQueryTranslator`]
//! turns such a [`SearchRequest`] into a [`ComposedQuery`], hands it to a
//! [`ComposedSearch`] and maps the response back to caller-facing facet names
//! and order.
//!
//! # Core prefixes
//!
//! A value `core.rest` targets `core` when `core` is a configured core other
//! than the results core. Anything else, including an unknown prefix, targets
//! the results core with the value unchanged.
//!
//! # Extra arguments
//!
//! | Argument | Effect |
//! |----------|--------|
//! | `x-filter` | filter query, core prefixed |
//! | `x-rank-query` | boost-only query, core prefixed, OR-combined per core |
//! | `x-filter-common-keys` | `"true"`/`"false"`, overrides the dedup default |
//! | `x-grouping` | `"true"` requests grouping |
//! | `x-clustering` | `"true"` requests clustering |

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::composed::ComposedQuery;
use crate::config::{
    ConfigError, FEATURE_CLUSTERING, FEATURE_GROUPING, RuntimeConfig, TranslatorConfig,
};
use crate::error::{FederationResult, RequestResult};
use crate::expression::QueryExpression;
use crate::extract::FilterExtractor;
use crate::federator::ComposedSearch;
use crate::parser::{CqlParser, ExpressionParser};
use crate::types::{
    DrilldownQuery, FacetRequest, FacetResult, FacetSort, SearchResponse, SortKey,
    SuggestionRequest,
};

/// Extra argument carrying core-prefixed filter queries.
pub const X_FILTER: &str = "x-filter";

/// Extra argument carrying core-prefixed rank queries.
pub const X_RANK_QUERY: &str = "x-rank-query";

/// Extra argument overriding the dedup default.
pub const X_FILTER_COMMON_KEYS: &str = "x-filter-common-keys";

/// Extra argument requesting grouping.
pub const X_GROUPING: &str = "x-grouping";

/// Extra argument requesting clustering.
pub const X_CLUSTERING: &str = "x-clustering";

/// Separator between a facet field name and its path segments.
pub const FACET_PATH_SEPARATOR: char = '>';

/// Translates drilldown field names into a core-local namespace.
pub type FieldTranslate = Box<dyn Fn(&str) -> String + Send + Sync>;

/// The query of a search request, either as text or already parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryInput {
    /// Query text, parsed by the translator's parser.
    Text(String),
    /// A parsed expression.
    Expression(QueryExpression),
}

impl Default for QueryInput {
    fn default() -> Self {
        QueryInput::Expression(QueryExpression::match_all())
    }
}

impl From<&str> for QueryInput {
    fn from(text: &str) -> Self {
        QueryInput::Text(text.to_string())
    }
}

impl From<String> for QueryInput {
    fn from(text: String) -> Self {
        QueryInput::Text(text)
    }
}

impl From<QueryExpression> for QueryInput {
    fn from(expression: QueryExpression) -> Self {
        QueryInput::Expression(expression)
    }
}

/// A requested facet; `fieldname` may be `name>sub>path` and core prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetField {
    /// Field name, optionally followed by `>`-separated path segments.
    pub fieldname: String,
    /// Maximum number of terms; 0 means unlimited.
    pub max_terms: usize,
    /// Term ordering; only `count` is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
}

/// A requested sort key; `sort_by` may be core prefixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKeyRequest {
    /// Field to sort by.
    pub sort_by: String,
    /// Highest values first.
    #[serde(default)]
    pub sort_descending: bool,
}

/// A caller-facing search request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    /// The query, in the results core's namespace.
    pub query: QueryInput,
    /// Facets, in the order their results should be returned.
    pub facets: Vec<FacetField>,
    /// Exact-path drilldown restrictions as `(fieldname, path)`.
    pub drilldown_queries: Vec<(String, Vec<String>)>,
    /// Filter queries as `(core, query text)`.
    pub filter_queries: Vec<(String, String)>,
    /// Sort keys.
    pub sort_keys: Vec<SortKeyRequest>,
    /// Index of the first hit.
    pub start: Option<usize>,
    /// Index one past the last hit.
    pub stop: Option<usize>,
    /// Suggestion request, passed through.
    pub suggestion_request: Option<SuggestionRequest>,
    /// Multi-valued extra arguments (`x-filter`, `x-grouping`, ...).
    pub extra_arguments: HashMap<String, Vec<String>>,
}

impl SearchRequest {
    /// Creates a request for `query`.
    pub fn new(query: impl Into<QueryInput>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Adds a facet.
    pub fn with_facet(mut self, fieldname: impl Into<String>, max_terms: usize) -> Self {
        self.facets.push(FacetField {
            fieldname: fieldname.into(),
            max_terms,
            sort_by: None,
        });
        self
    }

    /// Adds a drilldown restriction.
    pub fn with_drilldown(mut self, fieldname: impl Into<String>, path: Vec<String>) -> Self {
        self.drilldown_queries.push((fieldname.into(), path));
        self
    }

    /// Adds a filter query for an explicit core.
    pub fn with_filter_query(mut self, core: impl Into<String>, query: impl Into<String>) -> Self {
        self.filter_queries.push((core.into(), query.into()));
        self
    }

    /// Adds a sort key.
    pub fn with_sort_key(mut self, sort_by: impl Into<String>, sort_descending: bool) -> Self {
        self.sort_keys.push(SortKeyRequest {
            sort_by: sort_by.into(),
            sort_descending,
        });
        self
    }

    /// Appends a value to an extra argument.
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_arguments
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    fn extra(&self, name: &str) -> &[String] {
        self.extra_arguments
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn extra_flag(&self, name: &str) -> Option<bool> {
        self.extra(name).first().map(|value| value == "true")
    }
}

/// A composed query plus what is needed to map its response back.
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    /// The composed query.
    pub query: ComposedQuery,
    /// Requested facets as `(fieldname, path)`, in request order.
    pub facet_order: Vec<(String, Vec<String>)>,
    /// Caller-facing facet name per `(core, core-local name)`.
    pub field_translations: HashMap<(String, String), String>,
    /// Core assumed for facets that carry no core.
    pub results_from: String,
}

impl TranslatedRequest {
    /// Renames response facets to caller-facing names and restores the
    /// requested order. Facets that were not requested keep their relative
    /// order after the requested ones.
    pub fn restore(&self, mut response: SearchResponse) -> SearchResponse {
        if let Some(drilldown_data) = response.drilldown_data.as_mut() {
            for facet in drilldown_data.iter_mut() {
                let core = facet.core.as_deref().unwrap_or(&self.results_from);
                let key = (core.to_string(), facet.fieldname.clone());
                if let Some(name) = self.field_translations.get(&key) {
                    facet.fieldname = name.clone();
                }
            }
            drilldown_data.sort_by_key(|facet| self.position(facet));
        }
        response
    }

    fn position(&self, facet: &FacetResult) -> usize {
        self.facet_order
            .iter()
            .position(|(fieldname, path)| *fieldname == facet.fieldname && *path == facet.path)
            .unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Features {
    grouping: bool,
    clustering: bool,
}

/// Adapts caller-facing requests to composed queries and back.
pub struct ComposedQueryTranslator<S, P = CqlParser> {
    config: TranslatorConfig,
    cores: BTreeSet<String>,
    extractor: FilterExtractor,
    parser: P,
    translate: FieldTranslate,
    features: RwLock<Features>,
    search: S,
}

impl<S> ComposedQueryTranslator<S, CqlParser> {
    /// Creates a translator using the CQL parser.
    pub fn new(config: TranslatorConfig, search: S) -> Result<Self, ConfigError> {
        Self::with_parser(config, CqlParser::new(), search)
    }
}

impl<S, P> ComposedQueryTranslator<S, P> {
    /// Creates a translator with a custom query parser.
    pub fn with_parser(config: TranslatorConfig, parser: P, search: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let cores: BTreeSet<String> = config.cores().into_iter().map(str::to_string).collect();
        let features = Features {
            grouping: config.grouping_field_name.is_some(),
            clustering: true,
        };
        Ok(Self {
            extractor: FilterExtractor::new(cores.iter().cloned()),
            cores,
            config,
            parser,
            translate: Box::new(|name: &str| name.to_string()),
            features: RwLock::new(features),
            search,
        })
    }

    /// Sets the translation applied to facet and drilldown field names.
    pub fn with_field_translation(
        mut self,
        translate: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.translate = Box::new(translate);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Returns the wrapped search.
    pub fn search(&self) -> &S {
        &self.search
    }

    /// Re-evaluates the feature switches.
    pub fn update_config(&self, runtime: &RuntimeConfig) {
        let features = Features {
            grouping: self.config.grouping_field_name.is_some()
                && runtime.is_enabled(FEATURE_GROUPING),
            clustering: runtime.is_enabled(FEATURE_CLUSTERING),
        };
        debug!(
            grouping = features.grouping,
            clustering = features.clustering,
            "Runtime configuration updated"
        );
        *self.features.write() = features;
    }

    /// Splits a possibly core-prefixed value into `(core, value)`.
    fn core_prefix<'s, 'v>(&'s self, value: &'v str) -> (&'s str, &'v str) {
        let results_from = self.config.results_from.as_str();
        if let Some((prefix, tail)) = value.split_once('.') {
            if prefix != results_from {
                if let Some(core) = self.cores.get(prefix) {
                    return (core, tail);
                }
            }
        }
        (results_from, value)
    }
}

impl<S, P> ComposedQueryTranslator<S, P>
where
    P: ExpressionParser,
{
    fn parse(&self, query: &QueryInput) -> RequestResult<QueryExpression> {
        match query {
            QueryInput::Text(text) => self.parser.parse(text),
            QueryInput::Expression(expression) => Ok(expression.clone()),
        }
    }

    /// Builds the composed query for a request.
    pub fn compose(&self, request: &SearchRequest) -> RequestResult<TranslatedRequest> {
        let results_from = self.config.results_from.as_str();
        let features = *self.features.read();

        let mut cq = ComposedQuery::new(results_from);
        for declaration in &self.config.matches {
            cq.add_match(&declaration.pairs())?;
        }
        if let Some(start) = request.start {
            cq.set_start(start);
        }
        if let Some(stop) = request.stop {
            cq.set_stop(stop);
        }
        if let Some(suggestion_request) = &request.suggestion_request {
            cq.set_suggestion_request(suggestion_request.clone());
        }

        let query = self.parse(&request.query)?;
        let (core_query, filters) = self.extractor.convert(query, results_from);
        if let Some(core_query) = &core_query {
            cq.set_core_query(results_from, core_query.clone());
        }
        for (core, core_filters) in filters {
            for filter in core_filters {
                cq.add_filter_query(&core, filter);
            }
        }

        for sort_key in &request.sort_keys {
            let (core, sort_by) = self.core_prefix(&sort_key.sort_by);
            cq.add_sort_key(SortKey {
                core: core.to_string(),
                sort_by: sort_by.to_string(),
                sort_descending: sort_key.sort_descending,
            });
        }

        for filter in request.extra(X_FILTER) {
            let (core, text) = self.core_prefix(filter);
            cq.add_filter_query(core, self.parser.parse(text)?);
        }
        for (core, text) in &request.filter_queries {
            cq.add_filter_query(core, self.parser.parse(text)?);
        }

        let mut rank_queries: BTreeMap<&str, Vec<QueryExpression>> = BTreeMap::new();
        for rank_query in request.extra(X_RANK_QUERY) {
            let (core, text) = self.core_prefix(rank_query);
            rank_queries
                .entry(core)
                .or_default()
                .push(self.parser.parse(text)?);
        }
        for (core, queries) in rank_queries {
            if let Some(combined) = QueryExpression::or_all(queries) {
                cq.set_rank_query(core, combined);
            }
        }

        if let Some(dedup_field) = &self.config.dedup_field_name {
            let dedup = request
                .extra_flag(X_FILTER_COMMON_KEYS)
                .unwrap_or(self.config.dedup_by_default);
            if dedup {
                cq.set_dedup(dedup_field.clone(), self.config.dedup_sort_field_name.clone());
            }
        }

        if features.grouping && request.extra_flag(X_GROUPING) == Some(true) {
            match (&self.config.grouping_field_name, &core_query) {
                (_, Some(q)) if q.is_match_all() => {
                    debug!("Grouping skipped for match-all query");
                }
                (Some(field), _) => cq.set_grouping_field(field.clone()),
                (None, _) => {}
            }
        }

        if features.clustering && request.extra_flag(X_CLUSTERING) == Some(true) {
            cq.set_clustering(true);
        }

        let mut facet_order = Vec::with_capacity(request.facets.len());
        let mut field_translations = HashMap::new();
        for facet in &request.facets {
            let mut segments = facet.fieldname.split(FACET_PATH_SEPARATOR);
            let fieldname = segments.next().unwrap_or_default();
            let path: Vec<String> = segments.map(str::to_string).collect();
            facet_order.push((fieldname.to_string(), path.clone()));

            let (core, local) = self.core_prefix(fieldname);
            let translated = (self.translate)(local);
            field_translations.insert(
                (core.to_string(), translated.clone()),
                fieldname.to_string(),
            );

            let mut request = FacetRequest::new(translated, facet.max_terms).with_path(path);
            if let Some(sort_by) = &facet.sort_by {
                request = request.with_sort(FacetSort::parse(sort_by)?);
            }
            cq.add_facet(core, request);
        }

        for (fieldname, path) in &request.drilldown_queries {
            let (core, local) = self.core_prefix(fieldname);
            cq.add_drilldown_query(core, DrilldownQuery::new((self.translate)(local), path.clone()));
        }

        cq.validate()?;
        Ok(TranslatedRequest {
            query: cq,
            facet_order,
            field_translations,
            results_from: results_from.to_string(),
        })
    }
}

impl<S, P> ComposedQueryTranslator<S, P>
where
    S: ComposedSearch<QueryExpression>,
    P: ExpressionParser,
{
    /// Translates, executes and maps back a request.
    #[instrument(skip(self, request), fields(results_from = %self.config.results_from))]
    pub async fn execute_query(&self, request: SearchRequest) -> FederationResult<SearchResponse> {
        let mut translated = self.compose(&request)?;
        debug!(cores = ?translated.query.cores(), "Composed query");
        let query = std::mem::take(&mut translated.query);
        let response = self.search.execute_composed_query(query).await?;
        Ok(translated.restore(response))
    }
}
