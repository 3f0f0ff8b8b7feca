//! The composed query model.
//!
//! A [`ComposedQuery`] describes one logical search spanning up to
//! [`MAX_CORES`] cores: per core a query, filter queries, drilldown queries,
//! a rank query and facets; the join keys ("matches") between core pairs;
//! unite requests; and the response shaping [`QueryOptions`].
//!
//! The query representation is a type parameter. The translator builds a
//! `ComposedQuery<QueryExpression>`; [`ComposedQuery::convert_with`] lowers it
//! into whatever a backend executes without the model knowing about it.
//!
//! # Example
//!
//! ```
//! use joinsearch::composed::ComposedQuery;
//! use joinsearch::expression::QueryExpression;
//!
//! let mut cq = ComposedQuery::new("articles");
//! cq.add_match(&[("articles", "authorKey"), ("authors", "key")]).unwrap();
//! cq.add_filter_query("authors", QueryExpression::field("country", "NL"));
//! cq.validate().unwrap();
//!
//! assert_eq!(cq.cores(), vec!["articles", "authors"]);
//! assert_eq!(cq.key_names("authors", "articles"), Some(("key", "authorKey")));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RequestError, RequestResult};
use crate::expression::QueryExpression;
use crate::types::{DrilldownQuery, FacetRequest, QueryOptions, SortKey, SuggestionRequest};

/// Maximum number of cores a composed query may span.
pub const MAX_CORES: usize = 2;

/// Separator between the two core names of a serialized match key.
pub const MATCH_KEY_SEPARATOR: &str = "->";

/// Everything requested from a single core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "Q: Deserialize<'de>"))]
pub struct CoreQuery<Q> {
    /// The core identifier.
    pub core: String,

    /// The main query, `None` when only filters or facets were given.
    #[serde(default)]
    pub query: Option<Q>,

    /// Filter queries, in the order they were added.
    #[serde(default)]
    pub filter_queries: Vec<Q>,

    /// Facets, in the order they were added.
    #[serde(default)]
    pub facets: Vec<FacetRequest>,

    /// Exact-path drilldown restrictions.
    #[serde(default)]
    pub drilldown_queries: Vec<DrilldownQuery>,

    /// Boost-only query.
    #[serde(default)]
    pub rank_query: Option<Q>,
}

impl<Q> CoreQuery<Q> {
    fn new(core: impl Into<String>) -> Self {
        Self {
            core: core.into(),
            query: None,
            filter_queries: Vec::new(),
            facets: Vec::new(),
            drilldown_queries: Vec::new(),
            rank_query: None,
        }
    }

    /// Returns true if anything restricts the documents of this core.
    pub fn is_constrained(&self) -> bool {
        self.query.is_some() || !self.filter_queries.is_empty() || !self.drilldown_queries.is_empty()
    }

    fn try_convert<R, E>(self, convert: &mut impl FnMut(Q) -> Result<R, E>) -> Result<CoreQuery<R>, E> {
        Ok(CoreQuery {
            core: self.core,
            query: self.query.map(&mut *convert).transpose()?,
            filter_queries: self
                .filter_queries
                .into_iter()
                .map(&mut *convert)
                .collect::<Result<_, _>>()?,
            facets: self.facets,
            drilldown_queries: self.drilldown_queries,
            rank_query: self.rank_query.map(&mut *convert).transpose()?,
        })
    }
}

/// A query whose join keys are united with another core's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unite<Q> {
    /// The core the query runs against.
    pub core: String,
    /// The key field collected on that core.
    pub key_name: String,
    /// The query.
    pub query: Q,
}

/// A search request spanning one or two cores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedQuery<Q = QueryExpression> {
    results_from: Option<String>,

    core_queries: Vec<CoreQuery<Q>>,

    #[serde(with = "match_keys")]
    matches: BTreeMap<(String, String), (String, String)>,

    unites: Vec<Unite<Q>>,

    #[serde(default)]
    options: QueryOptions,
}

impl<Q> Default for ComposedQuery<Q> {
    fn default() -> Self {
        Self {
            results_from: None,
            core_queries: Vec::new(),
            matches: BTreeMap::new(),
            unites: Vec::new(),
            options: QueryOptions::default(),
        }
    }
}

impl<Q> ComposedQuery<Q> {
    /// Creates a composed query returning hits from `results_from`.
    pub fn new(results_from: impl Into<String>) -> Self {
        let mut cq = Self::default();
        cq.set_results_from(results_from);
        cq
    }

    /// Sets the core whose hits become the response, registering it.
    pub fn set_results_from(&mut self, core: impl Into<String>) {
        let core = core.into();
        self.ensure_core(&core);
        self.results_from = Some(core);
    }

    /// Returns the results core, if set.
    pub fn results_from(&self) -> Option<&str> {
        self.results_from.as_deref()
    }

    /// Registers or replaces the query bundle of a core.
    pub fn add(
        &mut self,
        core: impl Into<String>,
        query: Option<Q>,
        facets: Vec<FacetRequest>,
        filter_queries: Vec<Q>,
    ) {
        let core = core.into();
        let mut bundle = CoreQuery::new(core.clone());
        bundle.query = query;
        bundle.facets = facets;
        bundle.filter_queries = filter_queries;

        match self.core_queries.iter_mut().find(|cq| cq.core == core) {
            Some(existing) => *existing = bundle,
            None => self.core_queries.push(bundle),
        }
    }

    /// Replaces only the query of a core, keeping its filters and facets.
    pub fn set_core_query(&mut self, core: &str, query: Q) {
        self.ensure_core(core).query = Some(query);
    }

    /// Appends a filter query to a core.
    pub fn add_filter_query(&mut self, core: &str, query: Q) {
        self.ensure_core(core).filter_queries.push(query);
    }

    /// Appends a facet request to a core.
    pub fn add_facet(&mut self, core: &str, facet: FacetRequest) {
        self.ensure_core(core).facets.push(facet);
    }

    /// Appends a drilldown restriction to a core.
    pub fn add_drilldown_query(&mut self, core: &str, drilldown: DrilldownQuery) {
        self.ensure_core(core).drilldown_queries.push(drilldown);
    }

    /// Sets the boost-only query of a core.
    pub fn set_rank_query(&mut self, core: &str, query: Q) {
        self.ensure_core(core).rank_query = Some(query);
    }

    /// Appends a sort key.
    pub fn add_sort_key(&mut self, sort_key: SortKey) {
        self.options.sort_keys.push(sort_key);
    }

    /// Declares the join keys between two cores.
    ///
    /// Exactly [`MAX_CORES`] distinct `(core, key)` pairs are required. The
    /// pair is stored sorted by core name.
    pub fn add_match<C, K>(&mut self, pairs: &[(C, K)]) -> RequestResult<()>
    where
        C: AsRef<str>,
        K: AsRef<str>,
    {
        let (first, second) = sorted_pair("add_match", pairs)?;
        let (core_a, key_a) = (&pairs[first].0, &pairs[first].1);
        let (core_b, key_b) = (&pairs[second].0, &pairs[second].1);
        self.matches.insert(
            (core_a.as_ref().to_string(), core_b.as_ref().to_string()),
            (key_a.as_ref().to_string(), key_b.as_ref().to_string()),
        );
        Ok(())
    }

    /// Unites a query per core with the matched keys of the other core.
    ///
    /// Requires a match for the two cores; registers both cores.
    pub fn unite<C>(&mut self, queries: Vec<(C, Q)>) -> RequestResult<()>
    where
        C: AsRef<str>,
    {
        let (first, second) = sorted_pair("unite", &queries)?;
        let core_a = queries[first].0.as_ref().to_string();
        let core_b = queries[second].0.as_ref().to_string();

        let (key_a, key_b) = match self.key_names(&core_a, &core_b) {
            Some((a, b)) => (a.to_string(), b.to_string()),
            None => {
                return Err(RequestError::NoMatchForCores {
                    cores: vec![core_a, core_b],
                });
            }
        };

        let mut by_core: BTreeMap<String, Q> = queries
            .into_iter()
            .map(|(core, query)| (core.as_ref().to_string(), query))
            .collect();

        for (core, key_name) in [(core_a, key_a), (core_b, key_b)] {
            if let Some(query) = by_core.remove(&core) {
                self.ensure_core(&core);
                self.unites.push(Unite {
                    core,
                    key_name,
                    query,
                });
            }
        }
        Ok(())
    }

    /// Returns the unite requests in the order they were added.
    pub fn unites(&self) -> &[Unite<Q>] {
        &self.unites
    }

    /// Returns the join key names for two cores, in argument order.
    ///
    /// Lookup is symmetric: when only `(a, b)` is stored, `(b, a)` yields the
    /// reversed key pair. Returns `None` if no match covers the cores.
    pub fn key_names(&self, core_a: &str, core_b: &str) -> Option<(&str, &str)> {
        let forward = (core_a.to_string(), core_b.to_string());
        if let Some((key_a, key_b)) = self.matches.get(&forward) {
            return Some((key_a.as_str(), key_b.as_str()));
        }
        let reversed = (core_b.to_string(), core_a.to_string());
        self.matches
            .get(&reversed)
            .map(|(key_b, key_a)| (key_a.as_str(), key_b.as_str()))
    }

    /// Returns the bundle of a core, if registered.
    pub fn core_query(&self, core: &str) -> Option<&CoreQuery<Q>> {
        self.core_queries.iter().find(|cq| cq.core == core)
    }

    /// Returns the main query of a core.
    pub fn query_for(&self, core: &str) -> Option<&Q> {
        self.core_query(core).and_then(|cq| cq.query.as_ref())
    }

    /// Returns the main query (when set) followed by the filter queries.
    pub fn queries_for(&self, core: &str) -> Vec<&Q> {
        match self.core_query(core) {
            Some(cq) => cq.query.iter().chain(cq.filter_queries.iter()).collect(),
            None => Vec::new(),
        }
    }

    /// Returns the facets requested from a core.
    pub fn facets_for(&self, core: &str) -> &[FacetRequest] {
        self.core_query(core).map(|cq| cq.facets.as_slice()).unwrap_or(&[])
    }

    /// Returns the filter queries of a core.
    pub fn filter_queries_for(&self, core: &str) -> &[Q] {
        self.core_query(core)
            .map(|cq| cq.filter_queries.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the drilldown restrictions of a core.
    pub fn drilldown_queries_for(&self, core: &str) -> &[DrilldownQuery] {
        self.core_query(core)
            .map(|cq| cq.drilldown_queries.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the rank query of a core.
    pub fn rank_query_for(&self, core: &str) -> Option<&Q> {
        self.core_query(core).and_then(|cq| cq.rank_query.as_ref())
    }

    /// Number of registered cores.
    pub fn number_of_cores(&self) -> usize {
        self.core_queries.len()
    }

    /// Checks the structural invariants before execution.
    pub fn validate(&self) -> RequestResult<()> {
        let count = self.number_of_cores();
        if !(1..=MAX_CORES).contains(&count) {
            return Err(RequestError::UnsupportedCoreCount {
                count,
                max: MAX_CORES,
            });
        }
        if self.results_from.is_none() {
            return Err(RequestError::ResultsFromNotSet);
        }
        if count > 1 {
            if self.matches.is_empty() {
                return Err(RequestError::NoMatchSet);
            }
            let cores = self.cores();
            if self.key_names(cores[0], cores[1]).is_none() {
                return Err(RequestError::NoMatchForCores {
                    cores: cores.into_iter().map(str::to_string).collect(),
                });
            }
        }
        Ok(())
    }

    /// Applies `convert` to every query, filter query, rank query and unite
    /// query. Absent queries stay absent.
    pub fn convert_with<R>(self, mut convert: impl FnMut(Q) -> R) -> ComposedQuery<R> {
        match self.try_convert_with(|q| Ok::<R, std::convert::Infallible>(convert(q))) {
            Ok(converted) => converted,
            Err(never) => match never {},
        }
    }

    /// Like [`convert_with`](Self::convert_with), stopping at the first error.
    pub fn try_convert_with<R, E>(
        self,
        mut convert: impl FnMut(Q) -> Result<R, E>,
    ) -> Result<ComposedQuery<R>, E> {
        let core_queries = self
            .core_queries
            .into_iter()
            .map(|cq| cq.try_convert(&mut convert))
            .collect::<Result<_, _>>()?;
        let unites = self
            .unites
            .into_iter()
            .map(|u| -> Result<Unite<R>, E> {
                Ok(Unite {
                    core: u.core,
                    key_name: u.key_name,
                    query: convert(u.query)?,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(ComposedQuery {
            results_from: self.results_from,
            core_queries,
            matches: self.matches,
            unites,
            options: self.options,
        })
    }

    /// Returns the results core first, then the others in registration order.
    pub fn cores(&self) -> Vec<&str> {
        let results = self.results_from.as_deref();
        results
            .into_iter()
            .chain(
                self.core_queries
                    .iter()
                    .map(|cq| cq.core.as_str())
                    .filter(|core| Some(*core) != results),
            )
            .collect()
    }

    /// Returns every core taking part in a match.
    pub fn matching_cores(&self) -> BTreeSet<&str> {
        self.matches
            .keys()
            .flat_map(|(a, b)| [a.as_str(), b.as_str()])
            .collect()
    }

    /// Returns the response shaping options.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Sets the index of the first hit.
    pub fn set_start(&mut self, start: usize) {
        self.options.start = Some(start);
    }

    /// Sets the index one past the last hit.
    pub fn set_stop(&mut self, stop: usize) {
        self.options.stop = Some(stop);
    }

    /// Sets the suggestion request.
    pub fn set_suggestion_request(&mut self, request: SuggestionRequest) {
        self.options.suggestion_request = Some(request);
    }

    /// Enables deduplication on `field`.
    pub fn set_dedup(&mut self, field: impl Into<String>, sort_field: Option<String>) {
        self.options.dedup_field = Some(field.into());
        self.options.dedup_sort_field = sort_field;
    }

    /// Enables grouping on `field`.
    pub fn set_grouping_field(&mut self, field: impl Into<String>) {
        self.options.grouping_field = Some(field.into());
    }

    /// Enables or disables clustering.
    pub fn set_clustering(&mut self, clustering: bool) {
        self.options.clustering = clustering;
    }

    fn ensure_core(&mut self, core: &str) -> &mut CoreQuery<Q> {
        let index = match self.core_queries.iter().position(|cq| cq.core == core) {
            Some(index) => index,
            None => {
                self.core_queries.push(CoreQuery::new(core));
                self.core_queries.len() - 1
            }
        };
        &mut self.core_queries[index]
    }
}

impl<Q: Serialize> ComposedQuery<Q> {
    /// Returns a structural snapshot of the query.
    pub fn to_value(&self) -> RequestResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl<Q: DeserializeOwned> ComposedQuery<Q> {
    /// Rebuilds a query from a snapshot produced by [`to_value`](Self::to_value).
    pub fn from_value(value: Value) -> RequestResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Validates the arity of a match/unite argument list and returns the indexes
/// of its two entries ordered by core name.
fn sorted_pair<C: AsRef<str>, V>(
    operation: &'static str,
    entries: &[(C, V)],
) -> RequestResult<(usize, usize)> {
    let distinct: BTreeSet<&str> = entries.iter().map(|(core, _)| core.as_ref()).collect();
    if entries.len() != MAX_CORES || distinct.len() != MAX_CORES {
        return Err(RequestError::MatchArity {
            operation,
            expected: MAX_CORES,
            count: distinct.len(),
        });
    }
    if entries[0].0.as_ref() <= entries[1].0.as_ref() {
        Ok((0, 1))
    } else {
        Ok((1, 0))
    }
}

/// Serde module encoding match keys as `"coreA->coreB"` strings.
mod match_keys {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::MATCH_KEY_SEPARATOR;

    type Matches = BTreeMap<(String, String), (String, String)>;

    pub fn serialize<S>(matches: &Matches, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: BTreeMap<String, (&str, &str)> = matches
            .iter()
            .map(|((core_a, core_b), (key_a, key_b))| {
                (
                    format!("{}{}{}", core_a, MATCH_KEY_SEPARATOR, core_b),
                    (key_a.as_str(), key_b.as_str()),
                )
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Matches, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, (String, String)>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(cores, (key_a, key_b))| {
                let (core_a, core_b) = cores.split_once(MATCH_KEY_SEPARATOR).ok_or_else(|| {
                    D::Error::custom(format!("match key '{}' lacks '{}'", cores, MATCH_KEY_SEPARATOR))
                })?;
                if core_a <= core_b {
                    Ok(((core_a.to_string(), core_b.to_string()), (key_a, key_b)))
                } else {
                    Ok(((core_b.to_string(), core_a.to_string()), (key_b, key_a)))
                }
            })
            .collect()
    }
}
