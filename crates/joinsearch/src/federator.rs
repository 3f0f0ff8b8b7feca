//! Join federation across cores.
//!
//! The [`JoinFederator`] executes a validated [`ComposedQuery`] against the
//! per-core backends, enforcing the joins declared between cores.
//!
//! # Execution
//!
//! | Phase | Runs against | Produces |
//! |-------|--------------|----------|
//! | 1. Key collection | every constrained non-results core, every unite entry | join key sets |
//! | 2. Primary | the results core, filtered by the phase 1 keys | hits, own facets, results keys |
//! | 3. Facets | every non-results core with facets, filtered by the results keys | join facets |
//!
//! Phase 1 and phase 3 sub-searches run concurrently on a [`JoinSet`], one
//! task per core, so a core never receives concurrent calls. Phase 2 waits
//! for all of phase 1; phase 3 waits for phase 2.
//!
//! A request without join queries, join facets or unites is forwarded to the
//! results core as is.
//!
//! # Example
//!
//! ```ignore
//! use joinsearch::federator::JoinFederator;
//!
//! let federator = JoinFederator::new(FederatorConfig::default())
//!     .with_core("articles", articles_backend)
//!     .with_core("authors", authors_backend);
//!
//! let response = federator.execute(composed_query).await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, instrument, warn};

use crate::composed::ComposedQuery;
use crate::config::FederatorConfig;
use crate::error::{BackendError, FederationResult, RequestError, RequestResult};
use crate::types::{CoreResponse, CoreSearch, FacetResult, KeyFilter, KeySet, SearchResponse};

/// A search backend for a single core.
///
/// Implementations must honour every field of [`CoreSearch`]: key filters
/// restrict membership, `collect_keys` fills [`CoreResponse::collected_keys`]
/// with the key values of all matching documents (not only the returned page).
#[async_trait]
pub trait CoreBackend<Q: Send + 'static>: Send + Sync {
    /// Executes a search against this core.
    async fn search(&self, search: CoreSearch<Q>) -> Result<CoreResponse, BackendError>;
}

/// A dynamically typed core backend.
pub type DynCoreBackend<Q> = Arc<dyn CoreBackend<Q>>;

/// Anything that can answer a composed query.
#[async_trait]
pub trait ComposedSearch<Q: Send + 'static>: Send + Sync {
    /// Executes `query` and returns the merged response.
    async fn execute_composed_query(&self, query: ComposedQuery<Q>)
    -> FederationResult<SearchResponse>;
}

/// The cores and join keys a composed query touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlan {
    /// The core whose hits are returned.
    pub results_core: String,

    /// Join key field per core, for every core paired with the results core.
    pub join_keys: BTreeMap<String, String>,

    /// Non-results cores whose query restricts the results core.
    pub join_queries: Vec<String>,

    /// Non-results cores with facets to compute over the joined documents.
    pub join_facets: Vec<String>,

    /// Cores of the unite entries, in order.
    pub unite_cores: Vec<String>,
}

impl JoinPlan {
    /// Derives the plan of a validated composed query.
    pub fn from_composed<Q>(query: &ComposedQuery<Q>) -> RequestResult<Self> {
        let results_core = query
            .results_from()
            .ok_or(RequestError::ResultsFromNotSet)?
            .to_string();

        let mut join_keys = BTreeMap::new();
        let mut join_queries = Vec::new();
        let mut join_facets = Vec::new();

        for core in query.cores().into_iter().skip(1) {
            let (results_key, core_key) =
                query
                    .key_names(&results_core, core)
                    .ok_or_else(|| RequestError::NoMatchForCores {
                        cores: vec![results_core.clone(), core.to_string()],
                    })?;
            join_keys
                .entry(results_core.clone())
                .or_insert_with(|| results_key.to_string());
            join_keys.insert(core.to_string(), core_key.to_string());

            let Some(core_query) = query.core_query(core) else {
                continue;
            };
            if core_query.is_constrained() {
                join_queries.push(core.to_string());
            }
            if !core_query.facets.is_empty() {
                join_facets.push(core.to_string());
            }
        }

        Ok(Self {
            results_core,
            join_keys,
            join_queries,
            join_facets,
            unite_cores: query.unites().iter().map(|u| u.core.clone()).collect(),
        })
    }

    /// Returns true if the request can be forwarded to the results core as is.
    pub fn is_pass_through(&self) -> bool {
        self.join_queries.is_empty() && self.join_facets.is_empty() && self.unite_cores.is_empty()
    }

    /// Returns every core a backend call will be made against.
    pub fn cores(&self) -> Vec<&str> {
        let mut cores = vec![self.results_core.as_str()];
        for core in self
            .join_queries
            .iter()
            .chain(&self.join_facets)
            .chain(&self.unite_cores)
        {
            if !cores.contains(&core.as_str()) {
                cores.push(core);
            }
        }
        cores
    }

    /// Returns the join key field of a core.
    pub fn key_for(&self, core: &str) -> RequestResult<&str> {
        self.join_keys
            .get(core)
            .map(String::as_str)
            .ok_or_else(|| RequestError::NoMatchForCores {
                cores: vec![self.results_core.clone(), core.to_string()],
            })
    }
}

/// Why keys are collected in phase 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collect {
    Join,
    Unite,
}

/// Key sets produced by phase 1.
#[derive(Debug, Default)]
struct CollectedKeys {
    joins: Vec<(String, KeySet)>,
    united: Option<KeySet>,
}

/// Executes composed queries across per-core backends.
pub struct JoinFederator<Q> {
    config: FederatorConfig,
    backends: HashMap<String, DynCoreBackend<Q>>,
}

impl<Q> JoinFederator<Q>
where
    Q: Clone + Send + Sync + 'static,
{
    /// Creates a federator without backends.
    pub fn new(config: FederatorConfig) -> Self {
        Self {
            config,
            backends: HashMap::new(),
        }
    }

    /// Registers the backend of a core.
    pub fn with_core(mut self, core: impl Into<String>, backend: DynCoreBackend<Q>) -> Self {
        self.register_core(core, backend);
        self
    }

    /// Registers or replaces the backend of a core.
    pub fn register_core(&mut self, core: impl Into<String>, backend: DynCoreBackend<Q>) {
        self.backends.insert(core.into(), backend);
    }

    /// Returns the configuration.
    pub fn config(&self) -> &FederatorConfig {
        &self.config
    }

    /// Returns the backend of a core.
    pub fn core(&self, core: &str) -> Option<&DynCoreBackend<Q>> {
        self.backends.get(core)
    }

    fn backend(&self, core: &str) -> RequestResult<DynCoreBackend<Q>> {
        self.backends
            .get(core)
            .cloned()
            .ok_or_else(|| RequestError::UnknownCore {
                core: core.to_string(),
            })
    }

    /// Validates and executes a composed query.
    ///
    /// Request errors are raised before any backend is called. A failing
    /// sub-search aborts the whole request.
    #[instrument(skip(self, query), fields(results_from = ?query.results_from()))]
    pub async fn execute(&self, mut query: ComposedQuery<Q>) -> FederationResult<SearchResponse> {
        let started = Instant::now();

        if query.results_from().is_none() {
            if let Some(default_core) = &self.config.default_core {
                query.set_results_from(default_core.clone());
            }
        }
        query.validate()?;

        let plan = JoinPlan::from_composed(&query)?;
        for core in plan.cores() {
            self.backend(core)?;
        }

        let mut response = if plan.is_pass_through() {
            debug!(core = %plan.results_core, "No join work, forwarding to results core");
            let search = self.results_search(&query, &plan);
            let backend = self.backend(&plan.results_core)?;
            let mut response = backend.search(search).await?;
            tag_facets(&mut response, &plan.results_core);
            SearchResponse::from(response)
        } else {
            debug!(
                results_core = %plan.results_core,
                join_queries = ?plan.join_queries,
                join_facets = ?plan.join_facets,
                unites = plan.unite_cores.len(),
                "Executing join"
            );
            self.execute_join(&query, &plan).await?
        };

        let elapsed = started.elapsed();
        response.query_time = millis(elapsed);
        if let Some(threshold) = self.config.slow_query_threshold {
            if elapsed > threshold {
                warn!(
                    results_core = %plan.results_core,
                    query_time_ms = response.query_time,
                    "Slow federated query"
                );
            }
        }

        Ok(response)
    }

    async fn execute_join(
        &self,
        query: &ComposedQuery<Q>,
        plan: &JoinPlan,
    ) -> FederationResult<SearchResponse> {
        let results_key = plan.key_for(&plan.results_core)?.to_string();

        let collected = self.collect_keys(query, plan).await?;
        let mut key_filters = Vec::new();
        for (core, keys) in collected.joins {
            debug!(core = %core, keys = keys.len(), "Collected join keys");
            key_filters.push(KeyFilter::new(results_key.clone(), Arc::new(keys)));
        }
        if let Some(united) = collected.united {
            debug!(keys = united.len(), "Collected unite keys");
            key_filters.push(KeyFilter::new(results_key.clone(), Arc::new(united)));
        }

        let mut search = self.results_search(query, plan);
        search.key_filters = key_filters;
        if !plan.join_facets.is_empty() {
            search.collect_keys = Some(results_key);
        }
        let backend = self.backend(&plan.results_core)?;
        let mut primary = backend.search(search).await?;
        tag_facets(&mut primary, &plan.results_core);

        let results_keys = match primary.collected_keys.take() {
            Some(keys) => keys,
            None if !plan.join_facets.is_empty() => {
                warn!(core = %plan.results_core, "Backend collected no keys, join facets will be empty");
                KeySet::new()
            }
            None => KeySet::new(),
        };
        debug!(total = primary.total, keys = results_keys.len(), "Results core searched");

        let facet_blocks = self
            .collect_facets(query, plan, Arc::new(results_keys))
            .await?;

        let mut response = SearchResponse::from(primary);
        if !plan.join_facets.is_empty() && response.drilldown_data.is_none() {
            response.drilldown_data = Some(Vec::new());
        }
        if let Some(drilldown_data) = response.drilldown_data.as_mut() {
            for block in facet_blocks {
                drilldown_data.extend(block);
            }
        }
        Ok(response)
    }

    /// Phase 1: collects join keys and unite keys, one task per core.
    async fn collect_keys(
        &self,
        query: &ComposedQuery<Q>,
        plan: &JoinPlan,
    ) -> FederationResult<CollectedKeys> {
        let mut per_core: BTreeMap<String, Vec<(Collect, CoreSearch<Q>)>> = BTreeMap::new();

        for core in &plan.join_queries {
            let mut search = core_search(query, core);
            search.collect_keys = Some(plan.key_for(core)?.to_string());
            per_core
                .entry(core.clone())
                .or_default()
                .push((Collect::Join, search));
        }
        for unite in query.unites() {
            let mut search = CoreSearch::new(Some(unite.query.clone()));
            search.collect_keys = Some(unite.key_name.clone());
            per_core
                .entry(unite.core.clone())
                .or_default()
                .push((Collect::Unite, search));
        }

        let mut tasks: JoinSet<(String, Result<Vec<(Collect, KeySet)>, BackendError>)> =
            JoinSet::new();
        let mut task_cores = HashMap::new();
        for (core, searches) in per_core {
            let backend = self.backend(&core)?;
            let task_core = core.clone();
            let handle = tasks.spawn(async move {
                let mut results = Vec::with_capacity(searches.len());
                for (purpose, search) in searches {
                    match backend.search(search).await {
                        Ok(response) => {
                            results.push((purpose, response.collected_keys.unwrap_or_default()))
                        }
                        Err(e) => return (core, Err(e)),
                    }
                }
                (core, Ok(results))
            });
            task_cores.insert(handle.id(), task_core);
        }

        let mut by_core = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (core, result) = joined.map_err(|err| task_failed(err, &task_cores))?;
            by_core.insert(core, result?);
        }

        let mut collected = CollectedKeys::default();
        for (core, results) in by_core {
            for (purpose, keys) in results {
                match purpose {
                    Collect::Join => collected.joins.push((core.clone(), keys)),
                    Collect::Unite => match collected.united.as_mut() {
                        Some(united) => united.union_with(&keys),
                        None => collected.united = Some(keys),
                    },
                }
            }
        }
        Ok(collected)
    }

    /// Phase 3: computes join facets, one task per core, merged in plan order.
    async fn collect_facets(
        &self,
        query: &ComposedQuery<Q>,
        plan: &JoinPlan,
        results_keys: Arc<KeySet>,
    ) -> FederationResult<Vec<Vec<FacetResult>>> {
        let mut tasks: JoinSet<(usize, String, Result<CoreResponse, BackendError>)> =
            JoinSet::new();
        let mut task_cores = HashMap::new();

        for (position, core) in plan.join_facets.iter().enumerate() {
            let mut search = core_search(query, core);
            search.key_filters = vec![KeyFilter::new(plan.key_for(core)?, results_keys.clone())];
            search.facets = query.facets_for(core).to_vec();

            let backend = self.backend(core)?;
            let task_core = core.clone();
            let handle = tasks.spawn(async move {
                let result = backend.search(search).await;
                (position, task_core, result)
            });
            task_cores.insert(handle.id(), core.clone());
        }

        let mut blocks = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (position, core, result) = joined.map_err(|err| task_failed(err, &task_cores))?;
            let mut response = result?;
            tag_facets(&mut response, &core);
            match response.drilldown_data {
                Some(data) if !data.is_empty() => {
                    blocks.insert(position, data);
                }
                _ => debug!(core = %core, "Join facet query produced no facet data"),
            }
        }
        Ok(blocks.into_values().collect())
    }

    /// The results core search: everything the request asks of that core.
    ///
    /// Sort keys naming other cores are dropped.
    fn results_search(&self, query: &ComposedQuery<Q>, plan: &JoinPlan) -> CoreSearch<Q> {
        let core = plan.results_core.as_str();
        let mut search = core_search(query, core);
        search.rank_query = query.rank_query_for(core).cloned();
        search.facets = query.facets_for(core).to_vec();
        search.options = query.options().clone();
        search
            .options
            .sort_keys
            .retain(|sort_key| sort_key.core == core);
        search
    }
}

#[async_trait]
impl<Q> ComposedSearch<Q> for JoinFederator<Q>
where
    Q: Clone + Send + Sync + 'static,
{
    async fn execute_composed_query(
        &self,
        query: ComposedQuery<Q>,
    ) -> FederationResult<SearchResponse> {
        self.execute(query).await
    }
}

/// Lowers a composed query into another query representation before
/// handing it to an inner [`ComposedSearch`].
pub struct Lowering<S, F> {
    inner: S,
    convert: F,
}

impl<S, F> Lowering<S, F> {
    /// Wraps `inner`, converting every query with `convert`.
    pub fn new(inner: S, convert: F) -> Self {
        Self { inner, convert }
    }

    /// Returns the wrapped search.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<Q, R, S, F> ComposedSearch<Q> for Lowering<S, F>
where
    Q: Send + 'static,
    R: Send + 'static,
    S: ComposedSearch<R>,
    F: Fn(Q) -> RequestResult<R> + Send + Sync,
{
    async fn execute_composed_query(
        &self,
        query: ComposedQuery<Q>,
    ) -> FederationResult<SearchResponse> {
        let lowered = query.try_convert_with(|q| (self.convert)(q))?;
        self.inner.execute_composed_query(lowered).await
    }
}

/// The query, filters and drilldowns of a core.
fn core_search<Q: Clone>(query: &ComposedQuery<Q>, core: &str) -> CoreSearch<Q> {
    let mut search = CoreSearch::new(query.query_for(core).cloned());
    search.filter_queries = query.filter_queries_for(core).to_vec();
    search.drilldown_queries = query.drilldown_queries_for(core).to_vec();
    search
}

/// Marks every facet block of a response with the core it was counted on.
fn tag_facets(response: &mut CoreResponse, core: &str) {
    for facet in response.drilldown_data.iter_mut().flatten() {
        facet.core = Some(core.to_string());
    }
}

fn task_failed(err: JoinError, task_cores: &HashMap<Id, String>) -> BackendError {
    BackendError::TaskFailed {
        core: task_cores
            .get(&err.id())
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        message: err.to_string(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
