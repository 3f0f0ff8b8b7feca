//! Shared fixtures for the join search integration tests.
//!
//! Two cores are used throughout: `articles`, joined on `authorKey`, and
//! `authors`, joined on `key`.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use joinsearch::config::{FederatorConfig, MatchDeclaration, TranslatorConfig};
use joinsearch::memory::{Document, MemoryCore};
use joinsearch::types::{CoreResponse, CoreSearch};
use joinsearch::{BackendError, ComposedQuery, CoreBackend, JoinFederator, QueryExpression};

/// The results core of the fixtures.
pub const ARTICLES: &str = "articles";

/// The joined core of the fixtures.
pub const AUTHORS: &str = "authors";

/// Articles: (id, authorKey, genre, year, country of publication).
pub fn articles() -> MemoryCore {
    let rows = [
        ("a1", "1", "fantasy", "1937", "UK"),
        ("a2", "2", "scifi", "1965", "US"),
        ("a3", "3", "fantasy", "1977", "UK"),
        ("a4", "3", "history", "1990", "NL"),
        ("a5", "2", "fantasy", "2001", "US"),
    ];
    MemoryCore::with_documents(
        ARTICLES,
        rows.iter()
            .map(|(id, author, genre, year, published)| {
                Document::new(*id)
                    .field("authorKey", *author)
                    .field("genre", *genre)
                    .field("year", *year)
                    .facet("genre", &[*genre])
                    .facet("country", &[*published])
            })
            .collect(),
    )
}

/// Authors: (id, key, country, continent).
pub fn authors() -> MemoryCore {
    let rows = [
        ("p1", "1", "NL", "europe"),
        ("p2", "2", "US", "america"),
        ("p3", "3", "NL", "europe"),
    ];
    MemoryCore::with_documents(
        AUTHORS,
        rows.iter()
            .map(|(id, key, country, continent)| {
                Document::new(*id)
                    .field("key", *key)
                    .field("country", *country)
                    .facet("country", &[*continent, *country])
            })
            .collect(),
    )
}

/// A federator over the fixture cores.
pub fn federator() -> JoinFederator<QueryExpression> {
    JoinFederator::<QueryExpression>::new(FederatorConfig::default())
        .with_core(ARTICLES, Arc::new(articles()))
        .with_core(AUTHORS, Arc::new(authors()))
}

/// A composed query with the fixture match declared.
pub fn composed(results_from: &str) -> ComposedQuery {
    let mut cq = ComposedQuery::new(results_from);
    cq.add_match(&[(ARTICLES, "authorKey"), (AUTHORS, "key")])
        .expect("valid match");
    cq
}

/// Translator configuration over the fixture cores.
pub fn translator_config() -> TranslatorConfig {
    TranslatorConfig::builder(ARTICLES)
        .with_match(MatchDeclaration::new(ARTICLES, "authorKey", AUTHORS, "key"))
        .build()
        .expect("valid config")
}

/// Counts searches running at once and the highest count seen.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Wraps a backend, recording how many searches ran on it at once.
pub struct Tracking<B> {
    inner: B,
    delay: Duration,
    in_flight: InFlight,
    shared: Option<Arc<InFlight>>,
    calls: AtomicUsize,
}

impl<B> Tracking<B> {
    pub fn new(inner: B, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: InFlight::default(),
            shared: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Also counts searches in a counter shared with other backends.
    pub fn with_shared(mut self, shared: Arc<InFlight>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<B> CoreBackend<QueryExpression> for Tracking<B>
where
    B: CoreBackend<QueryExpression>,
{
    async fn search(
        &self,
        search: CoreSearch<QueryExpression>,
    ) -> Result<CoreResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.enter();
        if let Some(shared) = &self.shared {
            shared.enter();
        }
        tokio::time::sleep(self.delay).await;
        let result = self.inner.search(search).await;
        if let Some(shared) = &self.shared {
            shared.leave();
        }
        self.in_flight.leave();
        result
    }
}

/// A backend that always fails.
pub struct Failing(pub &'static str);

#[async_trait]
impl CoreBackend<QueryExpression> for Failing {
    async fn search(
        &self,
        _search: CoreSearch<QueryExpression>,
    ) -> Result<CoreResponse, BackendError> {
        Err(BackendError::search_failed(self.0, "index unavailable"))
    }
}

/// Installs a test subscriber honouring `RUST_LOG`; repeated calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

/// Returns the hit ids of a response.
pub fn hit_ids(response: &joinsearch::SearchResponse) -> Vec<&str> {
    response.hits.iter().map(|hit| hit.id.as_str()).collect()
}
