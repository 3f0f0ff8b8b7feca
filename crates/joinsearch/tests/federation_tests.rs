//! Integration tests for join federation over in-memory cores.
//!
//! These tests run composed queries through the [`JoinFederator`] against the
//! `articles`/`authors` fixture cores and check hits, join facets and the
//! per-core execution guarantees.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use joinsearch::config::FederatorConfig;
use joinsearch::memory::MemoryCore;
use joinsearch::parser::{CqlParser, ExpressionParser};
use joinsearch::types::{CoreSearch, DrilldownQuery, FacetSort, FacetTerm, SortKey};
use joinsearch::{
    ComposedQuery, ComposedSearch, CoreBackend, FacetRequest, FederationError, JoinFederator,
    Lowering, QueryExpression, RequestError, SearchResponse,
};

fn parse(text: &str) -> QueryExpression {
    CqlParser::new().parse(text).unwrap()
}

fn terms(response: &SearchResponse, index: usize) -> Vec<(String, u64)> {
    response.drilldown_data.as_ref().unwrap()[index]
        .terms
        .iter()
        .map(|t| (t.term.clone(), t.count))
        .collect()
}

// ============================================================================
// Join Query Tests
// ============================================================================

/// Test that a query on the joined core restricts the results core.
#[tokio::test]
async fn test_join_query_restricts_results() {
    init_tracing();
    let mut cq = composed(ARTICLES);
    cq.set_core_query(AUTHORS, parse("country=NL"));
    cq.add_facet(
        ARTICLES,
        FacetRequest::new("genre", 5).with_sort(FacetSort::Count),
    );

    let response = federator().execute(cq).await.unwrap();

    assert_eq!(response.total, 3);
    assert_eq!(hit_ids(&response), vec!["a1", "a3", "a4"]);
    assert_eq!(
        terms(&response, 0),
        vec![("fantasy".to_string(), 2), ("history".to_string(), 1)]
    );
}

/// Test the join facet scenario: hits from one core, facets from the other.
#[tokio::test]
async fn test_join_facets_counted_over_joined_documents() {
    let mut cq = composed(AUTHORS);
    cq.set_core_query(AUTHORS, parse("country=NL"));
    cq.add_facet(
        ARTICLES,
        FacetRequest::new("genre", 5).with_sort(FacetSort::Count),
    );

    let response = federator().execute(cq).await.unwrap();

    assert_eq!(response.total, 2);
    assert_eq!(hit_ids(&response), vec!["p1", "p3"]);
    let facets = response.drilldown_data.as_ref().unwrap();
    assert_eq!(facets.len(), 1);
    assert_eq!(facets[0].fieldname, "genre");
    assert_eq!(
        facets[0].terms,
        vec![FacetTerm::new("fantasy", 2), FacetTerm::new("history", 1)]
    );
}

/// Test that results-core facets come before join facets.
#[tokio::test]
async fn test_results_facets_precede_join_facets() {
    let mut cq = composed(ARTICLES);
    cq.add_facet(ARTICLES, FacetRequest::new("genre", 0));
    cq.add_facet(AUTHORS, FacetRequest::new("country", 0));

    let response = federator().execute(cq).await.unwrap();

    assert_eq!(response.total, 5);
    let names: Vec<_> = response
        .drilldown_data
        .as_ref()
        .unwrap()
        .iter()
        .map(|f| f.fieldname.as_str())
        .collect();
    assert_eq!(names, vec!["genre", "country"]);
    assert_eq!(
        terms(&response, 1),
        vec![("america".to_string(), 1), ("europe".to_string(), 2)]
    );
}

/// Test that drilldown queries on the joined core act as join constraints.
#[tokio::test]
async fn test_drilldown_on_joined_core() {
    let mut cq = composed(ARTICLES);
    cq.add_drilldown_query(
        AUTHORS,
        DrilldownQuery::new("country", vec!["america".to_string()]),
    );

    let response = federator().execute(cq).await.unwrap();

    assert_eq!(hit_ids(&response), vec!["a2", "a5"]);
}

/// Test that sorting and paging apply to the results core.
#[tokio::test]
async fn test_sort_and_paging_on_results_core() {
    let mut cq = composed(ARTICLES);
    cq.set_core_query(AUTHORS, parse("country=NL OR country=US"));
    cq.add_sort_key(SortKey {
        core: ARTICLES.to_string(),
        sort_by: "year".to_string(),
        sort_descending: true,
    });
    cq.set_stop(2);

    let response = federator().execute(cq).await.unwrap();

    assert_eq!(response.total, 5);
    assert_eq!(hit_ids(&response), vec!["a5", "a4"]);
}

// ============================================================================
// Unite Tests
// ============================================================================

/// Test that unite keys from both cores are combined.
#[tokio::test]
async fn test_unite_combines_keys_of_both_cores() {
    let mut cq = composed(ARTICLES);
    cq.unite(vec![
        (ARTICLES, parse("genre=history")),
        (AUTHORS, parse("country=US")),
    ])
    .unwrap();

    let response = federator().execute(cq).await.unwrap();

    assert_eq!(response.total, 4);
    assert_eq!(hit_ids(&response), vec!["a2", "a3", "a4", "a5"]);
}

/// Test that searches against one core never overlap.
#[tokio::test]
async fn test_core_never_searched_concurrently() {
    init_tracing();
    let authors = Arc::new(Tracking::new(authors(), Duration::from_millis(20)));
    let articles = Arc::new(Tracking::new(articles(), Duration::from_millis(20)));
    let federator = JoinFederator::<QueryExpression>::new(FederatorConfig::default())
        .with_core(ARTICLES, articles.clone())
        .with_core(AUTHORS, authors.clone());

    let mut cq = composed(ARTICLES);
    cq.set_core_query(AUTHORS, parse("country=NL"));
    cq.unite(vec![
        (ARTICLES, parse("genre=history")),
        (AUTHORS, parse("country=US")),
    ])
    .unwrap();

    let response = federator.execute(cq).await.unwrap();

    assert_eq!(hit_ids(&response), vec!["a3", "a4"]);
    assert_eq!(authors.calls(), 2);
    assert_eq!(authors.max_in_flight(), 1);
    assert_eq!(articles.calls(), 2);
    assert_eq!(articles.max_in_flight(), 1);
}

/// Test that key collection on different cores runs concurrently while the
/// results search waits for it.
#[tokio::test]
async fn test_key_collection_overlaps_across_cores() {
    let shared = Arc::new(InFlight::default());
    let authors =
        Arc::new(Tracking::new(authors(), Duration::from_millis(50)).with_shared(shared.clone()));
    let articles =
        Arc::new(Tracking::new(articles(), Duration::from_millis(50)).with_shared(shared.clone()));
    let federator = JoinFederator::<QueryExpression>::new(FederatorConfig::default())
        .with_core(ARTICLES, articles.clone())
        .with_core(AUTHORS, authors.clone());

    let mut cq = composed(ARTICLES);
    cq.unite(vec![
        (ARTICLES, parse("genre=history")),
        (AUTHORS, parse("country=US")),
    ])
    .unwrap();

    let response = federator.execute(cq).await.unwrap();

    assert_eq!(hit_ids(&response), vec!["a2", "a3", "a4", "a5"]);
    assert_eq!(shared.max(), 2);
    assert_eq!(articles.calls(), 2);
    assert_eq!(articles.max_in_flight(), 1);
    assert_eq!(authors.calls(), 1);
}

// ============================================================================
// Fast Path Tests
// ============================================================================

/// Test that a request without join work equals a direct results core search.
#[tokio::test]
async fn test_fast_path_matches_direct_search() {
    let mut cq = composed(ARTICLES);
    cq.set_core_query(ARTICLES, parse("genre=fantasy"));
    cq.add_facet(ARTICLES, FacetRequest::new("genre", 10));

    let federated = federator().execute(cq).await.unwrap();

    let mut search = CoreSearch::new(Some(parse("genre=fantasy")));
    search.facets = vec![FacetRequest::new("genre", 10)];
    let mut direct = SearchResponse::from(articles().search(search).await.unwrap());
    direct.query_time = federated.query_time;
    for facet in direct.drilldown_data.iter_mut().flatten() {
        facet.core = Some(ARTICLES.to_string());
    }

    assert_eq!(federated, direct);
    assert_eq!(hit_ids(&federated), vec!["a1", "a3", "a5"]);
}

/// Test that a registered but unconstrained joined core does not join.
#[tokio::test]
async fn test_unconstrained_joined_core_is_ignored() {
    let failing_authors = JoinFederator::<QueryExpression>::new(FederatorConfig::default())
        .with_core(ARTICLES, Arc::new(articles()))
        .with_core(AUTHORS, Arc::new(Failing(AUTHORS)));

    let mut cq = composed(ARTICLES);
    cq.add(AUTHORS, None, vec![], vec![]);

    let response = failing_authors.execute(cq).await.unwrap();
    assert_eq!(response.total, 5);
}

// ============================================================================
// Error Tests
// ============================================================================

/// Test that a failing sub-search aborts the whole request.
#[tokio::test]
async fn test_backend_failure_aborts_request() {
    init_tracing();
    let articles = Arc::new(Tracking::new(articles(), Duration::ZERO));
    let federator = JoinFederator::<QueryExpression>::new(FederatorConfig::default())
        .with_core(ARTICLES, articles.clone())
        .with_core(AUTHORS, Arc::new(Failing(AUTHORS)));

    let mut cq = composed(ARTICLES);
    cq.set_core_query(AUTHORS, parse("country=NL"));

    let err = federator.execute(cq).await.unwrap_err();
    assert!(err.is_backend_failure());
    assert!(err.to_string().contains("index unavailable"));
    assert_eq!(articles.calls(), 0);
}

/// Test that requests naming unregistered cores fail before any search.
#[tokio::test]
async fn test_unknown_core_rejected() {
    let articles = Arc::new(Tracking::new(articles(), Duration::ZERO));
    let federator = JoinFederator::<QueryExpression>::new(FederatorConfig::default())
        .with_core(ARTICLES, articles.clone());

    let mut cq = composed(ARTICLES);
    cq.set_core_query(AUTHORS, parse("country=NL"));

    let err = federator.execute(cq).await.unwrap_err();
    assert!(matches!(
        err,
        FederationError::InvalidRequest(RequestError::UnknownCore { .. })
    ));
    assert_eq!(articles.calls(), 0);
}

/// Test that invalid composed queries are rejected.
#[tokio::test]
async fn test_invalid_composed_query_rejected() {
    let mut cq: ComposedQuery = ComposedQuery::new(ARTICLES);
    cq.set_core_query(AUTHORS, parse("country=NL"));

    let err = federator().execute(cq).await.unwrap_err();
    assert!(err.is_invalid_request());

    let err = federator()
        .execute(ComposedQuery::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FederationError::InvalidRequest(RequestError::UnsupportedCoreCount { count: 0, .. })
    ));
}

/// Test that the default core stands in for a missing results core.
#[tokio::test]
async fn test_default_core() {
    let federator = JoinFederator::<QueryExpression>::new(FederatorConfig {
        default_core: Some(ARTICLES.to_string()),
        slow_query_threshold: None,
    })
    .with_core(ARTICLES, Arc::new(MemoryCore::new(ARTICLES)));

    let mut cq: ComposedQuery = ComposedQuery::default();
    cq.set_core_query(ARTICLES, QueryExpression::match_all());

    let response = federator.execute(cq).await.unwrap();
    assert_eq!(response.total, 0);
}

// ============================================================================
// Lowering Tests
// ============================================================================

/// Test that textual composed queries are parsed before execution.
#[tokio::test]
async fn test_lowering_parses_text_queries() {
    let lowering = Lowering::new(federator(), |text: String| CqlParser::new().parse(&text));

    let mut cq: ComposedQuery<String> = ComposedQuery::new(ARTICLES);
    cq.add_match(&[(ARTICLES, "authorKey"), (AUTHORS, "key")])
        .unwrap();
    cq.set_core_query(AUTHORS, "country=NL".to_string());

    let response = lowering.execute_composed_query(cq).await.unwrap();
    assert_eq!(response.total, 3);

    let mut broken: ComposedQuery<String> = ComposedQuery::new(ARTICLES);
    broken.set_core_query(ARTICLES, "title=(".to_string());
    let err = lowering.execute_composed_query(broken).await.unwrap_err();
    assert!(matches!(
        err,
        FederationError::InvalidRequest(RequestError::QueryParse { .. })
    ));
}
