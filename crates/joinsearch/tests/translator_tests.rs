//! End-to-end tests for request translation.
//!
//! Requests go through the [`ComposedQueryTranslator`], the join federator
//! and the in-memory fixture cores.

mod common;

use common::*;
use joinsearch::config::TranslatorConfig;
use joinsearch::translator::{
    ComposedQueryTranslator, SearchRequest, X_FILTER, X_GROUPING, X_RANK_QUERY,
};
use joinsearch::types::FacetTerm;
use joinsearch::{JoinFederator, QueryExpression, SearchResponse};

type Translator = ComposedQueryTranslator<JoinFederator<QueryExpression>>;

fn translator() -> Translator {
    ComposedQueryTranslator::new(translator_config(), federator()).unwrap()
}

fn facet_names(response: &SearchResponse) -> Vec<&str> {
    response
        .drilldown_data
        .as_ref()
        .unwrap()
        .iter()
        .map(|f| f.fieldname.as_str())
        .collect()
}

// ============================================================================
// Cross-Core Query Tests
// ============================================================================

/// Test that prefixed clauses in the query restrict through the join.
#[tokio::test]
async fn test_prefixed_query_clause_joins() {
    let response = translator()
        .execute_query(SearchRequest::new("authors.country=NL"))
        .await
        .unwrap();

    assert_eq!(response.total, 3);
    assert_eq!(hit_ids(&response), vec!["a1", "a3", "a4"]);
}

/// Test that combined results-core and prefixed clauses both apply.
#[tokio::test]
async fn test_mixed_query_clauses() {
    let response = translator()
        .execute_query(SearchRequest::new("genre=fantasy AND authors.country=NL"))
        .await
        .unwrap();

    assert_eq!(hit_ids(&response), vec!["a1", "a3"]);
}

/// Test filters from extra arguments and explicit filter queries.
#[tokio::test]
async fn test_filters() {
    let request = SearchRequest::new("*")
        .with_extra(X_FILTER, "authors.country=US")
        .with_filter_query("articles", "year>2000");

    let response = translator().execute_query(request).await.unwrap();

    assert_eq!(hit_ids(&response), vec!["a5"]);
}

/// Test drilldown queries addressed to the joined core.
#[tokio::test]
async fn test_drilldown_on_joined_core() {
    let request = SearchRequest::new("*")
        .with_drilldown("authors.country", vec!["america".to_string()]);

    let response = translator().execute_query(request).await.unwrap();

    assert_eq!(hit_ids(&response), vec!["a2", "a5"]);
}

/// Test sort keys and paging.
#[tokio::test]
async fn test_sort_keys_and_paging() {
    let mut request = SearchRequest::new("genre=fantasy").with_sort_key("year", true);
    request.start = Some(1);

    let response = translator().execute_query(request).await.unwrap();

    assert_eq!(response.total, 3);
    assert_eq!(hit_ids(&response), vec!["a3", "a1"]);
}

/// Test that rank queries reorder without filtering.
#[tokio::test]
async fn test_rank_query_boosts() {
    let request = SearchRequest::new("*").with_extra(X_RANK_QUERY, "genre=history");

    let response = translator().execute_query(request).await.unwrap();

    assert_eq!(response.total, 5);
    assert_eq!(response.hits[0].id, "a4");
}

// ============================================================================
// Facet Tests
// ============================================================================

/// Test that facets come back in request order under caller-facing names.
#[tokio::test]
async fn test_facets_in_request_order() {
    let request = SearchRequest::new("authors.country=NL")
        .with_facet("authors.country>europe", 10)
        .with_facet("genre", 10);

    let response = translator().execute_query(request).await.unwrap();

    assert_eq!(facet_names(&response), vec!["authors.country", "genre"]);
    let facets = response.drilldown_data.as_ref().unwrap();
    assert_eq!(facets[0].path, vec!["europe"]);
    assert_eq!(facets[0].terms[0].term, "NL");
    assert_eq!(facets[0].terms[0].count, 2);
    assert_eq!(facets[1].terms.len(), 2);
}

/// Test that same-named facets on different cores keep their own names.
#[tokio::test]
async fn test_same_facet_name_on_both_cores() {
    let request = SearchRequest::new("authors.country=NL")
        .with_facet("country", 10)
        .with_facet("authors.country", 10);

    let response = translator().execute_query(request).await.unwrap();

    assert_eq!(facet_names(&response), vec!["country", "authors.country"]);
    let facets = response.drilldown_data.as_ref().unwrap();
    assert_eq!(facets[0].core.as_deref(), Some(ARTICLES));
    assert_eq!(
        facets[0].terms,
        vec![FacetTerm::new("NL", 1), FacetTerm::new("UK", 2)]
    );
    assert_eq!(facets[1].core.as_deref(), Some(AUTHORS));
    assert_eq!(facets[1].terms, vec![FacetTerm::new("europe", 2)]);
}

/// Test that translated facet names are mapped back.
#[tokio::test]
async fn test_facet_field_translation() {
    let translator = translator().with_field_translation(|name| match name {
        "kind" => "genre".to_string(),
        other => other.to_string(),
    });
    let request = SearchRequest::new("*")
        .with_facet("kind", 10)
        .with_drilldown("kind", vec!["scifi".to_string()]);

    let response = translator.execute_query(request).await.unwrap();

    assert_eq!(hit_ids(&response), vec!["a2"]);
    assert_eq!(facet_names(&response), vec!["kind"]);
}

/// Test that an unsupported facet ordering is rejected.
#[tokio::test]
async fn test_unsupported_facet_sort_rejected() {
    let mut request = SearchRequest::new("*").with_facet("genre", 10);
    request.facets[0].sort_by = Some("alphabetical".to_string());

    let err = translator().execute_query(request).await.unwrap_err();

    assert!(err.is_invalid_request());
}

// ============================================================================
// Grouping Tests
// ============================================================================

/// Test that grouping is skipped for the match-all query.
#[test]
fn test_grouping_skipped_for_match_all() {
    let config = TranslatorConfig::builder(ARTICLES)
        .grouping_field("workId")
        .build()
        .unwrap();
    let translator = ComposedQueryTranslator::new(config, federator()).unwrap();

    let grouped = |query: &str| {
        translator
            .compose(&SearchRequest::new(query).with_extra(X_GROUPING, "true"))
            .unwrap()
            .query
            .options()
            .grouping_field
            .clone()
    };

    assert_eq!(grouped("*"), None);
    assert_eq!(grouped("genre=fantasy"), Some("workId".to_string()));
}

/// Test that an expression request behaves like its text form.
#[tokio::test]
async fn test_expression_request() {
    let text = translator()
        .execute_query(SearchRequest::new("genre=scifi"))
        .await
        .unwrap();
    let expression = translator()
        .execute_query(SearchRequest::new(QueryExpression::field("genre", "scifi")))
        .await
        .unwrap();

    assert_eq!(hit_ids(&text), hit_ids(&expression));
}
