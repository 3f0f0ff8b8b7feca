//! Helios Join Search
//!
//! This crate composes search requests that span several independently indexed
//! cores and federates their execution, joining cores on declared key fields.
//!
//! # Features
//!
//! - **Composed queries**: per-core queries, filters, facets, drilldowns and
//!   rank queries, with symmetric join-key declarations between cores
//! - **Join federation**: two-phase key collection with parallel per-core
//!   sub-searches and join facets merged into one response
//! - **Request translation**: core-prefixed fields, facet paths and extra
//!   arguments mapped onto a composed query and back
//! - **In-memory backend**: a complete [`CoreBackend`] for tests and local use
//!
//! # Architecture
//!
//! - [`composed`] - The [`ComposedQuery`] request model
//! - [`translator`] - Caller-facing requests to composed queries
//! - [`federator`] - Join execution across [`CoreBackend`]s
//! - [`memory`] - In-memory core backend
//! - [`expression`] / [`parser`] - Query expressions and the CQL parser
//! - [`extract`] - Extraction of filters targeting other cores
//! - [`types`] - Facets, key sets, hits and responses
//! - [`config`] - Translator and federator configuration
//! - [`error`] - Error types for all operations
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use joinsearch::QueryExpression;
//! use joinsearch::config::{FederatorConfig, MatchDeclaration, TranslatorConfig};
//! use joinsearch::federator::JoinFederator;
//! use joinsearch::memory::{Document, MemoryCore};
//! use joinsearch::translator::{ComposedQueryTranslator, SearchRequest};
//!
//! # tokio_test::block_on(async {
//! let articles = MemoryCore::with_documents(
//!     "articles",
//!     vec![Document::new("a1").field("authorKey", "1").facet("genre", &["fantasy"])],
//! );
//! let authors = MemoryCore::with_documents(
//!     "authors",
//!     vec![Document::new("p1").field("key", "1").field("country", "NL")],
//! );
//!
//! let federator = JoinFederator::<QueryExpression>::new(FederatorConfig::default())
//!     .with_core("articles", Arc::new(articles))
//!     .with_core("authors", Arc::new(authors));
//!
//! let config = TranslatorConfig::builder("articles")
//!     .with_match(MatchDeclaration::new("articles", "authorKey", "authors", "key"))
//!     .build()
//!     .unwrap();
//! let translator = ComposedQueryTranslator::new(config, federator).unwrap();
//!
//! let response = translator
//!     .execute_query(SearchRequest::new("authors.country=NL").with_facet("genre", 5))
//!     .await
//!     .unwrap();
//! assert_eq!(response.total, 1);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod composed;
pub mod config;
pub mod error;
pub mod expression;
pub mod extract;
pub mod federator;
pub mod memory;
pub mod parser;
pub mod translator;
pub mod types;

// Re-export commonly used types at crate root
pub use composed::{ComposedQuery, CoreQuery, MAX_CORES, Unite};
pub use error::{BackendError, FederationError, FederationResult, RequestError, RequestResult};
pub use expression::QueryExpression;
pub use types::{FacetRequest, FacetResult, KeySet, SearchResponse};

// Re-export federation traits
pub use federator::{ComposedSearch, CoreBackend, JoinFederator, JoinPlan, Lowering};
pub use translator::{ComposedQueryTranslator, SearchRequest};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
