//! Configuration types for the translator and the federator.
//!
//! - [`TranslatorConfig`] - results core, match declarations, dedup and
//!   grouping fields
//! - [`RuntimeConfig`] - feature switches that may change while serving
//! - [`FederatorConfig`] - default core and slow query threshold
//!
//! # Example
//!
//! ```
//! use joinsearch::config::{MatchDeclaration, TranslatorConfig};
//!
//! let config = TranslatorConfig::builder("articles")
//!     .with_match(MatchDeclaration::new("articles", "authorKey", "authors", "key"))
//!     .dedup("isbn", Some("date"))
//!     .grouping_field("workId")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.cores(), vec!["articles", "authors"]);
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::composed::MAX_CORES;

/// Runtime feature name that disables grouping.
pub const FEATURE_GROUPING: &str = "grouping";

/// Runtime feature name that disables clustering.
pub const FEATURE_CLUSTERING: &str = "clustering";

/// One side of a match declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreKey {
    /// The core.
    pub core: String,
    /// The join key field on that core.
    pub key: String,
}

/// A declared join between two cores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchDeclaration(pub Vec<CoreKey>);

impl MatchDeclaration {
    /// Declares `core_a.key_a = core_b.key_b`.
    pub fn new(
        core_a: impl Into<String>,
        key_a: impl Into<String>,
        core_b: impl Into<String>,
        key_b: impl Into<String>,
    ) -> Self {
        Self(vec![
            CoreKey {
                core: core_a.into(),
                key: key_a.into(),
            },
            CoreKey {
                core: core_b.into(),
                key: key_b.into(),
            },
        ])
    }

    /// Returns the declaration as `(core, key)` pairs.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.0
            .iter()
            .map(|ck| (ck.core.as_str(), ck.key.as_str()))
            .collect()
    }
}

fn default_true() -> bool {
    true
}

/// Construction-time configuration of the translator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Core whose hits are returned.
    pub results_from: String,

    /// Join declarations added to every composed query.
    #[serde(default)]
    pub matches: Vec<MatchDeclaration>,

    /// Field used to collapse duplicate hits.
    #[serde(default)]
    pub dedup_field_name: Option<String>,

    /// Field deciding which duplicate survives.
    #[serde(default)]
    pub dedup_sort_field_name: Option<String>,

    /// Whether dedup applies when the caller does not say.
    #[serde(default = "default_true")]
    pub dedup_by_default: bool,

    /// Field hits are grouped by.
    #[serde(default)]
    pub grouping_field_name: Option<String>,
}

impl TranslatorConfig {
    /// Creates a builder for a translator returning hits from `results_from`.
    pub fn builder(results_from: impl Into<String>) -> TranslatorConfigBuilder {
        TranslatorConfigBuilder::new(results_from)
    }

    /// Returns every core named by a match declaration, plus the results core.
    pub fn cores(&self) -> Vec<&str> {
        let mut cores: BTreeSet<&str> = self
            .matches
            .iter()
            .flat_map(|m| m.0.iter().map(|ck| ck.core.as_str()))
            .collect();
        cores.insert(self.results_from.as_str());
        cores.into_iter().collect()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.results_from.is_empty() {
            return Err(ConfigError::MissingResultsCore);
        }
        for (index, declaration) in self.matches.iter().enumerate() {
            let distinct: BTreeSet<&str> =
                declaration.0.iter().map(|ck| ck.core.as_str()).collect();
            if declaration.0.len() != MAX_CORES || distinct.len() != MAX_CORES {
                return Err(ConfigError::InvalidMatch {
                    index,
                    message: format!("expected {} distinct cores", MAX_CORES),
                });
            }
            if let Some(ck) = declaration.0.iter().find(|ck| ck.key.is_empty()) {
                return Err(ConfigError::InvalidMatch {
                    index,
                    message: format!("empty key for core '{}'", ck.core),
                });
            }
        }
        Ok(())
    }
}

/// Builder for [`TranslatorConfig`].
#[derive(Debug)]
pub struct TranslatorConfigBuilder {
    config: TranslatorConfig,
}

impl TranslatorConfigBuilder {
    /// Creates a builder.
    pub fn new(results_from: impl Into<String>) -> Self {
        Self {
            config: TranslatorConfig {
                results_from: results_from.into(),
                matches: Vec::new(),
                dedup_field_name: None,
                dedup_sort_field_name: None,
                dedup_by_default: true,
                grouping_field_name: None,
            },
        }
    }

    /// Adds a match declaration.
    pub fn with_match(mut self, declaration: MatchDeclaration) -> Self {
        self.config.matches.push(declaration);
        self
    }

    /// Configures deduplication.
    pub fn dedup(mut self, field: impl Into<String>, sort_field: Option<&str>) -> Self {
        self.config.dedup_field_name = Some(field.into());
        self.config.dedup_sort_field_name = sort_field.map(str::to_string);
        self
    }

    /// Sets whether dedup applies when the caller does not say.
    pub fn dedup_by_default(mut self, enabled: bool) -> Self {
        self.config.dedup_by_default = enabled;
        self
    }

    /// Configures grouping.
    pub fn grouping_field(mut self, field: impl Into<String>) -> Self {
        self.config.grouping_field_name = Some(field.into());
        self
    }

    /// Builds the configuration, validating it first.
    pub fn build(self) -> Result<TranslatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Feature switches that may change while serving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Names of disabled features (`"grouping"`, `"clustering"`).
    #[serde(default)]
    pub features_disabled: Vec<String>,
}

impl RuntimeConfig {
    /// Returns true unless `feature` is listed as disabled.
    pub fn is_enabled(&self, feature: &str) -> bool {
        !self.features_disabled.iter().any(|f| f == feature)
    }
}

/// Configuration of the join federator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatorConfig {
    /// Core used when a composed query carries no results core.
    #[serde(default)]
    pub default_core: Option<String>,

    /// Requests slower than this are logged at warn level; `null` disables.
    #[serde(
        default = "default_slow_query_threshold",
        with = "humantime_serde_opt"
    )]
    pub slow_query_threshold: Option<Duration>,
}

fn default_slow_query_threshold() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

impl Default for FederatorConfig {
    fn default() -> Self {
        Self {
            default_core: None,
            slow_query_threshold: default_slow_query_threshold(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The results core is empty.
    #[error("no results core configured")]
    MissingResultsCore,

    /// A match declaration is malformed.
    #[error("match declaration {index} is invalid: {message}")]
    InvalidMatch {
        /// Position of the declaration.
        index: usize,
        /// What is wrong with it.
        message: String,
    },
}

/// Serde module for optional Durations in humantime format.
mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
