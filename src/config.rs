//! Pipeline Configuration
//!
//! Defaults, overridden by an optional YAML file, overridden by `TAXFORM_*`
//! environment variables, then validated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::ClassifierConfig;
use crate::resolver::TieBreakRule;
use crate::scoring::ScoringConfig;
use crate::submission::RetryPolicy;
use crate::validator::ValidatorConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: '{value}'")]
    Env { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub classifier: ClassifierConfig,
    pub validator: ValidatorConfig,
    pub scoring: ScoringConfig,
    pub retry: RetryPolicy,
    /// Tie-break order for fields with several candidates
    pub resolver_rules: Vec<TieBreakRule>,
    /// Per-stage limit on external collaborator calls
    pub stage_timeout_ms: u64,
    /// Documents processed concurrently in a batch
    pub max_concurrency: usize,
    /// Batch workers submit eligible records after processing
    pub auto_submit: bool,
    /// Return a stored terminal record for an identical document instead of reprocessing
    pub reuse_terminal_records: bool,
    /// YAML schema file replacing the built-in schemas
    pub schema_path: Option<PathBuf>,
    /// Base URL of the e-filing endpoint
    pub submission_endpoint: Option<String>,
    /// Sent as `Authorization: Bearer` to the e-filing endpoint
    pub submission_api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            validator: ValidatorConfig::default(),
            scoring: ScoringConfig::default(),
            retry: RetryPolicy::default(),
            resolver_rules: TieBreakRule::DEFAULT_ORDER.to_vec(),
            stage_timeout_ms: 30_000,
            max_concurrency: 4,
            auto_submit: false,
            reuse_terminal_records: false,
            schema_path: None,
            submission_endpoint: None,
            submission_api_key: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Defaults or file, then environment, then validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml_str(&yaml)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TAXFORM_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env {
                    name: name.to_string(),
                    value,
                })
        }

        macro_rules! env_override {
            ($name:literal => $target:expr) => {
                if let Some(value) = lookup($name) {
                    $target = parse($name, value)?;
                }
            };
        }

        env_override!("TAXFORM_STAGE_TIMEOUT_MS" => self.stage_timeout_ms);
        env_override!("TAXFORM_MAX_CONCURRENCY" => self.max_concurrency);
        env_override!("TAXFORM_AUTO_SUBMIT" => self.auto_submit);
        env_override!("TAXFORM_REUSE_RECORDS" => self.reuse_terminal_records);
        env_override!("TAXFORM_MIN_SCHEMA_SCORE" => self.classifier.min_score);
        env_override!("TAXFORM_LOW_CONFIDENCE_THRESHOLD" => self.validator.low_confidence_threshold);
        env_override!("TAXFORM_HIGH_CONFIDENCE_THRESHOLD" => self.scoring.high_confidence_threshold);
        env_override!("TAXFORM_MAX_ATTEMPTS" => self.retry.max_attempts);
        env_override!("TAXFORM_INITIAL_BACKOFF_MS" => self.retry.initial_backoff_ms);
        env_override!("TAXFORM_MAX_BACKOFF_MS" => self.retry.max_backoff_ms);
        env_override!("TAXFORM_SEND_TIMEOUT_MS" => self.retry.send_timeout_ms);

        if let Some(endpoint) = lookup("TAXFORM_SUBMISSION_ENDPOINT") {
            self.submission_endpoint = Some(endpoint);
        }
        if let Some(key) = lookup("TAXFORM_SUBMISSION_API_KEY").filter(|k| !k.is_empty()) {
            self.submission_api_key = Some(key);
        }
        if let Some(path) = lookup("TAXFORM_SCHEMA_PATH") {
            self.schema_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scoring.validate()?;
        self.retry.validate()?;

        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.stage_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "stage_timeout_ms must be positive".to_string(),
            ));
        }
        if self.classifier.min_score < 0.0 || self.classifier.hint_tolerance < 0.0 {
            return Err(ConfigError::Invalid(
                "classifier.min_score and classifier.hint_tolerance must be non-negative"
                    .to_string(),
            ));
        }
        if self.classifier.occurrence_cap == 0 {
            return Err(ConfigError::Invalid(
                "classifier.occurrence_cap must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.validator.low_confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "validator.low_confidence_threshold must be within [0, 1], got {}",
                self.validator.low_confidence_threshold
            )));
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}
