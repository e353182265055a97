//! Engine configuration collected from the environment (`.env` included).
//! CLI flags are applied on top by the binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::database_ops::image_index::PrefixRange;
use crate::database_ops::index_builder::BuilderConfig;
use crate::database_ops::resolver::ResolverConfig;
use crate::error::ReconcileError;
use crate::normalization::equivalence::ColorMatcher;
use crate::normalization::synonyms::SynonymTable;
use crate::util::env::{env_flag, env_list, env_opt, env_parse, preflight_check};
use crate::util::retry::RetryPolicy;

pub const DEFAULT_DB_URL: &str = "sqlite://imgmatch.db";

/// Every key read by [`EngineConfig::from_env`], for the preflight snapshot.
pub const ENV_KEYS: &[&str] = &[
    "IMGMATCH_DB_URL",
    "IMGMATCH_DB_MAX_CONNECTIONS",
    "IMGMATCH_PAGE_SIZE",
    "IMGMATCH_MIN_PREFIX_LEN",
    "IMGMATCH_MAX_PREFIX_LEN",
    "IMGMATCH_MAX_FALLBACK_IMAGES",
    "IMGMATCH_ALLOW_PREFIX_ANY",
    "IMGMATCH_PREFIX_ANY_EXCLUSIONS",
    "IMGMATCH_PARSE_WORKERS",
    "IMGMATCH_STORE_RETRIES",
    "IMGMATCH_STORE_RETRY_BASE_MS",
    "IMGMATCH_SYNONYM_TABLE",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    pub db_url: String,
    pub db_max_connections: u32,
    pub page_size: usize,
    pub min_prefix_len: usize,
    pub max_prefix_len: usize,
    pub max_fallback_images: usize,
    pub allow_prefix_any: bool,
    pub prefix_any_exclusions: Vec<String>,
    pub parse_workers: usize,
    pub store_retries: u32,
    pub store_retry_base_ms: u64,
    /// JSON synonym artifact; the built-in table when unset.
    pub synonym_table: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let prefix = PrefixRange::default();
        Self {
            db_url: DEFAULT_DB_URL.to_string(),
            db_max_connections: 4,
            page_size: BuilderConfig::default().page_size,
            min_prefix_len: prefix.min,
            max_prefix_len: prefix.max,
            max_fallback_images: ResolverConfig::default().max_fallback_images,
            allow_prefix_any: true,
            prefix_any_exclusions: Vec::new(),
            parse_workers: 0,
            store_retries: RetryPolicy::default().attempts,
            store_retry_base_ms: RetryPolicy::default().base_delay.as_millis() as u64,
            synonym_table: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ReconcileError> {
        let cfg = Self::from_env_unvalidated();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Env values as read, for callers that layer overrides before calling [`Self::validate`].
    pub fn from_env_unvalidated() -> Self {
        let d = Self::default();
        Self {
            db_url: env_opt("IMGMATCH_DB_URL").unwrap_or(d.db_url),
            db_max_connections: env_parse("IMGMATCH_DB_MAX_CONNECTIONS", d.db_max_connections),
            page_size: env_parse("IMGMATCH_PAGE_SIZE", d.page_size),
            min_prefix_len: env_parse("IMGMATCH_MIN_PREFIX_LEN", d.min_prefix_len),
            max_prefix_len: env_parse("IMGMATCH_MAX_PREFIX_LEN", d.max_prefix_len),
            max_fallback_images: env_parse("IMGMATCH_MAX_FALLBACK_IMAGES", d.max_fallback_images),
            allow_prefix_any: env_flag("IMGMATCH_ALLOW_PREFIX_ANY", d.allow_prefix_any),
            prefix_any_exclusions: env_list("IMGMATCH_PREFIX_ANY_EXCLUSIONS"),
            parse_workers: env_parse("IMGMATCH_PARSE_WORKERS", d.parse_workers),
            store_retries: env_parse("IMGMATCH_STORE_RETRIES", d.store_retries),
            store_retry_base_ms: env_parse("IMGMATCH_STORE_RETRY_BASE_MS", d.store_retry_base_ms),
            synonym_table: env_opt("IMGMATCH_SYNONYM_TABLE").map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        self.prefix_range()?;
        if self.page_size == 0 {
            return Err(ReconcileError::Config("IMGMATCH_PAGE_SIZE must be positive".into()));
        }
        if self.max_fallback_images == 0 {
            return Err(ReconcileError::Config(
                "IMGMATCH_MAX_FALLBACK_IMAGES must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn prefix_range(&self) -> Result<PrefixRange, ReconcileError> {
        PrefixRange::new(self.min_prefix_len, self.max_prefix_len)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.store_retries.max(1),
            base_delay: Duration::from_millis(self.store_retry_base_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            page_size: self.page_size,
            parse_workers: self.parse_workers,
            retry: self.retry_policy(),
        }
    }

    pub fn resolver_config(&self) -> Result<ResolverConfig, ReconcileError> {
        Ok(ResolverConfig {
            prefix: self.prefix_range()?,
            max_fallback_images: self.max_fallback_images,
            allow_prefix_any: self.allow_prefix_any,
            prefix_any_exclusions: self
                .prefix_any_exclusions
                .iter()
                .map(|p| p.trim().to_uppercase())
                .filter(|p| !p.is_empty())
                .collect(),
        })
    }

    /// Load the synonym table once for the run.
    pub fn load_synonyms(&self) -> Result<Arc<SynonymTable>> {
        let table = match &self.synonym_table {
            Some(path) => SynonymTable::from_path(path)
                .with_context(|| format!("loading synonyms from {}", path.display()))?,
            None => SynonymTable::with_defaults(),
        };
        info!(
            target = "config",
            version = table.version(),
            entries = table.len(),
            "synonym table loaded"
        );
        Ok(Arc::new(table))
    }

    pub fn matcher(&self) -> Result<ColorMatcher> {
        Ok(ColorMatcher::new(self.load_synonyms()?))
    }

    /// Log a redacted view of the environment this run sees.
    pub fn log_snapshot(title: &str) -> Result<()> {
        preflight_check(title, &[], ENV_KEYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_follow_component_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.db_url, DEFAULT_DB_URL);
        assert_eq!(cfg.prefix_range().unwrap(), PrefixRange { min: 5, max: 7 });
        assert_eq!(cfg.resolver_config().unwrap(), ResolverConfig::default());
        assert_eq!(cfg.builder_config().page_size, 500);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn reads_overrides_from_env() {
        // the only test in the crate that touches IMGMATCH_* variables
        std::env::set_var("IMGMATCH_MIN_PREFIX_LEN", "4");
        std::env::set_var("IMGMATCH_ALLOW_PREFIX_ANY", "off");
        std::env::set_var("IMGMATCH_PREFIX_ANY_EXCLUSIONS", "hb, pd");
        let cfg = EngineConfig::from_env().unwrap();
        std::env::remove_var("IMGMATCH_MIN_PREFIX_LEN");
        std::env::remove_var("IMGMATCH_ALLOW_PREFIX_ANY");
        std::env::remove_var("IMGMATCH_PREFIX_ANY_EXCLUSIONS");

        assert_eq!(cfg.min_prefix_len, 4);
        assert!(!cfg.allow_prefix_any);
        let resolver = cfg.resolver_config().unwrap();
        assert_eq!(resolver.prefix_any_exclusions, vec!["HB", "PD"]);
        assert!(!resolver.prefix_any_allowed_for("ZZ1234"));
    }

    #[test]
    fn inverted_prefix_range_is_rejected() {
        let cfg = EngineConfig {
            min_prefix_len: 8,
            max_prefix_len: 6,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ReconcileError::Config(_))));
    }

    #[test]
    fn retries_never_drop_below_one_attempt() {
        let cfg = EngineConfig {
            store_retries: 0,
            store_retry_base_ms: 50,
            ..EngineConfig::default()
        };
        let policy = cfg.retry_policy();
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(50));
    }

    #[test]
    fn synonym_artifact_replaces_builtin_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"version":"brand-x-3","entries":{{"ZW":"BLACK"}}}}"#).unwrap();
        let cfg = EngineConfig {
            synonym_table: Some(file.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let matcher = cfg.matcher().unwrap();
        assert_eq!(matcher.synonyms().version(), "brand-x-3");
        assert!(matcher.equivalent("ZW", "BLACK"));
        assert!(!matcher.equivalent("BLO", "BLACK"));
    }
}
