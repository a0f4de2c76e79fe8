//! Cache configuration.
//!
//! Resolved from the `[cache]` table of `pagecache.toml`, with an optional
//! `settings.json` sidecar in the body directory overriding the duration.

use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

pub const DEFAULT_CACHE_DURATION_SECS: u64 = 3600;
pub const SIDECAR_FILE_NAME: &str = "settings.json";
const DEFAULT_DIRECTORY: &str = "storage/runtime/pagecache";
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;

/// Cache configuration handed to the gate and the interceptor.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch. When false nothing is read or written.
    pub enabled: bool,
    /// Keep caching while the host runs in dev mode or is switched off.
    pub force_on: bool,
    /// Maximum body age before a hit is treated as expired.
    pub cache_duration: NonZeroU64,
    /// Directory holding body files and the sidecar settings file.
    pub directory: PathBuf,
    /// Cadence of the background event consumer.
    pub auto_consume_interval_ms: u64,
    /// Maximum events drained per consumption batch.
    pub consume_batch_limit: usize,
    /// Cadence of the expired/orphaned body sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_on: false,
            cache_duration: default_duration(),
            directory: PathBuf::from(DEFAULT_DIRECTORY),
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            sweep_interval: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            force_on: settings.force_on,
            cache_duration: settings.duration,
            directory: settings.directory.clone(),
            auto_consume_interval_ms: settings.auto_consume_interval_ms,
            consume_batch_limit: settings.consume_batch_limit,
            sweep_interval: settings.sweep_interval,
        }
    }
}

impl CacheConfig {
    /// Duration in effect for the next lookup: the sidecar value when present
    /// and valid, the configured duration otherwise.
    pub async fn effective_duration(&self) -> NonZeroU64 {
        SidecarSettings::load(&self.directory)
            .await
            .and_then(|sidecar| sidecar.cache_duration())
            .unwrap_or(self.cache_duration)
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.directory.join(SIDECAR_FILE_NAME)
    }
}

fn default_duration() -> NonZeroU64 {
    NonZeroU64::new(DEFAULT_CACHE_DURATION_SECS).unwrap_or(NonZeroU64::MIN)
}

/// Out-of-band overrides kept next to the cached bodies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSettings {
    pub cache_duration: Option<u64>,
}

impl SidecarSettings {
    /// Read `settings.json` from `directory`. A missing file is not an error;
    /// an unreadable or malformed one is logged and ignored.
    pub async fn load(directory: &Path) -> Option<Self> {
        let path = directory.join(SIDECAR_FILE_NAME);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read cache sidecar settings");
                return None;
            }
        };

        match serde_json::from_slice::<Self>(&raw) {
            Ok(settings) => Some(settings),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring malformed cache sidecar settings");
                None
            }
        }
    }

    /// The overriding duration, when it is a positive number of seconds.
    pub fn cache_duration(&self) -> Option<NonZeroU64> {
        let value = self.cache_duration?;
        let duration = NonZeroU64::new(value);
        if duration.is_none() {
            debug!("ignoring zero cacheDuration in sidecar settings");
        }
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert!(!config.force_on);
        assert_eq!(config.cache_duration.get(), 3600);
        assert_eq!(config.consume_batch_limit, 100);
        assert!(config.sweep_interval.is_none());
    }

    #[tokio::test]
    async fn effective_duration_without_sidecar_uses_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CacheConfig {
            directory: dir.path().to_path_buf(),
            cache_duration: NonZeroU64::new(120).expect("non-zero"),
            ..Default::default()
        };
        assert_eq!(config.effective_duration().await.get(), 120);
    }

    #[tokio::test]
    async fn sidecar_overrides_duration() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(SIDECAR_FILE_NAME), r#"{"cacheDuration": 60}"#)
            .expect("write sidecar");
        let config = CacheConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert_eq!(config.effective_duration().await.get(), 60);
    }

    #[tokio::test]
    async fn malformed_or_zero_sidecar_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CacheConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        };

        std::fs::write(config.sidecar_path(), "not json").expect("write sidecar");
        assert_eq!(config.effective_duration().await.get(), 3600);

        std::fs::write(config.sidecar_path(), r#"{"cacheDuration": 0}"#).expect("write sidecar");
        assert_eq!(config.effective_duration().await.get(), 3600);
    }
}
