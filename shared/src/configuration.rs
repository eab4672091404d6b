use crate::core::DEFAULT_MAX_BATCH_SIZE;
use crate::dispatcher::DispatchMode;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub max_batch_size: usize,
    pub dispatch_mode: DispatchMode,
    /// Matches `ReportBatchItemFailures` on the event source mapping.
    pub report_batch_item_failures: bool,
    pub record_timeout_ms: Option<u64>,
    pub deduplication_table_name: Option<String>,
    pub deduplication_lock_seconds: u64,
    pub deduplication_retention_seconds: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            dispatch_mode: DispatchMode::default(),
            report_batch_item_failures: true,
            record_timeout_ms: None,
            deduplication_table_name: None,
            deduplication_lock_seconds: 60,
            deduplication_retention_seconds: 24 * 60 * 60,
        }
    }
}

impl Configuration {
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            // .merge fills in any values set in the environment
            .merge(Env::prefixed("APP_"))
    }

    pub fn record_timeout(&self) -> Option<Duration> {
        self.record_timeout_ms.map(Duration::from_millis)
    }

    pub fn deduplication_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.deduplication_lock_seconds)
    }

    pub fn deduplication_retention(&self) -> Duration {
        Duration::from_secs(self.deduplication_retention_seconds)
    }
}

impl std::fmt::Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max_batch_size={} dispatch_mode={:?} report_batch_item_failures={} deduplication={}",
            self.max_batch_size,
            self.dispatch_mode,
            self.report_batch_item_failures,
            self.deduplication_table_name
                .as_deref()
                .unwrap_or("in-memory")
        )
    }
}
