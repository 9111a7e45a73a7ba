use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Store configuration, usually read from a YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite path or `file:` URI.
    #[serde(default = "default_connection_string")]
    pub connection_string: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_journal_mode")]
    pub journal_mode: JournalMode,
    /// Log every statement at debug level.
    #[serde(default = "default_true")]
    pub log_queries: bool,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default)]
    pub connect_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalMode {
    Wal,
    Delete,
    Truncate,
    Memory,
}

impl JournalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Memory => "MEMORY",
        }
    }
}

fn default_connection_string() -> String {
    "linkstore.db".to_string()
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_journal_mode() -> JournalMode {
    JournalMode::Wal
}

const fn default_true() -> bool {
    true
}

const fn default_connect_retries() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            connection_string: default_connection_string(),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: default_journal_mode(),
            log_queries: true,
            connect_retries: default_connect_retries(),
            connect_retry_delay_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        StoreConfig {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Parse a config file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse a YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(StoreError::Config("connection_string must not be empty".into()));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}
