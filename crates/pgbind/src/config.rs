//! Configuration for pgbind
//!
//! - [`UpsertConfig`]: per-engine batch size, schema TTL and failure policy
//! - [`BindingConfig`]: deserializable description of one binding
//! - [`SettingsProvider`]: where connection strings are looked up

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use validator::Validate;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::schema::DEFAULT_SCHEMA_TTL;
use crate::source::{CommandType, QueryCommand};

/// Default number of rows per upsert statement
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// What to do with record fields that match no column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    /// Skip the field
    #[default]
    Ignore,
    /// Reject the flush with a validity error
    Reject,
}

/// Upsert engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertConfig {
    /// Rows per statement (default: 1000)
    pub batch_size: usize,
    /// How long a schema snapshot stays fresh (default: 5 minutes)
    pub schema_ttl: Duration,
    /// Put drained rows back into the buffer when a flush fails
    pub restore_on_failure: bool,
    /// Handling of fields that match no column
    pub unknown_fields: UnknownFieldPolicy,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            schema_ttl: DEFAULT_SCHEMA_TTL,
            restore_on_failure: true,
            unknown_fields: UnknownFieldPolicy::Ignore,
        }
    }
}

impl UpsertConfig {
    /// Set rows per statement
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set schema snapshot TTL
    pub fn with_schema_ttl(mut self, ttl: Duration) -> Self {
        self.schema_ttl = ttl;
        self
    }

    /// Set whether failed flushes restore their rows
    pub fn restore_on_failure(mut self, restore: bool) -> Self {
        self.restore_on_failure = restore;
        self
    }

    /// Set unknown field handling
    pub fn with_unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    /// Check the settings before an engine is built
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        Ok(())
    }
}

/// One binding, as read from host configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BindingConfig {
    /// Target relation for writes; query text or routine name for reads
    #[validate(length(min = 1))]
    pub command_text: String,

    /// Name of the setting holding the connection string
    #[serde(default)]
    #[validate(length(min = 1))]
    pub connection_string_setting: String,

    /// How `command_text` is interpreted for reads
    #[serde(default)]
    pub command_type: CommandType,

    /// Read parameters, e.g. `@id=1,@name=`
    #[serde(default)]
    pub parameters: Option<String>,

    /// Rows per upsert statement (default: 1000)
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 100000))]
    pub batch_size: u32,

    /// Schema snapshot TTL in seconds (default: 300)
    #[serde(default = "default_schema_ttl_secs")]
    pub schema_ttl_secs: u64,

    /// Restore drained rows to the buffer when a flush fails (default: true)
    #[serde(default = "default_true")]
    pub restore_on_failure: bool,

    /// Fail flushes whose records carry fields the table does not have
    #[serde(default)]
    pub reject_unknown_fields: bool,

    /// Connection timeout in milliseconds (default: 10000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Statement timeout in milliseconds (default: 0 = none)
    #[serde(default)]
    pub query_timeout_ms: u64,
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE as u32
}

fn default_schema_ttl_secs() -> u64 {
    DEFAULT_SCHEMA_TTL.as_secs()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl BindingConfig {
    /// Binding with defaults for everything but the command and setting
    pub fn new(command_text: impl Into<String>, connection_string_setting: impl Into<String>) -> Self {
        Self {
            command_text: command_text.into(),
            connection_string_setting: connection_string_setting.into(),
            command_type: CommandType::default(),
            parameters: None,
            batch_size: default_batch_size(),
            schema_ttl_secs: default_schema_ttl_secs(),
            restore_on_failure: true,
            reject_unknown_fields: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            query_timeout_ms: 0,
        }
    }

    /// Run the declarative validation rules
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid binding configuration: {}", e)))
    }

    /// Engine settings for the write path
    pub fn upsert_config(&self) -> Result<UpsertConfig> {
        self.check()?;
        Ok(UpsertConfig {
            batch_size: self.batch_size as usize,
            schema_ttl: Duration::from_secs(self.schema_ttl_secs),
            restore_on_failure: self.restore_on_failure,
            unknown_fields: if self.reject_unknown_fields {
                UnknownFieldPolicy::Reject
            } else {
                UnknownFieldPolicy::Ignore
            },
        })
    }

    /// Command for the read path; parameters are parsed here
    pub fn query_command(&self) -> Result<QueryCommand> {
        self.check()?;
        QueryCommand::new(
            self.command_text.clone(),
            self.command_type,
            self.parameters.as_deref(),
        )
    }

    /// Connection settings, resolving the connection string through `settings`
    pub fn connection_config(&self, settings: &dyn SettingsProvider) -> Result<ConnectionConfig> {
        let url = resolve_connection_string(&self.connection_string_setting, settings)?;
        Ok(ConnectionConfig::new(url)
            .with_connect_timeout(self.connect_timeout_ms)
            .with_query_timeout(self.query_timeout_ms))
    }
}

/// Source of named settings
pub trait SettingsProvider: Send + Sync {
    /// Value of `key`, if set
    fn get(&self, key: &str) -> Option<String>;
}

/// Settings from environment variables; `:` in keys becomes `__`
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl SettingsProvider for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key.replace(':', "__")).ok()
    }
}

impl SettingsProvider for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Look up the connection string named by `setting`.
///
/// `ConnectionStrings:<setting>` is consulted first, then `<setting>`.
/// An empty setting name, a missing value and an empty value are all
/// configuration errors.
pub fn resolve_connection_string(setting: &str, settings: &dyn SettingsProvider) -> Result<String> {
    if setting.trim().is_empty() {
        return Err(Error::config(
            "connection_string_setting must name the setting that holds the connection string",
        ));
    }

    let value = settings
        .get(&format!("ConnectionStrings:{}", setting))
        .or_else(|| settings.get(setting))
        .ok_or_else(|| {
            Error::config(format!(
                "connection string setting '{}' is missing",
                setting
            ))
        })?;

    if value.trim().is_empty() {
        return Err(Error::config(format!(
            "connection string setting '{}' is empty",
            setting
        )));
    }
    Ok(value)
}
