//! Connection-related data models.
//!
//! This module defines the session's connection identity, per-call overrides
//! and the transaction metadata reported to clients.

use crate::config::ServerConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-call redirection away from the session's main connection.
///
/// Every field is optional; unset fields fall back to the session value and
/// then to the server's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl ConnectionOverride {
    /// Build an override from the flat fields tool inputs carry. Blank
    /// strings count as unset.
    pub fn from_parts(
        server: Option<String>,
        database: Option<String>,
        schema: Option<String>,
    ) -> Option<Self> {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let o = Self {
            server: clean(server),
            database: clean(database),
            schema: clean(schema),
        };
        (!o.is_empty()).then_some(o)
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_none() && self.database.is_none() && self.schema.is_none()
    }
}

/// The `{server, database, schema}` a lease actually runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, JsonSchema)]
pub struct ResolvedTarget {
    pub server: String,
    pub database: String,
    pub schema: String,
}

impl ResolvedTarget {
    pub fn new(
        server: impl Into<String>,
        database: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            schema: schema.into(),
        }
    }

    /// Pool cache key; schema is applied per lease and is not part of it.
    pub fn pool_key(&self) -> String {
        pool_key(&self.server, &self.database)
    }
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (schema {})", self.server, self.database, self.schema)
    }
}

/// Key under which pools for `server` and `database` are cached.
pub fn pool_key(server: &str, database: &str) -> String {
    format!("{server}:{database}")
}

/// The session's current connection. Unset until the first successful
/// `switch_server`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ConnectionState {
    pub current_server: Option<String>,
    pub current_database: Option<String>,
    pub current_schema: Option<String>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.current_server.is_some()
    }

    /// The session identity as a target, when one is set.
    pub fn target(&self) -> Option<ResolvedTarget> {
        Some(ResolvedTarget::new(
            self.current_server.clone()?,
            self.current_database.clone()?,
            self.current_schema.clone()?,
        ))
    }

    pub(crate) fn set(&mut self, target: &ResolvedTarget) {
        self.current_server = Some(target.server.clone());
        self.current_database = Some(target.database.clone());
        self.current_schema = Some(target.schema.clone());
    }
}

/// A configured server as shown to clients. Never includes credentials.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ServerSummary {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<String>,
    pub is_default: bool,
    /// Free-form notes from the server definition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// True when this is the session's current server.
    pub is_current: bool,
}

impl ServerSummary {
    pub fn from_config(config: &ServerConfig, current: Option<&str>) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            default_database: config.default_database.clone(),
            default_schema: config.default_schema.clone(),
            ssl_mode: config.ssl_mode.clone(),
            is_default: config.is_default,
            context: config.context.clone(),
            is_current: current == Some(config.name.as_str()),
        }
    }
}

/// Transaction state for active transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Automatically rolled back due to timeout
    TimedOut,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct TransactionInfo {
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub server: String,
    pub database: String,
    pub schema: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub timeout_secs: u64,
    pub state: TransactionState,
}

impl TransactionInfo {
    pub fn is_timed_out(&self) -> bool {
        if self.state != TransactionState::Active {
            return false;
        }
        let elapsed = chrono::Utc::now()
            .signed_duration_since(self.started_at)
            .num_seconds();
        elapsed >= self.timeout_secs as i64
    }
}
