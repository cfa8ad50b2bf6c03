//! Coordinator configuration.

use crate::error::{FanoutError, Result};
use crate::types::{RowFilter, Schema, Topic, KNOWN_TABLES};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Tables the admin dashboard watches by default.
pub const DASHBOARD_TABLES: &[&str] = &[
    "profiles",
    "inquiries",
    "messages",
    "projects",
    "system_activities",
];

/// One table feed the coordinator opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedTable {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RowFilter>,
}

impl WatchedTable {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    pub fn filtered(table: impl Into<String>, filter: RowFilter) -> Self {
        Self {
            table: table.into(),
            filter: Some(filter),
        }
    }
}

/// Fan-out coordinator configuration.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Database schema feeds are opened on.
    /// Default: "public"
    pub schema: String,

    /// Tables that exist in the schema.
    pub known_tables: Vec<String>,

    /// Tables to open feeds on, in order.
    /// Default: the dashboard tables
    pub watched: Vec<WatchedTable>,

    /// Aggregate topic every change is re-published on.
    /// Default: "dashboard"
    pub dashboard_topic: String,

    /// Buffer size for listener streams.
    /// Default: 1000
    pub stream_buffer_size: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            known_tables: KNOWN_TABLES.iter().map(|t| t.to_string()).collect(),
            watched: DASHBOARD_TABLES.iter().map(|t| WatchedTable::new(*t)).collect(),
            dashboard_topic: Topic::DASHBOARD.to_string(),
            stream_buffer_size: 1000,
        }
    }
}

impl FanoutConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Append a watched table.
    pub fn watch(mut self, table: impl Into<String>, filter: Option<RowFilter>) -> Self {
        self.watched.push(WatchedTable {
            table: table.into(),
            filter,
        });
        self
    }

    pub fn schema(&self) -> Schema {
        Schema::new(self.schema.clone(), self.known_tables.iter().cloned())
    }

    /// Check the config and resolve its schema.
    pub fn validate(&self) -> Result<Schema> {
        if self.schema.is_empty() {
            return Err(FanoutError::InvalidConfig("schema name is empty".into()));
        }
        if self.dashboard_topic.is_empty() {
            return Err(FanoutError::InvalidConfig("dashboard topic is empty".into()));
        }
        if self.stream_buffer_size == 0 {
            return Err(FanoutError::InvalidConfig("stream buffer size must be positive".into()));
        }

        let schema = self.schema();
        if schema.contains(&self.dashboard_topic) {
            return Err(FanoutError::InvalidConfig(format!(
                "dashboard topic '{}' collides with a table name",
                self.dashboard_topic
            )));
        }

        let mut seen = HashSet::new();
        for watched in &self.watched {
            schema.table(&watched.table)?;
            if !seen.insert(watched.table.as_str()) {
                return Err(FanoutError::InvalidConfig(format!(
                    "table '{}' is watched twice",
                    watched.table
                )));
            }
            if let Some(filter) = &watched.filter {
                filter.validate()?;
            }
        }

        Ok(schema)
    }
}
