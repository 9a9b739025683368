//! Event registry: resolves logical event keys to their physical tables.
//!
//! The registry is loaded once at startup from configuration and treated as
//! immutable. Table names it hands out are interpolated into SQL by the
//! purge layer, so they are validated as identifiers here, at load time.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// One registered logical event and its physical purge targets.
#[derive(Debug, Clone, Deserialize)]
pub struct EventDefinition {
    /// Logical event key, e.g. `payments.in`.
    pub key: String,
    /// Human-readable display name.
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Table holding successfully processed events.
    pub success_table: String,
    /// Table holding failed events.
    pub failure_table: String,
    /// Per-event retention override; falls back to the job-type default.
    #[serde(default)]
    pub retention_days: Option<i32>,
    /// Per-event cron override; falls back to the job-type default.
    #[serde(default)]
    pub retention_cron: Option<String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown event key: {0}")]
    UnknownKey(String),

    #[error("Duplicate event key: {0}")]
    DuplicateKey(String),

    #[error("Event tables must be provided for key: {0}")]
    MissingTable(String),

    #[error("Invalid table identifier for key {key}: {table}")]
    InvalidIdentifier { key: String, table: String },
}

/// Immutable lookup of event definitions, preserving registration order.
pub struct EventRegistry {
    definitions: Vec<EventDefinition>,
    by_key: HashMap<String, usize>,
}

impl EventRegistry {
    /// Build a registry, validating every definition.
    pub fn new(definitions: Vec<EventDefinition>) -> Result<Self, RegistryError> {
        let mut kept = Vec::with_capacity(definitions.len());
        let mut by_key = HashMap::new();

        for definition in definitions {
            if definition.key.trim().is_empty() {
                continue;
            }
            if definition.success_table.trim().is_empty()
                || definition.failure_table.trim().is_empty()
            {
                return Err(RegistryError::MissingTable(definition.key));
            }
            for table in [&definition.success_table, &definition.failure_table] {
                if !is_sql_identifier(table) {
                    return Err(RegistryError::InvalidIdentifier {
                        key: definition.key.clone(),
                        table: table.clone(),
                    });
                }
            }
            if by_key.contains_key(&definition.key) {
                return Err(RegistryError::DuplicateKey(definition.key));
            }
            by_key.insert(definition.key.clone(), kept.len());
            kept.push(definition);
        }

        Ok(Self { definitions: kept, by_key })
    }

    /// All definitions in registration order.
    pub fn all(&self) -> &[EventDefinition] {
        &self.definitions
    }

    pub fn get(&self, event_key: &str) -> Option<&EventDefinition> {
        self.by_key.get(event_key).map(|&i| &self.definitions[i])
    }

    /// Resolve a key or fail with a not-found error.
    pub fn get_required(&self, event_key: &str) -> Result<&EventDefinition, RegistryError> {
        self.get(event_key)
            .ok_or_else(|| RegistryError::UnknownKey(event_key.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}

/// Accepts `table` or `schema.table`, each segment `[A-Za-z_][A-Za-z0-9_]*`.
fn is_sql_identifier(name: &str) -> bool {
    let mut segments = name.split('.');
    let valid_segment = |s: &str| {
        !s.is_empty()
            && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    match (segments.next(), segments.next(), segments.next()) {
        (Some(table), None, _) => valid_segment(table),
        (Some(schema), Some(table), None) => valid_segment(schema) && valid_segment(table),
        _ => false,
    }
}
