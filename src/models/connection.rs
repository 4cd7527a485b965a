//! Connection-related data models.
//!
//! This module defines the supported backends and the lifecycle states of
//! pooled connections and units of work.

use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[serde(alias = "postgres")]
    PostgreSQL,
    /// Includes MariaDB
    #[serde(alias = "mariadb")]
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse a database type from its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
        }
    }

    /// Whether the driver uses numbered (`$1`) rather than anonymous (`?`) markers.
    pub fn uses_numbered_markers(&self) -> bool {
        matches!(self, Self::PostgreSQL)
    }

    /// Whether this backend is reached over the network.
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::SQLite)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Leased,
    /// Never re-leased; the slot is freed for a replacement.
    Broken,
}

/// Transaction state for a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    /// Rolled back because the unit exceeded its timeout
    TimedOut,
}

impl TransactionState {
    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction has ended (committed, rolled back, or timed out).
    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }
}
