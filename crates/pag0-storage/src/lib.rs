//! Storage backends for pag0
//!
//! This crate provides the concrete [`FastStore`] and durable-store
//! implementations, plus [`StorageProfile`] for assembling the composite
//! [`Storage`] from configuration.

use pag0_core::{Pag0Error, Result, Storage, StorageConfig};
use std::sync::Arc;

mod memory;
mod redis_store;
mod sqlite;

pub use memory::InMemoryFastStore;
pub use redis_store::RedisFastStore;
pub use sqlite::SqliteStore;

/// Selects which backends the composite [`Storage`] is built from.
///
/// - `Memory`: everything in-process; state is lost on restart. Dev/test.
/// - `Lite`: SQLite for durable state, in-memory fast store. Single node.
/// - `Production`: SQLite for durable state, Redis as the shared fast
///   store. Required when running more than one proxy instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProfile {
    /// Fully in-process, nothing survives a restart.
    Memory,
    /// SQLite at the given path plus an in-memory fast store.
    Lite { database_path: String },
    /// SQLite plus Redis.
    Production {
        database_path: String,
        redis_url: String,
    },
}

impl StorageProfile {
    /// Resolve a profile from the storage configuration section.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.profile.as_str() {
            "memory" => Ok(Self::Memory),
            "lite" => Ok(Self::Lite {
                database_path: config.database_path.clone(),
            }),
            "production" => {
                let redis_url = config.redis_url.clone().ok_or_else(|| {
                    Pag0Error::Config(
                        "storage profile 'production' requires storage.redis_url".to_string(),
                    )
                })?;
                Ok(Self::Production {
                    database_path: config.database_path.clone(),
                    redis_url,
                })
            }
            other => Err(Pag0Error::Config(format!(
                "unknown storage profile '{other}' (expected memory, lite, or production)"
            ))),
        }
    }

    /// Build the composite [`Storage`] for this profile.
    pub async fn build(&self) -> Result<Storage> {
        match self {
            Self::Memory => {
                let durable = Arc::new(SqliteStore::new("sqlite::memory:").await?);
                Ok(Storage {
                    fast: Arc::new(InMemoryFastStore::new()),
                    policies: durable.clone(),
                    budgets: durable.clone(),
                    scores: durable.clone(),
                    analytics: durable,
                })
            }
            Self::Lite { database_path } => {
                let durable =
                    Arc::new(SqliteStore::new(&format!("sqlite://{database_path}")).await?);
                Ok(Storage {
                    fast: Arc::new(InMemoryFastStore::new()),
                    policies: durable.clone(),
                    budgets: durable.clone(),
                    scores: durable.clone(),
                    analytics: durable,
                })
            }
            Self::Production {
                database_path,
                redis_url,
            } => {
                let durable =
                    Arc::new(SqliteStore::new(&format!("sqlite://{database_path}")).await?);
                Ok(Storage {
                    fast: Arc::new(RedisFastStore::new(redis_url).await?),
                    policies: durable.clone(),
                    budgets: durable.clone(),
                    scores: durable.clone(),
                    analytics: durable,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
