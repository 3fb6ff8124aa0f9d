//! cloud-storage - one storage contract over six backends
//!
//! This crate provides:
//! - A provider-agnostic `StorageProvider` contract with adapters for local
//!   disk, Amazon S3, Azure Blob Storage, Google Drive, OneDrive and Dropbox
//! - A `StorageManager` that resolves a user's backend, refreshes OAuth
//!   credentials single-flight, and owns provider registrations
//! - redb embedded database for registrations (ACID, MVCC, crash-safe)
//! - REST API with multipart upload support

pub mod api;
pub mod config;
pub mod manager;
pub mod provider;
pub mod storage;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use manager::StorageManager;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub manager: Arc<StorageManager>,
}
