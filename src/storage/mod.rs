pub mod db;
pub mod models;
mod authorizations;
mod registrations;
mod tables;

pub use db::{Database, DatabaseError, PurgeStats};
pub use models::{normalize_default, PendingAuthorization, ProviderRegistration};
pub use tables::*;

use crate::provider::StorageError;

/// Durable home of [`ProviderRegistration`] rows.
///
/// `update` runs the closure against all of one user's registrations and
/// persists the result atomically; implementations must re-establish the
/// default invariant (see [`normalize_default`]) before writing.
pub trait CredentialStore: Send + Sync {
    fn registrations(&self, user_id: &str) -> Result<Vec<ProviderRegistration>, StorageError>;

    /// Look a registration up by id alone, whoever owns it.
    fn registration_by_id(
        &self,
        registration_id: &str,
    ) -> Result<Option<ProviderRegistration>, StorageError>;

    fn update(
        &self,
        user_id: &str,
        update: &mut dyn FnMut(&mut Vec<ProviderRegistration>) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;

    /// Persist a started OAuth consent flow.
    fn save_authorization(&self, pending: &PendingAuthorization) -> Result<(), StorageError>;

    /// Consume the flow keyed by `state`, if one exists.
    fn take_authorization(&self, state: &str) -> Result<Option<PendingAuthorization>, StorageError>;

    fn active_registrations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ProviderRegistration>, StorageError> {
        Ok(self
            .registrations(user_id)?
            .into_iter()
            .filter(|r| r.is_active)
            .collect())
    }
}
