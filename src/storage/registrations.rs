use chrono::Utc;
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{normalize_default, PendingAuthorization, ProviderRegistration};
use super::tables::*;
use super::CredentialStore;
use crate::provider::StorageError;

impl Database {
    // ========================================================================
    // Registration operations
    // ========================================================================

    /// Every registration of a user, active or not, oldest first
    pub fn get_registrations(&self, user_id: &str) -> Result<Vec<ProviderRegistration>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(REGISTRATIONS)?;

        let mut registrations: Vec<ProviderRegistration> = match table.get(user_id)? {
            Some(data) => rmp_serde::from_slice(data.value())?,
            None => Vec::new(),
        };
        registrations.sort_by_key(|r| r.created_at);
        Ok(registrations)
    }

    /// Look a registration up by id alone
    pub fn get_registration_by_id(
        &self,
        registration_id: &str,
    ) -> Result<Option<ProviderRegistration>, DatabaseError> {
        let user_id = {
            let read_txn = self.begin_read()?;
            let owners = read_txn.open_table(REGISTRATION_OWNERS)?;
            let owner = owners.get(registration_id)?.map(|v| v.value().to_string());
            owner
        };

        match user_id {
            Some(user_id) => Ok(self
                .get_registrations(&user_id)?
                .into_iter()
                .find(|r| r.id == registration_id)),
            None => Ok(None),
        }
    }

    /// Read-modify-write a user's registrations in one write transaction.
    ///
    /// The default invariant is re-established before commit. If `update`
    /// fails nothing is written.
    pub fn update_registrations<T>(
        &self,
        user_id: &str,
        update: impl FnOnce(&mut Vec<ProviderRegistration>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let write_txn = self.begin_write()?;

        let mut registrations: Vec<ProviderRegistration> = {
            let table = write_txn.open_table(REGISTRATIONS).map_err(DatabaseError::from)?;
            let existing = match table.get(user_id).map_err(DatabaseError::from)? {
                Some(data) => rmp_serde::from_slice(data.value()).map_err(DatabaseError::from)?,
                None => Vec::new(),
            };
            existing
        };

        // Dropping `write_txn` on error aborts it.
        let result = update(&mut registrations)?;
        normalize_default(&mut registrations);

        {
            let mut table = write_txn.open_table(REGISTRATIONS).map_err(DatabaseError::from)?;
            let data = rmp_serde::to_vec_named(&registrations).map_err(DatabaseError::from)?;
            table
                .insert(user_id, data.as_slice())
                .map_err(DatabaseError::from)?;

            let mut owners = write_txn
                .open_table(REGISTRATION_OWNERS)
                .map_err(DatabaseError::from)?;
            for registration in &registrations {
                owners
                    .insert(registration.id.as_str(), user_id)
                    .map_err(DatabaseError::from)?;
            }
        }
        write_txn.commit().map_err(DatabaseError::from)?;

        Ok(result)
    }
}

impl CredentialStore for Database {
    fn registrations(&self, user_id: &str) -> Result<Vec<ProviderRegistration>, StorageError> {
        Ok(self.get_registrations(user_id)?)
    }

    fn registration_by_id(
        &self,
        registration_id: &str,
    ) -> Result<Option<ProviderRegistration>, StorageError> {
        Ok(self.get_registration_by_id(registration_id)?)
    }

    fn update(
        &self,
        user_id: &str,
        update: &mut dyn FnMut(&mut Vec<ProviderRegistration>) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        self.update_registrations(user_id, |registrations| update(registrations))
    }

    fn save_authorization(&self, pending: &PendingAuthorization) -> Result<(), StorageError> {
        Ok(self.put_pending_authorization(pending, Utc::now())?)
    }

    fn take_authorization(&self, state: &str) -> Result<Option<PendingAuthorization>, StorageError> {
        Ok(self.take_pending_authorization(state)?)
    }
}
