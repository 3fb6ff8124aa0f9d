use chrono::{DateTime, Utc};
use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::PendingAuthorization;
use super::tables::*;

impl Database {
    // ========================================================================
    // OAuth state operations
    // ========================================================================

    /// Record a consent flow. Flows that expired before `now` are dropped in
    /// the same transaction.
    pub fn put_pending_authorization(
        &self,
        pending: &PendingAuthorization,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(OAUTH_STATES)?;

            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let stored: PendingAuthorization = rmp_serde::from_slice(value.value())?;
                if stored.expires_at <= now {
                    expired.push(key.value().to_string());
                }
            }
            for state in &expired {
                table.remove(state.as_str())?;
            }

            let data = rmp_serde::to_vec_named(pending)?;
            table.insert(pending.state.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove and return the flow keyed by `state`. A state is usable once.
    pub fn take_pending_authorization(
        &self,
        state: &str,
    ) -> Result<Option<PendingAuthorization>, DatabaseError> {
        let write_txn = self.begin_write()?;
        let pending = {
            let mut table = write_txn.open_table(OAUTH_STATES)?;
            let removed = table.remove(state)?;
            match removed {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(pending)
    }
}
