use redb::TableDefinition;

/// Registrations: user_id -> msgpack Vec<ProviderRegistration>
///
/// One row per user so every default-flag change is a single-row write.
pub const REGISTRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("registrations");

/// Registration index: registration id -> user_id
pub const REGISTRATION_OWNERS: TableDefinition<&str, &str> =
    TableDefinition::new("registration_owners");

/// Pending OAuth consent flows: state -> msgpack PendingAuthorization
pub const OAUTH_STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("oauth_states");
