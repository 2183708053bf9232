/// The lock-free authoritative container of committed entries.
pub mod data_container;
/// Committed values, their versions and lifespan metadata.
pub mod versioned_value;
