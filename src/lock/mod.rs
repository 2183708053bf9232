/// Striped per-key exclusive locks.
pub mod lock_manager;
