/// Per-operation and per-transaction scope.
pub mod invocation_context;
/// Transaction-local view of a single key.
pub mod versioned_entry;
