//! Multi-node tests grouped by concern.

pub mod basic_distributed;
pub mod consistency_tests;
pub mod network_tests;
