//! Data models shared by the stores, the coordinator and the HTTP layer.

/// Store identifiers and balance responses
pub mod balance;
/// Exchange requests, outcomes and the saga state machine
pub mod exchange;
