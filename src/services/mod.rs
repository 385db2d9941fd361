//! Business logic services.
//!
//! Services contain the exchange logic separated from HTTP handlers.
//! They handle store reads, the debit/credit saga and outbound notifications.

pub mod balance_service;
pub mod exchange_service;
pub mod notifier;
pub mod user_locks;
