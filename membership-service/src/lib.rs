//! Group membership orchestration across identity backends.
//!
//! A write lands synchronously on the group's primary provider and is then
//! propagated to every other provider defining the group. Propagation that
//! fails is queued in a retry store and replayed by the reconciliation worker.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
