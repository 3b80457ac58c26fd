//! Application layer: the billing session actor and the services around it.
//!
//! `BillingManager` owns all session state and is driven through
//! `StoreBillingGateway` over a `tokio` channel. Backend round-trips go through
//! the transaction registry.

pub mod backend;
pub mod cache;
pub mod gateway;
pub mod manager;
pub mod reconciler;
pub mod registry;
pub mod verification;
