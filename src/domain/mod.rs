pub mod classifier;
pub mod payment;
pub mod plan;
pub mod ports;
pub mod processing;
pub mod purchase;
