//! HTTP handlers for activation-service.

pub mod activation_codes;
pub mod audit;
pub mod context;
pub mod metrics;
pub mod validation;
pub mod whitelist;

pub use activation_codes::*;
pub use audit::*;
pub use context::*;
pub use validation::*;
pub use whitelist::*;
