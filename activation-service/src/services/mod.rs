pub mod attempt_limiter;
pub mod audit;
pub mod database;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod mailer;
pub mod memory;
pub mod metrics;
pub mod stats;
pub mod store;
pub mod throttle;
pub mod whitelist;

pub use attempt_limiter::{AttemptDecision, AttemptLimiter};
pub use audit::{AuditPage, AuditRecorder};
pub use database::PgStore;
pub use engine::{
    ActivationEngine, ActivationGrant, CodeDetail, CodeListing, CodeView, ExtendResult,
    GenerateRequest, GeneratedCode, ResendResult, RevokeResult, ValidateRequest,
    ValidationFailure, ValidationOutcome, MAX_EXTENSION_HOURS,
};
pub use error::{ActivationError, ActivationResult};
pub use hasher::{CodeHash, CodeHasher, HashParams};
pub use mailer::{CodeDelivery, CodeMailer, LogMailer, SmtpMailer};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use stats::{ActivationStats, StatsAggregator};
pub use store::{
    ActivationRepository, ActivationTimes, AuditFilter, AuditStore, AuditSummary, CodeFilter,
    CodeRollup, CodeStore, CodeSummary, EntryRollup, Page, SecurityRollup, WhitelistFilter,
    WhitelistStore,
};
pub use throttle::{ThrottleRejection, ThrottleScope, ValidationThrottle};
pub use whitelist::{WhitelistListing, WhitelistService, WhitelistView};
