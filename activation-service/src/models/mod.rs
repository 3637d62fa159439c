pub mod activation_code;
pub mod audit_log;
pub mod whitelist_entry;

pub use activation_code::{next_status, ActivationCode, CodeStatus, CodeTransition, InvalidTransition};
pub use audit_log::{AuditEvent, AuditEventType, AuditLogEntry, FailureReason, RequestContext};
pub use whitelist_entry::{
    IdentifierType, NewWhitelistEntry, RoleProfile, WhitelistChanges, WhitelistEntry,
};
