//! Error taxonomy for the provisioning orchestrator.
//!
//! Propagation policy: `Schema`, `Publish` and `Conflict` abort a
//! provisioning call and reach the caller unmodified.
//! `ProvisioningTimeout` is surfaced but does not trigger cleanup; the
//! already-published side effects stay in place and a repeat call is safe.
//! Post-registration and soft deletion-step failures are logged at the
//! call site and never change the call's outcome.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("thing {uuid} was not materialized after {attempts} poll attempts")]
    ProvisioningTimeout { uuid: Uuid, attempts: u32 },

    #[error("schema operation failed: {0}")]
    Schema(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ProvisionError {
    /// Shorthand for a typed not-found error.
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        ProvisionError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn error_display_variants() {
        let uuid = Uuid::nil();
        let errors = vec![
            ProvisionError::not_found("project", "acme"),
            ProvisionError::Conflict("uuid already taken".into()),
            ProvisionError::Publish("broker unreachable".into()),
            ProvisionError::ProvisioningTimeout { uuid, attempts: 60 },
            ProvisionError::Schema("clone failed".into()),
            ProvisionError::Credential("bad key".into()),
            ProvisionError::Config("missing var".into()),
        ];

        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn timeout_mentions_attempts() {
        let err = ProvisionError::ProvisioningTimeout {
            uuid: Uuid::nil(),
            attempts: 12,
        };
        assert!(err.to_string().contains("12"));
    }
}
