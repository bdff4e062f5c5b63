//! Error taxonomy for the feedback engine.
//!
//! None of these are fatal. Service errors become rule-scoped artifacts,
//! validation errors leave the association store reset to empty, and
//! lookup errors are logged as warnings while the operation becomes a
//! no-op.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HarnessError {
    /// The generation client failed (network, auth, rate limit, bad response).
    #[error("rule '{rule_id}' failed: {message}")]
    Service { rule_id: String, message: String },

    /// An import blob could not be applied.
    #[error("invalid association data: {0}")]
    Validation(String),

    /// An operation referenced an id that does not exist.
    #[error("unknown {kind} id: {id}")]
    Lookup { kind: &'static str, id: String },
}

impl HarnessError {
    pub fn service(rule_id: &str, err: &anyhow::Error) -> Self {
        HarnessError::Service {
            rule_id: rule_id.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn lookup(kind: &'static str, id: &str) -> Self {
        HarnessError::Lookup {
            kind,
            id: id.to_string(),
        }
    }
}
