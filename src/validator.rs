//! Static admission checks run before any container is created.
//!
//! The denylist is a cheap filter for obviously hostile submissions. Isolation
//! is enforced by the container configuration, not here.

use crate::config::ExecutionPolicy;
use thiserror::Error;

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("Code cannot be empty")]
    EmptyInput,
    #[error("Code exceeds maximum length of {limit} characters")]
    TooLong { limit: usize },
    #[error("Forbidden operation detected: {token}")]
    ForbiddenConstruct { token: String },
}

/// Check `code` against the policy's size bound and denylist.
pub fn validate(policy: &ExecutionPolicy, code: &str) -> Result<(), RejectionReason> {
    if code.trim().is_empty() {
        return Err(RejectionReason::EmptyInput);
    }

    if code.chars().count() > policy.max_code_chars {
        return Err(RejectionReason::TooLong {
            limit: policy.max_code_chars,
        });
    }

    let lowered = code.to_lowercase();
    for entry in &policy.denylist {
        if lowered.contains(&entry.to_lowercase()) {
            return Err(RejectionReason::ForbiddenConstruct {
                token: entry.trim().to_string(),
            });
        }
    }

    Ok(())
}
