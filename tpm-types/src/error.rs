// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Failures surfaced by the attestation API.
///
/// `Activation`, `Integrity`, `Signature` and `Replay` are protocol failures:
/// callers must refuse trust and must not fall back to any substitute value.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("TPM hardware error: {0:#}")]
    Hardware(anyhow::Error),
    #[error("invalid blob format: {0}")]
    Format(String),
    #[error("parse error: {0:#}")]
    Parse(anyhow::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("signature verification failed: {0}")]
    Signature(String),
    #[error("nonce mismatch, possible replay")]
    Replay,
    #[error("credential activation failed: {0:#}")]
    Activation(anyhow::Error),
    #[error("certificate fetch failed: {0:#}")]
    Fetch(anyhow::Error),
}

impl Error {
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Error::Activation(_) | Error::Integrity(_) | Error::Signature(_) | Error::Replay
        )
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
