// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use tpm2::tpm_handle;
use tpm_ek::CertParsePolicy;
use tpm_types::TpmVersion;

/// How to reach the TPM and how to treat what it reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenConfig {
    /// Skip version probing and assume this TPM family.
    pub tpm_version: Option<TpmVersion>,
    /// Device path, optionally prefixed with `device:`. Auto-detected when unset.
    pub tcti: Option<String>,
    pub cert_policy: CertParsePolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AikConfig {
    /// Persistent storage root handle the AIK is created under.
    pub parent: Option<u32>,
}

impl AikConfig {
    pub fn parent_handle(&self) -> u32 {
        self.parent.unwrap_or(tpm_handle::SRK)
    }
}
