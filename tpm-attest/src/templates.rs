// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Key templates, built once per process.

use std::sync::LazyLock;

use tpm2::TpmtPublic;

/// Restricted RSA-2048 RSASSA-SHA256 signing key.
pub static AIK_TEMPLATE: LazyLock<TpmtPublic> = LazyLock::new(TpmtPublic::aik);

/// TCG default RSA endorsement key.
pub static EK_TEMPLATE: LazyLock<TpmtPublic> = LazyLock::new(TpmtPublic::endorsement_key);

pub static SRK_TEMPLATE: LazyLock<TpmtPublic> = LazyLock::new(TpmtPublic::storage_root_key);
