// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM structure codec and command layer
//!
//! This crate encodes and decodes the TPM 2.0 structures used for remote
//! attestation and issues the corresponding commands over a [`Transport`],
//! without C library dependencies. A small [`tpm12`] module covers the
//! TPM 1.2 structures and unauthenticated commands.
//!
//! ## Supported Commands
//!
//! - Capabilities: `GetCapability` (TPM properties)
//! - NV operations: `NV_ReadPublic`, `NV_Read`
//! - PCR operations: `PCR_Read`
//! - Key operations: `CreatePrimary`, `Create`, `Load`, `ReadPublic`, `EvictControl`, `FlushContext`
//! - Attestation: `Quote`, `CertifyCreation`
//! - Credential activation: `StartAuthSession`, `PolicySecret`, `ActivateCredential`
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{tpm_pt, TpmContext, TpmDevice};
//!
//! let mut ctx = TpmContext::with_transport(Box::new(TpmDevice::detect()?));
//! let manufacturer = ctx.get_tpm_property(tpm_pt::MANUFACTURER)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
mod marshal;
mod session;
pub mod tpm12;
mod types;

pub use commands::{CreatedObject, SignedAttest, TpmContext};
pub use constants::*;
pub use types::*;

pub use device::{execute, SessionAuth, TpmCommand, TpmDevice, TpmResponse, Transport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::AuthSession;
