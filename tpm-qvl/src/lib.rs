// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Quote Verification Library (QVL)
//!
//! Verifier half of TPM remote attestation.
//!
//! # Flow
//! - **Step 1**: [`ActivationParameters::generate`] - validate the device's AIK
//!   and issue a challenge only the TPM holding the EK can answer
//! - **Step 2**: compare the secret the device returns with the one kept here
//! - **Step 3**: [`verify_quote`] - check nonce, PCR digest and signature
//!
//! This crate is designed to run on the verifier side, while tpm-attest runs on the device side.

mod credential;
mod verify;

pub use credential::{
    kdfa, make_credential, validate_aik20, ActivationParameters, SECRET_SIZE,
};
pub use verify::{
    aik_public_key, parse_aik_public, verify_quote, verify_tpm_signature, VerifiedQuote,
};

pub use tpm_ek::EndorsementKey;
pub use tpm_types::{AikInfo, EncryptedCredential, Error, Pcr, Quote, Result, TpmVersion};
