// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management

use anyhow::Result;
use tracing::debug;

use super::commands::TpmContext;
use super::constants::*;
use super::device::*;
use super::types::*;

/// Authorization session handle
#[derive(Debug, Clone, Copy)]
pub struct AuthSession {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
}

impl AuthSession {
    /// Start an unbound, unsalted session without parameter encryption
    pub fn start(ctx: &mut TpmContext, session_type: TpmSe, hash_alg: TpmAlgId) -> Result<Self> {
        const ZERO_NONCE: [u8; 16] = [0u8; 16];

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        cmd.add_handle(tpm_rh::NULL); // tpmKey
        cmd.add_handle(tpm_rh::NULL); // bind
        cmd.add_tpm2b(&ZERO_NONCE); // nonceCaller
        cmd.add_tpm2b_empty(); // encryptedSalt
        cmd.add_u8(session_type as u8);
        cmd.add(&TpmtSymDef::null());
        cmd.add_u16(hash_alg.to_u16());

        let response = ctx.run(cmd)?;
        let (handles, mut buf) = response.handles_and_params(1)?;
        let _nonce_tpm = buf.get_tpm2b()?;

        debug!("started {session_type:?} session 0x{:08x}", handles[0]);
        Ok(Self {
            handle: handles[0],
            session_type,
            hash_alg,
        })
    }

    /// Start a policy session
    pub fn start_policy(ctx: &mut TpmContext, hash_alg: TpmAlgId) -> Result<Self> {
        Self::start(ctx, TpmSe::Policy, hash_alg)
    }

    /// Satisfy PolicySecret against `auth_handle` using its empty password
    pub fn policy_secret(&self, ctx: &mut TpmContext, auth_handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::PolicySecret);
        cmd.add_handle(auth_handle);
        cmd.add_handle(self.handle);
        cmd.add_null_auth_area();
        cmd.add_tpm2b_empty(); // nonceTPM
        cmd.add_tpm2b_empty(); // cpHashA
        cmd.add_tpm2b_empty(); // policyRef
        cmd.add_u32(0); // expiration

        ctx.run(cmd)?;
        Ok(())
    }

    /// Flush (close) this session
    pub fn flush(self, ctx: &mut TpmContext) -> Result<()> {
        ctx.flush_context(self.handle)
    }
}
