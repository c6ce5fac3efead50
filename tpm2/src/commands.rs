// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! Each method issues exactly the commands its name says; policy such as
//! retries and handle bookkeeping belongs to the caller.

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::constants::*;
use super::device::*;
use super::marshal::*;
use super::types::*;

/// Outputs of TPM2_Create
#[derive(Debug, Clone)]
pub struct CreatedObject {
    pub private: Vec<u8>,
    /// Marshalled TPMT_PUBLIC
    pub public: Vec<u8>,
    /// Marshalled TPMS_CREATION_DATA
    pub creation_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub ticket: TpmtTkCreation,
}

/// TPMS_ATTEST bytes and the TPMT_SIGNATURE over them
#[derive(Debug, Clone)]
pub struct SignedAttest {
    pub attest: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Pure Rust TPM context over any [`Transport`]
pub struct TpmContext {
    transport: Box<dyn Transport>,
}

impl TpmContext {
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    fn execute(&mut self, cmd: TpmCommand) -> Result<TpmResponse> {
        execute(self.transport.as_mut(), cmd)
    }

    fn execute_ok(&mut self, cmd: TpmCommand) -> Result<TpmResponse> {
        let code = cmd.code();
        let response = self.execute(cmd)?;
        response
            .ensure_success()
            .with_context(|| format!("{code:?} failed"))?;
        Ok(response)
    }

    // ==================== Capabilities ====================

    /// Read one fixed property via GetCapability(TPM_PROPERTIES)
    pub fn get_tpm_property(&mut self, property: u32) -> Result<u32> {
        let mut cmd = TpmCommand::new(TpmCc::GetCapability);
        cmd.add_u32(TpmCap::TpmProperties as u32);
        cmd.add_u32(property);
        cmd.add_u32(1);

        let response = self.execute_ok(cmd)?;
        let mut buf = response.params()?;
        let _more_data = buf.get_u8()?;
        let capability = buf.get_u32()?;
        if capability != TpmCap::TpmProperties as u32 {
            bail!("unexpected capability in response: 0x{capability:x}");
        }
        let list = TpmlTaggedTpmProperty::unmarshal(&mut buf)?;
        list.properties
            .iter()
            .find(|(p, _)| *p == property)
            .map(|(_, v)| *v)
            .with_context(|| format!("TPM did not report property 0x{property:x}"))
    }

    // ==================== NV Operations ====================

    /// Read NV public area, `None` if the index is not defined
    pub fn nv_read_public(&mut self, index: u32) -> Result<Option<TpmsNvPublic>> {
        let mut cmd = TpmCommand::new(TpmCc::NvReadPublic);
        cmd.add_handle(index);

        let response = self.execute(cmd)?;
        if !response.is_success() {
            debug!(
                "NV_ReadPublic 0x{index:08x} returned 0x{:x}",
                response.response_code
            );
            return Ok(None);
        }
        let mut buf = response.params()?;
        let nv_public = buf.get_sized::<TpmsNvPublic>()?;
        Ok(Some(nv_public))
    }

    /// Read the whole content of an NV index, `None` if it is not defined or
    /// not readable with an empty owner or index password.
    pub fn nv_read(&mut self, index: u32) -> Result<Option<Vec<u8>>> {
        let Some(nv_public) = self.nv_read_public(index)? else {
            return Ok(None);
        };

        // Read in chunks (TPM_PT_NV_BUFFER_MAX is at least 1024 in practice)
        const MAX_READ_SIZE: usize = 1024;
        let total_size = nv_public.data_size as usize;
        let mut result = Vec::with_capacity(total_size);

        while result.len() < total_size {
            let offset = result.len() as u16;
            let read_size = (total_size - result.len()).min(MAX_READ_SIZE) as u16;

            let mut chunk = None;
            // Owner authorization first, then the index itself
            for auth_handle in [tpm_rh::OWNER, index] {
                let mut cmd = TpmCommand::with_sessions(TpmCc::NvRead);
                cmd.add_handle(auth_handle);
                cmd.add_handle(index);
                cmd.add_null_auth_area();
                cmd.add_u16(read_size);
                cmd.add_u16(offset);

                let response = self.execute(cmd)?;
                if response.is_success() {
                    chunk = Some(response.params()?.get_tpm2b()?);
                    break;
                }
                debug!(
                    "NV_Read 0x{index:08x} with auth 0x{auth_handle:08x} returned 0x{:x}",
                    response.response_code
                );
            }

            match chunk {
                Some(data) if !data.is_empty() => result.extend_from_slice(&data),
                Some(_) => bail!("NV_Read returned no data at offset {offset}"),
                None => return Ok(None),
            }
        }

        Ok(Some(result))
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection. The TPM may return fewer
    /// values than requested; the result lists only what it returned.
    pub fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        cmd.add(pcr_selection);

        let response = self.execute_ok(cmd)?;
        let mut buf = response.params()?;
        let _update_counter = buf.get_u32()?;
        let selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
        let digest_list = TpmlDigest::unmarshal(&mut buf)?;

        let indices: Vec<u32> = selection_out
            .pcr_selections
            .iter()
            .flat_map(|sel| sel.indices())
            .collect();
        if indices.len() != digest_list.digests.len() {
            bail!(
                "PCR_Read returned {} digests for {} selected PCRs",
                digest_list.digests.len(),
                indices.len()
            );
        }
        Ok(indices.into_iter().zip(digest_list.digests).collect())
    }

    // ==================== Object Operations ====================

    /// Read public area of a loaded or persistent object, `None` if the handle
    /// does not exist
    pub fn read_public(&mut self, handle: u32) -> Result<Option<Vec<u8>>> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);

        let response = self.execute(cmd)?;
        if !response.is_success() {
            return Ok(None);
        }
        let mut buf = response.params()?;
        Ok(Some(buf.get_tpm2b()?))
    }

    pub fn handle_exists(&mut self, handle: u32) -> Result<bool> {
        Ok(self.read_public(handle)?.is_some())
    }

    /// Create a primary key in the specified hierarchy
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        template: &TpmtPublic,
    ) -> Result<(u32, Vec<u8>)> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::CreatePrimary);
        cmd.add_handle(hierarchy);
        cmd.add_null_auth_area();
        cmd.add(&EmptySensitiveCreate);
        cmd.add_sized(template);
        cmd.add_tpm2b_empty(); // outsideInfo
        cmd.add(&TpmlPcrSelection::default());

        let response = self.execute_ok(cmd)?;
        let (handles, mut buf) = response.handles_and_params(1)?;
        let public = buf.get_tpm2b()?;

        debug!("created primary key with handle 0x{:08x}", handles[0]);
        Ok((handles[0], public))
    }

    /// Make a key persistent at a given handle
    pub fn evict_control(&mut self, object_handle: u32, persistent_handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::EvictControl);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_handle(object_handle);
        cmd.add_null_auth_area();
        cmd.add_handle(persistent_handle);

        self.execute_ok(cmd)?;
        debug!("made key persistent at 0x{persistent_handle:08x}");
        Ok(())
    }

    /// Ensure a persistent primary key exists at `handle`, creating it in the
    /// owner hierarchy from `template` when missing
    pub fn ensure_primary_key(&mut self, handle: u32, template: &TpmtPublic) -> Result<()> {
        if self.handle_exists(handle)? {
            return Ok(());
        }

        debug!("creating TPM primary key at 0x{handle:08x}...");
        let (transient, _) = self.create_primary(tpm_rh::OWNER, template)?;
        let persisted = self.evict_control(transient, handle);
        self.flush_context(transient)?;
        persisted
    }

    /// Create an ordinary object under `parent`
    pub fn create(&mut self, parent: u32, template: &TpmtPublic) -> Result<CreatedObject> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
        cmd.add_handle(parent);
        cmd.add_null_auth_area();
        cmd.add(&EmptySensitiveCreate);
        cmd.add_sized(template);
        cmd.add_tpm2b_empty(); // outsideInfo
        cmd.add(&TpmlPcrSelection::default());

        let response = self.execute_ok(cmd)?;
        let mut buf = response.params()?;
        Ok(CreatedObject {
            private: buf.get_tpm2b()?,
            public: buf.get_tpm2b()?,
            creation_data: buf.get_tpm2b()?,
            creation_hash: buf.get_tpm2b()?,
            ticket: TpmtTkCreation::unmarshal(&mut buf)?,
        })
    }

    /// Load an object under `parent`, returning its transient handle
    pub fn load(&mut self, parent: u32, private: &[u8], public: &[u8]) -> Result<u32> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Load);
        cmd.add_handle(parent);
        cmd.add_null_auth_area();
        cmd.add_tpm2b(private);
        cmd.add_tpm2b(public);

        let response = self.execute_ok(cmd)?;
        let (handles, _) = response.handles_and_params(1)?;
        debug!("loaded object with handle 0x{:08x}", handles[0]);
        Ok(handles[0])
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);
        self.execute_ok(cmd)?;
        Ok(())
    }

    // ==================== Attestation ====================

    /// Have `sign_handle` certify that `object_handle` was created by this TPM
    pub fn certify_creation(
        &mut self,
        sign_handle: u32,
        object_handle: u32,
        creation_hash: &[u8],
        ticket: &TpmtTkCreation,
    ) -> Result<SignedAttest> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::CertifyCreation);
        cmd.add_handle(sign_handle);
        cmd.add_handle(object_handle);
        cmd.add_null_auth_area();
        cmd.add_tpm2b_empty(); // qualifyingData
        cmd.add_tpm2b(creation_hash);
        cmd.add(&TpmtScheme::null());
        cmd.add(ticket);

        let response = self.execute_ok(cmd)?;
        let mut buf = response.params()?;
        let attest = buf.get_tpm2b()?;
        let signature = buf.get_remaining();
        Ok(SignedAttest { attest, signature })
    }

    /// Generate a TPM quote
    pub fn quote(
        &mut self,
        sign_handle: u32,
        qualifying_data: &[u8],
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<SignedAttest> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Quote);
        cmd.add_handle(sign_handle);
        cmd.add_null_auth_area();
        cmd.add_tpm2b(qualifying_data);
        // NULL scheme: use the key's own scheme
        cmd.add(&TpmtScheme::null());
        cmd.add(pcr_selection);

        let response = self.execute_ok(cmd)?;
        let mut buf = response.params()?;
        let attest = buf.get_tpm2b()?; // TPM2B_ATTEST
        let signature = buf.get_remaining(); // TPMT_SIGNATURE

        debug!("generated TPM quote");
        Ok(SignedAttest { attest, signature })
    }

    /// Recover a credential bound to `activate_handle` and sealed to
    /// `key_handle`. The key is authorized through `policy_session`.
    pub fn activate_credential(
        &mut self,
        activate_handle: u32,
        key_handle: u32,
        policy_session: u32,
        credential_blob: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::ActivateCredential);
        cmd.add_handle(activate_handle);
        cmd.add_handle(key_handle);
        cmd.add_auth_area(&[
            SessionAuth::password(),
            SessionAuth::policy(policy_session),
        ]);
        cmd.add_tpm2b(credential_blob);
        cmd.add_tpm2b(secret);

        let response = self.execute_ok(cmd)?;
        let mut buf = response.params()?;
        buf.get_tpm2b()
    }

    pub(crate) fn run(&mut self, cmd: TpmCommand) -> Result<TpmResponse> {
        self.execute_ok(cmd)
    }
}
