// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 session
//!
//! Info, PCR and EK reads are raw commands. Identity keys need owner
//! authorization and are handled by the host TSS through [`IdentityService`].

use std::collections::BTreeSet;

use anyhow::Context;
use rand::RngCore;
use tracing::{debug, warn};

use tpm2::tpm12::{self, Tpm12Context};
use tpm2::SignedAttest;
use tpm_ek::{parse_ek_certificate_with, CertParsePolicy, EndorsementKey};
use tpm_types::{
    Error, HashAlg, Pcr, Result, TcgVendorId, TpmInfo, TpmInterface, TpmVersion, PCR_COUNT,
};

use crate::Session;

const NV_READ_CHUNK: u32 = 1024;

/// Result of TPM_MakeIdentity.
#[derive(Debug, Clone)]
pub struct Tpm12Identity {
    /// TSS key blob, needed to reload the key
    pub key_blob: Vec<u8>,
    /// TPM_PUBKEY of the identity key
    pub public_blob: Vec<u8>,
    /// Identity binding and other data returned with the key
    pub auxiliary_data: Vec<u8>,
}

/// Owner-authorized identity operations provided by the host TSS daemon.
pub trait IdentityService: Send {
    fn make_identity(&mut self) -> anyhow::Result<Tpm12Identity>;

    /// Load a key blob, returning its key handle.
    fn load_key(&mut self, key_blob: &[u8]) -> anyhow::Result<u32>;

    /// TPM_Quote over `pcrs`; returns TPM_QUOTE_INFO and its signature.
    fn quote(&mut self, key: u32, nonce: &[u8; 20], pcrs: &[u32]) -> anyhow::Result<SignedAttest>;

    /// TPM_ActivateIdentity followed by decryption of the symmetric blob.
    fn activate_identity(
        &mut self,
        key: u32,
        asym_blob: &[u8],
        sym_blob: &[u8],
    ) -> anyhow::Result<Vec<u8>>;

    fn unload_key(&mut self, key: u32) -> anyhow::Result<()>;
}

pub struct Session12 {
    ctx: Option<Tpm12Context>,
    identity: Option<Box<dyn IdentityService>>,
    info: TpmInfo,
    cert_policy: CertParsePolicy,
    keys: BTreeSet<u32>,
}

impl Session12 {
    pub(crate) fn open(
        mut ctx: Tpm12Context,
        interface: TpmInterface,
        cert_policy: CertParsePolicy,
        identity: Option<Box<dyn IdentityService>>,
    ) -> Result<Self> {
        let version = ctx.version_info().map_err(Error::Hardware)?;
        let vendor: Vec<u8> = version
            .vendor_specific
            .iter()
            .copied()
            .take_while(|b| *b != 0)
            .collect();
        let info = TpmInfo {
            version: TpmVersion::V12,
            manufacturer: TcgVendorId(version.vendor_id),
            interface,
            vendor_info: String::from_utf8_lossy(&vendor).into_owned(),
            firmware_major: version.rev_major as u16,
            firmware_minor: version.rev_minor as u16,
        };
        debug!("opened TPM 1.2 session: {}", info.manufacturer);
        Ok(Self {
            ctx: Some(ctx),
            identity,
            info,
            cert_policy,
            keys: BTreeSet::new(),
        })
    }

    fn ctx(&mut self) -> Result<&mut Tpm12Context> {
        self.ctx
            .as_mut()
            .ok_or_else(|| Error::invalid_input("TPM session is closed"))
    }

    fn identity(&mut self) -> Result<&mut dyn IdentityService> {
        if self.ctx.is_none() {
            return Err(Error::invalid_input("TPM session is closed"));
        }
        match self.identity.as_deref_mut() {
            Some(service) => Ok(service),
            None => Err(Error::not_supported(
                "TPM 1.2 identity keys need a TSS identity service",
            )),
        }
    }

    pub(crate) fn make_identity(&mut self) -> Result<(u32, Tpm12Identity)> {
        let identity = self
            .identity()?
            .make_identity()
            .context("TPM_MakeIdentity failed")
            .map_err(Error::Hardware)?;
        let handle = self.load_key(&identity.key_blob)?;
        Ok((handle, identity))
    }

    pub(crate) fn load_key(&mut self, key_blob: &[u8]) -> Result<u32> {
        let handle = self
            .identity()?
            .load_key(key_blob)
            .context("failed to load identity key")
            .map_err(Error::Hardware)?;
        self.keys.insert(handle);
        Ok(handle)
    }

    pub(crate) fn unload_key(&mut self, key: u32) -> Result<()> {
        self.keys.remove(&key);
        self.identity()?
            .unload_key(key)
            .with_context(|| format!("failed to unload key 0x{key:08x}"))
            .map_err(Error::Hardware)
    }

    pub(crate) fn quote(&mut self, key: u32, nonce: &[u8; 20]) -> Result<SignedAttest> {
        let pcrs: Vec<u32> = (0..PCR_COUNT).collect();
        self.identity()?
            .quote(key, nonce, &pcrs)
            .context("TPM_Quote failed")
            .map_err(Error::Hardware)
    }

    pub(crate) fn activate_identity(
        &mut self,
        key: u32,
        asym_blob: &[u8],
        sym_blob: &[u8],
    ) -> Result<Vec<u8>> {
        self.identity()?
            .activate_identity(key, asym_blob, sym_blob)
            .map_err(Error::Activation)
    }

    /// Keys still loaded through this session.
    pub fn open_handles(&self) -> Vec<u32> {
        self.keys.iter().copied().collect()
    }

    fn nv_certificate(&mut self) -> Result<Option<Vec<u8>>> {
        let ctx = self.ctx()?;
        let index = tpm12::EK_CERT_NV_INDEX;
        let Some(header) = ctx.nv_read_value(index, 0, 5).map_err(Error::Hardware)? else {
            return Ok(None);
        };
        if header.len() != 5 || header[..3] != [0x10, 0x01, 0x00] {
            debug!("EK certificate NV index has no certificate header");
            return Ok(None);
        }
        let total = 5 + u16::from_be_bytes([header[3], header[4]]) as u32;
        let mut raw = header;
        while (raw.len() as u32) < total {
            let offset = raw.len() as u32;
            let size = (total - offset).min(NV_READ_CHUNK);
            let chunk = ctx
                .nv_read_value(index, offset, size)
                .map_err(Error::Hardware)?
                .filter(|chunk| !chunk.is_empty())
                .ok_or_else(|| {
                    Error::Hardware(anyhow::anyhow!("EK certificate NV read stopped at {offset}"))
                })?;
            raw.extend_from_slice(&chunk);
        }
        Ok(Some(raw))
    }
}

impl Session for Session12 {
    fn info(&self) -> &TpmInfo {
        &self.info
    }

    fn pcrs(&mut self, alg: HashAlg) -> Result<Vec<Pcr>> {
        if alg != HashAlg::Sha1 {
            return Err(Error::not_supported(format!(
                "TPM 1.2 has no {alg:?} PCR bank"
            )));
        }
        let ctx = self.ctx()?;
        (0..PCR_COUNT)
            .map(|index| {
                let digest = ctx.pcr_read(index).map_err(Error::Hardware)?;
                Pcr::new(index, digest, HashAlg::Sha1)
            })
            .collect()
    }

    fn eks(&mut self) -> Result<Vec<EndorsementKey>> {
        if let Some(raw) = self.nv_certificate()? {
            match parse_ek_certificate_with(&raw, &self.cert_policy)
                .and_then(|cert| EndorsementKey::from_certificate(&cert))
            {
                Ok(ek) => return Ok(vec![ek]),
                Err(err) => warn!("EK certificate in NVRAM is unusable: {err}"),
            }
        }

        let mut anti_replay = [0u8; tpm12::DIGEST_SIZE];
        rand::thread_rng().fill_bytes(&mut anti_replay);
        let pubek = self
            .ctx()?
            .read_pubek(&anti_replay)
            .context("no EK certificate and TPM_ReadPubek failed")
            .map_err(Error::Hardware)?;
        let public = pubek.rsa_public_key().map_err(Error::Hardware)?;
        Ok(vec![EndorsementKey::from_public_for_vendor(
            public,
            self.info.manufacturer,
        )?])
    }

    fn close(&mut self) -> Result<()> {
        if self.ctx.is_none() {
            return Ok(());
        }
        for key in self.open_handles() {
            debug!("unloading leftover key 0x{key:08x}");
            if let Err(err) = self.unload_key(key) {
                warn!("{err}");
            }
        }
        self.ctx = None;
        Ok(())
    }
}

impl Drop for Session12 {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close TPM session: {err}");
        }
    }
}
