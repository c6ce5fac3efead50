// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use tracing::{debug, warn};

use tpm2::{
    tpm_handle, tpm_pt, tpm_rh, AuthSession, CreatedObject, SignedAttest, TpmAlgId, TpmContext,
    TpmlPcrSelection, TpmtPublic, Unmarshal,
};
use tpm_ek::{parse_ek_certificate_with, CertParsePolicy, EndorsementKey};
use tpm_types::{
    Error, HashAlg, Pcr, Result, TcgVendorId, TpmInfo, TpmInterface, TpmVersion, PCR_COUNT,
};

use crate::templates::{AIK_TEMPLATE, EK_TEMPLATE, SRK_TEMPLATE};
use crate::Session;

/// Rebuild the vendor string from TPM_PT_VENDOR_STRING_1..4.
///
/// Each word holds four ASCII octets, most significant byte first. Words are
/// taken in property order and trailing NUL padding is dropped.
pub fn decode_vendor_string(words: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.push((word >> 24) as u8);
        bytes.push((word >> 16) as u8);
        bytes.push((word >> 8) as u8);
        bytes.push(*word as u8);
    }
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn read_info(ctx: &mut TpmContext, interface: TpmInterface) -> anyhow::Result<TpmInfo> {
    let manufacturer = ctx
        .get_tpm_property(tpm_pt::MANUFACTURER)
        .context("failed to read TPM manufacturer")?;
    let words = [
        tpm_pt::VENDOR_STRING_1,
        tpm_pt::VENDOR_STRING_2,
        tpm_pt::VENDOR_STRING_3,
        tpm_pt::VENDOR_STRING_4,
    ]
    .into_iter()
    .map(|prop| ctx.get_tpm_property(prop))
    .collect::<anyhow::Result<Vec<_>>>()
    .context("failed to read TPM vendor string")?;
    let firmware = ctx
        .get_tpm_property(tpm_pt::FIRMWARE_VERSION_1)
        .context("failed to read TPM firmware version")?;

    Ok(TpmInfo {
        version: TpmVersion::V20,
        manufacturer: TcgVendorId(manufacturer),
        interface,
        vendor_info: decode_vendor_string(&words),
        firmware_major: (firmware >> 16) as u16,
        firmware_minor: firmware as u16,
    })
}

/// A loaded 2.0 AIK and everything needed to reload it.
pub(crate) struct NewAik20 {
    pub handle: u32,
    pub object: CreatedObject,
    pub certification: SignedAttest,
}

pub struct Session20 {
    ctx: Option<TpmContext>,
    info: TpmInfo,
    cert_policy: CertParsePolicy,
    /// Transient objects and sessions this session is responsible for.
    handles: BTreeSet<u32>,
}

impl Session20 {
    pub(crate) fn open(
        mut ctx: TpmContext,
        interface: TpmInterface,
        cert_policy: CertParsePolicy,
    ) -> Result<Self> {
        let info = read_info(&mut ctx, interface).map_err(Error::Hardware)?;
        debug!(
            "opened TPM 2.0 session: {} \"{}\" firmware {}.{}",
            info.manufacturer, info.vendor_info, info.firmware_major, info.firmware_minor
        );
        Ok(Self {
            ctx: Some(ctx),
            info,
            cert_policy,
            handles: BTreeSet::new(),
        })
    }

    fn ctx(&mut self) -> Result<&mut TpmContext> {
        self.ctx
            .as_mut()
            .ok_or_else(|| Error::invalid_input("TPM session is closed"))
    }

    fn track(&mut self, handle: u32) {
        self.handles.insert(handle);
    }

    pub(crate) fn flush(&mut self, handle: u32) -> Result<()> {
        self.handles.remove(&handle);
        self.ctx()?
            .flush_context(handle)
            .with_context(|| format!("failed to flush handle 0x{handle:08x}"))
            .map_err(Error::Hardware)
    }

    fn flush_quietly(&mut self, handle: u32) {
        if let Err(err) = self.flush(handle) {
            warn!("{err}");
        }
    }

    /// Handles still owned by this session.
    pub fn open_handles(&self) -> Vec<u32> {
        self.handles.iter().copied().collect()
    }

    fn read_pcrs(&mut self, alg: HashAlg) -> Result<Vec<Pcr>> {
        let digest_size = alg.digest_size();
        let ctx = self.ctx()?;
        let mut values: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        // PCR_Read may return only part of a selection; ask again for what
        // is missing, at most once per register.
        for round in 0..PCR_COUNT {
            let missing: Vec<u32> = (0..PCR_COUNT)
                .filter(|i| !values.contains_key(i))
                .collect();
            if missing.is_empty() {
                break;
            }
            if round > 0 {
                debug!(
                    "PCR read round {round}: {} registers outstanding",
                    missing.len()
                );
            }
            let selection = TpmlPcrSelection::single(alg.alg_id(), &missing);
            let returned = ctx.pcr_read(&selection).map_err(Error::Hardware)?;
            for (index, digest) in returned {
                if index >= PCR_COUNT || digest.len() != digest_size {
                    return Err(Error::Hardware(anyhow::anyhow!(
                        "TPM returned malformed PCR {index} ({} bytes)",
                        digest.len()
                    )));
                }
                values.entry(index).or_insert(digest);
            }
        }

        if values.len() != PCR_COUNT as usize {
            return Err(Error::Hardware(anyhow::anyhow!(
                "TPM returned only {} of {PCR_COUNT} {alg:?} PCRs after {PCR_COUNT} reads",
                values.len()
            )));
        }
        values
            .into_iter()
            .map(|(index, digest)| Pcr::new(index, digest, alg))
            .collect()
    }

    /// The persistent EK if provisioned, else one derived from the default
    /// template and flushed again.
    fn ek_public(&mut self) -> Result<TpmtPublic> {
        let ctx = self.ctx()?;
        if let Some(blob) = ctx.read_public(tpm_handle::EK).map_err(Error::Hardware)? {
            return TpmtPublic::from_bytes_exact(&blob)
                .context("persistent EK public area")
                .map_err(Error::Hardware);
        }

        debug!("no persistent EK, recreating it from the default template");
        let (handle, blob) = ctx
            .create_primary(tpm_rh::ENDORSEMENT, &EK_TEMPLATE)
            .map_err(Error::Hardware)?;
        self.track(handle);
        let public = TpmtPublic::from_bytes_exact(&blob)
            .context("EK public area")
            .map_err(Error::Hardware);
        self.flush(handle)?;
        public
    }

    fn read_eks(&mut self) -> Result<Vec<EndorsementKey>> {
        let nv = self
            .ctx()?
            .nv_read(tpm_handle::EK_CERT_NV_INDEX)
            .map_err(Error::Hardware)?;
        match nv {
            Some(raw) => {
                let ek = parse_ek_certificate_with(&raw, &self.cert_policy)
                    .and_then(|cert| EndorsementKey::from_certificate(&cert));
                match ek {
                    Ok(ek) => return Ok(vec![ek]),
                    Err(err) => warn!("EK certificate in NVRAM is unusable: {err}"),
                }
            }
            None => debug!("no EK certificate in NVRAM"),
        }

        let public = self
            .ek_public()?
            .rsa_public_key()
            .map_err(Error::Hardware)?;
        Ok(vec![EndorsementKey::from_public_for_vendor(
            public,
            self.info.manufacturer,
        )?])
    }

    pub(crate) fn create_aik(&mut self, parent: u32) -> Result<NewAik20> {
        let ctx = self.ctx()?;
        ctx.ensure_primary_key(parent, &SRK_TEMPLATE)
            .context("failed to provision storage root key")
            .map_err(Error::Hardware)?;
        let object = ctx
            .create(parent, &AIK_TEMPLATE)
            .context("failed to create AIK")
            .map_err(Error::Hardware)?;
        let handle = self.load(parent, &object.private, &object.public)?;

        let certification = self.ctx().and_then(|ctx| {
            ctx.certify_creation(handle, handle, &object.creation_hash, &object.ticket)
                .context("AIK failed to certify its own creation")
                .map_err(Error::Hardware)
        });
        match certification {
            Ok(certification) => Ok(NewAik20 {
                handle,
                object,
                certification,
            }),
            Err(err) => {
                self.flush_quietly(handle);
                Err(err)
            }
        }
    }

    pub(crate) fn load(&mut self, parent: u32, private: &[u8], public: &[u8]) -> Result<u32> {
        let handle = self
            .ctx()?
            .load(parent, private, public)
            .context("failed to load AIK")
            .map_err(Error::Hardware)?;
        self.track(handle);
        Ok(handle)
    }

    pub(crate) fn quote(&mut self, handle: u32, nonce: &[u8], alg: HashAlg) -> Result<SignedAttest> {
        self.ctx()?
            .quote(handle, nonce, &TpmlPcrSelection::full_bank(alg.alg_id()))
            .map_err(Error::Hardware)
    }

    /// Recover a credential bound to `aik` and wrapped to the EK.
    pub(crate) fn activate_credential(
        &mut self,
        aik: u32,
        credential: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>> {
        let persistent = self
            .ctx()?
            .handle_exists(tpm_handle::EK)
            .map_err(Error::Hardware)?;
        let ek = if persistent {
            tpm_handle::EK
        } else {
            let (handle, _) = self
                .ctx()?
                .create_primary(tpm_rh::ENDORSEMENT, &EK_TEMPLATE)
                .map_err(Error::Activation)?;
            self.track(handle);
            handle
        };

        let result = self.activate_with_ek(aik, ek, credential, secret);
        if !persistent {
            self.flush_quietly(ek);
        }
        result
    }

    fn activate_with_ek(
        &mut self,
        aik: u32,
        ek: u32,
        credential: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>> {
        let ctx = self.ctx()?;
        let session = AuthSession::start_policy(ctx, TpmAlgId::Sha256).map_err(Error::Activation)?;
        self.track(session.handle);

        let ctx = self.ctx()?;
        let result = session
            .policy_secret(ctx, tpm_rh::ENDORSEMENT)
            .and_then(|_| ctx.activate_credential(aik, ek, session.handle, credential, secret))
            .map_err(Error::Activation);
        self.flush_quietly(session.handle);
        result
    }
}

impl Session for Session20 {
    fn info(&self) -> &TpmInfo {
        &self.info
    }

    fn pcrs(&mut self, alg: HashAlg) -> Result<Vec<Pcr>> {
        self.read_pcrs(alg)
    }

    fn eks(&mut self) -> Result<Vec<EndorsementKey>> {
        self.read_eks()
    }

    fn close(&mut self) -> Result<()> {
        if self.ctx.is_none() {
            return Ok(());
        }
        for handle in self.open_handles() {
            debug!("releasing leftover handle 0x{handle:08x}");
            self.flush_quietly(handle);
        }
        self.ctx = None;
        Ok(())
    }
}

impl Drop for Session20 {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close TPM session: {err}");
        }
    }
}
