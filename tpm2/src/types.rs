// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types

use anyhow::{anyhow, bail, Context, Result};
use rsa::{BigUint, RsaPublicKey};

use super::constants::*;
use super::marshal::*;

fn alg(raw: u16) -> Result<TpmAlgId> {
    TpmAlgId::from_u16(raw).ok_or_else(|| anyhow!("unknown algorithm: 0x{raw:04x}"))
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // PC client TPMs expect at least 3 bytes (PCR 0-23)
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];
        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Self { hash, pcr_select }
    }

    /// Selected indices in ascending order.
    pub fn indices(&self) -> Vec<u32> {
        self.pcr_select
            .iter()
            .enumerate()
            .flat_map(|(byte_idx, &byte)| {
                (0..8)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| (byte_idx * 8 + bit) as u32)
            })
            .collect()
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = alg(buf.get_u16()?)?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }

    /// Selection of every PCR in a PC client bank.
    pub fn full_bank(hash: TpmAlgId) -> Self {
        let all: Vec<u32> = (0..PCR_COUNT).collect();
        Self::single(hash, &all)
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        // TPM_NUM_PCR_BANKS is 16 on every implementation we know of
        if count > 16 {
            bail!("too many PCR selections: {count}");
        }
        let pcr_selections = (0..count)
            .map(|_| TpmsPcrSelection::unmarshal(buf))
            .collect::<Result<_>>()?;
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default)]
pub struct TpmlDigest {
    pub digests: Vec<Vec<u8>>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            buf.put_tpm2b(d);
        }
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 8 {
            bail!("too many digests in TPML_DIGEST: {count}");
        }
        let digests = (0..count)
            .map(|_| buf.get_tpm2b())
            .collect::<Result<_>>()?;
        Ok(Self { digests })
    }
}

/// TPML_TAGGED_TPM_PROPERTY, as returned by GetCapability(TPM_PROPERTIES)
#[derive(Debug, Clone, Default)]
pub struct TpmlTaggedTpmProperty {
    pub properties: Vec<(u32, u32)>,
}

impl Marshal for TpmlTaggedTpmProperty {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.properties.len() as u32);
        for &(property, value) in &self.properties {
            buf.put_u32(property);
            buf.put_u32(value);
        }
    }
}

impl Unmarshal for TpmlTaggedTpmProperty {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let mut properties = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            properties.push((buf.get_u32()?, buf.get_u32()?));
        }
        Ok(Self { properties })
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: u32,
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes);
        buf.put_tpm2b(&self.auth_policy);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nv_index: buf.get_u32()?,
            name_alg: alg(buf.get_u16()?)?,
            attributes: buf.get_u32()?,
            auth_policy: buf.get_tpm2b()?,
            data_size: buf.get_u16()?,
        })
    }
}

/// TPMT_SYM_DEF(_OBJECT) - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = alg(buf.get_u16()?)?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        Ok(Self {
            algorithm,
            key_bits: buf.get_u16()?,
            mode: alg(buf.get_u16()?)?,
        })
    }
}

/// TPMT_RSA_SCHEME / TPMT_SIG_SCHEME. Every scheme we handle carries a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    pub fn rsassa(hash: TpmAlgId) -> Self {
        Self {
            scheme: TpmAlgId::RsaSsa,
            hash_alg: Some(hash),
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg(buf.get_u16()?)?;
        match scheme {
            TpmAlgId::Null => Ok(Self::null()),
            TpmAlgId::RsaSsa | TpmAlgId::RsaPss | TpmAlgId::Oaep => Ok(Self {
                scheme,
                hash_alg: Some(alg(buf.get_u16()?)?),
            }),
            other => bail!("unsupported RSA scheme: {other:?}"),
        }
    }
}

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtScheme,
    pub key_bits: u16,
    /// Zero means the default exponent 65537.
    pub exponent: u32,
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMT_PUBLIC for RSA objects, the only key type used for attestation here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Vec<u8>,
    pub parameters: TpmsRsaParms,
    /// RSA modulus (TPM2B_PUBLIC_KEY_RSA)
    pub unique: Vec<u8>,
}

/// Default EK policy: PolicySecret(TPM_RH_ENDORSEMENT).
pub const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xB3, 0xF8, 0x1A, 0x90, 0xCC, 0x8D, 0x46, 0xA5, 0xD7, 0x24,
    0xFD, 0x52, 0xD7, 0x6E, 0x06, 0x52, 0x0B, 0x64, 0xF2, 0xA1, 0xDA, 0x1B, 0x33, 0x14, 0x69, 0xAA,
];

impl TpmtPublic {
    /// Restricted RSA-2048 signing key with RSASSA-SHA256, used as AIK.
    pub fn aik() -> Self {
        Self {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_restricted()
                .with_sign_encrypt(),
            auth_policy: Vec::new(),
            parameters: TpmsRsaParms {
                symmetric: TpmtSymDef::null(),
                scheme: TpmtScheme::rsassa(TpmAlgId::Sha256),
                key_bits: 2048,
                exponent: 0,
            },
            unique: Vec::new(),
        }
    }

    /// TCG default RSA EK template (EK Credential Profile, template L-1).
    pub fn endorsement_key() -> Self {
        Self {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_admin_with_policy()
                .with_restricted()
                .with_decrypt(),
            auth_policy: EK_AUTH_POLICY.to_vec(),
            parameters: TpmsRsaParms {
                symmetric: TpmtSymDef::aes_128_cfb(),
                scheme: TpmtScheme::null(),
                key_bits: 2048,
                exponent: 0,
            },
            unique: vec![0u8; 256],
        }
    }

    /// RSA storage root key template.
    pub fn storage_root_key() -> Self {
        Self {
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_no_da()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Vec::new(),
            parameters: TpmsRsaParms {
                symmetric: TpmtSymDef::aes_128_cfb(),
                scheme: TpmtScheme::null(),
                key_bits: 2048,
                exponent: 0,
            },
            unique: vec![0u8; 256],
        }
    }

    /// Object name: nameAlg || H_nameAlg(TPMT_PUBLIC).
    pub fn name(&self) -> Result<Vec<u8>> {
        let digest = self
            .name_alg
            .digest(&self.to_bytes())
            .ok_or_else(|| anyhow!("invalid name algorithm: {:?}", self.name_alg))?;
        let mut name = self.name_alg.to_u16().to_be_bytes().to_vec();
        name.extend_from_slice(&digest);
        Ok(name)
    }

    pub fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        if self.unique.is_empty() {
            bail!("public area has no RSA modulus");
        }
        let exponent = match self.parameters.exponent {
            0 => 65537,
            e => e,
        };
        RsaPublicKey::new(
            BigUint::from_bytes_be(&self.unique),
            BigUint::from(exponent),
        )
        .context("invalid RSA public key in public area")
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(TpmAlgId::Rsa.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        buf.put_tpm2b(&self.auth_policy);
        self.parameters.marshal(buf);
        buf.put_tpm2b(&self.unique);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = alg(buf.get_u16()?)?;
        if type_alg != TpmAlgId::Rsa {
            bail!("unsupported public key type: {type_alg:?}");
        }
        Ok(Self {
            name_alg: alg(buf.get_u16()?)?,
            object_attributes: TpmaObject(buf.get_u32()?),
            auth_policy: buf.get_tpm2b()?,
            parameters: TpmsRsaParms::unmarshal(buf)?,
            unique: buf.get_tpm2b()?,
        })
    }
}

/// TPM2B_SENSITIVE_CREATE with empty userAuth and data
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySensitiveCreate;

impl Marshal for EmptySensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(4);
        buf.put_u16(0); // userAuth
        buf.put_u16(0); // data
    }
}

/// TPMT_TK_CREATION - Creation ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTkCreation {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Vec<u8>,
}

impl Marshal for TpmtTkCreation {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.digest);
    }
}

impl Unmarshal for TpmtTkCreation {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            tag: buf.get_u16()?,
            hierarchy: buf.get_u32()?,
            digest: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_CLOCK_INFO
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: u8,
}

/// The TPMU_ATTEST arms this crate understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attested {
    Quote {
        pcr_select: TpmlPcrSelection,
        pcr_digest: Vec<u8>,
    },
    Creation {
        object_name: Vec<u8>,
        creation_hash: Vec<u8>,
    },
}

/// TPMS_ATTEST - Attestation structure signed by Quote and CertifyCreation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAttest {
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: TpmsClockInfo,
    pub firmware_version: u64,
    pub attested: Attested,
}

impl Marshal for TpmsAttest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(TPM_GENERATED_VALUE);
        let tag = match self.attested {
            Attested::Quote { .. } => TpmSt::AttestQuote,
            Attested::Creation { .. } => TpmSt::AttestCreation,
        };
        buf.put_u16(tag.to_u16());
        buf.put_tpm2b(&self.qualified_signer);
        buf.put_tpm2b(&self.extra_data);
        buf.put_u64(self.clock_info.clock);
        buf.put_u32(self.clock_info.reset_count);
        buf.put_u32(self.clock_info.restart_count);
        buf.put_u8(self.clock_info.safe);
        buf.put_u64(self.firmware_version);
        match &self.attested {
            Attested::Quote {
                pcr_select,
                pcr_digest,
            } => {
                pcr_select.marshal(buf);
                buf.put_tpm2b(pcr_digest);
            }
            Attested::Creation {
                object_name,
                creation_hash,
            } => {
                buf.put_tpm2b(object_name);
                buf.put_tpm2b(creation_hash);
            }
        }
    }
}

impl Unmarshal for TpmsAttest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let magic = buf.get_u32()?;
        if magic != TPM_GENERATED_VALUE {
            bail!("invalid magic number: 0x{magic:08x}");
        }
        let type_raw = buf.get_u16()?;
        let qualified_signer = buf.get_tpm2b()?;
        let extra_data = buf.get_tpm2b()?;
        let clock_info = TpmsClockInfo {
            clock: buf.get_u64()?,
            reset_count: buf.get_u32()?,
            restart_count: buf.get_u32()?,
            safe: buf.get_u8()?,
        };
        let firmware_version = buf.get_u64()?;
        let attested = match TpmSt::from_u16(type_raw) {
            Some(TpmSt::AttestQuote) => Attested::Quote {
                pcr_select: TpmlPcrSelection::unmarshal(buf)?,
                pcr_digest: buf.get_tpm2b()?,
            },
            Some(TpmSt::AttestCreation) => Attested::Creation {
                object_name: buf.get_tpm2b()?,
                creation_hash: buf.get_tpm2b()?,
            },
            _ => bail!("unsupported attest type: 0x{type_raw:04x}"),
        };
        Ok(Self {
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            attested,
        })
    }
}

/// TPMT_SIGNATURE for RSA schemes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtSignature {
    pub sig_alg: TpmAlgId,
    pub hash_alg: TpmAlgId,
    pub signature: Vec<u8>,
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.sig_alg.to_u16());
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_tpm2b(&self.signature);
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let sig_alg = alg(buf.get_u16()?)?;
        if !matches!(sig_alg, TpmAlgId::RsaSsa | TpmAlgId::RsaPss) {
            bail!("unsupported signature algorithm: {sig_alg:?}");
        }
        let hash_alg = alg(buf.get_u16()?)?;
        if !hash_alg.is_hash() {
            bail!("signature hash is not a hash algorithm: {hash_alg:?}");
        }
        Ok(Self {
            sig_alg,
            hash_alg,
            signature: buf.get_tpm2b()?,
        })
    }
}
