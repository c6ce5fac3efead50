// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 framing and the handful of structures attestation needs.
//!
//! Only commands that need no owner authorization are issued directly;
//! everything else goes through the platform's TSS daemon.

use anyhow::{anyhow, bail, Context, Result};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use sha1::{Digest, Sha1};
use tracing::debug;

use super::device::Transport;
use super::marshal::*;

pub const TAG_RQU_COMMAND: u16 = 0x00C1;
pub const TAG_RSP_COMMAND: u16 = 0x00C4;

/// TPM 1.2 ordinals
pub mod ordinal {
    pub const PCR_READ: u32 = 0x15;
    pub const GET_CAPABILITY: u32 = 0x65;
    pub const READ_PUBEK: u32 = 0x7C;
    pub const NV_READ_VALUE: u32 = 0xCF;
}

pub const CAP_VERSION_VAL: u32 = 0x1A;
pub const ALG_RSA: u32 = 0x01;
pub const ALG_AES128: u32 = 0x06;
pub const ES_RSAESOAEP_SHA1_MGF1: u16 = 0x0003;
pub const ES_SYM_CBC_PKCS5PAD: u16 = 0x00FF;
pub const SS_NONE: u16 = 0x0001;
pub const SS_RSASSAPKCS1V15_SHA1: u16 = 0x0002;

/// NV index of the EK certificate on PC client TPM 1.2 chips.
pub const EK_CERT_NV_INDEX: u32 = 0x1000F000;

/// SHA-1 sized PCR value
pub const DIGEST_SIZE: usize = 20;

struct Tpm12Response {
    return_code: u32,
    data: Vec<u8>,
}

fn frame(ordinal: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = CommandBuffer::with_capacity(10 + body.len());
    buf.put_u16(TAG_RQU_COMMAND);
    buf.put_u32(10 + body.len() as u32);
    buf.put_u32(ordinal);
    buf.put_bytes(body);
    buf.into_vec()
}

fn parse_response(raw: &[u8]) -> Result<Tpm12Response> {
    let mut buf = ResponseBuffer::new(raw);
    let tag = buf.get_u16()?;
    let size = buf.get_u32()? as usize;
    let return_code = buf.get_u32()?;
    if tag != TAG_RSP_COMMAND {
        bail!("unexpected TPM 1.2 response tag 0x{tag:04x}");
    }
    if size < 10 || size > raw.len() {
        bail!("TPM 1.2 response size mismatch: {size} vs {}", raw.len());
    }
    Ok(Tpm12Response {
        return_code,
        data: raw[10..size].to_vec(),
    })
}

/// Raw TPM 1.2 command channel
pub struct Tpm12Context {
    transport: Box<dyn Transport>,
}

impl Tpm12Context {
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    fn call(&mut self, ordinal: u32, body: &[u8]) -> Result<Tpm12Response> {
        let raw = self
            .transport
            .transmit(&frame(ordinal, body))
            .with_context(|| format!("transport failure during TPM 1.2 ordinal 0x{ordinal:x}"))?;
        parse_response(&raw)
    }

    fn call_ok(&mut self, ordinal: u32, body: &[u8]) -> Result<Vec<u8>> {
        let rsp = self.call(ordinal, body)?;
        if rsp.return_code != 0 {
            bail!(
                "TPM 1.2 ordinal 0x{ordinal:x} failed: 0x{:08x}",
                rsp.return_code
            );
        }
        Ok(rsp.data)
    }

    pub fn version_info(&mut self) -> Result<TpmCapVersionInfo> {
        let mut body = CommandBuffer::new();
        body.put_u32(CAP_VERSION_VAL);
        body.put_u32(0);
        let data = self.call_ok(ordinal::GET_CAPABILITY, body.as_bytes())?;
        let mut buf = ResponseBuffer::new(&data);
        let size = buf.get_u32()? as usize;
        TpmCapVersionInfo::from_bytes(buf.take(size)?)
    }

    pub fn pcr_read(&mut self, index: u32) -> Result<Vec<u8>> {
        let data = self.call_ok(ordinal::PCR_READ, &index.to_be_bytes())?;
        let mut buf = ResponseBuffer::new(&data);
        buf.get_bytes(DIGEST_SIZE)
            .with_context(|| format!("short PCR {index} value"))
    }

    /// Read `size` bytes from an NV index; `None` when the TPM refuses
    pub fn nv_read_value(&mut self, index: u32, offset: u32, size: u32) -> Result<Option<Vec<u8>>> {
        let mut body = CommandBuffer::new();
        body.put_u32(index);
        body.put_u32(offset);
        body.put_u32(size);
        let rsp = self.call(ordinal::NV_READ_VALUE, body.as_bytes())?;
        if rsp.return_code != 0 {
            debug!(
                "NV_ReadValue 0x{index:08x} returned 0x{:x}",
                rsp.return_code
            );
            return Ok(None);
        }
        let mut buf = ResponseBuffer::new(&rsp.data);
        let len = buf.get_u32()? as usize;
        Ok(Some(buf.get_bytes(len)?))
    }

    /// TPM_ReadPubek; fails once an owner is installed on most chips
    pub fn read_pubek(&mut self, anti_replay: &[u8; DIGEST_SIZE]) -> Result<Tpm12PubKey> {
        let data = self.call_ok(ordinal::READ_PUBEK, anti_replay)?;
        let mut buf = ResponseBuffer::new(&data);
        let start = buf.position();
        let key = Tpm12PubKey::unmarshal(&mut buf)?;
        let raw = buf.consumed_since(start);
        let checksum = buf.get_bytes(DIGEST_SIZE)?;

        let mut hasher = Sha1::new();
        hasher.update(raw);
        hasher.update(anti_replay);
        if hasher.finalize().as_slice() != checksum.as_slice() {
            bail!("ReadPubek checksum mismatch");
        }
        Ok(key)
    }
}

/// TPM_CAP_VERSION_INFO
#[derive(Debug, Clone)]
pub struct TpmCapVersionInfo {
    pub major: u8,
    pub minor: u8,
    pub rev_major: u8,
    pub rev_minor: u8,
    pub spec_level: u16,
    pub errata_rev: u8,
    pub vendor_id: u32,
    pub vendor_specific: Vec<u8>,
}

impl Unmarshal for TpmCapVersionInfo {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        if tag != 0x0030 {
            bail!("unexpected TPM_CAP_VERSION_INFO tag 0x{tag:04x}");
        }
        Ok(Self {
            major: buf.get_u8()?,
            minor: buf.get_u8()?,
            rev_major: buf.get_u8()?,
            rev_minor: buf.get_u8()?,
            spec_level: buf.get_u16()?,
            errata_rev: buf.get_u8()?,
            vendor_id: buf.get_u32()?,
            vendor_specific: {
                let n = buf.get_u16()? as usize;
                buf.get_bytes(n)?
            },
        })
    }
}

/// TPM_PUBKEY for RSA keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm12PubKey {
    pub enc_scheme: u16,
    pub sig_scheme: u16,
    pub key_bits: u32,
    pub num_primes: u32,
    /// Empty means the default exponent 65537.
    pub exponent: Vec<u8>,
    pub modulus: Vec<u8>,
}

impl Tpm12PubKey {
    /// Identity key shape, as produced by TPM_MakeIdentity.
    pub fn identity(key: &RsaPublicKey) -> Self {
        Self {
            enc_scheme: 0x0001, // TPM_ES_NONE
            sig_scheme: SS_RSASSAPKCS1V15_SHA1,
            key_bits: (key.size() * 8) as u32,
            num_primes: 2,
            exponent: Vec::new(),
            modulus: key.n().to_bytes_be(),
        }
    }

    pub fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        let e = if self.exponent.is_empty() {
            BigUint::from(65537u32)
        } else {
            BigUint::from_bytes_be(&self.exponent)
        };
        RsaPublicKey::new(BigUint::from_bytes_be(&self.modulus), e)
            .context("invalid RSA key in TPM_PUBKEY")
    }
}

impl Marshal for Tpm12PubKey {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(ALG_RSA);
        buf.put_u16(self.enc_scheme);
        buf.put_u16(self.sig_scheme);
        buf.put_u32(12 + self.exponent.len() as u32);
        buf.put_u32(self.key_bits);
        buf.put_u32(self.num_primes);
        buf.put_u32(self.exponent.len() as u32);
        buf.put_bytes(&self.exponent);
        buf.put_u32(self.modulus.len() as u32);
        buf.put_bytes(&self.modulus);
    }
}

impl Unmarshal for Tpm12PubKey {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let alg = buf.get_u32()?;
        if alg != ALG_RSA {
            bail!("unsupported TPM 1.2 key algorithm 0x{alg:x}");
        }
        let enc_scheme = buf.get_u16()?;
        let sig_scheme = buf.get_u16()?;
        let parm_size = buf.get_u32()? as usize;
        let mut parms = ResponseBuffer::new(buf.take(parm_size)?);
        let key_bits = parms.get_u32()?;
        let num_primes = parms.get_u32()?;
        let exp_len = parms.get_u32()? as usize;
        let exponent = parms.get_bytes(exp_len)?;
        parms.ensure_empty().context("TPM_RSA_KEY_PARMS")?;
        let mod_len = buf.get_u32()? as usize;
        let modulus = buf.get_bytes(mod_len)?;
        Ok(Self {
            enc_scheme,
            sig_scheme,
            key_bits,
            num_primes,
            exponent,
            modulus,
        })
    }
}

/// TPM_QUOTE_INFO, the structure signed by TPM_Quote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmQuoteInfo {
    pub version: [u8; 4],
    pub composite_digest: Vec<u8>,
    pub external_data: Vec<u8>,
}

const QUOTE_FIXED: &[u8; 4] = b"QUOT";

impl Marshal for TpmQuoteInfo {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_bytes(&self.version);
        buf.put_bytes(QUOTE_FIXED);
        buf.put_bytes(&self.composite_digest);
        buf.put_bytes(&self.external_data);
    }
}

impl Unmarshal for TpmQuoteInfo {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let mut version = [0u8; 4];
        version.copy_from_slice(buf.take(4)?);
        if buf.take(4)? != QUOTE_FIXED {
            return Err(anyhow!("TPM_QUOTE_INFO fixed field is not QUOT"));
        }
        Ok(Self {
            version,
            composite_digest: buf.get_bytes(DIGEST_SIZE)?,
            external_data: buf.get_bytes(DIGEST_SIZE)?,
        })
    }
}

/// SHA-1 of TPM_PCR_COMPOSITE over `values`, which must be in ascending
/// index order.
pub fn pcr_composite_digest(values: &[(u32, &[u8])]) -> Result<Vec<u8>> {
    let mut select = [0u8; 3];
    let mut concatenated = Vec::with_capacity(values.len() * DIGEST_SIZE);
    let mut last = None;
    for &(index, value) in values {
        if index >= 24 || last.is_some_and(|l| l >= index) {
            bail!("PCR indices must be unique, ascending and below 24");
        }
        if value.len() != DIGEST_SIZE {
            bail!("PCR {index} is {} bytes, expected {DIGEST_SIZE}", value.len());
        }
        select[(index / 8) as usize] |= 1 << (index % 8);
        concatenated.extend_from_slice(value);
        last = Some(index);
    }

    let mut composite = CommandBuffer::new();
    composite.put_u16(select.len() as u16);
    composite.put_bytes(&select);
    composite.put_u32(concatenated.len() as u32);
    composite.put_bytes(&concatenated);
    Ok(Sha1::digest(composite.as_bytes()).to_vec())
}
