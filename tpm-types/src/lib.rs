// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM Types - attestation data model shared by both sides of the wire
//!
//! This crate contains type definitions shared across TPM-related crates:
//! - tpm-attest (device side - creates AIKs, quotes, activates credentials)
//! - tpm-qvl (verifier side - issues challenges, verifies quotes)
//!
//! The serde representation of these types is the exchange schema between a
//! device and a remote verifier. It is one tagged-union schema for both TPM
//! generations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use tpm2::TpmAlgId;

mod error;

pub use error::{Error, Result};

/// Number of PCRs in a PC client bank
pub const PCR_COUNT: u32 = tpm2::PCR_COUNT;

/// TPM specification family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TpmVersion {
    #[serde(rename = "1.2")]
    V12,
    #[serde(rename = "2.0")]
    V20,
}

impl fmt::Display for TpmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TpmVersion::V12 => "1.2",
            TpmVersion::V20 => "2.0",
        })
    }
}

impl FromStr for TpmVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1.2" => Ok(TpmVersion::V12),
            "2.0" => Ok(TpmVersion::V20),
            other => Err(Error::not_supported(format!("TPM version {other}"))),
        }
    }
}

/// How the TPM is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpmInterface {
    /// Raw character device, no resource manager
    Direct,
    /// In-kernel resource manager (`/dev/tpmrm0`)
    KernelManaged,
    /// A TSS daemon owns the device
    Daemon,
}

/// TCG registered vendor ID, the ASCII manufacturer code packed big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcgVendorId(pub u32);

const VENDORS: &[(u32, &str)] = &[
    (0x414D4400, "AMD"),
    (0x41544D4C, "Atmel"),
    (0x4252434D, "Broadcom"),
    (0x4353434F, "Cisco"),
    (0x464C5953, "Flyslice Technologies"),
    (0x524F4343, "Fuzhou Rockchip"),
    (0x474F4F47, "Google"),
    (0x48504900, "HPI"),
    (0x48504500, "HPE"),
    (0x48495349, "Huawei"),
    (0x49424D00, "IBM"),
    (0x49465800, "Infineon"),
    (0x494E5443, "Intel"),
    (0x4C454E00, "Lenovo"),
    (0x4D534654, "Microsoft"),
    (0x4E534D20, "National Semiconductor"),
    (0x4E545A00, "Nationz"),
    (0x4E544300, "Nuvoton Technology"),
    (0x51434F4D, "Qualcomm"),
    (0x534D5343, "SMSC"),
    (0x53544D20, "ST Microelectronics"),
    (0x534D534E, "Samsung"),
    (0x534E5300, "Sinosun"),
    (0x54584E00, "Texas Instruments"),
    (0x57454300, "Winbond"),
];

impl TcgVendorId {
    pub const INTEL: TcgVendorId = TcgVendorId(0x494E5443);

    /// Human readable manufacturer name, if registered
    pub fn name(&self) -> Option<&'static str> {
        VENDORS
            .iter()
            .find(|(id, _)| *id == self.0)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for TcgVendorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown vendor 0x{:08x}", self.0),
        }
    }
}

/// Snapshot of the TPM identity, read once when a session opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmInfo {
    #[serde(rename = "tpm_version")]
    pub version: TpmVersion,
    pub manufacturer: TcgVendorId,
    #[serde(rename = "interface_kind")]
    pub interface: TpmInterface,
    #[serde(rename = "opaque_vendor_info")]
    pub vendor_info: String,
    #[serde(default)]
    pub firmware_major: u16,
    #[serde(default)]
    pub firmware_minor: u16,
}

/// Hash algorithms a PCR bank or quote may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn alg_id(self) -> TpmAlgId {
        match self {
            HashAlg::Sha1 => TpmAlgId::Sha1,
            HashAlg::Sha256 => TpmAlgId::Sha256,
            HashAlg::Sha384 => TpmAlgId::Sha384,
            HashAlg::Sha512 => TpmAlgId::Sha512,
        }
    }

    pub fn from_alg_id(alg: TpmAlgId) -> Option<Self> {
        Some(match alg {
            TpmAlgId::Sha1 => HashAlg::Sha1,
            TpmAlgId::Sha256 => HashAlg::Sha256,
            TpmAlgId::Sha384 => HashAlg::Sha384,
            TpmAlgId::Sha512 => HashAlg::Sha512,
            _ => return None,
        })
    }

    pub fn digest_size(self) -> usize {
        self.alg_id().digest_size()
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        // every variant maps to a hash algorithm
        self.alg_id().digest(data).unwrap_or_default()
    }
}

/// One platform configuration register value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pcr {
    pub index: u32,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    pub digest_alg: HashAlg,
}

impl Pcr {
    pub fn new(index: u32, digest: Vec<u8>, digest_alg: HashAlg) -> Result<Self> {
        let pcr = Self {
            index,
            digest,
            digest_alg,
        };
        pcr.validate()?;
        Ok(pcr)
    }

    /// Values that arrive through deserialization skip [`Pcr::new`].
    pub fn validate(&self) -> Result<()> {
        if self.index >= PCR_COUNT {
            return Err(Error::invalid_input(format!(
                "PCR index {} out of range",
                self.index
            )));
        }
        if self.digest.len() != self.digest_alg.digest_size() {
            return Err(Error::invalid_input(format!(
                "PCR {} digest is {} bytes, {:?} needs {}",
                self.index,
                self.digest.len(),
                self.digest_alg,
                self.digest_alg.digest_size()
            )));
        }
        Ok(())
    }
}

/// A signed statement over PCR state and a caller nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub version: TpmVersion,
    /// TPMS_ATTEST (2.0) or TPM_QUOTE_INFO (1.2)
    #[serde(with = "hex_bytes")]
    pub quote: Vec<u8>,
    /// TPMT_SIGNATURE (2.0) or raw PKCS#1 v1.5 signature (1.2)
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// Authoritative representation of an endorsement key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "datatype", content = "bytes", rename_all = "snake_case")]
pub enum EkData {
    /// PKIX SubjectPublicKeyInfo, DER
    RawPublic(#[serde(with = "hex_bytes")] Vec<u8>),
    /// X.509 certificate, DER
    Certificate(#[serde(with = "hex_bytes")] Vec<u8>),
}

/// AIK parameters needed by credential activation and verifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AikInfo {
    Tpm20 {
        /// TPMT_PUBLIC
        #[serde(with = "hex_bytes")]
        public_blob: Vec<u8>,
        /// TPMS_CREATION_DATA
        #[serde(with = "hex_bytes")]
        creation_data: Vec<u8>,
        /// TPMS_ATTEST from CertifyCreation
        #[serde(with = "hex_bytes")]
        attestation_data: Vec<u8>,
        /// TPMT_SIGNATURE over `attestation_data`
        #[serde(with = "hex_bytes")]
        signature_data: Vec<u8>,
    },
    Tpm12 {
        /// TPM_PUBKEY
        #[serde(with = "hex_bytes")]
        public_blob: Vec<u8>,
        #[serde(with = "hex_bytes")]
        auxiliary_data: Vec<u8>,
    },
}

impl AikInfo {
    pub fn version(&self) -> TpmVersion {
        match self {
            AikInfo::Tpm20 { .. } => TpmVersion::V20,
            AikInfo::Tpm12 { .. } => TpmVersion::V12,
        }
    }

    pub fn public_blob(&self) -> &[u8] {
        match self {
            AikInfo::Tpm20 { public_blob, .. } | AikInfo::Tpm12 { public_blob, .. } => public_blob,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    /// Privacy-CA style credential activation
    Ca,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeInfo {
    #[serde(rename = "type")]
    pub kind: ChallengeType,
}

impl Default for ChallengeInfo {
    fn default() -> Self {
        Self {
            kind: ChallengeType::Ca,
        }
    }
}

/// Credential activation challenge, opaque to everyone but the TPM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    /// TPM2B_ID_OBJECT payload (2.0) or TPM_SYM_CA_ATTESTATION (1.2)
    #[serde(with = "hex_bytes")]
    pub credential: Vec<u8>,
    /// Seed or symmetric key wrapped to the EK
    #[serde(with = "hex_bytes")]
    pub secret: Vec<u8>,
}

/// Everything a device sends to a verifier to start attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRequest {
    pub tpm_info: TpmInfo,
    pub ek: EkData,
    pub aik_info: AikInfo,
    #[serde(default)]
    pub challenge_info: ChallengeInfo,
}
