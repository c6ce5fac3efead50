// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x00000120,
    CreatePrimary = 0x00000131,
    CertifyCreation = 0x0000014A,
    NvRead = 0x0000014E,
    ActivateCredential = 0x00000147,
    PolicySecret = 0x00000151,
    Create = 0x00000153,
    Load = 0x00000157,
    Quote = 0x00000158,
    FlushContext = 0x00000165,
    NvReadPublic = 0x00000169,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    PcrRead = 0x0000017E,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x00000120 => TpmCc::EvictControl,
            0x00000131 => TpmCc::CreatePrimary,
            0x0000014A => TpmCc::CertifyCreation,
            0x0000014E => TpmCc::NvRead,
            0x00000147 => TpmCc::ActivateCredential,
            0x00000151 => TpmCc::PolicySecret,
            0x00000153 => TpmCc::Create,
            0x00000157 => TpmCc::Load,
            0x00000158 => TpmCc::Quote,
            0x00000165 => TpmCc::FlushContext,
            0x00000169 => TpmCc::NvReadPublic,
            0x00000173 => TpmCc::ReadPublic,
            0x00000176 => TpmCc::StartAuthSession,
            0x0000017A => TpmCc::GetCapability,
            0x0000017E => TpmCc::PcrRead,
            _ => return None,
        })
    }
}

/// Selected TPM 2.0 response codes (TPM_RC)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;
    pub const BAD_TAG: u32 = 0x01E;
    pub const FAILURE: u32 = 0x101;
    pub const HANDLE: u32 = 0x08B;
    pub const NV_UNINITIALIZED: u32 = 0x14A;
    pub const INTEGRITY: u32 = 0x09F;
    pub const VALUE: u32 = 0x084;
    pub const SIZE: u32 = 0x095;
    pub const POLICY_FAIL: u32 = 0x099;
    pub const AUTH_FAIL: u32 = 0x08E;

    /// Flag set on format-one codes that name a handle, session or parameter.
    pub const FMT1: u32 = 0x080;

    /// Strip the handle/session/parameter number from a format-one code.
    pub fn base(code: u32) -> u32 {
        if code & FMT1 != 0 {
            code & 0xBF
        } else {
            code
        }
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Aes = 0x0006,
    KeyedHash = 0x0008,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    Oaep = 0x0017,
    Ecc = 0x0023,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => TpmAlgId::Rsa,
            0x0004 => TpmAlgId::Sha1,
            0x0006 => TpmAlgId::Aes,
            0x0008 => TpmAlgId::KeyedHash,
            0x000B => TpmAlgId::Sha256,
            0x000C => TpmAlgId::Sha384,
            0x000D => TpmAlgId::Sha512,
            0x0010 => TpmAlgId::Null,
            0x0014 => TpmAlgId::RsaSsa,
            0x0016 => TpmAlgId::RsaPss,
            0x0017 => TpmAlgId::Oaep,
            0x0023 => TpmAlgId::Ecc,
            0x0043 => TpmAlgId::Cfb,
            _ => return None,
        })
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    /// Hash `data` with this algorithm; `None` for non-hash algorithms.
    pub fn digest(self, data: &[u8]) -> Option<Vec<u8>> {
        Some(match self {
            TpmAlgId::Sha1 => Sha1::digest(data).to_vec(),
            TpmAlgId::Sha256 => Sha256::digest(data).to_vec(),
            TpmAlgId::Sha384 => Sha384::digest(data).to_vec(),
            TpmAlgId::Sha512 => Sha512::digest(data).to_vec(),
            _ => return None,
        })
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const ENDORSEMENT: u32 = 0x4000000B;
}

/// Well-known persistent handles and NV indices used for attestation.
pub mod tpm_handle {
    /// Storage root key, per the TCG provisioning guidance.
    pub const SRK: u32 = 0x81000001;
    /// RSA endorsement key.
    pub const EK: u32 = 0x81010001;
    /// RSA 2048 EK certificate NV index.
    pub const EK_CERT_NV_INDEX: u32 = 0x01C00002;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
    Pcrs = 0x00000005,
    TpmProperties = 0x00000006,
}

/// Fixed TPM properties (TPM_PT), PT_FIXED based
pub mod tpm_pt {
    pub const FIXED: u32 = 0x100;
    pub const MANUFACTURER: u32 = FIXED + 5;
    pub const VENDOR_STRING_1: u32 = FIXED + 6;
    pub const VENDOR_STRING_2: u32 = FIXED + 7;
    pub const VENDOR_STRING_3: u32 = FIXED + 8;
    pub const VENDOR_STRING_4: u32 = FIXED + 9;
    pub const FIRMWARE_VERSION_1: u32 = FIXED + 11;
}

/// `TPM_GENERATED_VALUE`, the magic prefix of every TPMS_ATTEST.
pub const TPM_GENERATED_VALUE: u32 = 0xff544347;

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_admin_with_policy(mut self) -> Self {
        self.0 |= Self::ADMIN_WITH_POLICY;
        self
    }

    pub fn with_no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_sign_encrypt(mut self) -> Self {
        self.0 |= Self::SIGN_ENCRYPT;
        self
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
}

/// TPM structure tags (TPM_ST)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    /// Also the tag of every TPM 1.2 response.
    RspCommand = 0x00C4,
    Null = 0x8000,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    AttestQuote = 0x8018,
    AttestCreation = 0x801A,
    Creation = 0x8021,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x00C4 => TpmSt::RspCommand,
            0x8000 => TpmSt::Null,
            0x8001 => TpmSt::NoSessions,
            0x8002 => TpmSt::Sessions,
            0x8018 => TpmSt::AttestQuote,
            0x801A => TpmSt::AttestCreation,
            0x8021 => TpmSt::Creation,
            _ => return None,
        })
    }
}

/// Number of PCRs in a PC client bank.
pub const PCR_COUNT: u32 = 24;
