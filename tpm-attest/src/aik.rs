// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Attestation identity keys

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use tracing::debug;
use zeroize::Zeroizing;

use tpm2::tpm12::Tpm12PubKey;
use tpm2::{TpmtPublic, Unmarshal};
use tpm_types::{AikInfo, EncryptedCredential, Error, HashAlg, Quote, Result, TpmVersion};

use crate::{AikConfig, Tpm};

/// Largest qualifying data a TPM 2.0 quote accepts (TPM2B_DATA of SHA-512).
pub const MAX_NONCE_SIZE_20: usize = 64;
/// TPM 1.2 quotes take exactly one SHA-1 sized nonce.
pub const NONCE_SIZE_12: usize = 20;

const BLOB_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AikBlob {
    format: u32,
    tpm_version: TpmVersion,
    key: KeyBlob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum KeyBlob {
    Tpm20 {
        parent: u32,
        #[serde(with = "hex_bytes")]
        private_blob: Vec<u8>,
        #[serde(with = "hex_bytes")]
        public_blob: Vec<u8>,
        #[serde(with = "hex_bytes")]
        creation_data: Vec<u8>,
        #[serde(with = "hex_bytes")]
        attestation_data: Vec<u8>,
        #[serde(with = "hex_bytes")]
        signature_data: Vec<u8>,
    },
    Tpm12 {
        #[serde(with = "hex_bytes")]
        key_blob: Vec<u8>,
        #[serde(with = "hex_bytes")]
        public_blob: Vec<u8>,
        #[serde(with = "hex_bytes")]
        auxiliary_data: Vec<u8>,
    },
}

impl KeyBlob {
    fn version(&self) -> TpmVersion {
        match self {
            KeyBlob::Tpm20 { .. } => TpmVersion::V20,
            KeyBlob::Tpm12 { .. } => TpmVersion::V12,
        }
    }

    fn attestation_parameters(&self) -> AikInfo {
        match self.clone() {
            KeyBlob::Tpm20 {
                public_blob,
                creation_data,
                attestation_data,
                signature_data,
                ..
            } => AikInfo::Tpm20 {
                public_blob,
                creation_data,
                attestation_data,
                signature_data,
            },
            KeyBlob::Tpm12 {
                public_blob,
                auxiliary_data,
                ..
            } => AikInfo::Tpm12 {
                public_blob,
                auxiliary_data,
            },
        }
    }
}

/// An AIK loaded into a TPM session.
///
/// Must be closed with [`Aik::close`] on every path once created or loaded;
/// the owning session releases anything left over when it closes.
#[derive(Debug)]
pub struct Aik {
    handle: Option<u32>,
    key: KeyBlob,
}

impl Aik {
    pub(crate) fn create(tpm: &mut Tpm, config: &AikConfig) -> Result<Self> {
        let (handle, key) = match tpm {
            Tpm::V20(session) => {
                let parent = config.parent_handle();
                let aik = session.create_aik(parent)?;
                let key = KeyBlob::Tpm20 {
                    parent,
                    private_blob: aik.object.private,
                    public_blob: aik.object.public,
                    creation_data: aik.object.creation_data,
                    attestation_data: aik.certification.attest,
                    signature_data: aik.certification.signature,
                };
                (aik.handle, key)
            }
            Tpm::V12(session) => {
                let (handle, identity) = session.make_identity()?;
                let key = KeyBlob::Tpm12 {
                    key_blob: identity.key_blob,
                    public_blob: identity.public_blob,
                    auxiliary_data: identity.auxiliary_data,
                };
                (handle, key)
            }
        };
        debug!("created AIK with handle 0x{handle:08x}");
        Ok(Self {
            handle: Some(handle),
            key,
        })
    }

    pub(crate) fn load(tpm: &mut Tpm, blob: &[u8]) -> Result<Self> {
        let parsed: AikBlob = serde_json::from_slice(blob)
            .map_err(|e| Error::Format(format!("not a serialized AIK: {e}")))?;
        if parsed.format != BLOB_FORMAT {
            return Err(Error::Format(format!(
                "unknown AIK blob format {}",
                parsed.format
            )));
        }
        if parsed.tpm_version != parsed.key.version() {
            return Err(Error::Format(format!(
                "AIK blob tagged {} holds a TPM {} key",
                parsed.tpm_version,
                parsed.key.version()
            )));
        }
        if parsed.tpm_version != tpm.version() {
            return Err(Error::invalid_input(format!(
                "TPM {} AIK cannot be loaded into a TPM {} session",
                parsed.tpm_version,
                tpm.version()
            )));
        }

        let handle = match (&mut *tpm, &parsed.key) {
            (
                Tpm::V20(session),
                KeyBlob::Tpm20 {
                    parent,
                    private_blob,
                    public_blob,
                    ..
                },
            ) => session.load(*parent, private_blob, public_blob)?,
            (Tpm::V12(session), KeyBlob::Tpm12 { key_blob, .. }) => session.load_key(key_blob)?,
            _ => return Err(Error::invalid_input("AIK does not match the session")),
        };
        debug!("loaded AIK with handle 0x{handle:08x}");
        Ok(Self {
            handle: Some(handle),
            key: parsed.key,
        })
    }

    pub fn version(&self) -> TpmVersion {
        self.key.version()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    fn loaded_in(&self, tpm: &Tpm) -> Result<u32> {
        let handle = self
            .handle
            .ok_or_else(|| Error::invalid_input("AIK is closed"))?;
        if tpm.version() != self.version() {
            return Err(Error::invalid_input(format!(
                "TPM {} AIK used with a TPM {} session",
                self.version(),
                tpm.version()
            )));
        }
        Ok(handle)
    }

    /// Opaque, version tagged blob accepted by [`Tpm::load_aik`].
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(Error::invalid_input("AIK is closed"));
        }
        let blob = AikBlob {
            format: BLOB_FORMAT,
            tpm_version: self.version(),
            key: self.key.clone(),
        };
        serde_json::to_vec(&blob).map_err(|e| Error::Format(e.to_string()))
    }

    pub fn attestation_parameters(&self) -> AikInfo {
        self.key.attestation_parameters()
    }

    pub fn public_key(&self) -> Result<RsaPublicKey> {
        let parsed = match &self.key {
            KeyBlob::Tpm20 { public_blob, .. } => {
                TpmtPublic::from_bytes_exact(public_blob).and_then(|p| p.rsa_public_key())
            }
            KeyBlob::Tpm12 { public_blob, .. } => {
                Tpm12PubKey::from_bytes_exact(public_blob).and_then(|p| p.rsa_public_key())
            }
        };
        parsed.map_err(Error::Parse)
    }

    /// Sign the full PCR bank of `alg` together with `nonce`.
    pub fn quote(&self, tpm: &mut Tpm, nonce: &[u8], alg: HashAlg) -> Result<Quote> {
        let handle = self.loaded_in(tpm)?;
        let signed = match tpm {
            Tpm::V20(session) => {
                if nonce.len() > MAX_NONCE_SIZE_20 {
                    return Err(Error::invalid_input(format!(
                        "nonce of {} bytes exceeds {MAX_NONCE_SIZE_20}",
                        nonce.len()
                    )));
                }
                session.quote(handle, nonce, alg)?
            }
            Tpm::V12(session) => {
                if alg != HashAlg::Sha1 {
                    return Err(Error::not_supported(format!(
                        "TPM 1.2 cannot quote a {alg:?} bank"
                    )));
                }
                let nonce: &[u8; NONCE_SIZE_12] = nonce.try_into().map_err(|_| {
                    Error::invalid_input(format!(
                        "TPM 1.2 nonce must be {NONCE_SIZE_12} bytes, got {}",
                        nonce.len()
                    ))
                })?;
                session.quote(handle, nonce)?
            }
        };
        Ok(Quote {
            version: self.version(),
            quote: signed.attest,
            signature: signed.signature,
        })
    }

    /// Decrypt a credential challenge; only the TPM holding both this AIK and
    /// the EK it was issued for can.
    pub fn activate_credential(
        &self,
        tpm: &mut Tpm,
        challenge: &EncryptedCredential,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let handle = self.loaded_in(tpm)?;
        let secret = match tpm {
            Tpm::V20(session) => {
                session.activate_credential(handle, &challenge.credential, &challenge.secret)?
            }
            Tpm::V12(session) => {
                session.activate_identity(handle, &challenge.secret, &challenge.credential)?
            }
        };
        Ok(Zeroizing::new(secret))
    }

    /// Release the key handle. Closing twice is a no-op.
    pub fn close(&mut self, tpm: &mut Tpm) -> Result<()> {
        let Some(handle) = self.handle else {
            return Ok(());
        };
        if tpm.version() != self.version() {
            return Err(Error::invalid_input("AIK belongs to another TPM session"));
        }
        let released = match tpm {
            Tpm::V20(session) => session.flush(handle),
            Tpm::V12(session) => session.unload_key(handle),
        };
        self.handle = None;
        debug!("closed AIK 0x{handle:08x}");
        released
    }
}
