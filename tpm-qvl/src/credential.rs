// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Credential activation challenges
//!
//! The verifier wraps a fresh secret so that only a TPM holding both the EK
//! private key and an AIK with the expected name can recover it.

use aes::Aes128;
use anyhow::{anyhow, Context};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::BlockEncryptMut;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use tpm2::tpm12::{ALG_AES128, ES_SYM_CBC_PKCS5PAD, SS_NONE};
use tpm2::{Attested, CommandBuffer, TpmaObject, TpmsAttest, TpmtPublic, TpmtSignature, Unmarshal};
use tpm_ek::EndorsementKey;
use tpm_types::{AikInfo, EncryptedCredential, Error, Result, TpmVersion};

use crate::verify::verify_tpm_signature;

/// Size of the generated secret.
pub const SECRET_SIZE: usize = 32;

const AES128_KEY_SIZE: usize = 16;
const AES_BLOCK_SIZE: usize = 16;

/// KDFa from TPM 2.0 Part 1, 11.4.10.2, with HMAC-SHA256.
pub fn kdfa(
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> anyhow::Result<Zeroizing<Vec<u8>>> {
    let len = bits.div_ceil(8) as usize;
    let mut out = Zeroizing::new(Vec::with_capacity(len));
    let mut counter: u32 = 0;
    while out.len() < len {
        counter += 1;
        let mut mac = Hmac::<Sha256>::new_from_slice(key).context("invalid KDFa key")?;
        mac.update(&counter.to_be_bytes());
        mac.update(label.as_bytes());
        mac.update(&[0]);
        mac.update(context_u);
        mac.update(context_v);
        mac.update(&bits.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
    }
    out.truncate(len);
    Ok(out)
}

/// TPM2_MakeCredential in software, for an EK following the default RSA
/// template (SHA-256 name, AES-128-CFB).
pub fn make_credential<R: CryptoRng + RngCore>(
    rng: &mut R,
    ek: &RsaPublicKey,
    name: &[u8],
    secret: &[u8],
) -> anyhow::Result<EncryptedCredential> {
    let mut seed = Zeroizing::new([0u8; 32]);
    rng.fill_bytes(seed.as_mut());
    let encrypted_seed = ek
        .encrypt(rng, Oaep::new_with_label::<Sha256, _>("IDENTITY\0"), seed.as_ref())
        .context("failed to wrap seed to EK")?;

    let sym_key = kdfa(seed.as_ref(), "STORAGE", name, &[], 128)?;
    let mut enc_identity = CommandBuffer::new();
    enc_identity.put_tpm2b(secret);
    let mut enc_identity = enc_identity.into_vec();
    cfb_mode::Encryptor::<Aes128>::new_from_slices(&sym_key, &[0u8; AES_BLOCK_SIZE])
        .map_err(|e| anyhow!("invalid credential key: {e}"))?
        .encrypt(&mut enc_identity);

    let hmac_key = kdfa(seed.as_ref(), "INTEGRITY", &[], &[], 256)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&hmac_key).context("invalid HMAC key")?;
    mac.update(&enc_identity);
    mac.update(name);
    let outer_hmac = mac.finalize().into_bytes();

    let mut credential = CommandBuffer::new();
    credential.put_tpm2b(&outer_hmac);
    credential.put_bytes(&enc_identity);
    Ok(EncryptedCredential {
        credential: credential.into_vec(),
        secret: encrypted_seed,
    })
}

/// TPM 1.2 challenge in the TCPA format accepted by TPM_ActivateIdentity.
///
/// `secret` holds TPM_SYM_CA_ATTESTATION, `credential` is wrapped to the EK.
fn make_credential_tpm12<R: CryptoRng + RngCore>(
    rng: &mut R,
    ek: &RsaPublicKey,
    aik_public: &[u8],
    secret: &[u8],
) -> anyhow::Result<EncryptedCredential> {
    let mut key = Zeroizing::new([0u8; AES128_KEY_SIZE]);
    rng.fill_bytes(key.as_mut());
    let mut iv = [0u8; AES_BLOCK_SIZE];
    rng.fill_bytes(&mut iv);

    // TPM_ASYM_CA_CONTENTS: TPM_SYMMETRIC_KEY followed by the AIK digest
    let mut asym = CommandBuffer::new();
    asym.put_u32(ALG_AES128);
    asym.put_u16(ES_SYM_CBC_PKCS5PAD);
    asym.put_u16(AES128_KEY_SIZE as u16);
    asym.put_bytes(key.as_ref());
    asym.put_bytes(&Sha1::digest(aik_public));
    let asym = Zeroizing::new(asym.into_vec());
    let asym_blob = ek
        .encrypt(rng, Oaep::new_with_label::<Sha1, _>("TCPA"), &asym)
        .context("failed to wrap session key to EK")?;

    let ciphertext = cbc::Encryptor::<Aes128>::new_from_slices(key.as_ref(), &iv)
        .map_err(|e| anyhow!("invalid session key: {e}"))?
        .encrypt_padded_vec_mut::<Pkcs7>(secret);

    // TPM_SYM_CA_ATTESTATION
    let mut sym = CommandBuffer::new();
    sym.put_u32((iv.len() + ciphertext.len()) as u32);
    sym.put_u32(ALG_AES128);
    sym.put_u16(ES_SYM_CBC_PKCS5PAD);
    sym.put_u16(SS_NONE);
    sym.put_u32(12);
    sym.put_u32(128); // keyLength
    sym.put_u32(AES_BLOCK_SIZE as u32);
    sym.put_u32(0); // ivSize
    sym.put_bytes(&iv);
    sym.put_bytes(&ciphertext);

    Ok(EncryptedCredential {
        credential: sym.into_vec(),
        secret: asym_blob,
    })
}

/// Check that a 2.0 AIK is a TPM-resident restricted signing key and return
/// its name.
pub fn validate_aik20(
    public_blob: &[u8],
    creation_data: &[u8],
    attestation_data: &[u8],
    signature_data: &[u8],
) -> Result<Vec<u8>> {
    let public = TpmtPublic::from_bytes_exact(public_blob)
        .map_err(|e| Error::invalid_input(format!("AIK public area: {e:#}")))?;
    let attrs = public.object_attributes;
    let required = [
        (TpmaObject::FIXED_TPM, "fixedTPM"),
        (TpmaObject::FIXED_PARENT, "fixedParent"),
        (TpmaObject::SENSITIVE_DATA_ORIGIN, "sensitiveDataOrigin"),
        (TpmaObject::RESTRICTED, "restricted"),
        (TpmaObject::SIGN_ENCRYPT, "sign"),
    ];
    for (bit, name) in required {
        if !attrs.contains(bit) {
            return Err(Error::invalid_input(format!("AIK is not {name}")));
        }
    }
    if attrs.contains(TpmaObject::DECRYPT) {
        return Err(Error::invalid_input("AIK must not be a decryption key"));
    }
    if creation_data.is_empty() {
        return Err(Error::invalid_input("AIK creation data is missing"));
    }

    let name = public
        .name()
        .map_err(|e| Error::invalid_input(format!("AIK name: {e:#}")))?;
    let attest = TpmsAttest::from_bytes_exact(attestation_data)
        .map_err(|e| Error::invalid_input(format!("AIK creation attestation: {e:#}")))?;
    let Attested::Creation {
        object_name,
        creation_hash,
    } = &attest.attested
    else {
        return Err(Error::invalid_input(
            "AIK attestation is not a creation certification",
        ));
    };
    if *object_name != name {
        return Err(Error::invalid_input(
            "AIK creation attestation names a different object",
        ));
    }
    let expected_hash = public
        .name_alg
        .digest(creation_data)
        .ok_or_else(|| Error::invalid_input("AIK name algorithm is not a hash"))?;
    if *creation_hash != expected_hash {
        return Err(Error::invalid_input(
            "AIK creation hash does not match creation data",
        ));
    }

    let key = public
        .rsa_public_key()
        .map_err(|e| Error::invalid_input(format!("AIK key: {e:#}")))?;
    let signature = TpmtSignature::from_bytes_exact(signature_data)
        .map_err(|e| Error::invalid_input(format!("AIK creation signature: {e:#}")))?;
    verify_tpm_signature(&key, attestation_data, &signature).map_err(|e| {
        Error::invalid_input(format!("AIK creation signature does not verify: {e}"))
    })?;
    Ok(name)
}

/// Inputs to a credential activation challenge.
#[derive(Debug, Clone, Copy)]
pub struct ActivationParameters<'a> {
    pub tpm_version: TpmVersion,
    pub aik: &'a AikInfo,
    pub ek: &'a EndorsementKey,
}

impl ActivationParameters<'_> {
    /// Create a secret and the challenge that releases it on the device.
    ///
    /// Keep the secret; send the challenge. Trust is established only if the
    /// device returns exactly this secret.
    pub fn generate(&self) -> Result<(Zeroizing<Vec<u8>>, EncryptedCredential)> {
        self.generate_with_rng(&mut rand::thread_rng())
    }

    pub fn generate_with_rng<R: CryptoRng + RngCore>(
        &self,
        rng: &mut R,
    ) -> Result<(Zeroizing<Vec<u8>>, EncryptedCredential)> {
        if self.aik.version() != self.tpm_version {
            return Err(Error::invalid_input(format!(
                "TPM {} parameters carry a TPM {} AIK",
                self.tpm_version,
                self.aik.version()
            )));
        }

        let mut secret = Zeroizing::new(vec![0u8; SECRET_SIZE]);
        rng.fill_bytes(&mut secret);

        let challenge = match self.aik {
            AikInfo::Tpm20 {
                public_blob,
                creation_data,
                attestation_data,
                signature_data,
            } => {
                let name =
                    validate_aik20(public_blob, creation_data, attestation_data, signature_data)?;
                make_credential(rng, &self.ek.public, &name, &secret)
            }
            AikInfo::Tpm12 { public_blob, .. } => {
                make_credential_tpm12(rng, &self.ek.public, public_blob, &secret)
            }
        }
        .map_err(|e| Error::invalid_input(format!("failed to build challenge: {e:#}")))?;

        debug!("generated TPM {} activation challenge", self.tpm_version);
        Ok((secret, challenge))
    }
}
