// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::RsaPublicKey;

use tpm_types::{EkData, Error, Result, TcgVendorId};

use crate::cert::{parse_ek_certificate, EkCertificate};
use crate::url::vendor_certificate_url;

/// An endorsement key as reported by a TPM or received by a verifier.
///
/// `data` is authoritative; `public` is always derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndorsementKey {
    pub data: EkData,
    pub public: RsaPublicKey,
    /// Vendor service that may hold the certificate for a bare public key.
    pub certificate_url: Option<String>,
}

impl EndorsementKey {
    pub fn from_certificate(cert: &EkCertificate) -> Result<Self> {
        Ok(Self {
            public: cert.public_key()?,
            data: EkData::Certificate(cert.der.clone()),
            certificate_url: None,
        })
    }

    pub fn from_public(public: RsaPublicKey) -> Result<Self> {
        let spki = public
            .to_public_key_der()
            .context("failed to encode EK public key")
            .map_err(Error::Parse)?;
        Ok(Self {
            data: EkData::RawPublic(spki.as_bytes().to_vec()),
            public,
            certificate_url: None,
        })
    }

    /// Bare public key, annotated with the manufacturer's certificate service.
    pub fn from_public_for_vendor(public: RsaPublicKey, manufacturer: TcgVendorId) -> Result<Self> {
        let mut ek = Self::from_public(public)?;
        ek.certificate_url = vendor_certificate_url(manufacturer, &ek.public);
        Ok(ek)
    }

    /// Rebuild from the exchange schema.
    pub fn from_data(data: EkData) -> Result<Self> {
        match data {
            EkData::Certificate(der) => Self::from_certificate(&parse_ek_certificate(&der)?),
            EkData::RawPublic(spki) => {
                let public = RsaPublicKey::from_public_key_der(&spki)
                    .context("invalid EK SubjectPublicKeyInfo")
                    .map_err(Error::Parse)?;
                Ok(Self {
                    data: EkData::RawPublic(spki),
                    public,
                    certificate_url: None,
                })
            }
        }
    }

    pub fn certificate(&self) -> Option<&[u8]> {
        match &self.data {
            EkData::Certificate(der) => Some(der),
            EkData::RawPublic(_) => None,
        }
    }
}
