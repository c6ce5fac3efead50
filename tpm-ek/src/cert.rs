// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Endorsement key certificate parsing
//!
//! EK certificates come out of NVRAM and vendor services in several slightly
//! broken shapes. Parsing is strict first; known harmless deviations are then
//! retried on the TLV-bounded certificate only, as permitted by
//! [`CertParsePolicy`].

use anyhow::{anyhow, bail, Context};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x509_parser::der_parser::ber::parse_ber;
use x509_parser::prelude::*;

use tpm_types::{Error, Result};

/// TCG PC Client platform NVRAM certificate header: tag `0x1001`, a zero
/// byte, then a big-endian u16 certificate length.
const NV_HEADER_TAG: [u8; 3] = [0x10, 0x01, 0x00];
const NV_HEADER_LEN: usize = 5;

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];

/// Which certificate deviations are tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertParsePolicy {
    /// Strip the 5-byte NVRAM header when present.
    pub unwrap_nv_header: bool,
    /// Accept bytes after the outer certificate TLV.
    pub tolerate_trailing_data: bool,
    /// Upper bound on tolerated trailing bytes; `None` is unbounded.
    pub max_trailing_bytes: Option<usize>,
}

impl Default for CertParsePolicy {
    fn default() -> Self {
        Self {
            unwrap_nv_header: true,
            tolerate_trailing_data: true,
            max_trailing_bytes: None,
        }
    }
}

impl CertParsePolicy {
    /// Only the NVRAM header is tolerated.
    pub fn strict() -> Self {
        Self {
            unwrap_nv_header: true,
            tolerate_trailing_data: false,
            max_trailing_bytes: Some(0),
        }
    }

    fn allows_trailing(&self, n: usize) -> bool {
        self.tolerate_trailing_data && self.max_trailing_bytes.map_or(true, |max| n <= max)
    }
}

/// A parsed EK certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EkCertificate {
    /// The certificate DER, without NVRAM header or trailing bytes.
    pub der: Vec<u8>,
    /// Whether the input carried the NVRAM header.
    pub was_wrapped: bool,
    /// Number of bytes dropped after the certificate.
    pub trailing_bytes: usize,
}

impl EkCertificate {
    fn x509(&self) -> Result<X509Certificate<'_>> {
        parse_strict(&self.der).map_err(Error::Parse)
    }

    pub fn public_key(&self) -> Result<RsaPublicKey> {
        let cert = self.x509()?;
        let spki = cert.public_key();
        let oid: Vec<u64> = spki
            .algorithm
            .algorithm
            .iter()
            .ok_or_else(|| Error::Parse(anyhow!("invalid public key algorithm OID")))?
            .collect();
        if oid != OID_RSA_ENCRYPTION {
            return Err(Error::not_supported(format!(
                "EK public key algorithm {oid:?}"
            )));
        }
        let key = RsaPublicKey::from_pkcs1_der(spki.subject_public_key.data.as_ref())
            .context("failed to decode RSA public key from EK certificate")
            .map_err(Error::Parse)?;
        debug!("EK certificate carries a {} bit RSA key", key.size() * 8);
        Ok(key)
    }

    pub fn subject(&self) -> Result<String> {
        Ok(self.x509()?.subject().to_string())
    }

    pub fn issuer(&self) -> Result<String> {
        Ok(self.x509()?.issuer().to_string())
    }
}

/// Parse an EK certificate with the default policy.
pub fn parse_ek_certificate(raw: &[u8]) -> Result<EkCertificate> {
    parse_ek_certificate_with(raw, &CertParsePolicy::default())
}

pub fn parse_ek_certificate_with(raw: &[u8], policy: &CertParsePolicy) -> Result<EkCertificate> {
    let (payload, was_wrapped) = if policy.unwrap_nv_header {
        unwrap_nv_header(raw).map_err(Error::Parse)?
    } else {
        (raw, false)
    };

    let strict_err = match parse_strict(payload) {
        Ok(_) => {
            return Ok(EkCertificate {
                der: payload.to_vec(),
                was_wrapped,
                trailing_bytes: 0,
            })
        }
        Err(err) => err,
    };

    let (cert_der, trailing) = match tlv_bounded(payload) {
        Ok(bounded) => bounded,
        Err(err) => {
            return Err(Error::Parse(err.context(format!(
                "strict parse failed ({strict_err:#}), wrapped={was_wrapped}"
            ))))
        }
    };
    if trailing > 0 && !policy.allows_trailing(trailing) {
        return Err(Error::Parse(anyhow!(
            "EK certificate has {trailing} trailing bytes, not allowed by policy"
        )));
    }
    parse_strict(cert_der)
        .context("certificate within TLV bounds is invalid")
        .map_err(Error::Parse)?;

    debug!("EK certificate parsed leniently, dropped {trailing} trailing bytes");
    Ok(EkCertificate {
        der: cert_der.to_vec(),
        was_wrapped,
        trailing_bytes: trailing,
    })
}

fn unwrap_nv_header(raw: &[u8]) -> anyhow::Result<(&[u8], bool)> {
    if raw.len() <= NV_HEADER_LEN || raw[..3] != NV_HEADER_TAG {
        return Ok((raw, false));
    }
    let cert_len = u16::from_be_bytes([raw[3], raw[4]]) as usize;
    let end = NV_HEADER_LEN + cert_len;
    if raw.len() < end {
        bail!(
            "NVRAM header declares {cert_len} certificate bytes, only {} present",
            raw.len() - NV_HEADER_LEN
        );
    }
    Ok((&raw[NV_HEADER_LEN..end], true))
}

/// Strict parse: valid DER certificate with nothing after it.
fn parse_strict(der: &[u8]) -> anyhow::Result<X509Certificate<'_>> {
    let (rest, cert) =
        X509Certificate::from_der(der).map_err(|e| anyhow!("x509 parse failed: {e}"))?;
    if !rest.is_empty() {
        bail!("{} bytes after certificate", rest.len());
    }
    Ok(cert)
}

/// Slice of `data` covered by its first BER element, and how much follows.
fn tlv_bounded(data: &[u8]) -> anyhow::Result<(&[u8], usize)> {
    let (rest, _) = parse_ber(data).map_err(|e| anyhow!("lenient TLV decode failed: {e}"))?;
    let len = data.len() - rest.len();
    Ok((&data[..len], rest.len()))
}
