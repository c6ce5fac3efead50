// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};

use tpm_types::TcgVendorId;

pub const INTEL_EK_CERT_SERVICE_URL: &str = "https://ekop.intel.com/ekcertservice/";

/// Intel's EK certificate service is keyed by SHA-256 over the modulus
/// followed by the fixed exponent bytes `01 00 01`.
pub fn intel_ek_url(key: &RsaPublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.n().to_bytes_be());
    hasher.update([0x01, 0x00, 0x01]);
    format!(
        "{INTEL_EK_CERT_SERVICE_URL}{}",
        URL_SAFE.encode(hasher.finalize())
    )
}

/// Where the manufacturer publishes the certificate for `key`, if anywhere.
pub fn vendor_certificate_url(manufacturer: TcgVendorId, key: &RsaPublicKey) -> Option<String> {
    match manufacturer {
        TcgVendorId::INTEL => Some(intel_ek_url(key)),
        _ => None,
    }
}
