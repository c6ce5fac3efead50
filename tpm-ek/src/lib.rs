// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Endorsement key resolution
//!
//! Parses EK certificates as stored in TPM NVRAM or served by vendors,
//! derives vendor lookup URLs from bare public keys and, with the `fetch`
//! feature, downloads certificates from those services.

mod cert;
mod fetch;
mod key;
mod url;

pub use cert::{parse_ek_certificate, parse_ek_certificate_with, CertParsePolicy, EkCertificate};
pub use fetch::{fetch_certificate, EkCertFetcher, FetchConfig};
pub use key::EndorsementKey;
pub use url::{intel_ek_url, vendor_certificate_url, INTEL_EK_CERT_SERVICE_URL};

#[cfg(feature = "fetch")]
pub use fetch::HttpEkCertFetcher;
