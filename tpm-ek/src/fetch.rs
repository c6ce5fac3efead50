// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Vendor EK certificate retrieval
//!
//! Network access is injected through [`EkCertFetcher`] and never happens on
//! the TPM command path.

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tpm_types::{Error, Result};

use crate::cert::{parse_ek_certificate, EkCertificate};
use crate::key::EndorsementKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

/// Retrieves certificate bytes from a vendor URL.
pub trait EkCertFetcher {
    fn fetch(&self, url: &str) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;
}

/// Fetch and parse the vendor certificate for `ek`.
pub async fn fetch_certificate<F: EkCertFetcher>(
    fetcher: &F,
    ek: &EndorsementKey,
    config: &FetchConfig,
) -> Result<EkCertificate> {
    let Some(url) = ek.certificate_url.as_deref() else {
        return Err(Error::not_supported(
            "no vendor certificate service for this EK",
        ));
    };
    debug!("fetching EK certificate from {url}");
    let timeout = Duration::from_secs(config.timeout_secs);
    let der = tokio::time::timeout(timeout, fetcher.fetch(url))
        .await
        .map_err(|_| Error::Fetch(anyhow!("timed out after {timeout:?} fetching {url}")))?
        .map_err(Error::Fetch)?;
    let cert = parse_ek_certificate(&der)?;
    if cert.public_key()? != ek.public {
        return Err(Error::Fetch(anyhow!(
            "certificate from {url} is for a different key"
        )));
    }
    Ok(cert)
}

#[cfg(feature = "fetch")]
pub use http::HttpEkCertFetcher;

#[cfg(feature = "fetch")]
mod http {
    use anyhow::{bail, Context};
    use tracing::debug;

    use super::EkCertFetcher;

    /// Plain HTTPS GET against the vendor service.
    #[derive(Debug, Clone, Default)]
    pub struct HttpEkCertFetcher {
        client: reqwest::Client,
    }

    impl HttpEkCertFetcher {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    impl EkCertFetcher for HttpEkCertFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .with_context(|| format!("failed to download EK certificate from {url}"))?;
            if !response.status().is_success() {
                bail!("EK certificate download failed with status: {}", response.status());
            }
            let bytes = response
                .bytes()
                .await
                .context("failed to read EK certificate response body")?;
            debug!("downloaded {} bytes EK certificate from {url}", bytes.len());
            Ok(bytes.to_vec())
        }
    }
}
