// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Quote Verification Module

use anyhow::Context;
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use sha1::Sha1;
use sha2::digest::{const_oid::AssociatedOid, Digest, DynDigest};
use sha2::{Sha256, Sha384, Sha512};
use tracing::{debug, warn};

use tpm2::tpm12::{pcr_composite_digest, Tpm12PubKey, TpmQuoteInfo};
use tpm2::{
    Attested, TpmAlgId, TpmsAttest, TpmsClockInfo, TpmtPublic, TpmtSignature, Unmarshal,
};
use tpm_types::{AikInfo, Error, HashAlg, Pcr, Quote, Result, TpmVersion};

/// What a successfully verified quote attests to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedQuote {
    pub version: TpmVersion,
    pub nonce: Vec<u8>,
    pub pcr_alg: HashAlg,
    pub pcr_indices: Vec<u32>,
    pub pcr_digest: Vec<u8>,
    /// TPM 2.0 only
    pub clock_info: Option<TpmsClockInfo>,
    /// TPM 2.0 only
    pub firmware_version: Option<u64>,
}

/// Verify `quote` against the AIK public key, the nonce the verifier issued
/// and the PCR values it expects.
///
/// Checks run in order: nonce ([`Error::Replay`]), PCR digest
/// ([`Error::Integrity`]), then signature ([`Error::Signature`]).
pub fn verify_quote(
    quote: &Quote,
    aik: &RsaPublicKey,
    nonce: &[u8],
    pcrs: &[Pcr],
) -> Result<VerifiedQuote> {
    debug!(
        "verifying TPM {} quote, nonce {}",
        quote.version,
        hex::encode(nonce)
    );
    let verified = match quote.version {
        TpmVersion::V20 => verify_quote20(quote, aik, nonce, pcrs),
        TpmVersion::V12 => verify_quote12(quote, aik, nonce, pcrs),
    };
    match &verified {
        Ok(v) => debug!(
            "✓ TPM {} quote verified over {} PCRs",
            v.version,
            v.pcr_indices.len()
        ),
        Err(e) => warn!("quote rejected: {e}"),
    }
    verified
}

/// Supplied PCRs sorted by index; they must share one bank and not repeat.
fn ordered_pcrs(pcrs: &[Pcr]) -> Result<(HashAlg, Vec<&Pcr>)> {
    let first = pcrs
        .first()
        .ok_or_else(|| Error::invalid_input("no expected PCR values supplied"))?;
    let mut ordered: Vec<&Pcr> = pcrs.iter().collect();
    ordered.sort_by_key(|p| p.index);
    for pair in ordered.windows(2) {
        if pair[0].index == pair[1].index {
            return Err(Error::invalid_input(format!(
                "PCR {} supplied twice",
                pair[0].index
            )));
        }
    }
    for pcr in &ordered {
        if pcr.digest_alg != first.digest_alg {
            return Err(Error::Integrity(format!(
                "PCR {} is from the {:?} bank, expected {:?}",
                pcr.index, pcr.digest_alg, first.digest_alg
            )));
        }
        if pcr.digest.len() != pcr.digest_alg.digest_size() {
            return Err(Error::Integrity(format!(
                "PCR {} digest has {} bytes",
                pcr.index,
                pcr.digest.len()
            )));
        }
    }
    Ok((first.digest_alg, ordered))
}

fn verify_quote20(
    quote: &Quote,
    aik: &RsaPublicKey,
    nonce: &[u8],
    pcrs: &[Pcr],
) -> Result<VerifiedQuote> {
    let attest = TpmsAttest::from_bytes_exact(&quote.quote)
        .context("failed to parse TPMS_ATTEST")
        .map_err(Error::Parse)?;
    let signature = TpmtSignature::from_bytes_exact(&quote.signature)
        .context("failed to parse TPMT_SIGNATURE")
        .map_err(Error::Parse)?;
    let Attested::Quote {
        pcr_select,
        pcr_digest,
    } = &attest.attested
    else {
        return Err(Error::Parse(anyhow::anyhow!(
            "attestation is not a quote"
        )));
    };

    if attest.extra_data != nonce {
        return Err(Error::Replay);
    }

    let (alg, ordered) = ordered_pcrs(pcrs)?;
    let [selection] = pcr_select.pcr_selections.as_slice() else {
        return Err(Error::Integrity(format!(
            "quote covers {} PCR banks, expected one",
            pcr_select.pcr_selections.len()
        )));
    };
    if HashAlg::from_alg_id(selection.hash) != Some(alg) {
        return Err(Error::Integrity(format!(
            "quote covers the {:?} bank, PCRs are {alg:?}",
            selection.hash
        )));
    }
    let indices: Vec<u32> = ordered.iter().map(|p| p.index).collect();
    if selection.indices() != indices {
        return Err(Error::Integrity(format!(
            "quote selects PCRs {:?}, expected {indices:?}",
            selection.indices()
        )));
    }
    let concatenated: Vec<u8> = ordered.iter().flat_map(|p| p.digest.iter().copied()).collect();
    let computed = signature
        .hash_alg
        .digest(&concatenated)
        .ok_or_else(|| Error::Integrity("signature hash is not a digest".into()))?;
    if computed != *pcr_digest {
        return Err(Error::Integrity("PCR digest mismatch".into()));
    }
    debug!("✓ PCR digest matches {} expected values", indices.len());

    verify_tpm_signature(aik, &quote.quote, &signature)?;

    Ok(VerifiedQuote {
        version: TpmVersion::V20,
        nonce: attest.extra_data,
        pcr_alg: alg,
        pcr_indices: indices,
        pcr_digest: pcr_digest.clone(),
        clock_info: Some(attest.clock_info),
        firmware_version: Some(attest.firmware_version),
    })
}

fn verify_quote12(
    quote: &Quote,
    aik: &RsaPublicKey,
    nonce: &[u8],
    pcrs: &[Pcr],
) -> Result<VerifiedQuote> {
    let info = TpmQuoteInfo::from_bytes_exact(&quote.quote)
        .context("failed to parse TPM_QUOTE_INFO")
        .map_err(Error::Parse)?;
    if info.external_data != nonce {
        return Err(Error::Replay);
    }

    let (alg, ordered) = ordered_pcrs(pcrs)?;
    if alg != HashAlg::Sha1 {
        return Err(Error::Integrity(format!(
            "TPM 1.2 quotes cover SHA-1 PCRs, got {alg:?}"
        )));
    }
    let values: Vec<(u32, &[u8])> = ordered
        .iter()
        .map(|p| (p.index, p.digest.as_slice()))
        .collect();
    let composite = pcr_composite_digest(&values)
        .map_err(|e| Error::Integrity(format!("{e:#}")))?;
    if composite != info.composite_digest {
        return Err(Error::Integrity("PCR composite digest mismatch".into()));
    }

    let hashed = Sha1::digest(&quote.quote);
    aik.verify(Pkcs1v15Sign::new::<Sha1>(), &hashed, &quote.signature)
        .map_err(|e| Error::Signature(e.to_string()))?;

    Ok(VerifiedQuote {
        version: TpmVersion::V12,
        nonce: info.external_data,
        pcr_alg: alg,
        pcr_indices: values.iter().map(|(i, _)| *i).collect(),
        pcr_digest: info.composite_digest,
        clock_info: None,
        firmware_version: None,
    })
}

fn verify_with<D>(key: &RsaPublicKey, message: &[u8], sig: &TpmtSignature) -> Result<()>
where
    D: Digest + AssociatedOid + DynDigest + Send + Sync + 'static,
{
    let hashed = D::digest(message);
    let verified = match sig.sig_alg {
        TpmAlgId::RsaSsa => key.verify(Pkcs1v15Sign::new::<D>(), &hashed, &sig.signature),
        TpmAlgId::RsaPss => key.verify(Pss::new::<D>(), &hashed, &sig.signature),
        other => {
            return Err(Error::Signature(format!(
                "unsupported signature scheme {other:?}"
            )))
        }
    };
    verified.map_err(|e| Error::Signature(e.to_string()))
}

/// Verify a TPM 2.0 RSASSA or RSAPSS signature over `message`.
pub fn verify_tpm_signature(
    key: &RsaPublicKey,
    message: &[u8],
    signature: &TpmtSignature,
) -> Result<()> {
    match signature.hash_alg {
        TpmAlgId::Sha1 => verify_with::<Sha1>(key, message, signature),
        TpmAlgId::Sha256 => verify_with::<Sha256>(key, message, signature),
        TpmAlgId::Sha384 => verify_with::<Sha384>(key, message, signature),
        TpmAlgId::Sha512 => verify_with::<Sha512>(key, message, signature),
        other => Err(Error::Signature(format!(
            "unsupported signature hash {other:?}"
        ))),
    }
}

/// RSA key from an AIK public blob: TPMT_PUBLIC for 2.0, TPM_PUBKEY for 1.2.
pub fn parse_aik_public(version: TpmVersion, public_blob: &[u8]) -> Result<RsaPublicKey> {
    let key = match version {
        TpmVersion::V20 => {
            TpmtPublic::from_bytes_exact(public_blob).and_then(|p| p.rsa_public_key())
        }
        TpmVersion::V12 => {
            Tpm12PubKey::from_bytes_exact(public_blob).and_then(|p| p.rsa_public_key())
        }
    };
    key.context("invalid AIK public blob").map_err(Error::Parse)
}

pub fn aik_public_key(aik: &AikInfo) -> Result<RsaPublicKey> {
    parse_aik_public(aik.version(), aik.public_blob())
}
