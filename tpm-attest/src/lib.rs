// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM Attestation Library
//!
//! Device side of remote attestation: opening a TPM of either generation,
//! reading its identity, PCRs and endorsement keys, managing attestation
//! identity keys, quoting and answering credential challenges.
//!
//! Verification lives in the tpm-qvl crate.

use tracing::debug;

use tpm2::tpm12::{Tpm12Context, TAG_RSP_COMMAND};
use tpm2::{
    execute, tpm_pt, TpmCap, TpmCc, TpmCommand, TpmContext, TpmDevice, TpmSt, Transport,
};
use tpm_ek::EndorsementKey;
use tpm_types::{Error, HashAlg, Pcr, Result, TpmInfo, TpmInterface, TpmVersion};

mod aik;
mod config;
mod session12;
mod session20;
pub mod templates;

#[cfg(test)]
mod scripted;

pub use aik::{Aik, MAX_NONCE_SIZE_20, NONCE_SIZE_12};
pub use config::{AikConfig, OpenConfig};
pub use session12::{IdentityService, Session12, Tpm12Identity};
pub use session20::{decode_vendor_string, Session20};
pub use tpm_types;

/// What every TPM session offers, whatever its generation.
pub trait Session {
    /// Identity snapshot taken when the session was opened.
    fn info(&self) -> &TpmInfo;

    /// All 24 PCRs of one bank, in index order.
    fn pcrs(&mut self, alg: HashAlg) -> Result<Vec<Pcr>>;

    /// Endorsement keys, never empty on success.
    fn eks(&mut self) -> Result<Vec<EndorsementKey>>;

    /// Release leftover handles and the transport. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// An open TPM, fixed to one generation for its lifetime.
pub enum Tpm {
    V12(Session12),
    V20(Session20),
}

impl std::fmt::Debug for Tpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tpm").field("info", self.info()).finish()
    }
}

/// Ask with a 2.0 command; a 1.2 chip answers with its own response tag.
fn probe_version(transport: &mut dyn Transport) -> Result<TpmVersion> {
    let mut cmd = TpmCommand::new(TpmCc::GetCapability);
    cmd.add_u32(TpmCap::TpmProperties as u32);
    cmd.add_u32(tpm_pt::MANUFACTURER);
    cmd.add_u32(1);

    let response = execute(transport, cmd).map_err(Error::Hardware)?;
    match response.tag {
        tag if tag == TpmSt::NoSessions.to_u16() || tag == TpmSt::Sessions.to_u16() => {
            Ok(TpmVersion::V20)
        }
        TAG_RSP_COMMAND => Ok(TpmVersion::V12),
        tag => Err(Error::not_supported(format!(
            "unrecognized TPM response tag 0x{tag:04x}"
        ))),
    }
}

impl Tpm {
    /// Open the TPM device named by `config`, or the first one found.
    pub fn open(config: &OpenConfig) -> Result<Self> {
        let device = match &config.tcti {
            Some(path) => TpmDevice::open(path),
            None => TpmDevice::detect(),
        }
        .map_err(Error::Hardware)?;
        let interface = if device.is_resource_managed() {
            TpmInterface::KernelManaged
        } else {
            TpmInterface::Direct
        };
        debug!("opening TPM at {}", device.path());
        Self::open_with(Box::new(device), interface, config, None)
    }

    /// Open a TPM over any transport. TPM 1.2 identity operations go through
    /// `identity`, when given.
    pub fn open_with(
        mut transport: Box<dyn Transport>,
        interface: TpmInterface,
        config: &OpenConfig,
        identity: Option<Box<dyn IdentityService>>,
    ) -> Result<Self> {
        let version = match config.tpm_version {
            Some(version) => version,
            None => probe_version(transport.as_mut())?,
        };
        let policy = config.cert_policy.clone();
        match version {
            TpmVersion::V20 => {
                let ctx = TpmContext::with_transport(transport);
                Session20::open(ctx, interface, policy).map(Tpm::V20)
            }
            TpmVersion::V12 => {
                let ctx = Tpm12Context::with_transport(transport);
                Session12::open(ctx, interface, policy, identity).map(Tpm::V12)
            }
        }
    }

    pub fn version(&self) -> TpmVersion {
        match self {
            Tpm::V12(_) => TpmVersion::V12,
            Tpm::V20(_) => TpmVersion::V20,
        }
    }

    /// Create a fresh AIK; close it with [`Aik::close`] when done.
    pub fn new_aik(&mut self, config: &AikConfig) -> Result<Aik> {
        Aik::create(self, config)
    }

    /// Load an AIK produced by [`Aik::serialize`].
    pub fn load_aik(&mut self, blob: &[u8]) -> Result<Aik> {
        Aik::load(self, blob)
    }

    /// Transient handles or keys still held by the session.
    pub fn open_handles(&self) -> Vec<u32> {
        match self {
            Tpm::V12(session) => session.open_handles(),
            Tpm::V20(session) => session.open_handles(),
        }
    }

    fn session(&self) -> &dyn Session {
        match self {
            Tpm::V12(session) => session,
            Tpm::V20(session) => session,
        }
    }

    fn session_mut(&mut self) -> &mut dyn Session {
        match self {
            Tpm::V12(session) => session,
            Tpm::V20(session) => session,
        }
    }
}

impl Session for Tpm {
    fn info(&self) -> &TpmInfo {
        self.session().info()
    }

    fn pcrs(&mut self, alg: HashAlg) -> Result<Vec<Pcr>> {
        self.session_mut().pcrs(alg)
    }

    fn eks(&mut self) -> Result<Vec<EndorsementKey>> {
        self.session_mut().eks()
    }

    fn close(&mut self) -> Result<()> {
        self.session_mut().close()
    }
}
