// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! [`Transport`] is the seam between command encoding and whatever carries the
//! bytes. [`TpmDevice`] talks to `/dev/tpmrm0` or `/dev/tpm0`; daemons,
//! simulators and test doubles implement the same trait.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use super::constants::*;
use super::marshal::*;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// A byte-level command channel to a TPM.
pub trait Transport: Send {
    /// Send one complete command and return the complete response.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// TPM character device handle
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str) -> Result<Self> {
        // Strip "device:" prefix if present
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {device_path}"))?;

        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Detect and open the default TPM device, preferring the kernel
    /// resource manager.
    pub fn detect() -> Result<Self> {
        ["/dev/tpmrm0", "/dev/tpm0"]
            .into_iter()
            .find(|p| Path::new(p).exists())
            .map(Self::open)
            .unwrap_or_else(|| bail!("TPM device not found"))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the device is the in-kernel resource manager.
    pub fn is_resource_managed(&self) -> bool {
        self.path.contains("tpmrm")
    }
}

impl std::fmt::Debug for TpmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmDevice").field("path", &self.path).finish()
    }
}

impl Transport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .context("failed to write TPM command")?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .context("failed to read TPM response")?;

        response.truncate(n);
        Ok(response)
    }
}

/// One entry of a command authorization area. Only empty-password and
/// unsalted policy sessions are needed for attestation.
#[derive(Debug, Clone, Copy)]
pub struct SessionAuth {
    pub handle: u32,
    pub attributes: u8,
}

impl SessionAuth {
    /// Password session with an empty password
    pub fn password() -> Self {
        Self {
            handle: tpm_rh::PW,
            attributes: 0,
        }
    }

    /// Policy session that stays open after the command
    pub fn policy(handle: u32) -> Self {
        Self {
            handle,
            attributes: TpmaSa::CONTINUE_SESSION,
        }
    }
}

impl Marshal for SessionAuth {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.handle);
        buf.put_u16(0); // nonceCaller
        buf.put_u8(self.attributes);
        buf.put_u16(0); // hmac / password
    }
}

/// TPM command builder
pub struct TpmCommand {
    buf: CommandBuffer,
    code: TpmCc,
}

impl TpmCommand {
    fn with_tag(tag: TpmSt, code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);
        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(code.to_u32());
        Self { buf, code }
    }

    /// Create a new command without sessions
    pub fn new(code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, code)
    }

    /// Create a new command with sessions
    pub fn with_sessions(code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, code)
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_u16(0);
    }

    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Add a structure wrapped in a TPM2B size prefix
    pub fn add_sized<T: Marshal>(&mut self, value: &T) {
        self.buf.put_sized(value);
    }

    /// Add the authorization area, one entry per authorized handle in order
    pub fn add_auth_area(&mut self, sessions: &[SessionAuth]) {
        let mut area = CommandBuffer::new();
        for s in sessions {
            s.marshal(&mut area);
        }
        self.buf.put_u32(area.len() as u32);
        self.buf.put_bytes(area.as_bytes());
    }

    /// Add a single empty-password authorization
    pub fn add_null_auth_area(&mut self) {
        self.add_auth_area(&[SessionAuth::password()]);
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.patch_u32(2, size);
        self.buf.into_vec()
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: u16,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < 10 {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ResponseBuffer::new(response);
        let tag = buf.get_u16()?;
        let size = buf.get_u32()? as usize;
        if size < 10 || response.len() < size {
            bail!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            );
        }
        let response_code = buf.get_u32()?;

        Ok(Self {
            tag,
            response_code,
            data: response[10..size].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }

    /// Response code with any handle/parameter number stripped
    pub fn base_code(&self) -> u32 {
        tpm_rc::base(self.response_code)
    }

    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            bail!("TPM error: 0x{:08x}", self.response_code)
        }
    }

    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Split a successful response into its output handles and a buffer
    /// over exactly the parameter area. For session-tagged responses the
    /// trailing authorization area is excluded.
    pub fn handles_and_params(&self, handle_count: usize) -> Result<(Vec<u32>, ResponseBuffer<'_>)> {
        let mut buf = self.data_buffer();
        let handles = (0..handle_count)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()
            .context("truncated response handles")?;

        let params = if self.tag == TpmSt::Sessions.to_u16() {
            let param_size = buf.get_u32()? as usize;
            buf.take(param_size)
                .context("parameter size exceeds response")?
        } else {
            buf.take(buf.remaining())?
        };
        Ok((handles, ResponseBuffer::new(params)))
    }

    /// Parameter area of a response that returns no handles
    pub fn params(&self) -> Result<ResponseBuffer<'_>> {
        self.handles_and_params(0).map(|(_, params)| params)
    }
}

/// Send a command over `transport` and parse the response header.
pub fn execute(transport: &mut dyn Transport, command: TpmCommand) -> Result<TpmResponse> {
    let code = command.code();
    let bytes = transport
        .transmit(&command.finalize())
        .with_context(|| format!("transport failure during {code:?}"))?;
    TpmResponse::parse(&bytes).map_err(|e| anyhow!("{code:?}: {e:#}"))
}
