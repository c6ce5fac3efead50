// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Minimal TPM stand-in for session tests: answers capability and PCR reads
//! for 2.0 and the 1.2 info/PCR ordinals.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use tpm2::tpm12::{ordinal, TAG_RSP_COMMAND};
use tpm2::{
    tpm_pt, CommandBuffer, Marshal, ResponseBuffer, TpmCap, TpmCc, TpmContext,
    TpmlDigest, TpmlPcrSelection, TpmlTaggedTpmProperty, Transport, Unmarshal,
};
use tpm_ek::CertParsePolicy;
use tpm_types::TpmInterface;

use crate::Session20;

#[derive(Clone)]
pub(crate) struct FakeTpm {
    /// Registers returned per PCR_Read, at most 8 like real chips.
    pub pcrs_per_read: usize,
    /// Return no registers after this many PCR reads.
    pub stall_after: Option<usize>,
    pub tpm12: bool,
    pub response_tag: Option<u16>,
    pub broken: bool,
    pub(crate) commands: Arc<Mutex<usize>>,
    pub(crate) pcr_reads: Arc<Mutex<usize>>,
}

impl Default for FakeTpm {
    fn default() -> Self {
        Self {
            pcrs_per_read: 8,
            stall_after: None,
            tpm12: false,
            response_tag: None,
            broken: false,
            commands: Default::default(),
            pcr_reads: Default::default(),
        }
    }
}

fn reply(tag: u16, rc: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = CommandBuffer::new();
    buf.put_u16(tag);
    buf.put_u32(10 + body.len() as u32);
    buf.put_u32(rc);
    buf.put_bytes(body);
    buf.into_vec()
}

impl FakeTpm {
    pub fn open20(&self) -> tpm_types::Result<Session20> {
        let ctx = TpmContext::with_transport(Box::new(self.clone()));
        Session20::open(ctx, TpmInterface::KernelManaged, CertParsePolicy::default())
    }

    pub fn command_count(&self) -> usize {
        *self.commands.lock().unwrap()
    }

    fn property(prop: u32) -> u32 {
        match prop {
            tpm_pt::MANUFACTURER => 0x494E5443,
            tpm_pt::VENDOR_STRING_1 => u32::from_be_bytes(*b"FAKE"),
            tpm_pt::VENDOR_STRING_2 => u32::from_be_bytes(*b" TPM"),
            tpm_pt::FIRMWARE_VERSION_1 => (7 << 16) | 85,
            _ => 0,
        }
    }

    fn handle20(&self, code: u32, mut body: ResponseBuffer) -> Result<Vec<u8>> {
        let mut out = CommandBuffer::new();
        match TpmCc::from_u32(code) {
            Some(TpmCc::GetCapability) => {
                let _cap = body.get_u32()?;
                let prop = body.get_u32()?;
                out.put_u8(0);
                out.put_u32(TpmCap::TpmProperties as u32);
                TpmlTaggedTpmProperty {
                    properties: vec![(prop, Self::property(prop))],
                }
                .marshal(&mut out);
            }
            Some(TpmCc::PcrRead) => {
                let selection = TpmlPcrSelection::unmarshal(&mut body)?;
                let requested = &selection.pcr_selections[0];
                let reads = {
                    let mut reads = self.pcr_reads.lock().unwrap();
                    *reads += 1;
                    *reads
                };
                let served: Vec<u32> = match self.stall_after {
                    Some(limit) if reads > limit => Vec::new(),
                    _ => requested
                        .indices()
                        .into_iter()
                        .take(self.pcrs_per_read)
                        .collect(),
                };
                let size = requested.hash.digest_size();
                out.put_u32(reads as u32);
                TpmlPcrSelection::single(requested.hash, &served).marshal(&mut out);
                TpmlDigest {
                    digests: served.iter().map(|i| vec![*i as u8; size]).collect(),
                }
                .marshal(&mut out);
            }
            _ => bail!("fake TPM does not implement command 0x{code:x}"),
        }
        Ok(reply(0x8001, 0, out.as_bytes()))
    }

    fn handle12(&self, tag: u16, code: u32, mut body: ResponseBuffer) -> Result<Vec<u8>> {
        if tag != 0x00C1 {
            // TPM_BADTAG
            return Ok(reply(TAG_RSP_COMMAND, 0x1E, &[]));
        }
        let mut out = CommandBuffer::new();
        match code {
            ordinal::GET_CAPABILITY => {
                let mut info = CommandBuffer::new();
                info.put_u16(0x0030);
                info.put_bytes(&[1, 2, 4, 43]);
                info.put_u16(2);
                info.put_u8(3);
                info.put_u32(0x49465800);
                info.put_tpm2b(b"SLB9670\0");
                out.put_u32(info.len() as u32);
                out.put_bytes(info.as_bytes());
            }
            ordinal::PCR_READ => {
                let index = body.get_u32()?;
                out.put_bytes(&[index as u8; 20]);
            }
            _ => return Ok(reply(TAG_RSP_COMMAND, 0x0A, &[])),
        }
        Ok(reply(TAG_RSP_COMMAND, 0, out.as_bytes()))
    }
}

impl Transport for FakeTpm {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        *self.commands.lock().unwrap() += 1;
        if self.broken {
            bail!("device unplugged");
        }
        let mut buf = ResponseBuffer::new(command);
        let tag = buf.get_u16()?;
        let _size = buf.get_u32()?;
        let code = buf.get_u32()?;
        if let Some(tag) = self.response_tag {
            return Ok(reply(tag, 0, &[]));
        }
        if self.tpm12 {
            return self.handle12(tag, code, buf);
        }
        self.handle20(code, buf)
    }
}
