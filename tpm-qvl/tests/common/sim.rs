// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software TPM 2.0 answering the commands the attestation crates issue.
//!
//! Keys come from the fixtures: `ek.pem` backs the endorsement key and each
//! TPM2_Create hands out the next of `aik1.pem`/`aik2.pem`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use tpm2::{
    tpm_handle, tpm_pt, tpm_rc, tpm_rh, Attested, CommandBuffer, Marshal, ResponseBuffer,
    TpmAlgId, TpmCap, TpmCc, TpmaObject, TpmlDigest, TpmlPcrSelection, TpmlTaggedTpmProperty,
    TpmsAttest, TpmsClockInfo, TpmsNvPublic, TpmtPublic, TpmtScheme, TpmtSignature, TpmtSymDef,
    TpmtTkCreation, Transport, Unmarshal, EK_AUTH_POLICY,
};

use super::fixture_key;

const FIRST_TRANSIENT: u32 = 0x8000_0000;
const FIRST_POLICY_SESSION: u32 = 0x0300_0000;
const RC_HANDLE_1: u32 = tpm_rc::HANDLE | 0x100;
const RC_VALUE_1: u32 = tpm_rc::VALUE | 0x100;
const PRIVATE_PREFIX: &[u8] = b"sim-key:";

pub const MANUFACTURER_IBM: u32 = 0x49424D00;

type Rc = u32;

trait OrRc<T> {
    fn or_rc(self, rc: Rc) -> Result<T, Rc>;
}

impl<T> OrRc<T> for anyhow::Result<T> {
    fn or_rc(self, rc: Rc) -> Result<T, Rc> {
        self.map_err(|_| rc)
    }
}

#[derive(Clone)]
enum Object {
    Key {
        public: TpmtPublic,
        private: Option<RsaPrivateKey>,
    },
    PolicySession {
        satisfied: bool,
    },
}

struct SimState {
    ek: RsaPrivateKey,
    aiks: Vec<RsaPrivateKey>,
    next_aik: usize,
    ek_cert: Option<Vec<u8>>,
    manufacturer: u32,
    persistent: BTreeMap<u32, Object>,
    transient: BTreeMap<u32, Object>,
    next_object: u32,
    next_session: u32,
    pcrs_per_read: usize,
    fail_certify: bool,
    clock: u64,
    commands: Vec<TpmCc>,
}

/// Cheaply cloneable handle onto one simulated chip.
#[derive(Clone)]
pub struct SoftTpm {
    state: Arc<Mutex<SimState>>,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self::new()
    }
}

fn kdfa(key: &[u8], label: &str, context: &[u8], bits: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut counter = 1u32;
    while out.len() * 8 < bits as usize {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(&counter.to_be_bytes());
        mac.update(label.as_bytes());
        mac.update(&[0]);
        mac.update(context);
        mac.update(&bits.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(bits as usize / 8);
    out
}

fn sign(key: &RsaPrivateKey, message: &[u8]) -> TpmtSignature {
    let hashed = Sha256::digest(message);
    TpmtSignature {
        sig_alg: TpmAlgId::RsaSsa,
        hash_alg: TpmAlgId::Sha256,
        signature: key.sign(Pkcs1v15Sign::new::<Sha256>(), &hashed).unwrap(),
    }
}

fn auth_handles(buf: &mut ResponseBuffer) -> Result<Vec<u32>, Rc> {
    let size = buf.get_u32().or_rc(tpm_rc::SIZE)? as usize;
    let mut area = ResponseBuffer::new(buf.take(size).or_rc(tpm_rc::SIZE)?);
    let mut handles = Vec::new();
    while !area.is_empty() {
        handles.push(area.get_u32().or_rc(tpm_rc::SIZE)?);
        area.get_tpm2b().or_rc(tpm_rc::SIZE)?;
        area.get_u8().or_rc(tpm_rc::SIZE)?;
        area.get_tpm2b().or_rc(tpm_rc::SIZE)?;
    }
    Ok(handles)
}

fn header(tag: u16, rc: Rc, body: &[u8]) -> Vec<u8> {
    let mut out = CommandBuffer::new();
    out.put_u16(tag);
    out.put_u32(10 + body.len() as u32);
    out.put_u32(rc);
    out.put_bytes(body);
    out.into_vec()
}

/// Successful response; session-tagged ones carry parameterSize and an
/// (empty) response auth area.
fn reply(sessions: bool, handles: &[u32], params: &[u8]) -> Vec<u8> {
    let mut body = CommandBuffer::new();
    for handle in handles {
        body.put_u32(*handle);
    }
    if sessions {
        body.put_u32(params.len() as u32);
        body.put_bytes(params);
        body.put_u16(0); // nonceTPM
        body.put_u8(1); // continueSession
        body.put_u16(0); // hmac
        header(0x8002, 0, body.as_bytes())
    } else {
        body.put_bytes(params);
        header(0x8001, 0, body.as_bytes())
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        let state = SimState {
            ek: fixture_key("ek.pem"),
            aiks: vec![fixture_key("aik1.pem"), fixture_key("aik2.pem")],
            next_aik: 0,
            ek_cert: None,
            manufacturer: MANUFACTURER_IBM,
            persistent: BTreeMap::new(),
            transient: BTreeMap::new(),
            next_object: FIRST_TRANSIENT,
            next_session: FIRST_POLICY_SESSION,
            pcrs_per_read: 8,
            fail_certify: false,
            clock: 1_000,
            commands: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Provision NV contents at the RSA EK certificate index.
    pub fn with_ek_certificate(self, nv_contents: Vec<u8>) -> Self {
        self.state.lock().unwrap().ek_cert = Some(nv_contents);
        self
    }

    /// Provision the EK at its persistent handle.
    pub fn with_persistent_ek(self) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let ek = state.ek_object();
            state.persistent.insert(tpm_handle::EK, ek);
        }
        self
    }

    pub fn with_manufacturer(self, manufacturer: u32) -> Self {
        self.state.lock().unwrap().manufacturer = manufacturer;
        self
    }

    pub fn set_pcrs_per_read(&self, count: usize) {
        self.state.lock().unwrap().pcrs_per_read = count;
    }

    pub fn fail_certify_creation(&self) {
        self.state.lock().unwrap().fail_certify = true;
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    /// Transient objects and sessions currently loaded.
    pub fn transient_handles(&self) -> Vec<u32> {
        self.state.lock().unwrap().transient.keys().copied().collect()
    }

    pub fn persistent_handles(&self) -> Vec<u32> {
        self.state.lock().unwrap().persistent.keys().copied().collect()
    }

    pub fn commands(&self) -> Vec<TpmCc> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn ek_public(&self) -> RsaPublicKey {
        self.state.lock().unwrap().ek.to_public_key()
    }

    /// Value every register of `alg` holds in this simulator.
    pub fn pcr_value(alg: TpmAlgId, index: u32) -> Vec<u8> {
        alg.digest(format!("pcr-{index}").as_bytes())
            .unwrap_or_default()
    }
}

impl SimState {
    fn ek_object(&self) -> Object {
        let mut public = TpmtPublic::endorsement_key();
        public.unique = self.ek.n().to_bytes_be();
        Object::Key {
            public,
            private: Some(self.ek.clone()),
        }
    }

    fn object(&self, handle: u32) -> Option<&Object> {
        self.transient
            .get(&handle)
            .or_else(|| self.persistent.get(&handle))
    }

    fn key(&self, handle: u32) -> Result<(&TpmtPublic, Option<&RsaPrivateKey>), Rc> {
        match self.object(handle) {
            Some(Object::Key { public, private }) => Ok((public, private.as_ref())),
            _ => Err(RC_HANDLE_1),
        }
    }

    fn insert_object(&mut self, object: Object) -> u32 {
        let handle = self.next_object;
        self.next_object += 1;
        self.transient.insert(handle, object);
        handle
    }

    fn property(&self, prop: u32) -> u32 {
        match prop {
            tpm_pt::MANUFACTURER => self.manufacturer,
            tpm_pt::VENDOR_STRING_1 => u32::from_be_bytes(*b"SW  "),
            tpm_pt::VENDOR_STRING_2 => u32::from_be_bytes(*b" TPM"),
            tpm_pt::FIRMWARE_VERSION_1 => 0x2019_1023,
            _ => 0,
        }
    }

    fn get_capability(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let cap = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let prop = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        if cap != TpmCap::TpmProperties as u32 {
            return Err(RC_VALUE_1);
        }
        let mut out = CommandBuffer::new();
        out.put_u8(0);
        out.put_u32(cap);
        TpmlTaggedTpmProperty {
            properties: vec![(prop, self.property(prop))],
        }
        .marshal(&mut out);
        Ok(reply(false, &[], out.as_bytes()))
    }

    fn pcr_read(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let selection = TpmlPcrSelection::unmarshal(buf).or_rc(tpm_rc::SIZE)?;
        let mut out = CommandBuffer::new();
        out.put_u32(self.commands.len() as u32);
        let Some(requested) = selection.pcr_selections.first() else {
            TpmlPcrSelection::default().marshal(&mut out);
            TpmlDigest { digests: vec![] }.marshal(&mut out);
            return Ok(reply(false, &[], out.as_bytes()));
        };
        let served: Vec<u32> = if requested.hash.is_hash() {
            requested
                .indices()
                .into_iter()
                .take(self.pcrs_per_read)
                .collect()
        } else {
            Vec::new()
        };
        TpmlPcrSelection::single(requested.hash, &served).marshal(&mut out);
        TpmlDigest {
            digests: served
                .iter()
                .map(|i| SoftTpm::pcr_value(requested.hash, *i))
                .collect(),
        }
        .marshal(&mut out);
        Ok(reply(false, &[], out.as_bytes()))
    }

    fn nv_read_public(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let index = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let cert = self.ek_cert.as_ref().filter(|_| index == tpm_handle::EK_CERT_NV_INDEX);
        let Some(cert) = cert else {
            return Err(RC_HANDLE_1);
        };
        let mut out = CommandBuffer::new();
        out.put_sized(&TpmsNvPublic {
            nv_index: index,
            name_alg: TpmAlgId::Sha256,
            attributes: 0,
            auth_policy: vec![],
            data_size: cert.len() as u16,
        });
        out.put_tpm2b(&index.to_be_bytes());
        Ok(reply(false, &[], out.as_bytes()))
    }

    fn nv_read(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let _auth = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let index = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        let size = buf.get_u16().or_rc(tpm_rc::SIZE)? as usize;
        let offset = buf.get_u16().or_rc(tpm_rc::SIZE)? as usize;
        let cert = self
            .ek_cert
            .as_ref()
            .filter(|_| index == tpm_handle::EK_CERT_NV_INDEX)
            .ok_or(RC_HANDLE_1 + 0x100)?;
        if offset + size > cert.len() {
            return Err(tpm_rc::VALUE | 0x200);
        }
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&cert[offset..offset + size]);
        Ok(reply(true, &[], out.as_bytes()))
    }

    fn read_public(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let handle = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let (public, _) = self.key(handle)?;
        let name = public.name().or_rc(tpm_rc::FAILURE)?;
        let mut out = CommandBuffer::new();
        out.put_sized(public);
        out.put_tpm2b(&name);
        out.put_tpm2b(&name);
        Ok(reply(false, &[], out.as_bytes()))
    }

    fn create_primary(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let hierarchy = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        buf.get_tpm2b().or_rc(tpm_rc::SIZE)?; // inSensitive
        let template: TpmtPublic = buf.get_sized().or_rc(tpm_rc::SIZE)?;
        buf.get_tpm2b().or_rc(tpm_rc::SIZE)?; // outsideInfo
        TpmlPcrSelection::unmarshal(buf).or_rc(tpm_rc::SIZE)?;

        let object = match hierarchy {
            tpm_rh::ENDORSEMENT if template.auth_policy == EK_AUTH_POLICY => self.ek_object(),
            tpm_rh::OWNER => {
                let mut public = template;
                public.unique = vec![0x5a; 256];
                Object::Key {
                    public,
                    private: None,
                }
            }
            _ => return Err(RC_VALUE_1),
        };
        let Object::Key { public, .. } = &object else {
            return Err(tpm_rc::FAILURE);
        };
        let public = public.clone();
        let handle = self.insert_object(object);

        let mut out = CommandBuffer::new();
        out.put_sized(&public);
        out.put_tpm2b(&[]); // creationData
        out.put_tpm2b(&[]); // creationHash
        TpmtTkCreation {
            tag: 0x8021,
            hierarchy,
            digest: vec![],
        }
        .marshal(&mut out);
        out.put_tpm2b(&public.name().or_rc(tpm_rc::FAILURE)?);
        Ok(reply(true, &[handle], out.as_bytes()))
    }

    fn evict_control(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let _auth = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let object = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        let persistent = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        if self.persistent.contains_key(&persistent) {
            return Err(RC_VALUE_1);
        }
        let object = self
            .transient
            .get(&object)
            .cloned()
            .ok_or(RC_HANDLE_1 + 0x100)?;
        self.persistent.insert(persistent, object);
        Ok(reply(true, &[], &[]))
    }

    fn creation_ticket(name: &[u8], creation_hash: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"creation");
        hasher.update(name);
        hasher.update(creation_hash);
        hasher.finalize().to_vec()
    }

    fn create(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let parent = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        buf.get_tpm2b().or_rc(tpm_rc::SIZE)?; // inSensitive
        let template: TpmtPublic = buf.get_sized().or_rc(tpm_rc::SIZE)?;
        buf.get_tpm2b().or_rc(tpm_rc::SIZE)?; // outsideInfo
        TpmlPcrSelection::unmarshal(buf).or_rc(tpm_rc::SIZE)?;

        let (parent_public, _) = self.key(parent)?;
        let parent_name = parent_public.name().or_rc(tpm_rc::FAILURE)?;
        if !template.object_attributes.contains(TpmaObject::SIGN_ENCRYPT) {
            return Err(RC_VALUE_1);
        }

        let index = self.next_aik % self.aiks.len();
        self.next_aik += 1;
        let mut public = template;
        public.unique = self.aiks[index].n().to_bytes_be();
        let name = public.name().or_rc(tpm_rc::FAILURE)?;

        // TPMS_CREATION_DATA
        let mut creation_data = CommandBuffer::new();
        TpmlPcrSelection::default().marshal(&mut creation_data);
        creation_data.put_tpm2b(&[]); // pcrDigest
        creation_data.put_u8(0); // locality
        creation_data.put_u16(TpmAlgId::Sha256.to_u16());
        creation_data.put_tpm2b(&parent_name);
        creation_data.put_tpm2b(&parent_name);
        creation_data.put_tpm2b(&[]); // outsideInfo
        let creation_data = creation_data.into_vec();
        let creation_hash = Sha256::digest(&creation_data).to_vec();

        let mut private = PRIVATE_PREFIX.to_vec();
        private.push(index as u8);

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&private);
        out.put_sized(&public);
        out.put_tpm2b(&creation_data);
        out.put_tpm2b(&creation_hash);
        TpmtTkCreation {
            tag: 0x8021,
            hierarchy: tpm_rh::OWNER,
            digest: Self::creation_ticket(&name, &creation_hash),
        }
        .marshal(&mut out);
        Ok(reply(true, &[], out.as_bytes()))
    }

    fn load(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let parent = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        let private = buf.get_tpm2b().or_rc(tpm_rc::SIZE)?;
        let public: TpmtPublic = buf.get_sized().or_rc(tpm_rc::SIZE)?;
        self.key(parent)?;

        let index = private
            .strip_prefix(PRIVATE_PREFIX)
            .and_then(|rest| rest.first())
            .map(|i| *i as usize)
            .filter(|i| *i < self.aiks.len())
            .ok_or(tpm_rc::INTEGRITY | 0x100)?;
        let key = self.aiks[index].clone();
        if key.n().to_bytes_be() != public.unique {
            return Err(tpm_rc::INTEGRITY | 0x200);
        }
        let name = public.name().or_rc(tpm_rc::FAILURE)?;
        let handle = self.insert_object(Object::Key {
            public,
            private: Some(key),
        });
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&name);
        Ok(reply(true, &[handle], out.as_bytes()))
    }

    fn signer(&self, handle: u32) -> Result<RsaPrivateKey, Rc> {
        match self.key(handle)? {
            (public, Some(key)) if public.object_attributes.contains(TpmaObject::SIGN_ENCRYPT) => {
                Ok(key.clone())
            }
            _ => Err(tpm_rc::VALUE | 0x100),
        }
    }

    fn clock_info(&mut self) -> TpmsClockInfo {
        self.clock += 17;
        TpmsClockInfo {
            clock: self.clock,
            reset_count: 3,
            restart_count: 0,
            safe: 1,
        }
    }

    fn certify_creation(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let sign_handle = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let object = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        let qualifying = buf.get_tpm2b().or_rc(tpm_rc::SIZE)?;
        let creation_hash = buf.get_tpm2b().or_rc(tpm_rc::SIZE)?;
        TpmtScheme::unmarshal(buf).or_rc(tpm_rc::SIZE)?;
        let ticket = TpmtTkCreation::unmarshal(buf).or_rc(tpm_rc::SIZE)?;
        if self.fail_certify {
            return Err(tpm_rc::FAILURE);
        }

        let signer = self.signer(sign_handle)?;
        let (public, _) = self.key(object)?;
        let name = public.name().or_rc(tpm_rc::FAILURE)?;
        if ticket.digest != Self::creation_ticket(&name, &creation_hash) {
            return Err(tpm_rc::VALUE | 0x500);
        }
        let signer_name = self.key(sign_handle)?.0.name().or_rc(tpm_rc::FAILURE)?;
        let attest = TpmsAttest {
            qualified_signer: signer_name,
            extra_data: qualifying,
            clock_info: self.clock_info(),
            firmware_version: 0x2019_1023,
            attested: Attested::Creation {
                object_name: name,
                creation_hash,
            },
        }
        .to_bytes();

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&attest);
        sign(&signer, &attest).marshal(&mut out);
        Ok(reply(true, &[], out.as_bytes()))
    }

    fn quote(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let sign_handle = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        let qualifying = buf.get_tpm2b().or_rc(tpm_rc::SIZE)?;
        TpmtScheme::unmarshal(buf).or_rc(tpm_rc::SIZE)?;
        let selection = TpmlPcrSelection::unmarshal(buf).or_rc(tpm_rc::SIZE)?;
        if qualifying.len() > 64 {
            return Err(tpm_rc::SIZE | 0x100);
        }

        let signer = self.signer(sign_handle)?;
        let signer_name = self.key(sign_handle)?.0.name().or_rc(tpm_rc::FAILURE)?;
        let mut concatenated = Vec::new();
        for sel in &selection.pcr_selections {
            for index in sel.indices() {
                concatenated.extend(SoftTpm::pcr_value(sel.hash, index));
            }
        }
        let attest = TpmsAttest {
            qualified_signer: signer_name,
            extra_data: qualifying,
            clock_info: self.clock_info(),
            firmware_version: 0x2019_1023,
            attested: Attested::Quote {
                pcr_select: selection,
                pcr_digest: Sha256::digest(&concatenated).to_vec(),
            },
        }
        .to_bytes();

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&attest);
        sign(&signer, &attest).marshal(&mut out);
        Ok(reply(true, &[], out.as_bytes()))
    }

    fn start_auth_session(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        buf.get_u32().or_rc(tpm_rc::SIZE)?; // tpmKey
        buf.get_u32().or_rc(tpm_rc::SIZE)?; // bind
        buf.get_tpm2b().or_rc(tpm_rc::SIZE)?; // nonceCaller
        buf.get_tpm2b().or_rc(tpm_rc::SIZE)?; // encryptedSalt
        let session_type = buf.get_u8().or_rc(tpm_rc::SIZE)?;
        TpmtSymDef::unmarshal(buf).or_rc(tpm_rc::SIZE)?;
        buf.get_u16().or_rc(tpm_rc::SIZE)?; // authHash
        if session_type != 1 {
            return Err(RC_VALUE_1);
        }

        let handle = self.next_session;
        self.next_session += 1;
        self.transient
            .insert(handle, Object::PolicySession { satisfied: false });
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&[0x11; 16]);
        Ok(reply(false, &[handle], out.as_bytes()))
    }

    fn policy_secret(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let auth = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let session = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        auth_handles(buf)?;
        if auth != tpm_rh::ENDORSEMENT {
            return Err(tpm_rc::POLICY_FAIL);
        }
        match self.transient.get_mut(&session) {
            Some(Object::PolicySession { satisfied }) => *satisfied = true,
            _ => return Err(RC_HANDLE_1 + 0x100),
        }
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&[]); // timeout
        out.put_u16(0x8005);
        out.put_u32(tpm_rh::ENDORSEMENT);
        out.put_tpm2b(&[]);
        Ok(reply(true, &[], out.as_bytes()))
    }

    fn activate_credential(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let activate = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let key = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        let sessions = auth_handles(buf)?;
        let credential = buf.get_tpm2b().or_rc(tpm_rc::SIZE)?;
        let secret = buf.get_tpm2b().or_rc(tpm_rc::SIZE)?;

        let name = self
            .key(activate)?
            .0
            .name()
            .or_rc(tpm_rc::FAILURE)?;
        let ek = match self.key(key).map_err(|rc| rc + 0x100)? {
            (public, Some(ek)) if public.auth_policy == EK_AUTH_POLICY => ek.clone(),
            _ => return Err(tpm_rc::HANDLE | 0x200),
        };
        let policy_ok = sessions.get(1).and_then(|h| self.transient.get(h));
        if !matches!(policy_ok, Some(Object::PolicySession { satisfied: true })) {
            return Err(tpm_rc::POLICY_FAIL | 0x900);
        }

        let seed = ek
            .decrypt(Oaep::new_with_label::<Sha256, _>("IDENTITY\0"), &secret)
            .map_err(|_| tpm_rc::VALUE | 0x200)?;
        let mut blob = ResponseBuffer::new(&credential);
        let outer = blob.get_tpm2b().or_rc(tpm_rc::SIZE | 0x100)?;
        let mut enc_identity = blob.get_remaining();

        let mut mac = Hmac::<Sha256>::new_from_slice(&kdfa(&seed, "INTEGRITY", &[], 256)).unwrap();
        mac.update(&enc_identity);
        mac.update(&name);
        mac.verify_slice(&outer)
            .map_err(|_| tpm_rc::INTEGRITY | 0x100)?;

        let sym_key = kdfa(&seed, "STORAGE", &name, 128);
        cfb_mode::Decryptor::<Aes128>::new_from_slices(&sym_key, &[0u8; 16])
            .unwrap()
            .decrypt(&mut enc_identity);
        let cert_info = ResponseBuffer::new(&enc_identity)
            .get_tpm2b()
            .or_rc(tpm_rc::SIZE | 0x100)?;

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&cert_info);
        Ok(reply(true, &[], out.as_bytes()))
    }

    fn flush_context(&mut self, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        let handle = buf.get_u32().or_rc(tpm_rc::SIZE)?;
        self.transient
            .remove(&handle)
            .ok_or(tpm_rc::HANDLE | 0x100)?;
        Ok(reply(false, &[], &[]))
    }

    fn dispatch(&mut self, code: TpmCc, buf: &mut ResponseBuffer) -> Result<Vec<u8>, Rc> {
        match code {
            TpmCc::GetCapability => self.get_capability(buf),
            TpmCc::PcrRead => self.pcr_read(buf),
            TpmCc::NvReadPublic => self.nv_read_public(buf),
            TpmCc::NvRead => self.nv_read(buf),
            TpmCc::ReadPublic => self.read_public(buf),
            TpmCc::CreatePrimary => self.create_primary(buf),
            TpmCc::EvictControl => self.evict_control(buf),
            TpmCc::Create => self.create(buf),
            TpmCc::Load => self.load(buf),
            TpmCc::CertifyCreation => self.certify_creation(buf),
            TpmCc::Quote => self.quote(buf),
            TpmCc::StartAuthSession => self.start_auth_session(buf),
            TpmCc::PolicySecret => self.policy_secret(buf),
            TpmCc::ActivateCredential => self.activate_credential(buf),
            TpmCc::FlushContext => self.flush_context(buf),
        }
    }
}

impl Transport for SoftTpm {
    fn transmit(&mut self, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut buf = ResponseBuffer::new(command);
        let tag = buf.get_u16()?;
        let size = buf.get_u32()? as usize;
        let code = buf.get_u32()?;
        if size != command.len() || !matches!(tag, 0x8001 | 0x8002) {
            return Ok(header(0x8001, tpm_rc::BAD_TAG, &[]));
        }
        let Some(code) = TpmCc::from_u32(code) else {
            // TPM_RC_COMMAND_CODE
            return Ok(header(0x8001, 0x143, &[]));
        };

        let mut state = self.state.lock().unwrap();
        state.commands.push(code);
        Ok(match state.dispatch(code, &mut buf) {
            Ok(response) => response,
            Err(rc) => header(0x8001, rc, &[]),
        })
    }
}
