// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

pub mod sim;

use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;

pub fn fixture(name: &str) -> Vec<u8> {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read(&path).unwrap_or_else(|e| panic!("failed to read {path}: {e}"))
}

pub fn fixture_key(name: &str) -> RsaPrivateKey {
    let pem = String::from_utf8(fixture(name)).unwrap();
    RsaPrivateKey::from_pkcs8_pem(&pem).unwrap()
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}
