//! Queue signing and response-encryption key stores
//!
//! Two watched directories hold one file per queue-name prefix: signing-key
//! files carry `ssh-ed25519 ` public keys used to verify envelope
//! signatures, response-key files carry PEM RSA public keys used to seal
//! reports going back to the experiment owner. Lookup is longest-prefix so
//! one key can cover a whole family of queues.

use crate::dynstore::DynStore;
use crate::error::{ErrorSink, Result, WorkerError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::VerifyingKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Parse the OpenSSH one-line form of an ed25519 public key
pub fn parse_ssh_ed25519(content: &[u8]) -> Result<VerifyingKey> {
    let text = std::str::from_utf8(content)
        .map_err(|e| WorkerError::malformed("signing key is not utf-8").with_source(e))?
        .trim();

    if !text.starts_with("ssh-ed25519 ") {
        return Err(WorkerError::malformed("signing key must begin with ssh-ed25519"));
    }

    let blob_b64 = text
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| WorkerError::malformed("signing key missing base64 blob"))?;
    let blob = STANDARD
        .decode(blob_b64)
        .map_err(|e| WorkerError::malformed("signing key base64 invalid").with_source(e))?;

    // OpenSSH wire blob: length-prefixed algorithm name, then the raw key
    let (algo, rest) = read_ssh_string(&blob)?;
    if algo != b"ssh-ed25519" {
        return Err(WorkerError::malformed("signing key blob algorithm mismatch"));
    }
    let (raw, _) = read_ssh_string(rest)?;
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| WorkerError::malformed("ed25519 key must be 32 bytes"))?;

    VerifyingKey::from_bytes(&raw)
        .map_err(|e| WorkerError::crypto("ed25519 key rejected").with_source(e))
}

fn read_ssh_string(data: &[u8]) -> Result<(&[u8], &[u8])> {
    if data.len() < 4 {
        return Err(WorkerError::malformed("ssh blob truncated"));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < 4 + len {
        return Err(WorkerError::malformed("ssh blob field overruns"));
    }
    Ok((&data[4..4 + len], &data[4 + len..]))
}

/// Parse a PEM RSA public key, PKCS#1 or SPKI framed
pub fn parse_rsa_public(content: &[u8]) -> Result<RsaPublicKey> {
    let text = std::str::from_utf8(content)
        .map_err(|e| WorkerError::malformed("response key is not utf-8").with_source(e))?
        .trim();

    if text.starts_with("-----BEGIN RSA PUBLIC KEY-----") {
        RsaPublicKey::from_pkcs1_pem(text)
            .map_err(|e| WorkerError::crypto("pkcs1 rsa key rejected").with_source(e))
    } else if text.starts_with("-----BEGIN PUBLIC KEY-----") {
        RsaPublicKey::from_public_key_pem(text)
            .map_err(|e| WorkerError::crypto("spki rsa key rejected").with_source(e))
    } else {
        Err(WorkerError::malformed("response key missing PEM header"))
    }
}

/// Watched collection of envelope-signature verification keys
#[derive(Clone)]
pub struct SigningKeys {
    store: DynStore<VerifyingKey>,
}

impl SigningKeys {
    pub fn start(
        dir: impl Into<PathBuf>,
        period: Duration,
        errors: ErrorSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        SigningKeys {
            store: DynStore::start(
                dir,
                Arc::new(|content: &[u8]| parse_ssh_ed25519(content)),
                period,
                errors,
                shutdown,
            ),
        }
    }

    /// Longest-prefix key for a queue name
    pub fn select(&self, queue: &str) -> Result<VerifyingKey> {
        self.store
            .selection(queue)
            .map(|(_, key)| key)
            .ok_or_else(|| {
                WorkerError::not_found("no signing key covers queue").with("queue", queue)
            })
    }

    pub async fn wait_for_refresh(&self) {
        self.store.wait_for_refresh().await
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Watched collection of report-sealing RSA public keys
#[derive(Clone)]
pub struct ResponseKeys {
    store: DynStore<RsaPublicKey>,
}

impl ResponseKeys {
    pub fn start(
        dir: impl Into<PathBuf>,
        period: Duration,
        errors: ErrorSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ResponseKeys {
            store: DynStore::start(
                dir,
                Arc::new(|content: &[u8]| parse_rsa_public(content)),
                period,
                errors,
                shutdown,
            ),
        }
    }

    pub fn select(&self, queue: &str) -> Result<RsaPublicKey> {
        self.store
            .selection(queue)
            .map(|(_, key)| key)
            .ok_or_else(|| {
                WorkerError::not_found("no response key covers queue").with("queue", queue)
            })
    }

    pub async fn wait_for_refresh(&self) {
        self.store.wait_for_refresh().await
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Test-only helpers shared with other modules' tests
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Render a verifying key in the OpenSSH one-line format
    pub(crate) fn ssh_encode(key: &VerifyingKey) -> String {
        let mut blob = Vec::new();
        for field in [b"ssh-ed25519" as &[u8], key.as_bytes()] {
            blob.extend_from_slice(&(field.len() as u32).to_be_bytes());
            blob.extend_from_slice(field);
        }
        format!("ssh-ed25519 {} kiln-test", STANDARD.encode(blob))
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::ssh_encode;
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::RsaPrivateKey;
    use std::fs;

    #[test]
    fn test_ssh_key_round_trip_verifies() {
        let signing = SigningKey::generate(&mut OsRng);
        let encoded = ssh_encode(&signing.verifying_key());

        let parsed = parse_ssh_ed25519(encoded.as_bytes()).unwrap();
        let signature = signing.sign(b"queue message body");
        parsed.verify_strict(b"queue message body", &signature).unwrap();
    }

    #[test]
    fn test_ssh_key_rejects_other_algorithms() {
        let err = parse_ssh_ed25519(b"ssh-rsa AAAA comment").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Malformed);
    }

    #[test]
    fn test_rsa_pem_parsing() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let pem = private
            .to_public_key()
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        parse_rsa_public(pem.as_bytes()).unwrap();

        let err = parse_rsa_public(b"not a pem").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_signing_store_prefix_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let broad = SigningKey::generate(&mut OsRng);
        let narrow = SigningKey::generate(&mut OsRng);
        fs::write(dir.path().join("rmq_"), ssh_encode(&broad.verifying_key())).unwrap();
        fs::write(
            dir.path().join("rmq_production"),
            ssh_encode(&narrow.verifying_key()),
        )
        .unwrap();

        let (sink, _errs) = ErrorSink::channel(4);
        let (_tx, shutdown) = watch::channel(false);
        let keys = SigningKeys::start(dir.path(), Duration::from_millis(50), sink, shutdown);
        keys.wait_for_refresh().await;

        let key = keys.select("rmq_production_alpha").unwrap();
        assert_eq!(key.as_bytes(), narrow.verifying_key().as_bytes());

        let key = keys.select("rmq_dev").unwrap();
        assert_eq!(key.as_bytes(), broad.verifying_key().as_bytes());

        let err = keys.select("sqs_east:jobs").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
