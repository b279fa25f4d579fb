//! Queue message envelope and hybrid payload sealing
//!
//! The outer JSON object every broker delivers. Its `payload` is either the
//! clear-text JSON of a request or a sealed pair
//! `base64(rsa_wrapped_key),base64(nonce || aes_gcm_body)`: a fresh 32-byte
//! symmetric key encrypts the request under AES-256-GCM, and RSA-OAEP over
//! SHA-256 wraps that key for the worker. Detached ed25519 signatures and a
//! SHA-256 fingerprint cover the payload string.

use crate::error::{Result, WorkerError};
use crate::request::{Request, Resource};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SYM_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// Open experiment fields copied beside the sealed payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenExperiment {
    #[serde(default)]
    pub status: String,
    #[serde(rename = "pthonver", default)]
    pub python_ver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub experiment: OpenExperiment,
    #[serde(default)]
    pub time_added: f64,
    #[serde(default)]
    pub experiment_lifetime: String,
    #[serde(rename = "resources_needed", default)]
    pub resource: Resource,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
}

/// Whether `data` parses as an envelope (top-level JSON with
/// `message.payload` present)
pub fn is_envelope(data: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get("message")?.get("payload").cloned())
        .is_some()
}

/// Seal `plain` for the holder of `public`: AES-256-GCM body under a fresh
/// key, the key wrapped with RSA-OAEP/SHA-256
pub fn hybrid_seal(plain: &[u8], public: &RsaPublicKey) -> Result<String> {
    let mut key = [0u8; SYM_KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let body = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| WorkerError::crypto("symmetric encryption failed"))?;

    let mut sym_block = Vec::with_capacity(NONCE_BYTES + body.len());
    sym_block.extend_from_slice(&nonce);
    sym_block.extend_from_slice(&body);

    let wrapped = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)
        .map_err(|e| WorkerError::crypto("rsa key wrap failed").with_source(e))?;

    Ok(format!(
        "{},{}",
        STANDARD.encode(wrapped),
        STANDARD.encode(sym_block)
    ))
}

/// Invert `hybrid_seal`, failing with a distinct kind at each layer
pub fn hybrid_unseal(payload: &str, private: &RsaPrivateKey) -> Result<Vec<u8>> {
    let mut parts = payload.splitn(3, ',');
    let (wrapped_b64, sym_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => (a, b),
        _ => return Err(WorkerError::malformed("sealed payload is not two fields")),
    };

    let wrapped = STANDARD
        .decode(wrapped_b64)
        .map_err(|e| WorkerError::malformed("key field base64 invalid").with_source(e))?;
    let sym_block = STANDARD
        .decode(sym_b64)
        .map_err(|e| WorkerError::malformed("body field base64 invalid").with_source(e))?;

    let key = private
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|e| WorkerError::crypto("rsa key unwrap failed").with_source(e))?;
    if key.len() != SYM_KEY_BYTES {
        return Err(WorkerError::crypto("unwrapped key has wrong length").with("len", key.len()));
    }
    if sym_block.len() < NONCE_BYTES {
        return Err(WorkerError::malformed("symmetric block shorter than nonce"));
    }

    let (nonce, body) = sym_block.split_at(NONCE_BYTES);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| WorkerError::crypto("payload authentication failed"))
}

impl Envelope {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if !is_envelope(data) {
            return Err(WorkerError::malformed("message is not an envelope"));
        }
        serde_json::from_slice(data)
            .map_err(|e| WorkerError::malformed("envelope json parse failed").with_source(e))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| WorkerError::malformed("envelope json encode failed").with_source(e))
    }

    /// Lift a request into an envelope with a clear-text payload
    pub fn open(request: &Request) -> Result<Self> {
        let payload = String::from_utf8(request.to_json()?)
            .map_err(|e| WorkerError::malformed("request is not utf-8").with_source(e))?;
        Ok(Self::around(request, payload))
    }

    /// Lift a request into an envelope, sealing its JSON for `public`
    pub fn sealed(request: &Request, public: &RsaPublicKey) -> Result<Self> {
        let payload = hybrid_seal(&request.to_json()?, public)?;
        Ok(Self::around(request, payload))
    }

    fn around(request: &Request, payload: String) -> Self {
        Envelope {
            message: Message {
                experiment: OpenExperiment {
                    status: request.experiment.status.clone(),
                    python_ver: request.experiment.python_ver.clone(),
                },
                time_added: request.experiment.time_added,
                experiment_lifetime: request.config.lifetime.clone(),
                resource: request.experiment.resource.clone(),
                payload,
                fingerprint: None,
                signature: None,
            },
        }
    }

    /// Whether the payload is sealed rather than clear JSON
    pub fn is_sealed(&self) -> bool {
        !self.message.payload.trim_start().starts_with('{')
    }

    /// Recover the request, unsealing with `private` when needed
    pub fn request(&self, private: Option<&RsaPrivateKey>) -> Result<Request> {
        if self.is_sealed() {
            let private = private.ok_or_else(|| {
                WorkerError::not_found("sealed payload but no private key configured")
            })?;
            let plain = hybrid_unseal(&self.message.payload, private)?;
            Request::from_json(&plain)
        } else {
            Request::from_json(self.message.payload.as_bytes())
        }
    }

    /// Fingerprint and sign the payload with `key`
    pub fn sign(&mut self, key: &SigningKey) {
        let payload = self.message.payload.as_bytes();
        self.message.fingerprint = Some(STANDARD.encode(Sha256::digest(payload)));
        self.message.signature = Some(STANDARD.encode(key.sign(payload).to_bytes()));
    }

    /// Verify the detached signature (and fingerprint when present)
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let payload = self.message.payload.as_bytes();

        if let Some(ref fingerprint) = self.message.fingerprint {
            let expect = STANDARD.encode(Sha256::digest(payload));
            if *fingerprint != expect {
                return Err(WorkerError::crypto("payload fingerprint mismatch"));
            }
        }

        let signature_b64 = self
            .message
            .signature
            .as_ref()
            .ok_or_else(|| WorkerError::malformed("envelope is unsigned"))?;
        let raw = STANDARD
            .decode(signature_b64)
            .map_err(|e| WorkerError::malformed("signature base64 invalid").with_source(e))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| WorkerError::malformed("signature malformed").with_source(e))?;

        key.verify(payload, &signature)
            .map_err(|e| WorkerError::crypto("signature verification failed").with_source(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::request::Experiment;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public = private.to_public_key();
        (private, public)
    }

    fn sample_request() -> Request {
        Request {
            experiment: Experiment {
                key: "expt-1".to_string(),
                status: "waiting".to_string(),
                filename: "train.py".to_string(),
                python_ver: "3.10".to_string(),
                resource: Resource {
                    cpus: 2,
                    gpus: 1,
                    hdd: "10gb".to_string(),
                    ram: "2gb".to_string(),
                    gpu_mem: "4gb".to_string(),
                },
                time_added: 1754006400.5,
                ..Default::default()
            },
            config: crate::request::RequestConfig {
                lifetime: "24h".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_envelope_detection() {
        assert!(!is_envelope(b"{\"foo\": 1}"));
        assert!(!is_envelope(b"not json at all"));
        assert!(!is_envelope(b"{\"message\": {\"other\": 1}}"));
        assert!(is_envelope(b"{\"message\": {\"payload\": \"x\"}}"));
    }

    #[test]
    fn test_sealed_round_trip() {
        let (private, public) = keypair();
        let request = sample_request();

        let envelope = Envelope::sealed(&request, &public).unwrap();
        assert!(envelope.is_sealed());
        assert_eq!(envelope.message.experiment.python_ver, "3.10");
        assert_eq!(envelope.message.experiment_lifetime, "24h");

        let wire = envelope.to_json().unwrap();
        assert!(is_envelope(&wire));

        let parsed = Envelope::parse(&wire).unwrap();
        let recovered = parsed.request(Some(&private)).unwrap();
        assert_eq!(recovered, request);
    }

    #[test]
    fn test_open_round_trip_needs_no_key() {
        let request = sample_request();
        let envelope = Envelope::open(&request).unwrap();
        assert!(!envelope.is_sealed());

        let recovered = envelope.request(None).unwrap();
        assert_eq!(recovered, request);
    }

    #[test]
    fn test_large_payload_and_mismatched_key() {
        let (private, public) = keypair();
        let (wrong_private, _) = keypair();

        let mut plain = vec![0u8; 16 * 1024];
        OsRng.fill_bytes(&mut plain);

        let sealed = hybrid_seal(&plain, &public).unwrap();
        assert_eq!(hybrid_unseal(&sealed, &private).unwrap(), plain);

        let err = hybrid_unseal(&sealed, &wrong_private).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn test_unseal_failure_kinds() {
        let (private, public) = keypair();

        let err = hybrid_unseal("one-field-only", &private).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let err = hybrid_unseal("@@@@,%%%%", &private).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        // Corrupt the authenticated body
        let sealed = hybrid_seal(b"payload bytes", &public).unwrap();
        let (head, tail) = sealed.split_once(',').unwrap();
        let mut body = STANDARD.decode(tail).unwrap();
        let last = body.len() - 1;
        body[last] ^= 0x01;
        let tampered = format!("{},{}", head, STANDARD.encode(body));
        let err = hybrid_unseal(&tampered, &private).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn test_sealed_without_private_key() {
        let (_, public) = keypair();
        let envelope = Envelope::sealed(&sample_request(), &public).unwrap();
        let err = envelope.request(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_signature_lifecycle() {
        let signing = SigningKey::generate(&mut OsRng);
        let mut envelope = Envelope::open(&sample_request()).unwrap();

        // Unsigned envelopes are rejected outright
        let err = envelope.verify(&signing.verifying_key()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        envelope.sign(&signing);
        envelope.verify(&signing.verifying_key()).unwrap();

        // Any payload change invalidates both checks
        envelope.message.payload.push(' ');
        let err = envelope.verify(&signing.verifying_key()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);

        let other = SigningKey::generate(&mut OsRng);
        let mut fresh = Envelope::open(&sample_request()).unwrap();
        fresh.sign(&signing);
        let err = fresh.verify(&other.verifying_key()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }
}
