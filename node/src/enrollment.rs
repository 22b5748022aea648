//! Node-half of enrolment (spec §4.L2): generates this node's Ed25519
//! keypair, exchanges a pairing code for a challenge against the Hub's
//! enrolment API, signs the challenge, and polls until an operator approves
//! or rejects. Mirrors `hub::enrollment`'s key handling (`ssh-key` +
//! `ed25519-dalek`) from the opposite side of the handshake.

use base64::Engine;
use common::wire::{EnrollRequest, EnrollResultResponse, EnrollVerifyRequest};
use common::Error;
use ed25519_dalek::{Signer, SigningKey};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl NodeKeypair {
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut rand::thread_rng()) }
    }

    /// Loads an existing key from `path` if present, otherwise generates one
    /// and persists it with owner-only permissions (spec §6: the node's
    /// private key is node-local, never transmitted).
    pub async fn load_or_generate(path: &Path) -> Result<Self, Error> {
        if let Ok(bytes) = fs::read(path).await {
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::integrity(format!("key file {} is not a 32-byte Ed25519 seed", path.display())))?;
            return Ok(Self { signing_key: SigningKey::from_bytes(&bytes) });
        }
        let keypair = Self::generate();
        keypair.save(path).await?;
        Ok(keypair)
    }

    async fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Error::fatal(format!("failed to create key directory: {e}")))?;
        }
        let mut file = fs::File::create(path).await.map_err(|e| Error::fatal(format!("failed to create key file: {e}")))?;
        file.write_all(self.signing_key.to_bytes().as_slice())
            .await
            .map_err(|e| Error::fatal(format!("failed to write key file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, permissions).await.map_err(|e| Error::fatal(format!("failed to chmod key file: {e}")))?;
        }
        Ok(())
    }

    pub fn openssh_public_key(&self, comment: &str) -> Result<String, Error> {
        let key_data = ssh_key::public::KeyData::Ed25519(ssh_key::public::Ed25519PublicKey(self.signing_key.verifying_key().to_bytes()));
        ssh_key::PublicKey::new(key_data, comment)
            .to_openssh()
            .map_err(|e| Error::fatal(format!("failed to encode public key: {e}")))
    }

    pub fn fingerprint(&self, comment: &str) -> Result<String, Error> {
        let key_data = ssh_key::public::KeyData::Ed25519(ssh_key::public::Ed25519PublicKey(self.signing_key.verifying_key().to_bytes()));
        let public_key = ssh_key::PublicKey::new(key_data, comment);
        Ok(public_key.fingerprint(ssh_key::HashAlg::Sha256).to_string())
    }

    fn sign(&self, challenge: &str) -> String {
        let signature = self.signing_key.sign(challenge.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }
}

pub struct EnrollmentClient {
    http: reqwest::Client,
    oma_base_url: String,
}

impl EnrollmentClient {
    pub fn new(oma_host: &str, oma_port: u16) -> Self {
        Self {
            http: reqwest::Client::builder().build().unwrap_or_default(),
            oma_base_url: format!("https://{oma_host}:{oma_port}"),
        }
    }

    /// Drives the full enrolment handshake: submit pairing code + public
    /// key, sign the returned challenge, then poll `GET
    /// /enrollment/{id}/status` until the operator approves, rejects, or the
    /// enrolment expires (spec §4.L2, S6's 10-minute TTL bounds the poll).
    pub async fn enroll(&self, pairing_code: &str, keypair: &NodeKeypair, node_name: &str, node_version: &str, poll_interval: Duration, timeout: Duration) -> Result<String, Error> {
        let node_public_key = keypair.openssh_public_key(node_name)?;
        let key_fingerprint = keypair.fingerprint(node_name)?;

        let request = EnrollRequest {
            pairing_code: pairing_code.to_string(),
            node_public_key,
            node_name: node_name.to_string(),
            node_version: node_version.to_string(),
            key_fingerprint,
        };
        let response = self
            .http
            .post(format!("{}/api/v1/vma/enroll", self.oma_base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::unavailable(format!("enrolment request to hub failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!("hub rejected enrolment request, status {}", response.status())));
        }
        let response: common::wire::EnrollResponse =
            response.json().await.map_err(|e| Error::unavailable(format!("invalid enrolment response: {e}")))?;

        let signature = keypair.sign(&response.challenge);
        let verify_request = EnrollVerifyRequest { enrollment_id: response.enrollment_id.clone(), signature };
        let verify_response = self
            .http
            .post(format!("{}/api/v1/vma/enroll/verify", self.oma_base_url))
            .json(&verify_request)
            .send()
            .await
            .map_err(|e| Error::unavailable(format!("enrolment verification failed: {e}")))?;
        if !verify_response.status().is_success() {
            return Err(Error::unavailable(format!("hub rejected challenge signature, status {}", verify_response.status())));
        }

        info!(enrollment_id = %response.enrollment_id, "enrolment submitted, awaiting operator approval");
        self.poll_until_settled(&response.enrollment_id, poll_interval, timeout).await?;
        Ok(response.enrollment_id)
    }

    async fn poll_until_settled(&self, enrollment_id: &str, poll_interval: Duration, timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let response = self
                .http
                .get(format!("{}/api/v1/vma/enroll/result/{}", self.oma_base_url, enrollment_id))
                .send()
                .await
                .map_err(|e| Error::unavailable(format!("enrolment status poll failed: {e}")))?;
            let status: EnrollResultResponse =
                response.json().await.map_err(|e| Error::unavailable(format!("invalid enrolment status response: {e}")))?;
            match status.status.as_str() {
                "approved" => return Ok(()),
                "rejected" | "expired" => return Err(Error::precondition(format!("enrolment {enrollment_id} ended as {}", status.status))),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::unavailable(format!("enrolment {enrollment_id} timed out awaiting approval")));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keypair_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node_key");
        let generated = NodeKeypair::load_or_generate(&path).await.unwrap();
        let reloaded = NodeKeypair::load_or_generate(&path).await.unwrap();
        assert_eq!(generated.signing_key.to_bytes(), reloaded.signing_key.to_bytes());
    }

    #[test]
    fn sign_produces_verifiable_signature() {
        let keypair = NodeKeypair::generate();
        let signature_b64 = keypair.sign("abc123");
        let signature_bytes = base64::engine::general_purpose::STANDARD.decode(signature_b64).unwrap();
        let signature_bytes: [u8; 64] = signature_bytes.try_into().unwrap();
        let signature = ed25519_dalek::Signature::from_bytes(&signature_bytes);
        use ed25519_dalek::Verifier;
        assert!(keypair.signing_key.verifying_key().verify("abc123".as_bytes(), &signature).is_ok());
    }

    #[test]
    fn openssh_public_key_is_ed25519() {
        let keypair = NodeKeypair::generate();
        let encoded = keypair.openssh_public_key("node-a").unwrap();
        assert!(encoded.starts_with("ssh-ed25519 "));
    }
}
