//! L2 Hub-half enrolment manager: pairing-code issuance, challenge/response
//! verification against the node's OpenSSH public key, operator
//! approval/rejection, and authorised-keys installation (spec §4.L2).

use crate::store::enrollment as store;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use common::{ActiveConnection, ConnectionStatus, Enrollment, EnrollmentStatus, Error, PairingCode};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::Rng;
use sqlx::SqlitePool;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

const PAIRING_CODE_TTL_MINUTES: i64 = 10;
const ENROLLMENT_TTL_MINUTES: i64 = 10;
const CHALLENGE_BYTES: usize = 32;
const GROUP_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789"; // no 0/O/1/I, easy to read aloud

pub struct EnrollmentManager {
    pool: SqlitePool,
}

impl EnrollmentManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Generates a random, high-entropy, human-groupable `XXXX-XXXX-XXXX`
    /// code with a 10 minute TTL (spec §4.L2, S6).
    pub async fn issue_pairing_code(&self) -> Result<PairingCode, Error> {
        let mut rng = rand::thread_rng();
        let group = |rng: &mut rand::rngs::ThreadRng| -> String {
            (0..4).map(|_| GROUP_ALPHABET[rng.gen_range(0..GROUP_ALPHABET.len())] as char).collect()
        };
        let code_str = format!("{}-{}-{}", group(&mut rng), group(&mut rng), group(&mut rng));
        let now = Utc::now();
        let code = PairingCode {
            code: code_str,
            created_at: now,
            expires_at: now + ChronoDuration::minutes(PAIRING_CODE_TTL_MINUTES),
            consumed: false,
        };
        store::create_pairing_code(&self.pool, &code).await?;
        info!(code = %code.code, "issued pairing code");
        Ok(code)
    }

    /// Validates and consumes the pairing code, creates a `pending_verification`
    /// `Enrollment`, and returns the server-generated challenge nonce the node
    /// must sign (spec §4.L2 step 2).
    pub async fn begin_enrollment(
        &self,
        pairing_code: &str,
        node_public_key: &str,
        node_name: &str,
        node_version: &str,
        key_fingerprint: &str,
    ) -> Result<Enrollment, Error> {
        let code = store::get_pairing_code(&self.pool, pairing_code).await?;
        if code.expires_at < Utc::now() {
            return Err(Error::precondition(format!("pairing code '{pairing_code}' has expired")));
        }
        // `consume_pairing_code` is the atomic gate: a second concurrent
        // enrolment attempt with the same code loses the race with Conflict.
        store::consume_pairing_code(&self.pool, pairing_code).await?;

        let challenge = random_challenge();
        let now = Utc::now();
        let enrollment = Enrollment {
            enrollment_id: Uuid::new_v4().to_string(),
            pairing_code: pairing_code.to_string(),
            node_name: node_name.to_string(),
            node_version: node_version.to_string(),
            node_public_key: node_public_key.to_string(),
            key_fingerprint: key_fingerprint.to_string(),
            challenge,
            status: EnrollmentStatus::PendingVerification,
            created_at: now,
            expires_at: now + ChronoDuration::minutes(ENROLLMENT_TTL_MINUTES),
        };
        store::create_enrollment(&self.pool, &enrollment).await?;
        info!(enrollment_id = %enrollment.enrollment_id, node = %node_name, "enrolment begun");
        Ok(enrollment)
    }

    /// Verifies the node's signature over the issued challenge against its
    /// claimed OpenSSH public key. A valid signature transitions
    /// `pending_verification -> awaiting_approval`; an invalid one
    /// transitions straight to `rejected` (spec §4.L2 step 3).
    pub async fn verify_enrollment(&self, enrollment_id: &str, signature_b64: &str) -> Result<EnrollmentStatus, Error> {
        let enrollment = store::get_enrollment(&self.pool, enrollment_id).await?;
        if enrollment.status != EnrollmentStatus::PendingVerification {
            return Err(Error::precondition(format!(
                "enrolment '{enrollment_id}' is not awaiting verification"
            )));
        }
        if enrollment.expires_at < Utc::now() {
            store::transition_enrollment(
                &self.pool,
                enrollment_id,
                EnrollmentStatus::PendingVerification,
                EnrollmentStatus::Expired,
            )
            .await?;
            return Err(Error::precondition(format!("enrolment '{enrollment_id}' has expired")));
        }

        let verified = verify_signature(&enrollment.node_public_key, &enrollment.challenge, signature_b64);
        let next = if verified { EnrollmentStatus::AwaitingApproval } else { EnrollmentStatus::Rejected };
        store::transition_enrollment(&self.pool, enrollment_id, EnrollmentStatus::PendingVerification, next).await?;
        if !verified {
            warn!(enrollment_id, "enrolment rejected: signature verification failed");
        }
        Ok(next)
    }

    /// Installs the node's public key into the tunnel user's
    /// authorised-keys file and transitions `awaiting_approval -> approved`
    /// (spec §4.L2 step 4, §8 invariant: "node public key is present for
    /// all approved enrollments").
    pub async fn approve(&self, enrollment_id: &str, authorized_keys_path: &Path) -> Result<(), Error> {
        let enrollment = store::get_enrollment(&self.pool, enrollment_id).await?;
        if enrollment.status != EnrollmentStatus::AwaitingApproval {
            return Err(Error::precondition(format!(
                "enrolment '{enrollment_id}' is not awaiting approval"
            )));
        }
        install_key(authorized_keys_path, &enrollment.node_public_key, &enrollment.key_fingerprint).await?;
        store::transition_enrollment(
            &self.pool,
            enrollment_id,
            EnrollmentStatus::AwaitingApproval,
            EnrollmentStatus::Approved,
        )
        .await?;
        store::upsert_active_connection(
            &self.pool,
            &ActiveConnection {
                enrollment_id: enrollment_id.to_string(),
                status: ConnectionStatus::Down,
                last_seen: Utc::now(),
                last_error: None,
            },
        )
        .await?;
        info!(enrollment_id, node = %enrollment.node_name, "enrolment approved");
        Ok(())
    }

    pub async fn reject(&self, enrollment_id: &str) -> Result<(), Error> {
        store::transition_enrollment(
            &self.pool,
            enrollment_id,
            EnrollmentStatus::AwaitingApproval,
            EnrollmentStatus::Rejected,
        )
        .await
    }

    pub async fn status(&self, enrollment_id: &str) -> Result<EnrollmentStatus, Error> {
        Ok(store::get_enrollment(&self.pool, enrollment_id).await?.status)
    }

    /// Removes the node's key from authorised-keys and marks its connection
    /// revoked, in that order, so a crash between the two never leaves a
    /// revoked connection whose key is still trusted (spec §8).
    pub async fn revoke(&self, enrollment_id: &str, authorized_keys_path: &Path) -> Result<(), Error> {
        let enrollment = store::get_enrollment(&self.pool, enrollment_id).await?;
        remove_key(authorized_keys_path, &enrollment.key_fingerprint).await?;
        store::revoke_connection(&self.pool, enrollment_id).await?;
        info!(enrollment_id, "enrolment revoked");
        Ok(())
    }

    /// Sweeps enrollments that never reached a terminal state before their
    /// TTL elapsed (spec S6: "after 10 min with no approval -> expired").
    pub async fn sweep_expired(&self) -> Result<usize, Error> {
        let expired = store::list_expired_pending_enrollments(&self.pool, Utc::now()).await?;
        let count = expired.len();
        for e in expired {
            store::transition_enrollment(&self.pool, &e.enrollment_id, e.status, EnrollmentStatus::Expired).await?;
        }
        Ok(count)
    }
}

fn random_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    rand::thread_rng().fill(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Parses `node_public_key` as an OpenSSH `ssh-ed25519` public key and
/// checks `signature_b64` (base64-encoded raw Ed25519 signature) over the
/// UTF-8 bytes of `challenge`. Any parse failure is treated as a failed
/// verification rather than propagated, since an unparseable key is by
/// definition not one the node could have signed with.
fn verify_signature(node_public_key: &str, challenge: &str, signature_b64: &str) -> bool {
    let Ok(parsed) = ssh_key::PublicKey::from_openssh(node_public_key) else {
        return false;
    };
    let Some(ed25519) = parsed.key_data().ed25519() else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&ed25519.0) else {
        return false;
    };
    let Ok(signature_bytes) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(signature_bytes): Result<[u8; 64], _> = signature_bytes.try_into() else {
        return false;
    };
    let signature = Signature::from_bytes(&signature_bytes);
    verifying_key.verify(challenge.as_bytes(), &signature).is_ok()
}

async fn install_key(path: &Path, public_key: &str, fingerprint: &str) -> Result<(), Error> {
    let existing = fs::read_to_string(path).await.unwrap_or_default();
    if existing.lines().any(|line| line.trim() == public_key.trim()) {
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(public_key.trim());
    updated.push('\n');
    fs::write(path, updated).await.map_err(|e| {
        Error::fatal(format!("failed to install key {fingerprint} into {}: {e}", path.display()))
    })
}

async fn remove_key(path: &Path, fingerprint_hint: &str) -> Result<(), Error> {
    let existing = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(_) => return Ok(()), // nothing installed, nothing to revoke
    };
    let retained: Vec<&str> = existing
        .lines()
        .filter(|line| !line.contains(fingerprint_hint) && !line.is_empty())
        .collect();
    let mut updated = retained.join("\n");
    if !updated.is_empty() {
        updated.push('\n');
    }
    fs::write(path, updated)
        .await
        .map_err(|e| Error::fatal(format!("failed to update {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use ed25519_dalek::SigningKey;

    fn issue_test_keypair() -> (SigningKey, String) {
        let signing_key = SigningKey::generate(&mut rand::thread_rng());
        let openssh_key = ssh_key::PublicKey::new(
            ssh_key::public::KeyData::Ed25519(ssh_key::public::Ed25519PublicKey(
                signing_key.verifying_key().to_bytes(),
            )),
            "test",
        )
        .to_openssh()
        .unwrap();
        (signing_key, openssh_key)
    }

    #[tokio::test]
    async fn pairing_code_ttl_and_reuse_matches_s6() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = EnrollmentManager::new(db.pool().clone());
        let code = mgr.issue_pairing_code().await.unwrap();
        assert_eq!(code.code.len(), 14); // XXXX-XXXX-XXXX

        let (_signing_key, public_key) = issue_test_keypair();
        mgr.begin_enrollment(&code.code, &public_key, "node-a", "1.0.0", "SHA256:abc").await.unwrap();

        let err = mgr
            .begin_enrollment(&code.code, &public_key, "node-a", "1.0.0", "SHA256:abc")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn valid_signature_moves_to_awaiting_approval() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = EnrollmentManager::new(db.pool().clone());
        let code = mgr.issue_pairing_code().await.unwrap();
        let (signing_key, public_key) = issue_test_keypair();
        let enrollment =
            mgr.begin_enrollment(&code.code, &public_key, "node-a", "1.0.0", "SHA256:abc").await.unwrap();

        use ed25519_dalek::Signer;
        let signature = signing_key.sign(enrollment.challenge.as_bytes());
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());

        let status = mgr.verify_enrollment(&enrollment.enrollment_id, &signature_b64).await.unwrap();
        assert_eq!(status, EnrollmentStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn invalid_signature_rejects() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = EnrollmentManager::new(db.pool().clone());
        let code = mgr.issue_pairing_code().await.unwrap();
        let (_signing_key, public_key) = issue_test_keypair();
        let enrollment =
            mgr.begin_enrollment(&code.code, &public_key, "node-a", "1.0.0", "SHA256:abc").await.unwrap();

        let bogus_b64 = base64::engine::general_purpose::STANDARD.encode([0u8; 64]);
        let status = mgr.verify_enrollment(&enrollment.enrollment_id, &bogus_b64).await.unwrap();
        assert_eq!(status, EnrollmentStatus::Rejected);
    }

    #[tokio::test]
    async fn approve_installs_key_and_revoke_removes_it() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = EnrollmentManager::new(db.pool().clone());
        let code = mgr.issue_pairing_code().await.unwrap();
        let (signing_key, public_key) = issue_test_keypair();
        let enrollment =
            mgr.begin_enrollment(&code.code, &public_key, "node-a", "1.0.0", "SHA256:abc").await.unwrap();

        use ed25519_dalek::Signer;
        let signature = signing_key.sign(enrollment.challenge.as_bytes());
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());
        mgr.verify_enrollment(&enrollment.enrollment_id, &signature_b64).await.unwrap();

        let tmp = tempfile::NamedTempFile::new().unwrap();
        mgr.approve(&enrollment.enrollment_id, tmp.path()).await.unwrap();
        let contents = std::fs::read_to_string(tmp.path()).unwrap();
        assert!(contents.contains(public_key.trim()));

        mgr.revoke(&enrollment.enrollment_id, tmp.path()).await.unwrap();
        let contents = std::fs::read_to_string(tmp.path()).unwrap();
        assert!(!contents.contains(public_key.trim()));
    }
}
