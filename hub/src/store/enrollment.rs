//! Repositories for `PairingCode`, `Enrollment`, and `ActiveConnection`
//! (L2 Hub half, spec §4.L2).

use chrono::{DateTime, Utc};
use common::{ActiveConnection, ConnectionStatus, Enrollment, EnrollmentStatus, Error, PairingCode};
use sqlx::{Row, SqlitePool};

fn db_err(e: sqlx::Error) -> Error {
    Error::unavailable(e.to_string())
}

pub async fn create_pairing_code(pool: &SqlitePool, code: &PairingCode) -> Result<(), Error> {
    sqlx::query("INSERT INTO pairing_codes (code, created_at, expires_at, consumed) VALUES (?, ?, ?, ?)")
        .bind(&code.code)
        .bind(code.created_at)
        .bind(code.expires_at)
        .bind(code.consumed as i64)
        .execute(pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                Error::conflict(format!("pairing code '{}' already exists", code.code))
            } else {
                db_err(e)
            }
        })?;
    Ok(())
}

fn row_to_pairing_code(row: sqlx::sqlite::SqliteRow) -> Result<PairingCode, Error> {
    Ok(PairingCode {
        code: row.try_get("code").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        consumed: row.try_get::<i64, _>("consumed").map_err(db_err)? != 0,
    })
}

pub async fn get_pairing_code(pool: &SqlitePool, code: &str) -> Result<PairingCode, Error> {
    let row = sqlx::query("SELECT * FROM pairing_codes WHERE code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("pairing code '{code}' not found")))?;
    row_to_pairing_code(row)
}

/// Atomically claims a pairing code: a code already `consumed` loses the
/// race with `Conflict` (spec §8: "re-use of the same code ⇒ Conflict").
/// An unconsumed but expired code is left alone for the caller to classify
/// as `Precondition` instead.
pub async fn consume_pairing_code(pool: &SqlitePool, code: &str) -> Result<(), Error> {
    let result = sqlx::query("UPDATE pairing_codes SET consumed = 1 WHERE code = ? AND consumed = 0")
        .bind(code)
        .execute(pool)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        let exists = get_pairing_code(pool, code).await;
        return match exists {
            Ok(_) => Err(Error::conflict(format!("pairing code '{code}' already consumed"))),
            Err(_) => Err(Error::not_found(format!("pairing code '{code}' not found"))),
        };
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------

fn status_str(s: EnrollmentStatus) -> &'static str {
    match s {
        EnrollmentStatus::PendingVerification => "pending_verification",
        EnrollmentStatus::AwaitingApproval => "awaiting_approval",
        EnrollmentStatus::Approved => "approved",
        EnrollmentStatus::Rejected => "rejected",
        EnrollmentStatus::Expired => "expired",
    }
}

fn str_status(s: &str) -> Result<EnrollmentStatus, Error> {
    Ok(match s {
        "pending_verification" => EnrollmentStatus::PendingVerification,
        "awaiting_approval" => EnrollmentStatus::AwaitingApproval,
        "approved" => EnrollmentStatus::Approved,
        "rejected" => EnrollmentStatus::Rejected,
        "expired" => EnrollmentStatus::Expired,
        other => return Err(Error::integrity(format!("unknown enrollment status '{other}'"))),
    })
}

fn row_to_enrollment(row: sqlx::sqlite::SqliteRow) -> Result<Enrollment, Error> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Enrollment {
        enrollment_id: row.try_get("enrollment_id").map_err(db_err)?,
        pairing_code: row.try_get("pairing_code").map_err(db_err)?,
        node_name: row.try_get("node_name").map_err(db_err)?,
        node_version: row.try_get("node_version").map_err(db_err)?,
        node_public_key: row.try_get("node_public_key").map_err(db_err)?,
        key_fingerprint: row.try_get("key_fingerprint").map_err(db_err)?,
        challenge: row.try_get("challenge").map_err(db_err)?,
        status: str_status(&status)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
    })
}

pub async fn create_enrollment(pool: &SqlitePool, e: &Enrollment) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO enrollments
           (enrollment_id, pairing_code, node_name, node_version, node_public_key, key_fingerprint,
            challenge, status, created_at, expires_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&e.enrollment_id)
    .bind(&e.pairing_code)
    .bind(&e.node_name)
    .bind(&e.node_version)
    .bind(&e.node_public_key)
    .bind(&e.key_fingerprint)
    .bind(&e.challenge)
    .bind(status_str(e.status))
    .bind(e.created_at)
    .bind(e.expires_at)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn get_enrollment(pool: &SqlitePool, enrollment_id: &str) -> Result<Enrollment, Error> {
    let row = sqlx::query("SELECT * FROM enrollments WHERE enrollment_id = ?")
        .bind(enrollment_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("enrollment '{enrollment_id}' not found")))?;
    row_to_enrollment(row)
}

/// Transitions only along the protocol's directed edges (spec §4.L2); an
/// unexpected current status is an `IntegrityViolation`, not a silent
/// overwrite.
pub async fn transition_enrollment(
    pool: &SqlitePool,
    enrollment_id: &str,
    expected: EnrollmentStatus,
    next: EnrollmentStatus,
) -> Result<(), Error> {
    let result = sqlx::query("UPDATE enrollments SET status = ? WHERE enrollment_id = ? AND status = ?")
        .bind(status_str(next))
        .bind(enrollment_id)
        .bind(status_str(expected))
        .execute(pool)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        let current = get_enrollment(pool, enrollment_id).await?;
        return Err(Error::precondition(format!(
            "enrollment '{enrollment_id}' is '{}', expected '{}'",
            status_str(current.status),
            status_str(expected)
        )));
    }
    Ok(())
}

pub async fn list_expired_pending_enrollments(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Enrollment>, Error> {
    let rows = sqlx::query(
        "SELECT * FROM enrollments WHERE status IN ('pending_verification', 'awaiting_approval') AND expires_at < ?",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    rows.into_iter().map(row_to_enrollment).collect()
}

// ---------------------------------------------------------------------
// ActiveConnection
// ---------------------------------------------------------------------

fn conn_status_str(s: ConnectionStatus) -> &'static str {
    match s {
        ConnectionStatus::Down => "down",
        ConnectionStatus::Connecting => "connecting",
        ConnectionStatus::Up => "up",
        ConnectionStatus::Degraded => "degraded",
        ConnectionStatus::Revoked => "revoked",
    }
}

fn str_conn_status(s: &str) -> Result<ConnectionStatus, Error> {
    Ok(match s {
        "down" => ConnectionStatus::Down,
        "connecting" => ConnectionStatus::Connecting,
        "up" => ConnectionStatus::Up,
        "degraded" => ConnectionStatus::Degraded,
        "revoked" => ConnectionStatus::Revoked,
        other => return Err(Error::integrity(format!("unknown connection status '{other}'"))),
    })
}

pub async fn upsert_active_connection(pool: &SqlitePool, c: &ActiveConnection) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO active_connections (enrollment_id, status, last_seen, last_error)
           VALUES (?, ?, ?, ?)
           ON CONFLICT(enrollment_id) DO UPDATE SET status = excluded.status, last_seen = excluded.last_seen, last_error = excluded.last_error"#,
    )
    .bind(&c.enrollment_id)
    .bind(conn_status_str(c.status))
    .bind(c.last_seen)
    .bind(&c.last_error)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn get_active_connection(pool: &SqlitePool, enrollment_id: &str) -> Result<ActiveConnection, Error> {
    let row = sqlx::query("SELECT * FROM active_connections WHERE enrollment_id = ?")
        .bind(enrollment_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("connection for enrollment '{enrollment_id}' not found")))?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(ActiveConnection {
        enrollment_id: row.try_get("enrollment_id").map_err(db_err)?,
        status: str_conn_status(&status)?,
        last_seen: row.try_get("last_seen").map_err(db_err)?,
        last_error: row.try_get("last_error").map_err(db_err)?,
    })
}

/// Marks the connection revoked. Callers pair this with removing the
/// node's public key from the authorised-keys file in the same logical
/// transaction (spec §8: "revocation removes it in the same logical
/// transaction").
pub async fn revoke_connection(pool: &SqlitePool, enrollment_id: &str) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO active_connections (enrollment_id, status, last_seen, last_error)
           VALUES (?, 'revoked', ?, NULL)
           ON CONFLICT(enrollment_id) DO UPDATE SET status = 'revoked', last_seen = excluded.last_seen"#,
    )
    .bind(enrollment_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn sample_code() -> PairingCode {
        PairingCode {
            code: "AX7K-PJ3F-TH2Q".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
            consumed: false,
        }
    }

    #[tokio::test]
    async fn pairing_code_consumed_twice_conflicts() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let code = sample_code();
        create_pairing_code(db.pool(), &code).await.unwrap();
        consume_pairing_code(db.pool(), &code.code).await.unwrap();
        let err = consume_pairing_code(db.pool(), &code.code).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn enrollment_transition_rejects_wrong_current_state() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let e = Enrollment {
            enrollment_id: "e1".into(),
            pairing_code: "AX7K-PJ3F-TH2Q".into(),
            node_name: "node-a".into(),
            node_version: "1.0.0".into(),
            node_public_key: "ssh-ed25519 AAAA".into(),
            key_fingerprint: "SHA256:abc".into(),
            challenge: "nonce".into(),
            status: EnrollmentStatus::PendingVerification,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(10),
        };
        create_enrollment(db.pool(), &e).await.unwrap();
        let err = transition_enrollment(
            db.pool(),
            "e1",
            EnrollmentStatus::AwaitingApproval,
            EnrollmentStatus::Approved,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        transition_enrollment(
            db.pool(),
            "e1",
            EnrollmentStatus::PendingVerification,
            EnrollmentStatus::AwaitingApproval,
        )
        .await
        .unwrap();
        let fetched = get_enrollment(db.pool(), "e1").await.unwrap();
        assert_eq!(fetched.status, EnrollmentStatus::AwaitingApproval);
    }
}
