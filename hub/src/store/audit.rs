//! Repository for the append-only `AuditEvent` log (T3). Never updated,
//! never deleted through this module — filterable by type, subject,
//! time window, and operator.

use chrono::{DateTime, Utc};
use common::{AuditEvent, AuditSeverity, Error};
use sqlx::{Row, SqlitePool};

fn db_err(e: sqlx::Error) -> Error {
    Error::unavailable(e.to_string())
}

fn severity_str(s: AuditSeverity) -> &'static str {
    match s {
        AuditSeverity::Info => "info",
        AuditSeverity::Warning => "warning",
        AuditSeverity::Error => "error",
        AuditSeverity::Critical => "critical",
    }
}

fn str_severity(s: &str) -> Result<AuditSeverity, Error> {
    Ok(match s {
        "info" => AuditSeverity::Info,
        "warning" => AuditSeverity::Warning,
        "error" => AuditSeverity::Error,
        "critical" => AuditSeverity::Critical,
        other => return Err(Error::integrity(format!("unknown audit severity '{other}'"))),
    })
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<AuditEvent, Error> {
    let severity: String = row.try_get("severity").map_err(db_err)?;
    Ok(AuditEvent {
        event_id: row.try_get("event_id").map_err(db_err)?,
        timestamp: row.try_get("timestamp").map_err(db_err)?,
        event_type: row.try_get("event_type").map_err(db_err)?,
        severity: str_severity(&severity)?,
        subject_id: row.try_get("subject_id").map_err(db_err)?,
        operator: row.try_get("operator").map_err(db_err)?,
        action: row.try_get("action").map_err(db_err)?,
        details: row.try_get("details").map_err(db_err)?,
    })
}

pub async fn record(pool: &SqlitePool, event: &AuditEvent) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO audit_events (event_id, timestamp, event_type, severity, subject_id, operator, action, details)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&event.event_id)
    .bind(event.timestamp)
    .bind(&event.event_type)
    .bind(severity_str(event.severity))
    .bind(&event.subject_id)
    .bind(&event.operator)
    .bind(&event.action)
    .bind(&event.details)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<String>,
    pub subject_id: Option<String>,
    pub operator: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

pub async fn query(pool: &SqlitePool, filter: &AuditFilter) -> Result<Vec<AuditEvent>, Error> {
    let mut sql = String::from("SELECT * FROM audit_events WHERE 1=1");
    if filter.event_type.is_some() {
        sql.push_str(" AND event_type = ?");
    }
    if filter.subject_id.is_some() {
        sql.push_str(" AND subject_id = ?");
    }
    if filter.operator.is_some() {
        sql.push_str(" AND operator = ?");
    }
    if filter.since.is_some() {
        sql.push_str(" AND timestamp >= ?");
    }
    if filter.until.is_some() {
        sql.push_str(" AND timestamp <= ?");
    }
    sql.push_str(" ORDER BY timestamp DESC");

    let mut query = sqlx::query(&sql);
    if let Some(v) = &filter.event_type {
        query = query.bind(v);
    }
    if let Some(v) = &filter.subject_id {
        query = query.bind(v);
    }
    if let Some(v) = &filter.operator {
        query = query.bind(v);
    }
    if let Some(v) = &filter.since {
        query = query.bind(v);
    }
    if let Some(v) = &filter.until {
        query = query.bind(v);
    }

    let rows = query.fetch_all(pool).await.map_err(db_err)?;
    rows.into_iter().map(row_to_event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn filters_by_event_type_and_subject() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();

        record(db.pool(), &AuditEvent::new("enrollment.approved", AuditSeverity::Info, "approve").with_subject("e1"))
            .await
            .unwrap();
        record(db.pool(), &AuditEvent::new("job.completed", AuditSeverity::Info, "complete").with_subject("j1"))
            .await
            .unwrap();

        let filtered = query(
            db.pool(),
            &AuditFilter { event_type: Some("enrollment.approved".into()), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].subject_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn append_only_log_preserves_insertion_order_reversed() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        for i in 0..3 {
            record(db.pool(), &AuditEvent::new("tick", AuditSeverity::Info, format!("tick-{i}")))
                .await
                .unwrap();
        }
        let all = query(db.pool(), &AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, "tick-2");
    }
}
