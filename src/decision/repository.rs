//! Persistence for decisions and escalations

use super::types::{Decision, DecisionStatus, Escalation, EscalationStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;

/// Durable store of decision records
#[async_trait]
pub trait DecisionRepository: Send + Sync {
    async fn insert_decision(&self, decision: &Decision) -> Result<()>;
    async fn update_decision(&self, decision: &Decision) -> Result<()>;
    async fn get_decision(&self, id: &str) -> Result<Option<Decision>>;
    /// Oldest first
    async fn list_decisions(&self, status: Option<DecisionStatus>) -> Result<Vec<Decision>>;

    async fn insert_escalation(&self, escalation: &Escalation) -> Result<()>;
    async fn update_escalation(&self, escalation: &Escalation) -> Result<()>;
    async fn get_escalation(&self, id: &str) -> Result<Option<Escalation>>;
    /// Oldest first
    async fn list_escalations(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>>;
    async fn escalations_for(&self, decision_id: &str) -> Result<Vec<Escalation>>;

    /// Save the escalated decision and its new escalation together
    async fn escalate(&self, decision: &Decision, escalation: &Escalation) -> Result<()>;

    /// Save a resolved decision and the escalations it closes together
    async fn settle(&self, decision: &Decision, escalations: &[Escalation]) -> Result<()>;
}

/// SQLite-backed repository
pub struct SqliteDecisionRepository {
    conn: Mutex<Connection>,
}

const DECISION_COLUMNS: &str = "id, title, description, proposer, tier, status, ceo_vote, dao_vote, \
     veto_round, created_at, updated_at, resolved_at, human_decision, resolution_note";

const ESCALATION_COLUMNS: &str = "id, decision_id, reason, channels_notified, status, response, \
     responder, created_at, deadline, responded_at";

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn parse_col<T: FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e| conversion_error(idx, e))
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let tier: String = row.get(4)?;
    let status: String = row.get(5)?;
    let ceo_vote: Option<String> = row.get(6)?;
    let dao_vote: Option<String> = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let resolved_at: Option<String> = row.get(11)?;

    Ok(Decision {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        proposer: row.get(3)?,
        tier: parse_col(4, &tier)?,
        status: parse_col(5, &status)?,
        ceo_vote: ceo_vote.map(|v| parse_col(6, &v)).transpose()?,
        dao_vote: dao_vote.map(|v| parse_col(7, &v)).transpose()?,
        veto_round: row.get(8)?,
        created_at: parse_ts(9, &created_at)?,
        updated_at: parse_ts(10, &updated_at)?,
        resolved_at: resolved_at.map(|t| parse_ts(11, &t)).transpose()?,
        human_decision: row.get(12)?,
        resolution_note: row.get(13)?,
    })
}

fn escalation_from_row(row: &Row<'_>) -> rusqlite::Result<Escalation> {
    let channels: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let deadline: String = row.get(8)?;
    let responded_at: Option<String> = row.get(9)?;

    Ok(Escalation {
        id: row.get(0)?,
        decision_id: row.get(1)?,
        reason: row.get(2)?,
        channels_notified: serde_json::from_str(&channels)
            .map_err(|e| conversion_error(3, e.to_string()))?,
        status: parse_col(4, &status)?,
        response: row.get(5)?,
        responder: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
        deadline: parse_ts(8, &deadline)?,
        responded_at: responded_at.map(|t| parse_ts(9, &t)).transpose()?,
    })
}

fn write_decision(conn: &Connection, decision: &Decision, insert: bool) -> rusqlite::Result<usize> {
    let sql = if insert {
        "INSERT INTO decisions (id, title, description, proposer, tier, status, ceo_vote, dao_vote, \
         veto_round, created_at, updated_at, resolved_at, human_decision, resolution_note) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    } else {
        "UPDATE decisions SET title = ?2, description = ?3, proposer = ?4, tier = ?5, status = ?6, \
         ceo_vote = ?7, dao_vote = ?8, veto_round = ?9, created_at = ?10, updated_at = ?11, \
         resolved_at = ?12, human_decision = ?13, resolution_note = ?14 WHERE id = ?1"
    };
    conn.execute(
        sql,
        params![
            decision.id,
            decision.title,
            decision.description,
            decision.proposer,
            decision.tier.as_str(),
            decision.status.as_str(),
            decision.ceo_vote.map(|v| v.as_str()),
            decision.dao_vote.map(|v| v.as_str()),
            decision.veto_round,
            ts(&decision.created_at),
            ts(&decision.updated_at),
            decision.resolved_at.as_ref().map(ts),
            decision.human_decision,
            decision.resolution_note,
        ],
    )
}

fn write_escalation(conn: &Connection, escalation: &Escalation, insert: bool) -> Result<usize> {
    let sql = if insert {
        "INSERT INTO escalations (id, decision_id, reason, channels_notified, status, response, \
         responder, created_at, deadline, responded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
    } else {
        "UPDATE escalations SET decision_id = ?2, reason = ?3, channels_notified = ?4, status = ?5, \
         response = ?6, responder = ?7, created_at = ?8, deadline = ?9, responded_at = ?10 \
         WHERE id = ?1"
    };
    let channels = serde_json::to_string(&escalation.channels_notified)?;
    Ok(conn.execute(
        sql,
        params![
            escalation.id,
            escalation.decision_id,
            escalation.reason,
            channels,
            escalation.status.as_str(),
            escalation.response,
            escalation.responder,
            ts(&escalation.created_at),
            ts(&escalation.deadline),
            escalation.responded_at.as_ref().map(ts),
        ],
    )?)
}

impl SqliteDecisionRepository {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                proposer TEXT NOT NULL,
                tier TEXT NOT NULL,
                status TEXT NOT NULL,
                ceo_vote TEXT,
                dao_vote TEXT,
                veto_round INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                resolved_at TEXT,
                human_decision TEXT,
                resolution_note TEXT
            );

            CREATE TABLE IF NOT EXISTS escalations (
                id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                channels_notified TEXT NOT NULL,
                status TEXT NOT NULL,
                response TEXT,
                responder TEXT,
                created_at TEXT NOT NULL,
                deadline TEXT NOT NULL,
                responded_at TEXT,
                FOREIGN KEY (decision_id) REFERENCES decisions(id)
            );

            CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status);
            CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status);
            CREATE INDEX IF NOT EXISTS idx_escalations_decision ON escalations(decision_id);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl DecisionRepository for SqliteDecisionRepository {
    async fn insert_decision(&self, decision: &Decision) -> Result<()> {
        let conn = self.conn.lock().await;
        write_decision(&conn, decision, true)?;
        Ok(())
    }

    async fn update_decision(&self, decision: &Decision) -> Result<()> {
        let conn = self.conn.lock().await;
        if write_decision(&conn, decision, false)? == 0 {
            return Err(crate::MeshError::DecisionNotFound(decision.id.clone()));
        }
        Ok(())
    }

    async fn get_decision(&self, id: &str) -> Result<Option<Decision>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM decisions WHERE id = ?1", DECISION_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], decision_from_row)
            .optional()?)
    }

    async fn list_decisions(&self, status: Option<DecisionStatus>) -> Result<Vec<Decision>> {
        let conn = self.conn.lock().await;
        let decisions = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM decisions WHERE status = ?1 ORDER BY created_at",
                    DECISION_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![status.as_str()], decision_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!("SELECT {} FROM decisions ORDER BY created_at", DECISION_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], decision_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(decisions)
    }

    async fn insert_escalation(&self, escalation: &Escalation) -> Result<()> {
        let conn = self.conn.lock().await;
        write_escalation(&conn, escalation, true)?;
        Ok(())
    }

    async fn update_escalation(&self, escalation: &Escalation) -> Result<()> {
        let conn = self.conn.lock().await;
        if write_escalation(&conn, escalation, false)? == 0 {
            return Err(crate::MeshError::EscalationNotFound(escalation.id.clone()));
        }
        Ok(())
    }

    async fn get_escalation(&self, id: &str) -> Result<Option<Escalation>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM escalations WHERE id = ?1", ESCALATION_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], escalation_from_row)
            .optional()?)
    }

    async fn list_escalations(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>> {
        let conn = self.conn.lock().await;
        let escalations = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM escalations WHERE status = ?1 ORDER BY created_at",
                    ESCALATION_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![status.as_str()], escalation_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!("SELECT {} FROM escalations ORDER BY created_at", ESCALATION_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], escalation_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(escalations)
    }

    async fn escalations_for(&self, decision_id: &str) -> Result<Vec<Escalation>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM escalations WHERE decision_id = ?1 ORDER BY created_at",
            ESCALATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![decision_id], escalation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn escalate(&self, decision: &Decision, escalation: &Escalation) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if write_decision(&tx, decision, false)? == 0 {
            return Err(crate::MeshError::DecisionNotFound(decision.id.clone()));
        }
        write_escalation(&tx, escalation, true)?;
        tx.commit()?;
        Ok(())
    }

    async fn settle(&self, decision: &Decision, escalations: &[Escalation]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if write_decision(&tx, decision, false)? == 0 {
            return Err(crate::MeshError::DecisionNotFound(decision.id.clone()));
        }
        for escalation in escalations {
            if write_escalation(&tx, escalation, false)? == 0 {
                return Err(crate::MeshError::EscalationNotFound(escalation.id.clone()));
            }
        }
        tx.commit()?;
        Ok(())
    }
}
