//! `attendance` table: the durable ledger backend.
//!
//! Uniqueness of (identity_id, course_id, day) is enforced by the schema.
//! A recognition upsert is one IMMEDIATE transaction: insert-or-ignore,
//! then a refresh guarded on `status = 'present'`.

use crate::Database;
use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{
    AttendanceLedger, AttendanceRecord, AttendanceStatus, LedgerError, LedgerKey, LedgerQuery,
    Sighting, UpsertOutcome, VerificationMethod,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

const RECORD_COLUMNS: &str =
    "identity_id, course_id, day, status, first_seen, last_seen, confidence, method";

pub struct SqliteLedger {
    db: Database,
}

impl SqliteLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Busy/locked/constraint errors are races another attempt can win.
fn ledger_err(e: rusqlite::Error) -> LedgerError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation) => {
            LedgerError::Conflict(e.to_string())
        }
        _ => LedgerError::Storage(e.to_string()),
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status: String = row.get(3)?;
    let method: String = row.get(7)?;
    Ok(AttendanceRecord {
        identity_id: row.get(0)?,
        course_id: row.get(1)?,
        day: row.get(2)?,
        status: status
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        first_seen: row.get(4)?,
        last_seen: row.get(5)?,
        confidence: row.get(6)?,
        method: method
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?,
    })
}

fn select_record(conn: &Connection, key: &LedgerKey) -> rusqlite::Result<Option<AttendanceRecord>> {
    conn.query_row(
        &format!(
            "SELECT {RECORD_COLUMNS} FROM attendance
             WHERE identity_id = ?1 AND course_id = ?2 AND day = ?3"
        ),
        params![key.identity_id, key.course_id, key.day],
        row_to_record,
    )
    .optional()
}

enum Applied {
    Created,
    Refreshed,
    Preserved,
}

impl AttendanceLedger for SqliteLedger {
    fn upsert(&self, sighting: &Sighting) -> Result<UpsertOutcome, LedgerError> {
        let key = &sighting.key;
        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(ledger_err)?;

        let inserted = tx
            .execute(
                "INSERT INTO attendance
                    (identity_id, course_id, day, status, first_seen, last_seen, confidence, method)
                 VALUES (?1, ?2, ?3, 'present', ?4, ?4, ?5, ?6)
                 ON CONFLICT (identity_id, course_id, day) DO NOTHING",
                params![
                    key.identity_id,
                    key.course_id,
                    key.day,
                    sighting.seen_at,
                    sighting.confidence,
                    VerificationMethod::FacialRecognition.as_str(),
                ],
            )
            .map_err(ledger_err)?;

        let applied = if inserted == 1 {
            Applied::Created
        } else {
            let refreshed = tx
                .execute(
                    "UPDATE attendance
                     SET last_seen = MAX(last_seen, ?4), confidence = ?5,
                         updated_at = CURRENT_TIMESTAMP
                     WHERE identity_id = ?1 AND course_id = ?2 AND day = ?3
                       AND status = 'present'",
                    params![
                        key.identity_id,
                        key.course_id,
                        key.day,
                        sighting.seen_at,
                        sighting.confidence,
                    ],
                )
                .map_err(ledger_err)?;
            if refreshed == 1 {
                Applied::Refreshed
            } else {
                Applied::Preserved
            }
        };

        let record = select_record(&tx, key)
            .map_err(ledger_err)?
            .ok_or_else(|| LedgerError::Storage("upserted row not found".into()))?;
        tx.commit().map_err(ledger_err)?;

        Ok(match applied {
            Applied::Created => UpsertOutcome::Created(record),
            Applied::Refreshed => UpsertOutcome::Refreshed(record),
            Applied::Preserved => UpsertOutcome::Preserved(record),
        })
    }

    fn override_status(
        &self,
        key: &LedgerKey,
        status: AttendanceStatus,
        at: NaiveDateTime,
    ) -> Result<AttendanceRecord, LedgerError> {
        let mut conn = self.db.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(ledger_err)?;
        tx.execute(
            "INSERT INTO attendance
                (identity_id, course_id, day, status, first_seen, last_seen, confidence, method)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL, ?6)
             ON CONFLICT (identity_id, course_id, day) DO UPDATE
             SET status = excluded.status, method = excluded.method,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                key.identity_id,
                key.course_id,
                key.day,
                status.as_str(),
                at,
                VerificationMethod::Manual.as_str(),
            ],
        )
        .map_err(ledger_err)?;
        let record = select_record(&tx, key)
            .map_err(ledger_err)?
            .ok_or_else(|| LedgerError::Storage("overridden row not found".into()))?;
        tx.commit().map_err(ledger_err)?;

        tracing::info!(
            identity = %key.identity_id,
            course = %key.course_id,
            day = %key.day,
            %status,
            "attendance status overridden"
        );
        Ok(record)
    }

    fn get(&self, key: &LedgerKey) -> Result<Option<AttendanceRecord>, LedgerError> {
        select_record(&self.db.lock(), key).map_err(ledger_err)
    }

    fn list(&self, query: &LedgerQuery) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM attendance
                 WHERE (?1 IS NULL OR identity_id = ?1)
                   AND (?2 IS NULL OR course_id = ?2)
                   AND (?3 IS NULL OR day = ?3)
                 ORDER BY day DESC, first_seen DESC, identity_id, course_id"
            ))
            .map_err(ledger_err)?;
        let day: Option<NaiveDate> = query.day;
        let rows = stmt
            .query_map(
                params![query.identity_id, query.course_id, day],
                row_to_record,
            )
            .map_err(ledger_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(ledger_err)
    }
}
