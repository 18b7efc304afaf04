//! Daily attendance ledger: one record per (identity, course, day).
//!
//! Recognition writes go through [`AttendanceLedger::upsert`], which only ever
//! creates a `Present` row or refreshes an existing `Present` row. Rows an
//! administrator moved to Late/Absent/Excused are left untouched.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// Lost a race with another writer (busy, locked or constraint). Safe to retry.
    #[error("storage conflict: {0}")]
    Conflict(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("unknown attendance status: {0}")]
    InvalidStatus(String),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Excused => "excused",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            "excused" => Ok(AttendanceStatus::Excused),
            other => Err(LedgerError::InvalidStatus(other.to_string())),
        }
    }
}

/// How a record's current status was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    FacialRecognition,
    Manual,
}

impl VerificationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationMethod::FacialRecognition => "facial_recognition",
            VerificationMethod::Manual => "manual",
        }
    }
}

impl FromStr for VerificationMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "facial_recognition" => Ok(VerificationMethod::FacialRecognition),
            "manual" => Ok(VerificationMethod::Manual),
            other => Err(LedgerError::Storage(format!(
                "unknown verification method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub identity_id: String,
    pub course_id: String,
    pub day: NaiveDate,
}

impl LedgerKey {
    pub fn new(identity_id: impl Into<String>, course_id: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            identity_id: identity_id.into(),
            course_id: course_id.into(),
            day,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub course_id: String,
    pub day: NaiveDate,
    pub status: AttendanceStatus,
    pub first_seen: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    /// Similarity of the latest recognition hit; `None` for rows created manually.
    pub confidence: Option<f32>,
    pub method: VerificationMethod,
}

impl AttendanceRecord {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.identity_id.clone(), self.course_id.clone(), self.day)
    }
}

/// A recognition hit to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub key: LedgerKey,
    pub seen_at: NaiveDateTime,
    pub confidence: f32,
}

/// What an upsert did to the row for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// First sighting today; a new `Present` row was inserted.
    Created(AttendanceRecord),
    /// Existing `Present` row; last-seen time and confidence were refreshed.
    Refreshed(AttendanceRecord),
    /// Row carries an administrative status and was left as is.
    Preserved(AttendanceRecord),
}

impl UpsertOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            UpsertOutcome::Created(r) | UpsertOutcome::Refreshed(r) | UpsertOutcome::Preserved(r) => r,
        }
    }

    pub fn already_marked_today(&self) -> bool {
        !matches!(self, UpsertOutcome::Created(_))
    }
}

/// Filter for [`AttendanceLedger::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerQuery {
    pub identity_id: Option<String>,
    pub course_id: Option<String>,
    pub day: Option<NaiveDate>,
}

impl LedgerQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity_id: impl Into<String>) -> Self {
        self.identity_id = Some(identity_id.into());
        self
    }

    pub fn course(mut self, course_id: impl Into<String>) -> Self {
        self.course_id = Some(course_id.into());
        self
    }

    pub fn day(mut self, day: NaiveDate) -> Self {
        self.day = Some(day);
        self
    }

    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.identity_id.as_deref().map_or(true, |id| id == record.identity_id)
            && self.course_id.as_deref().map_or(true, |c| c == record.course_id)
            && self.day.map_or(true, |d| d == record.day)
    }
}

/// Storage contract shared by every ledger backend.
///
/// `upsert` must be atomic per key: concurrent first sightings of the same
/// key yield exactly one `Created`, everyone else sees the row.
pub trait AttendanceLedger: Send + Sync {
    fn upsert(&self, sighting: &Sighting) -> Result<UpsertOutcome, LedgerError>;

    /// Administrative write: set any status, creating the row if needed.
    fn override_status(
        &self,
        key: &LedgerKey,
        status: AttendanceStatus,
        at: NaiveDateTime,
    ) -> Result<AttendanceRecord, LedgerError>;

    fn get(&self, key: &LedgerKey) -> Result<Option<AttendanceRecord>, LedgerError>;

    /// Matching records, newest day first, then latest first sighting first.
    fn list(&self, query: &LedgerQuery) -> Result<Vec<AttendanceRecord>, LedgerError>;
}

pub(crate) fn sort_records(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| {
        b.day
            .cmp(&a.day)
            .then(b.first_seen.cmp(&a.first_seen))
            .then(a.identity_id.cmp(&b.identity_id))
            .then(a.course_id.cmp(&b.course_id))
    });
}

type Slot = Arc<Mutex<Option<AttendanceRecord>>>;

/// In-process ledger backend.
///
/// Each key owns its own slot mutex; the map lock is only held long enough
/// to find or create the slot, so writes to different keys do not contend.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    slots: Mutex<HashMap<LedgerKey, Slot>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &LedgerKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn existing_slot(&self, key: &LedgerKey) -> Option<Slot> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).cloned()
    }
}

impl AttendanceLedger for MemoryLedger {
    fn upsert(&self, sighting: &Sighting) -> Result<UpsertOutcome, LedgerError> {
        let slot = self.slot(&sighting.key);
        let mut row = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let outcome = match row.as_mut() {
            None => {
                let record = AttendanceRecord {
                    identity_id: sighting.key.identity_id.clone(),
                    course_id: sighting.key.course_id.clone(),
                    day: sighting.key.day,
                    status: AttendanceStatus::Present,
                    first_seen: sighting.seen_at,
                    last_seen: sighting.seen_at,
                    confidence: Some(sighting.confidence),
                    method: VerificationMethod::FacialRecognition,
                };
                *row = Some(record.clone());
                UpsertOutcome::Created(record)
            }
            Some(existing) if existing.status == AttendanceStatus::Present => {
                existing.last_seen = existing.last_seen.max(sighting.seen_at);
                existing.confidence = Some(sighting.confidence);
                UpsertOutcome::Refreshed(existing.clone())
            }
            Some(existing) => UpsertOutcome::Preserved(existing.clone()),
        };
        Ok(outcome)
    }

    fn override_status(
        &self,
        key: &LedgerKey,
        status: AttendanceStatus,
        at: NaiveDateTime,
    ) -> Result<AttendanceRecord, LedgerError> {
        let slot = self.slot(key);
        let mut row = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let record = match row.as_mut() {
            Some(existing) => {
                existing.status = status;
                existing.method = VerificationMethod::Manual;
                existing.clone()
            }
            None => {
                let record = AttendanceRecord {
                    identity_id: key.identity_id.clone(),
                    course_id: key.course_id.clone(),
                    day: key.day,
                    status,
                    first_seen: at,
                    last_seen: at,
                    confidence: None,
                    method: VerificationMethod::Manual,
                };
                *row = Some(record.clone());
                record
            }
        };
        Ok(record)
    }

    fn get(&self, key: &LedgerKey) -> Result<Option<AttendanceRecord>, LedgerError> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(None);
        };
        let record = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(record)
    }

    fn list(&self, query: &LedgerQuery) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let slots: Vec<Slot> = {
            let map = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            map.values().cloned().collect()
        };

        let mut records: Vec<AttendanceRecord> = slots
            .iter()
            .filter_map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .filter(|r| query.matches(r))
            .collect();
        sort_records(&mut records);
        Ok(records)
    }
}
