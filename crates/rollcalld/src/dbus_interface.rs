use crate::extractor::ProcessExtractor;
use chrono::{Local, NaiveDate};
use rollcall_core::{
    AttendanceLedger, AttendanceRecord, AttendanceStatus, GalleryError, LedgerKey, LedgerQuery,
    RecognitionError, RecognitionService, ScanRequest, ScanResponse,
};
use rollcall_store::SqliteLedger;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Scanner1";
pub const OBJECT_PATH: &str = "/org/rollcall/Scanner1";

pub type Pipeline = RecognitionService<SqliteLedger, ProcessExtractor>;

/// Enrolled identity as exposed over the bus. The vector itself never leaves the daemon.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FaceSummary {
    identity_id: String,
    dimension: usize,
    quality: f32,
    enrolled_at: String,
}

impl From<&rollcall_core::EnrolledFace> for FaceSummary {
    fn from(face: &rollcall_core::EnrolledFace) -> Self {
        Self {
            identity_id: face.identity_id.clone(),
            dimension: face.embedding.dimension(),
            quality: face.quality,
            enrolled_at: face.enrolled_at.to_rfc3339(),
        }
    }
}

/// D-Bus interface for the Rollcall scanning daemon.
///
/// Bus name: org.rollcall.Scanner1
/// Object path: /org/rollcall/Scanner1
pub struct ScannerService {
    pipeline: Arc<Pipeline>,
    db_path: Option<PathBuf>,
}

impl ScannerService {
    pub fn new(pipeline: Arc<Pipeline>, db_path: Option<PathBuf>) -> Self {
        Self { pipeline, db_path }
    }

    async fn handle_scan(&self, image: Vec<u8>, course_id: &str, threshold: f64) -> ScanResponse {
        let request = ScanRequest {
            image,
            course_id: non_empty(course_id),
            threshold: threshold_override(threshold),
        };
        self.pipeline.scan(request).await
    }

    async fn handle_enroll(&self, identity_id: &str, image: &[u8]) -> zbus::fdo::Result<FaceSummary> {
        let face = self
            .pipeline
            .enroll_image(identity_id, image)
            .await
            .map_err(recognition_fdo_err)?;
        Ok(FaceSummary::from(&face))
    }

    async fn handle_revoke(&self, identity_id: &str) -> zbus::fdo::Result<bool> {
        let gallery = Arc::clone(self.pipeline.gallery());
        let id = identity_id.to_string();
        let result = tokio::task::spawn_blocking(move || gallery.revoke(&id))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("revoke task: {e}")))?;
        match result {
            Ok(_) => Ok(true),
            Err(GalleryError::NotFound(_)) => Ok(false),
            Err(e) => Err(zbus::fdo::Error::Failed(e.to_string())),
        }
    }

    fn handle_list_enrolled(&self) -> Vec<FaceSummary> {
        self.pipeline
            .gallery()
            .snapshot()
            .iter()
            .map(FaceSummary::from)
            .collect()
    }

    async fn handle_attendance(
        &self,
        identity_id: &str,
        course_id: &str,
        day: &str,
    ) -> zbus::fdo::Result<Vec<AttendanceRecord>> {
        let query = LedgerQuery {
            identity_id: non_empty(identity_id),
            course_id: non_empty(course_id),
            day: parse_day(day)?,
        };
        let ledger = Arc::clone(self.pipeline.ledger());
        tokio::task::spawn_blocking(move || ledger.list(&query))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("ledger task: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn handle_mark_status(
        &self,
        identity_id: &str,
        course_id: &str,
        day: &str,
        status: &str,
    ) -> zbus::fdo::Result<AttendanceRecord> {
        let (Some(identity_id), Some(course_id)) = (non_empty(identity_id), non_empty(course_id))
        else {
            return Err(zbus::fdo::Error::InvalidArgs(
                "identity and course are required".into(),
            ));
        };
        let status: AttendanceStatus = status
            .parse()
            .map_err(|e: rollcall_core::LedgerError| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let now = Local::now().naive_local();
        let day = parse_day(day)?.unwrap_or_else(|| now.date());

        let key = LedgerKey::new(identity_id, course_id, day);
        let ledger = Arc::clone(self.pipeline.ledger());
        tokio::task::spawn_blocking(move || ledger.override_status(&key, status, now))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("ledger task: {e}")))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    fn handle_status(&self) -> serde_json::Value {
        let gallery = self.pipeline.gallery();
        let spool = self.pipeline.spool();
        let policy = self.pipeline.policy();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "enrolled": gallery.len(),
            "embeddingDim": gallery.dimension(),
            "threshold": policy.default_threshold,
            "extractionTimeoutSecs": policy.extraction_timeout.as_secs(),
            "database": self.db_path.as_ref().map(|p| p.display().to_string()),
            "spool": {
                "dir": spool.dir().display().to_string(),
                "outstanding": spool.outstanding(),
                "released": spool.released(),
            },
        })
    }
}

#[interface(name = "org.rollcall.Scanner1")]
impl ScannerService {
    /// Recognize a face image and, when a course is given, mark attendance.
    ///
    /// An empty `course_id` means identify-only. A non-finite `threshold`
    /// (NaN) means "use the configured default".
    async fn scan(&self, image: Vec<u8>, course_id: &str, threshold: f64) -> zbus::fdo::Result<String> {
        tracing::info!(course_id, bytes = image.len(), "scan requested");
        let response = self.handle_scan(image, course_id, threshold).await;
        to_json(&response)
    }

    /// Enroll a new identity from a face image.
    async fn enroll(&self, identity_id: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "enroll requested");
        to_json(&self.handle_enroll(identity_id, &image).await?)
    }

    /// Remove an enrolled identity. Returns false if it was not enrolled.
    async fn revoke(&self, identity_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(identity_id, "revoke requested");
        self.handle_revoke(identity_id).await
    }

    /// List enrolled identities (metadata only).
    async fn list_enrolled(&self) -> zbus::fdo::Result<String> {
        to_json(&self.handle_list_enrolled())
    }

    /// Query attendance records. Empty arguments match everything; `day` is
    /// `YYYY-MM-DD` or `today`.
    async fn attendance(
        &self,
        identity_id: &str,
        course_id: &str,
        day: &str,
    ) -> zbus::fdo::Result<String> {
        to_json(&self.handle_attendance(identity_id, course_id, day).await?)
    }

    /// Administrative status override (present, late, absent, excused).
    async fn mark_status(
        &self,
        identity_id: &str,
        course_id: &str,
        day: &str,
        status: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, course_id, day, status, "status override requested");
        to_json(
            &self
                .handle_mark_status(identity_id, course_id, day, status)
                .await?,
        )
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.handle_status().to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn threshold_override(threshold: f64) -> Option<f32> {
    threshold.is_finite().then_some(threshold as f32)
}

fn parse_day(day: &str) -> zbus::fdo::Result<Option<NaiveDate>> {
    match day.trim() {
        "" => Ok(None),
        "today" => Ok(Some(Local::now().date_naive())),
        other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid day {other:?}: {e}"))),
    }
}

fn recognition_fdo_err(err: RecognitionError) -> zbus::fdo::Error {
    if err.is_caller_error() {
        zbus::fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::warn!(error = %err, "request failed");
        zbus::fdo::Error::Failed(err.to_string())
    }
}
