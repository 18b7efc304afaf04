//! Recognition pipeline: probe embedding → gallery match → attendance mark.
//!
//! The service owns no global state; callers build it from an explicit
//! gallery, ledger, extractor and spool. Every probe artifact handed to it is
//! dropped (and therefore deleted) before the call returns or unwinds.

use crate::artifact::{ArtifactSpool, ProbeArtifact};
use crate::extract::{ExtractError, Extraction, Extractor};
use crate::gallery::{Gallery, GalleryError};
use crate::ledger::{AttendanceLedger, AttendanceStatus, LedgerError, LedgerKey, Sighting, UpsertOutcome};
use crate::types::{CosineMatcher, EnrolledFace, Embedding, MatchOutcome, Matcher};
use chrono::{Local, NaiveDateTime};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default cosine threshold for a positive match.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("threshold {0} is outside [-1, 1]")]
    InvalidThreshold(f32),
    #[error("embedding extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),
    #[error("embedding extraction failed: {0}")]
    ExtractionFailure(#[from] ExtractError),
    #[error("attendance write still conflicting after {attempts} attempts")]
    StorageConflict { attempts: usize },
    #[error("attendance ledger: {0}")]
    Ledger(LedgerError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("failed to stage probe image: {0}")]
    Spool(std::io::Error),
    #[error("internal fault: {0}")]
    Internal(String),
}

impl RecognitionError {
    /// Worth retrying the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecognitionError::ExtractionTimeout(_)
                | RecognitionError::ExtractionFailure(_)
                | RecognitionError::StorageConflict { .. }
        )
    }

    /// Caused by the request itself; resubmitting unchanged will fail again.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RecognitionError::InvalidImage(_)
                | RecognitionError::InvalidEmbedding(_)
                | RecognitionError::InvalidThreshold(_)
                | RecognitionError::Gallery(
                    GalleryError::DimensionMismatch { .. }
                        | GalleryError::DuplicateIdentity(_)
                        | GalleryError::NotFound(_)
                        | GalleryError::InvalidVector(_)
                )
        )
    }
}

/// Tunables applied by [`RecognitionService`].
#[derive(Debug, Clone)]
pub struct RecognitionPolicy {
    pub default_threshold: f32,
    pub extraction_timeout: Duration,
    /// Total ledger write attempts when a write conflicts (at least 1).
    pub upsert_attempts: usize,
    pub retry_backoff: Duration,
}

impl Default for RecognitionPolicy {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_THRESHOLD,
            extraction_timeout: Duration::from_secs(10),
            upsert_attempts: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }
}

/// One probe, alive for a single recognition call.
#[derive(Debug)]
pub struct ProbeRequest {
    pub embedding: Option<Vec<f32>>,
    pub course_id: Option<String>,
    pub threshold: Option<f32>,
    /// Local wall-clock capture time; its date is the attendance day.
    pub captured_at: NaiveDateTime,
    /// Captured image backing this probe, released when the call ends.
    pub artifact: Option<ProbeArtifact>,
}

impl ProbeRequest {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding: Some(embedding),
            course_id: None,
            threshold: None,
            captured_at: Local::now().naive_local(),
            artifact: None,
        }
    }

    pub fn course(mut self, course_id: impl Into<String>) -> Self {
        self.course_id = Some(course_id.into());
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn captured_at(mut self, at: NaiveDateTime) -> Self {
        self.captured_at = at;
        self
    }

    pub fn artifact(mut self, artifact: ProbeArtifact) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// Successful outcome of a recognition call. Negative results are not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Recognition {
    NoEnrollments,
    NoMatch,
    /// Matched, but no course was given so nothing was written.
    Identified { identity_id: String, confidence: f32 },
    Marked {
        identity_id: String,
        confidence: f32,
        already_marked_today: bool,
        status: AttendanceStatus,
    },
}

/// Transport-agnostic scan input.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub image: Vec<u8>,
    pub course_id: Option<String>,
    pub threshold: Option<f32>,
}

/// Transport-agnostic scan output. Never an error; check `success`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub success: bool,
    pub recognized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_marked_today: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AttendanceStatus>,
    pub retryable: bool,
    pub message: String,
}

impl ScanResponse {
    fn negative(message: impl Into<String>) -> Self {
        Self {
            success: true,
            recognized: false,
            identity_id: None,
            confidence: None,
            already_marked_today: None,
            status: None,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn from_result(result: Result<Recognition, RecognitionError>) -> Self {
        match result {
            Ok(Recognition::NoEnrollments) => Self::negative("No registered faces in the system."),
            Ok(Recognition::NoMatch) => Self::negative("Face not recognized."),
            Ok(Recognition::Identified {
                identity_id,
                confidence,
            }) => Self {
                success: true,
                recognized: true,
                identity_id: Some(identity_id),
                confidence: Some(confidence),
                already_marked_today: None,
                status: None,
                retryable: false,
                message: "Identity recognized. Select a course to mark attendance.".into(),
            },
            Ok(Recognition::Marked {
                identity_id,
                confidence,
                already_marked_today,
                status,
            }) => {
                let message = match (already_marked_today, status) {
                    (false, _) => "Attendance marked successfully.".to_string(),
                    (true, AttendanceStatus::Present) => {
                        "Attendance already marked for today.".to_string()
                    }
                    (true, other) => format!("Attendance already recorded as {other} for today."),
                };
                Self {
                    success: true,
                    recognized: true,
                    identity_id: Some(identity_id),
                    confidence: Some(confidence),
                    already_marked_today: Some(already_marked_today),
                    status: Some(status),
                    retryable: false,
                    message,
                }
            }
            Err(err) => {
                let message = if err.is_transient() || err.is_caller_error() {
                    err.to_string()
                } else {
                    tracing::error!(error = %err, "recognition failed");
                    "Server error during recognition.".to_string()
                };
                Self {
                    success: false,
                    recognized: false,
                    identity_id: None,
                    confidence: None,
                    already_marked_today: None,
                    status: None,
                    retryable: err.is_transient(),
                    message,
                }
            }
        }
    }
}

/// Composes gallery, matcher, ledger and extractor for each request.
pub struct RecognitionService<L, X, M = CosineMatcher> {
    gallery: Arc<Gallery>,
    ledger: Arc<L>,
    extractor: X,
    matcher: M,
    spool: ArtifactSpool,
    policy: RecognitionPolicy,
}

impl<L, X> RecognitionService<L, X, CosineMatcher>
where
    L: AttendanceLedger + 'static,
    X: Extractor,
{
    pub fn new(
        gallery: Arc<Gallery>,
        ledger: Arc<L>,
        extractor: X,
        spool: ArtifactSpool,
        policy: RecognitionPolicy,
    ) -> Self {
        Self {
            gallery,
            ledger,
            extractor,
            matcher: CosineMatcher,
            spool,
            policy,
        }
    }
}

impl<L, X, M> RecognitionService<L, X, M>
where
    L: AttendanceLedger + 'static,
    X: Extractor,
    M: Matcher + Send + Sync,
{
    /// Swap the matching strategy.
    pub fn with_matcher<N: Matcher + Send + Sync>(self, matcher: N) -> RecognitionService<L, X, N> {
        RecognitionService {
            gallery: self.gallery,
            ledger: self.ledger,
            extractor: self.extractor,
            matcher,
            spool: self.spool,
            policy: self.policy,
        }
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn spool(&self) -> &ArtifactSpool {
        &self.spool
    }

    pub fn policy(&self) -> &RecognitionPolicy {
        &self.policy
    }

    /// Match one probe embedding and, when a course is given, mark attendance.
    pub async fn recognize(&self, request: ProbeRequest) -> Result<Recognition, RecognitionError> {
        // `_artifact` lives until this function returns or unwinds.
        let ProbeRequest {
            embedding,
            course_id,
            threshold,
            captured_at,
            artifact: _artifact,
        } = request;

        let probe = self.validate_embedding(embedding)?;
        let threshold = self.resolve_threshold(threshold)?;

        let snapshot = self.gallery.snapshot();
        if snapshot.is_empty() {
            tracing::info!("recognition skipped: no enrolled faces");
            return Ok(Recognition::NoEnrollments);
        }

        let (identity_id, confidence) =
            match self.matcher.find_best_match(&probe, &snapshot, threshold) {
                MatchOutcome::NoEnrollments => return Ok(Recognition::NoEnrollments),
                MatchOutcome::NoMatch { best_similarity } => {
                    tracing::info!(
                        best_similarity,
                        threshold,
                        candidates = snapshot.len(),
                        "face not recognized"
                    );
                    return Ok(Recognition::NoMatch);
                }
                MatchOutcome::Matched {
                    identity_id,
                    similarity,
                } => (identity_id, similarity),
            };

        let Some(course_id) = course_id.filter(|c| !c.trim().is_empty()) else {
            tracing::info!(identity = %identity_id, confidence, "identified without course; not marking");
            return Ok(Recognition::Identified {
                identity_id,
                confidence,
            });
        };

        let sighting = Sighting {
            key: LedgerKey::new(identity_id.clone(), course_id, captured_at.date()),
            seen_at: captured_at,
            confidence,
        };
        let outcome = self.mark(sighting).await?;
        let record = outcome.record();

        tracing::info!(
            identity = %identity_id,
            course = %record.course_id,
            day = %record.day,
            confidence,
            already_marked = outcome.already_marked_today(),
            status = %record.status,
            "attendance upserted"
        );

        Ok(Recognition::Marked {
            identity_id,
            confidence,
            already_marked_today: outcome.already_marked_today(),
            status: record.status,
        })
    }

    /// Full scan: stage the image, extract, recognize. Always releases the image.
    pub async fn scan(&self, request: ScanRequest) -> ScanResponse {
        let captured_at = Local::now().naive_local();
        ScanResponse::from_result(self.run_scan(request, captured_at).await)
    }

    async fn run_scan(
        &self,
        request: ScanRequest,
        captured_at: NaiveDateTime,
    ) -> Result<Recognition, RecognitionError> {
        validate_image(&request.image)?;
        let threshold = self.resolve_threshold(request.threshold)?;
        if self.gallery.is_empty() {
            return Ok(Recognition::NoEnrollments);
        }

        let (artifact, extraction) = self.extract_probe(&request.image).await?;
        self.recognize(ProbeRequest {
            embedding: Some(extraction.embedding),
            course_id: request.course_id,
            threshold: Some(threshold),
            captured_at,
            artifact: Some(artifact),
        })
        .await
    }

    /// Register a new identity from a face image.
    pub async fn enroll_image(
        &self,
        identity_id: &str,
        image: &[u8],
    ) -> Result<EnrolledFace, RecognitionError> {
        validate_image(image)?;
        let (artifact, extraction) = self.extract_probe(image).await?;
        artifact.release();

        let gallery = Arc::clone(&self.gallery);
        let identity_id = identity_id.to_string();
        let quality = extraction.quality.unwrap_or(1.0);
        let face = tokio::task::spawn_blocking(move || {
            gallery.enroll(&identity_id, extraction.embedding, quality)
        })
        .await
        .map_err(|e| RecognitionError::Internal(format!("enroll task: {e}")))??;
        Ok(face)
    }

    /// Stage `image` and run the extractor under the policy timeout.
    async fn extract_probe(
        &self,
        image: &[u8],
    ) -> Result<(ProbeArtifact, Extraction), RecognitionError> {
        let artifact = self.spool.write(image).await.map_err(RecognitionError::Spool)?;
        let timeout = self.policy.extraction_timeout;

        match tokio::time::timeout(timeout, self.extractor.extract(artifact.path())).await {
            Ok(Ok(extraction)) => Ok((artifact, extraction)),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "embedding extraction failed");
                Err(RecognitionError::ExtractionFailure(e))
            }
            Err(_) => {
                tracing::warn!(?timeout, "embedding extraction timed out");
                Err(RecognitionError::ExtractionTimeout(timeout))
            }
        }
    }

    /// Upsert with bounded retries on conflict.
    async fn mark(&self, sighting: Sighting) -> Result<UpsertOutcome, RecognitionError> {
        let attempts = self.policy.upsert_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ledger = Arc::clone(&self.ledger);
            let pending = sighting.clone();
            let result = tokio::task::spawn_blocking(move || ledger.upsert(&pending))
                .await
                .map_err(|e| RecognitionError::Internal(format!("ledger task: {e}")))?;

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_conflict() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "attendance upsert conflicted; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_conflict() => {
                    tracing::error!(attempts, error = %e, "attendance upsert retries exhausted");
                    return Err(RecognitionError::StorageConflict { attempts });
                }
                Err(e) => return Err(RecognitionError::Ledger(e)),
            }
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.policy.retry_backoff;
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        base * attempt as u32 + Duration::from_millis(jitter_ms)
    }

    /// The override if it is a finite value in [-1, 1], else the policy default.
    fn resolve_threshold(&self, threshold: Option<f32>) -> Result<f32, RecognitionError> {
        match threshold {
            Some(t) if !t.is_finite() || !(-1.0..=1.0).contains(&t) => {
                Err(RecognitionError::InvalidThreshold(t))
            }
            Some(t) => Ok(t),
            None => Ok(self.policy.default_threshold),
        }
    }

    fn validate_embedding(&self, embedding: Option<Vec<f32>>) -> Result<Embedding, RecognitionError> {
        let values = embedding
            .ok_or_else(|| RecognitionError::InvalidEmbedding("no embedding supplied".into()))?;
        if values.is_empty() {
            return Err(RecognitionError::InvalidEmbedding("embedding is empty".into()));
        }
        let expected = self.gallery.dimension();
        if values.len() != expected {
            return Err(RecognitionError::InvalidEmbedding(format!(
                "expected {expected} dimensions, got {}",
                values.len()
            )));
        }
        let probe = Embedding::new(values);
        if !probe.is_finite() {
            return Err(RecognitionError::InvalidEmbedding(
                "embedding contains non-finite values".into(),
            ));
        }
        Ok(probe)
    }
}

fn validate_image(bytes: &[u8]) -> Result<(), RecognitionError> {
    if bytes.is_empty() {
        return Err(RecognitionError::InvalidImage("no image received".into()));
    }
    image::guess_format(bytes)
        .map(|_| ())
        .map_err(|_| RecognitionError::InvalidImage("unrecognized image format".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerQuery, MemoryLedger};
    use chrono::NaiveDate;
    use std::future::Future;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const DIM: usize = 4;

    #[derive(Clone)]
    enum Behavior {
        Returns(Vec<f32>),
        Fails,
        Hangs,
    }

    struct FakeExtractor {
        behavior: Behavior,
        saw_file: Arc<Mutex<Vec<bool>>>,
    }

    impl FakeExtractor {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                saw_file: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Extractor for FakeExtractor {
        fn extract(
            &self,
            image: &Path,
        ) -> impl Future<Output = Result<Extraction, ExtractError>> + Send {
            self.saw_file.lock().unwrap().push(image.exists());
            let behavior = self.behavior.clone();
            async move {
                match behavior {
                    Behavior::Returns(embedding) => Ok(Extraction {
                        embedding,
                        quality: Some(0.75),
                    }),
                    Behavior::Fails => Err(ExtractError::Failed("no face found".into())),
                    Behavior::Hangs => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Err(ExtractError::Failed("unreachable".into()))
                    }
                }
            }
        }
    }

    struct PanickingMatcher;

    impl Matcher for PanickingMatcher {
        fn find_best_match(&self, _: &Embedding, _: &[EnrolledFace], _: f32) -> MatchOutcome {
            panic!("matcher fault");
        }
    }

    /// Conflicts `failures` times, then behaves like a memory ledger.
    struct FlakyLedger {
        inner: MemoryLedger,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyLedger {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryLedger::new(),
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AttendanceLedger for FlakyLedger {
        fn upsert(&self, sighting: &Sighting) -> Result<UpsertOutcome, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(LedgerError::Conflict("database is locked".into()));
            }
            self.inner.upsert(sighting)
        }

        fn override_status(
            &self,
            key: &LedgerKey,
            status: AttendanceStatus,
            at: NaiveDateTime,
        ) -> Result<crate::ledger::AttendanceRecord, LedgerError> {
            self.inner.override_status(key, status, at)
        }

        fn get(&self, key: &LedgerKey) -> Result<Option<crate::ledger::AttendanceRecord>, LedgerError> {
            self.inner.get(key)
        }

        fn list(&self, query: &LedgerQuery) -> Result<Vec<crate::ledger::AttendanceRecord>, LedgerError> {
            self.inner.list(query)
        }
    }

    fn s1() -> Vec<f32> {
        vec![1.0, 0.0, 0.0, 0.0]
    }

    fn s2() -> Vec<f32> {
        vec![0.0, 1.0, 0.0, 0.0]
    }

    fn morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 9)
            .unwrap()
            .and_hms_opt(8, 15, 0)
            .unwrap()
    }

    fn fast_policy() -> RecognitionPolicy {
        RecognitionPolicy {
            extraction_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(1),
            ..RecognitionPolicy::default()
        }
    }

    fn service_with<L: AttendanceLedger + 'static>(
        ledger: Arc<L>,
        behavior: Behavior,
    ) -> (tempfile::TempDir, RecognitionService<L, FakeExtractor>) {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Arc::new(Gallery::in_memory(DIM));
        gallery.enroll("S1", s1(), 0.9).unwrap();
        gallery.enroll("S2", s2(), 0.9).unwrap();
        let spool = ArtifactSpool::new(dir.path().join("spool")).unwrap();
        let svc = RecognitionService::new(
            gallery,
            ledger,
            FakeExtractor::new(behavior),
            spool,
            fast_policy(),
        );
        (dir, svc)
    }

    fn service(behavior: Behavior) -> (tempfile::TempDir, RecognitionService<MemoryLedger, FakeExtractor>) {
        service_with(Arc::new(MemoryLedger::new()), behavior)
    }

    fn held_artifact(svc: &RecognitionService<MemoryLedger, FakeExtractor>) -> (ProbeArtifact, std::path::PathBuf) {
        let path = svc.spool().dir().join("held.img");
        std::fs::write(&path, PNG).unwrap();
        (svc.spool().adopt(&path), path)
    }

    #[tokio::test]
    async fn test_match_with_course_marks_present() {
        let (_dir, svc) = service(Behavior::Fails);
        let result = svc
            .recognize(ProbeRequest::new(s1()).course("C1").captured_at(morning()))
            .await
            .unwrap();

        assert_eq!(
            result,
            Recognition::Marked {
                identity_id: "S1".into(),
                confidence: 1.0,
                already_marked_today: false,
                status: AttendanceStatus::Present,
            }
        );
        let key = LedgerKey::new("S1", "C1", morning().date());
        let record = svc.ledger().get(&key).unwrap().unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.first_seen, morning());
    }

    #[tokio::test]
    async fn test_second_scan_reports_already_marked() {
        let (_dir, svc) = service(Behavior::Fails);
        let first = ProbeRequest::new(s1()).course("C1").captured_at(morning());
        svc.recognize(first).await.unwrap();

        let later = morning() + chrono::Duration::minutes(20);
        let second = svc
            .recognize(ProbeRequest::new(s1()).course("C1").captured_at(later))
            .await
            .unwrap();
        assert!(matches!(
            second,
            Recognition::Marked {
                already_marked_today: true,
                ..
            }
        ));
        let rows = svc.ledger().list(&LedgerQuery::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_seen, later);
    }

    #[tokio::test]
    async fn test_identify_only_without_course() {
        let (_dir, svc) = service(Behavior::Fails);
        for course in [None, Some("   ")] {
            let mut request = ProbeRequest::new(s2()).captured_at(morning());
            request.course_id = course.map(String::from);
            let result = svc.recognize(request).await.unwrap();
            assert_eq!(
                result,
                Recognition::Identified {
                    identity_id: "S2".into(),
                    confidence: 1.0
                }
            );
        }
        assert!(svc.ledger().list(&LedgerQuery::all()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_match_below_threshold() {
        let (_dir, svc) = service(Behavior::Fails);
        // cos = 0.5 against both S1 and S2 after normalisation is below 0.6
        let probe = vec![0.5, 0.5, 0.5, 0.5];
        let result = svc
            .recognize(ProbeRequest::new(probe).course("C1"))
            .await
            .unwrap();
        assert_eq!(result, Recognition::NoMatch);
        assert!(svc.ledger().list(&LedgerQuery::all()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_override() {
        let (_dir, svc) = service(Behavior::Fails);
        let probe = vec![0.9, 0.1, 0.0, 0.0];

        let strict = svc
            .recognize(ProbeRequest::new(probe.clone()).threshold(0.999))
            .await
            .unwrap();
        assert_eq!(strict, Recognition::NoMatch);

        let lenient = svc
            .recognize(ProbeRequest::new(probe).threshold(0.9))
            .await
            .unwrap();
        assert!(matches!(lenient, Recognition::Identified { identity_id, .. } if identity_id == "S1"));
    }

    #[tokio::test]
    async fn test_rejects_bad_threshold() {
        let (_dir, svc) = service(Behavior::Fails);
        for t in [1.5, -3.0, f32::NAN] {
            let err = svc
                .recognize(ProbeRequest::new(s1()).threshold(t))
                .await
                .unwrap_err();
            assert!(matches!(err, RecognitionError::InvalidThreshold(_)));
        }
    }

    #[tokio::test]
    async fn test_invalid_embeddings_rejected_and_artifact_released() {
        let (_dir, svc) = service(Behavior::Fails);
        let cases: Vec<Option<Vec<f32>>> = vec![
            None,
            Some(vec![]),
            Some(vec![1.0, 0.0]),
            Some(vec![1.0, f32::INFINITY, 0.0, 0.0]),
        ];

        for (i, embedding) in cases.into_iter().enumerate() {
            let (artifact, path) = held_artifact(&svc);
            let mut request = ProbeRequest::new(Vec::new()).artifact(artifact);
            request.embedding = embedding;

            let err = svc.recognize(request).await.unwrap_err();
            assert!(matches!(err, RecognitionError::InvalidEmbedding(_)), "{err}");
            assert!(!err.is_transient());
            assert!(!path.exists());
            assert_eq!(svc.spool().released(), i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_no_enrollments_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let svc = RecognitionService::new(
            Arc::new(Gallery::in_memory(DIM)),
            Arc::new(MemoryLedger::new()),
            FakeExtractor::new(Behavior::Returns(s1())),
            ArtifactSpool::new(dir.path()).unwrap(),
            fast_policy(),
        );

        let result = svc
            .recognize(ProbeRequest::new(s1()).course("C1"))
            .await
            .unwrap();
        assert_eq!(result, Recognition::NoEnrollments);

        let response = svc
            .scan(ScanRequest {
                image: PNG.to_vec(),
                course_id: Some("C1".into()),
                threshold: None,
            })
            .await;
        assert!(response.success);
        assert!(!response.recognized);
        assert_eq!(svc.spool().created(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scans_same_key_single_row() {
        const SCANS: usize = 24;
        let (_dir, svc) = service(Behavior::Fails);
        let svc = Arc::new(svc);

        let handles: Vec<_> = (0..SCANS)
            .map(|i| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    let at = morning() + chrono::Duration::seconds(i as i64);
                    svc.recognize(ProbeRequest::new(s1()).course("C1").captured_at(at))
                        .await
                })
            })
            .collect();

        let mut fresh = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Recognition::Marked {
                    already_marked_today,
                    status,
                    ..
                } => {
                    assert_eq!(status, AttendanceStatus::Present);
                    if !already_marked_today {
                        fresh += 1;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(fresh, 1);
        let rows = svc.ledger().list(&LedgerQuery::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AttendanceStatus::Present);
    }

    #[tokio::test]
    async fn test_administrative_status_not_overwritten() {
        let (_dir, svc) = service(Behavior::Fails);
        let key = LedgerKey::new("S1", "C1", morning().date());
        svc.ledger()
            .override_status(&key, AttendanceStatus::Absent, morning())
            .unwrap();

        let result = svc
            .recognize(ProbeRequest::new(s1()).course("C1").captured_at(morning()))
            .await
            .unwrap();
        assert_eq!(
            result,
            Recognition::Marked {
                identity_id: "S1".into(),
                confidence: 1.0,
                already_marked_today: true,
                status: AttendanceStatus::Absent,
            }
        );
        assert_eq!(
            svc.ledger().get(&key).unwrap().unwrap().status,
            AttendanceStatus::Absent
        );
    }

    #[tokio::test]
    async fn test_conflicts_retried_then_succeed() {
        let ledger = Arc::new(FlakyLedger::new(2));
        let (_dir, svc) = service_with(Arc::clone(&ledger), Behavior::Fails);
        let result = svc
            .recognize(ProbeRequest::new(s1()).course("C1").captured_at(morning()))
            .await
            .unwrap();
        assert!(matches!(result, Recognition::Marked { already_marked_today: false, .. }));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conflicts_exhausted_surface_transient_error() {
        let ledger = Arc::new(FlakyLedger::new(usize::MAX));
        let (_dir, svc) = service_with(Arc::clone(&ledger), Behavior::Fails);
        let err = svc
            .recognize(ProbeRequest::new(s1()).course("C1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::StorageConflict { attempts: 3 }));
        assert!(err.is_transient());
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);

        let response = ScanResponse::from_result(Err(err));
        assert!(!response.success);
        assert!(response.retryable);
    }

    #[tokio::test]
    async fn test_scan_marks_and_releases_artifact() {
        let (_dir, svc) = service(Behavior::Returns(s1()));
        let response = svc
            .scan(ScanRequest {
                image: PNG.to_vec(),
                course_id: Some("C1".into()),
                threshold: None,
            })
            .await;

        assert!(response.success);
        assert!(response.recognized);
        assert_eq!(response.identity_id.as_deref(), Some("S1"));
        assert_eq!(response.already_marked_today, Some(false));
        assert_eq!(response.status, Some(AttendanceStatus::Present));
        assert_eq!(response.message, "Attendance marked successfully.");

        // The extractor saw the staged file; it is gone afterwards.
        assert_eq!(*svc.extractor.saw_file.lock().unwrap(), vec![true]);
        assert_eq!(svc.spool().created(), 1);
        assert_eq!(svc.spool().released(), 1);
        assert_eq!(std::fs::read_dir(svc.spool().dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_scan_response_json_shape() {
        let (_dir, svc) = service(Behavior::Returns(s2()));
        let response = svc
            .scan(ScanRequest {
                image: PNG.to_vec(),
                ..ScanRequest::default()
            })
            .await;
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["recognized"], true);
        assert_eq!(json["identityId"], "S2");
        assert!(json.get("alreadyMarkedToday").is_none());
    }

    #[tokio::test]
    async fn test_extraction_failure_releases_artifact_once() {
        let (_dir, svc) = service(Behavior::Fails);
        let response = svc
            .scan(ScanRequest {
                image: PNG.to_vec(),
                course_id: Some("C1".into()),
                threshold: None,
            })
            .await;

        assert!(!response.success);
        assert!(response.retryable);
        assert_eq!(svc.spool().created(), 1);
        assert_eq!(svc.spool().released(), 1);
        assert!(svc.ledger().list(&LedgerQuery::all()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extraction_timeout_releases_artifact_once() {
        let (_dir, svc) = service(Behavior::Hangs);
        let response = svc
            .scan(ScanRequest {
                image: PNG.to_vec(),
                course_id: Some("C1".into()),
                threshold: None,
            })
            .await;

        assert!(!response.success);
        assert!(response.retryable);
        assert!(response.message.contains("timed out"));
        assert_eq!(svc.spool().released(), 1);
        assert_eq!(svc.spool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_scan_rejects_empty_and_non_image_payloads() {
        let (_dir, svc) = service(Behavior::Returns(s1()));
        for image in [Vec::new(), b"definitely not an image".to_vec()] {
            let response = svc
                .scan(ScanRequest {
                    image,
                    ..ScanRequest::default()
                })
                .await;
            assert!(!response.success);
            assert!(!response.retryable);
        }
        assert_eq!(svc.spool().created(), 0);
    }

    #[tokio::test]
    async fn test_scan_rejects_bad_threshold_before_staging() {
        let (dir, svc) = service(Behavior::Returns(s1()));
        let empty = RecognitionService::new(
            Arc::new(Gallery::in_memory(DIM)),
            Arc::new(MemoryLedger::new()),
            FakeExtractor::new(Behavior::Returns(s1())),
            ArtifactSpool::new(dir.path().join("empty-spool")).unwrap(),
            fast_policy(),
        );

        for threshold in [5.0, -1.5, f32::NAN] {
            let request = ScanRequest {
                image: PNG.to_vec(),
                course_id: Some("C1".into()),
                threshold: Some(threshold),
            };
            for response in [svc.scan(request.clone()).await, empty.scan(request).await] {
                assert!(!response.success);
                assert!(!response.retryable);
                assert!(!response.recognized);
            }
        }

        assert_eq!(svc.spool().created(), 0);
        assert_eq!(empty.spool().created(), 0);
        assert!(svc.extractor.saw_file.lock().unwrap().is_empty());
        assert!(svc.ledger().list(&LedgerQuery::all()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_matcher_panic_still_releases_artifact() {
        let (_dir, svc) = service(Behavior::Fails);
        let (artifact, path) = held_artifact(&svc);
        let spool = svc.spool().clone();
        let svc = Arc::new(svc.with_matcher(PanickingMatcher));

        let task = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move {
                svc.recognize(ProbeRequest::new(s1()).course("C1").artifact(artifact))
                    .await
            })
        };

        let err = task.await.unwrap_err();
        assert!(err.is_panic());
        assert!(!path.exists());
        assert_eq!(spool.released(), 1);
        assert!(svc.ledger().list(&LedgerQuery::all()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_image_adds_identity() {
        let (_dir, svc) = service(Behavior::Returns(vec![0.0, 0.0, 1.0, 0.0]));
        let face = svc.enroll_image("S3", PNG).await.unwrap();
        assert_eq!(face.identity_id, "S3");
        assert_eq!(face.quality, 0.75);
        assert_eq!(svc.gallery().len(), 3);
        assert_eq!(svc.spool().outstanding(), 0);

        let err = svc.enroll_image("S3", PNG).await.unwrap_err();
        assert!(matches!(
            err,
            RecognitionError::Gallery(GalleryError::DuplicateIdentity(_))
        ));
        assert!(err.is_caller_error());
    }
}
