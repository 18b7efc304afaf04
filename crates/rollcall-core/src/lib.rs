//! rollcall-core: Face-match-to-attendance pipeline.
//!
//! Matches probe embeddings against an enrollment gallery with cosine
//! similarity and commits hits into a per-day attendance ledger with
//! at-most-one-row-per-key semantics.

pub mod artifact;
pub mod extract;
pub mod gallery;
pub mod ledger;
pub mod recognition;
pub mod types;

pub use artifact::{ArtifactSpool, ProbeArtifact};
pub use extract::{ExtractError, Extraction, Extractor};
pub use gallery::{FaceStore, Gallery, GalleryError, Snapshot};
pub use ledger::{
    AttendanceLedger, AttendanceRecord, AttendanceStatus, LedgerError, LedgerKey, LedgerQuery,
    MemoryLedger, Sighting, UpsertOutcome, VerificationMethod,
};
pub use recognition::{
    ProbeRequest, Recognition, RecognitionError, RecognitionPolicy, RecognitionService,
    ScanRequest, ScanResponse, DEFAULT_THRESHOLD,
};
pub use types::{similarity, CosineMatcher, Embedding, EnrolledFace, MatchOutcome, Matcher};
