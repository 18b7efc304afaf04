use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face embedding vector (fixed dimension per gallery, 512 for ArcFace-style models).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Cosine similarity against another embedding, in [-1, 1].
    pub fn similarity(&self, other: &Embedding) -> f32 {
        similarity(&self.values, &other.values)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]. Higher = more similar. A zero-norm input
/// yields 0.0 rather than NaN. Always processes all dimensions.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    // Accumulate in f64: squares of finite f32 components neither overflow
    // nor underflow there.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 && denom.is_finite() {
        // Rounding can push |dot/denom| a hair past 1.0.
        (dot / denom).clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

/// One enrolled identity in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledFace {
    pub identity_id: String,
    pub embedding: Embedding,
    /// Capture quality reported at enrollment time (detector confidence or similar).
    pub quality: f32,
    pub enrolled_at: DateTime<Utc>,
}

/// Result of matching a probe embedding against a gallery snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The gallery was empty; nothing to compare against.
    NoEnrollments,
    /// Candidates existed but none cleared the threshold.
    NoMatch {
        /// Best similarity seen, for diagnostics only.
        best_similarity: f32,
    },
    Matched {
        identity_id: String,
        /// Cosine similarity of the best match [-1, 1].
        similarity: f32,
    },
}

impl MatchOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// The linear [`CosineMatcher`] is the only implementation; an approximate
/// index for large galleries would slot in here.
pub trait Matcher {
    fn find_best_match(
        &self,
        probe: &Embedding,
        candidates: &[EnrolledFace],
        threshold: f32,
    ) -> MatchOutcome;
}

/// Exhaustive cosine similarity matcher.
///
/// Always iterates ALL candidates (O(n·d)). Equal maxima resolve to the
/// lexicographically smallest identity id so results are reproducible
/// regardless of candidate order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find_best_match(
        &self,
        probe: &Embedding,
        candidates: &[EnrolledFace],
        threshold: f32,
    ) -> MatchOutcome {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best: Option<&EnrolledFace> = None;

        for face in candidates {
            let sim = probe.similarity(&face.embedding);
            let is_better = match best {
                None => true,
                Some(prev) => {
                    sim > best_sim || (sim == best_sim && face.identity_id < prev.identity_id)
                }
            };
            if is_better {
                best_sim = sim;
                best = Some(face);
            }
        }

        match best {
            None => MatchOutcome::NoEnrollments,
            Some(face) if best_sim >= threshold => MatchOutcome::Matched {
                identity_id: face.identity_id.clone(),
                similarity: best_sim,
            },
            Some(_) => MatchOutcome::NoMatch {
                best_similarity: best_sim,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(id: &str, values: Vec<f32>) -> EnrolledFace {
        EnrolledFace {
            identity_id: id.into(),
            embedding: Embedding::new(values),
            quality: 1.0,
            enrolled_at: Utc::now(),
        }
    }

    /// Unit vector in 2-D whose cosine against [1, 0] is `cos`.
    fn at_cosine(cos: f32) -> Vec<f32> {
        vec![cos, (1.0 - cos * cos).sqrt()]
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![0.3, -1.2, 4.0]);
        let b = a.clone();
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        assert!((similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let sim = similarity(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]);
        assert!((sim - 1.0).abs() < 1e-6);
        assert!(sim <= 1.0);
    }

    #[test]
    fn test_cosine_similarity_extreme_magnitudes() {
        let big = [3e19f32, 1e19];
        assert!((similarity(&big, &big) - 1.0).abs() < 1e-6);

        let tiny = [1e-25f32, 2e-25];
        assert!((similarity(&tiny, &tiny) - 1.0).abs() < 1e-6);

        let huge = [f32::MAX, f32::MAX];
        assert!((similarity(&huge, &[1.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((similarity(&[1e-30, 0.0], &[0.0, 1e-30])).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_identical_large_vector_matches() {
        let v = vec![3e19, 1e19, -2e19];
        let gallery = vec![face("S1", v.clone())];
        let result = CosineMatcher.find_best_match(&Embedding::new(v), &gallery, 0.6);
        assert!(result.is_matched(), "{result:?}");
    }

    #[test]
    fn test_matcher_scans_every_candidate() {
        // Best match is the last entry.
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            face("a", vec![0.0, 1.0, 0.0]),
            face("b", vec![0.0, 0.0, 1.0]),
            face("c", vec![1.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher.find_best_match(&probe, &gallery, 0.5);
        match result {
            MatchOutcome::Matched {
                identity_id,
                similarity,
            } => {
                assert_eq!(identity_id, "c");
                assert!((similarity - 1.0).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_matcher_below_threshold() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![face("S1", at_cosine(0.3)), face("S2", at_cosine(0.5))];

        let result = CosineMatcher.find_best_match(&probe, &gallery, 0.6);
        match result {
            MatchOutcome::NoMatch { best_similarity } => {
                assert!((best_similarity - 0.5).abs() < 1e-5);
            }
            other => panic!("expected no match, got {other:?}"),
        }
    }

    #[test]
    fn test_matcher_exact_probe() {
        let v = vec![0.2, 0.4, 0.1, 0.9];
        let probe = Embedding::new(v.clone());
        let gallery = vec![face("S1", v)];

        let result = CosineMatcher.find_best_match(&probe, &gallery, 0.6);
        match result {
            MatchOutcome::Matched {
                identity_id,
                similarity,
            } => {
                assert_eq!(identity_id, "S1");
                assert!((similarity - 1.0).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_matcher_threshold_is_inclusive() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let gallery = vec![face("S1", vec![1.0, 0.0])];
        let result = CosineMatcher.find_best_match(&probe, &gallery, 1.0);
        assert!(result.is_matched());
    }

    #[test]
    fn test_matcher_tie_breaks_on_smallest_id() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let v = vec![2.0, 0.0];
        let orders = [
            vec![face("S9", v.clone()), face("S2", v.clone()), face("S5", v.clone())],
            vec![face("S2", v.clone()), face("S5", v.clone()), face("S9", v.clone())],
            vec![face("S5", v.clone()), face("S9", v.clone()), face("S2", v.clone())],
        ];

        for _ in 0..10 {
            for gallery in &orders {
                let result = CosineMatcher.find_best_match(&probe, gallery, 0.6);
                assert_eq!(
                    result,
                    MatchOutcome::Matched {
                        identity_id: "S2".into(),
                        similarity: 1.0
                    }
                );
            }
        }
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher.find_best_match(&probe, &[], 0.5);
        assert_eq!(result, MatchOutcome::NoEnrollments);
    }

    #[test]
    fn test_matcher_zero_probe_never_matches_positive_threshold() {
        let probe = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![face("S1", vec![1.0, 0.0])];
        let result = CosineMatcher.find_best_match(&probe, &gallery, 0.1);
        assert_eq!(
            result,
            MatchOutcome::NoMatch {
                best_similarity: 0.0
            }
        );
    }
}
