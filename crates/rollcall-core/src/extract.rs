//! Embedding extraction collaborator contract.
//!
//! Extraction itself happens outside this crate. Implementations hand back a
//! typed [`Extraction`] or [`ExtractError`]; the recognition service applies
//! the timeout.

use serde::Deserialize;
use std::future::Future;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to start extractor: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("extractor failed: {0}")]
    Failed(String),
    #[error("malformed extractor output: {0}")]
    Malformed(String),
}

/// Embedding produced for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub embedding: Vec<f32>,
    /// Face/capture quality, if the extractor reports one.
    pub quality: Option<f32>,
}

pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        image: &Path,
    ) -> impl Future<Output = Result<Extraction, ExtractError>> + Send;
}

/// Wire shape of one extractor reply.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtractorReply {
    Embedding {
        embedding: Vec<f32>,
        #[serde(default)]
        quality: Option<f32>,
    },
    Error {
        error: String,
    },
}

/// Parse a JSON reply: `{"embedding": [...], "quality": 0.9}` or `{"error": "..."}`.
///
/// Only the last non-empty line is considered, so extractors that print
/// progress chatter before the result still parse.
pub fn parse_reply(stdout: &str) -> Result<Extraction, ExtractError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ExtractError::Malformed("empty output".into()))?;

    let reply: ExtractorReply =
        serde_json::from_str(line).map_err(|e| ExtractError::Malformed(e.to_string()))?;

    match reply {
        ExtractorReply::Embedding { embedding, .. } if embedding.is_empty() => {
            Err(ExtractError::Malformed("embedding is empty".into()))
        }
        ExtractorReply::Embedding { embedding, quality } => Ok(Extraction { embedding, quality }),
        ExtractorReply::Error { error } => Err(ExtractError::Failed(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedding() {
        let got = parse_reply(r#"{"embedding": [0.5, -0.25, 1.0]}"#).unwrap();
        assert_eq!(got.embedding, vec![0.5, -0.25, 1.0]);
        assert_eq!(got.quality, None);
    }

    #[test]
    fn test_parse_embedding_with_quality_after_chatter() {
        let out = "loading model...\nwarming up\n{\"embedding\":[1.0],\"quality\":0.87}\n\n";
        let got = parse_reply(out).unwrap();
        assert_eq!(got.quality, Some(0.87));
    }

    #[test]
    fn test_parse_error_object() {
        let err = parse_reply(r#"{"error": "No face found"}"#).unwrap_err();
        assert!(matches!(err, ExtractError::Failed(msg) if msg == "No face found"));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_reply("Traceback (most recent call last):"),
            Err(ExtractError::Malformed(_))
        ));
        assert!(matches!(parse_reply("  \n"), Err(ExtractError::Malformed(_))));
        assert!(matches!(
            parse_reply(r#"{"embedding": []}"#),
            Err(ExtractError::Malformed(_))
        ));
        assert!(matches!(
            parse_reply(r#"{"embedding": ["a"]}"#),
            Err(ExtractError::Malformed(_))
        ));
    }
}
