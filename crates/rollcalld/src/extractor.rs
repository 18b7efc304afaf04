//! External embedding extractor, run as a child process per image.
//!
//! The program gets the staged image path as its last argument and must print
//! one JSON object on stdout. Timeouts are applied by the caller; the child is
//! killed when the pending call is dropped.

use rollcall_core::extract::parse_reply;
use rollcall_core::{ExtractError, Extraction, Extractor};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ProcessExtractor {
    program: String,
    args: Vec<String>,
}

impl ProcessExtractor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Extractor for ProcessExtractor {
    async fn extract(&self, image: &Path) -> Result<Extraction, ExtractError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            // A structured {"error": ...} reply beats raw stderr.
            if let Err(e @ ExtractError::Failed(_)) = parse_reply(&stdout) {
                return Err(e);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(program = %self.program, status = %output.status, "extractor exited with failure");
            return Err(ExtractError::Failed(format!(
                "{} ({})",
                stderr.trim(),
                output.status
            )));
        }

        parse_reply(&stdout)
    }
}
