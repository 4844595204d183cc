//! Line transforms applied by every session.
//!
//! A transform maps the bytes of one request line (delimiter already
//! stripped) to the bytes of one response line. Transforms are shared across
//! session threads behind an `Arc`, so they must be `Send + Sync` and must
//! not keep per-call state.
//!
//! ## Encoding policies
//!
//! The wire carries raw bytes. How a line that is not valid UTF-8 is handled
//! is an explicit choice:
//!
//! - `strict`: reject the line; the session closes without responding
//! - `lossy`: replace invalid sequences with U+FFFD, then transform
//! - `ascii`: map ASCII letters only; every other byte passes through

use crate::error::TransformError;
use serde::Deserialize;
use std::sync::Arc;

/// A pure function of one line.
pub trait LineTransform: Send + Sync {
    /// Transform `line`, which excludes the trailing `\n`.
    fn transform(&self, line: &[u8]) -> Result<Vec<u8>, TransformError>;
}

impl<F> LineTransform for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync,
{
    fn transform(&self, line: &[u8]) -> Result<Vec<u8>, TransformError> {
        self(line)
    }
}

/// Built-in transform selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    /// Uppercase every character.
    #[default]
    Upper,
    /// Lowercase every character.
    Lower,
    /// Return the line unchanged.
    Echo,
}

/// Handling of lines that are not valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncodingPolicy {
    #[default]
    Strict,
    Lossy,
    Ascii,
}

/// Case mapping over a line under a given encoding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseTransform {
    kind: TransformKind,
    encoding: EncodingPolicy,
}

impl CaseTransform {
    pub fn new(kind: TransformKind, encoding: EncodingPolicy) -> Self {
        Self { kind, encoding }
    }

    fn map_str(&self, text: &str) -> String {
        match self.kind {
            TransformKind::Upper => text.to_uppercase(),
            TransformKind::Lower => text.to_lowercase(),
            TransformKind::Echo => text.to_owned(),
        }
    }

    fn map_ascii(&self, line: &[u8]) -> Vec<u8> {
        match self.kind {
            TransformKind::Upper => line.to_ascii_uppercase(),
            TransformKind::Lower => line.to_ascii_lowercase(),
            TransformKind::Echo => line.to_vec(),
        }
    }
}

impl Default for CaseTransform {
    fn default() -> Self {
        Self::new(TransformKind::default(), EncodingPolicy::default())
    }
}

impl LineTransform for CaseTransform {
    fn transform(&self, line: &[u8]) -> Result<Vec<u8>, TransformError> {
        match self.encoding {
            EncodingPolicy::Strict => {
                let text = std::str::from_utf8(line).map_err(|e| TransformError::InvalidUtf8 {
                    valid_up_to: e.valid_up_to(),
                })?;
                Ok(self.map_str(text).into_bytes())
            }
            EncodingPolicy::Lossy => Ok(self.map_str(&String::from_utf8_lossy(line)).into_bytes()),
            EncodingPolicy::Ascii => Ok(self.map_ascii(line)),
        }
    }
}

/// Build the shared transform for a server.
pub fn build(kind: TransformKind, encoding: EncodingPolicy) -> Arc<dyn LineTransform> {
    Arc::new(CaseTransform::new(kind, encoding))
}
