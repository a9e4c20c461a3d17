//! Shared types used across keel crates.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// A source revision (commit SHA, tag, or build number).
pub type Revision = String;

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[0-9a-f]{64}$").expect("static regex"));

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("invalid image reference: {0}")]
    InvalidReference(String),
}

/// Content digest of an image manifest: `sha256:<64 lowercase hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        if DIGEST_RE.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(ReferenceError::InvalidDigest(s.to_string()))
        }
    }

    /// Compute the digest of raw manifest bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        Self(format!("sha256:{}", hex::encode(hash)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[7..19]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// A container image reference: `registry/repository[:tag][@digest]`.
///
/// Tags are mutable; a reference carrying a digest is pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, ReferenceError> {
        let invalid = || ReferenceError::InvalidReference(reference.to_string());

        let (name, digest) = match reference.split_once('@') {
            Some((name, d)) => (name, Some(Digest::parse(d)?)),
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let last_slash = name.rfind('/').ok_or_else(invalid)?;
        let (path, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };

        let (registry, repository) = path.split_once('/').ok_or_else(invalid)?;
        if registry.is_empty() || repository.is_empty() {
            return Err(invalid());
        }
        if tag.as_deref().is_some_and(str::is_empty) {
            return Err(invalid());
        }
        let tag = match (tag, &digest) {
            (None, None) => Some("latest".to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Whether this reference already names immutable content.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// The same reference pinned to `digest`.
    pub fn pinned(&self, digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// An immutable, digest-addressed deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub source_revision: Revision,
    pub image_reference: ImageReference,
    pub digest: Digest,
}

impl Artifact {
    /// The reference used to pull this artifact (`...@sha256:...`).
    pub fn pull_reference(&self) -> ImageReference {
        self.image_reference.pinned(self.digest.clone())
    }
}
