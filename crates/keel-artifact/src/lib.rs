//! keel-artifact — turn a source revision into an immutable artifact.
//!
//! The resolver asks the build catalog which image a revision produced,
//! then asks the registry which digest that (mutable) tag points at.
//!
//! ```text
//! revision ──BuildCatalog──▶ image:tag ──Registry──▶ sha256:… ──▶ Artifact
//! ```
//!
//! Digests are immutable, so a resolved artifact is cached for the life of
//! the process. Concurrent resolutions of the same revision share a single
//! in-flight lookup; the first successful resolution wins.

pub mod error;
pub mod memory;
pub mod resolver;

pub use error::{ArtifactError, ArtifactResult};
pub use memory::{InMemoryRegistry, StaticCatalog};
pub use resolver::{ArtifactResolver, BuildCatalog, Registry};
