//! Content-addressed artifact store for kiln
//!
//! The store is the only shared mutable resource of the pipeline. It is
//! accessed through two operations:
//! - `fetch`: look up an artifact by key
//! - `publish_if_absent`: produce an artifact into a private staging
//!   directory and atomically rename it into place
//!
//! Keys are SHA-256 digests of the inputs that define an artifact, so two
//! writers racing on the same key produce the same content and the loser
//! simply discards its staging directory. No locking is involved.
//!
//! Layout: `<root>/objects/<key[0:2]>/<key>/{meta.json,content/}`

mod key;
mod store;

pub use key::{ArtifactKey, KeyHasher};
pub use store::{
    ArtifactKind, ArtifactMeta, ArtifactStore, CacheStats, Publication, StoreError, StoredArtifact,
};
