//! Ephemeral file storage for Drophost.
//!
//! Uploaded files are keyed by short human-typable [`FileId`]s and live for a
//! fixed TTL. Content bytes are written to disk next to a small JSON metadata
//! sidecar, while an in-memory index provides O(1) resolution and collision
//! checks. A periodic sweep removes everything past its expiry.

pub mod id;
pub mod store;

pub use id::{FileId, ParseFileIdError, ID_ALPHABET, ID_LEN};
pub use store::{FileStore, StoredFile, FILE_TTL, SWEEP_INTERVAL};

#[cfg(test)]
mod tests;
