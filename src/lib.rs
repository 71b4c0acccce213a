//! Embedded ordered key-value engine. Writes buffer in memory, flush as
//! compressed bloom-filtered chunks, and compact into a single sorted
//! sequence across two alternating on-disk stores. One [`Blob`] is one
//! shard; routing keys across blobs is the caller's concern.

pub mod blob;
pub mod bloom;
pub mod codec;
pub mod config;
pub mod error;
pub mod key;
pub mod mapped;

pub use blob::Blob;
pub use bloom::Bloom;
pub use codec::{Codec, ZstdCodec};
pub use config::BlobConfig;
pub use error::{Error, Result};
pub use key::Key;
