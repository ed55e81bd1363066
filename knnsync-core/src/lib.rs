//! # knnsync: classifier dataset persistence and synchronization
//!
//! knnsync persists the dataset of a nearest-neighbor image classifier (the
//! embedding vectors captured per class) and keeps it in sync across sessions.
//!
//! ## Data flow
//!
//! ```text
//! capture/delete --> EmbeddingStore --> AutosaveScheduler --> ModelSync
//!                                                               |
//!                              codec::encode <-- StorageRouter <+
//!                                                  |        |
//!                                     ChunkedBackend      BlobStore
//!                                     (DocumentStore)     (HTTP server)
//! ```
//!
//! - Data model ([`dataset`], [`embedding_store`])
//! - Artifact format and compression ([`codec`])
//! - Backends ([`docstore`], [`chunked`], [`blob`])
//! - Backend selection and fallback ([`router`])
//! - Model metadata and versions ([`catalog`])
//! - Session-scoped operations ([`session`], [`sync`], [`autosave`])
//! - Local snapshot when nothing remote is reachable ([`fallback`])
//!
//! Every layer returns [`SyncError`]; configuration lives in [`SyncConfig`].

pub mod autosave;
pub mod blob;
pub mod catalog;
pub mod chunked;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod docstore;
pub mod embedding_store;
pub mod error;
pub mod fallback;
pub mod router;
pub mod session;
pub mod sync;

// Re-exports
pub use config::SyncConfig;
pub use dataset::{ClassBucket, Dataset, EmbeddingVector, Label, ModelId};
pub use error::{SyncError, SyncResult};
pub use sync::ModelSync;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global tracing subscriber used by the binaries.
/// `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
