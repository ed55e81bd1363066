//! # knnsync-http
//!
//! File server for compressed model artifacts, the remote side of
//! `knnsync_core::blob::HttpBlobStore`.
//!
//! | route                          | auth        |
//! |--------------------------------|-------------|
//! | `POST /api/models/{modelId}`   | `X-API-Key` |
//! | `GET /api/models/{modelId}`    | none        |
//! | `DELETE /api/models/{modelId}` | `X-API-Key` |
//! | `GET /health`                  | none        |

pub mod auth;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod server;
pub mod storage;

pub use server::{ServerConfig, ServerError, start_server};
