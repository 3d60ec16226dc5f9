//! Chunked blob uploads.

pub mod manager;
pub mod session;

pub use manager::UploadSessionManager;
pub use session::{UploadId, UploadSession, UploadState, UploadStatus};
