//! Error definitions for the download module

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The progress source could not be read this time
    #[error("Progress query failed: {0}")]
    QueryFailed(String),

    /// The request could not be built or sent
    #[error("Request error: {0}")]
    Request(String),

    /// A resolver response did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Request(e.to_string())
    }
}
