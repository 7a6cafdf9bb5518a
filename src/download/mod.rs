//! Audio download pipeline
//!
//! [`resolver`] turns a content id into stream urls. The transfer itself is
//! run by the host; [`progress`] follows it through a [`ProgressProvider`].

pub mod error;
pub mod progress;
pub mod resolver;

pub use error::DownloadError;
pub use progress::{
    progress_percent, safe_file_name, DownloadFailure, DownloadListener, DownloadSnapshot,
    DownloadStatus, ProgressProvider, ProgressTracker, TrackerOutcome,
};
pub use resolver::{ContentId, ContentResolver, DownloadInfo, StreamManifest, WebApiResolver};
