//! Download progress tracking
//!
//! A [`ProgressTracker`] polls a [`ProgressProvider`] on a fixed interval and
//! forwards changes to a [`DownloadListener`]. The listener hears the
//! sanitized file name once, on the first answered poll. Progress is reported
//! as an integer percentage and only when it changes; the task ends on
//! success, failure or cancellation.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::DownloadError;

/// Characters that may not appear in a file name
const FORBIDDEN_FILE_CHARS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const AUDIO_EXTENSION: &str = ".mp3";

/// Reason a download ended unsuccessfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DownloadFailure {
    #[error("unknown error")]
    Unknown,
    #[error("file error")]
    FileError,
    #[error("unhandled HTTP code")]
    UnhandledHttpCode,
    #[error("HTTP data error")]
    HttpDataError,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("insufficient storage space")]
    InsufficientSpace,
    #[error("storage device not found")]
    DeviceNotFound,
    #[error("download failed (error code: {0})")]
    Other(i32),
}

impl DownloadFailure {
    pub fn from_code(code: i32) -> Self {
        match code {
            1000 => DownloadFailure::Unknown,
            1001 => DownloadFailure::FileError,
            1002 => DownloadFailure::UnhandledHttpCode,
            1004 => DownloadFailure::HttpDataError,
            1005 => DownloadFailure::TooManyRedirects,
            1006 => DownloadFailure::InsufficientSpace,
            1007 => DownloadFailure::DeviceNotFound,
            other => DownloadFailure::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DownloadFailure::Unknown => 1000,
            DownloadFailure::FileError => 1001,
            DownloadFailure::UnhandledHttpCode => 1002,
            DownloadFailure::HttpDataError => 1004,
            DownloadFailure::TooManyRedirects => 1005,
            DownloadFailure::InsufficientSpace => 1006,
            DownloadFailure::DeviceNotFound => 1007,
            DownloadFailure::Other(code) => *code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DownloadStatus {
    #[default]
    Pending,
    Running,
    Succeeded {
        path: PathBuf,
    },
    Failed(DownloadFailure),
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Succeeded { .. } | DownloadStatus::Failed(_)
        )
    }
}

/// One observation of a download
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadSnapshot {
    pub status: DownloadStatus,
    pub downloaded: u64,
    /// Zero while the size is unknown
    pub total: u64,
}

#[async_trait]
pub trait ProgressProvider: Send + Sync + 'static {
    async fn query(&self) -> Result<DownloadSnapshot, DownloadError>;
}

/// Receives download milestones
pub trait DownloadListener: Send + Sync {
    fn on_start(&self, file_name: &str);
    fn on_progress(&self, percent: u8);
    fn on_complete(&self, path: &Path);
    fn on_error(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerOutcome {
    Completed(PathBuf),
    Failed(DownloadFailure),
    Cancelled,
}

/// Integer percentage of `downloaded / total`, `None` while the size is unknown
pub fn progress_percent(downloaded: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (u128::from(downloaded) * 100 / u128::from(total)).min(100);
    Some(percent as u8)
}

/// File name for `title` with unsafe characters replaced and an mp3 suffix
pub fn safe_file_name(title: &str) -> String {
    let cleaned: String = title
        .trim()
        .chars()
        .map(|ch| {
            if FORBIDDEN_FILE_CHARS.contains(&ch) || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();
    let cleaned = if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    };

    if cleaned.to_lowercase().ends_with(AUDIO_EXTENSION) {
        cleaned
    } else {
        format!("{cleaned}{AUDIO_EXTENSION}")
    }
}

pub struct ProgressTracker {
    cancel: CancellationToken,
    task: JoinHandle<TrackerOutcome>,
}

impl ProgressTracker {
    /// Starts polling `provider` every `interval` until a terminal status
    ///
    /// `title` is turned into the file name passed to
    /// [`DownloadListener::on_start`].
    pub fn spawn<P>(
        provider: Arc<P>,
        listener: Arc<dyn DownloadListener>,
        title: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self
    where
        P: ProgressProvider + ?Sized,
    {
        let token = cancel.clone();
        let file_name = safe_file_name(title);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut started = false;
            let mut reported: Option<u8> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("Progress tracking cancelled");
                        return TrackerOutcome::Cancelled;
                    }
                    _ = ticker.tick() => {}
                }

                let snapshot = match provider.query().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("Progress query failed, retrying: {}", e);
                        continue;
                    }
                };

                if !started {
                    started = true;
                    info!("Download started: {}", file_name);
                    listener.on_start(&file_name);
                }

                match snapshot.status {
                    DownloadStatus::Succeeded { path } => {
                        info!("Download finished: {}", path.display());
                        listener.on_complete(&path);
                        return TrackerOutcome::Completed(path);
                    }
                    DownloadStatus::Failed(failure) => {
                        error!("Download failed: {} ({})", failure, failure.code());
                        listener.on_error(&failure.to_string());
                        return TrackerOutcome::Failed(failure);
                    }
                    DownloadStatus::Pending | DownloadStatus::Running => {
                        let Some(percent) = progress_percent(snapshot.downloaded, snapshot.total)
                        else {
                            continue;
                        };
                        if reported != Some(percent) {
                            reported = Some(percent);
                            listener.on_progress(percent);
                        }
                    }
                }
            }
        });

        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> TrackerOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Progress tracker task failed: {}", e);
                TrackerOutcome::Cancelled
            }
        }
    }
}
