//! Content resolver - maps an external content id to downloadable audio
//!
//! ```text
//! "AV170001" ──► aid → bvid ──► bvid → (title, cid) ──► playurl → StreamManifest
//!                                                              │
//!                                  DownloadInfo ◄── select_audio_stream
//! ```
//!
//! Any failure along the chain resolves to `None`; partial results are never
//! returned.

use async_trait::async_trait;
use reqwest::header::{REFERER, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::DownloadError;
use crate::config::ResolverConfig;

/// Audio the resolver found for one content id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub title: String,
    pub primary_url: String,
    pub backup_url: String,
    pub is_lossless: bool,
}

#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve(&self, content_id: &str) -> Option<DownloadInfo>;
}

/// External content identifier as typed by a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentId {
    /// Numeric `AV` id that must be translated first
    Av(u64),
    Opaque(String),
}

impl ContentId {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let numeric = raw
            .get(..2)
            .filter(|prefix| prefix.eq_ignore_ascii_case("av"))
            .and_then(|_| raw[2..].parse::<u64>().ok());
        Some(match numeric {
            Some(aid) => ContentId::Av(aid),
            None => ContentId::Opaque(raw.to_string()),
        })
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentId::Av(aid) => write!(f, "AV{aid}"),
            ContentId::Opaque(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioStream {
    #[serde(rename = "baseUrl", default)]
    pub base_url: String,
    #[serde(rename = "backupUrl", default)]
    pub backup_url: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LosslessSection {
    #[serde(default)]
    pub audio: Option<AudioStream>,
}

/// Stream description returned by the playurl endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamManifest {
    #[serde(default)]
    pub flac: Option<LosslessSection>,
    #[serde(default)]
    pub audio: Option<Vec<AudioStream>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedStream {
    pub primary_url: String,
    pub backup_url: String,
    pub is_lossless: bool,
}

/// Prefers the lossless stream, falling back to the first regular one
pub fn select_audio_stream(manifest: &StreamManifest) -> Option<SelectedStream> {
    let lossless = manifest
        .flac
        .as_ref()
        .and_then(|flac| flac.audio.as_ref());
    let (stream, is_lossless) = match lossless {
        Some(stream) => (stream, true),
        None => (manifest.audio.as_ref()?.first()?, false),
    };

    if stream.base_url.is_empty() {
        return None;
    }
    let backup_url = stream
        .backup_url
        .as_ref()
        .and_then(|urls| urls.first())
        .cloned()
        .unwrap_or_default();

    Some(SelectedStream {
        primary_url: stream.base_url.clone(),
        backup_url,
        is_lossless,
    })
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    code: i64,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AidView {
    #[serde(default)]
    bvid: String,
}

#[derive(Debug, Deserialize)]
struct VideoView {
    #[serde(default)]
    title: String,
    cid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PlayUrlData {
    v_voucher: Option<serde_json::Value>,
    dash: Option<StreamManifest>,
}

/// [`ContentResolver`] backed by the public web API
pub struct WebApiResolver {
    client: reqwest::Client,
    api_base: String,
    user_agent: String,
    referer: String,
}

impl WebApiResolver {
    pub fn new(config: &ResolverConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            referer: config.referer.clone(),
        })
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, DownloadError> {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .query(query)
            .header(USER_AGENT, &self.user_agent)
            .header(REFERER, &self.referer)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DownloadError::Request(format!(
                "{} answered {}",
                path,
                response.status().as_u16()
            )));
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        envelope.data.ok_or_else(|| {
            DownloadError::InvalidResponse(format!("{} returned no data (code {})", path, envelope.code))
        })
    }

    async fn bvid_for(&self, id: &ContentId) -> Result<String, DownloadError> {
        match id {
            ContentId::Opaque(bvid) => Ok(bvid.clone()),
            ContentId::Av(aid) => {
                let view: AidView = self
                    .get_data("/x/web-interface/view", &[("aid", aid.to_string())])
                    .await?;
                if view.bvid.is_empty() {
                    return Err(DownloadError::InvalidResponse(format!("no bvid for {id}")));
                }
                Ok(view.bvid)
            }
        }
    }

    async fn try_resolve(&self, id: &ContentId) -> Result<DownloadInfo, DownloadError> {
        let bvid = self.bvid_for(id).await?;

        let view: VideoView = self
            .get_data("/x/web-interface/view", &[("bvid", bvid.clone())])
            .await?;
        let cid = view
            .cid
            .ok_or_else(|| DownloadError::InvalidResponse(format!("no cid for {bvid}")))?;

        let play: PlayUrlData = self
            .get_data(
                "/x/player/playurl",
                &[
                    ("bvid", bvid.clone()),
                    ("cid", cid.to_string()),
                    // dash manifest with separate audio streams
                    ("fnval", "16".to_string()),
                ],
            )
            .await?;
        if play.v_voucher.is_some() {
            return Err(DownloadError::InvalidResponse("request was rate limited".into()));
        }
        let manifest = play
            .dash
            .ok_or_else(|| DownloadError::InvalidResponse("no stream manifest".into()))?;
        let stream = select_audio_stream(&manifest)
            .ok_or_else(|| DownloadError::InvalidResponse("no audio stream".into()))?;

        Ok(DownloadInfo {
            title: view.title,
            primary_url: stream.primary_url,
            backup_url: stream.backup_url,
            is_lossless: stream.is_lossless,
        })
    }
}

#[async_trait]
impl ContentResolver for WebApiResolver {
    async fn resolve(&self, content_id: &str) -> Option<DownloadInfo> {
        let id = ContentId::parse(content_id)?;
        match self.try_resolve(&id).await {
            Ok(info) => {
                info!("Resolved {} to \"{}\" (lossless: {})", id, info.title, info.is_lossless);
                Some(info)
            }
            Err(e) => {
                warn!("Could not resolve {}: {}", id, e);
                None
            }
        }
    }
}
