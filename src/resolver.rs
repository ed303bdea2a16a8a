#![forbid(unsafe_code)]

//! Media resolution through the yt-dlp executable.
//!
//! The resolver answers two questions: "what is behind this URL" (metadata
//! extraction via `--dump-single-json`) and "give me its bytes" (a
//! format-constrained download into a scratch directory). Everything that
//! consumes it goes through the [`MediaResolver`] trait so tests can stand in
//! a stub instead of the network.

use crate::runner;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Subset of yt-dlp's info JSON the server cares about. Unknown fields are
/// ignored; absent ones stay `None` so flat playlist entries parse too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaHandle {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "_type")]
    pub kind: Option<String>,
    pub extractor: Option<String>,
    pub webpage_url: Option<String>,
    pub webpage_url_domain: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub is_live: Option<bool>,
    #[serde(default)]
    pub entries: Vec<Value>,
}

impl MediaHandle {
    pub fn is_playlist(&self) -> bool {
        self.kind.as_deref() == Some("playlist")
    }

    /// Playlist entries that actually parsed as media objects; yt-dlp emits
    /// `null` for entries it could not reach and those are skipped.
    pub fn playlist_entries(&self) -> Vec<MediaHandle> {
        self.entries
            .iter()
            .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
            .collect()
    }

    /// Generic-extractor ids are only unique per site, so they get prefixed
    /// with the source domain to stay collision-free across extractors.
    pub fn qualify_generic_id(&mut self) {
        if self.extractor.as_deref() == Some("generic")
            && let (Some(domain), Some(id)) = (&self.webpage_url_domain, &self.id)
        {
            self.id = Some(format!("g{domain}{id}"));
        }
    }
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Metadata-only extraction. With `flat` set, playlist entries stay
    /// shallow (no per-entry network round trips).
    async fn resolve(&self, query: &str, flat: bool) -> Result<MediaHandle>;

    /// Downloads the source bytes for `handle` into `dest`, forwarding each
    /// progress line as it is printed.
    async fn download(
        &self,
        handle: &MediaHandle,
        want_video: bool,
        dest: &Path,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<()>;
}

pub struct YtDlpResolver {
    ytdlp_path: String,
}

impl YtDlpResolver {
    pub fn new(ytdlp_path: String) -> Self {
        Self { ytdlp_path }
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(&self, query: &str, flat: bool) -> Result<MediaHandle> {
        let mut command = Command::new(&self.ytdlp_path);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--default-search")
            .arg("auto");
        if flat {
            command.arg("--flat-playlist");
        }
        command.arg("--").arg(query);

        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("launching {}", self.ytdlp_path))?;

        if !output.status.success() {
            crate::console::debug(format!(
                "yt-dlp failed for {query}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
            bail!("Could not extract information from the URL");
        }

        let mut handle: MediaHandle = serde_json::from_slice(&output.stdout)
            .context("deserializing media metadata JSON")?;
        handle.qualify_generic_id();
        Ok(handle)
    }

    async fn download(
        &self,
        handle: &MediaHandle,
        want_video: bool,
        dest: &Path,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<()> {
        let target = handle
            .webpage_url
            .clone()
            .or_else(|| handle.id.clone())
            .context("Could not determine media ID")?;

        // The client decodes in real time on very weak hardware, so the
        // worst available quality is the right source material.
        let format = if want_video {
            "worst[ext=mp4]/worst"
        } else {
            "worstaudio/worst"
        };

        let args = vec![
            "--format".to_string(),
            format.to_string(),
            "--output".to_string(),
            dest.join("%(id)s.%(ext)s").to_string_lossy().into_owned(),
            "--restrict-filenames".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "--default-search".to_string(),
            "auto".to_string(),
            "--".to_string(),
            target,
        ];

        let status = runner::run_with_live_output(&self.ytdlp_path, &args, |line| {
            on_line(line);
        })
        .await?;

        if !status.success() {
            bail!("Could not download the media");
        }
        Ok(())
    }
}
