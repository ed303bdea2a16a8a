#![forbid(unsafe_code)]

//! Runtime configuration for the cubecast server.
//!
//! Values come from the process environment first and fall back to a `.env`
//! file in the working directory, so a local checkout and a systemd unit can
//! share one configuration surface.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MEDIA_ROOT: &str = "media";

// The client terminal is at most 164x81 characters and each character cell
// carries a 2x3 sub-pixel grid, so no conversion ever needs to exceed this.
pub const DEFAULT_MAX_VIDEO_WIDTH: u32 = 328;
pub const DEFAULT_MAX_VIDEO_HEIGHT: u32 = 243;

// Cache sweep cadence and retention, in seconds. Zero or negative disables
// sweeping entirely.
pub const DEFAULT_CLEANUP_INTERVAL: i64 = 300;
pub const DEFAULT_CLEANUP_AFTER: i64 = 3600;

// Upper bounds on external calls, in seconds; zero disables the bound.
pub const DEFAULT_RESOLVE_TIMEOUT: u64 = 120;
pub const DEFAULT_CONVERT_TIMEOUT: u64 = 900;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub media_root: PathBuf,
    pub ffmpeg_path: String,
    pub sanjuuni_path: String,
    pub ytdlp_path: String,
    pub disable_opencl: bool,
    pub cleanup_interval: i64,
    pub cleanup_after: i64,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,
    pub no_color: bool,
    pub max_video_width: u32,
    pub max_video_height: u32,
    pub resolve_timeout: u64,
    pub convert_timeout: u64,
}

impl ServerConfig {
    /// True when both halves of the Spotify credential pair are present;
    /// the playlist resolver is disabled otherwise.
    pub fn spotify_credentials(&self) -> Option<(&str, &str)> {
        match (&self.spotify_client_id, &self.spotify_client_secret) {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ => None,
        }
    }
}

pub fn load_config() -> Result<ServerConfig> {
    let file_vars = read_env_file(Path::new(DEFAULT_ENV_PATH))?;
    Ok(build_config(&file_vars, env_var_string))
}

fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> ServerConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    ServerConfig {
        host: lookup("CUBECAST_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: parse_or(lookup("CUBECAST_PORT"), DEFAULT_PORT),
        media_root: lookup("MEDIA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_ROOT)),
        ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
        sanjuuni_path: lookup("SANJUUNI_PATH").unwrap_or_else(|| "sanjuuni".to_string()),
        ytdlp_path: lookup("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
        disable_opencl: flag_set(lookup("DISABLE_OPENCL")),
        cleanup_interval: parse_or(lookup("CACHE_CLEANUP_INTERVAL"), DEFAULT_CLEANUP_INTERVAL),
        cleanup_after: parse_or(lookup("CACHE_CLEANUP_AFTER"), DEFAULT_CLEANUP_AFTER),
        spotify_client_id: lookup("SPOTIFY_CLIENT_ID"),
        spotify_client_secret: lookup("SPOTIFY_CLIENT_SECRET"),
        no_color: flag_set(lookup("NO_COLOR")),
        max_video_width: parse_or(lookup("MAX_VIDEO_WIDTH"), DEFAULT_MAX_VIDEO_WIDTH),
        max_video_height: parse_or(lookup("MAX_VIDEO_HEIGHT"), DEFAULT_MAX_VIDEO_HEIGHT),
        resolve_timeout: parse_or(lookup("RESOLVE_TIMEOUT"), DEFAULT_RESOLVE_TIMEOUT),
        convert_timeout: parse_or(lookup("CONVERT_TIMEOUT"), DEFAULT_CONVERT_TIMEOUT),
    }
}

/// A flag counts as set when the variable exists with any non-empty value.
fn flag_set(value: Option<String>) -> bool {
    value.is_some_and(|value| !value.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
