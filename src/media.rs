#![forbid(unsafe_code)]

//! Artifact naming and sizing rules.
//!
//! Every conversion is addressed by a deterministic filename derived from the
//! media id (plus the clamped dimensions for video), which is what makes the
//! pipeline idempotent: a file that exists under that name was produced by a
//! completed conversion and is never produced again.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

// One dfpwm sample unit is 16 bytes; a chunk is 256 units. Larger chunks
// overwhelm the client's decoder, smaller ones drown the link in messages.
pub const CHUNK_BYTES: u64 = 16 * 256;

/// Number of frame records returned per video page.
pub const FRAMES_PER_PAGE: usize = 10;

pub fn audio_artifact_name(media_id: &str) -> String {
    format!("{media_id}.dfpwm")
}

pub fn video_artifact_name(media_id: &str, width: u32, height: u32) -> String {
    format!("{media_id}_{width}_{height}.32vid")
}

/// Scales `(width, height)` down to fit inside `(max_width, max_height)`
/// while preserving aspect ratio. Dimensions are floored but never drop
/// below one pixel; values already inside the bound pass through unchanged,
/// so applying the cap twice is a no-op.
pub fn cap_dimensions(width: i64, height: i64, max_width: u32, max_height: u32) -> (u32, u32) {
    let width = width.max(1) as u128;
    let height = height.max(1) as u128;
    let max_width = u128::from(max_width.max(1));
    let max_height = u128::from(max_height.max(1));

    if width <= max_width && height <= max_height {
        return (width as u32, height as u32);
    }

    // Integer arithmetic keeps the result exact: whichever edge overshoots
    // its bound by the larger ratio becomes the bound, the other scales.
    let (capped_width, capped_height) = if width * max_height >= height * max_width {
        (max_width, (height * max_width / width).max(1))
    } else {
        ((width * max_height / height).max(1), max_height)
    };
    (capped_width as u32, capped_height as u32)
}

/// Creates the artifact directory if it does not exist yet.
pub fn ensure_media_root(media_root: &Path) -> Result<()> {
    std::fs::create_dir_all(media_root)
        .with_context(|| format!("creating {}", media_root.display()))?;
    Ok(())
}

pub fn artifact_path(media_root: &Path, file_name: &str) -> PathBuf {
    media_root.join(file_name)
}
