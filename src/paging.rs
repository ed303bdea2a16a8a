#![forbid(unsafe_code)]

//! Sequential reads over converted artifacts.
//!
//! Audio is addressed by fixed-size chunk index, video by byte offset into a
//! newline-delimited frame file. Reads past end-of-file come back short (or
//! as empty strings for video) rather than failing; a missing artifact is an
//! error the caller turns into a protocol error envelope.

use crate::media::{CHUNK_BYTES, FRAMES_PER_PAGE};
use anyhow::{Context, Result, bail};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};

/// One batch of video frame lines plus the byte offset of the line that
/// follows the batch, i.e. the `tracker` for the next page.
#[derive(Debug, PartialEq, Eq)]
pub struct VideoPage {
    pub lines: Vec<String>,
    pub next_tracker: u64,
}

/// Reads the chunk at `chunkindex` from an audio artifact: up to
/// `CHUNK_BYTES` whole bytes starting at `chunkindex * CHUNK_BYTES`,
/// clipped at end-of-file.
pub async fn read_audio_chunk(media_root: &Path, file_name: &str, chunkindex: u64) -> Result<Vec<u8>> {
    let path = media_root.join(file_name);
    let mut file = File::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    let Some(offset) = chunkindex.checked_mul(CHUNK_BYTES) else {
        bail!("chunk index out of range");
    };
    file.seek(SeekFrom::Start(offset))
        .await
        .with_context(|| format!("seeking in {}", path.display()))?;

    let mut chunk = vec![0u8; CHUNK_BYTES as usize];
    let mut filled = 0;
    while filled < chunk.len() {
        let read = file
            .read(&mut chunk[filled..])
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

/// Reads the next `FRAMES_PER_PAGE` frame lines starting at byte offset
/// `tracker`. Trailing newlines are stripped; reads past end-of-file yield
/// empty strings, so a page is always `FRAMES_PER_PAGE` entries long.
pub async fn read_video_page(media_root: &Path, file_name: &str, tracker: u64) -> Result<VideoPage> {
    let path = media_root.join(file_name);
    let file = File::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(tracker))
        .await
        .with_context(|| format!("seeking in {}", path.display()))?;

    let mut lines = Vec::with_capacity(FRAMES_PER_PAGE);
    let mut next_tracker = tracker;
    for _ in 0..FRAMES_PER_PAGE {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        next_tracker += read as u64;
        if line.ends_with('\n') {
            line.pop();
        }
        lines.push(line);
    }

    Ok(VideoPage {
        lines,
        next_tracker,
    })
}
