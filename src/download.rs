#![forbid(unsafe_code)]

//! The download-and-convert pipeline.
//!
//! `produce` turns a URL into the on-disk artifacts the paging server reads:
//! resolve (with Spotify links translated first), download the worst usable
//! source quality into a scratch directory, then run ffmpeg for dfpwm audio
//! and sanjuuni for 32vid video. Conversion is idempotent per artifact key:
//! an artifact file that already exists is never produced again, and a
//! per-key lock keeps concurrent first requests from racing each other into
//! duplicate conversions. Audio and video failures are independent; a
//! request can succeed with only one of the two artifacts.

use crate::config::ServerConfig;
use crate::console;
use crate::media::{self, artifact_path};
use crate::protocol::{self, MediaResponse};
use crate::resolver::MediaResolver;
use crate::runner;
use crate::spotify::{self, SpotifyRef, SpotifyResolver, SpotifyTarget};
use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Where intermediate `status`/`error` envelopes go while a request is being
/// worked on. The sink drops messages once the client is gone; an in-flight
/// conversion still completes and populates the cache for the next caller.
#[derive(Clone, Default)]
pub struct ProgressSink {
    outbound: Option<UnboundedSender<String>>,
}

impl ProgressSink {
    pub fn new(outbound: UnboundedSender<String>) -> Self {
        Self {
            outbound: Some(outbound),
        }
    }

    /// A sink that discards everything.
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn status(&self, message: &str) {
        self.send(protocol::status_envelope(message));
    }

    pub fn error(&self, message: &str) {
        self.send(protocol::error_envelope(message));
    }

    fn send(&self, envelope: serde_json::Value) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(envelope.to_string());
        }
    }
}

/// One async mutex per artifact filename. Holding the key's lock across the
/// exists-check and the conversion makes "file exists" a reliable proof that
/// a previous conversion completed.
#[derive(Default)]
pub struct ConversionLocks {
    keys: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversionLocks {
    fn for_key(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.keys.lock().entry(key.to_string()).or_default().clone()
    }
}

/// Resolves `url` and makes sure its artifacts exist, returning the media
/// payload for the client plus the artifact filenames now present on disk
/// (for the caller to register in the cache store).
pub async fn produce(
    config: &ServerConfig,
    resolver: &dyn MediaResolver,
    spotify: Option<&Arc<SpotifyResolver>>,
    locks: &ConversionLocks,
    url: &str,
    width: Option<i64>,
    height: Option<i64>,
    progress: &ProgressSink,
) -> Result<(MediaResponse, Vec<String>)> {
    let dimensions = match (width, height) {
        (Some(width), Some(height)) => Some(media::cap_dimensions(
            width,
            height,
            config.max_video_width,
            config.max_video_height,
        )),
        _ => None,
    };

    progress.status("Getting resource information ...");

    let mut url = url.to_string();
    let mut playlist_videos: Vec<String> = Vec::new();

    if let Some(spotify) = spotify
        && let Some(reference) = spotify::recognize(&url)
    {
        match resolve_spotify(spotify, &reference).await? {
            SpotifyTarget::Query(query) => url = query,
            SpotifyTarget::List(mut uris) => {
                if uris.is_empty() {
                    bail!("Could not process Spotify URL");
                }
                // Play the first entry now; the client requests the rest one
                // by one so a playlist never blocks a single response.
                let first = uris.remove(0);
                let Some(first_ref) = spotify::recognize(&first) else {
                    bail!("Could not process Spotify URL");
                };
                match resolve_spotify(spotify, &first_ref).await? {
                    SpotifyTarget::Query(query) => url = query,
                    SpotifyTarget::List(_) => bail!("Could not process Spotify URL"),
                }
                playlist_videos = uris;
            }
        }
    }

    let mut handle = with_timeout(
        config.resolve_timeout,
        "Resolution",
        resolver.resolve(&url, true),
    )
    .await?;

    // Same first-entry rule for native playlists.
    if handle.is_playlist() {
        let mut entries = handle.playlist_entries();
        if entries.is_empty() {
            bail!("Could not extract information from the URL");
        }
        let first = entries.remove(0);
        playlist_videos.extend(entries.into_iter().filter_map(|entry| entry.id));
        handle = first;
    }

    // Entries extracted flat inside a playlist are missing the engagement
    // counts; one full re-resolve by id fills them in. Never recurses.
    if handle.extractor.as_deref() == Some("youtube")
        && (handle.view_count.is_none() || handle.like_count.is_none())
        && let Some(id) = handle.id.clone()
    {
        handle = with_timeout(
            config.resolve_timeout,
            "Resolution",
            resolver.resolve(&id, false),
        )
        .await?;
    }

    let media_id = handle.id.clone().context("Could not determine media ID")?;

    if handle.is_live == Some(true) {
        bail!("Livestreams are not supported");
    }

    media::ensure_media_root(&config.media_root)?;

    let audio_name = media::audio_artifact_name(&media_id);
    let video_name = dimensions.map(|(w, h)| media::video_artifact_name(&media_id, w, h));

    // Audio first, then video: consistent order keeps two requests for the
    // same media from deadlocking on each other's keys.
    let audio_lock = locks.for_key(&audio_name);
    let _audio_guard = audio_lock.lock().await;
    let video_lock = video_name.as_ref().map(|name| locks.for_key(name));
    let _video_guard = match &video_lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let audio_path = artifact_path(&config.media_root, &audio_name);
    let audio_missing = !audio_path.exists();
    let video_missing = match &video_name {
        Some(name) => !artifact_path(&config.media_root, name).exists(),
        None => false,
    };

    if audio_missing || video_missing {
        progress.status("Downloading resource ...");
        // Dropped at the end of this block, which removes the directory on
        // the error paths too.
        let scratch = tempfile::Builder::new()
            .prefix("cubecast-")
            .tempdir()
            .context("creating scratch directory")?;

        with_timeout(
            config.convert_timeout,
            "Download",
            resolver.download(&handle, video_name.is_some(), scratch.path(), &mut |line| {
                console::debug(format!("[yt-dlp] {line}"));
                progress.status(line);
            }),
        )
        .await?;

        let source = downloaded_file(scratch.path())?;

        if audio_missing
            && let Err(err) = convert_audio(config, &source, &audio_name, progress).await
        {
            console::warn(format!("audio conversion failed: {err}"));
            progress.error("Failed to convert audio");
        }

        if video_missing
            && let (Some(name), Some((width, height))) = (&video_name, dimensions)
            && let Err(err) = convert_video(config, &source, name, width, height, progress).await
        {
            console::warn(format!("video conversion failed: {err}"));
            progress.error("Failed to convert video");
        }
    }

    let mut files = Vec::new();
    if audio_path.exists() {
        files.push(audio_name);
    }
    if let Some(name) = video_name
        && artifact_path(&config.media_root, &name).exists()
    {
        files.push(name);
    }

    let payload = MediaResponse {
        action: "media",
        id: media_id,
        title: handle.title,
        like_count: handle.like_count,
        view_count: handle.view_count,
        playlist_videos,
    };
    Ok((payload, files))
}

/// The Spotify client is blocking, so it runs on the blocking pool.
async fn resolve_spotify(
    spotify: &Arc<SpotifyResolver>,
    reference: &SpotifyRef,
) -> Result<SpotifyTarget> {
    let spotify = Arc::clone(spotify);
    let reference = reference.clone();
    tokio::task::spawn_blocking(move || spotify.resolve_ref(&reference))
        .await
        .context("joining Spotify resolver task")?
}

async fn with_timeout<T>(
    secs: u64,
    what: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    if secs == 0 {
        return future.await;
    }
    match tokio::time::timeout(Duration::from_secs(secs), future).await {
        Ok(result) => result,
        Err(_) => bail!("{what} timed out"),
    }
}

/// The download template writes exactly one media file into the scratch
/// directory; this digs it back out.
fn downloaded_file(scratch: &Path) -> Result<PathBuf> {
    let mut entries =
        std::fs::read_dir(scratch).with_context(|| format!("listing {}", scratch.display()))?;
    let entry = entries.next().context("download produced no file")?;
    let entry = entry.with_context(|| format!("listing {}", scratch.display()))?;
    Ok(entry.path())
}

async fn convert_audio(
    config: &ServerConfig,
    source: &Path,
    file_name: &str,
    progress: &ProgressSink,
) -> Result<()> {
    progress.status("Converting audio to dfpwm ...");
    let dest = artifact_path(&config.media_root, file_name);
    let part = artifact_path(&config.media_root, &format!("{file_name}.part"));

    let args = vec![
        "-y".to_string(),
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "-f".to_string(),
        "dfpwm".to_string(),
        "-ar".to_string(),
        "48000".to_string(),
        "-ac".to_string(),
        "1".to_string(),
        part.to_string_lossy().into_owned(),
    ];

    let prefix = console::paint(console::BRIGHT_GREEN, "[FFmpeg]", !config.no_color);
    let result = with_timeout(
        config.convert_timeout,
        "Audio conversion",
        run_converter(&config.ffmpeg_path, "FFmpeg", &prefix, &args, progress),
    )
    .await;
    finalize_artifact(result, &part, &dest)
}

async fn convert_video(
    config: &ServerConfig,
    source: &Path,
    file_name: &str,
    width: u32,
    height: u32,
    progress: &ProgressSink,
) -> Result<()> {
    progress.status("Converting video to 32vid ...");
    let dest = artifact_path(&config.media_root, file_name);
    let part = artifact_path(&config.media_root, &format!("{file_name}.part"));

    let mut args = vec![
        format!("--width={width}"),
        format!("--height={height}"),
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "--raw".to_string(),
        "-o".to_string(),
        part.to_string_lossy().into_owned(),
    ];
    if config.disable_opencl {
        args.push("--disable-opencl".to_string());
    }

    let prefix = console::paint(console::BRIGHT_YELLOW, "[Sanjuuni]", !config.no_color);
    let result = with_timeout(
        config.convert_timeout,
        "Video conversion",
        run_converter(&config.sanjuuni_path, "Sanjuuni", &prefix, &args, progress),
    )
    .await;
    finalize_artifact(result, &part, &dest)
}

async fn run_converter(
    program: &str,
    name: &str,
    prefix: &str,
    args: &[String],
    progress: &ProgressSink,
) -> Result<()> {
    let status = runner::run_with_live_output(program, args, |line| {
        console::debug(format!("{prefix} {line}"));
        progress.status(line);
    })
    .await?;
    if !status.success() {
        bail!("{name} exited with {status}");
    }
    Ok(())
}

/// Converters write to a `.part` path; only a clean exit promotes it to the
/// real artifact name, so an existing artifact always means a completed
/// conversion.
fn finalize_artifact(result: Result<()>, part: &Path, dest: &Path) -> Result<()> {
    match result {
        Ok(()) => std::fs::rename(part, dest)
            .with_context(|| format!("finalizing {}", dest.display())),
        Err(err) => {
            let _ = std::fs::remove_file(part);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MediaHandle;
    use async_trait::async_trait;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct StubResolver {
        handle: MediaHandle,
        full: Option<MediaHandle>,
        resolve_calls: AtomicUsize,
        download_calls: AtomicUsize,
        download_delay: Duration,
    }

    impl StubResolver {
        fn returning(handle: MediaHandle) -> Self {
            Self {
                handle,
                full: None,
                resolve_calls: AtomicUsize::new(0),
                download_calls: AtomicUsize::new(0),
                download_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl MediaResolver for StubResolver {
        async fn resolve(&self, _query: &str, flat: bool) -> Result<MediaHandle> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            if !flat && let Some(full) = &self.full {
                return Ok(full.clone());
            }
            Ok(self.handle.clone())
        }

        async fn download(
            &self,
            _handle: &MediaHandle,
            _want_video: bool,
            dest: &Path,
            on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<()> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.download_delay).await;
            std::fs::write(dest.join("abc.mp4"), b"raw media bytes").unwrap();
            on_line("download 100.0% ETA 00:00");
            Ok(())
        }
    }

    fn video_handle(id: &str) -> MediaHandle {
        MediaHandle {
            id: Some(id.to_string()),
            title: Some("A test clip".to_string()),
            extractor: Some("youtube".to_string()),
            view_count: Some(100),
            like_count: Some(10),
            ..MediaHandle::default()
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    /// Copies `$3` (the `-i` argument) to the last argument, like ffmpeg
    /// writing its output file, and optionally logs each run.
    fn install_fake_ffmpeg(dir: &Path, counter: Option<&Path>) {
        let log = counter
            .map(|path| format!("echo run >> {}\n", path.display()))
            .unwrap_or_default();
        write_script(
            dir,
            "fake-ffmpeg",
            &format!(
                "#!/bin/sh\n{log}for arg in \"$@\"; do out=\"$arg\"; done\necho 'size= 1kB time=00:00:01'\ncp \"$3\" \"$out\"\n"
            ),
        );
    }

    /// Writes two frame lines to the path following `-o`.
    fn install_fake_sanjuuni(dir: &Path, counter: Option<&Path>) {
        let log = counter
            .map(|path| format!("echo run >> {}\n", path.display()))
            .unwrap_or_default();
        write_script(
            dir,
            "fake-sanjuuni",
            &format!(
                "#!/bin/sh\n{log}next=0\nfor arg in \"$@\"; do\n  if [ \"$next\" = 1 ]; then out=\"$arg\"; next=0; fi\n  if [ \"$arg\" = \"-o\" ]; then next=1; fi\ndone\nprintf 'frame one\\nframe two\\n' > \"$out\"\necho '100%'\n"
            ),
        );
    }

    fn test_config(root: &Path, bin: &Path) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            media_root: root.to_path_buf(),
            ffmpeg_path: bin.join("fake-ffmpeg").to_string_lossy().into_owned(),
            sanjuuni_path: bin.join("fake-sanjuuni").to_string_lossy().into_owned(),
            ytdlp_path: "yt-dlp".to_string(),
            disable_opencl: false,
            cleanup_interval: 0,
            cleanup_after: 0,
            spotify_client_id: None,
            spotify_client_secret: None,
            no_color: true,
            max_video_width: 328,
            max_video_height: 243,
            resolve_timeout: 30,
            convert_timeout: 30,
        }
    }

    fn sink() -> (ProgressSink, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProgressSink::new(tx), rx)
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn converts_both_artifacts_and_reports_files() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        install_fake_ffmpeg(bin.path(), None);
        install_fake_sanjuuni(bin.path(), None);
        let config = test_config(root.path(), bin.path());
        let resolver = StubResolver::returning(video_handle("abc"));
        let locks = ConversionLocks::default();
        let (progress, rx) = sink();

        let (payload, files) = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/video",
            Some(200),
            Some(150),
            &progress,
        )
        .await
        .unwrap();

        assert_eq!(payload.id, "abc");
        assert_eq!(payload.view_count, Some(100));
        assert!(payload.playlist_videos.is_empty());
        assert_eq!(
            files,
            vec!["abc.dfpwm".to_string(), "abc_200_150.32vid".to_string()]
        );
        assert!(root.path().join("abc.dfpwm").exists());
        assert!(root.path().join("abc_200_150.32vid").exists());
        // No stray .part files once conversion finished.
        assert!(!root.path().join("abc.dfpwm.part").exists());

        let messages = drain(rx);
        assert!(messages.iter().any(|m| m.contains("Converting audio")));
        assert!(messages.iter().any(|m| m.contains("Converting video")));
        assert!(messages.iter().any(|m| m.contains("download 100.0%")));
    }

    #[tokio::test]
    async fn oversized_requests_convert_at_capped_dimensions() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        install_fake_ffmpeg(bin.path(), None);
        install_fake_sanjuuni(bin.path(), None);
        let config = test_config(root.path(), bin.path());
        let resolver = StubResolver::returning(video_handle("abc"));
        let locks = ConversionLocks::default();

        let (_, files) = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/video",
            Some(1920),
            Some(1080),
            &ProgressSink::discard(),
        )
        .await
        .unwrap();

        assert!(files.contains(&"abc_328_184.32vid".to_string()));
    }

    #[tokio::test]
    async fn existing_artifacts_skip_download_entirely() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let config = test_config(root.path(), bin.path());
        std::fs::write(root.path().join("abc.dfpwm"), b"audio").unwrap();
        std::fs::write(root.path().join("abc_200_150.32vid"), b"frames\n").unwrap();
        let resolver = StubResolver::returning(video_handle("abc"));
        let locks = ConversionLocks::default();

        let (_, files) = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/video",
            Some(200),
            Some(150),
            &ProgressSink::discard(),
        )
        .await
        .unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(resolver.download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_convert_each_artifact_once() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let audio_counter = bin.path().join("audio-runs");
        let video_counter = bin.path().join("video-runs");
        install_fake_ffmpeg(bin.path(), Some(&audio_counter));
        install_fake_sanjuuni(bin.path(), Some(&video_counter));
        let config = test_config(root.path(), bin.path());
        let mut resolver = StubResolver::returning(video_handle("abc"));
        resolver.download_delay = Duration::from_millis(50);
        let locks = ConversionLocks::default();

        let first_sink = ProgressSink::discard();
        let second_sink = ProgressSink::discard();
        let first = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/video",
            Some(200),
            Some(150),
            &first_sink,
        );
        let second = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/video",
            Some(200),
            Some(150),
            &second_sink,
        );
        let (first, second) = tokio::join!(first, second);
        first.unwrap();
        second.unwrap();

        let audio_runs = std::fs::read_to_string(&audio_counter).unwrap();
        let video_runs = std::fs::read_to_string(&video_counter).unwrap();
        assert_eq!(audio_runs.lines().count(), 1);
        assert_eq!(video_runs.lines().count(), 1);
        assert_eq!(resolver.download_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn live_media_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let config = test_config(root.path(), bin.path());
        let mut handle = video_handle("abc");
        handle.is_live = Some(true);
        let resolver = StubResolver::returning(handle);
        let locks = ConversionLocks::default();

        let err = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/live",
            None,
            None,
            &ProgressSink::discard(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Livestreams are not supported");
        assert_eq!(resolver.download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn playlists_return_the_remainder_for_the_client() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        install_fake_ffmpeg(bin.path(), None);
        let config = test_config(root.path(), bin.path());
        let playlist = MediaHandle {
            kind: Some("playlist".to_string()),
            entries: vec![
                json!({"id": "one", "title": "First", "view_count": 1, "like_count": 1}),
                json!({"id": "two", "title": "Second"}),
                json!({"id": "three", "title": "Third"}),
            ],
            ..MediaHandle::default()
        };
        let resolver = StubResolver::returning(playlist);
        let locks = ConversionLocks::default();

        let (payload, files) = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/playlist",
            None,
            None,
            &ProgressSink::discard(),
        )
        .await
        .unwrap();

        assert_eq!(payload.id, "one");
        assert_eq!(
            payload.playlist_videos,
            vec!["two".to_string(), "three".to_string()]
        );
        assert_eq!(files, vec!["one.dfpwm".to_string()]);
    }

    #[tokio::test]
    async fn flat_entries_get_one_full_re_resolve() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        install_fake_ffmpeg(bin.path(), None);
        let config = test_config(root.path(), bin.path());
        let playlist = MediaHandle {
            kind: Some("playlist".to_string()),
            entries: vec![json!({"id": "one", "extractor": "youtube"})],
            ..MediaHandle::default()
        };
        let mut resolver = StubResolver::returning(playlist);
        resolver.full = Some(video_handle("one"));
        let locks = ConversionLocks::default();

        let (payload, _) = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/playlist",
            None,
            None,
            &ProgressSink::discard(),
        )
        .await
        .unwrap();

        assert_eq!(resolver.resolve_calls.load(Ordering::SeqCst), 2);
        assert_eq!(payload.view_count, Some(100));
        assert_eq!(payload.like_count, Some(10));
    }

    #[tokio::test]
    async fn failed_video_conversion_keeps_the_audio() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        install_fake_ffmpeg(bin.path(), None);
        write_script(bin.path(), "fake-sanjuuni", "#!/bin/sh\necho broken\nexit 1\n");
        let config = test_config(root.path(), bin.path());
        let resolver = StubResolver::returning(video_handle("abc"));
        let locks = ConversionLocks::default();
        let (progress, rx) = sink();

        let (_, files) = produce(
            &config,
            &resolver,
            None,
            &locks,
            "https://example.test/video",
            Some(200),
            Some(150),
            &progress,
        )
        .await
        .unwrap();

        assert_eq!(files, vec!["abc.dfpwm".to_string()]);
        assert!(!root.path().join("abc_200_150.32vid").exists());
        assert!(!root.path().join("abc_200_150.32vid.part").exists());

        let messages = drain(rx);
        assert!(messages.iter().any(|m| m.contains("Failed to convert video")));
    }
}
