#![forbid(unsafe_code)]

//! Long-running media server for simulated-computer clients.
//!
//! Each client keeps one WebSocket open and speaks JSON envelopes over it:
//! `handshake`, `request_media`, `get_chunk` and `get_vid`. Two plain HTTP
//! routes expose the same chunk/page addressing as an alternate access path.
//! Artifacts are converted on demand by external tools, cached on disk and
//! evicted by a background sweep task when unused.

use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{ConnectInfo, Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use cubecast_tools::cache::{self, CacheStore};
use cubecast_tools::config::{ServerConfig, load_config};
use cubecast_tools::console;
use cubecast_tools::download::{ConversionLocks, ProgressSink, produce};
use cubecast_tools::media;
use cubecast_tools::paging;
use cubecast_tools::protocol::{self, Action};
use cubecast_tools::resolver::{MediaResolver, YtDlpResolver};
use cubecast_tools::security::{ensure_not_root, is_safe_media_id};
use cubecast_tools::spotify::SpotifyResolver;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::signal;
use tokio::sync::mpsc;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state injected into every handler. All of it is cheap to clone;
/// the mutable pieces live behind their own synchronization.
#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    cache: Arc<CacheStore>,
    locks: Arc<ConversionLocks>,
    resolver: Arc<dyn MediaResolver>,
    spotify: Option<Arc<SpotifyResolver>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    ensure_not_root("server")?;
    media::ensure_media_root(&config.media_root)?;

    warn_if_missing(&config.ffmpeg_path, "FFmpeg");
    warn_if_missing(&config.sanjuuni_path, "Sanjuuni");
    warn_if_missing(&config.ytdlp_path, "yt-dlp");

    let spotify = match config.spotify_credentials() {
        Some((id, secret)) => {
            console::info("Spotify playlist resolver enabled");
            Some(Arc::new(SpotifyResolver::new(id, secret)))
        }
        None => {
            console::info("Spotify playlist resolver disabled");
            None
        }
    };

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("parsing CUBECAST_HOST {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);

    let state = AppState {
        cache: Arc::new(CacheStore::new(config.media_root.clone())),
        locks: Arc::new(ConversionLocks::default()),
        resolver: Arc::new(YtDlpResolver::new(config.ytdlp_path.clone())),
        spotify,
        config: Arc::new(config),
    };

    // One sweeper per server instance, regardless of how many connections
    // are being multiplexed.
    let _sweeper = cache::spawn_sweeper(
        state.cache.clone(),
        state.config.cleanup_interval,
        state.config.cleanup_after,
    );

    let app = Router::new()
        .route("/", get(ws_upgrade))
        .route("/dfpwm/{id}/{chunkindex}", get(http_audio_chunk))
        .route("/32vid/{id}/{width}/{height}/{tracker}", get(http_video_page))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    console::info(format!("cubecast listening on {}", addr));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

/// Warns (rather than fails) when an external tool is absent: the server can
/// still page out previously converted artifacts without it.
fn warn_if_missing(program: &str, label: &str) {
    let available = std::process::Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !available {
        console::warn(format!("{label} not found."));
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, peer))
}

/// One connection, handled strictly sequentially: read a frame, dispatch,
/// respond, repeat. Status events produced while a request is in flight go
/// through the same outbound channel as the final response, so ordering on
/// the wire matches the order the pipeline emitted them.
async fn handle_connection(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let prefix = console::paint(
        console::BLUE,
        &format!("[{peer}]"),
        !state.config.no_color,
    );
    console::info(format!("{prefix} Connected"));

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(_) => break,
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; binary frames are
            // not part of this protocol.
            _ => continue,
        };
        if text.is_empty() {
            break;
        }
        console::debug(format!("{prefix} Message: {}", text.as_str()));

        let progress = ProgressSink::new(outbound.clone());
        if let Some(response) = handle_frame(&state, text.as_str(), &progress).await {
            let _ = outbound.send(response.to_string());
        }
    }

    console::info(format!("{prefix} Disconnected"));
    drop(outbound);
    let _ = writer.await;
}

/// Parses and dispatches one inbound frame. `None` means no response at all:
/// unknown (or absent) actions are deliberately ignored so newer clients can
/// probe for capabilities without breaking the connection.
async fn handle_frame(state: &AppState, text: &str, progress: &ProgressSink) -> Option<Value> {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => return Some(protocol::error_envelope("Failed to parse JSON")),
    };

    let action = message
        .get("action")
        .and_then(Value::as_str)
        .and_then(Action::parse)?;

    Some(match action {
        Action::Handshake => protocol::handshake_envelope(SERVER_VERSION),
        Action::RequestMedia => handle_request_media(state, &message, progress).await,
        Action::GetChunk => handle_get_chunk(state, &message).await,
        Action::GetVid => handle_get_vid(state, &message).await,
    })
}

async fn handle_request_media(state: &AppState, message: &Value, progress: &ProgressSink) -> Value {
    let url = match protocol::require_str(message, "url") {
        Ok(url) => url,
        Err(envelope) => return envelope,
    };
    let width = match protocol::optional_int(message, "width") {
        Ok(width) => width,
        Err(envelope) => return envelope,
    };
    let height = match protocol::optional_int(message, "height") {
        Ok(height) => height,
        Err(envelope) => return envelope,
    };

    match produce(
        &state.config,
        state.resolver.as_ref(),
        state.spotify.as_ref(),
        &state.locks,
        url,
        width,
        height,
        progress,
    )
    .await
    {
        Ok((payload, files)) => {
            for file in &files {
                state.cache.touch(file);
            }
            match serde_json::to_value(&payload) {
                Ok(value) => value,
                Err(err) => {
                    console::warn(format!("could not serialize media payload: {err}"));
                    protocol::error_envelope("Internal error")
                }
            }
        }
        Err(err) => protocol::error_envelope(&err.to_string()),
    }
}

async fn handle_get_chunk(state: &AppState, message: &Value) -> Value {
    let chunkindex = match protocol::require_int(message, "chunkindex") {
        Ok(chunkindex) => chunkindex,
        Err(envelope) => return envelope,
    };
    let media_id = match protocol::require_str(message, "id") {
        Ok(media_id) => media_id,
        Err(envelope) => return envelope,
    };

    if !is_safe_media_id(media_id) {
        console::warn("A client tried to use special characters in a media id");
        return protocol::error_envelope("You dare not use special Characters");
    }

    let file_name = media::audio_artifact_name(media_id);
    // Touch before the read so an artifact being streamed stays alive even
    // while a sweep is running.
    state.cache.touch(&file_name);

    if chunkindex < 0 {
        return protocol::error_envelope("Invalid chunk index");
    }

    match paging::read_audio_chunk(&state.config.media_root, &file_name, chunkindex as u64).await {
        Ok(chunk) => protocol::chunk_envelope(&chunk),
        Err(_) => protocol::error_envelope("Audio file not found"),
    }
}

async fn handle_get_vid(state: &AppState, message: &Value) -> Value {
    let tracker = match protocol::require_int(message, "tracker") {
        Ok(tracker) => tracker,
        Err(envelope) => return envelope,
    };
    let media_id = match protocol::require_str(message, "id") {
        Ok(media_id) => media_id,
        Err(envelope) => return envelope,
    };
    let width = match protocol::require_int(message, "width") {
        Ok(width) => width,
        Err(envelope) => return envelope,
    };
    let height = match protocol::require_int(message, "height") {
        Ok(height) => height,
        Err(envelope) => return envelope,
    };

    if !is_safe_media_id(media_id) {
        console::warn("A client tried to use special characters in a media id");
        return protocol::error_envelope("You dare not use special Characters");
    }

    // The same cap the conversion applied, so clients address artifacts with
    // the dimensions they originally asked for.
    let (width, height) = media::cap_dimensions(
        width,
        height,
        state.config.max_video_width,
        state.config.max_video_height,
    );
    let file_name = media::video_artifact_name(media_id, width, height);
    state.cache.touch(&file_name);

    if tracker < 0 {
        return protocol::error_envelope("Invalid tracker");
    }

    match paging::read_video_page(&state.config.media_root, &file_name, tracker as u64).await {
        Ok(page) => protocol::vid_envelope(&page.lines),
        Err(_) => protocol::error_envelope("Video file not found"),
    }
}

/// HTTP twin of `get_chunk`: raw chunk bytes, 404 when the artifact is not
/// there (or the id is unsafe).
async fn http_audio_chunk(
    AxumPath((media_id, chunkindex)): AxumPath<(String, u64)>,
    State(state): State<AppState>,
) -> Response {
    if !is_safe_media_id(&media_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let file_name = media::audio_artifact_name(&media_id);
    state.cache.touch(&file_name);

    match paging::read_audio_chunk(&state.config.media_root, &file_name, chunkindex).await {
        Ok(chunk) => chunk.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// HTTP twin of `get_vid`: one page of frame lines joined by newlines.
async fn http_video_page(
    AxumPath((media_id, width, height, tracker)): AxumPath<(String, i64, i64, u64)>,
    State(state): State<AppState>,
) -> Response {
    if !is_safe_media_id(&media_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let (width, height) = media::cap_dimensions(
        width,
        height,
        state.config.max_video_width,
        state.config.max_video_height,
    );
    let file_name = media::video_artifact_name(&media_id, width, height);
    state.cache.touch(&file_name);

    match paging::read_video_page(&state.config.media_root, &file_name, tracker).await {
        Ok(page) => page.lines.join("\n").into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
