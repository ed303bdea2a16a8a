#![forbid(unsafe_code)]

//! Spotify link resolution.
//!
//! Spotify content cannot be downloaded directly; a link is translated into
//! something the media resolver can search for. A track or episode becomes a
//! text query ("artist - title"), while collections (albums, playlists,
//! artists, shows, user profiles) become a list of track URIs whose first
//! entry is resolved immediately and the rest handed back to the client.
//!
//! All HTTP calls are blocking (`ureq`), so callers run them inside
//! `spawn_blocking`. The client-credentials token is cached in memory until
//! shortly before it expires.

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::{Duration, Instant};

const ACCOUNTS_URL: &str = "https://accounts.spotify.com/api/token";
const API_URL: &str = "https://api.spotify.com/v1";
const DEFAULT_MARKET: &str = "US";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Track,
    Album,
    Playlist,
    Artist,
    Show,
    Episode,
    User,
}

impl ResourceKind {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "track" => Some(Self::Track),
            "album" => Some(Self::Album),
            "playlist" => Some(Self::Playlist),
            "artist" => Some(Self::Artist),
            "show" => Some(Self::Show),
            "episode" => Some(Self::Episode),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// A recognized Spotify reference: resource kind plus its base-62 id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpotifyRef {
    pub kind: ResourceKind,
    pub id: String,
}

/// What a reference resolves to.
#[derive(Debug, PartialEq, Eq)]
pub enum SpotifyTarget {
    /// A search query for the media resolver.
    Query(String),
    /// Track/episode URIs, in playback order.
    List(Vec<String>),
}

/// Recognizes `spotify:<kind>:<id>` URIs and `open.spotify.com` URLs
/// (including the localized `/intl-xx/` path form). Anything else is not a
/// Spotify link and returns `None`.
pub fn recognize(url: &str) -> Option<SpotifyRef> {
    let url = url.trim();

    if let Some(rest) = url.strip_prefix("spotify:") {
        let mut parts = rest.split(':');
        let kind = ResourceKind::parse(parts.next()?)?;
        let id = parts.next()?;
        return valid_id(id).then(|| SpotifyRef {
            kind,
            id: id.to_string(),
        });
    }

    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let rest = rest.strip_prefix("open.spotify.com/")?;

    let mut segments = rest.split('/');
    let mut first = segments.next()?;
    if first.starts_with("intl-") {
        first = segments.next()?;
    }
    let kind = ResourceKind::parse(first)?;
    let id = segments.next()?.split(['?', '#']).next()?;
    valid_id(id).then(|| SpotifyRef {
        kind,
        id: id.to_string(),
    })
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct SpotifyResolver {
    agent: ureq::Agent,
    client_id: String,
    client_secret: String,
    market: String,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyResolver {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            market: DEFAULT_MARKET.to_string(),
            token: Mutex::new(None),
        }
    }

    /// Resolves a recognized reference through the Web API. Blocking.
    pub fn resolve_ref(&self, reference: &SpotifyRef) -> Result<SpotifyTarget> {
        let id = &reference.id;
        match reference.kind {
            ResourceKind::Track => {
                let track = self.api_get(&format!("tracks/{id}"))?;
                Ok(SpotifyTarget::Query(track_query(&track)?))
            }
            ResourceKind::Album => {
                let tracks = self.api_get(&format!("albums/{id}/tracks"))?;
                Ok(SpotifyTarget::List(collect_uris(&tracks["items"])))
            }
            ResourceKind::Playlist => {
                let items = self.api_get(&format!("playlists/{id}/tracks"))?;
                let uris = items["items"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| item["track"]["uri"].as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(SpotifyTarget::List(uris))
            }
            ResourceKind::Artist => {
                let top = self.api_get(&format!("artists/{id}/top-tracks?market={}", self.market))?;
                Ok(SpotifyTarget::List(collect_uris(&top["tracks"])))
            }
            ResourceKind::Show => {
                let episodes =
                    self.api_get(&format!("shows/{id}/episodes?market={}", self.market))?;
                Ok(SpotifyTarget::List(collect_uris(&episodes["items"])))
            }
            ResourceKind::Episode => {
                let episode = self.api_get(&format!("episodes/{id}?market={}", self.market))?;
                Ok(SpotifyTarget::Query(episode_query(&episode)?))
            }
            ResourceKind::User => {
                // A user link plays their first public playlist.
                let playlists = self.api_get(&format!("users/{id}/playlists"))?;
                let first = playlists["items"][0]["id"]
                    .as_str()
                    .context("user has no playlists")?
                    .to_string();
                self.resolve_ref(&SpotifyRef {
                    kind: ResourceKind::Playlist,
                    id: first,
                })
            }
        }
    }

    fn api_get(&self, path: &str) -> Result<Value> {
        let token = self.token()?;
        self.agent
            .get(&format!("{API_URL}/{path}"))
            .set("Authorization", &format!("Bearer {token}"))
            .call()
            .with_context(|| format!("requesting Spotify {path}"))?
            .into_json::<Value>()
            .with_context(|| format!("decoding Spotify {path} response"))
    }

    fn token(&self) -> Result<String> {
        {
            let cached = self.token.lock();
            if let Some(token) = cached.as_ref()
                && token.expires_at > Instant::now()
            {
                return Ok(token.value.clone());
            }
        }

        let credentials = BASE64.encode(format!("{}:{}", self.client_id, self.client_secret));
        let response: Value = self
            .agent
            .post(ACCOUNTS_URL)
            .set("Authorization", &format!("Basic {credentials}"))
            .send_form(&[("grant_type", "client_credentials")])
            .context("requesting Spotify access token")?
            .into_json()
            .context("decoding Spotify token response")?;

        let value = response["access_token"]
            .as_str()
            .context("Spotify token response had no access_token")?
            .to_string();
        let expires_in = response["expires_in"].as_u64().unwrap_or(3600);

        let mut cached = self.token.lock();
        *cached = Some(CachedToken {
            value: value.clone(),
            // Refresh a minute early so an in-flight call never carries an
            // expired token.
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
        Ok(value)
    }
}

fn track_query(track: &Value) -> Result<String> {
    let artist = track["artists"][0]["name"]
        .as_str()
        .context("track response had no artist")?;
    let name = track["name"].as_str().context("track response had no name")?;
    Ok(format!("{artist} - {name}"))
}

fn episode_query(episode: &Value) -> Result<String> {
    let publisher = episode["show"]["publisher"].as_str().unwrap_or_default();
    let show = episode["show"]["name"].as_str().unwrap_or_default();
    let name = episode["name"]
        .as_str()
        .context("episode response had no name")?;
    Ok(format!("{publisher} - {show} - {name}"))
}

fn collect_uris(items: &Value) -> Vec<String> {
    items
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["uri"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reference(kind: ResourceKind, id: &str) -> Option<SpotifyRef> {
        Some(SpotifyRef {
            kind,
            id: id.to_string(),
        })
    }

    #[test]
    fn recognizes_uris_and_urls() {
        assert_eq!(
            recognize("spotify:track:6rqhFgbbKwnb9MLmUQDhG6"),
            reference(ResourceKind::Track, "6rqhFgbbKwnb9MLmUQDhG6")
        );
        assert_eq!(
            recognize("https://open.spotify.com/album/2Kh43m04B1UkVcpcRa1Zug"),
            reference(ResourceKind::Album, "2Kh43m04B1UkVcpcRa1Zug")
        );
        assert_eq!(
            recognize("https://open.spotify.com/playlist/1Ze30K0U9OYtQZsQS1vIPj?si=x#frag"),
            reference(ResourceKind::Playlist, "1Ze30K0U9OYtQZsQS1vIPj")
        );
        assert_eq!(
            recognize("https://open.spotify.com/intl-de/artist/64tJ2EAv1R6UaZqc4iOCyj"),
            reference(ResourceKind::Artist, "64tJ2EAv1R6UaZqc4iOCyj")
        );
        assert_eq!(
            recognize("http://open.spotify.com/user/besdkg6w64xf0rt713643tgvt"),
            reference(ResourceKind::User, "besdkg6w64xf0rt713643tgvt")
        );
    }

    #[test]
    fn rejects_non_spotify_input() {
        assert_eq!(recognize("https://example.test/watch?v=abc"), None);
        assert_eq!(recognize("https://open.spotify.com/concert/xyz"), None);
        assert_eq!(recognize("https://open.spotify.com/track/"), None);
        assert_eq!(recognize("spotify:track:"), None);
        assert_eq!(recognize("spotify:track:../../etc"), None);
        assert_eq!(recognize("https://42"), None);
    }

    #[test]
    fn track_and_episode_queries_are_human_searchable() {
        let track = json!({
            "name": "Song Title",
            "artists": [{ "name": "Some Band" }],
        });
        assert_eq!(track_query(&track).unwrap(), "Some Band - Song Title");

        let episode = json!({
            "name": "Episode 12",
            "show": { "name": "The Show", "publisher": "A Network" },
        });
        assert_eq!(
            episode_query(&episode).unwrap(),
            "A Network - The Show - Episode 12"
        );
    }

    #[test]
    fn uri_collection_skips_malformed_items() {
        let items = json!([
            { "uri": "spotify:track:aaa" },
            { "name": "no uri here" },
            { "uri": "spotify:track:bbb" },
        ]);
        assert_eq!(
            collect_uris(&items),
            vec!["spotify:track:aaa".to_string(), "spotify:track:bbb".to_string()]
        );
        assert!(collect_uris(&json!(null)).is_empty());
    }
}
