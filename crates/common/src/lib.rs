use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

const KEY_SEP: char = '\x1f';
const SONG_ID_PREFIX: &str = "song_";
const SONG_ID_HEX_LEN: usize = 12;

/// Fields written by other tools that this crate does not model. Kept so a
/// load/save cycle never drops data.
pub type Extra = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistRef {
    #[serde(default)]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub uri: Option<String>,
}

impl ArtistRef {
    pub fn new(name: impl Into<String>, uri: Option<&str>) -> Self {
        Self {
            name: name.into(),
            uri: uri.map(str::trim).filter(|u| !u.is_empty()).map(String::from),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SongMetadata {
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artists_string: String,
    #[serde(default)]
    pub artists_info: Vec<ArtistRef>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub track_uri: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Other uris that resolved to this song by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alias_uris: Vec<String>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub cover_art_url: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DownloadInfo {
    #[serde(default)]
    pub status: DownloadStatus,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub file_path: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub downloaded_at: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Song {
    pub metadata: SongMetadata,
    #[serde(default)]
    pub playlists: Vec<String>,
    #[serde(default)]
    pub download_info: DownloadInfo,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub added_at: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Song {
    pub fn from_descriptor(descriptor: &TrackDescriptor, added_at: String) -> Self {
        Self {
            metadata: SongMetadata {
                track_name: descriptor.title.trim().to_string(),
                artists_string: descriptor.artist_string(),
                artists_info: descriptor.artists.clone(),
                track_uri: descriptor.source_uri.clone(),
                duration_ms: descriptor.duration_ms,
                alias_uris: Vec::new(),
                cover_art_url: None,
                extra: Extra::new(),
            },
            playlists: Vec::new(),
            download_info: DownloadInfo::default(),
            added_at: Some(added_at),
            extra: Extra::new(),
        }
    }

    pub fn source_uri(&self) -> Option<&str> {
        self.metadata.track_uri.as_deref()
    }

    /// The primary uri followed by every alias.
    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.metadata
            .track_uri
            .iter()
            .chain(self.metadata.alias_uris.iter())
            .map(String::as_str)
    }

    pub fn name_key(&self) -> Option<String> {
        name_key(&self.metadata.track_name, &self.metadata.artists_string)
    }

    pub fn has_playlist(&self, playlist_id: &str) -> bool {
        self.playlists.iter().any(|p| p == playlist_id)
    }

    pub fn is_downloaded(&self) -> bool {
        self.download_info.status == DownloadStatus::Completed
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub total_tracks: usize,
    #[serde(default)]
    pub successful_downloads: usize,
    #[serde(default, alias = "song_ids")]
    pub songs: Vec<String>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_url: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Playlist {
    pub fn new(name: impl Into<String>, source_url: Option<String>, now: &str) -> Self {
        Self {
            name: name.into(),
            source_url,
            created_at: Some(now.to_string()),
            last_updated: Some(now.to_string()),
            ..Self::default()
        }
    }

    pub fn contains(&self, song_id: &str) -> bool {
        self.songs.iter().any(|s| s == song_id)
    }

    /// Date part of `created_at`, for listings.
    pub fn created_date(&self) -> Option<&str> {
        self.created_at
            .as_deref()
            .map(|value| value.split('T').next().unwrap_or(value))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtistRecord {
    #[serde(default)]
    pub name: String,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub uri: Option<String>,
    #[serde(default)]
    pub playlist_ids: Vec<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl ArtistRecord {
    pub fn new(uri: &str, name: &str, playlist_id: &str, now: &str) -> Self {
        Self {
            name: name.to_string(),
            uri: Some(uri.to_string()),
            playlist_ids: vec![playlist_id.to_string()],
            created_at: Some(now.to_string()),
            last_updated: Some(now.to_string()),
            extra: Extra::new(),
        }
    }
}

/// One track as handed over by the scraping process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrackDescriptor {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub playlist_id: String,
    #[serde(default)]
    pub playlist_name: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub playlist_source: Option<String>,
}

impl TrackDescriptor {
    pub fn artist_string(&self) -> String {
        let names: Vec<&str> = self
            .artists
            .iter()
            .map(|a| a.name.trim())
            .filter(|name| !name.is_empty())
            .collect();
        names.join(", ")
    }

    pub fn name_key(&self) -> Option<String> {
        name_key(&self.title, &self.artist_string())
    }
}

/// Lowercases and keeps only alphanumeric characters.
pub fn normalize_component(value: &str) -> String {
    value
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Normalized title+artist key, `None` when either side normalizes to nothing.
pub fn name_key(title: &str, artist: &str) -> Option<String> {
    let title = normalize_component(title);
    let artist = normalize_component(artist);
    if title.is_empty() || artist.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(title.len() + artist.len() + 1);
    out.push_str(&title);
    out.push(KEY_SEP);
    out.push_str(&artist);
    Some(out)
}

pub fn song_id(title: &str, artist: &str) -> Option<String> {
    name_key(title, artist).map(|key| song_id_for_key(&key))
}

pub fn song_id_for_key(key: &str) -> String {
    let hex = stable_id(key);
    format!("{}{}", SONG_ID_PREFIX, &hex[..SONG_ID_HEX_LEN])
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn now_iso() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Compact timestamp for side-file names, e.g. `20260101_120000`.
pub fn file_stamp() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))
    .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("Artist/Album/Track.mp3");
        let second = stable_id("Artist/Album/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("Artist/Album/Track2.mp3"));
    }

    #[test]
    fn descriptor_without_playlist_still_parses() {
        let descriptor: TrackDescriptor =
            serde_json::from_str(r#"{"title":"Song","artists":[{"name":"Band"}]}"#).unwrap();
        assert_eq!(descriptor.title, "Song");
        assert!(descriptor.playlist_id.is_empty());
    }

    #[test]
    fn song_id_ignores_case_and_punctuation() {
        let a = song_id("Hello, World!", "The Band").unwrap();
        let b = song_id("hello world", "THE-BAND").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("song_"));
        assert_eq!(a.len(), "song_".len() + 12);
    }

    #[test]
    fn song_id_keeps_title_artist_boundary() {
        assert_ne!(song_id("ab", "c"), song_id("a", "bc"));
    }

    #[test]
    fn song_id_needs_both_parts() {
        assert!(song_id("", "X").is_none());
        assert!(song_id("A", "  ").is_none());
        assert!(song_id("!!!", "X").is_none());
    }

    #[test]
    fn non_latin_titles_normalize_to_something() {
        assert_eq!(normalize_component("Vaathi Coming"), "vaathicoming");
        assert!(!normalize_component("வாத்தி").is_empty());
    }

    #[test]
    fn descriptor_artist_string_skips_blank_names() {
        let descriptor = TrackDescriptor {
            title: "A".into(),
            artists: vec![
                ArtistRef::new("X", Some("artist:x")),
                ArtistRef::new(" ", None),
                ArtistRef::new("Y", None),
            ],
            playlist_id: "p1".into(),
            ..TrackDescriptor::default()
        };
        assert_eq!(descriptor.artist_string(), "X, Y");
        assert_eq!(descriptor.name_key(), name_key("A", "X, Y"));
    }

    #[test]
    fn blank_uris_deserialize_as_absent() {
        let song: Song = serde_json::from_value(serde_json::json!({
            "metadata": {
                "track_name": "A",
                "artists_string": "X",
                "track_uri": "",
                "album_name": "Artist Discography"
            },
            "playlists": ["p1"],
            "download_info": {"status": "completed", "file_path": null, "quality": "192K"},
            "added_at": "2024-01-01T00:00:00"
        }))
        .unwrap();
        assert_eq!(song.source_uri(), None);
        assert!(song.is_downloaded());
        assert_eq!(
            song.metadata.extra.get("album_name"),
            Some(&Value::from("Artist Discography"))
        );
        assert_eq!(song.download_info.extra.get("quality"), Some(&Value::from("192K")));
    }

    #[test]
    fn playlist_accepts_legacy_song_ids_key() {
        let playlist: Playlist = serde_json::from_value(serde_json::json!({
            "name": "Mix",
            "song_ids": ["song_a", "song_b"],
            "created_at": "2024-03-05T10:00:00"
        }))
        .unwrap();
        assert_eq!(playlist.songs, vec!["song_a", "song_b"]);
        assert_eq!(playlist.created_date(), Some("2024-03-05"));
    }
}
