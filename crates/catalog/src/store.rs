use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use common::{ArtistRecord, DownloadStatus, Extra, Playlist, Song};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::resolver::SongIndex;
use crate::{CatalogError, PlaylistCandidate};

const JOURNAL_FILE: &str = "pending_change.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Songs,
    Playlists,
    Artists,
    Mapping,
}

impl StoreKind {
    pub const ALL: [StoreKind; 4] = [
        StoreKind::Songs,
        StoreKind::Playlists,
        StoreKind::Artists,
        StoreKind::Mapping,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            StoreKind::Songs => "songs_database.json",
            StoreKind::Playlists => "playlists_database.json",
            StoreKind::Artists => "artists_database.json",
            StoreKind::Mapping => "song_playlist_mapping.json",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StoreKind::Songs => "songs",
            StoreKind::Playlists => "playlists",
            StoreKind::Artists => "artists",
            StoreKind::Mapping => "mapping",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SongsDocument {
    #[serde(default)]
    pub songs: BTreeMap<String, Song>,
    #[serde(default)]
    pub total_songs: usize,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlaylistsDocument {
    #[serde(default)]
    pub playlists: BTreeMap<String, Playlist>,
    #[serde(default)]
    pub total_playlists: usize,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Artists keyed by uri.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArtistsDocument {
    #[serde(default)]
    pub artists: BTreeMap<String, ArtistRecord>,
    #[serde(default)]
    pub total_artists: usize,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Song id to playlist ids. Derived from the songs store on every save.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MappingDocument {
    #[serde(default)]
    pub mapping: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogPaths {
    pub metadata_dir: PathBuf,
    pub songs_dir: PathBuf,
}

impl CatalogPaths {
    pub fn new(metadata_dir: impl Into<PathBuf>, songs_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            songs_dir: songs_dir.into(),
        }
    }

    /// `<root>/metadata` and `<root>/songs`.
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("metadata"), root.join("songs"))
    }

    pub fn store(&self, kind: StoreKind) -> PathBuf {
        self.metadata_dir.join(kind.file_name())
    }

    pub fn journal(&self) -> PathBuf {
        self.metadata_dir.join(JOURNAL_FILE)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadReport {
    /// Stores with no file on disk; they start empty.
    pub missing: Vec<StoreKind>,
}

/// A consistency violation found by [`Catalog::problems`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Problem {
    MappingMismatch { song_id: String },
    MappingOrphan { song_id: String },
    SongWithoutPlaylists { song_id: String },
    SongToMissingPlaylist { song_id: String, playlist_id: String },
    PlaylistToMissingSong { playlist_id: String, song_id: String },
    ArtistToMissingPlaylist { uri: String, playlist_id: String },
    ArtistWithoutPlaylists { uri: String },
}

/// In-memory working set of the four stores plus the identity index.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    pub(crate) songs: SongsDocument,
    pub(crate) playlists: PlaylistsDocument,
    pub(crate) artists: ArtistsDocument,
    pub(crate) mapping: MappingDocument,
    pub(crate) index: SongIndex,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_documents(
        songs: SongsDocument,
        playlists: PlaylistsDocument,
        artists: ArtistsDocument,
        mapping: MappingDocument,
    ) -> Self {
        let index = SongIndex::build(&songs.songs);
        Self {
            songs,
            playlists,
            artists,
            mapping,
            index,
        }
    }

    /// Loads all four stores. A missing file yields an empty store; a file that
    /// does not parse is an error so nothing gets overwritten with less data.
    pub fn load(paths: &CatalogPaths) -> Result<(Self, LoadReport), CatalogError> {
        let mut report = LoadReport::default();
        let songs: SongsDocument = read_store(paths, StoreKind::Songs, &mut report)?;
        let playlists: PlaylistsDocument = read_store(paths, StoreKind::Playlists, &mut report)?;
        let artists: ArtistsDocument = read_store(paths, StoreKind::Artists, &mut report)?;
        let mapping: MappingDocument = read_store(paths, StoreKind::Mapping, &mut report)?;
        let catalog = Self::from_documents(songs, playlists, artists, mapping);
        info!(
            "Loaded catalog: {} songs, {} playlists, {} artists",
            catalog.song_count(),
            catalog.playlist_count(),
            catalog.artist_count()
        );
        Ok((catalog, report))
    }

    pub fn song(&self, song_id: &str) -> Option<&Song> {
        self.songs.songs.get(song_id)
    }

    pub fn songs(&self) -> impl Iterator<Item = (&String, &Song)> {
        self.songs.songs.iter()
    }

    pub fn song_count(&self) -> usize {
        self.songs.songs.len()
    }

    pub fn playlist(&self, playlist_id: &str) -> Option<&Playlist> {
        self.playlists.playlists.get(playlist_id)
    }

    pub fn playlists(&self) -> impl Iterator<Item = (&String, &Playlist)> {
        self.playlists.playlists.iter()
    }

    pub fn playlist_count(&self) -> usize {
        self.playlists.playlists.len()
    }

    pub fn artist(&self, uri: &str) -> Option<&ArtistRecord> {
        self.artists.artists.get(uri)
    }

    pub fn artists(&self) -> impl Iterator<Item = (&String, &ArtistRecord)> {
        self.artists.artists.iter()
    }

    pub fn artist_count(&self) -> usize {
        self.artists.artists.len()
    }

    pub fn mapping_for(&self, song_id: &str) -> Option<&[String]> {
        self.mapping.mapping.get(song_id).map(Vec::as_slice)
    }

    pub fn index(&self) -> &SongIndex {
        &self.index
    }

    /// Looks a playlist up by id, then by case-insensitive name, then by a
    /// partial name match in either direction.
    pub fn find_playlist(&self, query: &str) -> Result<String, CatalogError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CatalogError::PlaylistNotFound(query.to_string()));
        }
        if self.playlists.playlists.contains_key(query) {
            return Ok(query.to_string());
        }
        let needle = query.to_lowercase();

        let exact = self.playlist_candidates(|name| name == needle);
        match exact.len() {
            0 => {}
            1 => return Ok(exact[0].id.clone()),
            _ => return Err(CatalogError::AmbiguousPlaylist(exact)),
        }

        let partial = self.playlist_candidates(|name| {
            !name.is_empty() && (name.contains(needle.as_str()) || needle.contains(name))
        });
        match partial.len() {
            0 => Err(CatalogError::PlaylistNotFound(query.to_string())),
            1 => Ok(partial[0].id.clone()),
            _ => Err(CatalogError::AmbiguousPlaylist(partial)),
        }
    }

    fn playlist_candidates(&self, matches: impl Fn(&str) -> bool) -> Vec<PlaylistCandidate> {
        self.playlists
            .playlists
            .iter()
            .filter(|(_, playlist)| matches(playlist.name.trim().to_lowercase().as_str()))
            .map(|(id, playlist)| PlaylistCandidate {
                id: id.clone(),
                name: playlist.name.clone(),
            })
            .collect()
    }

    /// Marks the outcome of a download attempt on a song.
    pub fn record_download(&mut self, song_id: &str, file_path: Option<&Path>, now: &str) -> bool {
        let Some(song) = self.songs.songs.get_mut(song_id) else {
            return false;
        };
        match file_path {
            Some(path) => {
                song.download_info.status = DownloadStatus::Completed;
                song.download_info.file_path = Some(path.to_string_lossy().into_owned());
                song.download_info.downloaded_at = Some(now.to_string());
            }
            None => {
                song.download_info.status = DownloadStatus::Failed;
            }
        }
        true
    }

    /// Regenerates the whole mapping from the songs store.
    pub fn rebuild_mapping(&mut self) {
        self.mapping.mapping = self
            .songs
            .songs
            .iter()
            .map(|(id, song)| (id.clone(), dedup(&song.playlists)))
            .collect();
    }

    /// Regenerates mapping entries for the given songs only.
    pub(crate) fn sync_mapping<'a>(&mut self, song_ids: impl IntoIterator<Item = &'a str>) {
        for song_id in song_ids {
            match self.songs.songs.get(song_id) {
                Some(song) => {
                    let playlists = dedup(&song.playlists);
                    self.mapping.mapping.insert(song_id.to_string(), playlists);
                }
                None => {
                    self.mapping.mapping.remove(song_id);
                }
            }
        }
    }

    /// Recomputes store totals and per-playlist counters.
    pub fn refresh_counters(&mut self, now: &str) {
        let songs = &self.songs.songs;
        for playlist in self.playlists.playlists.values_mut() {
            playlist.total_tracks = playlist.songs.len();
            playlist.successful_downloads = playlist
                .songs
                .iter()
                .filter(|id| songs.get(id.as_str()).is_some_and(Song::is_downloaded))
                .count();
        }
        self.songs.total_songs = self.songs.songs.len();
        self.playlists.total_playlists = self.playlists.playlists.len();
        self.artists.total_artists = self.artists.artists.len();
        self.songs.last_updated = Some(now.to_string());
        self.playlists.last_updated = Some(now.to_string());
        self.artists.last_updated = Some(now.to_string());
        self.mapping.last_updated = Some(now.to_string());
    }

    pub(crate) fn document_bytes(&self, kind: StoreKind) -> Result<Vec<u8>, serde_json::Error> {
        match kind {
            StoreKind::Songs => serde_json::to_vec_pretty(&self.songs),
            StoreKind::Playlists => serde_json::to_vec_pretty(&self.playlists),
            StoreKind::Artists => serde_json::to_vec_pretty(&self.artists),
            StoreKind::Mapping => serde_json::to_vec_pretty(&self.mapping),
        }
    }

    /// Every cross-store rule the catalog is supposed to hold.
    pub fn problems(&self) -> Vec<Problem> {
        let mut problems = Vec::new();
        for (song_id, song) in &self.songs.songs {
            if song.playlists.is_empty() {
                problems.push(Problem::SongWithoutPlaylists {
                    song_id: song_id.clone(),
                });
            }
            for playlist_id in &song.playlists {
                if !self.playlists.playlists.contains_key(playlist_id) {
                    problems.push(Problem::SongToMissingPlaylist {
                        song_id: song_id.clone(),
                        playlist_id: playlist_id.clone(),
                    });
                }
            }
            let expected: BTreeSet<&String> = song.playlists.iter().collect();
            let mapped: Option<BTreeSet<&String>> = self
                .mapping
                .mapping
                .get(song_id)
                .map(|list| list.iter().collect());
            if mapped.as_ref() != Some(&expected) {
                problems.push(Problem::MappingMismatch {
                    song_id: song_id.clone(),
                });
            }
        }
        for song_id in self.mapping.mapping.keys() {
            if !self.songs.songs.contains_key(song_id) {
                problems.push(Problem::MappingOrphan {
                    song_id: song_id.clone(),
                });
            }
        }
        for (playlist_id, playlist) in &self.playlists.playlists {
            for song_id in &playlist.songs {
                if !self.songs.songs.contains_key(song_id) {
                    problems.push(Problem::PlaylistToMissingSong {
                        playlist_id: playlist_id.clone(),
                        song_id: song_id.clone(),
                    });
                }
            }
        }
        for (uri, artist) in &self.artists.artists {
            if artist.playlist_ids.is_empty() {
                problems.push(Problem::ArtistWithoutPlaylists { uri: uri.clone() });
            }
            for playlist_id in &artist.playlist_ids {
                if !self.playlists.playlists.contains_key(playlist_id) {
                    problems.push(Problem::ArtistToMissingPlaylist {
                        uri: uri.clone(),
                        playlist_id: playlist_id.clone(),
                    });
                }
            }
        }
        problems
    }
}

fn read_store<T: DeserializeOwned + Default>(
    paths: &CatalogPaths,
    kind: StoreKind,
    report: &mut LoadReport,
) -> Result<T, CatalogError> {
    let path = paths.store(kind);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!("No {} store at {:?}; starting empty", kind, path);
            report.missing.push(kind);
            return Ok(T::default());
        }
        Err(err) => return Err(CatalogError::Io(err)),
    };
    serde_json::from_slice(&bytes).map_err(|err| CatalogError::Document { store: kind, err })
}

pub(crate) fn dedup(values: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .iter()
        .filter(|value| seen.insert(value.as_str()))
        .cloned()
        .collect()
}
