use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;

use common::now_iso;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::media::{MediaFile, MediaLibrary};
use crate::resolver::SongIndex;
use crate::store::{dedup, Catalog};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeReason {
    RemovePlaylist { playlist_id: String, name: String },
    RemoveSongs,
    Cleanup,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SongAction {
    Remove,
    /// Keep the song with exactly these playlists.
    Keep { playlists: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongChange {
    pub song_id: String,
    #[serde(flatten)]
    pub action: SongAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ArtistAction {
    Purge,
    Keep { playlist_ids: Vec<String> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistChange {
    pub uri: String,
    #[serde(flatten)]
    pub action: ArtistAction,
}

/// Replacement song list for a playlist that survives the change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEdit {
    pub playlist_id: String,
    pub songs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DanglingReference {
    SongToPlaylist { song_id: String, playlist_id: String },
    PlaylistToSong { playlist_id: String, song_id: String },
    ArtistToPlaylist { uri: String, playlist_id: String },
}

/// A fully computed destructive change. Every target is absolute, so applying
/// the same set twice leaves the catalog as applying it once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub reason: ChangeReason,
    pub planned_at: String,
    #[serde(default)]
    pub playlists_removed: Vec<String>,
    #[serde(default)]
    pub songs: Vec<SongChange>,
    #[serde(default)]
    pub artists: Vec<ArtistChange>,
    #[serde(default)]
    pub playlist_edits: Vec<PlaylistEdit>,
    #[serde(default)]
    pub orphan_files: Vec<PathBuf>,
    #[serde(default)]
    pub dangling: Vec<DanglingReference>,
}

impl ChangeSet {
    fn new(reason: ChangeReason) -> Self {
        Self {
            reason,
            planned_at: now_iso(),
            playlists_removed: Vec::new(),
            songs: Vec::new(),
            artists: Vec::new(),
            playlist_edits: Vec::new(),
            orphan_files: Vec::new(),
            dangling: Vec::new(),
        }
    }

    pub fn songs_to_remove(&self) -> impl Iterator<Item = &str> {
        self.songs
            .iter()
            .filter(|change| change.action == SongAction::Remove)
            .map(|change| change.song_id.as_str())
    }

    pub fn songs_to_keep(&self) -> impl Iterator<Item = &str> {
        self.songs
            .iter()
            .filter(|change| matches!(change.action, SongAction::Keep { .. }))
            .map(|change| change.song_id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.playlists_removed.is_empty()
            && self.songs.is_empty()
            && self.artists.is_empty()
            && self.playlist_edits.is_empty()
            && self.orphan_files.is_empty()
    }

    pub fn summary(&self) -> ImpactSummary {
        let artists_purged = self
            .artists
            .iter()
            .filter(|change| change.action == ArtistAction::Purge)
            .count();
        ImpactSummary {
            playlists_removed: self.playlists_removed.len(),
            songs_removed: self.songs_to_remove().count(),
            songs_kept: self.songs_to_keep().count(),
            artists_purged,
            artists_kept: self.artists.len() - artists_purged,
            playlists_edited: self.playlist_edits.len(),
            orphan_files: self.orphan_files.len(),
            dangling: self.dangling.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImpactSummary {
    pub playlists_removed: usize,
    pub songs_removed: usize,
    pub songs_kept: usize,
    pub artists_purged: usize,
    pub artists_kept: usize,
    pub playlists_edited: usize,
    pub orphan_files: usize,
    pub dangling: usize,
}

impl fmt::Display for ImpactSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "playlists removed: {}", self.playlists_removed)?;
        writeln!(f, "songs removed:     {}", self.songs_removed)?;
        writeln!(f, "songs kept:        {}", self.songs_kept)?;
        writeln!(f, "artists purged:    {}", self.artists_purged)?;
        writeln!(f, "artists kept:      {}", self.artists_kept)?;
        writeln!(f, "playlists edited:  {}", self.playlists_edited)?;
        writeln!(f, "orphan files:      {}", self.orphan_files)?;
        write!(f, "dangling refs:     {}", self.dangling)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CleanupOptions {
    /// Also remove songs marked downloaded whose media file is gone.
    pub prune_missing_media: bool,
}

/// Plans the removal of one playlist and everything only it was holding up.
pub fn plan_playlist_removal(catalog: &Catalog, playlist_id: &str) -> ChangeSet {
    let name = catalog
        .playlist(playlist_id)
        .map(|playlist| playlist.name.clone())
        .unwrap_or_default();
    let mut change = ChangeSet::new(ChangeReason::RemovePlaylist {
        playlist_id: playlist_id.to_string(),
        name,
    });

    // Songs pointing at the playlist and songs the playlist lists; either side
    // may be stale.
    let mut affected: BTreeSet<&str> = catalog
        .songs()
        .filter(|(_, song)| song.has_playlist(playlist_id))
        .map(|(id, _)| id.as_str())
        .collect();
    if let Some(playlist) = catalog.playlist(playlist_id) {
        change.playlists_removed.push(playlist_id.to_string());
        for song_id in &playlist.songs {
            if catalog.song(song_id).is_some() {
                affected.insert(song_id.as_str());
            } else {
                change.dangling.push(DanglingReference::PlaylistToSong {
                    playlist_id: playlist_id.to_string(),
                    song_id: song_id.clone(),
                });
            }
        }
    }

    let mut removed = BTreeSet::new();
    for song_id in affected {
        let Some(song) = catalog.song(song_id) else {
            continue;
        };
        let remaining = surviving_playlists(
            catalog,
            &song.playlists,
            Some(playlist_id),
            |missing| DanglingReference::SongToPlaylist {
                song_id: song_id.to_string(),
                playlist_id: missing.to_string(),
            },
            &mut change.dangling,
        );
        let action = if remaining.is_empty() {
            removed.insert(song_id.to_string());
            SongAction::Remove
        } else {
            SongAction::Keep {
                playlists: remaining,
            }
        };
        change.songs.push(SongChange {
            song_id: song_id.to_string(),
            action,
        });
    }

    for (uri, artist) in catalog.artists() {
        if !artist.playlist_ids.iter().any(|p| p == playlist_id) {
            continue;
        }
        let remaining = surviving_playlists(
            catalog,
            &artist.playlist_ids,
            Some(playlist_id),
            |missing| DanglingReference::ArtistToPlaylist {
                uri: uri.clone(),
                playlist_id: missing.to_string(),
            },
            &mut change.dangling,
        );
        change.artists.push(artist_change(uri, remaining));
    }

    change.playlist_edits = edits_without(catalog, &removed, Some(playlist_id), &mut None);
    change
}

/// Plans the removal of specific songs. Playlists and artists stay; song lists
/// that mention the songs are edited.
pub fn plan_song_removal<S: AsRef<str>>(catalog: &Catalog, song_ids: &[S]) -> ChangeSet {
    let mut change = ChangeSet::new(ChangeReason::RemoveSongs);
    let mut removed = BTreeSet::new();
    for song_id in song_ids {
        let song_id = song_id.as_ref();
        if catalog.song(song_id).is_none() {
            warn!("Song {} is not in the catalog", song_id);
            continue;
        }
        if removed.insert(song_id.to_string()) {
            change.songs.push(SongChange {
                song_id: song_id.to_string(),
                action: SongAction::Remove,
            });
        }
    }
    change.playlist_edits = edits_without(catalog, &removed, None, &mut None);
    change
}

/// Plans a full repair pass: dangling references, songs no playlist holds,
/// artists no playlist holds, and media files no song owns.
pub fn plan_cleanup(catalog: &Catalog, options: &CleanupOptions, media: &[MediaFile]) -> ChangeSet {
    let mut change = ChangeSet::new(ChangeReason::Cleanup);
    let on_disk: HashSet<&str> = media.iter().map(|file| file.song_id.as_str()).collect();

    let mut removed = BTreeSet::new();
    for (song_id, song) in catalog.songs() {
        let remaining = surviving_playlists(
            catalog,
            &song.playlists,
            None,
            |missing| DanglingReference::SongToPlaylist {
                song_id: song_id.clone(),
                playlist_id: missing.to_string(),
            },
            &mut change.dangling,
        );
        let missing_media =
            options.prune_missing_media && song.is_downloaded() && !on_disk.contains(song_id.as_str());
        if remaining.is_empty() || missing_media {
            removed.insert(song_id.clone());
            change.songs.push(SongChange {
                song_id: song_id.clone(),
                action: SongAction::Remove,
            });
        } else if remaining != song.playlists {
            change.songs.push(SongChange {
                song_id: song_id.clone(),
                action: SongAction::Keep {
                    playlists: remaining,
                },
            });
        }
    }

    let mut dangling = Some(Vec::new());
    change.playlist_edits = edits_without(catalog, &removed, None, &mut dangling);
    change.dangling.extend(dangling.unwrap_or_default());

    for (uri, artist) in catalog.artists() {
        let remaining = surviving_playlists(
            catalog,
            &artist.playlist_ids,
            None,
            |missing| DanglingReference::ArtistToPlaylist {
                uri: uri.clone(),
                playlist_id: missing.to_string(),
            },
            &mut change.dangling,
        );
        if remaining.is_empty() || remaining != artist.playlist_ids {
            change.artists.push(artist_change(uri, remaining));
        }
    }

    change.orphan_files = media
        .iter()
        .filter(|file| catalog.song(&file.song_id).is_none())
        .map(|file| file.path.clone())
        .collect();
    change
}

/// Playlists from `ids` that exist and are not `excluding`, deduplicated.
/// Ids pointing nowhere are reported through `dangling`.
fn surviving_playlists(
    catalog: &Catalog,
    ids: &[String],
    excluding: Option<&str>,
    report: impl Fn(&str) -> DanglingReference,
    dangling: &mut Vec<DanglingReference>,
) -> Vec<String> {
    let mut kept = Vec::new();
    for id in dedup(ids) {
        if Some(id.as_str()) == excluding {
            continue;
        }
        if catalog.playlist(&id).is_some() {
            kept.push(id);
        } else {
            dangling.push(report(&id));
        }
    }
    kept
}

fn artist_change(uri: &str, remaining: Vec<String>) -> ArtistChange {
    let action = if remaining.is_empty() {
        ArtistAction::Purge
    } else {
        ArtistAction::Keep {
            playlist_ids: remaining,
        }
    };
    ArtistChange {
        uri: uri.to_string(),
        action,
    }
}

/// Song-list edits for every surviving playlist that mentions a removed song.
/// With `dangling` set, ids of songs that do not exist are dropped and reported too.
fn edits_without(
    catalog: &Catalog,
    removed: &BTreeSet<String>,
    excluding: Option<&str>,
    dangling: &mut Option<Vec<DanglingReference>>,
) -> Vec<PlaylistEdit> {
    let mut edits = Vec::new();
    for (playlist_id, playlist) in catalog.playlists() {
        if Some(playlist_id.as_str()) == excluding {
            continue;
        }
        let mut songs = Vec::with_capacity(playlist.songs.len());
        for song_id in dedup(&playlist.songs) {
            if removed.contains(&song_id) {
                continue;
            }
            if let Some(report) = dangling.as_mut() {
                if catalog.song(&song_id).is_none() {
                    report.push(DanglingReference::PlaylistToSong {
                        playlist_id: playlist_id.clone(),
                        song_id,
                    });
                    continue;
                }
            }
            songs.push(song_id);
        }
        if songs != playlist.songs {
            edits.push(PlaylistEdit {
                playlist_id: playlist_id.clone(),
                songs,
            });
        }
    }
    edits
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub songs_removed: usize,
    pub songs_updated: usize,
    pub artists_purged: usize,
    pub artists_updated: usize,
    pub playlists_removed: usize,
    pub playlists_edited: usize,
    pub media_deleted: usize,
}

/// Applies a planned change to the working set and deletes the media it names.
/// Nothing is persisted here.
pub fn apply(catalog: &mut Catalog, change: &ChangeSet, media: &mut dyn MediaLibrary) -> ApplyReport {
    let now = now_iso();
    let mut report = ApplyReport::default();
    let mut touched: BTreeSet<&str> = BTreeSet::new();

    for song_id in change.songs_to_remove() {
        touched.insert(song_id);
        if catalog.songs.songs.remove(song_id).is_some() {
            report.songs_removed += 1;
        }
        report.media_deleted += media.remove(song_id);
    }
    if report.songs_removed > 0 {
        // A surviving record may share a uri or name key with a removed one.
        catalog.index = SongIndex::build(&catalog.songs.songs);
    }

    for song_change in &change.songs {
        let SongAction::Keep { playlists } = &song_change.action else {
            continue;
        };
        touched.insert(song_change.song_id.as_str());
        if let Some(song) = catalog.songs.songs.get_mut(&song_change.song_id) {
            if song.playlists != *playlists {
                song.playlists = playlists.clone();
                report.songs_updated += 1;
            }
        }
    }

    for artist_change in &change.artists {
        match &artist_change.action {
            ArtistAction::Purge => {
                if catalog.artists.artists.remove(&artist_change.uri).is_some() {
                    report.artists_purged += 1;
                }
            }
            ArtistAction::Keep { playlist_ids } => {
                if let Some(artist) = catalog.artists.artists.get_mut(&artist_change.uri) {
                    if artist.playlist_ids != *playlist_ids {
                        artist.playlist_ids = playlist_ids.clone();
                        artist.last_updated = Some(now.clone());
                        report.artists_updated += 1;
                    }
                }
            }
        }
    }

    for playlist_id in &change.playlists_removed {
        if catalog.playlists.playlists.remove(playlist_id).is_some() {
            report.playlists_removed += 1;
        }
    }

    for edit in &change.playlist_edits {
        if let Some(playlist) = catalog.playlists.playlists.get_mut(&edit.playlist_id) {
            if playlist.songs != edit.songs {
                playlist.songs = edit.songs.clone();
                playlist.last_updated = Some(now.clone());
                report.playlists_edited += 1;
            }
        }
    }

    for path in &change.orphan_files {
        if path.is_file() && media.remove_file(path) {
            report.media_deleted += 1;
        }
    }

    catalog.sync_mapping(touched);
    info!(
        "Applied change: {} songs removed, {} artists purged, {} playlists removed",
        report.songs_removed, report.artists_purged, report.playlists_removed
    );
    report
}
