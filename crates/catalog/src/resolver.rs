use std::collections::{BTreeMap, HashMap};

use common::{normalize_component, now_iso, song_id_for_key, Song, TrackDescriptor};
use tracing::{debug, warn};

use crate::store::Catalog;

/// Lookup tables from source uri and normalized name key to song id.
#[derive(Clone, Debug, Default)]
pub struct SongIndex {
    by_uri: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl SongIndex {
    pub fn build(songs: &BTreeMap<String, Song>) -> Self {
        let mut index = Self::default();
        for (song_id, song) in songs {
            for uri in song.uris() {
                index
                    .by_uri
                    .entry(uri.to_string())
                    .or_insert_with(|| song_id.clone());
            }
            if let Some(key) = song.name_key() {
                // Legacy stores can hold two records with the same name key;
                // the one carrying the derived id wins.
                if song_id_for_key(&key) == *song_id {
                    index.by_name.insert(key, song_id.clone());
                } else {
                    index.by_name.entry(key).or_insert_with(|| song_id.clone());
                }
            }
        }
        index
    }

    pub fn by_uri(&self, uri: &str) -> Option<&str> {
        self.by_uri.get(uri).map(String::as_str)
    }

    pub fn by_name(&self, key: &str) -> Option<&str> {
        self.by_name.get(key).map(String::as_str)
    }

    pub fn uri_count(&self) -> usize {
        self.by_uri.len()
    }

    pub fn name_count(&self) -> usize {
        self.by_name.len()
    }

    pub(crate) fn insert_uri(&mut self, uri: &str, song_id: &str) {
        self.by_uri.insert(uri.to_string(), song_id.to_string());
    }

    /// Indexes `key` unless it already points at another record.
    pub(crate) fn insert_name_if_vacant(&mut self, key: &str, song_id: &str) {
        self.by_name
            .entry(key.to_string())
            .or_insert_with(|| song_id.to_string());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKey {
    Uri,
    Name,
    /// No index entry, but a record already sits under the derived id.
    Id,
}

/// An incoming uri that differs from the one already stored on the matched song.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UriConflict {
    pub song_id: String,
    pub stored_uri: String,
    pub incoming_uri: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    MissingTitle,
    MissingArtist,
    MissingPlaylist,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SkipReason::MissingTitle => "missing title",
            SkipReason::MissingArtist => "missing artist",
            SkipReason::MissingPlaylist => "missing playlist id",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Existing {
        song_id: String,
        matched: MatchKey,
        conflict: Option<UriConflict>,
    },
    New {
        song_id: String,
    },
    Skipped(SkipReason),
}

impl Resolution {
    pub fn song_id(&self) -> Option<&str> {
        match self {
            Resolution::Existing { song_id, .. } | Resolution::New { song_id } => {
                Some(song_id.as_str())
            }
            Resolution::Skipped(_) => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Resolution::New { .. })
    }
}

impl Catalog {
    /// Maps a descriptor to exactly one song record, creating it when nothing
    /// matches. Uri lookup comes first, then the normalized name key.
    pub fn resolve(&mut self, descriptor: &TrackDescriptor) -> Resolution {
        let Some(key) = descriptor.name_key() else {
            let reason = if normalize_component(&descriptor.title).is_empty() {
                SkipReason::MissingTitle
            } else {
                SkipReason::MissingArtist
            };
            warn!("Skipping descriptor {:?}: {}", descriptor.title, reason);
            return Resolution::Skipped(reason);
        };
        let uri = descriptor
            .source_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty());

        if let Some(uri) = uri {
            if let Some(song_id) = self.live_id(self.index.by_uri(uri)) {
                self.index.insert_name_if_vacant(&key, &song_id);
                return Resolution::Existing {
                    song_id,
                    matched: MatchKey::Uri,
                    conflict: None,
                };
            }
        }

        if let Some(song_id) = self.live_id(self.index.by_name(&key)) {
            let conflict = self.learn_uri(&song_id, uri);
            return Resolution::Existing {
                song_id,
                matched: MatchKey::Name,
                conflict,
            };
        }

        let song_id = song_id_for_key(&key);
        if self.songs.songs.contains_key(&song_id) {
            self.index.insert_name_if_vacant(&key, &song_id);
            let conflict = self.learn_uri(&song_id, uri);
            return Resolution::Existing {
                song_id,
                matched: MatchKey::Id,
                conflict,
            };
        }

        let mut song = Song::from_descriptor(descriptor, now_iso());
        song.metadata.track_uri = uri.map(str::to_string);
        self.songs.songs.insert(song_id.clone(), song);
        if let Some(uri) = uri {
            self.index.insert_uri(uri, &song_id);
        }
        self.index.insert_name_if_vacant(&key, &song_id);
        debug!("New song {} for {:?}", song_id, descriptor.title);
        Resolution::New { song_id }
    }

    fn live_id(&self, hit: Option<&str>) -> Option<String> {
        hit.filter(|id| self.songs.songs.contains_key(*id))
            .map(str::to_string)
    }

    /// Attaches `uri` to a song matched by name. Fills an empty slot, otherwise
    /// keeps the stored uri and records the new one as an alias.
    fn learn_uri(&mut self, song_id: &str, uri: Option<&str>) -> Option<UriConflict> {
        let uri = uri?;
        let song = self.songs.songs.get_mut(song_id)?;
        if song.uris().any(|known| known == uri) {
            self.index.insert_uri(uri, song_id);
            return None;
        }
        let conflict = match song.metadata.track_uri.clone() {
            None => {
                song.metadata.track_uri = Some(uri.to_string());
                None
            }
            Some(stored_uri) => {
                song.metadata.alias_uris.push(uri.to_string());
                warn!(
                    "Song {} already has uri {}; keeping {} as an alias",
                    song_id, stored_uri, uri
                );
                Some(UriConflict {
                    song_id: song_id.to_string(),
                    stored_uri,
                    incoming_uri: uri.to_string(),
                })
            }
        };
        self.index.insert_uri(uri, song_id);
        conflict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{song_id, ArtistRef};

    fn descriptor(title: &str, artist: &str, uri: Option<&str>) -> TrackDescriptor {
        TrackDescriptor {
            title: title.into(),
            artists: vec![ArtistRef::new(artist, None)],
            source_uri: uri.map(String::from),
            playlist_id: "p1".into(),
            ..TrackDescriptor::default()
        }
    }

    #[test]
    fn same_uri_resolves_to_same_record() {
        let mut catalog = Catalog::empty();
        let first = catalog.resolve(&descriptor("Song", "Band", Some("track:1")));
        assert!(first.is_new());
        let second = catalog.resolve(&descriptor("Song (Remaster)", "Band", Some("track:1")));
        assert_eq!(second.song_id(), first.song_id());
        assert!(matches!(
            second,
            Resolution::Existing {
                matched: MatchKey::Uri,
                ..
            }
        ));
        assert_eq!(catalog.song_count(), 1);
    }

    #[test]
    fn name_match_is_case_and_punctuation_insensitive() {
        let mut catalog = Catalog::empty();
        let first = catalog.resolve(&descriptor("Hello, World!", "The Band", None));
        let second = catalog.resolve(&descriptor("hello world", "the band", None));
        assert_eq!(first.song_id(), second.song_id());
        assert_eq!(
            first.song_id().map(str::to_string),
            song_id("Hello, World!", "The Band")
        );
        assert_eq!(catalog.song_count(), 1);
    }

    #[test]
    fn uri_then_uriless_descriptor_converge() {
        let mut catalog = Catalog::empty();
        let first = catalog.resolve(&descriptor("A", "X", Some("u1")));
        let second = catalog.resolve(&descriptor("A", "X", None));
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.song_id(), second.song_id());
    }

    #[test]
    fn name_match_backfills_missing_uri() {
        let mut catalog = Catalog::empty();
        let first = catalog.resolve(&descriptor("Song", "Band", None));
        let id = first.song_id().unwrap().to_string();
        let second = catalog.resolve(&descriptor("Song", "Band", Some("track:9")));
        assert_eq!(
            second,
            Resolution::Existing {
                song_id: id.clone(),
                matched: MatchKey::Name,
                conflict: None
            }
        );
        assert_eq!(catalog.song(&id).unwrap().source_uri(), Some("track:9"));
        assert_eq!(catalog.index().by_uri("track:9"), Some(id.as_str()));
    }

    #[test]
    fn differing_uri_becomes_alias_not_overwrite() {
        let mut catalog = Catalog::empty();
        let first = catalog.resolve(&descriptor("Song", "Band", Some("track:1")));
        let id = first.song_id().unwrap().to_string();
        let second = catalog.resolve(&descriptor("Song", "Band", Some("track:2")));
        match second {
            Resolution::Existing {
                song_id,
                matched: MatchKey::Name,
                conflict: Some(conflict),
            } => {
                assert_eq!(song_id, id);
                assert_eq!(conflict.stored_uri, "track:1");
                assert_eq!(conflict.incoming_uri, "track:2");
            }
            other => panic!("unexpected resolution {:?}", other),
        }
        let song = catalog.song(&id).unwrap();
        assert_eq!(song.source_uri(), Some("track:1"));
        assert_eq!(song.metadata.alias_uris, vec!["track:2".to_string()]);

        let third = catalog.resolve(&descriptor("Other Title", "Band", Some("track:2")));
        assert_eq!(third.song_id(), Some(id.as_str()));
        assert_eq!(catalog.song_count(), 1);
    }

    #[test]
    fn blank_identity_is_skipped_without_side_effects() {
        let mut catalog = Catalog::empty();
        assert_eq!(
            catalog.resolve(&descriptor("  ", "Band", Some("track:1"))),
            Resolution::Skipped(SkipReason::MissingTitle)
        );
        assert_eq!(
            catalog.resolve(&descriptor("Song", "", None)),
            Resolution::Skipped(SkipReason::MissingArtist)
        );
        assert_eq!(catalog.song_count(), 0);
        assert_eq!(catalog.index().uri_count(), 0);
    }

    #[test]
    fn blank_uri_is_treated_as_absent() {
        let mut catalog = Catalog::empty();
        let first = catalog.resolve(&descriptor("Song", "Band", Some("   ")));
        let id = first.song_id().unwrap();
        assert_eq!(catalog.song(id).unwrap().source_uri(), None);
        assert_eq!(catalog.index().uri_count(), 0);
    }

    #[test]
    fn record_under_derived_id_is_found_without_index_entry() {
        let mut catalog = Catalog::empty();
        let first = catalog.resolve(&descriptor("Song", "Band", None));
        let id = first.song_id().unwrap().to_string();
        catalog.index = SongIndex::default();
        let second = catalog.resolve(&descriptor("Song", "Band", None));
        assert_eq!(
            second,
            Resolution::Existing {
                song_id: id,
                matched: MatchKey::Id,
                conflict: None
            }
        );
    }
}
