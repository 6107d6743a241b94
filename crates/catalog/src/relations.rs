use std::collections::btree_map::Entry;

use common::{ArtistRecord, Playlist};
use tracing::debug;

use crate::store::Catalog;

impl Catalog {
    /// Adds `playlist_id` to the song's playlist set. Returns true when the set changed.
    pub fn attach_playlist(&mut self, song_id: &str, playlist_id: &str) -> bool {
        match self.songs.songs.get_mut(song_id) {
            Some(song) if !song.has_playlist(playlist_id) => {
                song.playlists.push(playlist_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Records that an artist appears in a playlist. Artists are keyed by uri;
    /// a blank uri is ignored. References are only ever added here.
    pub fn upsert_artist(&mut self, uri: &str, name: &str, playlist_id: &str, now: &str) -> bool {
        let uri = uri.trim();
        if uri.is_empty() || playlist_id.is_empty() {
            return false;
        }
        match self.artists.artists.entry(uri.to_string()) {
            Entry::Vacant(slot) => {
                debug!("New artist {} ({})", name, uri);
                slot.insert(ArtistRecord::new(uri, name.trim(), playlist_id, now));
                true
            }
            Entry::Occupied(mut slot) => {
                let artist = slot.get_mut();
                let mut changed = false;
                if artist.name.trim().is_empty() && !name.trim().is_empty() {
                    artist.name = name.trim().to_string();
                    changed = true;
                }
                if !artist.playlist_ids.iter().any(|p| p == playlist_id) {
                    artist.playlist_ids.push(playlist_id.to_string());
                    changed = true;
                }
                if changed {
                    artist.last_updated = Some(now.to_string());
                }
                changed
            }
        }
    }

    /// Creates the playlist record on first sight; later calls refresh its
    /// name and source. Returns true when the record was created.
    pub fn ensure_playlist(
        &mut self,
        playlist_id: &str,
        name: &str,
        source_url: Option<&str>,
        now: &str,
    ) -> bool {
        let name = name.trim();
        let source_url = source_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(String::from);
        match self.playlists.playlists.entry(playlist_id.to_string()) {
            Entry::Vacant(slot) => {
                let display = if name.is_empty() { playlist_id } else { name };
                slot.insert(Playlist::new(display, source_url, now));
                true
            }
            Entry::Occupied(mut slot) => {
                let playlist = slot.get_mut();
                if !name.is_empty() && playlist.name != name {
                    playlist.name = name.to_string();
                    playlist.last_updated = Some(now.to_string());
                }
                if source_url.is_some() && playlist.source_url != source_url {
                    playlist.source_url = source_url;
                    playlist.last_updated = Some(now.to_string());
                }
                false
            }
        }
    }

    /// Appends the song to the playlist's ordered song list if it is not there yet.
    pub fn link_playlist_song(&mut self, playlist_id: &str, song_id: &str, now: &str) -> bool {
        match self.playlists.playlists.get_mut(playlist_id) {
            Some(playlist) if !playlist.contains(song_id) => {
                playlist.songs.push(song_id.to_string());
                playlist.last_updated = Some(now.to_string());
                true
            }
            _ => false,
        }
    }
}
