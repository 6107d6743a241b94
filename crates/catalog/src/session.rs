use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{now_iso, DownloadStatus, TrackDescriptor};
use serde::Serialize;
use tracing::{info, warn};

use crate::media::{DownloadRequest, MediaLibrary};
use crate::resolver::{Resolution, SkipReason};
use crate::store::Catalog;
use crate::writer::{CatalogWriter, SaveMode, SaveReport};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub processed: usize,
    pub new_songs: usize,
    pub existing_songs: usize,
    pub playlist_links_added: usize,
    pub playlists_created: usize,
    pub artists_touched: usize,
    pub skipped: usize,
    /// Entries that did not parse as descriptors. Also counted in `skipped`.
    pub unreadable: usize,
    pub uri_conflicts: usize,
    pub checkpoints: usize,
    pub checkpoint_failures: usize,
    pub downloads_completed: usize,
    pub downloads_failed: usize,
    pub cancelled: bool,
}

/// Descriptors read from a batch file, plus how many entries were unusable.
#[derive(Clone, Debug, Default)]
pub struct DescriptorBatch {
    pub descriptors: Vec<TrackDescriptor>,
    pub unreadable: usize,
}

impl DescriptorBatch {
    /// Accepts a JSON array of descriptors or one descriptor per line. A bad
    /// entry is counted, not fatal; only an array that is not JSON at all
    /// fails.
    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        let mut batch = Self::default();
        if contents.trim_start().starts_with('[') {
            let entries: Vec<serde_json::Value> = serde_json::from_str(contents)?;
            for (position, entry) in entries.into_iter().enumerate() {
                match serde_json::from_value(entry) {
                    Ok(descriptor) => batch.descriptors.push(descriptor),
                    Err(err) => {
                        warn!("Skipping entry {}: {}", position + 1, err);
                        batch.unreadable += 1;
                    }
                }
            }
            return Ok(batch);
        }
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(descriptor) => batch.descriptors.push(descriptor),
                Err(err) => {
                    warn!("Skipping line {}: {}", number + 1, err);
                    batch.unreadable += 1;
                }
            }
        }
        Ok(batch)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackIngest {
    pub song_id: String,
    pub is_new: bool,
    /// The song gained this playlist.
    pub playlist_changed: bool,
    pub uri_conflict: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested(TrackIngest),
    Skipped(SkipReason),
}

/// One ingestion run over a catalog. Every descriptor is resolved and linked
/// in full before the next one starts, so a checkpoint never captures a
/// half-linked song.
pub struct IngestSession<'a> {
    catalog: &'a mut Catalog,
    writer: &'a CatalogWriter,
    checkpoint_interval: usize,
    since_checkpoint: usize,
    cancel: Option<Arc<AtomicBool>>,
    created: Vec<String>,
    stats: IngestStats,
}

impl<'a> IngestSession<'a> {
    pub fn new(catalog: &'a mut Catalog, writer: &'a CatalogWriter, checkpoint_interval: usize) -> Self {
        Self {
            catalog,
            writer,
            checkpoint_interval: checkpoint_interval.max(1),
            since_checkpoint: 0,
            cancel: None,
            created: Vec::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn catalog(&self) -> &Catalog {
        &*self.catalog
    }

    /// Songs created during this session, in creation order.
    pub fn created(&self) -> &[String] {
        &self.created
    }

    pub fn ingest(&mut self, descriptor: &TrackDescriptor) -> IngestOutcome {
        self.stats.processed += 1;
        let playlist_id = descriptor.playlist_id.trim();
        if playlist_id.is_empty() {
            warn!("Skipping {:?}: no playlist id", descriptor.title);
            self.stats.skipped += 1;
            return IngestOutcome::Skipped(SkipReason::MissingPlaylist);
        }

        let (song_id, is_new, uri_conflict) = match self.catalog.resolve(descriptor) {
            Resolution::Skipped(reason) => {
                self.stats.skipped += 1;
                return IngestOutcome::Skipped(reason);
            }
            Resolution::New { song_id } => (song_id, true, false),
            Resolution::Existing {
                song_id, conflict, ..
            } => (song_id, false, conflict.is_some()),
        };

        let now = now_iso();
        if self.catalog.ensure_playlist(
            playlist_id,
            &descriptor.playlist_name,
            descriptor.playlist_source.as_deref(),
            &now,
        ) {
            info!("New playlist {} ({})", descriptor.playlist_name, playlist_id);
            self.stats.playlists_created += 1;
        }
        let playlist_changed = self.catalog.attach_playlist(&song_id, playlist_id);
        self.catalog.link_playlist_song(playlist_id, &song_id, &now);
        for artist in &descriptor.artists {
            if let Some(uri) = artist.uri.as_deref() {
                if self.catalog.upsert_artist(uri, &artist.name, playlist_id, &now) {
                    self.stats.artists_touched += 1;
                }
            }
        }

        if is_new {
            self.stats.new_songs += 1;
            self.created.push(song_id.clone());
        } else {
            self.stats.existing_songs += 1;
        }
        if playlist_changed {
            self.stats.playlist_links_added += 1;
        }
        if uri_conflict {
            self.stats.uri_conflicts += 1;
        }
        self.tick();

        IngestOutcome::Ingested(TrackIngest {
            song_id,
            is_new,
            playlist_changed,
            uri_conflict,
        })
    }

    /// Ingests descriptors until the input runs out or the session is cancelled.
    pub fn ingest_all<I>(&mut self, descriptors: I) -> usize
    where
        I: IntoIterator<Item = TrackDescriptor>,
    {
        let mut handled = 0;
        for descriptor in descriptors {
            if self.is_cancelled() {
                warn!("Ingestion cancelled after {} descriptors", handled);
                self.stats.cancelled = true;
                break;
            }
            self.ingest(&descriptor);
            handled += 1;
        }
        handled
    }

    /// Ingests a parsed batch, counting its unreadable entries as skipped.
    pub fn ingest_batch(&mut self, batch: DescriptorBatch) -> usize {
        self.stats.processed += batch.unreadable;
        self.stats.skipped += batch.unreadable;
        self.stats.unreadable += batch.unreadable;
        self.ingest_all(batch.descriptors)
    }

    /// Offers every song created in this session that is still pending to the
    /// media library, recording the outcome on the song.
    pub fn download_pending(&mut self, media: &mut dyn MediaLibrary) {
        let created = self.created.clone();
        let destination = media.destination().to_path_buf();
        for song_id in created {
            if self.is_cancelled() {
                self.stats.cancelled = true;
                break;
            }
            let Some(song) = self.catalog.song(&song_id) else {
                continue;
            };
            if song.download_info.status != DownloadStatus::Pending {
                continue;
            }
            let found = {
                let request = DownloadRequest {
                    song_id: &song_id,
                    title: &song.metadata.track_name,
                    artist_string: &song.metadata.artists_string,
                    source_uri: song.source_uri(),
                    destination_dir: &destination,
                };
                media.download(&request)
            };
            let now = now_iso();
            self.catalog.record_download(&song_id, found.as_deref(), &now);
            if found.is_some() {
                self.stats.downloads_completed += 1;
            } else {
                self.stats.downloads_failed += 1;
            }
            self.tick();
        }
    }

    pub fn checkpoint(&mut self) -> SaveReport {
        let report = self.writer.save(self.catalog, SaveMode::Incremental);
        self.since_checkpoint = 0;
        self.stats.checkpoints += 1;
        if !report.all_saved() {
            self.stats.checkpoint_failures += 1;
        }
        report
    }

    fn tick(&mut self) {
        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.checkpoint_interval {
            self.checkpoint();
        }
    }

    /// Final save. Runs even after cancellation so completed work is kept.
    pub fn finish(mut self) -> (IngestStats, SaveReport) {
        let report = self.writer.save(self.catalog, SaveMode::Incremental);
        self.stats.checkpoints += 1;
        if !report.all_saved() {
            self.stats.checkpoint_failures += 1;
        }
        info!(
            "Ingestion finished: {} processed, {} new, {} skipped",
            self.stats.processed, self.stats.new_songs, self.stats.skipped
        );
        (self.stats, report)
    }
}
