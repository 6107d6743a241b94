use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use common::{file_stamp, now_iso};
use tracing::{error, info, warn};

use crate::cascade::{apply, ApplyReport, ChangeSet};
use crate::media::MediaLibrary;
use crate::store::{Catalog, CatalogPaths, StoreKind};
use crate::CatalogError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveMode {
    /// Checkpoints during ingestion. Files are replaced without snapshots.
    Incremental,
    /// After a cascade delete; each existing file is snapshotted first.
    Destructive,
}

#[derive(Clone, Debug)]
pub struct StoreOutcome {
    pub store: StoreKind,
    pub path: PathBuf,
    pub snapshot: Option<PathBuf>,
    pub error: Option<String>,
}

impl StoreOutcome {
    pub fn saved(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SaveReport {
    pub outcomes: Vec<StoreOutcome>,
}

impl SaveReport {
    pub fn saved_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.saved()).count()
    }

    pub fn all_saved(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(StoreOutcome::saved)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StoreOutcome> {
        self.outcomes.iter().filter(|o| !o.saved())
    }

    pub fn outcome(&self, store: StoreKind) -> Option<&StoreOutcome> {
        self.outcomes.iter().find(|o| o.store == store)
    }
}

impl fmt::Display for SaveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} stores saved", self.saved_count(), self.outcomes.len())?;
        for failure in self.failures() {
            write!(
                f,
                "; {} failed: {}",
                failure.store,
                failure.error.as_deref().unwrap_or("unknown error")
            )?;
        }
        Ok(())
    }
}

/// Persists the working set to the four store files and keeps the journal
/// of staged destructive changes.
#[derive(Clone, Debug)]
pub struct CatalogWriter {
    paths: CatalogPaths,
    snapshots: bool,
}

impl CatalogWriter {
    pub fn new(paths: CatalogPaths, snapshots: bool) -> Self {
        Self { paths, snapshots }
    }

    pub fn paths(&self) -> &CatalogPaths {
        &self.paths
    }

    /// Writes every store. Derived data (mapping, totals, playlist counters)
    /// is regenerated first. A failing store does not stop the others.
    pub fn save(&self, catalog: &mut Catalog, mode: SaveMode) -> SaveReport {
        catalog.rebuild_mapping();
        catalog.refresh_counters(&now_iso());
        let stamp = file_stamp();
        let mut report = SaveReport::default();
        for kind in StoreKind::ALL {
            let path = self.paths.store(kind);
            let outcome = match self.write_store(catalog, kind, &path, mode, &stamp) {
                Ok(snapshot) => StoreOutcome {
                    store: kind,
                    path,
                    snapshot,
                    error: None,
                },
                Err(err) => {
                    error!("Failed to save {} store to {:?}: {}", kind, path, err);
                    StoreOutcome {
                        store: kind,
                        path,
                        snapshot: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            report.outcomes.push(outcome);
        }
        if report.all_saved() {
            info!("Saved catalog ({:?})", mode);
        } else {
            warn!("Catalog partially saved: {}", report);
        }
        report
    }

    fn write_store(
        &self,
        catalog: &Catalog,
        kind: StoreKind,
        path: &Path,
        mode: SaveMode,
        stamp: &str,
    ) -> Result<Option<PathBuf>, CatalogError> {
        fs::create_dir_all(&self.paths.metadata_dir)?;
        let snapshot = if mode == SaveMode::Destructive && self.snapshots && path.exists() {
            let target = snapshot_path(path, stamp);
            copy_new(path, &target)?;
            Some(target)
        } else {
            None
        };
        let bytes = catalog.document_bytes(kind)?;
        write_replacing(path, &bytes)?;
        Ok(snapshot)
    }

    /// Records a change before it is applied so an interrupted run can finish it.
    pub fn stage(&self, change: &ChangeSet) -> Result<PathBuf, CatalogError> {
        fs::create_dir_all(&self.paths.metadata_dir)?;
        let path = self.paths.journal();
        let bytes = serde_json::to_vec_pretty(change)?;
        write_replacing(&path, &bytes)?;
        Ok(path)
    }

    pub fn pending(&self) -> Result<Option<ChangeSet>, CatalogError> {
        let bytes = match fs::read(self.paths.journal()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn clear_pending(&self) -> Result<(), CatalogError> {
        match fs::remove_file(self.paths.journal()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stages, applies and persists a destructive change. The journal is only
    /// cleared once all four stores are written.
    pub fn commit(
        &self,
        catalog: &mut Catalog,
        change: &ChangeSet,
        media: &mut dyn MediaLibrary,
    ) -> Result<(ApplyReport, SaveReport), CatalogError> {
        self.stage(change)?;
        let applied = apply(catalog, change, media);
        let saved = self.save(catalog, SaveMode::Destructive);
        if saved.all_saved() {
            self.clear_pending()?;
        } else {
            warn!(
                "Keeping staged change at {:?} until every store is saved",
                self.paths.journal()
            );
        }
        Ok((applied, saved))
    }

    /// Finishes a change left staged by an interrupted run.
    pub fn recover(
        &self,
        catalog: &mut Catalog,
        media: &mut dyn MediaLibrary,
    ) -> Result<Option<(ApplyReport, SaveReport)>, CatalogError> {
        let Some(change) = self.pending()? else {
            return Ok(None);
        };
        info!(
            "Re-applying staged change from {} ({:?})",
            change.planned_at, change.reason
        );
        self.commit(catalog, &change, media).map(Some)
    }
}

/// First free `<file>.backup_<stamp>` name. Saves within the same second get
/// a numeric suffix so an earlier snapshot is never overwritten.
fn snapshot_path(path: &Path, stamp: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = path.with_file_name(format!("{}.backup_{}", name, stamp));
    let mut candidate = base.clone();
    let mut suffix = 1;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{}.backup_{}_{}", name, stamp, suffix));
        suffix += 1;
    }
    candidate
}

/// Copies `from` to `to`, failing instead of replacing an existing file.
fn copy_new(from: &Path, to: &Path) -> io::Result<()> {
    let mut source = fs::File::open(from)?;
    let mut target = fs::OpenOptions::new().write(true).create_new(true).open(to)?;
    io::copy(&mut source, &mut target)?;
    Ok(())
}

fn write_replacing(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{}.tmp", name));
    fs::write(&tmp, bytes)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::plan_playlist_removal;
    use crate::media::SongsFolder;
    use crate::store::{ArtistsDocument, PlaylistsDocument, SongsDocument};
    use common::{ArtistRef, TrackDescriptor};

    fn seeded(root: &Path) -> (Catalog, CatalogWriter, String, String) {
        let paths = CatalogPaths::under(root);
        let writer = CatalogWriter::new(paths, true);
        let mut catalog = Catalog::empty();
        let mut ids = Vec::new();
        for (title, playlist) in [("One", "p1"), ("Two", "p1"), ("Two", "p2")] {
            let descriptor = TrackDescriptor {
                title: title.into(),
                artists: vec![ArtistRef::new("Band", Some("artist:band"))],
                playlist_id: playlist.into(),
                playlist_name: playlist.to_uppercase(),
                ..TrackDescriptor::default()
            };
            let id = catalog.resolve(&descriptor).song_id().unwrap().to_string();
            catalog.ensure_playlist(playlist, &descriptor.playlist_name, None, "t0");
            catalog.attach_playlist(&id, playlist);
            catalog.link_playlist_song(playlist, &id, "t0");
            catalog.upsert_artist("artist:band", "Band", playlist, "t0");
            ids.push(id);
        }
        (catalog, writer, ids[0].clone(), ids[1].clone())
    }

    fn read_document<T: serde::de::DeserializeOwned>(writer: &CatalogWriter, kind: StoreKind) -> T {
        serde_json::from_slice(&fs::read(writer.paths().store(kind)).unwrap()).unwrap()
    }

    /// Totals on disk match the collections they count.
    fn assert_totals(writer: &CatalogWriter) -> (usize, usize, usize) {
        let songs: SongsDocument = read_document(writer, StoreKind::Songs);
        let playlists: PlaylistsDocument = read_document(writer, StoreKind::Playlists);
        let artists: ArtistsDocument = read_document(writer, StoreKind::Artists);
        assert_eq!(songs.total_songs, songs.songs.len());
        assert_eq!(playlists.total_playlists, playlists.playlists.len());
        assert_eq!(artists.total_artists, artists.artists.len());
        (songs.total_songs, playlists.total_playlists, artists.total_artists)
    }

    fn folder(root: &Path) -> SongsFolder {
        SongsFolder::new(root.join("songs"), &["mp3".to_string()])
    }

    #[test]
    fn save_writes_all_stores_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (mut catalog, writer, s1, _) = seeded(dir.path());
        let report = writer.save(&mut catalog, SaveMode::Incremental);
        assert!(report.all_saved(), "{}", report);
        assert_eq!(report.saved_count(), 4);
        assert!(report.outcomes.iter().all(|o| o.snapshot.is_none()));

        let (loaded, load_report) = Catalog::load(writer.paths()).unwrap();
        assert!(load_report.missing.is_empty());
        assert_eq!(loaded.song_count(), 2);
        assert_eq!(loaded.mapping_for(&s1), Some(&["p1".to_string()][..]));
        assert_eq!(loaded.playlist("p1").unwrap().total_tracks, 2);
        assert!(loaded.problems().is_empty());
    }

    #[test]
    fn destructive_save_snapshots_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let (mut catalog, writer, _, _) = seeded(dir.path());
        writer.save(&mut catalog, SaveMode::Incremental);
        let report = writer.save(&mut catalog, SaveMode::Destructive);
        for outcome in &report.outcomes {
            let snapshot = outcome.snapshot.as_ref().expect("snapshot taken");
            assert!(snapshot.exists());
            let name = snapshot.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with(outcome.store.file_name()));
            assert!(name.contains(".backup_"));
        }
    }

    #[test]
    fn back_to_back_destructive_saves_keep_every_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (mut catalog, writer, _, _) = seeded(dir.path());
        writer.save(&mut catalog, SaveMode::Incremental);
        let first = writer.save(&mut catalog, SaveMode::Destructive);
        let first_playlists = first
            .outcome(StoreKind::Playlists)
            .and_then(|o| o.snapshot.clone())
            .unwrap();

        let change = plan_playlist_removal(&catalog, "p1");
        apply(&mut catalog, &change, &mut folder(dir.path()));
        let second = writer.save(&mut catalog, SaveMode::Destructive);
        let third = writer.save(&mut catalog, SaveMode::Destructive);

        let mut snapshots: Vec<PathBuf> = [&first, &second, &third]
            .iter()
            .filter_map(|r| r.outcome(StoreKind::Playlists))
            .filter_map(|o| o.snapshot.clone())
            .collect();
        assert_eq!(snapshots.len(), 3);
        snapshots.sort();
        snapshots.dedup();
        assert_eq!(snapshots.len(), 3);

        let kept: PlaylistsDocument =
            serde_json::from_slice(&fs::read(&first_playlists).unwrap()).unwrap();
        assert!(kept.playlists.contains_key("p1"));
    }

    #[test]
    fn one_failing_store_does_not_block_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let (mut catalog, writer, _, _) = seeded(dir.path());
        fs::create_dir_all(writer.paths().store(StoreKind::Artists)).unwrap();
        let report = writer.save(&mut catalog, SaveMode::Incremental);
        assert!(!report.all_saved());
        assert_eq!(report.saved_count(), 3);
        assert!(!report.outcome(StoreKind::Artists).unwrap().saved());
        assert!(writer.paths().store(StoreKind::Songs).is_file());
        assert!(report.to_string().starts_with("3/4 stores saved"));
    }

    #[test]
    fn totals_match_collections_after_every_save() {
        let dir = tempfile::tempdir().unwrap();
        let (mut catalog, writer, _, _) = seeded(dir.path());
        catalog.upsert_artist("artist:solo", "Solo", "p1", "t0");
        writer.save(&mut catalog, SaveMode::Incremental);
        assert_eq!(assert_totals(&writer), (2, 2, 2));

        let change = plan_playlist_removal(&catalog, "p1");
        let (_, saved) = writer
            .commit(&mut catalog, &change, &mut folder(dir.path()))
            .unwrap();
        assert!(saved.all_saved());
        assert_eq!(assert_totals(&writer), (1, 1, 1));

        let (loaded, _) = Catalog::load(writer.paths()).unwrap();
        assert_eq!(loaded.song_count(), 1);
        assert_eq!(loaded.playlist_count(), 1);
        assert_eq!(loaded.artist_count(), 1);
    }

    #[test]
    fn journal_stage_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let (catalog, writer, _, _) = seeded(dir.path());
        assert!(writer.pending().unwrap().is_none());
        let change = plan_playlist_removal(&catalog, "p1");
        writer.stage(&change).unwrap();
        assert_eq!(writer.pending().unwrap(), Some(change));
        writer.clear_pending().unwrap();
        assert!(writer.pending().unwrap().is_none());
        writer.clear_pending().unwrap();
    }

    #[test]
    fn commit_persists_cascade_and_clears_journal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut catalog, writer, s1, s2) = seeded(dir.path());
        writer.save(&mut catalog, SaveMode::Incremental);
        fs::create_dir_all(dir.path().join("songs")).unwrap();
        fs::write(dir.path().join("songs").join(format!("{}.mp3", s1)), b"x").unwrap();

        let change = plan_playlist_removal(&catalog, "p1");
        let mut media = folder(dir.path());
        let (applied, saved) = writer.commit(&mut catalog, &change, &mut media).unwrap();
        assert_eq!(applied.songs_removed, 1);
        assert_eq!(applied.media_deleted, 1);
        assert!(saved.all_saved());
        assert!(writer.pending().unwrap().is_none());

        let (loaded, _) = Catalog::load(writer.paths()).unwrap();
        assert!(loaded.song(&s1).is_none());
        assert_eq!(loaded.song(&s2).unwrap().playlists, vec!["p2"]);
        assert!(loaded.playlist("p1").is_none());
        assert_eq!(loaded.artist("artist:band").unwrap().playlist_ids, vec!["p2"]);
        assert!(loaded.problems().is_empty(), "{:?}", loaded.problems());
    }

    #[test]
    fn staged_change_is_finished_after_interruption() {
        let dir = tempfile::tempdir().unwrap();
        let (mut catalog, writer, s1, _) = seeded(dir.path());
        writer.save(&mut catalog, SaveMode::Incremental);
        let change = plan_playlist_removal(&catalog, "p1");
        writer.stage(&change).unwrap();
        // Interrupted mid-apply: the working set was partly changed and saved.
        let mut media = folder(dir.path());
        apply(&mut catalog, &change, &mut media);
        writer.save(&mut catalog, SaveMode::Incremental);

        let (mut reloaded, _) = Catalog::load(writer.paths()).unwrap();
        let recovered = writer.recover(&mut reloaded, &mut media).unwrap();
        let (applied, saved) = recovered.expect("pending change found");
        assert_eq!(applied.songs_removed, 0);
        assert!(saved.all_saved());
        assert!(reloaded.song(&s1).is_none());
        assert!(writer.pending().unwrap().is_none());
        assert!(writer.recover(&mut reloaded, &mut media).unwrap().is_none());
    }
}
