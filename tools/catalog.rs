use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use catalog::{
    config_path_from_env, load_or_create_config, plan_cleanup, plan_playlist_removal,
    plan_song_removal, Catalog, CatalogWriter, ChangeSet, CleanupOptions, DescriptorBatch,
    IngestSession, MediaLibrary, SongsFolder,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "playlist-catalog", about = "Maintain the playlist/song/artist catalog")]
struct Cli {
    /// Config file. Defaults to $PLAYLIST_CATALOG_CONFIG, then ./catalog.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest track descriptors from a JSON array or JSON-lines file.
    IngestBatch {
        file: PathBuf,
        /// Offer new songs to the songs folder afterwards.
        #[arg(long)]
        download: bool,
    },
    /// Remove a playlist (by id or name) and everything only it referenced.
    RemovePlaylist {
        name: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove specific songs by id.
    RemoveSongs {
        #[arg(required = true)]
        song_ids: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Repair dangling references and delete orphaned songs, artists and files.
    CleanupOrphans {
        /// Also remove songs marked downloaded whose file is gone.
        #[arg(long)]
        prune_missing_media: bool,
        #[arg(long)]
        dry_run: bool,
    },
    ListPlaylists,
    /// Report consistency problems without changing anything.
    Check,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config_path_from_env);
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Wrote default config to {:?}", config_path);
    }
    let paths = config.paths(&config_path);
    let writer = CatalogWriter::new(paths.clone(), config.snapshot_on_destructive);
    let mut media = SongsFolder::new(&paths.songs_dir, &config.media_extensions);

    let (mut catalog, report) = Catalog::load(&paths)?;
    if !report.missing.is_empty() {
        info!("Starting with empty stores: {:?}", report.missing);
    }

    match cli.command {
        Command::ListPlaylists => {
            list_playlists(&catalog);
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let problems = catalog.problems();
            if problems.is_empty() {
                println!("Catalog checked, no issues found.");
            } else {
                println!("Found {} problems:", problems.len());
                for problem in &problems {
                    println!("- {:?}", problem);
                }
            }
            println!(
                "Catalog has:\n{} songs\n{} playlists\n{} artists",
                catalog.song_count(),
                catalog.playlist_count(),
                catalog.artist_count()
            );
            Ok(exit_code(problems.is_empty()))
        }
        Command::IngestBatch { file, download } => {
            recover(&writer, &mut catalog, &mut media)?;
            let batch = read_descriptors(&file)?;
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

            let mut session = IngestSession::new(&mut catalog, &writer, config.checkpoint_interval)
                .with_cancel(cancel);
            session.ingest_batch(batch);
            if download && !session.is_cancelled() {
                session.download_pending(&mut media);
            }
            let (stats, saved) = session.finish();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!("{}", saved);
            Ok(exit_code(saved.all_saved()))
        }
        Command::RemovePlaylist { name, dry_run } => {
            prepare(&writer, &mut catalog, &mut media, dry_run)?;
            let playlist_id = catalog.find_playlist(&name)?;
            let change = plan_playlist_removal(&catalog, &playlist_id);
            run_change(&writer, &mut catalog, &mut media, &change, dry_run)
        }
        Command::RemoveSongs { song_ids, dry_run } => {
            prepare(&writer, &mut catalog, &mut media, dry_run)?;
            let change = plan_song_removal(&catalog, &song_ids);
            run_change(&writer, &mut catalog, &mut media, &change, dry_run)
        }
        Command::CleanupOrphans {
            prune_missing_media,
            dry_run,
        } => {
            prepare(&writer, &mut catalog, &mut media, dry_run)?;
            let options = CleanupOptions {
                prune_missing_media,
            };
            let change = plan_cleanup(&catalog, &options, &media.list());
            run_change(&writer, &mut catalog, &mut media, &change, dry_run)
        }
    }
}

fn run_change(
    writer: &CatalogWriter,
    catalog: &mut Catalog,
    media: &mut dyn MediaLibrary,
    change: &ChangeSet,
    dry_run: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    println!("{}", change.summary());
    for dangling in &change.dangling {
        println!("dangling: {:?}", dangling);
    }
    if dry_run {
        println!("Dry run, nothing changed.");
        return Ok(ExitCode::SUCCESS);
    }
    if change.is_empty() {
        println!("Nothing to do.");
        return Ok(ExitCode::SUCCESS);
    }
    let (applied, saved) = writer.commit(catalog, change, media)?;
    info!("{:?}", applied);
    println!("{}", saved);
    Ok(exit_code(saved.all_saved()))
}

/// Finishes a staged change before planning a new one. A dry run only
/// reports it.
fn prepare(
    writer: &CatalogWriter,
    catalog: &mut Catalog,
    media: &mut dyn MediaLibrary,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !dry_run {
        return recover(writer, catalog, media);
    }
    if let Some(pending) = writer.pending()? {
        println!(
            "A change staged at {} is still pending and would be finished first: {}",
            pending.planned_at,
            pending.summary()
        );
    }
    Ok(())
}

fn recover(
    writer: &CatalogWriter,
    catalog: &mut Catalog,
    media: &mut dyn MediaLibrary,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some((_, saved)) = writer.recover(catalog, media)? {
        if !saved.all_saved() {
            return Err(format!("could not finish staged change: {}", saved).into());
        }
        println!("Finished a change staged by an earlier run ({})", saved);
    }
    Ok(())
}

fn read_descriptors(path: &Path) -> Result<DescriptorBatch, Box<dyn std::error::Error>> {
    let contents = fs::read_to_string(path)?;
    let batch = DescriptorBatch::parse(&contents)?;
    if batch.unreadable > 0 {
        warn!("{} unreadable entries in {:?}", batch.unreadable, path);
    }
    Ok(batch)
}

fn list_playlists(catalog: &Catalog) {
    let mut playlists: Vec<_> = catalog.playlists().collect();
    playlists.sort_by(|a, b| a.1.name.to_lowercase().cmp(&b.1.name.to_lowercase()));
    for (id, playlist) in playlists {
        println!(
            "{}  [{}]  {} tracks, {} downloaded, created {}",
            playlist.name,
            id,
            playlist.songs.len(),
            playlist.successful_downloads,
            playlist.created_date().unwrap_or("-")
        );
    }
    println!("{} playlists", catalog.playlist_count());
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::CatalogPaths;

    #[test]
    fn dry_run_leaves_staged_change_pending() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CatalogWriter::new(CatalogPaths::under(dir.path()), true);
        let mut catalog = Catalog::empty();
        let mut media = SongsFolder::new(dir.path().join("songs"), &["mp3".to_string()]);
        let change = plan_song_removal(&catalog, &["song_gone"]);
        writer.stage(&change).unwrap();

        prepare(&writer, &mut catalog, &mut media, true).unwrap();
        assert!(writer.pending().unwrap().is_some());
        assert!(!writer.paths().store(catalog::StoreKind::Songs).exists());

        prepare(&writer, &mut catalog, &mut media, false).unwrap();
        assert!(writer.pending().unwrap().is_none());
        assert!(writer.paths().store(catalog::StoreKind::Songs).is_file());
    }
}
