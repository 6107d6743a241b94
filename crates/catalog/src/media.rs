use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

/// What the downloader gets to work with for one song.
#[derive(Clone, Debug)]
pub struct DownloadRequest<'a> {
    pub song_id: &'a str,
    pub title: &'a str,
    pub artist_string: &'a str,
    pub source_uri: Option<&'a str>,
    pub destination_dir: &'a Path,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaFile {
    /// File stem, which is the song id for files the catalog owns.
    pub song_id: String,
    pub path: PathBuf,
}

/// Media files stored next to the catalog, one per song id.
pub trait MediaLibrary {
    /// Folder downloads are expected to land in.
    fn destination(&self) -> &Path;

    /// Fetches media for a song. `Some(path)` on success.
    fn download(&mut self, request: &DownloadRequest<'_>) -> Option<PathBuf>;

    /// Deletes every file stored for `song_id`. Returns how many were removed.
    fn remove(&mut self, song_id: &str) -> usize;

    fn remove_file(&mut self, path: &Path) -> bool;

    fn list(&self) -> Vec<MediaFile>;
}

/// A flat folder of `<song_id>.<ext>` files.
///
/// It does not fetch anything itself: a download succeeds when a file for the
/// song is already present, which is how externally downloaded media gets
/// picked up.
#[derive(Clone, Debug)]
pub struct SongsFolder {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl SongsFolder {
    pub fn new(dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            dir: dir.into(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn candidates<'a>(&'a self, song_id: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
        self.extensions
            .iter()
            .map(move |ext| self.dir.join(format!("{}.{}", song_id, ext)))
    }

    pub fn find(&self, song_id: &str) -> Option<PathBuf> {
        self.candidates(song_id).find(|path| path.is_file())
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|known| *known == ext)
            })
            .unwrap_or(false)
    }
}

impl MediaLibrary for SongsFolder {
    fn destination(&self) -> &Path {
        &self.dir
    }

    fn download(&mut self, request: &DownloadRequest<'_>) -> Option<PathBuf> {
        let found = self.find(request.song_id);
        if found.is_none() {
            info!(
                "No media for {} ({} - {})",
                request.song_id, request.artist_string, request.title
            );
        }
        found
    }

    fn remove(&mut self, song_id: &str) -> usize {
        let mut removed = 0;
        let paths: Vec<PathBuf> = self.candidates(song_id).collect();
        for path in paths {
            if path.is_file() && self.remove_file(&path) {
                removed += 1;
            }
        }
        removed
    }

    fn remove_file(&mut self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => {
                info!("Deleted media file {:?}", path);
                true
            }
            Err(err) => {
                warn!("Failed to delete {:?}: {}", path, err);
                false
            }
        }
    }

    fn list(&self) -> Vec<MediaFile> {
        if !self.dir.is_dir() {
            return Vec::new();
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() || !self.is_media(entry.path()) {
                continue;
            }
            let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            files.push(MediaFile {
                song_id: stem.to_string(),
                path: entry.path().to_path_buf(),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(dir: &Path) -> SongsFolder {
        let exts: Vec<String> = ["mp3", "m4a", "flac"].iter().map(|e| e.to_string()).collect();
        SongsFolder::new(dir, &exts)
    }

    #[test]
    fn download_succeeds_only_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("song_a.m4a"), b"x").unwrap();
        let mut media = folder(dir.path());
        let request = DownloadRequest {
            song_id: "song_a",
            title: "A",
            artist_string: "X",
            source_uri: None,
            destination_dir: dir.path(),
        };
        assert_eq!(media.download(&request), Some(dir.path().join("song_a.m4a")));
        let missing = DownloadRequest {
            song_id: "song_b",
            ..request
        };
        assert_eq!(media.download(&missing), None);
    }

    #[test]
    fn remove_deletes_every_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("song_a.mp3"), b"x").unwrap();
        fs::write(dir.path().join("song_a.flac"), b"x").unwrap();
        fs::write(dir.path().join("song_b.mp3"), b"x").unwrap();
        let mut media = folder(dir.path());
        assert_eq!(media.remove("song_a"), 2);
        assert_eq!(media.remove("song_a"), 0);
        assert!(dir.path().join("song_b.mp3").exists());
    }

    #[test]
    fn list_skips_unknown_extensions_and_subfolders() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("song_a.MP3"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("song_c.mp3"), b"x").unwrap();
        let media = folder(dir.path());
        let files = media.list();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].song_id, "song_a");

        let absent = folder(&dir.path().join("nope"));
        assert!(absent.list().is_empty());
    }
}
