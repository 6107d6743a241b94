mod cascade;
mod config;
mod media;
mod relations;
mod resolver;
mod session;
mod store;
mod writer;

pub use cascade::{
    apply, plan_cleanup, plan_playlist_removal, plan_song_removal, ApplyReport, ArtistAction,
    ArtistChange, ChangeReason, ChangeSet, CleanupOptions, DanglingReference, ImpactSummary,
    PlaylistEdit, SongAction, SongChange,
};
pub use config::{
    config_path_from_env, load_or_create_config, resolve_path, save_config, CatalogConfig,
    ConfigError, CONFIG_VERSION,
};
pub use media::{DownloadRequest, MediaFile, MediaLibrary, SongsFolder};
pub use resolver::{MatchKey, Resolution, SkipReason, SongIndex, UriConflict};
pub use session::{DescriptorBatch, IngestOutcome, IngestSession, IngestStats, TrackIngest};
pub use store::{
    ArtistsDocument, Catalog, CatalogPaths, LoadReport, MappingDocument, PlaylistsDocument,
    Problem, SongsDocument, StoreKind,
};
pub use writer::{CatalogWriter, SaveMode, SaveReport, StoreOutcome};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistCandidate {
    pub id: String,
    pub name: String,
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Document {
        store: StoreKind,
        err: serde_json::Error,
    },
    Config(ConfigError),
    PlaylistNotFound(String),
    AmbiguousPlaylist(Vec<PlaylistCandidate>),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(err) => write!(f, "io error: {}", err),
            CatalogError::Json(err) => write!(f, "json error: {}", err),
            CatalogError::Document { store, err } => {
                write!(f, "{} store is not valid json: {}", store, err)
            }
            CatalogError::Config(err) => write!(f, "config error: {}", err),
            CatalogError::PlaylistNotFound(query) => {
                write!(f, "no playlist matches \"{}\"", query)
            }
            CatalogError::AmbiguousPlaylist(candidates) => {
                write!(f, "{} playlists match: ", candidates.len())?;
                let labels: Vec<String> = candidates
                    .iter()
                    .map(|c| format!("{} ({})", c.name, c.id))
                    .collect();
                write!(f, "{}", labels.join(", "))
            }
        }
    }
}

impl std::error::Error for CatalogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CatalogError::Io(err) => Some(err),
            CatalogError::Json(err) => Some(err),
            CatalogError::Document { err, .. } => Some(err),
            CatalogError::Config(err) => Some(err),
            CatalogError::PlaylistNotFound(_) | CatalogError::AmbiguousPlaylist(_) => None,
        }
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Json(err)
    }
}

impl From<ConfigError> for CatalogError {
    fn from(err: ConfigError) -> Self {
        CatalogError::Config(err)
    }
}
