//! Application startup state

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tally_core::{Config, Database, Error};
use tracing::{debug, info};

use crate::error::Result;
use crate::session::SessionContext;

const DB_FILE: &str = "tally.db";
const CONFIG_FILE: &str = "tally.toml";

/// Resolved configuration and data location
pub struct AppState {
    pub config: Config,
    data_dir: PathBuf,
}

impl AppState {
    /// Resolve configuration and data directory.
    ///
    /// An explicit config path must exist. Without one, `tally.toml` in the
    /// platform config directory is used if present, else the defaults.
    pub fn new(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::load(path)?,
            None => match Self::project_dirs() {
                Ok(dirs) if dirs.config_dir().join(CONFIG_FILE).exists() => {
                    Config::load(dirs.config_dir().join(CONFIG_FILE))?
                }
                _ => Config::default(),
            },
        };

        let data_dir = match data_dir {
            Some(dir) => dir,
            None => Self::project_dirs()?.data_dir().to_path_buf(),
        };

        debug!(data_dir = %data_dir.display(), "Resolved data directory");
        Ok(Self { config, data_dir })
    }

    fn project_dirs() -> Result<ProjectDirs> {
        let dirs = ProjectDirs::from("dev", "tally", "tally").ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine data directory",
            ))
        })?;
        Ok(dirs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn open_database(&self) -> Result<Database> {
        std::fs::create_dir_all(&self.data_dir).map_err(Error::Io)?;
        let path = self.db_path();
        info!(path = %path.display(), "Opening database");
        Ok(Database::open(path)?)
    }

    /// Session context backed by the on-disk database
    pub fn session_context(&self) -> Result<SessionContext> {
        let db = self.open_database()?;
        SessionContext::from_store(self.config.clone(), db)
    }
}
