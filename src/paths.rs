//! Where the unit keeps its config, patch database and logs
//!
//! - **Dev mode** (debug builds): a `config.yaml` in the working directory
//!   wins and everything lives next to it.
//! - **Portable mode**: a `.portable` marker next to the executable keeps all
//!   files in the executable's directory.
//! - **Installed mode** (default): the platform data directory, e.g.
//!   `~/.local/share/Patch Surface`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

const APP_NAME: &str = "Patch Surface";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config: PathBuf,
    /// sled database and snapshot files
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub is_portable: bool,
}

impl AppPaths {
    /// Lay out all paths under `base`
    pub fn portable(base: &Path) -> Self {
        Self {
            config: base.join("config.yaml"),
            state_dir: base.join(".state"),
            logs_dir: base.join("logs"),
            is_portable: true,
        }
    }

    /// Resolve paths for this run
    ///
    /// Runs before logging is set up, so diagnostics go to stderr.
    pub fn detect() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        #[cfg(debug_assertions)]
        {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if cwd.join("config.yaml").exists() {
                eprintln!("[paths] dev mode, using {}", cwd.display());
                return Self::portable(&cwd);
            }
        }

        if exe_dir.join(".portable").exists() {
            return Self::portable(&exe_dir);
        }

        let app_data = dirs::data_dir()
            .unwrap_or_else(|| {
                eprintln!("[paths] no platform data dir, falling back to {}", exe_dir.display());
                exe_dir.clone()
            })
            .join(APP_NAME);

        Self {
            config: app_data.join("config.yaml"),
            state_dir: app_data.join("state"),
            logs_dir: app_data.join("logs"),
            is_portable: false,
        }
    }

    /// Create the state and log directories
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.state_dir, &self.logs_dir] {
            if !dir.exists() {
                debug!("Creating {}", dir.display());
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// sled database for the given unit
    ///
    /// Units sharing a host keep separate databases.
    pub fn patch_db_path(&self, unit: u16) -> PathBuf {
        self.state_dir.join(format!("unit-{}.sled", unit))
    }
}
