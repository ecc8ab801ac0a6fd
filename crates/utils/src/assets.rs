use std::{env, path::PathBuf};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "REEL_ASSET_DIR";

/// Layout of the asset directory
/// ```text
/// <asset_dir>/
/// ├── db.sqlite        # lineage store
/// └── blobs/           # content-addressed image bytes
///     └── ab/abcdef…
/// ```
pub mod asset_layout {
    pub const DATABASE_FILE: &str = "db.sqlite";
    pub const BLOBS_DIR: &str = "blobs";
}

pub fn asset_dir() -> PathBuf {
    if let Ok(custom_dir) = env::var(ASSET_DIR_ENV) {
        PathBuf::from(custom_dir)
    } else if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("ai", "reel", "reel-studio")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".reel-studio"))
    }
    // ✔ macOS → ~/Library/Application Support/reel-studio
    // ✔ Linux → ~/.local/share/reel-studio   (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\reel\reel-studio
}

pub fn database_path() -> PathBuf {
    asset_dir().join(asset_layout::DATABASE_FILE)
}

pub fn blob_dir() -> PathBuf {
    asset_dir().join(asset_layout::BLOBS_DIR)
}

/// Create the asset directory and its blob subdirectory if missing
pub fn ensure_asset_dirs() -> std::io::Result<()> {
    for dir in [asset_dir(), blob_dir()] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            tracing::info!("Created asset directory: {}", dir.display());
        }
    }
    Ok(())
}
