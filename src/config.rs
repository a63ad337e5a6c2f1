use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

/// State directory, ~/.gdrivefs by default.
fn config_dir() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("no home directory"))?;
    let dir = home.join(".gdrivefs");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MountConfig {
    pub cache_dir: PathBuf,
    pub token_path: PathBuf,
    /// Folder id the mount root maps to; "root" is the drive's own root.
    pub root_folder_id: String,
    pub page_size: u32,
}

impl MountConfig {
    /// Loads the persisted config, writing defaults on first run.
    /// Environment variables override individual fields afterwards.
    pub fn load() -> anyhow::Result<MountConfig> {
        let dir = config_dir()?;
        let path = dir.join("config.json");

        let mut cfg = if path.exists() {
            let raw = fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            let cfg = MountConfig::defaults(&dir);
            fs::write(&path, serde_json::to_vec_pretty(&cfg)?)?;
            info!("wrote initial config to {:?}", path);
            cfg
        };

        cfg.apply_env();
        Ok(cfg)
    }

    fn defaults(dir: &Path) -> MountConfig {
        MountConfig {
            cache_dir: dir.join("cache"),
            token_path: dir.join("token.json"),
            root_folder_id: "root".to_string(),
            page_size: 100,
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("GDRIVEFS_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GDRIVEFS_TOKEN_PATH") {
            self.token_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GDRIVEFS_ROOT_FOLDER") {
            self.root_folder_id = v;
        }
        self.page_size = std::env::var("GDRIVEFS_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.page_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_live_under_the_state_dir() {
        let cfg = MountConfig::defaults(Path::new("/home/u/.gdrivefs"));
        assert_eq!(cfg.cache_dir, PathBuf::from("/home/u/.gdrivefs/cache"));
        assert_eq!(cfg.token_path, PathBuf::from("/home/u/.gdrivefs/token.json"));
        assert_eq!(cfg.root_folder_id, "root");
        assert_eq!(cfg.page_size, 100);
    }

    #[test]
    fn env_overrides_apply_when_parseable() {
        let mut cfg = MountConfig::defaults(Path::new("/home/u/.gdrivefs"));

        std::env::set_var("GDRIVEFS_PAGE_SIZE", "250");
        cfg.apply_env();
        assert_eq!(cfg.page_size, 250);

        std::env::set_var("GDRIVEFS_PAGE_SIZE", "not-a-number");
        cfg.apply_env();
        assert_eq!(cfg.page_size, 250);

        std::env::remove_var("GDRIVEFS_PAGE_SIZE");
    }
}
