mod auth;
mod cache;
mod config;
mod drive;
mod error;
mod fs_types;
mod fuse_daemon;
mod path_table;

use std::path::PathBuf;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::auth::Auth;
use crate::cache::CacheDir;
use crate::config::MountConfig;
use crate::drive::DriveClient;
use crate::fuse_daemon::{mount_drive_fs, DriveFs, RootStat};
use crate::path_table::PathTable;

fn main() -> anyhow::Result<()> {
    init_logging()?;

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 || args[1] != "mount" {
        eprintln!("Usage: gdrivefs mount <mountpoint>");
        std::process::exit(2);
    }
    let mountpoint = PathBuf::from(&args[2]);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(mountpoint))
}

fn init_logging() -> anyhow::Result<()> {
    let level = match std::env::var("GDRIVEFS_LOG").ok().as_deref() {
        Some("debug") => Level::DEBUG,
        Some("trace") => Level::TRACE,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn run(mountpoint: PathBuf) -> anyhow::Result<()> {
    let cfg = MountConfig::load()?;

    let auth = Auth::load(cfg.token_path.clone())?;
    let drive = DriveClient::new(auth);

    std::fs::create_dir_all(&cfg.cache_dir)?;
    let cache = CacheDir::new(cfg.cache_dir.clone());
    match cache.usage_bytes() {
        Ok(bytes) => info!("cache at {:?} holds {} bytes", cfg.cache_dir, bytes),
        Err(e) => warn!("cache scan failed: {e}"),
    }

    // The root inode answers getattr from the mountpoint's own stat, so
    // it has to be captured before the kernel hands the directory over.
    std::fs::create_dir_all(&mountpoint)?;
    let root = RootStat::capture(&mountpoint)?;

    let table = PathTable::new();
    let fs = DriveFs::new(drive, table, cache, root, cfg.root_folder_id.clone(), cfg.page_size);

    info!("mounting drive at {:?}", mountpoint);
    let handle = mount_drive_fs(fs, &mountpoint).await?;
    info!("mounted; press Ctrl+C to unmount");

    tokio::signal::ctrl_c().await?;

    info!("unmounting {:?}", mountpoint);
    handle.unmount().await?;
    Ok(())
}
