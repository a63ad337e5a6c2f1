use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use crate::drive::RemoteDrive;
use crate::error::DriveError;
use crate::fs_types::{remote_newer_than_cache, translate, FileDescriptor};

/// On-disk cache mirroring the virtual tree under a single root.
///
/// Resolution happens once per open: an absent entry is downloaded in
/// full; a present entry costs one metadata round trip and is refetched
/// in place when the remote copy is newer; then the file opens with the
/// caller's flags. Reads and writes never touch the network again.
pub struct CacheDir {
    root: PathBuf,
    /// One guard per virtual path, so concurrent opens of the same path
    /// wait out an in-flight fetch/validate instead of racing it.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheDir {
    pub fn new(root: PathBuf) -> Self {
        CacheDir {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Local path mirroring a virtual path: the cache root joined with
    /// the path minus its leading separator.
    pub fn cache_path(&self, virtual_path: &str) -> PathBuf {
        self.root.join(virtual_path.trim_start_matches('/'))
    }

    fn guard_for(&self, virtual_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(virtual_path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fetch-or-validate, then open with the caller's flags.
    pub async fn open<C>(
        &self,
        drive: &C,
        desc: &FileDescriptor,
        flags: u32,
    ) -> Result<File, DriveError>
    where
        C: RemoteDrive + ?Sized,
    {
        let full = self.cache_path(&desc.path);
        if let Some(parent) = full.parent() {
            // Idempotent; two callers creating the same tree both succeed.
            fs::create_dir_all(parent).await?;
        }

        let guard = self.guard_for(&desc.path);
        let _held = guard.lock().await;

        match fs::metadata(&full).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("cache miss for {}; downloading {}", desc.path, desc.remote_id);
                drive.fetch_content(&desc.remote_id, &full).await?;
            }
            Err(e) => return Err(e.into()),
            Ok(meta) => {
                // One metadata round trip per open, never per read. The
                // stored descriptor is deliberately not consulted here.
                let record = drive.fetch_metadata(&desc.remote_id).await?;
                let fresh = translate(&record, &desc.path);
                let disk_mtime = meta.modified()?;
                if remote_newer_than_cache(fresh.mtime, disk_mtime) {
                    debug!("cache stale for {}; refetching {}", desc.path, desc.remote_id);
                    drive.fetch_content(&desc.remote_id, &full).await?;
                } else {
                    debug!("cache fresh for {}", desc.path);
                }
            }
        }

        Ok(open_options(flags).open(&full)?)
    }

    /// Total bytes held under the cache root, for startup logging.
    pub fn usage_bytes(&self) -> Result<u64, DriveError> {
        let mut total = 0;
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(io::Error::from)?.len();
            }
        }
        Ok(total)
    }
}

/// Maps the caller's open flags onto a local open of the cache file.
/// Access mode aside, only append and truncate carry meaning here; the
/// kernel never sends O_CREAT for an existing object.
fn open_options(flags: u32) -> OpenOptions {
    let flags = flags as i32;
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    if flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY {
        opts.truncate(true);
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_types::{DriveFile, Stamp, FILE_KIND};
    use async_trait::async_trait;
    use std::io::Read;
    use std::os::unix::fs::FileExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory remote with call counters, enough to exercise the
    /// resolver without a network.
    struct FakeDrive {
        content: Mutex<Vec<u8>>,
        /// What fetch_metadata reports as the modification stamp.
        remote_mtime: Mutex<String>,
        delay: Mutex<Option<Duration>>,
        fail_content: AtomicBool,
        metadata_calls: AtomicUsize,
        content_calls: AtomicUsize,
    }

    impl FakeDrive {
        fn new(content: &[u8], remote_mtime: &str) -> Self {
            FakeDrive {
                content: Mutex::new(content.to_vec()),
                remote_mtime: Mutex::new(remote_mtime.to_string()),
                delay: Mutex::new(None),
                fail_content: AtomicBool::new(false),
                metadata_calls: AtomicUsize::new(0),
                content_calls: AtomicUsize::new(0),
            }
        }

        fn metadata_calls(&self) -> usize {
            self.metadata_calls.load(Ordering::SeqCst)
        }

        fn content_calls(&self) -> usize {
            self.content_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteDrive for FakeDrive {
        async fn list_children(
            &self,
            _container_id: &str,
            _page_size: u32,
        ) -> Result<Vec<DriveFile>, DriveError> {
            Ok(Vec::new())
        }

        async fn fetch_metadata(&self, object_id: &str) -> Result<DriveFile, DriveError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            let stamp = self.remote_mtime.lock().unwrap().clone();
            Ok(DriveFile {
                id: object_id.into(),
                name: "a.txt".into(),
                kind: Some(FILE_KIND.into()),
                mime_type: Some("text/plain".into()),
                parents: vec!["root".into()],
                size: Some(self.content.lock().unwrap().len().to_string()),
                created_time: Some(stamp.clone()),
                viewed_by_me_time: Some(stamp.clone()),
                modified_by_me_time: Some(stamp),
            })
        }

        async fn fetch_content(&self, object_id: &str, dest: &Path) -> Result<(), DriveError> {
            self.content_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock().unwrap();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if self.fail_content.load(Ordering::SeqCst) {
                return Err(DriveError::FetchFailed(object_id.to_string()));
            }
            let body = self.content.lock().unwrap().clone();
            tokio::fs::write(dest, body).await?;
            Ok(())
        }
    }

    fn descriptor(path: &str) -> FileDescriptor {
        FileDescriptor {
            path: path.into(),
            remote_id: "X1".into(),
            is_dir: false,
            size: 5,
            atime: Stamp::Remote(1_577_836_800),
            ctime: Stamp::Remote(1_577_836_800),
            mtime: Stamp::Remote(1_577_836_800),
            mode: libc::S_IFREG as u32 | 0o644,
        }
    }

    fn read_all(mut f: File) -> String {
        let mut out = String::new();
        f.read_to_string(&mut out).expect("read handle");
        out
    }

    // Well in the past / future of any host clock regardless of zone.
    const PAST: &str = "2000-01-01T00:00:00.000000Z";
    const FUTURE: &str = "2100-01-01T00:00:00.000000Z";

    #[test]
    fn cache_path_mirrors_virtual_tree() {
        let cache = CacheDir::new(PathBuf::from("/var/cache/gd"));
        assert_eq!(
            cache.cache_path("/docs/a.txt"),
            PathBuf::from("/var/cache/gd/docs/a.txt")
        );
    }

    #[tokio::test]
    async fn first_open_downloads_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);
        let desc = descriptor("/docs/a.txt");

        let handle = cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .expect("open");

        assert_eq!(drive.content_calls(), 1);
        // The absent branch never asks for metadata.
        assert_eq!(drive.metadata_calls(), 0);
        assert!(cache.cache_path("/docs/a.txt").exists());
        assert_eq!(read_all(handle), "hello");
    }

    #[tokio::test]
    async fn second_open_hits_exists_and_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);
        let desc = descriptor("/docs/a.txt");

        cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .expect("first open");
        let handle = cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .expect("second open");

        assert_eq!(drive.content_calls(), 1);
        assert_eq!(drive.metadata_calls(), 1);
        assert_eq!(read_all(handle), "hello");
    }

    #[tokio::test]
    async fn stale_cache_is_refetched_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"v1", PAST);
        let desc = descriptor("/docs/a.txt");

        cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .expect("first open");

        *drive.content.lock().unwrap() = b"v2".to_vec();
        *drive.remote_mtime.lock().unwrap() = FUTURE.to_string();

        let handle = cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .expect("second open");

        assert_eq!(drive.content_calls(), 2);
        assert_eq!(read_all(handle), "v2");
    }

    #[tokio::test]
    async fn failed_download_surfaces_fetch_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);
        let desc = descriptor("/docs/a.txt");

        drive.fail_content.store(true, Ordering::SeqCst);
        let err = cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .unwrap_err();
        assert!(matches!(err, DriveError::FetchFailed(_)));
        assert_eq!(drive.content_calls(), 1);

        // No retry happened inside the resolver; the next open starts a
        // fresh attempt of its own.
        drive.fail_content.store(false, Ordering::SeqCst);
        cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .expect("open after failure");
        assert_eq!(drive.content_calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_opens_of_one_path_download_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);
        let desc = descriptor("/docs/a.txt");

        *drive.delay.lock().unwrap() = Some(Duration::from_millis(100));

        let (a, b) = tokio::join!(
            cache.open(&drive, &desc, libc::O_RDONLY as u32),
            cache.open(&drive, &desc, libc::O_RDONLY as u32),
        );

        // The late opener waited for the in-flight download and then saw
        // a fresh cache entry.
        assert_eq!(drive.content_calls(), 1);
        assert_eq!(drive.metadata_calls(), 1);
        assert_eq!(read_all(a.expect("first")), "hello");
        assert_eq!(read_all(b.expect("second")), "hello");
    }

    #[tokio::test]
    async fn distinct_paths_resolve_independently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);
        let desc_a = descriptor("/docs/a.txt");
        let desc_b = descriptor("/docs/b.txt");

        let (a, b) = tokio::join!(
            cache.open(&drive, &desc_a, libc::O_RDONLY as u32),
            cache.open(&drive, &desc_b, libc::O_RDONLY as u32),
        );

        a.expect("first");
        b.expect("second");
        assert_eq!(drive.content_calls(), 2);
    }

    #[tokio::test]
    async fn write_flags_yield_a_writable_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);
        let desc = descriptor("/docs/a.txt");

        let handle = cache
            .open(&drive, &desc, libc::O_RDWR as u32)
            .await
            .expect("open rw");
        handle.write_at(b"HELLO", 0).expect("write_at");

        let on_disk = std::fs::read_to_string(cache.cache_path("/docs/a.txt")).unwrap();
        assert_eq!(on_disk, "HELLO");
        // Writes stay local; nothing went back to the remote.
        assert_eq!(drive.content_calls(), 1);
    }

    #[tokio::test]
    async fn read_only_handles_refuse_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);
        let desc = descriptor("/docs/a.txt");

        let handle = cache
            .open(&drive, &desc, libc::O_RDONLY as u32)
            .await
            .expect("open ro");
        assert!(handle.write_at(b"nope", 0).is_err());
    }

    #[tokio::test]
    async fn usage_scan_totals_cached_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheDir::new(dir.path().to_path_buf());
        let drive = FakeDrive::new(b"hello", PAST);

        cache
            .open(&drive, &descriptor("/docs/a.txt"), libc::O_RDONLY as u32)
            .await
            .expect("open");

        assert_eq!(cache.usage_bytes().expect("usage"), 5);
    }
}
