use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::num::NonZeroU32;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::Result as FuseResult;
use rfuse3::{Errno, FileType as FuseFileType, MountOptions, SetAttr, Timestamp};
use tracing::{debug, warn};

use crate::cache::CacheDir;
use crate::drive::RemoteDrive;
use crate::error::DriveError;
use crate::fs_types::{translate, FileDescriptor};
use crate::path_table::{join_child, valid_name, PathTable, ROOT_INO};

const TTL: Duration = Duration::from_secs(1);

// ===========================================================
// RootStat
// ===========================================================

/// Attributes of the mountpoint directory, captured before the kernel
/// hands it over. The root has no remote descriptor, so getattr on
/// inode 1 answers from this snapshot.
#[derive(Debug, Clone)]
pub struct RootStat {
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl RootStat {
    pub fn capture(path: &Path) -> io::Result<RootStat> {
        let meta = std::fs::metadata(path)?;
        Ok(RootStat {
            size: meta.len(),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
        })
    }
}

// ===========================================================
// open handle table
// ===========================================================

struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, Arc<File>>>,
}

impl HandleTable {
    fn new() -> Self {
        HandleTable {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, file: File) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::SeqCst);
        self.open.lock().unwrap().insert(fh, Arc::new(file));
        fh
    }

    fn get(&self, fh: u64) -> Option<Arc<File>> {
        self.open.lock().unwrap().get(&fh).cloned()
    }

    fn remove(&self, fh: u64) {
        self.open.lock().unwrap().remove(&fh);
    }
}

// ===========================================================
// DriveFs struct
// ===========================================================

/// Read-side FUSE daemon over one remote drive.
///
/// Directory listings populate the path table; opens resolve bytes into
/// the local cache; reads and writes then run against cached files and
/// never call out. Namespace mutation is rejected wholesale.
pub struct DriveFs<C> {
    drive: C,
    table: PathTable,
    cache: CacheDir,
    handles: HandleTable,
    root: RootStat,
    root_container: String,
    page_size: u32,
}

struct ChildEntry {
    ino: u64,
    name: String,
    desc: FileDescriptor,
}

impl<C: RemoteDrive> DriveFs<C> {
    pub fn new(
        drive: C,
        table: PathTable,
        cache: CacheDir,
        root: RootStat,
        root_container: String,
        page_size: u32,
    ) -> Self {
        DriveFs {
            drive,
            table,
            cache,
            handles: HandleTable::new(),
            root,
            root_container,
            page_size,
        }
    }

    #[cfg(test)]
    pub fn table(&self) -> &PathTable {
        &self.table
    }

    // ---------------------------------------------------
    // attribute synthesis
    // ---------------------------------------------------

    fn root_attr(&self, uid: u32, gid: u32) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: self.root.size,
            blocks: self.root.size.div_ceil(512),
            atime: Timestamp::from(self.root.atime),
            mtime: Timestamp::from(self.root.mtime),
            ctime: Timestamp::from(self.root.ctime),
            #[cfg(target_os = "macos")]
            crtime: Timestamp::from(self.root.ctime),
            kind: FuseFileType::Directory,
            perm: self.root.perm,
            nlink: self.root.nlink,
            uid,
            gid,
            rdev: 0,
            #[cfg(target_os = "macos")]
            flags: 0,
            blksize: 4096,
        }
    }

    /// Attributes for a tracked path. A file already present in the
    /// cache answers from its local stat, so sizes reflect any local
    /// edits; otherwise the stored descriptor is synthesized.
    fn attr_for_path(&self, ino: u64, desc: &FileDescriptor, uid: u32, gid: u32) -> FileAttr {
        match std::fs::metadata(self.cache.cache_path(&desc.path)) {
            Ok(meta) => disk_to_attr(ino, &meta, uid, gid),
            Err(_) => descriptor_to_attr(ino, desc, uid, gid),
        }
    }

    fn attr_for_ino(&self, ino: u64, uid: u32, gid: u32) -> Option<FileAttr> {
        if ino == ROOT_INO {
            return Some(self.root_attr(uid, gid));
        }
        self.table
            .descriptor_by_ino(ino)
            .map(|desc| self.attr_for_path(ino, &desc, uid, gid))
    }

    fn parent_ino(&self, ino: u64) -> u64 {
        if ino == ROOT_INO {
            return ROOT_INO;
        }
        let Some(path) = self.table.path_of(ino) else {
            return ROOT_INO;
        };
        match path.rsplit_once('/') {
            Some(("", _)) | None => ROOT_INO,
            Some((parent, _)) => self.table.ino_of(parent).unwrap_or(ROOT_INO),
        }
    }

    // ---------------------------------------------------
    // directory listing
    // ---------------------------------------------------

    /// Lists one directory from the remote and records every child in
    /// the path table. The caller has already established that the
    /// inode names a directory.
    async fn list_dir(&self, ino: u64) -> Result<Vec<ChildEntry>, DriveError> {
        let (dir_path, container) = if ino == ROOT_INO {
            ("/".to_string(), self.root_container.clone())
        } else {
            let desc = self
                .table
                .descriptor_by_ino(ino)
                .ok_or_else(|| DriveError::NotFound(format!("inode {ino}")))?;
            (desc.path, desc.remote_id)
        };

        let records = self.drive.list_children(&container, self.page_size).await?;
        debug!("{} children under {}", records.len(), dir_path);

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            if !valid_name(&record.name) {
                warn!("skipping child of {} with unusable name {:?}", dir_path, record.name);
                continue;
            }
            let child_path = join_child(&dir_path, &record.name);
            let desc = translate(&record, &child_path);
            let ino = self.table.insert(desc.clone());
            out.push(ChildEntry {
                ino,
                name: record.name,
                desc,
            });
        }
        Ok(out)
    }

    // ---------------------------------------------------
    // open files
    // ---------------------------------------------------

    async fn open_for(&self, ino: u64, flags: u32) -> Result<u64, DriveError> {
        let desc = self
            .table
            .descriptor_by_ino(ino)
            .ok_or_else(|| DriveError::NotFound(format!("inode {ino}")))?;
        let file = self.cache.open(&self.drive, &desc, flags).await?;
        Ok(self.handles.insert(file))
    }

    fn read_handle(&self, fh: u64, offset: u64, size: u32) -> Result<Bytes, DriveError> {
        let file = self.handles.get(fh).ok_or_else(bad_fh)?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn write_handle(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, DriveError> {
        let file = self.handles.get(fh).ok_or_else(bad_fh)?;
        let n = file.write_at(data, offset)?;
        Ok(n as u32)
    }

    fn close_handle(&self, fh: u64) {
        self.handles.remove(fh);
    }
}

// ===========================================================
// kernel surface
// ===========================================================

impl<C: RemoteDrive + 'static> Filesystem for DriveFs<C> {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    // Lookups answer from the path table alone; names appear there once
    // their parent directory has been listed.
    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let Some(parent_path) = self.table.path_of(parent) else {
            return Err(libc::ENOENT.into());
        };
        let child_path = join_child(&parent_path, &name.to_string_lossy());
        let Some(desc) = self.table.lookup(&child_path) else {
            return Err(libc::ENOENT.into());
        };
        let Some(ino) = self.table.ino_of(&child_path) else {
            return Err(libc::ENOENT.into());
        };
        Ok(ReplyEntry {
            ttl: TTL,
            attr: self.attr_for_path(ino, &desc, req.uid, req.gid),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let Some(attr) = self.attr_for_ino(ino, req.uid, req.gid) else {
            return Err(libc::ENOENT.into());
        };
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        if ino == ROOT_INO {
            return Err(libc::EISDIR.into());
        }
        let Some(desc) = self.table.descriptor_by_ino(ino) else {
            return Err(libc::ENOENT.into());
        };
        if desc.is_dir {
            return Err(libc::EISDIR.into());
        }
        let fh = self.open_for(ino, flags).await.map_err(|e| {
            warn!("open of {} failed: {e}", desc.path);
            e.to_errno()
        })?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        if ino != ROOT_INO {
            let Some(desc) = self.table.descriptor_by_ino(ino) else {
                return Err(libc::ENOENT.into());
            };
            if !desc.is_dir {
                return Err(libc::ENOTDIR.into());
            }
        }
        // Listing state lives in the path table; directory handles are
        // stateless.
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self
            .read_handle(fh, offset, size)
            .map_err(|e| e.to_errno())?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = self
            .write_handle(fh, offset, data)
            .map_err(|e| e.to_errno())?;
        Ok(ReplyWrite { written })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        if ino != ROOT_INO {
            let Some(desc) = self.table.descriptor_by_ino(ino) else {
                return Err(libc::ENOENT.into());
            };
            if !desc.is_dir {
                return Err(libc::ENOTDIR.into());
            }
        }
        let children = self.list_dir(ino).await.map_err(|e| {
            warn!("listing inode {ino} failed: {e}");
            e.to_errno()
        })?;

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(children.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: self.parent_ino(ino),
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, child) in children.iter().enumerate() {
            all.push(DirectoryEntry {
                inode: child.ino,
                kind: if child.desc.is_dir {
                    FuseFileType::Directory
                } else {
                    FuseFileType::RegularFile
                },
                name: OsString::from(child.name.clone()),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectory::<Self::DirEntryStream<'a>> { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        if ino != ROOT_INO {
            let Some(desc) = self.table.descriptor_by_ino(ino) else {
                return Err(libc::ENOENT.into());
            };
            if !desc.is_dir {
                return Err(libc::ENOTDIR.into());
            }
        }
        let children = self.list_dir(ino).await.map_err(|e| {
            warn!("listing inode {ino} failed: {e}");
            e.to_errno()
        })?;

        let Some(self_attr) = self.attr_for_ino(ino, req.uid, req.gid) else {
            return Err(libc::ENOENT.into());
        };
        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(children.len() + 2);
        all.push(DirectoryEntryPlus {
            inode: ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: self_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        let parent_ino = self.parent_ino(ino);
        if let Some(parent_attr) = self.attr_for_ino(parent_ino, req.uid, req.gid) {
            all.push(DirectoryEntryPlus {
                inode: parent_ino,
                generation: 0,
                kind: FuseFileType::Directory,
                name: OsString::from(".."),
                offset: 2,
                attr: parent_attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }
        for (i, child) in children.iter().enumerate() {
            all.push(DirectoryEntryPlus {
                inode: child.ino,
                generation: 0,
                kind: if child.desc.is_dir {
                    FuseFileType::Directory
                } else {
                    FuseFileType::RegularFile
                },
                name: OsString::from(child.name.clone()),
                offset: (i as i64) + 3,
                attr: self.attr_for_path(child.ino, &child.desc, req.uid, req.gid),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.close_handle(fh);
        Ok(())
    }

    async fn flush(&self, _req: Request, _inode: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, _inode: u64, _mask: u32) -> FuseResult<()> {
        // Permission checks stay with the caller; every mask passes.
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // Fixed figures; remote quota is not consulted. Free counts stay
        // nonzero, a zeroed volume reads as 100% full.
        Ok(ReplyStatFs {
            blocks: 100,
            bfree: 100,
            bavail: 100,
            files: 10,
            ffree: 10,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }

    // ---------------------------------------------------
    // namespace mutation: rejected wholesale
    // ---------------------------------------------------

    async fn mkdir(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        Err(reject("mkdir"))
    }

    async fn mknod(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> FuseResult<ReplyEntry> {
        Err(reject("mknod"))
    }

    async fn create(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        Err(reject("create"))
    }

    async fn unlink(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(reject("unlink"))
    }

    async fn rmdir(&self, _req: Request, _parent: u64, _name: &OsStr) -> FuseResult<()> {
        Err(reject("rmdir"))
    }

    async fn rename(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<()> {
        Err(reject("rename"))
    }

    async fn symlink(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _link_path: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        Err(reject("symlink"))
    }

    async fn link(
        &self,
        _req: Request,
        _inode: u64,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        Err(reject("link"))
    }

    async fn readlink(&self, _req: Request, _inode: u64) -> FuseResult<ReplyData> {
        Err(reject("readlink"))
    }

    async fn setattr(
        &self,
        _req: Request,
        _ino: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        Err(reject("setattr"))
    }

    async fn fallocate(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _offset: u64,
        _length: u64,
        _mode: u32,
    ) -> FuseResult<()> {
        Err(reject("fallocate"))
    }
}

// ===========================================================
// attribute helpers
// ===========================================================

fn descriptor_to_attr(ino: u64, desc: &FileDescriptor, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size: desc.size,
        blocks: desc.size.div_ceil(512),
        atime: Timestamp::from(desc.atime.to_system_time()),
        mtime: Timestamp::from(desc.mtime.to_system_time()),
        ctime: Timestamp::from(desc.ctime.to_system_time()),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(desc.ctime.to_system_time()),
        kind: if desc.is_dir {
            FuseFileType::Directory
        } else {
            FuseFileType::RegularFile
        },
        perm: (desc.mode & 0o7777) as u16,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

fn disk_to_attr(ino: u64, meta: &std::fs::Metadata, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.len().div_ceil(512),
        atime: Timestamp::from(meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH)),
        mtime: Timestamp::from(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
        ctime: Timestamp::from(
            SystemTime::UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
        ),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
        kind: if meta.is_dir() {
            FuseFileType::Directory
        } else {
            FuseFileType::RegularFile
        },
        perm: (meta.mode() & 0o7777) as u16,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

fn reject(op: &str) -> Errno {
    debug!("{op} is not supported on this filesystem");
    DriveError::Unsupported.to_errno().into()
}

fn bad_fh() -> DriveError {
    io::Error::from_raw_os_error(libc::EBADF).into()
}

// ===========================================================
// mounting
// ===========================================================

fn mount_options() -> MountOptions {
    let mut options = MountOptions::default();
    options.fs_name("gdrivefs");
    options
}

/// Mounts the daemon over an empty directory. Unprivileged mode needs
/// fusermount3 in PATH.
#[cfg(target_os = "linux")]
pub async fn mount_drive_fs<C>(
    fs: DriveFs<C>,
    mountpoint: impl AsRef<Path>,
) -> io::Result<rfuse3::raw::MountHandle>
where
    C: RemoteDrive + 'static,
{
    let session = rfuse3::raw::Session::new(mount_options());
    session.mount_with_unprivileged(fs, mountpoint).await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_drive_fs<C>(
    _fs: DriveFs<C>,
    _mountpoint: impl AsRef<Path>,
) -> io::Result<rfuse3::raw::MountHandle>
where
    C: RemoteDrive + 'static,
{
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "FUSE mounts are only supported on Linux in this build",
    ))
}
