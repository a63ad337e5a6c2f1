use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Kind marker the API puts on every per-object record.
pub const FILE_KIND: &str = "drive#file";
/// MIME type reserved for folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Timestamp layout used by the API, UTC with fractional seconds.
const REMOTE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Raw metadata record for one remote object, deserialized verbatim.
///
/// A typical record:
/// `{"kind": "drive#file", "id": "1GvwvfgHdWm6...", "name": "puzzle.ods",
///   "mimeType": "application/vnd.oasis.opendocument.spreadsheet",
///   "parents": ["0ADZoyBWeSfDNUk9PVA"], "viewedByMeTime":
///   "2019-03-21T08:03:34.750Z", "createdTime": "2019-03-21T08:03:13.074Z",
///   "modifiedByMeTime": "2009-10-19T15:30:40.000Z", "size": "42274"}`
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    /// Decimal string in the API; folders omit it.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub viewed_by_me_time: Option<String>,
    #[serde(default)]
    pub modified_by_me_time: Option<String>,
}

/// Envelope for a children listing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
}

/// Epoch seconds with provenance: taken from the remote record, or
/// substituted with the current time because the field was absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    Remote(i64),
    Defaulted(i64),
}

impl Stamp {
    pub fn secs(self) -> i64 {
        match self {
            Stamp::Remote(s) | Stamp::Defaulted(s) => s,
        }
    }

    #[cfg(test)]
    pub fn is_defaulted(self) -> bool {
        matches!(self, Stamp::Defaulted(_))
    }

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.secs().max(0) as u64)
    }
}

/// Canonical view of one virtual path, derived from a [`DriveFile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Virtual absolute path; unique key in the path table.
    pub path: String,
    /// Remote object this path refers to.
    pub remote_id: String,
    pub is_dir: bool,
    pub size: u64,
    pub atime: Stamp,
    pub ctime: Stamp,
    pub mtime: Stamp,
    pub mode: u32,
}

/// Builds the canonical descriptor for `path` out of a raw record.
///
/// Total: missing fields fall back to defaults, never to an error.
pub fn translate(record: &DriveFile, path: &str) -> FileDescriptor {
    let is_dir = is_directory(record);
    let kind_bit = if is_dir { libc::S_IFDIR } else { libc::S_IFREG };

    FileDescriptor {
        path: path.to_string(),
        remote_id: record.id.clone(),
        is_dir,
        size: record
            .size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        atime: parse_stamp(record.viewed_by_me_time.as_deref()),
        ctime: parse_stamp(record.created_time.as_deref()),
        mtime: parse_stamp(record.modified_by_me_time.as_deref()),
        // Directories carry the same 0644 mask as files; permission
        // checks are left to access(), which allows every mask.
        mode: kind_bit as u32 | 0o644,
    }
}

/// A record is a directory only when both markers say so; a record missing
/// either field is a plain file.
pub fn is_directory(record: &DriveFile) -> bool {
    record.kind.as_deref() == Some(FILE_KIND)
        && record.mime_type.as_deref() == Some(FOLDER_MIME)
}

/// Parses one optional timestamp field into a [`Stamp`].
///
/// An absent field becomes `Defaulted(now)`. An unparseable value is logged
/// and defaulted too, so a single bad record cannot fail a whole listing.
pub fn parse_stamp(field: Option<&str>) -> Stamp {
    match field {
        Some(raw) => match NaiveDateTime::parse_from_str(raw, REMOTE_TIME_FORMAT) {
            Ok(wall) => Stamp::Remote(local_epoch(wall)),
            Err(err) => {
                warn!("unparseable remote timestamp {raw:?}: {err}");
                Stamp::Defaulted(Utc::now().timestamp())
            }
        },
        None => Stamp::Defaulted(Utc::now().timestamp()),
    }
}

/// Reduces a parsed UTC wall clock to epoch seconds through the host's
/// local zone rules for that date (mktime semantics). Purely a function of
/// the wall-clock fields, never of the zone offset at call time.
fn local_epoch(wall: NaiveDateTime) -> i64 {
    match wall.and_local_timezone(Local) {
        LocalResult::Single(dt) => dt.timestamp(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp(),
        // Reading inside a DST gap; normalize with the offset in force at
        // that instant, as mktime does.
        LocalResult::None => {
            let offset = Local.offset_from_utc_datetime(&wall);
            wall.and_utc().timestamp() - i64::from(offset.local_minus_utc())
        }
    }
}

/// Decides whether the remote copy is newer than the cached one.
///
/// `remote_mtime` is the remote UTC wall clock reduced through the host
/// zone (see [`parse_stamp`]); `disk_mtime` is a plain epoch from the local
/// filesystem. The two sides deliberately differ by the host's UTC offset;
/// keep the normalization direction as is, or fix both at once.
pub fn remote_newer_than_cache(remote_mtime: Stamp, disk_mtime: SystemTime) -> bool {
    let disk_secs = disk_mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    remote_mtime.secs() > disk_secs
}
