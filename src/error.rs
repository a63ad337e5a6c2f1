use std::io;

use thiserror::Error;

/// Failures surfaced by the drive client, the cache, and the mount layer.
///
/// Every variant maps to exactly one errno so the kernel-facing code can
/// translate without inspecting message text.
#[derive(Debug, Error)]
pub enum DriveError {
    /// Path never listed, or the remote object no longer exists.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("drive service denied the request: {0}")]
    PermissionDenied(String),

    #[error("drive quota or rate limit hit: {0}")]
    QuotaExceeded(String),

    /// Transport-level failure or an unclassified remote status.
    #[error("drive request failed: {0}")]
    Network(String),

    /// Content download did not complete; a partial file may remain.
    #[error("content fetch failed for {0}")]
    FetchFailed(String),

    #[error("local storage error: {0}")]
    Io(#[from] io::Error),

    #[error("operation not supported")]
    Unsupported,
}

impl DriveError {
    /// Converts this error to a libc error code for the kernel surface.
    pub fn to_errno(&self) -> i32 {
        match self {
            DriveError::NotFound(_) => libc::ENOENT,
            DriveError::PermissionDenied(_) => libc::EACCES,
            DriveError::QuotaExceeded(_) => libc::EDQUOT,
            DriveError::Network(_) | DriveError::FetchFailed(_) => libc::EIO,
            DriveError::Io(e) => io_error_to_errno(e),
            DriveError::Unsupported => libc::ENOSYS,
        }
    }
}

/// Passes a raw OS error through; anything synthetic becomes EIO.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_per_variant() {
        assert_eq!(DriveError::NotFound("/x".into()).to_errno(), libc::ENOENT);
        assert_eq!(
            DriveError::PermissionDenied("403".into()).to_errno(),
            libc::EACCES
        );
        assert_eq!(
            DriveError::QuotaExceeded("429".into()).to_errno(),
            libc::EDQUOT
        );
        assert_eq!(DriveError::Network("reset".into()).to_errno(), libc::EIO);
        assert_eq!(DriveError::FetchFailed("/x".into()).to_errno(), libc::EIO);
        assert_eq!(DriveError::Unsupported.to_errno(), libc::ENOSYS);
    }

    #[test]
    fn io_errors_keep_their_os_code() {
        let e = DriveError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.to_errno(), libc::ENOSPC);

        let e = DriveError::Io(io::Error::other("synthetic"));
        assert_eq!(e.to_errno(), libc::EIO);
    }
}
