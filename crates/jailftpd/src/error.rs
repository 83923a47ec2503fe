//! Error types for jailftpd

use thiserror::Error;

use crate::reply::Reply;

/// FTP reply: requested action not taken, file unavailable
pub const FTP_FILE_UNAVAILABLE: u16 = 550;
/// FTP reply: requested action aborted, local error in processing
pub const FTP_LOCAL_ERROR: u16 = 451;
/// FTP reply: can't open data connection
pub const FTP_CANT_OPEN_DATA: u16 = 425;
/// FTP reply: service not available, closing control connection
pub const FTP_SERVICE_UNAVAILABLE: u16 = 421;

/// Filesystem and protocol failures raised while serving a session.
#[derive(Error, Debug)]
pub enum FtpError {
    /// ENOENT, or a symlink hidden by the jail's symlink policy
    #[error("No such file or directory")]
    NotFound,
    /// EACCES / EPERM
    #[error("Permission denied")]
    PermissionDenied,
    /// ENOTDIR
    #[error("Not a directory")]
    NotADirectory,
    /// EISDIR
    #[error("Is a directory")]
    IsADirectory,
    /// ENAMETOOLONG, also raised by the path resolver
    #[error("File name too long")]
    NameTooLong,
    /// ENOTEMPTY
    #[error("Directory not empty")]
    NotEmpty,
    /// EEXIST
    #[error("File exists")]
    AlreadyExists,
    /// ELOOP
    #[error("Too many levels of symbolic links")]
    TooManyLinks,
    /// EDQUOT
    #[error("Disk quota exceeded")]
    QuotaExceeded,
    /// Filesystem command issued before a jail exists for the session
    #[error("Not logged in")]
    NoJail,
    /// Passive listener could not be set up
    #[error("Passive mode unavailable: {reason}")]
    Passive {
        /// Why no port could be opened
        reason: String,
    },
    /// Any I/O failure not covered above
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FtpError {
    /// Classifies an `io::Error` from a filesystem call by errno.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => FtpError::NotFound,
            Some(libc::EACCES) | Some(libc::EPERM) => FtpError::PermissionDenied,
            Some(libc::ENOTDIR) => FtpError::NotADirectory,
            Some(libc::EISDIR) => FtpError::IsADirectory,
            Some(libc::ENAMETOOLONG) => FtpError::NameTooLong,
            Some(libc::ENOTEMPTY) => FtpError::NotEmpty,
            Some(libc::EEXIST) => FtpError::AlreadyExists,
            Some(libc::ELOOP) => FtpError::TooManyLinks,
            Some(libc::EDQUOT) => FtpError::QuotaExceeded,
            _ => match err.kind() {
                std::io::ErrorKind::NotFound => FtpError::NotFound,
                std::io::ErrorKind::PermissionDenied => FtpError::PermissionDenied,
                std::io::ErrorKind::AlreadyExists => FtpError::AlreadyExists,
                _ => FtpError::Io(err),
            },
        }
    }

    /// True for failures a client can cause on its own; the rest get logged.
    pub fn is_expected(&self) -> bool {
        !matches!(self, FtpError::Io(_) | FtpError::Passive { .. })
    }

    /// Converts the error to the reply sent on the control connection.
    pub fn reply(&self) -> Reply {
        match self {
            FtpError::Passive { .. } => Reply::new(FTP_CANT_OPEN_DATA, "Can't open data connection"),
            FtpError::NoJail => Reply::new(530, "You're not logged in"),
            FtpError::Io(_) => Reply::new(FTP_FILE_UNAVAILABLE, "Server error"),
            other => Reply::new(FTP_FILE_UNAVAILABLE, other.to_string()),
        }
    }
}

/// Result type alias using FtpError as the error type.
pub type Result<T> = std::result::Result<T, FtpError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn errno(code: i32) -> std::io::Error {
        std::io::Error::from_raw_os_error(code)
    }

    #[test]
    fn test_from_io_enoent() {
        let err = FtpError::from_io(errno(libc::ENOENT));
        assert!(matches!(err, FtpError::NotFound));
        assert_eq!(err.reply().to_string(), "550 No such file or directory\r\n");
    }

    #[test]
    fn test_from_io_eacces_and_eperm() {
        assert!(matches!(
            FtpError::from_io(errno(libc::EACCES)),
            FtpError::PermissionDenied
        ));
        assert!(matches!(
            FtpError::from_io(errno(libc::EPERM)),
            FtpError::PermissionDenied
        ));
    }

    #[test]
    fn test_from_io_notempty() {
        let err = FtpError::from_io(errno(libc::ENOTEMPTY));
        assert_eq!(err.reply().code, 550);
        assert_eq!(err.to_string(), "Directory not empty");
    }

    #[test]
    fn test_from_io_unusual_errno_is_generic() {
        let err = FtpError::from_io(errno(libc::EIO));
        assert!(matches!(err, FtpError::Io(_)));
        assert!(!err.is_expected());
        assert_eq!(err.reply().to_string(), "550 Server error\r\n");
    }

    #[test]
    fn test_passive_error_reply() {
        let err = FtpError::Passive {
            reason: "no free ports".to_string(),
        };
        assert_eq!(err.reply().code, FTP_CANT_OPEN_DATA);
        assert!(!err.is_expected());
    }

    #[test]
    fn test_name_too_long_is_expected() {
        let err = FtpError::NameTooLong;
        assert!(err.is_expected());
        assert_eq!(err.reply().to_string(), "550 File name too long\r\n");
    }
}
