use thiserror::Error;

/// Errors returned by namespace and handle operations.
///
/// Every variant corresponds to exactly one Linux errno so callers can branch
/// on semantics (e.g. "not empty" vs "not a directory").
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsError {
    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("device or resource busy")]
    DeviceBusy,

    #[error("permission denied")]
    AccessDenied,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("no such file or directory")]
    NoSuchEntry,

    #[error("file name too long")]
    NameTooLong,

    #[error("bad address")]
    BadAddress,

    #[error("file exists")]
    AlreadyExists,

    #[error("bad file descriptor")]
    BadDescriptor,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("file too large")]
    FileTooLarge,
}

pub type Result<T> = std::result::Result<T, VfsError>;

impl VfsError {
    /// Linux errno value for this error
    pub fn errno(self) -> i32 {
        match self {
            VfsError::NotADirectory => libc::ENOTDIR,
            VfsError::IsADirectory => libc::EISDIR,
            VfsError::DirectoryNotEmpty => libc::ENOTEMPTY,
            VfsError::DeviceBusy => libc::EBUSY,
            VfsError::AccessDenied => libc::EACCES,
            VfsError::PermissionDenied => libc::EPERM,
            VfsError::NoSuchEntry => libc::ENOENT,
            VfsError::NameTooLong => libc::ENAMETOOLONG,
            VfsError::BadAddress => libc::EFAULT,
            VfsError::AlreadyExists => libc::EEXIST,
            VfsError::BadDescriptor => libc::EBADF,
            VfsError::InvalidArgument => libc::EINVAL,
            VfsError::FileTooLarge => libc::EFBIG,
        }
    }

    /// Symbolic errno name, e.g. `"ENOTEMPTY"`
    pub fn name(self) -> &'static str {
        match self {
            VfsError::NotADirectory => "ENOTDIR",
            VfsError::IsADirectory => "EISDIR",
            VfsError::DirectoryNotEmpty => "ENOTEMPTY",
            VfsError::DeviceBusy => "EBUSY",
            VfsError::AccessDenied => "EACCES",
            VfsError::PermissionDenied => "EPERM",
            VfsError::NoSuchEntry => "ENOENT",
            VfsError::NameTooLong => "ENAMETOOLONG",
            VfsError::BadAddress => "EFAULT",
            VfsError::AlreadyExists => "EEXIST",
            VfsError::BadDescriptor => "EBADF",
            VfsError::InvalidArgument => "EINVAL",
            VfsError::FileTooLarge => "EFBIG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VfsError::DirectoryNotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(VfsError::DeviceBusy.errno(), libc::EBUSY);
        assert_eq!(VfsError::BadAddress.errno(), libc::EFAULT);
        assert_eq!(VfsError::FileTooLarge.errno(), libc::EFBIG);
        assert_ne!(
            VfsError::AccessDenied.errno(),
            VfsError::PermissionDenied.errno()
        );
    }

    #[test]
    fn test_display_and_name() {
        assert_eq!(VfsError::NotADirectory.to_string(), "not a directory");
        assert_eq!(VfsError::NameTooLong.name(), "ENAMETOOLONG");
    }
}
