use thiserror::Error;
use tracing::error;

use crate::storage::StorageError;

/// 面向调度器的错误分类，每一种都对应一个 POSIX errno。
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NoSuchEntry(String),

    #[error("File exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No such attribute: {0}")]
    NoData(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NoSuchEntry(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NoData(_) => libc::ENODATA,
            FsError::Io(_) => libc::EIO,
        }
    }
}

/// 后端错误只在这里被归一化，其他模块不检查 `StorageError` 的具体种类。
impl From<StorageError> for FsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => FsError::NoSuchEntry(key),
            other => {
                error!("storage backend fault: {}", other);
                FsError::Io(other.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
