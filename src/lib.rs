pub mod config;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod handles;
pub mod key;
pub mod lock;
pub mod posix;
pub mod storage;

pub use config::{MountConfig, RmdirPolicy};
pub use error::{FsError, Result};
pub use fs::{DirEntry, DirectoryListing, ObjectFs};
pub use fuse::FuseAdapter;
pub use posix::{Attributes, NodeKind, PathNode};
pub use storage::{LocalStorage, MemoryStorage, ObjectStore};
