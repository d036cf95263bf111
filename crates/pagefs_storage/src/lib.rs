//! The pagefs storage engine.
//!
//! A volume is a single backing file mapped into memory and divided
//! into 4096-byte pages: a metadata page holding the page and inode
//! allocation bitmaps, a fixed inode table, and data pages allocated on
//! demand. Inodes address their content through two direct page
//! pointers plus one single-indirect page; directories store packed
//! fixed-size name→inum records in their data pages.
//!
//! [`Storage`] exposes the path-addressed operations the filesystem
//! adapter consumes: `stat`, `read`, `write`, `truncate`, `mknod`,
//! `unlink`, `link`, `rename`, `symlink`, `chmod`, `set_times`, `list`.
//! Errors carry their POSIX errno via [`StorageError::errno`].

mod bitmap;
mod dir;
mod error;
mod inode;
mod storage;
mod volume;

pub use self::{
    error::StorageError,
    storage::{Metadata, Storage},
};
