use std::io;

/// Errors surfaced by the storage engine.
///
/// Variants are fine-grained; [`StorageError::errno`] collapses them to
/// the POSIX codes the filesystem adapter reports to user programs.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to map the volume image")]
    Image(#[from] io::Error),
    #[error("file system entry not found")]
    EntryNotFound,
    #[error("inode index out of range")]
    InvalidInode,
    #[error("no data page behind an in-range page index")]
    UnmappedPage,
    #[error("short write")]
    ShortWrite,
    #[error("operation needs a file, not a directory")]
    IsADirectory,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("shrink past start of object")]
    ShrinkPastStart,
    #[error("object exceeds addressable capacity")]
    FileTooLarge,
    #[error("volume out of data pages")]
    OutOfDataPages,
    #[error("volume out of inodes")]
    OutOfInodes,
}

impl StorageError {
    /// The POSIX errno this error surfaces as.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::EntryNotFound => libc::ENOENT,
            Self::Image(_) | Self::InvalidInode | Self::UnmappedPage | Self::ShortWrite => {
                libc::EIO
            }
            Self::IsADirectory => libc::EISDIR,
            Self::AlreadyExists => libc::EEXIST,
            Self::ShrinkPastStart => libc::EINVAL,
            Self::FileTooLarge => libc::EFBIG,
            Self::OutOfDataPages | Self::OutOfInodes => libc::ENOSPC,
        }
    }
}
