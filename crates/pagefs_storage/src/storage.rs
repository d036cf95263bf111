//! The storage API: path-addressed operations over the volume.

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info};
use pagefs_types::{
    DATA_START_PAGE, Inode, InodeNo, MODE_DIR, MODE_SYMLINK, NUM_INODES, NUM_PAGES, PAGE_SIZE,
    PageNo,
};

use crate::{StorageError, bitmap, dir::split_parent, volume::Volume};

/// Wall-clock seconds since the epoch, for inode timestamps.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Status information for one filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
}

/// The storage engine: a mounted volume and the path-addressed
/// operations the filesystem adapter consumes.
///
/// Single accessor, synchronous; every operation runs to completion and
/// leaves the volume consistent whether it succeeds or fails.
pub struct Storage {
    pub(crate) vol: Volume,
}

impl Storage {
    /// Opens the image at `path` (creating it if needed) and formats it
    /// if it does not contain a live volume yet.
    pub fn init(path: &Path) -> Result<Self, StorageError> {
        let vol = Volume::open(path)?;
        let mut store = Self { vol };
        if store.is_fresh() {
            store.format()?;
        }
        Ok(store)
    }

    /// A volume with no allocated inode has never been initialized;
    /// a live volume always has at least the root inode bit set.
    fn is_fresh(&self) -> bool {
        self.vol.inode_bitmap().iter().all(|&b| b == 0)
    }

    fn format(&mut self) -> Result<(), StorageError> {
        self.vol.zero_page(PageNo::new(0));
        let bm = self.vol.page_bitmap_mut();
        for i in 0..DATA_START_PAGE {
            bitmap::set(bm, i, true);
        }

        let root = self.alloc_inode()?;
        debug_assert_eq!(root, InodeNo::ROOT);
        let mut node = self.inode(root)?;
        node.mode = MODE_DIR | 0o755;
        node.size = 0;
        node.refs = 1;
        self.set_inode(root, &node);
        info!("formatted fresh volume: {NUM_PAGES} pages, {NUM_INODES} inodes");
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<(InodeNo, Inode), StorageError> {
        let ino = self.tree_lookup(path)?;
        let node = self.inode(ino)?;
        Ok((ino, node))
    }

    /// Status of the object at `path`.
    pub fn stat(&self, path: &str) -> Result<Metadata, StorageError> {
        let (ino, node) = self.resolve(path)?;
        Ok(Metadata {
            ino: u64::from(ino.value()),
            mode: node.mode,
            nlink: node.refs,
            size: u64::from(node.size),
            atime: node.atime,
            mtime: node.mtime,
        })
    }

    /// Reads from the file at `path` starting at `offset`, filling as
    /// much of `buf` as the file covers. Returns the byte count read.
    pub fn read(&mut self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize, StorageError> {
        let (ino, mut node) = self.resolve(path)?;
        if node.is_dir() {
            return Err(StorageError::IsADirectory);
        }
        let size = u64::from(node.size);
        if offset >= size {
            return Ok(0);
        }
        node.atime = unix_now();
        self.set_inode(ino, &node);

        let want = usize::min(buf.len(), (size - offset) as usize);
        let mut done = 0;
        let mut page_idx = offset as usize / PAGE_SIZE;
        let mut page_off = offset as usize % PAGE_SIZE;
        while done < want {
            let Some(pno) = self.inode_page(&node, page_idx) else {
                break;
            };
            let n = usize::min(want - done, PAGE_SIZE - page_off);
            buf[done..done + n].copy_from_slice(&self.vol.page(pno)[page_off..page_off + n]);
            done += n;
            page_idx += 1;
            page_off = 0;
        }
        Ok(done)
    }

    /// Writes `buf` into the file at `path` starting at `offset`,
    /// growing the file (and zero-filling any hole) as needed. Returns
    /// the byte count written.
    pub fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<usize, StorageError> {
        let (ino, node) = self.resolve(path)?;
        if node.is_dir() {
            return Err(StorageError::IsADirectory);
        }
        if offset > u64::from(node.size) {
            self.truncate(path, offset)?;
        }
        let node = self.inode(ino)?;
        let end = offset + buf.len() as u64;
        if end > u64::from(node.size) {
            self.grow(ino, end - u64::from(node.size))?;
        }
        let mut node = self.inode(ino)?;
        node.mtime = unix_now();
        self.set_inode(ino, &node);

        let mut done = 0;
        let mut page_idx = offset as usize / PAGE_SIZE;
        let mut page_off = offset as usize % PAGE_SIZE;
        while done < buf.len() {
            let pno = self
                .inode_page(&node, page_idx)
                .ok_or(StorageError::UnmappedPage)?;
            let n = usize::min(buf.len() - done, PAGE_SIZE - page_off);
            self.vol.page_mut(pno)[page_off..page_off + n].copy_from_slice(&buf[done..done + n]);
            done += n;
            page_idx += 1;
            page_off = 0;
        }
        Ok(done)
    }

    /// Sets the size of the file at `path` to `new_size`, growing with
    /// zero bytes or shrinking as needed.
    pub fn truncate(&mut self, path: &str, new_size: u64) -> Result<(), StorageError> {
        let (ino, node) = self.resolve(path)?;
        let size = u64::from(node.size);
        if new_size > size {
            self.grow(ino, new_size - size)
        } else if new_size < size {
            self.shrink(ino, size - new_size)
        } else {
            Ok(())
        }
    }

    /// Creates a filesystem object at `path` with the given mode bits.
    /// Creating `/` succeeds as a no-op; the root always exists.
    pub fn mknod(&mut self, path: &str, mode: u32) -> Result<(), StorageError> {
        if path == "/" {
            return Ok(());
        }
        let (parent, base) = split_parent(path);
        let (dir_ino, dir_node) = self.resolve(parent)?;
        if !dir_node.is_dir() {
            return Err(StorageError::EntryNotFound);
        }
        match self.dir_lookup(&dir_node, base) {
            Ok(_) => return Err(StorageError::AlreadyExists),
            Err(StorageError::EntryNotFound) => {}
            Err(err) => return Err(err),
        }

        let ino = self.alloc_inode()?;
        let mut node = self.inode(ino)?;
        node.mode = mode;
        self.set_inode(ino, &node);
        // The dirent insertion takes the first reference; if it cannot
        // be inserted the fresh inode goes back unused.
        if let Err(err) = self.dir_put(dir_ino, base, ino) {
            self.release_inode(ino);
            return Err(err);
        }
        debug!("mknod({path:?}, {mode:o}) -> {ino}");
        Ok(())
    }

    /// Removes the directory entry at `path`, releasing the object
    /// itself when this was its last link.
    pub fn unlink(&mut self, path: &str) -> Result<(), StorageError> {
        self.resolve(path)?;
        let (parent, base) = split_parent(path);
        let (dir_ino, _) = self.resolve(parent)?;
        self.dir_delete(dir_ino, base)?;
        debug!("unlink({path:?})");
        Ok(())
    }

    /// Creates a hard link at `to` naming the same inode as `from`.
    pub fn link(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        let (from_ino, _) = self.resolve(from)?;
        let (parent, base) = split_parent(to);
        let (dir_ino, dir_node) = self.resolve(parent)?;
        if !dir_node.is_dir() {
            return Err(StorageError::EntryNotFound);
        }
        match self.dir_lookup(&dir_node, base) {
            Ok(_) => return Err(StorageError::AlreadyExists),
            Err(StorageError::EntryNotFound) => {}
            Err(err) => return Err(err),
        }
        self.dir_put(dir_ino, base, from_ino)?;
        debug!("link({from:?} => {to:?})");
        Ok(())
    }

    /// Moves the entry at `from` to `to`, replacing an existing
    /// destination.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        let (from_parent, from_base) = split_parent(from);
        let (to_parent, to_base) = split_parent(to);
        let (from_dir, _) = self.resolve(from_parent)?;
        let (to_dir, to_dir_node) = self.resolve(to_parent)?;
        if !to_dir_node.is_dir() {
            return Err(StorageError::EntryNotFound);
        }
        let (move_ino, _) = self.resolve(from)?;

        // An existing destination is replaced. A failure between this
        // delete and the final put leaves the source intact but the
        // destination gone: an accepted window in the single-accessor
        // model.
        match self.dir_delete(to_dir, to_base) {
            Ok(()) | Err(StorageError::EntryNotFound) => {}
            Err(err) => return Err(err),
        }
        self.dir_put(to_dir, to_base, move_ino)?;
        self.dir_delete(from_dir, from_base)?;
        debug!("rename({from:?} => {to:?})");
        Ok(())
    }

    /// Creates a symbolic link at `linkpath` whose content is `target`
    /// plus a NUL terminator.
    pub fn symlink(&mut self, target: &str, linkpath: &str) -> Result<(), StorageError> {
        self.mknod(linkpath, MODE_SYMLINK | 0o777)?;
        let mut content = target.as_bytes().to_vec();
        content.push(0);
        let written = self.write(linkpath, &content, 0)?;
        if written < content.len() {
            return Err(StorageError::ShortWrite);
        }
        debug!("symlink({target:?}, {linkpath:?})");
        Ok(())
    }

    /// Overwrites the mode bits of the object at `path`.
    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<(), StorageError> {
        let (ino, mut node) = self.resolve(path)?;
        node.mode = mode;
        self.set_inode(ino, &node);
        debug!("chmod({path:?}, {mode:o})");
        Ok(())
    }

    /// Sets the timestamps of the object at `path`.
    ///
    /// `ts[0]` is stored as `mtime` and `ts[1]` as `atime`, even though
    /// callers hand the pair over in `[atime, mtime]` order.
    pub fn set_times(&mut self, path: &str, ts: [i64; 2]) -> Result<(), StorageError> {
        let (ino, mut node) = self.resolve(path)?;
        node.mtime = ts[0];
        node.atime = ts[1];
        self.set_inode(ino, &node);
        Ok(())
    }

    /// Names of the entries in the directory at `path`, in no
    /// particular order. A path that resolves to a non-directory yields
    /// an empty list.
    pub fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let (_, node) = self.resolve(path)?;
        if !node.is_dir() {
            return Ok(Vec::new());
        }
        self.dir_entry_names(&node)
    }

    /// Whether page `pno` is marked allocated in the page bitmap.
    #[must_use]
    pub fn page_in_use(&self, pno: PageNo) -> bool {
        self.vol.page_in_use(pno)
    }
}
