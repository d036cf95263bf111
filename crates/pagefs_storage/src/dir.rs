//! The directory layer: name→inum entries stored inside directory
//! inodes, and the path resolver that walks them from the root.
//!
//! Deletion swaps the last entry into the vacated slot and shrinks the
//! directory by one record, so iteration order is unstable across
//! deletions; listing order is not part of the interface.

use dataview::PodMethods as _;
use log::debug;
use pagefs_types::{
    DIR_ENTRIES_PER_PAGE, DirEntry, Inode, InodeNo, PAGE_SIZE, PageNo, bytes_to_pages,
};

use crate::{Storage, StorageError, volume::page_offset};

pub(crate) const DIR_ENTRY_SIZE: usize = size_of::<DirEntry>();

/// Splits a path into its parent directory and basename.
///
/// The basename starts after the last `/`; the parent is everything
/// before it, or `/` when that would be empty.
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("/", path),
    }
}

impl Storage {
    fn dir_entry_count(dir: &Inode) -> usize {
        dir.size as usize / DIR_ENTRY_SIZE
    }

    /// Number of entries stored in page `page_idx` of the directory.
    fn dir_page_len(dir: &Inode, page_idx: usize) -> usize {
        let num_ents = Self::dir_entry_count(dir);
        let last_page = dir.size as usize / PAGE_SIZE;
        if page_idx < last_page {
            DIR_ENTRIES_PER_PAGE
        } else {
            num_ents - DIR_ENTRIES_PER_PAGE * last_page
        }
    }

    fn read_dirent(&self, pno: PageNo, slot: usize) -> DirEntry {
        self.vol.read_pod(page_offset(pno) + slot * DIR_ENTRY_SIZE)
    }

    fn write_dirent(&mut self, pno: PageNo, slot: usize, de: &DirEntry) {
        self.vol.write_pod(page_offset(pno) + slot * DIR_ENTRY_SIZE, de);
    }

    /// Locates `name` in the directory, returning its page index, slot
    /// within the page, and the inode it names.
    fn dir_find(
        &self,
        dir: &Inode,
        name: &str,
    ) -> Result<(usize, usize, InodeNo), StorageError> {
        for page_idx in 0..bytes_to_pages(u64::from(dir.size)) as usize {
            let pno = self
                .inode_page(dir, page_idx)
                .ok_or(StorageError::UnmappedPage)?;
            for slot in 0..Self::dir_page_len(dir, page_idx) {
                let de = self.read_dirent(pno, slot);
                if de.is_same_name(name.as_bytes()) {
                    return Ok((page_idx, slot, de.inum()));
                }
            }
        }
        Err(StorageError::EntryNotFound)
    }

    /// Looks `name` up in the directory `dir`, returning the inode it
    /// names. The first match wins. Non-directory inodes hold no
    /// entries, so looking anything up in one fails with not-found.
    pub(crate) fn dir_lookup(&self, dir: &Inode, name: &str) -> Result<InodeNo, StorageError> {
        if !dir.is_dir() {
            return Err(StorageError::EntryNotFound);
        }
        self.dir_find(dir, name).map(|(_, _, inum)| inum)
    }

    /// Appends an entry for (`name`, `inum`) to directory `dir_ino` and
    /// takes a reference on `inum`.
    ///
    /// Duplicate names are tolerated here; callers that need uniqueness
    /// check before inserting.
    pub(crate) fn dir_put(
        &mut self,
        dir_ino: InodeNo,
        name: &str,
        inum: InodeNo,
    ) -> Result<(), StorageError> {
        self.inode(inum)?;
        self.grow(dir_ino, DIR_ENTRY_SIZE as u64)?;

        let dir = self.inode(dir_ino)?;
        let new_idx = Self::dir_entry_count(&dir) - 1;
        let pno = self
            .inode_page(&dir, new_idx / DIR_ENTRIES_PER_PAGE)
            .ok_or(StorageError::UnmappedPage)?;
        let mut de = DirEntry::zeroed();
        de.set_name(name.as_bytes());
        de.set_inum(inum);
        self.write_dirent(pno, new_idx % DIR_ENTRIES_PER_PAGE, &de);

        // Reload after the grow in case the entry names its own
        // directory.
        let mut target = self.inode(inum)?;
        target.refs += 1;
        self.set_inode(inum, &target);
        debug!("dir_put({dir_ino}, {name:?}, {inum})");
        Ok(())
    }

    /// Removes the entry for `name` from directory `dir_ino` and drops
    /// the reference it held.
    ///
    /// The last entry is swapped into the vacated slot and the
    /// directory shrunk by one record before the named inode is
    /// released, so the directory is never left pointing at a freed
    /// inode.
    pub(crate) fn dir_delete(&mut self, dir_ino: InodeNo, name: &str) -> Result<(), StorageError> {
        let dir = self.inode(dir_ino)?;
        if !dir.is_dir() {
            return Err(StorageError::EntryNotFound);
        }
        let (page_idx, slot, victim) = self.dir_find(&dir, name)?;

        let last_idx = Self::dir_entry_count(&dir) - 1;
        let last_pno = self
            .inode_page(&dir, last_idx / DIR_ENTRIES_PER_PAGE)
            .ok_or(StorageError::UnmappedPage)?;
        let last = self.read_dirent(last_pno, last_idx % DIR_ENTRIES_PER_PAGE);
        let pno = self
            .inode_page(&dir, page_idx)
            .ok_or(StorageError::UnmappedPage)?;
        self.write_dirent(pno, slot, &last);
        self.write_dirent(last_pno, last_idx % DIR_ENTRIES_PER_PAGE, &DirEntry::zeroed());
        self.shrink(dir_ino, DIR_ENTRY_SIZE as u64)?;

        self.free_inode(victim)?;
        debug!("dir_delete({dir_ino}, {name:?}) -> {victim}");
        Ok(())
    }

    /// Resolves an absolute path to an inode number, walking from the
    /// root one component at a time.
    ///
    /// No `.`/`..` handling and no trailing-slash support; the first
    /// component that fails to resolve propagates its error.
    pub(crate) fn tree_lookup(&self, path: &str) -> Result<InodeNo, StorageError> {
        let mut cur = InodeNo::ROOT;
        let rest = path.strip_prefix('/').unwrap_or(path);
        if rest.is_empty() {
            return Ok(cur);
        }
        for name in rest.split('/') {
            let node = self.inode(cur)?;
            cur = self.dir_lookup(&node, name)?;
        }
        Ok(cur)
    }

    /// Collects the names of all entries in directory `dir`, in storage
    /// order.
    pub(crate) fn dir_entry_names(&self, dir: &Inode) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::with_capacity(Self::dir_entry_count(dir));
        for page_idx in 0..bytes_to_pages(u64::from(dir.size)) as usize {
            let pno = self
                .inode_page(dir, page_idx)
                .ok_or(StorageError::UnmappedPage)?;
            for slot in 0..Self::dir_page_len(dir, page_idx) {
                let de = self.read_dirent(pno, slot);
                names.push(String::from_utf8_lossy(de.name()).into_owned());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn check_split(path: &str, parent: &str, base: &str) {
        assert_eq!(split_parent(path), (parent, base));
    }

    #[test]
    fn test_split_parent() {
        check_split("/f", "/", "f");
        check_split("/a/b", "/a", "b");
        check_split("/a/b/c", "/a/b", "c");
    }

    #[test]
    fn test_split_parent_of_root() {
        check_split("/", "/", "");
    }
}
