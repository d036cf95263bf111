//! The inode table and the grow/shrink algorithms.
//!
//! Content pages attach to an inode in a canonical order: `ptrs[0]`,
//! then `ptrs[1]`, then successive slots of the indirect page. Shrink
//! releases them in exactly the reverse order, freeing the indirect
//! page itself when its slot 0 goes. An inode is always addressed as an
//! explicit `(InodeNo, Inode)` pair; records are copied out of the
//! table, mutated, and written back.

use arrayvec::ArrayVec;
use dataview::PodMethods as _;
use log::{debug, warn};
use pagefs_types::{
    INODE_START_PAGE, IndirectPage, Inode, InodeNo, MAX_FILE_PAGES, NUM_DIRECT_PTRS, NUM_INODES,
    PAGE_SIZE, PageNo, bytes_to_pages,
};

use crate::{Storage, StorageError, bitmap, storage::unix_now, volume::page_offset};

/// Byte offset of inode `ino` within the volume.
fn inode_offset(ino: InodeNo) -> usize {
    INODE_START_PAGE * PAGE_SIZE + ino.as_index() * size_of::<Inode>()
}

impl Storage {
    /// Copies the record of inode `ino` out of the table.
    pub fn inode(&self, ino: InodeNo) -> Result<Inode, StorageError> {
        if ino.as_index() >= NUM_INODES {
            return Err(StorageError::InvalidInode);
        }
        Ok(self.vol.read_pod(inode_offset(ino)))
    }

    /// Writes `node` back into the table slot of `ino`.
    pub(crate) fn set_inode(&mut self, ino: InodeNo, node: &Inode) {
        debug_assert!(ino.as_index() < NUM_INODES);
        self.vol.write_pod(inode_offset(ino), node);
    }

    /// Whether inode `ino` is marked allocated.
    #[must_use]
    pub fn inode_in_use(&self, ino: InodeNo) -> bool {
        ino.as_index() < NUM_INODES && bitmap::get(self.vol.inode_bitmap(), ino.as_index())
    }

    /// Claims the first free inode, zeroes its record and stamps its
    /// modification time.
    pub(crate) fn alloc_inode(&mut self) -> Result<InodeNo, StorageError> {
        let Some(i) = bitmap::first_clear(self.vol.inode_bitmap(), NUM_INODES) else {
            warn!("alloc_inode: out of inodes");
            return Err(StorageError::OutOfInodes);
        };
        bitmap::set(self.vol.inode_bitmap_mut(), i, true);
        let ino = InodeNo::new(i as u32);
        let mut node = Inode::zeroed();
        node.mtime = unix_now();
        self.set_inode(ino, &node);
        debug!("alloc_inode({ino})");
        Ok(ino)
    }

    /// Drops one reference to inode `ino`; at zero references the
    /// content pages are released and the table slot freed.
    pub(crate) fn free_inode(&mut self, ino: InodeNo) -> Result<(), StorageError> {
        let mut node = self.inode(ino)?;
        node.refs -= 1;
        self.set_inode(ino, &node);
        if node.refs > 0 {
            return Ok(());
        }
        self.shrink(ino, u64::from(node.size))?;
        bitmap::set(self.vol.inode_bitmap_mut(), ino.as_index(), false);
        debug!("free_inode({ino})");
        Ok(())
    }

    /// Releases a freshly allocated, never-linked inode (refs still 0).
    pub(crate) fn release_inode(&mut self, ino: InodeNo) {
        debug_assert!(ino.as_index() < NUM_INODES);
        bitmap::set(self.vol.inode_bitmap_mut(), ino.as_index(), false);
    }

    /// Translates content-page index `idx` of `node` to its data page.
    ///
    /// Returns `None` past the last page implied by the inode's size,
    /// and for slots no page is attached to.
    #[must_use]
    pub fn inode_page(&self, node: &Inode, idx: usize) -> Option<PageNo> {
        if idx > node.size as usize / PAGE_SIZE {
            return None;
        }
        if idx < NUM_DIRECT_PTRS {
            return node.direct(idx);
        }
        let ipno = node.indirect()?;
        let ind: IndirectPage = self.vol.read_pod(page_offset(ipno));
        ind.get(idx - NUM_DIRECT_PTRS)
    }

    /// Grows inode `ino` by `delta` bytes, attaching zeroed data pages
    /// as needed.
    ///
    /// All-or-nothing: if any allocation fails, every page obtained in
    /// this call (including a freshly created indirect page) is freed
    /// again and the on-disk record is left untouched.
    pub(crate) fn grow(&mut self, ino: InodeNo, delta: u64) -> Result<(), StorageError> {
        let mut node = self.inode(ino)?;
        let old_pages = node.pages_used();
        let new_size = u64::from(node.size) + delta;
        let new_pages = bytes_to_pages(new_size) as usize;
        if new_pages > MAX_FILE_PAGES {
            return Err(StorageError::FileTooLarge);
        }

        // Crossing into indirect territory allocates the pointer page
        // up front so a later failure can roll it back with the rest.
        let mut new_indirect = None;
        if old_pages <= NUM_DIRECT_PTRS && new_pages > NUM_DIRECT_PTRS {
            debug_assert!(node.indirect().is_none());
            let ipno = self.vol.alloc_page()?;
            self.vol.zero_page(ipno);
            node.set_indirect(Some(ipno));
            new_indirect = Some(ipno);
        }

        let mut added = ArrayVec::<PageNo, MAX_FILE_PAGES>::new();
        for _ in old_pages..new_pages {
            match self.vol.alloc_page() {
                Ok(pno) => {
                    self.vol.zero_page(pno);
                    added.push(pno);
                }
                Err(err) => {
                    for &pno in &added {
                        self.vol.free_page(pno);
                    }
                    if let Some(ipno) = new_indirect {
                        self.vol.free_page(ipno);
                    }
                    return Err(err);
                }
            }
        }

        let mut ind = match node.indirect() {
            Some(ipno) => self.vol.read_pod::<IndirectPage>(page_offset(ipno)),
            None => IndirectPage::zeroed(),
        };
        for (idx, &pno) in (old_pages..).zip(&added) {
            if idx < NUM_DIRECT_PTRS {
                debug_assert!(node.direct(idx).is_none());
                node.set_direct(idx, Some(pno));
            } else {
                debug_assert!(ind.get(idx - NUM_DIRECT_PTRS).is_none());
                ind.set(idx - NUM_DIRECT_PTRS, Some(pno));
            }
        }
        if let Some(ipno) = node.indirect() {
            self.vol.write_pod(page_offset(ipno), &ind);
        }

        node.size = new_size as u32;
        self.set_inode(ino, &node);
        Ok(())
    }

    /// Shrinks inode `ino` by `delta` bytes, releasing data pages in
    /// the reverse of the order grow attaches them.
    pub(crate) fn shrink(&mut self, ino: InodeNo, delta: u64) -> Result<(), StorageError> {
        let mut node = self.inode(ino)?;
        let size = u64::from(node.size);
        if delta > size {
            return Err(StorageError::ShrinkPastStart);
        }
        let old_pages = node.pages_used();
        let new_size = size - delta;
        let new_pages = bytes_to_pages(new_size) as usize;

        let mut ind = node
            .indirect()
            .map(|ipno| (ipno, self.vol.read_pod::<IndirectPage>(page_offset(ipno))));
        for idx in (new_pages..old_pages).rev() {
            if idx < NUM_DIRECT_PTRS {
                let Some(pno) = node.direct(idx) else {
                    return Err(StorageError::UnmappedPage);
                };
                self.vol.free_page(pno);
                node.set_direct(idx, None);
            } else {
                let Some((ipno, slots)) = ind.as_mut() else {
                    return Err(StorageError::UnmappedPage);
                };
                let slot = idx - NUM_DIRECT_PTRS;
                let Some(pno) = slots.get(slot) else {
                    return Err(StorageError::UnmappedPage);
                };
                self.vol.free_page(pno);
                slots.set(slot, None);
                if slot == 0 {
                    // Last indirect slot gone: the pointer page itself
                    // goes with it.
                    self.vol.free_page(*ipno);
                    node.set_indirect(None);
                    ind = None;
                }
            }
        }
        if let Some((ipno, slots)) = &ind {
            self.vol.write_pod(page_offset(*ipno), slots);
        }

        node.size = new_size as u32;
        self.set_inode(ino, &node);
        Ok(())
    }
}
