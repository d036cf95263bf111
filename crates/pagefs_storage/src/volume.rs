//! The mapped volume: page-indexed access to the backing image and the
//! data-page allocator.

use std::{fs::OpenOptions, io, path::Path};

use dataview::{Pod, PodMethods as _};
use log::{debug, warn};
use memmap2::MmapMut;
use pagefs_types::{
    INODE_BITMAP_LEN, INODE_BITMAP_OFFSET, NUM_PAGES, PAGE_BITMAP_LEN, PAGE_SIZE, PageNo,
    VOLUME_SIZE,
};

use crate::{StorageError, bitmap};

/// Byte offset of page `pno` within the volume.
pub(crate) fn page_offset(pno: PageNo) -> usize {
    pno.as_index() * PAGE_SIZE
}

/// The whole backing image, mapped read/write for the process lifetime.
///
/// Records are copied in and out of the map rather than referenced in
/// place, so callers never hold pointers into it across mutations.
pub(crate) struct Volume {
    map: MmapMut,
}

impl Volume {
    /// Opens the image at `path`, creating it if absent, sizes it to
    /// exactly [`VOLUME_SIZE`] bytes and maps it.
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(VOLUME_SIZE)?;
        // Single-mount, single-accessor model: nothing else touches the
        // image while it is mapped.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    /// The content of page `pno`.
    ///
    /// # Panics
    ///
    /// Panics if `pno` is out of range.
    pub(crate) fn page(&self, pno: PageNo) -> &[u8] {
        let off = page_offset(pno);
        &self.map[off..off + PAGE_SIZE]
    }

    pub(crate) fn page_mut(&mut self, pno: PageNo) -> &mut [u8] {
        let off = page_offset(pno);
        &mut self.map[off..off + PAGE_SIZE]
    }

    pub(crate) fn zero_page(&mut self, pno: PageNo) {
        self.page_mut(pno).fill(0);
    }

    /// Copies the record of type `T` at `offset` out of the map.
    pub(crate) fn read_pod<T: Pod>(&self, offset: usize) -> T {
        let mut value = T::zeroed();
        value
            .as_bytes_mut()
            .copy_from_slice(&self.map[offset..offset + size_of::<T>()]);
        value
    }

    /// Copies `value` into the map at `offset`.
    pub(crate) fn write_pod<T: Pod>(&mut self, offset: usize, value: &T) {
        self.map[offset..offset + size_of::<T>()].copy_from_slice(value.as_bytes());
    }

    /// The page bitmap at the start of the metadata page.
    pub(crate) fn page_bitmap(&self) -> &[u8] {
        &self.map[..PAGE_BITMAP_LEN]
    }

    pub(crate) fn page_bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.map[..PAGE_BITMAP_LEN]
    }

    /// The inode bitmap, directly after the page bitmap.
    pub(crate) fn inode_bitmap(&self) -> &[u8] {
        &self.map[INODE_BITMAP_OFFSET..INODE_BITMAP_OFFSET + INODE_BITMAP_LEN]
    }

    pub(crate) fn inode_bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.map[INODE_BITMAP_OFFSET..INODE_BITMAP_OFFSET + INODE_BITMAP_LEN]
    }

    /// Claims the first free page and returns its number.
    ///
    /// Reserved pages are always marked allocated, so the scan from bit
    /// 0 only ever yields data pages. The page content is not zeroed;
    /// callers that need zero-initialization do it explicitly.
    pub(crate) fn alloc_page(&mut self) -> Result<PageNo, StorageError> {
        let Some(i) = bitmap::first_clear(self.page_bitmap(), NUM_PAGES) else {
            warn!("alloc_page: out of data pages");
            return Err(StorageError::OutOfDataPages);
        };
        bitmap::set(self.page_bitmap_mut(), i, true);
        debug!("alloc_page({i})");
        Ok(PageNo::new(i as u32))
    }

    /// Returns page `pno` to the allocator.
    pub(crate) fn free_page(&mut self, pno: PageNo) {
        let i = pno.as_index();
        debug_assert!(bitmap::get(self.page_bitmap(), i), "freeing free page {pno}");
        bitmap::set(self.page_bitmap_mut(), i, false);
        debug!("free_page({pno})");
    }

    /// Whether page `pno` is marked allocated.
    pub(crate) fn page_in_use(&self, pno: PageNo) -> bool {
        bitmap::get(self.page_bitmap(), pno.as_index())
    }
}

#[cfg(test)]
mod tests {
    use pagefs_types::DATA_START_PAGE;

    use super::*;

    fn scratch_volume() -> (tempfile::TempDir, Volume) {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::open(&dir.path().join("vol.img")).unwrap();
        (dir, vol)
    }

    #[test]
    fn test_open_sizes_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let _vol = Volume::open(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), VOLUME_SIZE);
    }

    #[test]
    fn test_alloc_skips_reserved_pages() {
        let (_dir, mut vol) = scratch_volume();
        for i in 0..DATA_START_PAGE {
            bitmap::set(vol.page_bitmap_mut(), i, true);
        }
        let pno = vol.alloc_page().unwrap();
        assert_eq!(pno.as_index(), DATA_START_PAGE);
        assert!(vol.page_in_use(pno));
    }

    #[test]
    fn test_free_page_clears_bit() {
        let (_dir, mut vol) = scratch_volume();
        for i in 0..DATA_START_PAGE {
            bitmap::set(vol.page_bitmap_mut(), i, true);
        }
        let pno = vol.alloc_page().unwrap();
        vol.free_page(pno);
        assert!(!vol.page_in_use(pno));
        // The slot is reused by the next allocation.
        assert_eq!(vol.alloc_page().unwrap(), pno);
    }

    #[test]
    fn test_pod_round_trip() {
        let (_dir, mut vol) = scratch_volume();
        let pno = PageNo::new(DATA_START_PAGE as u32);
        vol.page_mut(pno)[..4].copy_from_slice(&[1, 2, 3, 4]);
        let value: u32 = vol.read_pod(page_offset(pno));
        assert_eq!(value, u32::from_ne_bytes([1, 2, 3, 4]));
        vol.write_pod(page_offset(pno), &0xdead_beefu32);
        assert_eq!(vol.read_pod::<u32>(page_offset(pno)), 0xdead_beefu32);
    }
}
