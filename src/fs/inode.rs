//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! structure occupies exactly one sector and holds the byte length,
//! per-class sector counts, and the index: 12 direct pointers, 4
//! single-indirect pointers, and 1 double-indirect pointer. Indirect
//! blocks are plain sectors of 128 pointers, written and read through
//! the device facade rather than the sector cache, so the cache never
//! holds a pointer block.
//!
//! The in-memory inode adds bookkeeping that never reaches the disk:
//! the open count, the removed flag, the deny-write counter, and the
//! readable barrier.
//!
//! * Identity: `Itable` keeps every open inode in a list, so opening
//!   the same sector twice yields the same `Arc` with a bumped open
//!   count. An entry leaves the list when its open count hits zero;
//!   if it was marked removed, its data sectors, its pointer blocks,
//!   and finally its home sector are released.
//!
//! * Growth: a write past the current length extends the inode under a
//!   single file-growth lock shared by the whole file system. The
//!   length and the index grow and the image is written back before
//!   any data lands; `readable_length` advances only after the last
//!   chunk, so a concurrent reader sees either the old size or the
//!   fully written tail, never bytes in flight.
//!
//! * Deny-write: a counter between 0 and the open count. While it is
//!   non-zero, writes return 0. The descriptor layer uses it to keep
//!   executables unwritable while they run.

use core::cmp::min;
use core::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use scopeguard::{guard, ScopeGuard};
use static_assertions::{const_assert, const_assert_eq};
use zerocopy::{AsBytes, FromBytes};

use super::FileSystem;
use crate::disk::{SectorBuf, SectorDevice};
use crate::error::{FsError, Result};
use crate::param::{
    INODE_MAGIC, MAXFILE_SECTORS, NDIRECT, NINDIRECT, PTRS_PER_SECTOR, SECTOR_SIZE,
};

/// On-disk inode structure. The image occupies the leading bytes of
/// its home sector; the remainder of the sector is zero padding.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    /// File size in bytes.
    pub(crate) length: u32,

    /// Data sectors reachable through direct pointers.
    pub(crate) direct_count: u32,

    /// Data sectors reachable through single-indirect pointers.
    pub(crate) indirect_count: u32,

    /// Data sectors reachable through the double-indirect pointer.
    pub(crate) double_indirect_count: u32,

    /// Always `INODE_MAGIC`.
    pub(crate) magic: u32,

    /// 1 for a directory, 0 for a regular file.
    pub(crate) is_dir: u32,

    /// Direct data sector pointers.
    pub(crate) direct: [u32; NDIRECT],

    /// Single-indirect block pointers.
    pub(crate) indirect: [u32; NINDIRECT],

    /// Double-indirect block pointer.
    pub(crate) double_indirect: u32,
}

const_assert!(mem::size_of::<DiskInode>() <= SECTOR_SIZE);

impl DiskInode {
    pub(crate) fn empty(is_dir: bool) -> Self {
        Self {
            length: 0,
            direct_count: 0,
            indirect_count: 0,
            double_indirect_count: 0,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            direct: [0; NDIRECT],
            indirect: [0; NINDIRECT],
            double_indirect: 0,
        }
    }

    pub(crate) fn from_sector(buf: &SectorBuf) -> Self {
        let mut image = Self::empty(false);
        let len = mem::size_of::<Self>();
        image.as_bytes_mut().copy_from_slice(&buf[..len]);
        image
    }

    /// The image padded out to a full sector.
    pub(crate) fn to_sector(&self) -> SectorBuf {
        let mut buf: SectorBuf = [0; SECTOR_SIZE];
        buf[..mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
        buf
    }

    /// Data sectors currently reachable from the index.
    fn total_sectors(&self) -> usize {
        (self.direct_count + self.indirect_count + self.double_indirect_count) as usize
    }
}

/// A sector interpreted as 128 sector pointers.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct PtrBlock {
    ptrs: [u32; PTRS_PER_SECTOR],
}

const_assert_eq!(mem::size_of::<PtrBlock>(), SECTOR_SIZE);

impl PtrBlock {
    fn zeroed() -> Self {
        Self {
            ptrs: [0; PTRS_PER_SECTOR],
        }
    }

    fn read(dev: &dyn SectorDevice, sector: u32) -> Self {
        let mut buf: SectorBuf = [0; SECTOR_SIZE];
        dev.read(sector, &mut buf);
        let mut block = Self::zeroed();
        block.as_bytes_mut().copy_from_slice(&buf[..]);
        block
    }

    fn write(&self, dev: &dyn SectorDevice, sector: u32) {
        let mut buf: SectorBuf = [0; SECTOR_SIZE];
        buf.copy_from_slice(self.as_bytes());
        dev.write(sector, &buf);
    }
}

struct InodeMeta {
    open_cnt: u32,
    removed: bool,
    deny_write: u32,
}

/// In-memory inode. At most one exists per home sector; see `Itable`.
pub struct Inode {
    /// Sector holding the on-disk image.
    pub sector: u32,

    is_dir: bool,

    meta: spin::Mutex<InodeMeta>,

    /// Largest offset readers may observe; always <= the on-disk
    /// length, and equal to it outside a growing write.
    readable: AtomicU32,

    /// Cached on-disk image.
    disk: Mutex<DiskInode>,

    /// Serializes directory entry mutation and scans.
    pub(crate) entries: Mutex<()>,
}

pub(crate) fn bytes_to_sectors(length: u32) -> usize {
    (length as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Maps a byte offset to the data sector holding it. The offset must
/// be below the inode's length, which guarantees the index covers it.
fn byte_to_sector(dev: &dyn SectorDevice, disk: &DiskInode, pos: u32) -> u32 {
    debug_assert!(pos < disk.length, "inode: offset past end");
    let idx = pos as usize / SECTOR_SIZE;

    if idx < NDIRECT {
        return disk.direct[idx];
    }
    let idx = idx - NDIRECT;

    if idx < NINDIRECT * PTRS_PER_SECTOR {
        let block = PtrBlock::read(dev, disk.indirect[idx / PTRS_PER_SECTOR]);
        return block.ptrs[idx % PTRS_PER_SECTOR];
    }
    let idx = idx - NINDIRECT * PTRS_PER_SECTOR;

    let outer = PtrBlock::read(dev, disk.double_indirect);
    let block = PtrBlock::read(dev, outer.ptrs[idx / PTRS_PER_SECTOR]);
    block.ptrs[idx % PTRS_PER_SECTOR]
}

/// Allocates one data sector, records it for rollback, and zero-fills
/// it on the device.
fn alloc_data(fs: &FileSystem, claimed: &mut Vec<u32>) -> Result<u32> {
    let sector = fs.freemap.allocate(1).ok_or(FsError::NoSpace)?;
    claimed.push(sector);
    fs.dev.write(sector, &[0; SECTOR_SIZE]);
    Ok(sector)
}

/// Allocates a sector destined to hold a pointer block. The caller
/// writes the block contents; no zero-fill happens here.
fn alloc_ptr(fs: &FileSystem, claimed: &mut Vec<u32>) -> Result<u32> {
    let sector = fs.freemap.allocate(1).ok_or(FsError::NoSpace)?;
    claimed.push(sector);
    Ok(sector)
}

impl Inode {
    /// Initializes an inode of `length` bytes and writes it to
    /// `sector`. Data sectors are allocated class by class (direct,
    /// then whole indirect blocks, then the double-indirect tree) and
    /// zero-filled; pointer blocks go straight to the device. On
    /// allocation failure every sector taken so far is released and
    /// nothing is written to `sector`.
    pub fn create(fs: &FileSystem, sector: u32, length: u32, is_dir: bool) -> Result<()> {
        let sectors = bytes_to_sectors(length);
        if sectors > MAXFILE_SECTORS {
            return Err(FsError::NoSpace);
        }

        let mut image = DiskInode::empty(is_dir);
        image.length = length;

        let mut claimed = guard(Vec::new(), |claimed: Vec<u32>| {
            for s in claimed {
                fs.freemap.release(s, 1);
            }
        });
        Self::allocate_sectors(fs, &mut image, sectors, &mut *claimed)?;
        ScopeGuard::into_inner(claimed);

        fs.cache.write_through(sector, &image.to_sector(), 0);
        debug!(
            "inode: created sector {} ({} bytes, dir: {})",
            sector, length, is_dir
        );
        Ok(())
    }

    /// Bulk allocation for `create`: fills direct slots first, then
    /// whole indirect blocks, then the double-indirect tree, writing
    /// each pointer block once.
    fn allocate_sectors(
        fs: &FileSystem,
        image: &mut DiskInode,
        total: usize,
        claimed: &mut Vec<u32>,
    ) -> Result<()> {
        let dev = &*fs.dev;
        let mut left = total;

        while left > 0 && (image.direct_count as usize) < NDIRECT {
            let s = alloc_data(fs, claimed)?;
            image.direct[image.direct_count as usize] = s;
            image.direct_count += 1;
            left -= 1;
        }

        let mut slot = 0;
        while left > 0 && slot < NINDIRECT {
            let block_sector = alloc_ptr(fs, claimed)?;
            image.indirect[slot] = block_sector;

            let mut block = PtrBlock::zeroed();
            let fill = min(left, PTRS_PER_SECTOR);
            for ptr in block.ptrs[..fill].iter_mut() {
                *ptr = alloc_data(fs, claimed)?;
            }
            block.write(dev, block_sector);

            image.indirect_count += fill as u32;
            left -= fill;
            slot += 1;
        }

        if left > 0 {
            let outer_sector = alloc_ptr(fs, claimed)?;
            image.double_indirect = outer_sector;

            let mut outer = PtrBlock::zeroed();
            let mut oi = 0;
            while left > 0 && oi < PTRS_PER_SECTOR {
                let inner_sector = alloc_ptr(fs, claimed)?;
                outer.ptrs[oi] = inner_sector;

                let mut inner = PtrBlock::zeroed();
                let fill = min(left, PTRS_PER_SECTOR);
                for ptr in inner.ptrs[..fill].iter_mut() {
                    *ptr = alloc_data(fs, claimed)?;
                }
                inner.write(dev, inner_sector);

                image.double_indirect_count += fill as u32;
                left -= fill;
                oi += 1;
            }
            outer.write(dev, outer_sector);
        }

        debug_assert_eq!(left, 0);
        Ok(())
    }

    /// File length in bytes.
    pub fn len(&self) -> u32 {
        self.disk.lock().unwrap().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Largest offset readers are currently allowed to observe.
    pub fn readable_len(&self) -> u32 {
        self.readable.load(Ordering::Acquire)
    }

    /// Copies up to `buf.len()` bytes starting at `offset` into `buf`,
    /// clipped by the readable barrier. Returns the bytes copied; a
    /// read past the end returns 0.
    pub fn read_at(&self, fs: &FileSystem, buf: &mut [u8], offset: u32) -> usize {
        let readable = self.readable.load(Ordering::Acquire);
        if offset >= readable {
            return 0;
        }
        let n = min(buf.len(), (readable - offset) as usize);

        let mut done = 0;
        while done < n {
            let pos = offset + done as u32;
            let sector = {
                let disk = self.disk.lock().unwrap();
                byte_to_sector(&*fs.dev, &disk, pos)
            };
            let off_in_sector = pos as usize % SECTOR_SIZE;
            let m = min(n - done, SECTOR_SIZE - off_in_sector);
            fs.cache.read_through(sector, &mut buf[done..done + m], off_in_sector);
            done += m;
        }
        n
    }

    /// Copies `buf` into the inode at `offset`, growing the inode
    /// first when the write extends past the current length. Returns
    /// the bytes written: all of `buf`, or 0 when writes are denied or
    /// the growth cannot be allocated.
    pub fn write_at(&self, fs: &FileSystem, buf: &[u8], offset: u32) -> usize {
        if self.meta.lock().deny_write > 0 {
            return 0;
        }
        if buf.is_empty() {
            return 0;
        }
        let end = offset as u64 + buf.len() as u64;
        if end > (MAXFILE_SECTORS * SECTOR_SIZE) as u64 {
            return 0;
        }
        let end = end as u32;

        if end > self.len() {
            let _growth = fs.growth.lock().unwrap();
            let mut disk = self.disk.lock().unwrap();
            if end > disk.length {
                if self.grow(fs, &mut disk, end).is_err() {
                    return 0;
                }
                disk.length = end;
                fs.cache.write_through(self.sector, &disk.to_sector(), 0);
            }
        }

        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u32;
            let sector = {
                let disk = self.disk.lock().unwrap();
                byte_to_sector(&*fs.dev, &disk, pos)
            };
            let off_in_sector = pos as usize % SECTOR_SIZE;
            let m = min(buf.len() - done, SECTOR_SIZE - off_in_sector);
            fs.cache.write_through(sector, &buf[done..done + m], off_in_sector);
            done += m;
        }

        // Publish the tail only once every byte of it is in place.
        self.readable.fetch_max(end, Ordering::Release);
        buf.len()
    }

    /// Extends the index so it covers `new_length` bytes, zero-filling
    /// every new data sector. Called with the growth lock and the
    /// image lock held. On failure the image and the free map are left
    /// as they were.
    fn grow(&self, fs: &FileSystem, disk: &mut DiskInode, new_length: u32) -> Result<()> {
        let saved = *disk;
        let need = bytes_to_sectors(new_length) - disk.total_sectors();

        let mut claimed = guard(Vec::new(), |claimed: Vec<u32>| {
            for s in claimed {
                fs.freemap.release(s, 1);
            }
        });
        for _ in 0..need {
            if let Err(err) = Self::append_data_sector(fs, disk, &mut *claimed) {
                *disk = saved;
                return Err(err);
            }
        }
        ScopeGuard::into_inner(claimed);

        debug!(
            "inode: sector {} grew to {} bytes ({} new sectors)",
            self.sector, new_length, need
        );
        Ok(())
    }

    /// Hangs one more zero-filled data sector off the index, following
    /// the class order direct -> indirect -> double-indirect.
    fn append_data_sector(
        fs: &FileSystem,
        disk: &mut DiskInode,
        claimed: &mut Vec<u32>,
    ) -> Result<()> {
        let dev = &*fs.dev;

        if (disk.direct_count as usize) < NDIRECT {
            let s = alloc_data(fs, claimed)?;
            disk.direct[disk.direct_count as usize] = s;
            disk.direct_count += 1;
            return Ok(());
        }

        if (disk.indirect_count as usize) < NINDIRECT * PTRS_PER_SECTOR {
            let slot = disk.indirect_count as usize / PTRS_PER_SECTOR;
            let within = disk.indirect_count as usize % PTRS_PER_SECTOR;

            let (block_sector, mut block) = if within == 0 {
                let s = alloc_ptr(fs, claimed)?;
                disk.indirect[slot] = s;
                (s, PtrBlock::zeroed())
            } else {
                let s = disk.indirect[slot];
                (s, PtrBlock::read(dev, s))
            };

            block.ptrs[within] = alloc_data(fs, claimed)?;
            block.write(dev, block_sector);
            disk.indirect_count += 1;
            return Ok(());
        }

        if (disk.double_indirect_count as usize) < PTRS_PER_SECTOR * PTRS_PER_SECTOR {
            let count = disk.double_indirect_count as usize;
            let (outer_sector, mut outer) = if count == 0 {
                let s = alloc_ptr(fs, claimed)?;
                disk.double_indirect = s;
                (s, PtrBlock::zeroed())
            } else {
                let s = disk.double_indirect;
                (s, PtrBlock::read(dev, s))
            };

            let oi = count / PTRS_PER_SECTOR;
            let within = count % PTRS_PER_SECTOR;
            let (inner_sector, mut inner) = if within == 0 {
                let s = alloc_ptr(fs, claimed)?;
                outer.ptrs[oi] = s;
                outer.write(dev, outer_sector);
                (s, PtrBlock::zeroed())
            } else {
                (outer.ptrs[oi], PtrBlock::read(dev, outer.ptrs[oi]))
            };

            inner.ptrs[within] = alloc_data(fs, claimed)?;
            inner.write(dev, inner_sector);
            disk.double_indirect_count += 1;
            return Ok(());
        }

        Err(FsError::NoSpace)
    }

    /// Disables writes; one call per opener at most.
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock();
        meta.deny_write += 1;
        assert!(
            meta.deny_write <= meta.open_cnt,
            "inode: more deniers than openers"
        );
    }

    /// Re-enables writes; pairs with an earlier `deny_write` by the
    /// same opener.
    pub fn allow_write(&self) {
        let mut meta = self.meta.lock();
        assert!(meta.deny_write > 0, "inode: allow without deny");
        meta.deny_write -= 1;
    }

    pub fn write_denied(&self) -> bool {
        self.meta.lock().deny_write > 0
    }

    /// Marks the inode for deletion at last close.
    pub fn mark_removed(&self) {
        self.meta.lock().removed = true;
    }

    /// Releases every data sector and pointer block, classes in
    /// reverse index order, and drops their cache slots.
    fn deallocate(fs: &FileSystem, disk: &DiskInode) {
        let dev = &*fs.dev;

        let release_data = |sector: u32| {
            fs.freemap.release(sector, 1);
            fs.cache.discard(sector);
        };

        for i in (0..disk.direct_count as usize).rev() {
            release_data(disk.direct[i]);
        }

        let mut remaining = disk.indirect_count as usize;
        let nblocks = (remaining + PTRS_PER_SECTOR - 1) / PTRS_PER_SECTOR;
        for slot in (0..nblocks).rev() {
            let block_sector = disk.indirect[slot];
            let count = remaining - slot * PTRS_PER_SECTOR;
            let block = PtrBlock::read(dev, block_sector);
            for i in (0..count).rev() {
                release_data(block.ptrs[i]);
            }
            fs.freemap.release(block_sector, 1);
            remaining = slot * PTRS_PER_SECTOR;
        }

        if disk.double_indirect_count > 0 {
            let outer_sector = disk.double_indirect;
            let outer = PtrBlock::read(dev, outer_sector);
            let mut remaining = disk.double_indirect_count as usize;
            let ninner = (remaining + PTRS_PER_SECTOR - 1) / PTRS_PER_SECTOR;
            for oi in (0..ninner).rev() {
                let inner_sector = outer.ptrs[oi];
                let count = remaining - oi * PTRS_PER_SECTOR;
                let inner = PtrBlock::read(dev, inner_sector);
                for i in (0..count).rev() {
                    release_data(inner.ptrs[i]);
                }
                fs.freemap.release(inner_sector, 1);
                remaining = oi * PTRS_PER_SECTOR;
            }
            fs.freemap.release(outer_sector, 1);
        }
    }
}

/// Table of open inodes: the identity map that guarantees one
/// in-memory inode per home sector.
pub struct Itable {
    list: spin::Mutex<Vec<Arc<Inode>>>,
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            list: spin::Mutex::new(Vec::new()),
        }
    }

    /// Opens the inode at `sector`, reading its image through the
    /// cache, or bumps the open count of an already-open one. A magic
    /// mismatch is fatal.
    pub fn open(&self, fs: &FileSystem, sector: u32) -> Arc<Inode> {
        if let Some(ip) = self.bump_if_open(sector) {
            return ip;
        }

        let mut buf: SectorBuf = [0; SECTOR_SIZE];
        fs.cache.read_through(sector, &mut buf, 0);
        let image = DiskInode::from_sector(&buf);
        assert_eq!(
            image.magic, INODE_MAGIC,
            "inode: bad magic at sector {}",
            sector
        );

        let ip = Arc::new(Inode {
            sector,
            is_dir: image.is_dir != 0,
            meta: spin::Mutex::new(InodeMeta {
                open_cnt: 1,
                removed: false,
                deny_write: 0,
            }),
            readable: AtomicU32::new(image.length),
            disk: Mutex::new(image),
            entries: Mutex::new(()),
        });

        let mut list = self.list.lock();
        if let Some(existing) = list.iter().find(|i| i.sector == sector) {
            // Lost a race with another opener; take its entry.
            let existing = Arc::clone(existing);
            existing.meta.lock().open_cnt += 1;
            return existing;
        }
        list.push(Arc::clone(&ip));
        ip
    }

    fn bump_if_open(&self, sector: u32) -> Option<Arc<Inode>> {
        let list = self.list.lock();
        let ip = list.iter().find(|i| i.sector == sector)?;
        ip.meta.lock().open_cnt += 1;
        Some(Arc::clone(ip))
    }

    /// Another reference to an already-open inode.
    pub fn reopen(&self, ip: &Arc<Inode>) -> Arc<Inode> {
        ip.meta.lock().open_cnt += 1;
        Arc::clone(ip)
    }

    /// Drops one reference. The last close of a removed inode frees
    /// its data sectors and its home sector.
    pub fn close(&self, fs: &FileSystem, ip: Arc<Inode>) {
        let last_and_removed = {
            let mut list = self.list.lock();
            let mut meta = ip.meta.lock();
            assert!(meta.open_cnt > 0, "inode: close without open");
            meta.open_cnt -= 1;
            debug_assert!(meta.deny_write <= meta.open_cnt);
            if meta.open_cnt == 0 {
                list.retain(|i| i.sector != ip.sector);
                meta.removed
            } else {
                false
            }
        };

        if last_and_removed {
            let disk = ip.disk.lock().unwrap();
            Inode::deallocate(fs, &disk);
            fs.freemap.release(ip.sector, 1);
            fs.cache.discard(ip.sector);
            debug!("inode: sector {} removed and freed", ip.sector);
        }
    }

    /// Open count of `sector`, for assertions in tests.
    #[cfg(test)]
    pub(crate) fn open_count(&self, sector: u32) -> u32 {
        let list = self.list.lock();
        list.iter()
            .find(|i| i.sector == sector)
            .map(|i| i.meta.lock().open_cnt)
            .unwrap_or(0)
    }
}
