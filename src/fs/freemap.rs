//! Free-sector allocator.
//!
//! One bit per device sector, set while the sector is in use. The
//! bitmap is persisted through its own inode at a fixed reserved
//! sector and reloaded at mount. The allocator owns a private I/O
//! path straight to the device; it never calls into the sector cache,
//! so callers may invoke it while the cache is busy (but never while
//! holding a cache lock).

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use super::inode::DiskInode;
use crate::disk::{SectorBuf, SectorDevice};
use crate::param::{FREEMAP_SECTOR, INODE_MAGIC, NDIRECT, ROOT_SECTOR, SECTOR_SIZE};

struct Bits {
    bytes: Vec<u8>,
    /// Home sectors of the bitmap itself, in inode index order.
    map_sectors: Vec<u32>,
}

impl Bits {
    fn test(&self, sector: u32) -> bool {
        self.bytes[sector as usize / 8] & (1 << (sector % 8)) != 0
    }

    fn mark(&mut self, sector: u32) {
        debug_assert!(!self.test(sector), "freemap: marking used sector");
        self.bytes[sector as usize / 8] |= 1 << (sector % 8);
    }

    fn clear(&mut self, sector: u32) {
        assert!(self.test(sector), "freemap: releasing free sector");
        self.bytes[sector as usize / 8] &= !(1 << (sector % 8));
    }
}

pub struct FreeMap {
    dev: Arc<dyn SectorDevice>,
    inner: Mutex<Bits>,
}

impl FreeMap {
    /// Builds a fresh free map for `dev`, reserving the free-map
    /// inode, the root directory inode, and the bitmap's own data
    /// sectors, and persists the lot.
    pub fn format(dev: Arc<dyn SectorDevice>) -> Self {
        let total = dev.size();
        let mut bits = Bits {
            bytes: vec![0; (total as usize + 7) / 8],
            map_sectors: Vec::new(),
        };
        bits.mark(FREEMAP_SECTOR);
        bits.mark(ROOT_SECTOR);

        let nsectors = (bits.bytes.len() + SECTOR_SIZE - 1) / SECTOR_SIZE;
        assert!(
            nsectors <= NDIRECT,
            "freemap: device too large for a direct-mapped free map"
        );
        for i in 0..nsectors as u32 {
            let sector = ROOT_SECTOR + 1 + i;
            bits.mark(sector);
            bits.map_sectors.push(sector);
        }

        let mut image = DiskInode::empty(false);
        image.length = bits.bytes.len() as u32;
        image.direct_count = nsectors as u32;
        image.direct[..nsectors].copy_from_slice(&bits.map_sectors);
        dev.write(FREEMAP_SECTOR, &image.to_sector());

        debug!(
            "freemap: formatted {} sectors, bitmap in {} sectors",
            total, nsectors
        );
        let map = Self {
            dev,
            inner: Mutex::new(bits),
        };
        map.persist();
        map
    }

    /// Reloads the free map persisted by an earlier `format`.
    pub fn open(dev: Arc<dyn SectorDevice>) -> Self {
        let mut buf: SectorBuf = [0; SECTOR_SIZE];
        dev.read(FREEMAP_SECTOR, &mut buf);
        let image = DiskInode::from_sector(&buf);
        assert_eq!(image.magic, INODE_MAGIC, "freemap: bad inode magic");

        let mut bytes = vec![0; image.length as usize];
        let map_sectors: Vec<u32> = image.direct[..image.direct_count as usize].to_vec();
        for (i, sector) in map_sectors.iter().enumerate() {
            dev.read(*sector, &mut buf);
            let off = i * SECTOR_SIZE;
            let n = (bytes.len() - off).min(SECTOR_SIZE);
            bytes[off..off + n].copy_from_slice(&buf[..n]);
        }

        debug!("freemap: opened, {} sectors tracked", bytes.len() * 8);
        Self {
            dev,
            inner: Mutex::new(Bits { bytes, map_sectors }),
        }
    }

    /// Finds a contiguous run of `n` free sectors, marks it used, and
    /// returns its first sector.
    pub fn allocate(&self, n: u32) -> Option<u32> {
        assert!(n > 0);
        let mut bits = self.inner.lock().unwrap();
        let total = self.dev.size();

        let mut run = 0;
        for sector in 0..total {
            if bits.test(sector) {
                run = 0;
                continue;
            }
            run += 1;
            if run == n {
                let first = sector + 1 - n;
                for s in first..=sector {
                    bits.mark(s);
                }
                return Some(first);
            }
        }
        warn!("freemap: no run of {} free sectors", n);
        None
    }

    /// Returns the `n` sectors starting at `first` to the free pool.
    /// Releasing a sector that is already free is a fatal error.
    pub fn release(&self, first: u32, n: u32) {
        let mut bits = self.inner.lock().unwrap();
        for sector in first..first + n {
            bits.clear(sector);
        }
    }

    /// Number of sectors currently free.
    pub fn free_sectors(&self) -> u32 {
        let bits = self.inner.lock().unwrap();
        (0..self.dev.size()).filter(|s| !bits.test(*s)).count() as u32
    }

    /// Writes the bitmap back through the allocator's own device path.
    pub fn persist(&self) {
        let bits = self.inner.lock().unwrap();
        for (i, sector) in bits.map_sectors.iter().enumerate() {
            let off = i * SECTOR_SIZE;
            let n = (bits.bytes.len() - off).min(SECTOR_SIZE);
            let mut buf: SectorBuf = [0; SECTOR_SIZE];
            buf[..n].copy_from_slice(&bits.bytes[off..off + n]);
            self.dev.write(*sector, &buf);
        }
    }

    /// Persists and drops the map; called last at unmount, after the
    /// cache has flushed.
    pub fn close(&self) {
        self.persist();
        debug!("freemap: closed");
    }
}
