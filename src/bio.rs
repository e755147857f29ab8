//! Sector cache.
//!
//! The cache is a fixed array of slots holding copies of disk sector
//! contents. Caching sectors in memory reduces the number of device
//! reads and also provides a synchronization point for sectors used by
//! multiple threads.
//!
//! Interface:
//! * To read bytes out of a cached sector, call `read_through`.
//! * To install bytes into a cached sector, call `write_through`;
//!   the sector is written back to the device lazily.
//! * `flush_all` writes every dirty slot out and clears the access
//!   bits; it does not evict anything.
//! * `discard` drops a slot without flushing; only the deallocation
//!   path uses it, when a sector returns to the free map.
//!
//! Locking is split in two. The cache-wide lock guards the
//! sector-to-slot assignment and is held across the whole miss path
//! (victim selection, load, copy), so no thread ever observes a slot
//! mid-reassignment. On a hit the per-slot lock is taken and the
//! cache-wide lock released before the copy, so hot-sector copies on
//! distinct slots proceed in parallel. The read-ahead queue lock is a
//! leaf: it is only ever taken with no other cache lock held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use array_macro::array;
use bitflags::bitflags;
use itertools::izip;
use log::trace;

use crate::disk::{SectorBuf, SectorDevice};
use crate::param::{FLUSH_INTERVAL, NBUF, SECTOR_SIZE};

bitflags! {
    struct SlotFlags: u8 {
        /// The in-memory copy is newer than the disk copy.
        const DIRTY = 1 << 0;
        /// The slot has been used since the last flush.
        const ACCESSED = 1 << 1;
    }
}

struct Slot {
    data: SectorBuf,
    flags: SlotFlags,
}

impl Slot {
    fn new() -> Self {
        Self {
            data: [0; SECTOR_SIZE],
            flags: SlotFlags::empty(),
        }
    }
}

/// Sector assignment table; guarded by the cache-wide lock.
struct SlotMap {
    sectors: [Option<u32>; NBUF],
}

impl SlotMap {
    /// Slot currently holding `sector`, if any. Callers must hold the
    /// cache-wide lock.
    fn find(&self, sector: u32) -> Option<usize> {
        self.sectors.iter().position(|s| *s == Some(sector))
    }
}

pub struct BufCache {
    dev: Arc<dyn SectorDevice>,
    map: Mutex<SlotMap>,
    slots: [Mutex<Slot>; NBUF],

    readahead: Mutex<VecDeque<u32>>,
    readahead_cvar: Condvar,

    flush_gate: Mutex<()>,
    flush_cvar: Condvar,

    stopping: AtomicBool,
}

impl BufCache {
    pub fn new(dev: Arc<dyn SectorDevice>) -> Self {
        Self {
            dev,
            map: Mutex::new(SlotMap {
                sectors: [None; NBUF],
            }),
            slots: array![_ => Mutex::new(Slot::new()); NBUF],
            readahead: Mutex::new(VecDeque::new()),
            readahead_cvar: Condvar::new(),
            flush_gate: Mutex::new(()),
            flush_cvar: Condvar::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Copies `buf.len()` bytes at sector-offset `off` out of `sector`,
    /// loading the sector on a miss, and queues the next sector as a
    /// read-ahead hint.
    pub fn read_through(&self, sector: u32, buf: &mut [u8], off: usize) {
        assert!(off + buf.len() <= SECTOR_SIZE, "bio: read beyond sector");

        let mut map = self.map.lock().unwrap();
        match map.find(sector) {
            Some(idx) => {
                // Take the slot lock before giving up the cache-wide
                // lock so the slot cannot be re-targeted underneath us.
                let mut slot = self.slots[idx].lock().unwrap();
                drop(map);
                buf.copy_from_slice(&slot.data[off..off + buf.len()]);
                slot.flags |= SlotFlags::ACCESSED;
            }
            None => {
                let (_, slot) = self.install(&mut map, sector, true);
                buf.copy_from_slice(&slot.data[off..off + buf.len()]);
            }
        }

        self.hint(sector + 1);
    }

    /// Installs `buf.len()` bytes at sector-offset `off` into `sector`
    /// and marks the slot dirty. A partial write of an uncached sector
    /// loads the old contents first; a full-sector write skips the
    /// load.
    pub fn write_through(&self, sector: u32, buf: &[u8], off: usize) {
        assert!(off + buf.len() <= SECTOR_SIZE, "bio: write beyond sector");
        let partial = off > 0 || buf.len() < SECTOR_SIZE;

        let mut map = self.map.lock().unwrap();
        match map.find(sector) {
            Some(idx) => {
                let mut slot = self.slots[idx].lock().unwrap();
                drop(map);
                slot.data[off..off + buf.len()].copy_from_slice(buf);
                slot.flags |= SlotFlags::ACCESSED | SlotFlags::DIRTY;
            }
            None => {
                let (_, mut slot) = self.install(&mut map, sector, partial);
                slot.data[off..off + buf.len()].copy_from_slice(buf);
                slot.flags |= SlotFlags::DIRTY;
            }
        }
    }

    /// Writes every dirty slot to the device and clears all access
    /// bits. Slots stay valid.
    pub fn flush_all(&self) {
        let map = self.map.lock().unwrap();
        for (assigned, slot) in izip!(&map.sectors, &self.slots) {
            let sector = match assigned {
                Some(sector) => *sector,
                None => continue,
            };
            let mut slot = slot.lock().unwrap();
            if slot.flags.contains(SlotFlags::DIRTY) {
                self.dev.write(sector, &slot.data);
            }
            slot.flags = SlotFlags::empty();
        }
    }

    /// Drops the slot holding `sector`, if any, without writing it
    /// back. Callers guarantee the sector's contents are dead (it has
    /// just been released to the free map).
    pub fn discard(&self, sector: u32) {
        let mut map = self.map.lock().unwrap();
        if let Some(idx) = map.find(sector) {
            let mut slot = self.slots[idx].lock().unwrap();
            slot.data = [0; SECTOR_SIZE];
            slot.flags = SlotFlags::empty();
            map.sectors[idx] = None;
        }
    }

    /// Whether `sector` currently occupies a slot.
    pub fn contains(&self, sector: u32) -> bool {
        self.map.lock().unwrap().find(sector).is_some()
    }

    /// Assigns a slot to `sector` and returns it locked, with the
    /// device contents loaded when `load` is set and zeroes otherwise.
    /// The caller holds the cache-wide lock for the whole call, and the
    /// slot leaves with its access bit set.
    fn install(
        &self,
        map: &mut SlotMap,
        sector: u32,
        load: bool,
    ) -> (usize, MutexGuard<'_, Slot>) {
        assert!(sector < self.dev.size(), "bio: sector out of range");
        let idx = match map.sectors.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => self.evict(map),
        };
        map.sectors[idx] = Some(sector);

        let mut slot = self.slots[idx].lock().unwrap();
        if load {
            self.dev.read(sector, &mut slot.data);
        }
        slot.flags = SlotFlags::ACCESSED;
        (idx, slot)
    }

    /// Picks a victim slot, flushing it if dirty, and leaves it empty.
    ///
    /// Four passes in fixed order approximate LRU with write-back
    /// priority: clean and unaccessed slots go first, dirty and
    /// accessed slots last. Ties break toward the lower slot index.
    fn evict(&self, map: &mut SlotMap) -> usize {
        const PASSES: [(bool, bool); 4] =
            [(false, false), (false, true), (true, false), (true, true)];

        for (want_dirty, want_accessed) in PASSES.iter() {
            for (idx, assigned) in map.sectors.iter_mut().enumerate() {
                let sector = match assigned {
                    Some(sector) => *sector,
                    None => continue,
                };
                let mut slot = self.slots[idx].lock().unwrap();
                if slot.flags.contains(SlotFlags::DIRTY) != *want_dirty
                    || slot.flags.contains(SlotFlags::ACCESSED) != *want_accessed
                {
                    continue;
                }
                if *want_dirty {
                    self.dev.write(sector, &slot.data);
                }
                slot.data = [0; SECTOR_SIZE];
                slot.flags = SlotFlags::empty();
                *assigned = None;
                trace!("bio: evicted sector {} from slot {}", sector, idx);
                return idx;
            }
        }
        unreachable!("bio: no eviction candidate");
    }

    /// Queues a read-ahead request if the sector is in range.
    fn hint(&self, sector: u32) {
        if sector >= self.dev.size() {
            return;
        }
        self.readahead.lock().unwrap().push_back(sector);
        self.readahead_cvar.notify_one();
    }

    /// Starts the read-ahead worker and the periodic flusher. The
    /// handles must be joined after `shutdown`.
    pub fn start_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let readahead = {
            let cache = Arc::clone(self);
            thread::Builder::new()
                .name("sectorfs-readahead".into())
                .spawn(move || cache.readahead_loop())
                .expect("bio: spawn read-ahead worker")
        };
        let flusher = {
            let cache = Arc::clone(self);
            thread::Builder::new()
                .name("sectorfs-flusher".into())
                .spawn(move || cache.flusher_loop())
                .expect("bio: spawn flusher")
        };
        vec![readahead, flusher]
    }

    /// Wakes both workers and tells them to exit.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.readahead_cvar.notify_all();
        self.flush_cvar.notify_all();
    }

    /// Consumes queued sector hints and loads each one that is not
    /// already cached, fire-and-forget. Duplicate hints are tolerated.
    fn readahead_loop(&self) {
        loop {
            let sector = {
                let mut queue = self.readahead.lock().unwrap();
                loop {
                    if self.stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    match queue.pop_front() {
                        Some(sector) => break sector,
                        None => queue = self.readahead_cvar.wait(queue).unwrap(),
                    }
                }
            };

            let mut map = self.map.lock().unwrap();
            if map.find(sector).is_none() {
                trace!("bio: read-ahead of sector {}", sector);
                let _ = self.install(&mut map, sector, true);
            }
        }
    }

    /// Opportunistically flushes the cache at a fixed interval.
    fn flusher_loop(&self) {
        let mut gate = self.flush_gate.lock().unwrap();
        loop {
            let (next, _) = self.flush_cvar.wait_timeout(gate, FLUSH_INTERVAL).unwrap();
            gate = next;
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            drop(gate);
            self.flush_all();
            gate = self.flush_gate.lock().unwrap();
        }
    }
}
