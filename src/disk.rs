//! Block device facade.
//!
//! The file system sees the disk as an array of 512-byte sectors
//! addressed by a 32-bit index. Reads and writes are synchronous and
//! sector-atomic: a concurrent reader observes either the pre- or the
//! post-image of a write, never a mix.
//!
//! Two devices ship with the crate. `MemDisk` lives in memory and is
//! what the tests mount; `FileDisk` is backed by a host file and keeps
//! its contents across mounts.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::param::SECTOR_SIZE;

pub type SectorBuf = [u8; SECTOR_SIZE];

pub trait SectorDevice: Send + Sync {
    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut SectorBuf);

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &SectorBuf);

    /// Device capacity in sectors.
    fn size(&self) -> u32;
}

/// An in-memory sector array.
pub struct MemDisk {
    sectors: Mutex<Vec<SectorBuf>>,
}

impl MemDisk {
    pub fn new(sectors: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors as usize]),
        }
    }
}

impl SectorDevice for MemDisk {
    fn read(&self, sector: u32, buf: &mut SectorBuf) {
        let sectors = self.sectors.lock().unwrap();
        *buf = sectors[sector as usize];
    }

    fn write(&self, sector: u32, buf: &SectorBuf) {
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector as usize] = *buf;
    }

    fn size(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

/// A sector device persisted in a host file.
///
/// The backing file is sized once at creation; the device never grows.
pub struct FileDisk {
    file: Mutex<File>,
    sectors: u32,
}

impl FileDisk {
    /// Creates a fresh image of `sectors` sectors at `path`,
    /// truncating anything already there.
    pub fn create<P: AsRef<Path>>(path: P, sectors: u32) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(sectors as u64 * SECTOR_SIZE as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            sectors,
        })
    }

    /// Opens an existing image; capacity comes from the file length.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            sectors: (len / SECTOR_SIZE as u64) as u32,
        })
    }
}

impl SectorDevice for FileDisk {
    fn read(&self, sector: u32, buf: &mut SectorBuf) {
        assert!(sector < self.sectors, "disk: read past end of device");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .and_then(|_| file.read_exact(buf))
            .expect("disk: sector read failed");
    }

    fn write(&self, sector: u32, buf: &SectorBuf) {
        assert!(sector < self.sectors, "disk: write past end of device");
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))
            .and_then(|_| file.write_all(buf))
            .expect("disk: sector write failed");
    }

    fn size(&self) -> u32 {
        self.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_disk_round_trip() {
        let disk = MemDisk::new(8);
        let mut buf = [0xabu8; SECTOR_SIZE];
        disk.write(3, &buf);
        buf = [0; SECTOR_SIZE];
        disk.read(3, &mut buf);
        assert!(buf.iter().all(|b| *b == 0xab));
        disk.read(2, &mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn file_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let payload = [0x5au8; SECTOR_SIZE];
        {
            let disk = FileDisk::create(&path, 16).unwrap();
            assert_eq!(disk.size(), 16);
            disk.write(7, &payload);
        }
        let disk = FileDisk::open(&path).unwrap();
        assert_eq!(disk.size(), 16);
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read(7, &mut buf);
        assert_eq!(buf[..], payload[..]);
    }
}
