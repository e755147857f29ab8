//! Directories.
//!
//! A directory is an inode whose data stream is a packed sequence of
//! fixed-size entries. Entries are addressed by slot; removing one
//! clears its `in_use` byte and leaves the hole for the next `add`.
//! Every directory carries `.` and `..` entries from birth; `..` is
//! the parent back-reference that path resolution follows, and the
//! root's `..` points at the root itself.
//!
//! All scans and mutations of one directory serialize on the inode's
//! entry lock. Entry I/O goes through the ordinary inode read/write
//! path, so appending an entry grows the directory like any file.

use core::mem;

use arrayvec::ArrayString;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::inode::Inode;
use super::path::FileName;
use super::FileSystem;
use crate::error::{FsError, Result};
use crate::param::DIRSIZ;

/// On-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dirent {
    /// Home sector of the child inode.
    sector: u32,

    /// NUL-terminated name.
    name: [u8; DIRSIZ + 1],

    /// 1 while the slot is live.
    in_use: u8,
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

const_assert_eq!(DIRENT_SIZE, 20);

impl Dirent {
    fn new(name: &FileName, sector: u32) -> Self {
        let mut de = Self {
            sector,
            name: [0; DIRSIZ + 1],
            in_use: 1,
        };
        de.set_name(name);
        de
    }

    /// Fill in name, NUL-terminated. `FileName` guarantees it fits.
    fn set_name(&mut self, name: &FileName) {
        let bytes = name.as_bytes();
        self.name[..bytes.len()].copy_from_slice(bytes);
        self.name[bytes.len()] = 0;
    }

    fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

impl Inode {
    fn dir_slots(&self) -> u32 {
        self.len() / DIRENT_SIZE as u32
    }

    fn read_slot(&self, fs: &FileSystem, slot: u32) -> Dirent {
        let mut de = Dirent::default();
        let read = self.read_at(fs, de.as_bytes_mut(), slot * DIRENT_SIZE as u32);
        assert_eq!(read, DIRENT_SIZE, "dir: torn entry read");
        de
    }

    /// Writes a new entry for `name` into the first free slot,
    /// appending one if the directory is full. Fails on a duplicate
    /// name, an over-long name, or when the directory cannot grow.
    pub fn dir_add(&self, fs: &FileSystem, name: &str, child_sector: u32) -> Result<()> {
        assert!(self.is_dir(), "dir: add to a non-directory");
        let name = FileName::new(name)?;
        let _entries = self.entries.lock().unwrap();

        let mut free_slot = None;
        for slot in 0..self.dir_slots() {
            let de = self.read_slot(fs, slot);
            if de.in_use == 0 {
                free_slot.get_or_insert(slot);
            } else if de.name() == name.as_str() {
                return Err(FsError::AlreadyExists);
            }
        }

        let slot = free_slot.unwrap_or_else(|| self.dir_slots());
        let de = Dirent::new(name, child_sector);
        let written = self.write_at(fs, de.as_bytes(), slot * DIRENT_SIZE as u32);
        if written != DIRENT_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Linear scan for `name`; returns the child's home sector.
    pub fn dir_lookup(&self, fs: &FileSystem, name: &str) -> Result<u32> {
        assert!(self.is_dir(), "dir: lookup in a non-directory");
        let name = FileName::new(name)?;
        let _entries = self.entries.lock().unwrap();

        for slot in 0..self.dir_slots() {
            let de = self.read_slot(fs, slot);
            if de.in_use != 0 && de.name() == name.as_str() {
                return Ok(de.sector);
            }
        }
        Err(FsError::NotFound)
    }

    /// Clears the slot holding `name`. The child inode itself is the
    /// caller's business.
    pub fn dir_remove(&self, fs: &FileSystem, name: &str) -> Result<()> {
        let name = FileName::new(name)?;
        let _entries = self.entries.lock().unwrap();

        for slot in 0..self.dir_slots() {
            let mut de = self.read_slot(fs, slot);
            if de.in_use != 0 && de.name() == name.as_str() {
                de.in_use = 0;
                let written = self.write_at(fs, de.as_bytes(), slot * DIRENT_SIZE as u32);
                assert_eq!(written, DIRENT_SIZE, "dir: entry writeback failed");
                return Ok(());
            }
        }
        Err(FsError::NotFound)
    }

    /// Whether the directory holds nothing but `.` and `..`.
    pub fn dir_is_empty(&self, fs: &FileSystem) -> bool {
        let _entries = self.entries.lock().unwrap();
        self.scan_empty(fs)
    }

    /// Emptiness scan; the caller holds the entry lock.
    pub(crate) fn scan_empty(&self, fs: &FileSystem) -> bool {
        for slot in 0..self.dir_slots() {
            let de = self.read_slot(fs, slot);
            if de.in_use != 0 && de.name() != "." && de.name() != ".." {
                return false;
            }
        }
        true
    }

    /// Advances `slot` past free and dot entries and returns the next
    /// live name, or `None` at the end of the directory.
    pub fn dir_read_next(&self, fs: &FileSystem, slot: &mut u32) -> Option<ArrayString<DIRSIZ>> {
        let _entries = self.entries.lock().unwrap();
        while *slot < self.dir_slots() {
            let de = self.read_slot(fs, *slot);
            *slot += 1;
            if de.in_use != 0 && de.name() != "." && de.name() != ".." {
                return Some(ArrayString::from(de.name()).expect("dir: name fits"));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::mem_fs;
    use crate::param::ROOT_SECTOR;

    #[test]
    fn add_lookup_remove() {
        let fs = mem_fs(1024);
        let root = fs.root();

        assert_eq!(root.dir_lookup(&fs, "a"), Err(FsError::NotFound));
        root.dir_add(&fs, "a", 99).unwrap();
        assert_eq!(root.dir_lookup(&fs, "a"), Ok(99));
        assert_eq!(root.dir_add(&fs, "a", 100), Err(FsError::AlreadyExists));

        root.dir_remove(&fs, "a").unwrap();
        assert_eq!(root.dir_lookup(&fs, "a"), Err(FsError::NotFound));
        assert_eq!(root.dir_remove(&fs, "a"), Err(FsError::NotFound));

        fs.close_inode(root);
    }

    #[test]
    fn dot_entries_resolve_to_self_at_root() {
        let fs = mem_fs(1024);
        let root = fs.root();
        assert_eq!(root.dir_lookup(&fs, ".").unwrap(), ROOT_SECTOR);
        assert_eq!(root.dir_lookup(&fs, "..").unwrap(), ROOT_SECTOR);
        fs.close_inode(root);
    }

    #[test]
    fn freed_slots_are_reused() {
        let fs = mem_fs(1024);
        let root = fs.root();

        root.dir_add(&fs, "a", 10).unwrap();
        root.dir_add(&fs, "b", 11).unwrap();
        let len = root.len();

        root.dir_remove(&fs, "a").unwrap();
        root.dir_add(&fs, "c", 12).unwrap();
        // "c" went into "a"'s old slot instead of growing the stream.
        assert_eq!(root.len(), len);

        fs.close_inode(root);
    }

    #[test]
    fn name_bounds_are_enforced() {
        let fs = mem_fs(1024);
        let root = fs.root();
        assert_eq!(
            root.dir_add(&fs, "a-very-long-name!", 10),
            Err(FsError::NameTooLong)
        );
        assert!(root.dir_add(&fs, "12345678901234", 10).is_ok());
        fs.close_inode(root);
    }

    #[test]
    fn readdir_skips_dots_and_holes() {
        let fs = mem_fs(1024);
        let root = fs.root();

        for (name, sector) in &[("x", 21u32), ("y", 22), ("z", 23)] {
            root.dir_add(&fs, name, *sector).unwrap();
        }
        root.dir_remove(&fs, "y").unwrap();

        let mut slot = 0;
        let mut seen = Vec::new();
        while let Some(name) = root.dir_read_next(&fs, &mut slot) {
            seen.push(name.as_str().to_string());
        }
        assert_eq!(seen, vec!["x", "z"]);

        fs.close_inode(root);
    }

    #[test]
    fn emptiness_ignores_dots() {
        let fs = mem_fs(1024);
        let root = fs.root();
        assert!(root.dir_is_empty(&fs));
        root.dir_add(&fs, "f", 30).unwrap();
        assert!(!root.dir_is_empty(&fs));
        root.dir_remove(&fs, "f").unwrap();
        assert!(root.dir_is_empty(&fs));
        fs.close_inode(root);
    }
}
