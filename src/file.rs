//! Open file and directory objects referenced by descriptors.
//!
//! A regular file handle carries a byte cursor over its inode; a
//! directory handle carries an entry cursor that `readdir` advances.
//! Handles own one open-inode reference and give it back on close.
//!
//! `deny_write`/`allow_write` wrap the inode's deny-write counter so
//! a handle can set it at most once and is guaranteed to release it
//! when closed; the process layer uses this to keep executables
//! unwritable while they run.

use std::sync::Arc;

use arrayvec::ArrayString;

use crate::fs::{FileSystem, Inode};
use crate::param::DIRSIZ;

/// A byte cursor over a regular file's inode.
pub struct File {
    ip: Arc<Inode>,
    pos: u32,
    denied: bool,
}

impl File {
    /// Wraps an opened inode. The handle owns the reference.
    pub fn new(ip: Arc<Inode>) -> Self {
        Self {
            ip,
            pos: 0,
            denied: false,
        }
    }

    pub fn size(&self) -> u32 {
        self.ip.len()
    }

    pub fn inumber(&self) -> u32 {
        self.ip.sector
    }

    /// Reads from the cursor, advancing it by the bytes copied.
    pub fn read(&mut self, fs: &FileSystem, buf: &mut [u8]) -> usize {
        let n = self.ip.read_at(fs, buf, self.pos);
        self.pos += n as u32;
        n
    }

    /// Writes at the cursor, advancing it by the bytes copied. Returns
    /// 0 while writes are denied.
    pub fn write(&mut self, fs: &FileSystem, buf: &[u8]) -> usize {
        let n = self.ip.write_at(fs, buf, self.pos);
        self.pos += n as u32;
        n
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Blocks writes through every handle of this inode. At most one
    /// deny per handle; a second call is a no-op.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.ip.deny_write();
            self.denied = true;
        }
    }

    /// Releases this handle's deny, if it holds one.
    pub fn allow_write(&mut self) {
        if self.denied {
            self.ip.allow_write();
            self.denied = false;
        }
    }

    /// Drops the handle and its inode reference.
    pub fn close(mut self, fs: &FileSystem) {
        self.allow_write();
        fs.close_inode(self.ip);
    }
}

/// An entry cursor over a directory's inode.
pub struct DirFile {
    ip: Arc<Inode>,
    slot: u32,
}

impl DirFile {
    pub fn new(ip: Arc<Inode>) -> Self {
        Self { ip, slot: 0 }
    }

    pub fn inumber(&self) -> u32 {
        self.ip.sector
    }

    /// Next live entry name past `.` and `..`, advancing the cursor.
    pub fn read_next(&mut self, fs: &FileSystem) -> Option<ArrayString<DIRSIZ>> {
        self.ip.dir_read_next(fs, &mut self.slot)
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.ip
    }

    pub fn close(self, fs: &FileSystem) {
        fs.close_inode(self.ip);
    }
}

/// What a descriptor of 3 or above points at.
pub enum FdObject {
    File(File),
    Dir(DirFile),
}

impl FdObject {
    pub fn is_dir(&self) -> bool {
        matches!(self, FdObject::Dir(_))
    }

    pub fn inumber(&self) -> u32 {
        match self {
            FdObject::File(f) => f.inumber(),
            FdObject::Dir(d) => d.inumber(),
        }
    }

    pub fn close(self, fs: &FileSystem) {
        match self {
            FdObject::File(f) => f.close(fs),
            FdObject::Dir(d) => d.close(fs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::mem_fs;

    #[test]
    fn cursor_advances_on_read_and_write() {
        let fs = mem_fs(2048);
        let root = fs.root();
        fs.create_file(&root, "/f", 0).unwrap();

        let mut f = File::new(fs.open_path(&root, "/f").unwrap());
        assert_eq!(f.tell(), 0);
        assert_eq!(f.write(&fs, b"abcdef"), 6);
        assert_eq!(f.tell(), 6);

        f.seek(2);
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&fs, &mut buf), 2);
        assert_eq!(&buf, b"cd");
        assert_eq!(f.tell(), 4);

        // Reading at the end yields nothing and leaves the cursor.
        f.seek(6);
        assert_eq!(f.read(&fs, &mut buf), 0);
        assert_eq!(f.tell(), 6);

        f.close(&fs);
        fs.close_inode(root);
    }

    #[test]
    fn deny_is_idempotent_per_handle_and_released_on_close() {
        let fs = mem_fs(2048);
        let root = fs.root();
        fs.create_file(&root, "/exe", 0).unwrap();

        let mut one = File::new(fs.open_path(&root, "/exe").unwrap());
        let mut two = File::new(fs.open_path(&root, "/exe").unwrap());

        one.deny_write();
        one.deny_write();
        assert_eq!(two.write(&fs, b"x"), 0);

        // Closing the denier lifts the block for the survivor.
        one.close(&fs);
        assert_eq!(two.write(&fs, b"x"), 1);

        two.close(&fs);
        fs.close_inode(root);
    }

    #[test]
    fn dir_handle_iterates_once() {
        let fs = mem_fs(2048);
        let root = fs.root();
        fs.create_file(&root, "/a", 0).unwrap();
        fs.create_file(&root, "/b", 0).unwrap();

        let mut dir = DirFile::new(fs.open_path(&root, "/").unwrap());
        let mut names = Vec::new();
        while let Some(name) = dir.read_next(&fs) {
            names.push(name.as_str().to_string());
        }
        assert_eq!(names, vec!["a", "b"]);
        assert!(dir.read_next(&fs).is_none());

        dir.close(&fs);
        fs.close_inode(root);
    }
}
