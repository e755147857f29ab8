//! File system implementation. Five layers:
//!   + Device: sector-granular reads and writes of a raw disk.
//!   + Free map: allocator for contiguous runs of raw sectors.
//!   + Cache: write-back sector cache with read-ahead and a flusher.
//!   + Inodes: indexed extents, reading, writing, on-demand growth.
//!   + Directories and names: entries inside special inodes, and
//!     paths like /usr/bin/ls for convenient naming.
//!
//! This file owns the `FileSystem` handle that ties the layers
//! together and the path-level operations the system-call layer
//! builds on. Nothing here is ambient: every operation works on an
//! explicit handle, and mount/unmount bound the lifetime of the
//! background workers.

use std::mem;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::debug;

use crate::bio::BufCache;
use crate::disk::SectorDevice;
use crate::error::{FsError, Result};
use crate::param::ROOT_SECTOR;

mod dir;
mod freemap;
mod inode;
mod path;

pub use dir::DIRENT_SIZE;
pub use freemap::FreeMap;
pub use inode::{DiskInode, Inode, Itable};
pub use path::{FileName, Path};

pub struct FileSystem {
    pub(crate) dev: Arc<dyn SectorDevice>,
    pub(crate) cache: Arc<BufCache>,
    pub(crate) freemap: FreeMap,
    pub(crate) itable: Itable,

    /// Global file-growth lock; see `Inode::write_at`.
    pub(crate) growth: Mutex<()>,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FileSystem {
    /// Brings the file system up on `dev` and starts the background
    /// workers. With `format` set the disk is wiped first: free map,
    /// then an empty root directory.
    pub fn mount(dev: Arc<dyn SectorDevice>, format: bool) -> Arc<Self> {
        let cache = Arc::new(BufCache::new(Arc::clone(&dev)));
        let freemap = if format {
            FreeMap::format(Arc::clone(&dev))
        } else {
            FreeMap::open(Arc::clone(&dev))
        };

        let fs = Arc::new(Self {
            dev,
            cache,
            freemap,
            itable: Itable::new(),
            growth: Mutex::new(()),
            workers: Mutex::new(Vec::new()),
        });

        if format {
            Inode::create(&fs, ROOT_SECTOR, 0, true).expect("fs: root directory creation failed");
            let root = fs.itable.open(&fs, ROOT_SECTOR);
            root.dir_add(&fs, ".", ROOT_SECTOR)
                .and_then(|_| root.dir_add(&fs, "..", ROOT_SECTOR))
                .expect("fs: root dot entries");
            fs.itable.close(&fs, root);
        }

        *fs.workers.lock().unwrap() = fs.cache.start_workers();
        debug!(
            "fs: mounted {} sectors (formatted: {})",
            fs.dev.size(),
            format
        );
        fs
    }

    /// Stops the workers, flushes every dirty sector, and writes the
    /// free map back. Safe to call more than once.
    pub fn unmount(&self) {
        let workers = mem::replace(&mut *self.workers.lock().unwrap(), Vec::new());
        if !workers.is_empty() {
            self.cache.shutdown();
            for worker in workers {
                let _ = worker.join();
            }
        }
        self.cache.flush_all();
        self.freemap.close();
        debug!("fs: unmounted");
    }

    /// Flushes all dirty cached sectors to the device.
    pub fn flush(&self) {
        self.cache.flush_all();
    }

    /// Opens the root directory.
    pub fn root(&self) -> Arc<Inode> {
        self.itable.open(self, ROOT_SECTOR)
    }

    /// Another handle to an already-open inode.
    pub fn reopen(&self, ip: &Arc<Inode>) -> Arc<Inode> {
        self.itable.reopen(ip)
    }

    /// Drops a handle; the last close of a removed inode frees it.
    pub fn close_inode(&self, ip: Arc<Inode>) {
        self.itable.close(self, ip);
    }

    /// Walks `path` from `cwd` (or the root, for an absolute path) up
    /// to but excluding the final segment. Returns the opened parent
    /// directory and the final segment, which may be `.`, `..`, or
    /// empty when the path ends in a slash.
    pub fn resolve<'p>(&self, cwd: &Arc<Inode>, path: &'p Path) -> Result<(Arc<Inode>, &'p str)> {
        if path.is_empty_string() {
            return Err(FsError::NotFound);
        }

        let mut dir = if path.is_absolute() {
            self.root()
        } else {
            self.reopen(cwd)
        };
        let mut rest = path;

        loop {
            let (next, seg) = match rest.skipelem() {
                Some(pair) => pair,
                None => return Ok((dir, "")),
            };
            if next.is_empty_string() {
                return Ok((dir, seg));
            }

            if !dir.is_dir() {
                self.close_inode(dir);
                return Err(FsError::NotADirectory);
            }
            let sector = match dir.dir_lookup(self, seg) {
                Ok(sector) => sector,
                Err(err) => {
                    self.close_inode(dir);
                    return Err(err);
                }
            };
            let child = self.itable.open(self, sector);
            self.close_inode(dir);
            dir = child;
            rest = next;
        }
    }

    /// Opens the inode `path` names. A trailing slash or a final `.`
    /// yields the directory itself.
    pub fn open_path(&self, cwd: &Arc<Inode>, path: &str) -> Result<Arc<Inode>> {
        let (dir, last) = self.resolve(cwd, Path::new(path))?;
        match last {
            "" | "." => Ok(dir),
            _ => {
                if !dir.is_dir() {
                    self.close_inode(dir);
                    return Err(FsError::NotADirectory);
                }
                match dir.dir_lookup(self, last) {
                    Ok(sector) => {
                        let ip = self.itable.open(self, sector);
                        self.close_inode(dir);
                        Ok(ip)
                    }
                    Err(err) => {
                        self.close_inode(dir);
                        Err(err)
                    }
                }
            }
        }
    }

    /// Creates an empty regular file of `size` bytes at `path`.
    pub fn create_file(&self, cwd: &Arc<Inode>, path: &str, size: u32) -> Result<()> {
        self.create_node(cwd, path, size, false)
    }

    /// Creates an empty directory at `path`, wired up with `.` and
    /// `..` entries.
    pub fn create_dir(&self, cwd: &Arc<Inode>, path: &str) -> Result<()> {
        self.create_node(cwd, path, 0, true)
    }

    fn create_node(&self, cwd: &Arc<Inode>, path: &str, size: u32, is_dir: bool) -> Result<()> {
        let (dir, last) = self.resolve(cwd, Path::new(path))?;
        let res = self.create_node_in(&dir, last, size, is_dir);
        self.close_inode(dir);
        res
    }

    fn create_node_in(&self, dir: &Arc<Inode>, name: &str, size: u32, is_dir: bool) -> Result<()> {
        match name {
            "" => return Err(FsError::NotFound),
            "." | ".." => return Err(FsError::AlreadyExists),
            _ => {}
        }
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }
        FileName::new(name)?;

        let sector = self.freemap.allocate(1).ok_or(FsError::NoSpace)?;
        if let Err(err) = Inode::create(self, sector, size, is_dir) {
            self.freemap.release(sector, 1);
            return Err(err);
        }

        if is_dir {
            let child = self.itable.open(self, sector);
            let dots = child
                .dir_add(self, ".", sector)
                .and_then(|_| child.dir_add(self, "..", dir.sector));
            if let Err(err) = dots {
                child.mark_removed();
                self.itable.close(self, child);
                return Err(err);
            }
            self.itable.close(self, child);
        }

        if let Err(err) = dir.dir_add(self, name, sector) {
            let child = self.itable.open(self, sector);
            child.mark_removed();
            self.itable.close(self, child);
            return Err(err);
        }
        Ok(())
    }

    /// Deletes the file or empty directory `path` names. Refuses the
    /// root, dot segments, and directories that still hold entries.
    pub fn remove(&self, cwd: &Arc<Inode>, path: &str) -> Result<()> {
        let (dir, last) = self.resolve(cwd, Path::new(path))?;
        let res = self.remove_in(&dir, last);
        self.close_inode(dir);
        res
    }

    fn remove_in(&self, dir: &Arc<Inode>, name: &str) -> Result<()> {
        match name {
            "" | "." | ".." => return Err(FsError::NotFound),
            _ => {}
        }
        if !dir.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let child_sector = dir.dir_lookup(self, name)?;
        let child = self.itable.open(self, child_sector);

        if child.is_dir() {
            // Freeze the child's contents across the emptiness check
            // and the unlink, so nothing sneaks in between the two.
            let entries = child.entries.lock().unwrap();
            if !child.scan_empty(self) {
                drop(entries);
                self.close_inode(child);
                return Err(FsError::DirectoryNotEmpty);
            }
            if let Err(err) = dir.dir_remove(self, name) {
                drop(entries);
                self.close_inode(child);
                return Err(err);
            }
            drop(entries);
        } else if let Err(err) = dir.dir_remove(self, name) {
            self.close_inode(child);
            return Err(err);
        }

        child.mark_removed();
        self.close_inode(child);
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.unmount();
    }
}
