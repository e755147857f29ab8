//! sectorfs: a persistent file system for a teaching operating
//! system, hosted as a library so it runs (and is tested) in user
//! space.
//!
//! The stack, bottom to top:
//!   + `disk`: a sector-addressed block device facade with in-memory
//!     and file-backed implementations.
//!   + `fs::freemap`: the persistent free-sector bitmap allocator.
//!   + `bio`: a 64-slot write-back sector cache with clock eviction,
//!     a read-ahead worker, and a periodic flusher.
//!   + `fs::inode`: indexed inodes (12 direct, 4 indirect, 1
//!     double-indirect) with on-demand growth behind a readable
//!     barrier.
//!   + `fs::dir` and `fs::path`: directory entries and path walking
//!     with `.`/`..` and per-process working directories.
//!   + `file`, `proc`, `syscall`: descriptor objects, process state,
//!     and the system-call surface.
//!
//! Mount a device with `FileSystem::mount`, wrap it in a `Kernel`,
//! and drive it through `Proc::sys_*`:
//!
//! ```
//! use std::sync::Arc;
//! use sectorfs::{Console, FileSystem, Kernel, MemDisk};
//!
//! let fs = FileSystem::mount(Arc::new(MemDisk::new(2048)), true);
//! let kernel = Kernel::new(fs, Console::stdio());
//! let mut proc = kernel.new_proc();
//!
//! assert!(proc.sys_create(&kernel, "/greeting", 0));
//! let fd = proc.sys_open(&kernel, "/greeting");
//! assert_eq!(proc.sys_write(&kernel, fd, b"hello"), 5);
//! proc.sys_exit(&kernel, 0);
//! kernel.halt();
//! ```

mod bio;
mod console;
mod disk;
mod error;
mod file;
pub mod fs;
mod param;
mod proc;
mod syscall;

pub use console::Console;
pub use disk::{FileDisk, MemDisk, SectorBuf, SectorDevice};
pub use error::{Fault, FsError};
pub use file::{DirFile, FdObject, File};
pub use fs::FileSystem;
pub use param::{DIRSIZ, SECTOR_SIZE};
pub use proc::{FdEntry, Kernel, Pid, Proc};
