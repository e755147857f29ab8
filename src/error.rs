//! Error taxonomy shared by every layer above the device facade.
//!
//! All failures are local returns; the system-call layer folds them
//! into the C-style integers the trap interface expects. Integrity
//! violations (a bad inode magic, a short pointer block) are not
//! errors: they panic and never reach user space.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("name already exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("out of disk sectors")]
    NoSpace,

    #[error("bad file descriptor")]
    BadDescriptor,

    #[error("writes denied")]
    WriteDenied,
}

pub type Result<T> = core::result::Result<T, FsError>;

/// A system-call argument bad enough that the calling process has been
/// terminated with status -1. The embedder must stop running the
/// process when it sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault;
