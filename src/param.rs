use core::time::Duration;

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the sector cache.
pub const NBUF: usize = 64;

/// Direct sector pointers per inode.
pub const NDIRECT: usize = 12;

/// Single-indirect pointers per inode.
pub const NINDIRECT: usize = 4;

/// Sector pointers held by one indirect block.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Max data sectors reachable from one inode.
pub const MAXFILE_SECTORS: usize =
    NDIRECT + NINDIRECT * PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// Maximum length of a directory entry name, excluding the NUL.
pub const DIRSIZ: usize = 14;

/// Sector holding the free-map inode.
pub const FREEMAP_SECTOR: u32 = 0;

/// Sector holding the root directory inode.
pub const ROOT_SECTOR: u32 = 1;

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// First descriptor id handed out by `open`; 0 and 1 are the console,
/// 2 is unused.
pub const FD_BASE: i32 = 3;

/// Interval between opportunistic flushes of the sector cache.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
