//! The flash translation layer: a logical block device over raw NOR flash.
//!
//! NOR flash can program small granules in place but can only erase whole
//! 4 KiB blocks, and each block endures a bounded number of erases. The
//! translation layer hides both problems behind fixed 512-byte logical
//! blocks (LBAs): every write lands in a freshly chosen slot of an open
//! erase block, and a bit-packed table maps each LBA to its current home:
//!
//! ```text
//!          L2P entry (16 bits)                 one erase block
//!  +---+-----------+------------------+      +------------------+
//!  | v |  idx 0-7  |  erase block     |      | LBA slot 0       |
//!  | 1 |  3 bits   |  12 bits         | ---> | LBA slot 1       |
//!  +---+-----------+------------------+      |   ...            |
//!                                            | LBA slot 7       |
//!                                            +------------------+
//! ```
//!
//! Overwritten and trimmed LBAs leave garbage behind; a collector scores
//! blocks by how sparse and how under-worn they are, relocates what is
//! still valid, and recycles the rest. Because the score also rises for
//! blocks whose erase count lags the wear front, even never-rewritten data
//! (and the metadata blocks themselves) get dragged forward: static wear
//! leveling.
//!
//! All bookkeeping is itself persisted to flash, as a checksummed stream of
//! metadata blocks committed under a monotone epoch. Two block sets
//! alternate between commits, and an older complete snapshot is only erased
//! after its successor has fully landed, so startup can always replay the
//! newest snapshot that survives its CRCs — or formats if none does.

mod codec;
mod engine;
mod geometry;
mod tables;

pub use engine::{Ftl, FtlError, Started};
pub use geometry::{Geometry, GC_RESERVE_EBS, LBAS_PER_EB, LBA_BYTES, MAX_FLASH_BYTES, MAX_PE_DIFF};
