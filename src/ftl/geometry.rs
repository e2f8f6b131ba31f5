//! Fixed constants and per-device derived geometry.

use anyhow::{ensure, Result};

use crate::flash::{Flash, EB_BYTES};

/// Size of one logical block as seen by callers, in bytes.
pub const LBA_BYTES: usize = 512;

/// How many logical blocks fit in one erase block.
pub const LBAS_PER_EB: usize = EB_BYTES / LBA_BYTES;

/// Largest supported device. The 12-bit erase-block field of an L2P entry
/// tops out at 4096 blocks of 4 KiB.
pub const MAX_FLASH_BYTES: usize = 16 * 1024 * 1024;

/// Maximum permitted program/erase-count divergence across blocks before
/// wear leveling must relocate the laggard.
pub const MAX_PE_DIFF: u32 = 64;

/// Erase blocks kept free as garbage-collection headroom.
pub const GC_RESERVE_EBS: usize = 3;

/// Bytes reserved per metadata block when sizing the metadata area
/// (header, footer, checksum).
pub const META_SIZING_RESERVE: usize = 64;

/// Everything about a device the translation layer needs to know up front,
/// derived once at construction from the device size and program granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Device capacity in bytes.
    pub flash_bytes: usize,
    /// Program granule of the device.
    pub write_buffer: usize,
    /// Total erase blocks on the device.
    pub erase_blocks: usize,
    /// Serialized size of the translation tables, in bytes.
    pub meta_eb_bytes: usize,
    /// Erase blocks set aside for metadata: two full copies, each rounded up
    /// to whole blocks.
    pub meta_ebs: usize,
    /// Logical blocks exposed to callers.
    pub flash_lbas: usize,
}

impl Geometry {
    pub fn new(flash_bytes: usize, write_buffer: usize) -> Result<Self> {
        ensure!(
            flash_bytes <= MAX_FLASH_BYTES,
            "{flash_bytes} byte device exceeds the {MAX_FLASH_BYTES} byte ceiling"
        );
        ensure!(
            flash_bytes > 0 && flash_bytes % EB_BYTES == 0,
            "device size must be a nonzero multiple of {EB_BYTES}"
        );
        ensure!(
            (16..=LBA_BYTES).contains(&write_buffer) && EB_BYTES % write_buffer == 0,
            "write buffer size {write_buffer} unusable (need 16..=512, dividing {EB_BYTES})"
        );

        let erase_blocks = flash_bytes / EB_BYTES;
        let theoretical_lbas = flash_bytes / LBA_BYTES;

        // One PE count byte per block, one state nibble per block, two bytes
        // per L2P entry, plus the 4-byte PE offset word.
        let meta_eb_bytes =
            erase_blocks + erase_blocks.div_ceil(2) + 2 * theoretical_lbas + 4;
        let meta_ebs = 2 * (1 + meta_eb_bytes / (EB_BYTES - META_SIZING_RESERVE));

        ensure!(
            erase_blocks > GC_RESERVE_EBS + meta_ebs,
            "device too small: {erase_blocks} blocks cannot hold \
             {meta_ebs} metadata blocks plus garbage-collection headroom"
        );
        let flash_lbas = (erase_blocks - GC_RESERVE_EBS - meta_ebs) * LBAS_PER_EB;

        Ok(Self {
            flash_bytes,
            write_buffer,
            erase_blocks,
            meta_eb_bytes,
            meta_ebs,
            flash_lbas,
        })
    }

    pub fn for_flash<F: Flash>(flash: &F) -> Result<Self> {
        Self::new(flash.size(), flash.write_buffer_size())
    }
}
