//! On-flash framing for the metadata snapshot.
//!
//! A snapshot is a byte stream laid across several erase blocks. Each block
//! carries:
//!
//! ```text
//! 8 bytes   signature           "SPIFTL01"
//! 3 bytes   epoch               little-endian, 2^23 commits outlive the part
//! 1 byte    intra-epoch index   position of this block within the stream
//! 4080 bytes payload
//! 4 bytes   CRC-32              over bytes 0..4092, little-endian
//! ```
//!
//! Multi-byte payload fields are big-endian; the fixed [`FtlInfo`] record at
//! the head of the stream is little-endian, matching the epoch word. Both
//! sides of the codec agree on this on any host.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISO_HDLC};

use super::geometry::{Geometry, LBA_BYTES};
use crate::flash::{Flash, EB_BYTES};

/// First eight bytes of every metadata block.
pub const META_SIG: [u8; 8] = *b"SPIFTL01";

/// Signature, epoch, and index.
pub const META_HEADER_BYTES: usize = 12;

/// The CRC-32 trailer.
pub const META_TRAILER_BYTES: usize = 4;

/// Payload bytes carried per metadata block.
pub const META_PAYLOAD_BYTES: usize = EB_BYTES - META_HEADER_BYTES - META_TRAILER_BYTES;

/// Epochs are 24-bit; the top byte of the on-flash word holds the index.
pub const EPOCH_MASK: u32 = 0x00ff_ffff;

/// CRC-32 with the reflected `0xEDB88320` polynomial, `0xFFFFFFFF` initial
/// value, and final inversion.
pub static META_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Build the 12-byte frame header for a block of the stream.
pub fn frame_header(epoch: u32, index: u8) -> [u8; META_HEADER_BYTES] {
    let mut header = [0u8; META_HEADER_BYTES];
    header[..8].copy_from_slice(&META_SIG);
    let word = (epoch & EPOCH_MASK) | (u32::from(index) << 24);
    header[8..].copy_from_slice(&word.to_le_bytes());
    header
}

/// Check a block's signature and CRC; return its `(epoch, index)` if both
/// hold.
pub fn parse_frame(block: &[u8]) -> Option<(u32, u8)> {
    if block.len() != EB_BYTES || block[..8] != META_SIG {
        return None;
    }
    let stored = u32::from_le_bytes(block[EB_BYTES - META_TRAILER_BYTES..].try_into().unwrap());
    if META_CRC.checksum(&block[..EB_BYTES - META_TRAILER_BYTES]) != stored {
        return None;
    }
    let word = u32::from_le_bytes(block[8..META_HEADER_BYTES].try_into().unwrap());
    Some((word & EPOCH_MASK, (word >> 24) as u8))
}

/// The fixed record at the head of every snapshot. A restored snapshot is
/// only replayed if this matches the running geometry exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtlInfo {
    pub eb_bytes: u16,
    pub lba_bytes: u16,
    pub flash_bytes: u32,
    pub meta_eb_bytes: u16,
    pub flash_lbas: u16,
}

impl FtlInfo {
    pub const ENCODED_LEN: usize = 12;

    // The truncating casts are consistent between commit and replay, which
    // is all the comparison needs.
    pub fn for_geometry(geo: &Geometry) -> Self {
        Self {
            eb_bytes: EB_BYTES as u16,
            lba_bytes: LBA_BYTES as u16,
            flash_bytes: geo.flash_bytes as u32,
            meta_eb_bytes: geo.meta_eb_bytes as u16,
            flash_lbas: geo.flash_lbas as u16,
        }
    }

    pub fn encode(&self, mut buf: impl BufMut) {
        buf.put_u16_le(self.eb_bytes);
        buf.put_u16_le(self.lba_bytes);
        buf.put_u32_le(self.flash_bytes);
        buf.put_u16_le(self.meta_eb_bytes);
        buf.put_u16_le(self.flash_lbas);
    }

    pub fn decode(mut buf: impl Buf) -> Self {
        Self {
            eb_bytes: buf.get_u16_le(),
            lba_bytes: buf.get_u16_le(),
            flash_bytes: buf.get_u32_le(),
            meta_eb_bytes: buf.get_u16_le(),
            flash_lbas: buf.get_u16_le(),
        }
    }
}

/// Cursor state for streaming a snapshot out. The write logic itself lives
/// on the engine, which must erase and re-account blocks as the stream
/// reaches them; this only carries the position, the staged chunk, and the
/// running CRC.
pub(crate) struct MetaWriteCursor {
    /// Blocks still to be written, consumed from the front.
    pub targets: VecDeque<u32>,
    /// Byte offset within the current block.
    pub offset: usize,
    /// Intra-epoch index of the current block.
    pub index: u8,
    /// CRC over the current block so far.
    pub digest: crc::Digest<'static, u32>,
    /// One staged program-granule chunk (granule is at most [`LBA_BYTES`]).
    pub chunk: [u8; LBA_BYTES],
}

impl MetaWriteCursor {
    pub fn new(targets: VecDeque<u32>) -> Self {
        Self {
            targets,
            offset: 0,
            index: 0,
            digest: META_CRC.digest(),
            chunk: [0; LBA_BYTES],
        }
    }
}

/// Reads a snapshot's payload back as a byte stream, skipping each block's
/// framing. CRCs were already verified when the blocks were discovered.
pub struct MetaReader<'a, F: Flash> {
    flash: &'a F,
    blocks: VecDeque<u32>,
    offset: usize,
}

impl<'a, F: Flash> MetaReader<'a, F> {
    pub fn new(flash: &'a F, blocks: VecDeque<u32>) -> Self {
        Self {
            flash,
            blocks,
            offset: 0,
        }
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        if self.offset >= EB_BYTES - META_TRAILER_BYTES {
            self.blocks.pop_front();
            self.offset = 0;
        }
        if self.offset < META_HEADER_BYTES {
            self.offset = META_HEADER_BYTES;
        }
        let eb = *self.blocks.front().context("metadata stream truncated")?;
        let byte = self.flash.read_eb(eb)[self.offset];
        self.offset += 1;
        Ok(byte)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from(self.get_u8()?) << 8 | u16::from(self.get_u8()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut word = 0u32;
        for _ in 0..4 {
            word = word << 8 | u32::from(self.get_u8()?);
        }
        Ok(word)
    }

    pub fn get_exact(&mut self, out: &mut [u8]) -> Result<()> {
        for byte in out {
            *byte = self.get_u8()?;
        }
        Ok(())
    }
}
