//! Abstractions and code to access raw NOR flash.

use std::io::{Read, Write};

use anyhow::{ensure, Result};

/// The erase granularity of the devices this crate targets, in bytes.
pub const EB_BYTES: usize = 4096;

/// Represents a NOR flash device (or a simulation of one).
///
/// The translation layer drives the device exclusively through this trait.
/// All calls are synchronous; a driver that must mask interrupts around its
/// transfers has to do so within a single call so that the caller observes
/// atomic read/erase/program semantics.
pub trait Flash {
    /// Device capacity in bytes.
    fn size(&self) -> usize;

    /// The preferred program granule. Must be at least 16, at most 512, and
    /// evenly divide [`EB_BYTES`].
    fn write_buffer_size(&self) -> usize;

    /// Zero-copy view of one full erase block.
    ///
    /// The borrow keeps the device immutable, so the view stays valid until
    /// the next mutating call.
    fn read_eb(&self, eb: u32) -> &[u8];

    /// Erase one block. All bytes read back as zero afterwards.
    fn erase_block(&mut self, eb: u32) -> Result<()>;

    /// Program a sub-range of a block. `data` never crosses a block boundary
    /// and its length is a multiple of [`Self::write_buffer_size`].
    fn program(&mut self, eb: u32, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy-out read that does not cross a block boundary.
    fn read(&self, eb: u32, offset: usize, out: &mut [u8]) -> Result<()>;
}

/// A simulated in-memory flash device, for host-side testing.
#[derive(Debug, Clone)]
pub struct SimFlash {
    data: Vec<u8>,
    write_buffer: usize,
}

impl SimFlash {
    pub const DEFAULT_WRITE_BUFFER: usize = 128;

    /// Create a blank (all-zero, i.e. fully erased) simulated device.
    pub fn new(size: usize) -> Self {
        Self::with_write_buffer(size, Self::DEFAULT_WRITE_BUFFER)
    }

    /// Create a blank device advertising a specific program granule.
    pub fn with_write_buffer(size: usize, write_buffer: usize) -> Self {
        assert!(size % EB_BYTES == 0, "size must be a multiple of EB_BYTES");
        Self {
            data: vec![0; size],
            write_buffer,
        }
    }

    /// Initialize the flash contents from a saved image.
    pub fn load<R: Read>(&mut self, read: &mut R) -> Result<()> {
        read.read_exact(&mut self.data)?;
        Ok(())
    }

    /// Write the flash contents out to an image file (or any `Write`).
    pub fn save<W: Write>(&self, write: &mut W) -> Result<()> {
        write.write_all(&self.data)?;
        Ok(())
    }
}

impl Flash for SimFlash {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn write_buffer_size(&self) -> usize {
        self.write_buffer
    }

    fn read_eb(&self, eb: u32) -> &[u8] {
        let start = eb as usize * EB_BYTES;
        &self.data[start..start + EB_BYTES]
    }

    fn erase_block(&mut self, eb: u32) -> Result<()> {
        let start = eb as usize * EB_BYTES;
        ensure!(start + EB_BYTES <= self.data.len(), "erase of eb {eb} out of range");
        self.data[start..start + EB_BYTES].fill(0);
        Ok(())
    }

    fn program(&mut self, eb: u32, offset: usize, data: &[u8]) -> Result<()> {
        ensure!(offset + data.len() <= EB_BYTES, "program crosses an erase block");
        let start = eb as usize * EB_BYTES + offset;
        ensure!(start + data.len() <= self.data.len(), "program of eb {eb} out of range");
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, eb: u32, offset: usize, out: &mut [u8]) -> Result<()> {
        ensure!(offset + out.len() <= EB_BYTES, "read crosses an erase block");
        let start = eb as usize * EB_BYTES + offset;
        ensure!(start + out.len() <= self.data.len(), "read of eb {eb} out of range");
        out.copy_from_slice(&self.data[start..start + out.len()]);
        Ok(())
    }
}

#[cfg(test)]
const TEST_SIZE: usize = 8 * EB_BYTES;

#[test]
fn test_sim_program_read() {
    let mut flash = SimFlash::new(TEST_SIZE);

    let data_in = vec![0xA5u8; 256];
    let mut data_out = vec![0u8; 256];

    flash.program(2, 512, &data_in).unwrap();
    flash.read(2, 512, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    // Untouched areas still read as erased.
    flash.read(2, 0, &mut data_out).unwrap();
    assert!(data_out.iter().all(|&b| b == 0));

    assert_eq!(&flash.read_eb(2)[512..768], &data_in[..]);
}

#[test]
fn test_sim_erase() {
    let mut flash = SimFlash::new(TEST_SIZE);
    flash.program(1, 0, &[0xFFu8; 128]).unwrap();
    flash.erase_block(1).unwrap();
    assert!(flash.read_eb(1).iter().all(|&b| b == 0));
}

#[test]
fn test_sim_bounds() {
    let mut flash = SimFlash::new(TEST_SIZE);
    assert!(flash.program(0, 4000, &[0u8; 128]).is_err()); // crosses the block
    assert!(flash.program(8, 0, &[0u8; 128]).is_err()); // past the device
    assert!(flash.erase_block(8).is_err());
    assert!(flash.read(8, 0, &mut [0u8; 16]).is_err());
}

#[test]
fn test_sim_load_save() {
    let mut flash = SimFlash::new(TEST_SIZE);
    flash.program(3, 128, b"persisted bytes!").unwrap();

    let mut image = Vec::new();
    flash.save(&mut image).unwrap();

    let mut restored = SimFlash::new(TEST_SIZE);
    restored.load(&mut image.as_slice()).unwrap();
    assert_eq!(&restored.read_eb(3)[128..144], b"persisted bytes!");
}
