//! Block device interface over NVMe namespaces.
//!
//! `NvmeBlockDevice` accepts plain byte buffers at any alignment and bounces
//! them through a page-aligned scratch allocation, so callers never see the
//! controller's PRP constraints. Byte-granular access does read-modify-write
//! on partially covered blocks.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{info, warn};

use crate::controller::{MAX_TRANSFER_BYTES, NvmeController};
use crate::hal::{OwnedDma, PAGE_SIZE, Platform};
use crate::NvmeError;

/// Scratch size covers the largest single transfer.
const SCRATCH_FRAMES: usize = MAX_TRANSFER_BYTES / PAGE_SIZE;

/// Size and granularity of a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_count: u64,
    pub block_size: u32,
}

/// A storage device addressed in fixed-size blocks.
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;

    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn geometry(&self) -> Geometry {
        Geometry {
            block_count: self.block_count(),
            block_size: self.block_size(),
        }
    }

    /// Read whole blocks starting at `start_block`. The buffer length picks
    /// the block count and must be a multiple of the block size.
    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> Result<(), NvmeError>;

    /// Write whole blocks starting at `start_block`. The buffer length picks
    /// the block count and must be a multiple of the block size.
    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> Result<(), NvmeError>;

    /// Read `buffer.len()` bytes starting at byte `offset`.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, NvmeError>;

    /// Write `buffer` at byte `offset`, preserving the untouched remainder
    /// of partially covered blocks.
    fn write(&self, offset: u64, buffer: &[u8]) -> Result<usize, NvmeError>;

    fn flush(&self) -> Result<(), NvmeError>;
}

/// Sink for discovered block devices, implemented by the kernel's device
/// registry.
pub trait BlockDeviceRegistry {
    fn register_block_device(&self, device: Arc<dyn BlockDevice>);
}

/// One NVMe namespace exposed as a block device.
pub struct NvmeBlockDevice<P: Platform> {
    controller: Arc<NvmeController<P>>,
    nsid: u32,
    name: String,
    block_size: u32,
    block_count: u64,
}

impl<P: Platform> NvmeBlockDevice<P> {
    pub fn new(controller: Arc<NvmeController<P>>, nsid: u32) -> Result<Self, NvmeError> {
        let (block_size, block_count) = {
            let namespace = controller.namespace(nsid).ok_or(NvmeError::NotFound)?;
            (namespace.block_size, namespace.block_count)
        };
        // A block must fit in one transfer for the read-modify-write path.
        if block_size as usize > MAX_TRANSFER_BYTES {
            return Err(NvmeError::InvalidParameter);
        }

        let name = format!("nvme{}n{}", controller.index(), nsid);
        Ok(Self {
            controller,
            nsid,
            name,
            block_size,
            block_count,
        })
    }

    /// Blocks that fit in one scratch transfer, at least 1.
    fn blocks_per_transfer(&self) -> u64 {
        (MAX_TRANSFER_BYTES / self.block_size as usize) as u64
    }

    fn byte_capacity(&self) -> u64 {
        self.block_count * self.block_size as u64
    }

    fn check_byte_range(&self, offset: u64, len: usize) -> Result<(), NvmeError> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(NvmeError::InvalidParameter)?;
        if end > self.byte_capacity() {
            return Err(NvmeError::InvalidParameter);
        }
        Ok(())
    }

    fn check_block_range(&self, start_block: u64, count: u64) -> Result<(), NvmeError> {
        let end = start_block
            .checked_add(count)
            .ok_or(NvmeError::InvalidParameter)?;
        if end > self.block_count {
            return Err(NvmeError::InvalidParameter);
        }
        Ok(())
    }

    /// Buffer length as a whole number of blocks.
    fn count_for(&self, len: usize) -> Result<u64, NvmeError> {
        if len % self.block_size as usize != 0 {
            return Err(NvmeError::InvalidParameter);
        }
        Ok((len / self.block_size as usize) as u64)
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<usize, NvmeError> {
        if out.is_empty() {
            return Ok(0);
        }
        self.check_byte_range(offset, out.len())?;

        let mut scratch = OwnedDma::zeroed(self.controller.platform(), SCRATCH_FRAMES)?;
        let bs = self.block_size as usize;
        let mut done = 0;

        while done < out.len() {
            let pos = offset + done as u64;
            let lba = pos / bs as u64;
            let in_block = (pos % bs as u64) as usize;
            let remaining = out.len() - done;

            // Never reads past the device: the range check bounds
            // `in_block + remaining` by the bytes left from this block on.
            let span = (in_block + remaining)
                .div_ceil(bs)
                .min(self.blocks_per_transfer() as usize);
            let span_len = span * bs;
            self.controller.read_blocks(
                self.nsid,
                lba,
                span as u16,
                &mut scratch.bytes_mut()[..span_len],
            )?;

            let chunk = core::cmp::min(remaining, span_len - in_block);
            out[done..done + chunk].copy_from_slice(&scratch.bytes()[in_block..in_block + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<usize, NvmeError> {
        if data.is_empty() {
            return Ok(0);
        }
        self.check_byte_range(offset, data.len())?;

        let mut scratch = OwnedDma::zeroed(self.controller.platform(), SCRATCH_FRAMES)?;
        let bs = self.block_size as usize;
        let mut done = 0;

        while done < data.len() {
            let pos = offset + done as u64;
            let lba = pos / bs as u64;
            let in_block = (pos % bs as u64) as usize;
            let remaining = data.len() - done;

            if in_block != 0 || remaining < bs {
                // Partial block: read it, patch the covered range, write it
                // back.
                let chunk = core::cmp::min(remaining, bs - in_block);
                self.controller
                    .read_blocks(self.nsid, lba, 1, &mut scratch.bytes_mut()[..bs])?;
                scratch.bytes_mut()[in_block..in_block + chunk]
                    .copy_from_slice(&data[done..done + chunk]);
                self.controller
                    .write_blocks(self.nsid, lba, 1, &scratch.bytes()[..bs])?;
                done += chunk;
            } else {
                // Aligned run of whole blocks.
                let blocks = (remaining / bs).min(self.blocks_per_transfer() as usize);
                let len = blocks * bs;
                scratch.bytes_mut()[..len].copy_from_slice(&data[done..done + len]);
                self.controller
                    .write_blocks(self.nsid, lba, blocks as u16, &scratch.bytes()[..len])?;
                done += len;
            }
        }
        Ok(done)
    }
}

impl<P: Platform + Send + Sync> BlockDevice for NvmeBlockDevice<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> Result<(), NvmeError> {
        let count = self.count_for(buffer.len())?;
        if count == 0 {
            return Ok(());
        }
        self.check_block_range(start_block, count)?;

        let mut scratch = OwnedDma::zeroed(self.controller.platform(), SCRATCH_FRAMES)?;
        let bs = self.block_size as usize;
        let step = self.blocks_per_transfer();
        let mut done = 0;

        while done < count {
            let chunk = (count - done).min(step);
            let len = chunk as usize * bs;
            self.controller.read_blocks(
                self.nsid,
                start_block + done,
                chunk as u16,
                &mut scratch.bytes_mut()[..len],
            )?;
            buffer[done as usize * bs..][..len].copy_from_slice(&scratch.bytes()[..len]);
            done += chunk;
        }
        Ok(())
    }

    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> Result<(), NvmeError> {
        let count = self.count_for(buffer.len())?;
        if count == 0 {
            return Ok(());
        }
        self.check_block_range(start_block, count)?;

        let mut scratch = OwnedDma::zeroed(self.controller.platform(), SCRATCH_FRAMES)?;
        let bs = self.block_size as usize;
        let step = self.blocks_per_transfer();
        let mut done = 0;

        while done < count {
            let chunk = (count - done).min(step);
            let len = chunk as usize * bs;
            scratch.bytes_mut()[..len].copy_from_slice(&buffer[done as usize * bs..][..len]);
            self.controller.write_blocks(
                self.nsid,
                start_block + done,
                chunk as u16,
                &scratch.bytes()[..len],
            )?;
            done += chunk;
        }
        Ok(())
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, NvmeError> {
        self.read_bytes(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<usize, NvmeError> {
        self.write_bytes(offset, buffer)
    }

    fn flush(&self) -> Result<(), NvmeError> {
        self.controller.flush(self.nsid)
    }
}

/// Wrap every discovered namespace in a block device and hand it to the
/// registry. Returns how many devices were registered.
pub fn register_namespaces<P>(
    controller: &Arc<NvmeController<P>>,
    registry: &dyn BlockDeviceRegistry,
) -> usize
where
    P: Platform + Send + Sync + 'static,
{
    let nsids: Vec<u32> = controller
        .namespaces()
        .entries()
        .iter()
        .map(|ns| ns.nsid)
        .collect();

    let mut registered = 0;
    for nsid in nsids {
        match NvmeBlockDevice::new(controller.clone(), nsid) {
            Ok(device) => {
                info!(
                    "Registering block device {} ({} blocks of {} bytes)",
                    device.name(),
                    device.block_count(),
                    device.block_size()
                );
                registry.register_block_device(Arc::new(device));
                registered += 1;
            }
            Err(e) => warn!("Skipping namespace {}: {:?}", nsid, e),
        }
    }
    registered
}
