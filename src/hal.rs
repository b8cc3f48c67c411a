//! Kernel collaborator interface.
//!
//! The driver owns no paging, frame allocation, or timekeeping; the kernel
//! provides them through [`Platform`]. Every DMA buffer and register mapping
//! flows through this seam, so the driver runs unchanged against real kernel
//! services or, in tests, a software model of the hardware.

use alloc::sync::Arc;
use core::time::Duration;

use x86_64::{PhysAddr, VirtAddr};

use crate::NvmeError;

/// Page size the driver programs into CC.MPS and assumes for PRP entries.
pub const PAGE_SIZE: usize = 4096;

/// Physically contiguous memory suitable for controller DMA.
#[derive(Debug, Clone, Copy)]
pub struct DmaBuffer {
    pub phys_addr: PhysAddr,
    pub virt_addr: VirtAddr,
    /// Size in frames.
    pub size: usize,
}

impl DmaBuffer {
    /// Buffer length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.size * PAGE_SIZE
    }
}

/// A mapped MMIO window (the controller's register BAR).
#[derive(Debug, Clone, Copy)]
pub struct MmioRegion {
    pub phys_addr: PhysAddr,
    pub virt_addr: VirtAddr,
    /// Size in bytes.
    pub size: usize,
}

/// Services the kernel provides to the driver.
pub trait Platform {
    /// Map the controller's register window with an uncached mapping.
    fn map_mmio(&self, phys_addr: PhysAddr, size: usize) -> Option<MmioRegion>;

    /// Unmap a region previously returned by [`Platform::map_mmio`].
    fn unmap_mmio(&self, region: MmioRegion);

    /// Allocate `frames` pages of physically contiguous, zeroed memory,
    /// mapped for the driver and aligned to [`PAGE_SIZE`].
    fn alloc_dma(&self, frames: usize) -> Option<DmaBuffer>;

    /// Return a DMA allocation to the kernel.
    ///
    /// # Safety
    /// `buffer` must come from [`Platform::alloc_dma`] on the same platform
    /// and must no longer be referenced by the driver or the device.
    unsafe fn free_dma(&self, buffer: DmaBuffer);

    /// Resolve a virtual address to the physical address backing it.
    fn virt_to_phys(&self, virt_addr: VirtAddr) -> Option<PhysAddr>;

    /// Back-off between polls. Any bounded delay is acceptable.
    fn sleep(&self, duration: Duration);
}

/// DMA allocation that returns itself to the platform when dropped.
pub struct OwnedDma<P: Platform> {
    platform: Arc<P>,
    buffer: DmaBuffer,
}

impl<P: Platform> OwnedDma<P> {
    /// Allocate `frames` zeroed pages.
    pub fn zeroed(platform: &Arc<P>, frames: usize) -> Result<Self, NvmeError> {
        let buffer = platform
            .alloc_dma(frames)
            .ok_or(NvmeError::ResourceExhausted)?;
        Ok(Self {
            platform: platform.clone(),
            buffer,
        })
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.buffer.phys_addr
    }

    pub fn virt_addr(&self) -> VirtAddr {
        self.buffer.virt_addr
    }

    pub fn len_bytes(&self) -> usize {
        self.buffer.len_bytes()
    }

    /// View the buffer as bytes. The platform keeps DMA allocations mapped
    /// for their whole lifetime.
    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.buffer.virt_addr.as_ptr::<u8>(), self.len_bytes()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.buffer.virt_addr.as_mut_ptr::<u8>(),
                self.len_bytes(),
            )
        }
    }
}

impl<P: Platform> Drop for OwnedDma<P> {
    fn drop(&mut self) {
        unsafe { self.platform.free_dma(self.buffer) };
    }
}
