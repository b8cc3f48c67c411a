//! NVMe controller register access.
//!
//! Offsets and bit layouts follow the NVMe 1.4 register map. Every access is
//! a volatile read or write against the mapped BAR window; the only cached
//! value is the doorbell stride, which CAP fixes for the life of the binding.

use alloc::sync::Arc;

use x86_64::{PhysAddr, VirtAddr};

use crate::hal::{MmioRegion, Platform};

/// Register offsets within the controller window (BAR0)
pub mod offsets {
    pub const CAP: usize = 0x00; // Controller Capabilities (64-bit)
    pub const VS: usize = 0x08; // Version
    pub const INTMS: usize = 0x0C; // Interrupt Mask Set
    pub const INTMC: usize = 0x10; // Interrupt Mask Clear
    pub const CC: usize = 0x14; // Controller Configuration
    pub const CSTS: usize = 0x1C; // Controller Status
    pub const AQA: usize = 0x24; // Admin Queue Attributes
    pub const ASQ: usize = 0x28; // Admin Submission Queue Base (64-bit)
    pub const ACQ: usize = 0x30; // Admin Completion Queue Base (64-bit)

    /// First doorbell; each queue has a submission and a completion doorbell,
    /// spaced by the stride CAP.DSTRD reports.
    pub const DOORBELL_BASE: usize = 0x1000;
}

/// Controller Capabilities Register (CAP) bit definitions
pub mod cap_bits {
    pub const MQES_MASK: u64 = 0xFFFF; // Maximum Queue Entries Supported (0-based)
    pub const CQR_SHIFT: u64 = 16; // Contiguous Queues Required
    pub const TO_SHIFT: u64 = 24; // Timeout (500 ms units)
    pub const DSTRD_SHIFT: u64 = 32; // Doorbell Stride
    pub const CSS_SHIFT: u64 = 37; // Command Sets Supported
    pub const MPSMIN_SHIFT: u64 = 48; // Memory Page Size Minimum
    pub const MPSMAX_SHIFT: u64 = 52; // Memory Page Size Maximum
}

/// Controller Configuration Register (CC) bit definitions
pub mod cc_bits {
    pub const EN: u32 = 1 << 0; // Enable
    pub const CSS_SHIFT: u32 = 4; // I/O Command Set Selected
    pub const MPS_SHIFT: u32 = 7; // Memory Page Size (2^(12+n))
    pub const AMS_SHIFT: u32 = 11; // Arbitration Mechanism Selected
    pub const SHN_SHIFT: u32 = 14; // Shutdown Notification
    pub const SHN_MASK: u32 = 0x3 << SHN_SHIFT;
    pub const SHN_NORMAL: u32 = 0x1 << SHN_SHIFT; // Normal shutdown notification
    pub const IOSQES_SHIFT: u32 = 16; // I/O Submission Queue Entry Size
    pub const IOCQES_SHIFT: u32 = 20; // I/O Completion Queue Entry Size
}

/// Controller Status Register (CSTS) bit definitions
pub mod csts_bits {
    pub const RDY: u32 = 1 << 0; // Ready
    pub const CFS: u32 = 1 << 1; // Controller Fatal Status
    pub const SHST_SHIFT: u32 = 2; // Shutdown Status
    pub const SHST_MASK: u32 = 0x3 << SHST_SHIFT;
    pub const SHST_COMPLETE: u32 = 0x2; // Shutdown processing complete
}

/// Admin Queue Attributes Register (AQA) bit definitions
pub mod aqa_bits {
    pub const ASQS_MASK: u32 = 0xFFF; // Admin Submission Queue Size (0-based)
    pub const ACQS_SHIFT: u32 = 16; // Admin Completion Queue Size shift
}

/// NVMe command opcodes
pub mod opcodes {
    // Admin commands
    pub const ADMIN_DELETE_IO_SQ: u8 = 0x00;
    pub const ADMIN_CREATE_IO_SQ: u8 = 0x01;
    pub const ADMIN_GET_LOG_PAGE: u8 = 0x02;
    pub const ADMIN_DELETE_IO_CQ: u8 = 0x04;
    pub const ADMIN_CREATE_IO_CQ: u8 = 0x05;
    pub const ADMIN_IDENTIFY: u8 = 0x06;
    pub const ADMIN_SET_FEATURES: u8 = 0x09;
    pub const ADMIN_GET_FEATURES: u8 = 0x0A;

    // NVM commands
    pub const NVM_FLUSH: u8 = 0x00;
    pub const NVM_WRITE: u8 = 0x01;
    pub const NVM_READ: u8 = 0x02;
    pub const NVM_WRITE_ZEROES: u8 = 0x08;
}

/// IDENTIFY command CNS (Controller or Namespace Structure) values
pub mod identify_cns {
    pub const NAMESPACE: u32 = 0x00; // Identify Namespace
    pub const CONTROLLER: u32 = 0x01; // Identify Controller
    pub const NAMESPACE_LIST: u32 = 0x02; // Active Namespace ID list
}

/// Volatile accessor over the mapped register window.
///
/// Owns the mapping and unmaps it through the platform on drop.
pub struct NvmeRegisters<P: Platform> {
    platform: Arc<P>,
    region: MmioRegion,
    doorbell_stride: u32,
}

impl<P: Platform> NvmeRegisters<P> {
    /// # Safety
    /// `region` must map the register window of an NVMe controller and stay
    /// mapped for the lifetime of this value.
    pub unsafe fn new(platform: Arc<P>, region: MmioRegion) -> Self {
        let mut regs = Self {
            platform,
            region,
            doorbell_stride: 0,
        };
        regs.doorbell_stride = 4 << ((regs.capabilities() >> cap_bits::DSTRD_SHIFT) & 0xF);
        regs
    }

    fn read32(&self, offset: usize) -> u32 {
        let addr = VirtAddr::new(self.region.virt_addr.as_u64() + offset as u64);
        unsafe { core::ptr::read_volatile(addr.as_ptr::<u32>()) }
    }

    fn write32(&self, offset: usize, value: u32) {
        let addr = VirtAddr::new(self.region.virt_addr.as_u64() + offset as u64);
        unsafe { core::ptr::write_volatile(addr.as_mut_ptr::<u32>(), value) };
    }

    fn read64(&self, offset: usize) -> u64 {
        let addr = VirtAddr::new(self.region.virt_addr.as_u64() + offset as u64);
        unsafe { core::ptr::read_volatile(addr.as_ptr::<u64>()) }
    }

    fn write64(&self, offset: usize, value: u64) {
        let addr = VirtAddr::new(self.region.virt_addr.as_u64() + offset as u64);
        unsafe { core::ptr::write_volatile(addr.as_mut_ptr::<u64>(), value) };
    }

    pub fn capabilities(&self) -> u64 {
        self.read64(offsets::CAP)
    }

    /// Raw VS register: major in bits 31:16, minor in bits 15:8.
    pub fn version(&self) -> u32 {
        self.read32(offsets::VS)
    }

    /// Maximum entries per queue (CAP.MQES + 1).
    pub fn max_queue_entries(&self) -> u16 {
        ((self.capabilities() & cap_bits::MQES_MASK) + 1) as u16
    }

    /// Doorbell stride in bytes (4 << CAP.DSTRD).
    pub fn doorbell_stride(&self) -> u32 {
        self.doorbell_stride
    }

    /// Minimum memory page size (4KB << CAP.MPSMIN).
    pub fn min_page_size(&self) -> u32 {
        4096 << ((self.capabilities() >> cap_bits::MPSMIN_SHIFT) & 0xF)
    }

    /// Maximum memory page size (4KB << CAP.MPSMAX).
    pub fn max_page_size(&self) -> u32 {
        4096 << ((self.capabilities() >> cap_bits::MPSMAX_SHIFT) & 0xF)
    }

    /// Check if the controller is ready
    pub fn is_ready(&self) -> bool {
        self.read32(offsets::CSTS) & csts_bits::RDY != 0
    }

    /// Check if the controller has a fatal status
    pub fn is_fatal(&self) -> bool {
        self.read32(offsets::CSTS) & csts_bits::CFS != 0
    }

    /// CSTS.SHST field (0 = none, 1 = in progress, 2 = complete).
    pub fn shutdown_status(&self) -> u32 {
        (self.read32(offsets::CSTS) & csts_bits::SHST_MASK) >> csts_bits::SHST_SHIFT
    }

    /// Clear CC.EN, leaving the other configuration fields alone.
    pub fn disable(&self) {
        self.write32(offsets::CC, self.read32(offsets::CC) & !cc_bits::EN);
    }

    /// Program the fixed driver configuration and set CC.EN in one write.
    pub fn configure_and_enable(&self) {
        let mut cc = 0;
        cc |= cc_bits::EN; // Enable controller
        cc |= 0 << cc_bits::CSS_SHIFT; // NVM command set
        cc |= 0 << cc_bits::MPS_SHIFT; // 4KB page size (2^(12+0))
        cc |= 0 << cc_bits::AMS_SHIFT; // Round Robin arbitration
        cc |= 6 << cc_bits::IOSQES_SHIFT; // 64-byte SQ entries (2^6)
        cc |= 4 << cc_bits::IOCQES_SHIFT; // 16-byte CQ entries (2^4)

        self.write32(offsets::CC, cc);
    }

    /// Request a normal shutdown (CC.SHN = 01b).
    pub fn begin_shutdown(&self) {
        let cc = (self.read32(offsets::CC) & !cc_bits::SHN_MASK) | cc_bits::SHN_NORMAL;
        self.write32(offsets::CC, cc);
    }

    /// Set admin queue sizes; both fields are 0-based (actual size - 1).
    pub fn set_admin_queue_attributes(&self, sq_size: u16, cq_size: u16) {
        let aqa = (((cq_size - 1) as u32) << aqa_bits::ACQS_SHIFT) | ((sq_size - 1) as u32);
        self.write32(offsets::AQA, aqa);
    }

    /// Set admin submission queue base address
    pub fn set_admin_sq_base(&self, addr: PhysAddr) {
        self.write64(offsets::ASQ, addr.as_u64());
    }

    /// Set admin completion queue base address
    pub fn set_admin_cq_base(&self, addr: PhysAddr) {
        self.write64(offsets::ACQ, addr.as_u64());
    }

    /// Ring a queue doorbell. Submission doorbells take the new tail,
    /// completion doorbells the new head.
    pub fn ring_doorbell(&self, queue_id: u16, is_completion: bool, value: u16) {
        let index = 2 * queue_id as usize + is_completion as usize;
        let offset = offsets::DOORBELL_BASE + index * self.doorbell_stride as usize;
        self.write32(offset, value as u32);
    }
}

impl<P: Platform> Drop for NvmeRegisters<P> {
    fn drop(&mut self) {
        self.platform.unmap_mmio(self.region);
    }
}
