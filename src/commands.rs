//! NVMe command and completion entry layouts plus command builders.

use x86_64::PhysAddr;

use crate::registers::{identify_cns, opcodes};

/// NVMe submission queue entry (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeCommand {
    /// Command Dword 0: opcode (7:0), fused (9:8), PSDT (15:14), command ID (31:16)
    pub cdw0: u32,
    /// Namespace ID
    pub nsid: u32,
    /// Reserved
    pub cdw2: u32,
    /// Reserved
    pub cdw3: u32,
    /// Metadata pointer
    pub mptr: u64,
    /// PRP entry 1
    pub prp1: u64,
    /// PRP entry 2
    pub prp2: u64,
    /// Command-specific dwords
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCommand {
    pub const fn new() -> Self {
        Self {
            cdw0: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }

    pub fn opcode(&self) -> u8 {
        (self.cdw0 & 0xFF) as u8
    }

    pub fn set_opcode(&mut self, opcode: u8) {
        self.cdw0 = (self.cdw0 & !0xFF) | opcode as u32;
    }

    pub fn command_id(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    pub fn set_command_id(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0xFFFF) | ((cid as u32) << 16);
    }

    /// Second PRP entry, for transfers that cross one page boundary.
    pub fn set_prp2(&mut self, addr: PhysAddr) {
        self.prp2 = addr.as_u64();
    }

    /// Build an IDENTIFY controller command. `buffer` receives 4KB of data.
    pub fn identify_controller(buffer: PhysAddr) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_IDENTIFY);
        cmd.prp1 = buffer.as_u64();
        cmd.cdw10 = identify_cns::CONTROLLER;
        cmd
    }

    /// Build an IDENTIFY namespace command. `buffer` receives 4KB of data.
    pub fn identify_namespace(nsid: u32, buffer: PhysAddr) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_IDENTIFY);
        cmd.nsid = nsid;
        cmd.prp1 = buffer.as_u64();
        cmd.cdw10 = identify_cns::NAMESPACE;
        cmd
    }

    /// Build an IDENTIFY active namespace list command. `buffer` receives up
    /// to 1024 namespace IDs.
    pub fn identify_namespace_list(buffer: PhysAddr) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_IDENTIFY);
        cmd.prp1 = buffer.as_u64();
        cmd.cdw10 = identify_cns::NAMESPACE_LIST;
        cmd
    }

    /// Build a Create I/O Completion Queue command for a polled queue
    /// (physically contiguous, interrupts disabled).
    pub fn create_io_completion_queue(queue_id: u16, size: u16, buffer: PhysAddr) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_CREATE_IO_CQ);
        cmd.prp1 = buffer.as_u64();
        cmd.cdw10 = (((size - 1) as u32) << 16) | queue_id as u32;
        cmd.cdw11 = 1; // Physically contiguous, IEN = 0
        cmd
    }

    /// Build a Create I/O Submission Queue command bound to `cq_id`.
    pub fn create_io_submission_queue(
        queue_id: u16,
        cq_id: u16,
        size: u16,
        buffer: PhysAddr,
    ) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::ADMIN_CREATE_IO_SQ);
        cmd.prp1 = buffer.as_u64();
        cmd.cdw10 = (((size - 1) as u32) << 16) | queue_id as u32;
        cmd.cdw11 = ((cq_id as u32) << 16) | 1; // Physically contiguous
        cmd
    }

    /// Build a Read command for `blocks` logical blocks starting at `lba`.
    pub fn read(nsid: u32, lba: u64, blocks: u16, buffer: PhysAddr) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::NVM_READ);
        cmd.nsid = nsid;
        cmd.prp1 = buffer.as_u64();
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = (blocks - 1) as u32; // 0-based block count
        cmd
    }

    /// Build a Write command for `blocks` logical blocks starting at `lba`.
    pub fn write(nsid: u32, lba: u64, blocks: u16, buffer: PhysAddr) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::NVM_WRITE);
        cmd.nsid = nsid;
        cmd.prp1 = buffer.as_u64();
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = (blocks - 1) as u32; // 0-based block count
        cmd
    }

    /// Build a Flush command. No data transfer; commits volatile write cache.
    pub fn flush(nsid: u32) -> Self {
        let mut cmd = Self::new();
        cmd.set_opcode(opcodes::NVM_FLUSH);
        cmd.nsid = nsid;
        cmd
    }
}

/// NVMe completion queue entry (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmeCompletion {
    /// Command-specific result
    pub result: u32,
    /// Reserved
    pub reserved: u32,
    /// Submission queue head pointer at completion time
    pub sq_head: u16,
    /// Submission queue the command came from
    pub sq_id: u16,
    /// Command ID of the completed command
    pub command_id: u16,
    /// Phase bit (0) and status field (15:1)
    pub status: u16,
}

impl NvmeCompletion {
    /// Status code from the status field, 0 on success.
    pub fn status_code(&self) -> u16 {
        (self.status >> 1) & 0x7FFF
    }

    pub fn is_success(&self) -> bool {
        self.status_code() == 0
    }

    pub fn phase_bit(&self) -> bool {
        self.status & 1 != 0
    }

    /// An entry is new when its phase bit matches the phase the consumer
    /// expects for the current pass over the ring.
    pub fn is_valid(&self, expected_phase: bool) -> bool {
        self.phase_bit() == expected_phase
    }
}
