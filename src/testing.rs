//! Software model of an NVMe controller for host-side tests.
//!
//! `ModelController` owns a raw register window and executes submission
//! entries the way a simple device would: registers latch on `tick`, queues
//! are serviced in doorbell order, and completions are posted with the
//! current phase tag. `FakePlatform` maps the model's window as MMIO,
//! identity-maps DMA over host allocations, and ticks the model whenever the
//! driver sleeps, so the driver under test runs its real polling paths.

use std::alloc::Layout;
use std::time::Duration;

use spin::{Mutex, MutexGuard};
use x86_64::{PhysAddr, VirtAddr};

use crate::commands::{NvmeCommand, NvmeCompletion};
use crate::hal::{DmaBuffer, MmioRegion, PAGE_SIZE, Platform};
use crate::identify::{IdentifyController, IdentifyNamespace, LbaFormat};
use crate::registers::{aqa_bits, cc_bits, csts_bits, identify_cns, offsets, opcodes};

/// Register window size: control registers plus a handful of doorbells.
pub const MODEL_BAR_SIZE: usize = 0x2000;

pub const STATUS_INVALID_OPCODE: u16 = 0x01;
pub const STATUS_INVALID_FIELD: u16 = 0x02;
pub const STATUS_INVALID_NAMESPACE: u16 = 0x0B;
pub const STATUS_LBA_OUT_OF_RANGE: u16 = 0x80;

struct ModelQueue {
    base: u64,
    size: u16,
    head: u16,
}

struct ModelCompletionRing {
    base: u64,
    size: u16,
    tail: u16,
    phase: bool,
}

struct ModelNamespace {
    nsid: u32,
    block_size: u32,
    data: Vec<u8>,
    eui64: [u8; 8],
}

/// A completion the model has produced but not yet written to a ring.
struct PendingCompletion {
    result: u32,
    sq_head: u16,
    sq_id: u16,
    cid: u16,
    status_code: u16,
}

pub struct ModelController {
    bar: *mut u8,
    enabled: bool,
    shutdown_complete: bool,
    sqs: [Option<ModelQueue>; 2],
    cqs: [Option<ModelCompletionRing>; 2],
    namespaces: Vec<ModelNamespace>,
    held: Vec<(usize, PendingCompletion)>,
    /// Served for CNS 02h instead of the real namespace list when set.
    pub nsid_list_override: Option<Vec<u32>>,
    /// Namespace IDs the driver asked to identify, in order.
    pub identify_ns_requests: Vec<u32>,
    pub flush_count: usize,
    /// Fail the next executed command with this status code.
    pub fail_next: Option<u16>,
    /// Park completions in `held` instead of posting them.
    pub hold_completions: bool,
    /// Raise CSTS.CFS on the next tick and stop servicing queues.
    pub fatal: bool,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

// The model is only driven from the test thread, behind the platform lock.
unsafe impl Send for ModelController {}

impl ModelController {
    pub fn new() -> Self {
        let layout = Layout::from_size_align(MODEL_BAR_SIZE, PAGE_SIZE).unwrap();
        let bar = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!bar.is_null());

        let model = Self {
            bar,
            enabled: false,
            shutdown_complete: false,
            sqs: [None, None],
            cqs: [None, None],
            namespaces: Vec::new(),
            held: Vec::new(),
            nsid_list_override: None,
            identify_ns_requests: Vec::new(),
            flush_count: 0,
            fail_next: None,
            hold_completions: false,
            fatal: false,
            model: String::from("Fake NVMe Controller"),
            serial: String::from("FAKE0001"),
            firmware: String::from("1.0"),
        };

        // CAP: MQES = 63, contiguous queues required, NVM command set.
        model.write_reg64(offsets::CAP, 63 | (1 << 16) | (1 << 37));
        model.write_reg32(offsets::VS, 0x0001_0400);
        model
    }

    pub fn add_namespace(&mut self, nsid: u32, block_size: u32, block_count: u64) {
        self.namespaces.push(ModelNamespace {
            nsid,
            block_size,
            data: vec![0u8; (block_count * block_size as u64) as usize],
            eui64: [0x00, 0x25, 0x38, 0, 0, 0, 0, nsid as u8],
        });
    }

    pub fn bar_base(&self) -> u64 {
        self.bar as u64
    }

    /// Raw register value, for asserting on what the driver programmed.
    pub fn register32(&self, offset: usize) -> u32 {
        self.read_reg32(offset)
    }

    pub fn namespace_data(&self, nsid: u32) -> Option<&[u8]> {
        self.namespaces
            .iter()
            .find(|ns| ns.nsid == nsid)
            .map(|ns| ns.data.as_slice())
    }

    pub fn namespace_data_mut(&mut self, nsid: u32) -> Option<&mut [u8]> {
        self.namespaces
            .iter_mut()
            .find(|ns| ns.nsid == nsid)
            .map(|ns| ns.data.as_mut_slice())
    }

    fn read_reg32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.bar.add(offset) as *const u32) }
    }

    fn write_reg32(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.bar.add(offset) as *mut u32, value) };
    }

    fn read_reg64(&self, offset: usize) -> u64 {
        unsafe { core::ptr::read_volatile(self.bar.add(offset) as *const u64) }
    }

    fn write_reg64(&self, offset: usize, value: u64) {
        unsafe { core::ptr::write_volatile(self.bar.add(offset) as *mut u64, value) };
    }

    /// Advance the device by one step: latch register writes, then service
    /// doorbells.
    pub fn tick(&mut self) {
        if self.fatal {
            let csts = self.read_reg32(offsets::CSTS);
            self.write_reg32(offsets::CSTS, csts | csts_bits::CFS);
            return;
        }

        let cc = self.read_reg32(offsets::CC);
        let enable = cc & cc_bits::EN != 0;

        if enable && !self.enabled {
            self.latch_admin_queues();
            self.enabled = true;
            let csts = self.read_reg32(offsets::CSTS);
            self.write_reg32(offsets::CSTS, csts | csts_bits::RDY);
        } else if !enable && self.enabled {
            self.enabled = false;
            self.sqs = [None, None];
            self.cqs = [None, None];
            let csts = self.read_reg32(offsets::CSTS);
            self.write_reg32(offsets::CSTS, csts & !csts_bits::RDY);
        }

        if cc & cc_bits::SHN_MASK != 0 && !self.shutdown_complete {
            self.shutdown_complete = true;
            let csts = self.read_reg32(offsets::CSTS) & !csts_bits::SHST_MASK;
            self.write_reg32(
                offsets::CSTS,
                csts | (csts_bits::SHST_COMPLETE << csts_bits::SHST_SHIFT),
            );
        }

        if self.enabled && !self.shutdown_complete {
            self.service_queues();
        }
    }

    fn latch_admin_queues(&mut self) {
        let aqa = self.read_reg32(offsets::AQA);
        let sq_size = (aqa & aqa_bits::ASQS_MASK) as u16 + 1;
        let cq_size = ((aqa >> aqa_bits::ACQS_SHIFT) & aqa_bits::ASQS_MASK) as u16 + 1;

        self.sqs[0] = Some(ModelQueue {
            base: self.read_reg64(offsets::ASQ),
            size: sq_size,
            head: 0,
        });
        self.cqs[0] = Some(ModelCompletionRing {
            base: self.read_reg64(offsets::ACQ),
            size: cq_size,
            tail: 0,
            phase: true,
        });
    }

    fn sq_doorbell(&self, qid: u16) -> u16 {
        self.read_reg32(offsets::DOORBELL_BASE + 2 * qid as usize * 4) as u16
    }

    fn service_queues(&mut self) {
        for qid in 0..2u16 {
            loop {
                let Some(queue) = &self.sqs[qid as usize] else {
                    break;
                };
                let (base, size, head) = (queue.base, queue.size, queue.head);
                let tail = self.sq_doorbell(qid) % size;
                if head == tail {
                    break;
                }

                let cmd = unsafe {
                    core::ptr::read((base as usize as *const NvmeCommand).add(head as usize))
                };
                let next_head = (head + 1) % size;
                if let Some(queue) = &mut self.sqs[qid as usize] {
                    queue.head = next_head;
                }

                let (result, status_code) = self.execute(qid, &cmd);
                self.post_completion(
                    qid as usize,
                    PendingCompletion {
                        result,
                        sq_head: next_head,
                        sq_id: qid,
                        cid: cmd.command_id(),
                        status_code,
                    },
                );
            }
        }
    }

    fn execute(&mut self, qid: u16, cmd: &NvmeCommand) -> (u32, u16) {
        if let Some(status) = self.fail_next.take() {
            return (0, status);
        }
        if qid == 0 {
            self.execute_admin(cmd)
        } else {
            self.execute_io(cmd)
        }
    }

    fn execute_admin(&mut self, cmd: &NvmeCommand) -> (u32, u16) {
        match cmd.opcode() {
            opcodes::ADMIN_IDENTIFY => self.execute_identify(cmd),
            opcodes::ADMIN_CREATE_IO_CQ => {
                let qid = (cmd.cdw10 & 0xFFFF) as usize;
                let size = ((cmd.cdw10 >> 16) & 0xFFFF) as u16 + 1;
                if qid != 1 || self.cqs[1].is_some() {
                    return (0, STATUS_INVALID_FIELD);
                }
                self.cqs[qid] = Some(ModelCompletionRing {
                    base: cmd.prp1,
                    size,
                    tail: 0,
                    phase: true,
                });
                (0, 0)
            }
            opcodes::ADMIN_CREATE_IO_SQ => {
                let qid = (cmd.cdw10 & 0xFFFF) as usize;
                let size = ((cmd.cdw10 >> 16) & 0xFFFF) as u16 + 1;
                let cqid = (cmd.cdw11 >> 16) as usize;
                if qid != 1 || self.sqs[1].is_some() || cqid != 1 || self.cqs[1].is_none() {
                    return (0, STATUS_INVALID_FIELD);
                }
                self.sqs[qid] = Some(ModelQueue {
                    base: cmd.prp1,
                    size,
                    head: 0,
                });
                (0, 0)
            }
            _ => (0, STATUS_INVALID_OPCODE),
        }
    }

    fn execute_identify(&mut self, cmd: &NvmeCommand) -> (u32, u16) {
        match cmd.cdw10 & 0xFF {
            identify_cns::CONTROLLER => {
                self.write_identify_controller(cmd.prp1);
                (0, 0)
            }
            identify_cns::NAMESPACE => {
                self.identify_ns_requests.push(cmd.nsid);
                self.write_identify_namespace(cmd.nsid, cmd.prp1);
                (0, 0)
            }
            identify_cns::NAMESPACE_LIST => {
                self.write_namespace_list(cmd.prp1);
                (0, 0)
            }
            _ => (0, STATUS_INVALID_FIELD),
        }
    }

    fn write_identify_controller(&self, prp1: u64) {
        let mut data: IdentifyController = unsafe { core::mem::zeroed() };
        data.vid = 0x1B36;
        data.ssvid = 0x1B36;
        fill_ascii(&mut data.sn, self.serial.as_bytes());
        fill_ascii(&mut data.mn, self.model.as_bytes());
        fill_ascii(&mut data.fr, self.firmware.as_bytes());
        data.ver = 0x0001_0400;
        data.nn = self.namespaces.iter().map(|ns| ns.nsid).max().unwrap_or(0);
        data.sqes = 0x66;
        data.cqes = 0x44;
        unsafe { core::ptr::write(prp1 as usize as *mut IdentifyController, data) };
    }

    /// Unknown namespace IDs succeed with all-zero data, which the driver
    /// reads as inactive.
    fn write_identify_namespace(&self, nsid: u32, prp1: u64) {
        let mut data: IdentifyNamespace = unsafe { core::mem::zeroed() };
        if let Some(ns) = self.namespaces.iter().find(|ns| ns.nsid == nsid) {
            let blocks = (ns.data.len() / ns.block_size as usize) as u64;
            data.nsze = blocks;
            data.ncap = blocks;
            data.nuse = blocks;
            data.nlbaf = 0;
            data.flbas = 0;
            data.lbaf[0] = LbaFormat {
                ms: 0,
                lbads: ns.block_size.trailing_zeros() as u8,
                rp: 0,
            };
            data.eui64 = ns.eui64;
        }
        unsafe { core::ptr::write(prp1 as usize as *mut IdentifyNamespace, data) };
    }

    fn write_namespace_list(&self, prp1: u64) {
        let nsids: Vec<u32> = match &self.nsid_list_override {
            Some(list) => list.clone(),
            None => self.namespaces.iter().map(|ns| ns.nsid).collect(),
        };

        let base = prp1 as usize as *mut u32;
        unsafe {
            core::ptr::write_bytes(base as *mut u8, 0, PAGE_SIZE);
            for (i, nsid) in nsids.iter().take(1024).enumerate() {
                core::ptr::write(base.add(i), *nsid);
            }
        }
    }

    fn execute_io(&mut self, cmd: &NvmeCommand) -> (u32, u16) {
        let Some(index) = self.namespaces.iter().position(|ns| ns.nsid == cmd.nsid) else {
            return (0, STATUS_INVALID_NAMESPACE);
        };
        match cmd.opcode() {
            opcodes::NVM_FLUSH => {
                self.flush_count += 1;
                (0, 0)
            }
            opcodes::NVM_READ => self.execute_transfer(index, cmd, false),
            opcodes::NVM_WRITE => self.execute_transfer(index, cmd, true),
            _ => (0, STATUS_INVALID_OPCODE),
        }
    }

    fn execute_transfer(&mut self, index: usize, cmd: &NvmeCommand, is_write: bool) -> (u32, u16) {
        let ns = &mut self.namespaces[index];
        let slba = cmd.cdw10 as u64 | ((cmd.cdw11 as u64) << 32);
        let blocks = (cmd.cdw12 & 0xFFFF) as u64 + 1;
        let bs = ns.block_size as u64;
        let capacity = ns.data.len() as u64 / bs;
        if slba + blocks > capacity {
            return (0, STATUS_LBA_OUT_OF_RANGE);
        }

        let len = (blocks * bs) as usize;
        let offset = (slba * bs) as usize;

        // PRP1 covers up to the first page boundary, PRP2 the remainder.
        let first = len.min(PAGE_SIZE - (cmd.prp1 as usize & (PAGE_SIZE - 1)));
        let segments = [(cmd.prp1, 0, first), (cmd.prp2, first, len - first)];

        for (addr, data_offset, seg_len) in segments {
            if seg_len == 0 {
                continue;
            }
            let host = addr as usize as *mut u8;
            unsafe {
                if is_write {
                    core::ptr::copy_nonoverlapping(
                        host as *const u8,
                        ns.data.as_mut_ptr().add(offset + data_offset),
                        seg_len,
                    );
                } else {
                    core::ptr::copy_nonoverlapping(
                        ns.data.as_ptr().add(offset + data_offset),
                        host,
                        seg_len,
                    );
                }
            }
        }
        (0, 0)
    }

    fn post_completion(&mut self, qid: usize, pending: PendingCompletion) {
        if self.hold_completions {
            self.held.push((qid, pending));
            return;
        }
        self.deliver(qid, pending);
    }

    fn deliver(&mut self, qid: usize, pending: PendingCompletion) {
        let Some(cq) = &mut self.cqs[qid] else {
            return;
        };
        let entry = NvmeCompletion {
            result: pending.result,
            reserved: 0,
            sq_head: pending.sq_head,
            sq_id: pending.sq_id,
            command_id: pending.cid,
            status: (pending.status_code << 1) | cq.phase as u16,
        };
        unsafe {
            core::ptr::write(
                (cq.base as usize as *mut NvmeCompletion).add(cq.tail as usize),
                entry,
            );
        }
        cq.tail = (cq.tail + 1) % cq.size;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
    }

    /// Post every held completion, as a device answering late would.
    pub fn release_held(&mut self) {
        for (qid, pending) in std::mem::take(&mut self.held) {
            self.deliver(qid, pending);
        }
    }

    /// Drop every held completion, as a device that lost them would.
    pub fn discard_held(&mut self) {
        self.held.clear();
    }
}

impl Default for ModelController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModelController {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(MODEL_BAR_SIZE, PAGE_SIZE).unwrap();
        unsafe { std::alloc::dealloc(self.bar, layout) };
    }
}

fn fill_ascii(field: &mut [u8], value: &[u8]) {
    field.fill(b' ');
    let n = value.len().min(field.len());
    field[..n].copy_from_slice(&value[..n]);
}

/// Platform implementation backed by host memory and a [`ModelController`].
///
/// Physical and virtual addresses are identical, DMA allocations are tracked
/// so tests can assert everything is returned, and `sleep` advances the
/// model by one tick.
pub struct FakePlatform {
    model: Mutex<ModelController>,
    dma: Mutex<Vec<(u64, usize)>>,
    mapped: Mutex<usize>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::with_model(ModelController::new())
    }

    pub fn with_model(model: ModelController) -> Self {
        Self {
            model: Mutex::new(model),
            dma: Mutex::new(Vec::new()),
            mapped: Mutex::new(0),
        }
    }

    /// Physical address of the model's register window.
    pub fn bar_addr(&self) -> PhysAddr {
        PhysAddr::new(self.model.lock().bar_base())
    }

    pub fn model(&self) -> MutexGuard<'_, ModelController> {
        self.model.lock()
    }

    /// DMA allocations not yet freed.
    pub fn outstanding_dma(&self) -> usize {
        self.dma.lock().len()
    }

    /// MMIO regions currently mapped.
    pub fn mapped_regions(&self) -> usize {
        *self.mapped.lock()
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for FakePlatform {
    fn map_mmio(&self, phys_addr: PhysAddr, size: usize) -> Option<MmioRegion> {
        if phys_addr != self.bar_addr() || size > MODEL_BAR_SIZE {
            return None;
        }
        *self.mapped.lock() += 1;
        Some(MmioRegion {
            phys_addr,
            virt_addr: VirtAddr::new(phys_addr.as_u64()),
            size,
        })
    }

    fn unmap_mmio(&self, _region: MmioRegion) {
        *self.mapped.lock() -= 1;
    }

    fn alloc_dma(&self, frames: usize) -> Option<DmaBuffer> {
        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }

        let addr = ptr as u64;
        self.dma.lock().push((addr, frames));
        Some(DmaBuffer {
            phys_addr: PhysAddr::new(addr),
            virt_addr: VirtAddr::new(addr),
            size: frames,
        })
    }

    unsafe fn free_dma(&self, buffer: DmaBuffer) {
        let addr = buffer.phys_addr.as_u64();
        let mut ledger = self.dma.lock();
        let index = ledger
            .iter()
            .position(|&(base, _)| base == addr)
            .unwrap_or_else(|| panic!("freeing unknown DMA buffer at {:#x}", addr));
        let (_, frames) = ledger.swap_remove(index);

        let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { std::alloc::dealloc(addr as usize as *mut u8, layout) };
    }

    fn virt_to_phys(&self, virt_addr: VirtAddr) -> Option<PhysAddr> {
        Some(PhysAddr::new(virt_addr.as_u64()))
    }

    fn sleep(&self, _duration: Duration) {
        self.model.lock().tick();
    }
}
