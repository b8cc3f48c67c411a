//! NVMe controller lifecycle, command dispatch and completion polling.
//!
//! One `NvmeController` owns the register window, the admin and I/O queue
//! pairs and the request pool. Submission and polling share a single lock
//! over the mutable queue state; register reads and doorbell writes go
//! straight to hardware.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use log::{debug, info, warn};
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::commands::NvmeCommand;
use crate::hal::{OwnedDma, PAGE_SIZE, Platform};
use crate::identify::{IdentifyController, IdentifyNamespace};
use crate::namespace::{Namespace, NamespaceTable};
use crate::queue::QueuePair;
use crate::registers::{NvmeRegisters, csts_bits};
use crate::request::{RequestHandle, RequestPool};
use crate::NvmeError;

const ADMIN_QUEUE_ID: u16 = 0;
const IO_QUEUE_ID: u16 = 1;

/// Requested queue depths, clamped to CAP.MQES at bring-up.
const ADMIN_QUEUE_DEPTH: u16 = 32;
const IO_QUEUE_DEPTH: u16 = 64;

/// How often and how long to poll for readiness and completions.
const POLL_INTERVAL: Duration = Duration::from_micros(100);
const POLL_BUDGET: usize = 1000;

/// Largest single transfer: two PRP entries, one page each.
pub const MAX_TRANSFER_BYTES: usize = 2 * PAGE_SIZE;

/// Namespace IDs examined per controller.
const MAX_NAMESPACES: usize = 32;

/// Largest power of two not above `v`.
fn floor_pow2(v: u16) -> u16 {
    debug_assert!(v != 0);
    1 << (15 - v.leading_zeros())
}

/// Bring-up progress of a controller. `Fatal` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Disabled,
    Resetting,
    AdminQueuesReady,
    Identified,
    IoQueuesReady,
    NamespacesDiscovered,
    Operational,
    ShuttingDown,
    Fatal,
}

/// Identity reported by IDENTIFY controller.
#[derive(Debug, Clone, Default)]
pub struct ControllerInfo {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// Raw version dword: major in bits 31:16, minor in bits 15:8.
    pub version: u32,
}

impl ControllerInfo {
    pub fn version_major(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn version_minor(&self) -> u8 {
        (self.version >> 8) as u8
    }
}

/// Queue state shared between submission and polling paths.
struct ControllerInner<P: Platform> {
    state: ControllerState,
    admin: Option<QueuePair<P>>,
    io: Option<QueuePair<P>>,
    requests: RequestPool,
}

impl<P: Platform> ControllerInner<P> {
    fn queue_mut(&mut self, queue_id: u16) -> Result<&mut QueuePair<P>, NvmeError> {
        let pair = match queue_id {
            ADMIN_QUEUE_ID => self.admin.as_mut(),
            IO_QUEUE_ID => self.io.as_mut(),
            _ => None,
        };
        pair.ok_or(NvmeError::InvalidParameter)
    }
}

pub struct NvmeController<P: Platform> {
    platform: Arc<P>,
    regs: NvmeRegisters<P>,
    index: usize,
    max_queue_entries: u16,
    info: ControllerInfo,
    namespaces: NamespaceTable,
    inner: Mutex<ControllerInner<P>>,
}

impl<P: Platform> NvmeController<P> {
    /// Map the register window at `bar` and bring the controller all the way
    /// to the operational state.
    pub fn probe(
        platform: Arc<P>,
        index: usize,
        bar: PhysAddr,
        bar_size: usize,
    ) -> Result<Self, NvmeError> {
        info!(
            "Initializing NVMe controller {} at {:#x}",
            index,
            bar.as_u64()
        );

        let region = platform
            .map_mmio(bar, bar_size)
            .ok_or(NvmeError::ResourceExhausted)?;
        let regs = unsafe { NvmeRegisters::new(platform.clone(), region) };

        debug!("NVMe registers mapped at {:#x}", region.virt_addr.as_u64());
        let version = regs.version();
        info!("NVMe version {}.{}", version >> 16, (version >> 8) & 0xFF);

        let max_queue_entries = regs.max_queue_entries();
        debug!("NVMe Controller Capabilities:");
        debug!("  Max Queue Entries: {}", max_queue_entries);
        debug!("  Doorbell Stride: {} bytes", regs.doorbell_stride());
        debug!("  Min Page Size: {} bytes", regs.min_page_size());
        debug!("  Max Page Size: {} bytes", regs.max_page_size());

        let mut controller = Self {
            platform,
            regs,
            index,
            max_queue_entries,
            info: ControllerInfo::default(),
            namespaces: NamespaceTable::new(),
            inner: Mutex::new(ControllerInner {
                state: ControllerState::Disabled,
                admin: None,
                io: None,
                requests: RequestPool::new(),
            }),
        };
        controller.bring_up()?;
        Ok(controller)
    }

    fn bring_up(&mut self) -> Result<(), NvmeError> {
        self.transition(ControllerState::Resetting);
        self.reset()?;
        self.setup_admin_queues()?;
        self.enable()?;
        self.transition(ControllerState::AdminQueuesReady);

        self.identify_controller()?;
        self.transition(ControllerState::Identified);

        self.create_io_queues()?;
        self.transition(ControllerState::IoQueuesReady);

        self.discover_namespaces()?;
        self.transition(ControllerState::NamespacesDiscovered);

        self.transition(ControllerState::Operational);
        info!(
            "NVMe controller {} ready: {} namespace(s)",
            self.index,
            self.namespaces.len()
        );
        Ok(())
    }

    /// Clear CC.EN and wait for the controller to report not ready.
    fn reset(&self) -> Result<(), NvmeError> {
        info!("Resetting NVMe controller");
        self.regs.disable();
        self.wait_ready(false)?;
        info!("Controller reset complete");
        Ok(())
    }

    /// Allocate the admin queue pair and program AQA/ASQ/ACQ.
    fn setup_admin_queues(&mut self) -> Result<(), NvmeError> {
        info!("Setting up admin queues");

        let depth = floor_pow2(core::cmp::min(ADMIN_QUEUE_DEPTH, self.max_queue_entries));
        let admin = QueuePair::new(&self.platform, ADMIN_QUEUE_ID, depth)?;

        self.regs.set_admin_queue_attributes(depth, depth);
        self.regs.set_admin_sq_base(admin.sq.phys_base());
        self.regs.set_admin_cq_base(admin.cq.phys_base());

        info!(
            "Admin queues configured: SQ={:#x}, CQ={:#x}",
            admin.sq.phys_base().as_u64(),
            admin.cq.phys_base().as_u64()
        );

        self.inner.lock().admin = Some(admin);
        Ok(())
    }

    fn enable(&self) -> Result<(), NvmeError> {
        info!("Enabling NVMe controller");
        self.regs.configure_and_enable();
        self.wait_ready(true)?;
        info!("Controller enabled and ready");
        Ok(())
    }

    /// Poll CSTS.RDY until it matches `want`.
    fn wait_ready(&self, want: bool) -> Result<(), NvmeError> {
        for _ in 0..POLL_BUDGET {
            if self.regs.is_fatal() {
                self.transition(ControllerState::Fatal);
                return Err(NvmeError::ControllerFatal);
            }
            if self.regs.is_ready() == want {
                return Ok(());
            }
            self.platform.sleep(POLL_INTERVAL);
        }
        Err(NvmeError::Timeout)
    }

    fn identify_controller(&mut self) -> Result<(), NvmeError> {
        info!("Identifying NVMe controller");

        let buffer = OwnedDma::zeroed(&self.platform, 1)?;
        self.admin_command(NvmeCommand::identify_controller(buffer.phys_addr()))?;

        let identify_data = unsafe { &*buffer.virt_addr().as_ptr::<IdentifyController>() };
        self.info = ControllerInfo {
            model: String::from(identify_data.model()),
            serial: String::from(identify_data.serial()),
            firmware: String::from(identify_data.firmware()),
            version: identify_data.ver,
        };

        info!("Controller Information:");
        info!("  Model: {}", self.info.model);
        info!("  Serial: {}", self.info.serial);
        info!("  Firmware: {}", self.info.firmware);
        info!("  Version: {:#x}", identify_data.ver);
        info!("  Namespaces: {}", identify_data.nn);
        Ok(())
    }

    fn create_io_queues(&mut self) -> Result<(), NvmeError> {
        info!("Creating I/O queues");

        let depth = floor_pow2(core::cmp::min(IO_QUEUE_DEPTH, self.max_queue_entries));
        let pair = QueuePair::new(&self.platform, IO_QUEUE_ID, depth)?;

        // Completion queue first: the submission queue names it at creation.
        self.admin_command(NvmeCommand::create_io_completion_queue(
            IO_QUEUE_ID,
            depth,
            pair.cq.phys_base(),
        ))?;
        info!("I/O Completion Queue created");

        self.admin_command(NvmeCommand::create_io_submission_queue(
            IO_QUEUE_ID,
            IO_QUEUE_ID,
            depth,
            pair.sq.phys_base(),
        ))?;
        info!("I/O Submission Queue created");

        self.inner.lock().io = Some(pair);
        info!("I/O queues ready");
        Ok(())
    }

    /// Fetch the active namespace list and identify each entry. The list is
    /// zero-terminated; inactive namespaces identify with a size of zero and
    /// are skipped.
    fn discover_namespaces(&mut self) -> Result<(), NvmeError> {
        info!("Discovering namespaces");

        let list = OwnedDma::zeroed(&self.platform, 1)?;
        self.admin_command(NvmeCommand::identify_namespace_list(list.phys_addr()))?;

        let mut nsids = Vec::new();
        for chunk in list.bytes().chunks_exact(4) {
            let nsid = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if nsid == 0 {
                break;
            }
            nsids.push(nsid);
            if nsids.len() == MAX_NAMESPACES {
                break;
            }
        }

        for nsid in nsids {
            match self.identify_namespace(nsid) {
                Ok(Some(namespace)) => {
                    info!(
                        "Namespace {}: {} blocks of {} bytes",
                        nsid, namespace.block_count, namespace.block_size
                    );
                    self.namespaces.insert(namespace);
                }
                Ok(None) => debug!("Namespace {} is inactive", nsid),
                Err(e) => warn!("Failed to identify namespace {}: {:?}", nsid, e),
            }
        }

        info!("Found {} namespace(s)", self.namespaces.len());
        Ok(())
    }

    fn identify_namespace(&mut self, nsid: u32) -> Result<Option<Namespace>, NvmeError> {
        debug!("Identifying namespace {}", nsid);

        let buffer = OwnedDma::zeroed(&self.platform, 1)?;
        self.admin_command(NvmeCommand::identify_namespace(nsid, buffer.phys_addr()))?;

        let data = unsafe { &*buffer.virt_addr().as_ptr::<IdentifyNamespace>() };
        Ok(Namespace::from_identify(nsid, data))
    }

    fn transition(&self, to: ControllerState) {
        let mut inner = self.inner.lock();
        debug!(
            "Controller {} state: {:?} -> {:?}",
            self.index, inner.state, to
        );
        inner.state = to;
    }

    /// Track a command, write it to the submission ring and ring the
    /// doorbell. The returned handle settles through `wait_for`.
    pub(crate) fn submit(
        &self,
        queue_id: u16,
        mut cmd: NvmeCommand,
    ) -> Result<RequestHandle, NvmeError> {
        let mut inner = self.inner.lock();
        if inner.state == ControllerState::Fatal {
            return Err(NvmeError::ControllerFatal);
        }

        let handle = inner.requests.allocate(queue_id)?;
        cmd.set_command_id(handle.cid());

        let tail = match inner.queue_mut(queue_id).and_then(|pair| pair.sq.push(cmd)) {
            Ok(tail) => tail,
            Err(e) => {
                // The device never saw this command id.
                inner.requests.cancel(handle);
                return Err(e);
            }
        };
        self.regs.ring_doorbell(queue_id, false, tail);
        Ok(handle)
    }

    /// Consume every posted completion on both queues, settle matching
    /// requests and update the completion doorbells.
    fn drain(&self, inner: &mut ControllerInner<P>) -> Result<(), NvmeError> {
        if self.regs.is_fatal() {
            if inner.state != ControllerState::Fatal {
                warn!("NVMe controller {} reports fatal status", self.index);
                inner.state = ControllerState::Fatal;
            }
            return Err(NvmeError::ControllerFatal);
        }

        let ControllerInner {
            admin,
            io,
            requests,
            ..
        } = inner;
        for pair in [admin.as_mut(), io.as_mut()].into_iter().flatten() {
            let mut consumed = false;
            while let Some(entry) = pair.cq.pop() {
                consumed = true;
                pair.sq.set_head(entry.sq_head);
                if !requests.complete(pair.id, &entry) {
                    warn!(
                        "Discarding completion for unknown cid {} on queue {}",
                        entry.command_id, pair.id
                    );
                }
            }
            if consumed {
                self.regs.ring_doorbell(pair.id, true, pair.cq.head());
            }
        }
        Ok(())
    }

    fn poll_once(&self, handle: RequestHandle) -> Result<Option<u32>, NvmeError> {
        let mut inner = self.inner.lock();
        if let Err(e) = self.drain(&mut inner) {
            inner.requests.expire(handle);
            inner.requests.release(handle);
            return Err(e);
        }
        inner.requests.poll_result(handle).transpose()
    }

    /// Poll until the command settles or the budget runs out. A timed-out
    /// slot is reclaimed here; if its completion arrives later, the drain
    /// path discards it by command id.
    pub(crate) fn wait_for(&self, handle: RequestHandle) -> Result<u32, NvmeError> {
        for _ in 0..POLL_BUDGET {
            if let Some(result) = self.poll_once(handle)? {
                return Ok(result);
            }
            self.platform.sleep(POLL_INTERVAL);
        }
        if let Some(result) = self.poll_once(handle)? {
            return Ok(result);
        }

        warn!(
            "Command {} on queue {} timed out",
            handle.cid(),
            handle.queue_id()
        );
        let mut inner = self.inner.lock();
        inner.requests.expire(handle);
        inner.requests.release(handle);
        Err(NvmeError::Timeout)
    }

    fn admin_command(&self, cmd: NvmeCommand) -> Result<u32, NvmeError> {
        let handle = self.submit(ADMIN_QUEUE_ID, cmd)?;
        self.wait_for(handle)
    }

    fn io_command(&self, cmd: NvmeCommand) -> Result<u32, NvmeError> {
        let handle = self.submit(IO_QUEUE_ID, cmd)?;
        self.wait_for(handle)
    }

    fn ensure_operational(&self) -> Result<(), NvmeError> {
        if self.inner.lock().state != ControllerState::Operational {
            return Err(NvmeError::ControllerFatal);
        }
        Ok(())
    }

    /// Validate an I/O request and return its length in bytes.
    fn transfer_len(
        &self,
        nsid: u32,
        lba: u64,
        count: u16,
        buffer_len: usize,
    ) -> Result<usize, NvmeError> {
        let namespace = self.namespaces.get(nsid).ok_or(NvmeError::NotFound)?;
        if count == 0 {
            return Err(NvmeError::InvalidParameter);
        }
        let end = lba
            .checked_add(count as u64)
            .ok_or(NvmeError::InvalidParameter)?;
        if end > namespace.block_count {
            return Err(NvmeError::InvalidParameter);
        }

        let len = count as usize * namespace.block_size as usize;
        if len > MAX_TRANSFER_BYTES || buffer_len < len {
            return Err(NvmeError::InvalidParameter);
        }
        Ok(len)
    }

    /// Translate a virtually contiguous buffer into PRP entries. A transfer
    /// may touch at most two pages; PRP2 points at the second.
    fn build_prps(
        &self,
        start: VirtAddr,
        len: usize,
    ) -> Result<(PhysAddr, Option<PhysAddr>), NvmeError> {
        let page_mask = !(PAGE_SIZE as u64 - 1);
        let first_page = start.as_u64() & page_mask;
        let last_page = (start.as_u64() + len as u64 - 1) & page_mask;
        let pages = (last_page - first_page) / PAGE_SIZE as u64 + 1;
        if pages > 2 {
            return Err(NvmeError::InvalidParameter);
        }

        let prp1 = self
            .platform
            .virt_to_phys(start)
            .ok_or(NvmeError::InvalidParameter)?;
        let prp2 = if pages == 2 {
            let second = self
                .platform
                .virt_to_phys(VirtAddr::new(last_page))
                .ok_or(NvmeError::InvalidParameter)?;
            Some(second)
        } else {
            None
        };
        Ok((prp1, prp2))
    }

    /// Read `count` blocks starting at `lba` directly into `buffer`. The
    /// buffer must be physically reachable through at most two PRP entries.
    pub fn read_blocks(
        &self,
        nsid: u32,
        lba: u64,
        count: u16,
        buffer: &mut [u8],
    ) -> Result<(), NvmeError> {
        self.ensure_operational()?;
        let len = self.transfer_len(nsid, lba, count, buffer.len())?;
        let (prp1, prp2) = self.build_prps(VirtAddr::new(buffer.as_mut_ptr() as u64), len)?;

        let mut cmd = NvmeCommand::read(nsid, lba, count, prp1);
        if let Some(prp2) = prp2 {
            cmd.set_prp2(prp2);
        }
        self.io_command(cmd)?;

        debug!("Read {} blocks from LBA {} (namespace {})", count, lba, nsid);
        Ok(())
    }

    /// Write `count` blocks starting at `lba` directly from `buffer`.
    pub fn write_blocks(
        &self,
        nsid: u32,
        lba: u64,
        count: u16,
        buffer: &[u8],
    ) -> Result<(), NvmeError> {
        self.ensure_operational()?;
        let len = self.transfer_len(nsid, lba, count, buffer.len())?;
        let (prp1, prp2) = self.build_prps(VirtAddr::new(buffer.as_ptr() as u64), len)?;

        let mut cmd = NvmeCommand::write(nsid, lba, count, prp1);
        if let Some(prp2) = prp2 {
            cmd.set_prp2(prp2);
        }
        self.io_command(cmd)?;

        debug!("Wrote {} blocks to LBA {} (namespace {})", count, lba, nsid);
        Ok(())
    }

    /// Commit the namespace's volatile write cache to stable media.
    pub fn flush(&self, nsid: u32) -> Result<(), NvmeError> {
        self.ensure_operational()?;
        if self.namespaces.get(nsid).is_none() {
            return Err(NvmeError::NotFound);
        }
        self.io_command(NvmeCommand::flush(nsid))?;
        Ok(())
    }

    /// Orderly shutdown: notify the device, wait for it to finish, then
    /// disable it and release the queues.
    pub fn shutdown(&self) -> Result<(), NvmeError> {
        info!("Shutting down NVMe controller {}", self.index);
        self.transition(ControllerState::ShuttingDown);
        self.regs.begin_shutdown();

        let mut complete = false;
        for _ in 0..POLL_BUDGET {
            if self.regs.shutdown_status() == csts_bits::SHST_COMPLETE {
                complete = true;
                break;
            }
            self.platform.sleep(POLL_INTERVAL);
        }

        self.regs.disable();

        let mut inner = self.inner.lock();
        inner.io = None;
        inner.admin = None;
        drop(inner);

        if complete {
            info!("NVMe controller {} shutdown complete", self.index);
            Ok(())
        } else {
            warn!("NVMe controller {} shutdown timed out", self.index);
            Err(NvmeError::Timeout)
        }
    }

    pub(crate) fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ControllerState {
        self.inner.lock().state
    }

    pub fn controller_info(&self) -> &ControllerInfo {
        &self.info
    }

    pub fn namespaces(&self) -> &NamespaceTable {
        &self.namespaces
    }

    pub fn namespace(&self, nsid: u32) -> Option<&Namespace> {
        self.namespaces.get(nsid)
    }

    pub fn max_queue_entries(&self) -> u16 {
        self.max_queue_entries
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.lock().requests.in_flight()
    }
}

impl<P: Platform> Drop for NvmeController<P> {
    fn drop(&mut self) {
        // Quiesce the device before its queues are freed.
        if self.inner.lock().state != ControllerState::ShuttingDown {
            self.regs.disable();
        }
    }
}
