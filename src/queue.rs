//! Submission and completion queue rings.
//!
//! Each ring lives in its own physically contiguous DMA allocation. The
//! driver owns the submission tail and completion head; the controller owns
//! the other ends and reports submission head movement through completions.

use alloc::sync::Arc;
use core::mem::size_of;

use x86_64::PhysAddr;

use crate::commands::{NvmeCommand, NvmeCompletion};
use crate::hal::{OwnedDma, PAGE_SIZE, Platform};
use crate::NvmeError;

/// Smallest ring the controller accepts (one usable slot).
pub const MIN_QUEUE_DEPTH: u16 = 2;

/// Queue depths must be powers of two so head/tail arithmetic can mask
/// instead of dividing. The controller's CAP.MQES ceiling is the caller's
/// problem; this checks only the shape.
fn check_depth(depth: u16) -> Result<(), NvmeError> {
    if depth < MIN_QUEUE_DEPTH || !depth.is_power_of_two() {
        return Err(NvmeError::InvalidParameter);
    }
    Ok(())
}

fn ring_frames(entries: u16, entry_size: usize) -> usize {
    (entries as usize * entry_size).div_ceil(PAGE_SIZE)
}

/// One submission ring of 64-byte entries.
pub struct SubmissionQueue<P: Platform> {
    ring: OwnedDma<P>,
    depth: u16,
    head: u16,
    tail: u16,
}

impl<P: Platform> SubmissionQueue<P> {
    pub fn new(platform: &Arc<P>, depth: u16) -> Result<Self, NvmeError> {
        check_depth(depth)?;
        let ring = OwnedDma::zeroed(platform, ring_frames(depth, size_of::<NvmeCommand>()))?;
        Ok(Self {
            ring,
            depth,
            head: 0,
            tail: 0,
        })
    }

    pub fn phys_base(&self) -> PhysAddr {
        self.ring.phys_addr()
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn is_full(&self) -> bool {
        (self.tail + 1) & (self.depth - 1) == self.head
    }

    /// Write a command at the tail and advance it. Returns the new tail for
    /// the doorbell; the caller rings it.
    pub fn push(&mut self, cmd: NvmeCommand) -> Result<u16, NvmeError> {
        if self.is_full() {
            return Err(NvmeError::NoFreeSlot);
        }

        let entry_ptr = unsafe {
            self.ring
                .virt_addr()
                .as_mut_ptr::<NvmeCommand>()
                .add(self.tail as usize)
        };
        unsafe { core::ptr::write_volatile(entry_ptr, cmd) };

        self.tail = (self.tail + 1) & (self.depth - 1);
        Ok(self.tail)
    }

    /// Adopt the head position a completion entry reported.
    pub fn set_head(&mut self, head: u16) {
        self.head = head & (self.depth - 1);
    }
}

/// One completion ring of 16-byte entries.
///
/// Entry ownership is tracked by the phase bit: the ring starts zeroed, so
/// the first pass expects phase 1, and the expectation flips on every
/// wraparound.
pub struct CompletionQueue<P: Platform> {
    ring: OwnedDma<P>,
    depth: u16,
    head: u16,
    phase: bool,
}

impl<P: Platform> CompletionQueue<P> {
    pub fn new(platform: &Arc<P>, depth: u16) -> Result<Self, NvmeError> {
        check_depth(depth)?;
        let ring = OwnedDma::zeroed(platform, ring_frames(depth, size_of::<NvmeCompletion>()))?;
        Ok(Self {
            ring,
            depth,
            head: 0,
            phase: true,
        })
    }

    pub fn phys_base(&self) -> PhysAddr {
        self.ring.phys_addr()
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    /// Current head, for the completion doorbell after consuming entries.
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Consume the entry at the head if the controller has posted one.
    pub fn pop(&mut self) -> Option<NvmeCompletion> {
        let entry_ptr = unsafe {
            self.ring
                .virt_addr()
                .as_ptr::<NvmeCompletion>()
                .add(self.head as usize)
        };
        let entry = unsafe { core::ptr::read_volatile(entry_ptr) };

        if !entry.is_valid(self.phase) {
            return None;
        }

        self.head = (self.head + 1) & (self.depth - 1);
        if self.head == 0 {
            self.phase = !self.phase;
        }
        Some(entry)
    }

    #[cfg(test)]
    pub(crate) fn ring_base(&self) -> x86_64::VirtAddr {
        self.ring.virt_addr()
    }
}

/// A submission/completion ring pair sharing a queue ID.
pub struct QueuePair<P: Platform> {
    pub id: u16,
    pub sq: SubmissionQueue<P>,
    pub cq: CompletionQueue<P>,
}

impl<P: Platform> QueuePair<P> {
    pub fn new(platform: &Arc<P>, id: u16, depth: u16) -> Result<Self, NvmeError> {
        Ok(Self {
            id,
            sq: SubmissionQueue::new(platform, depth)?,
            cq: CompletionQueue::new(platform, depth)?,
        })
    }
}
