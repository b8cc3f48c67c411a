//! In-flight command tracking.
//!
//! A fixed pool of request slots maps command IDs to outcomes. Command IDs
//! come from a wrapping counter rather than the slot index, so a late
//! completion for a recycled slot cannot be mistaken for the new occupant.

use crate::commands::NvmeCompletion;
use crate::NvmeError;

/// Upper bound on concurrently tracked commands across all queues.
pub const REQUEST_POOL_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Free,
    Pending,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub cid: u16,
    pub queue_id: u16,
    pub state: RequestState,
    pub result: u32,
    pub status: u16,
}

const IDLE: Request = Request {
    cid: 0,
    queue_id: 0,
    state: RequestState::Free,
    result: 0,
    status: 0,
};

/// Ticket for one tracked command. The embedded command ID guards every
/// later pool operation against a stale handle.
#[derive(Debug, Clone, Copy)]
pub struct RequestHandle {
    pub(crate) slot: usize,
    cid: u16,
    queue_id: u16,
}

impl RequestHandle {
    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }
}

pub struct RequestPool {
    slots: [Request; REQUEST_POOL_SIZE],
    next_cid: u16,
}

impl RequestPool {
    pub fn new() -> Self {
        Self {
            slots: [IDLE; REQUEST_POOL_SIZE],
            next_cid: 0,
        }
    }

    /// Claim a free slot for a command on `queue_id`.
    pub fn allocate(&mut self, queue_id: u16) -> Result<RequestHandle, NvmeError> {
        let slot = self
            .slots
            .iter()
            .position(|r| r.state == RequestState::Free)
            .ok_or(NvmeError::NoFreeSlot)?;
        let cid = self.next_unique_cid();

        let request = &mut self.slots[slot];
        request.cid = cid;
        request.queue_id = queue_id;
        request.state = RequestState::Pending;
        request.result = 0;
        request.status = 0;

        Ok(RequestHandle {
            slot,
            cid,
            queue_id,
        })
    }

    /// Next counter value not claimed by a live slot. At most
    /// `REQUEST_POOL_SIZE` values can be skipped, so the loop terminates.
    fn next_unique_cid(&mut self) -> u16 {
        loop {
            let cid = self.next_cid;
            self.next_cid = self.next_cid.wrapping_add(1);
            let live = self
                .slots
                .iter()
                .any(|r| r.state != RequestState::Free && r.cid == cid);
            if !live {
                return cid;
            }
        }
    }

    /// Record a completion entry against its pending request. Returns false
    /// when no pending request matches; the caller discards the entry.
    pub fn complete(&mut self, queue_id: u16, entry: &NvmeCompletion) -> bool {
        let matched = self.slots.iter_mut().find(|r| {
            r.state == RequestState::Pending && r.cid == entry.command_id && r.queue_id == queue_id
        });
        let Some(request) = matched else {
            return false;
        };

        request.result = entry.result;
        request.status = entry.status_code();
        request.state = if entry.is_success() {
            RequestState::Completed
        } else {
            RequestState::Failed
        };
        true
    }

    /// Consume the outcome of a finished request, freeing its slot. `None`
    /// while the request is still pending or already timed out.
    pub fn poll_result(&mut self, handle: RequestHandle) -> Option<Result<u32, NvmeError>> {
        let request = &mut self.slots[handle.slot];
        if request.cid != handle.cid {
            return None;
        }
        match request.state {
            RequestState::Completed => {
                request.state = RequestState::Free;
                Some(Ok(request.result))
            }
            RequestState::Failed => {
                request.state = RequestState::Free;
                Some(Err(NvmeError::DeviceError(request.status)))
            }
            _ => None,
        }
    }

    /// Mark a pending request as timed out. `release` frees only settled
    /// slots, so the timeout path settles the request first.
    pub fn expire(&mut self, handle: RequestHandle) {
        let request = &mut self.slots[handle.slot];
        if request.cid == handle.cid && request.state == RequestState::Pending {
            request.state = RequestState::TimedOut;
        }
    }

    /// Free a slot that is no longer pending.
    pub fn release(&mut self, handle: RequestHandle) {
        let request = &mut self.slots[handle.slot];
        if request.cid == handle.cid && request.state != RequestState::Pending {
            request.state = RequestState::Free;
        }
    }

    /// Free a pending slot whose command never reached the device. Only
    /// valid before the doorbell rings.
    pub fn cancel(&mut self, handle: RequestHandle) {
        let request = &mut self.slots[handle.slot];
        if request.cid == handle.cid && request.state == RequestState::Pending {
            request.state = RequestState::Free;
        }
    }

    /// Slots not currently free, in any state.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|r| r.state != RequestState::Free)
            .count()
    }
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new()
    }
}
