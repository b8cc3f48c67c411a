//! Discovered namespaces and the per-controller namespace table.

use alloc::vec::Vec;

use crate::identify::IdentifyNamespace;

/// Geometry and identity of one active namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    pub nsid: u32,
    pub block_count: u64,
    pub block_size: u32,
    pub eui64: Option<[u8; 8]>,
}

impl Namespace {
    /// Build from IDENTIFY namespace data. Returns `None` for an inactive
    /// namespace, which reports a size of zero.
    pub fn from_identify(nsid: u32, data: &IdentifyNamespace) -> Option<Self> {
        if data.nsze == 0 {
            return None;
        }
        Some(Self {
            nsid,
            block_count: data.nsze,
            block_size: data.lba_size(),
            eui64: data.eui64(),
        })
    }

    pub fn size_bytes(&self) -> u64 {
        self.block_count * self.block_size as u64
    }
}

/// Active namespaces of one controller, ordered by discovery.
#[derive(Debug, Default)]
pub struct NamespaceTable {
    entries: Vec<Namespace>,
}

impl NamespaceTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, namespace: Namespace) {
        self.entries.push(namespace);
    }

    pub fn get(&self, nsid: u32) -> Option<&Namespace> {
        self.entries.iter().find(|ns| ns.nsid == nsid)
    }

    pub fn entries(&self) -> &[Namespace] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
