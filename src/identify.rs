//! IDENTIFY data structures returned by the controller.
//!
//! Field names follow the NVMe 1.4 mnemonics; both structures are exactly
//! 4096 bytes and overlay the DMA buffer an IDENTIFY command fills in.

/// Controller Identify Data Structure (4096 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IdentifyController {
    pub vid: u16,           // PCI Vendor ID
    pub ssvid: u16,         // PCI Subsystem Vendor ID
    pub sn: [u8; 20],       // Serial Number
    pub mn: [u8; 40],       // Model Number
    pub fr: [u8; 8],        // Firmware Revision
    pub rab: u8,            // Recommended Arbitration Burst
    pub ieee: [u8; 3],      // IEEE OUI Identifier
    pub cmic: u8,           // Controller Multi-Path I/O and Namespace Sharing
    pub mdts: u8,           // Maximum Data Transfer Size
    pub cntlid: u16,        // Controller ID
    pub ver: u32,           // Version
    pub rtd3r: u32,         // RTD3 Resume Latency
    pub rtd3e: u32,         // RTD3 Entry Latency
    pub oaes: u32,          // Optional Asynchronous Events Supported
    pub ctratt: u32,        // Controller Attributes
    pub rrls: u16,          // Read Recovery Levels Supported
    pub _reserved1: [u8; 9],
    pub cntrltype: u8,      // Controller Type
    pub fguid: [u8; 16],    // FRU Globally Unique Identifier
    pub crdt1: u16,         // Command Retry Delay Time 1
    pub crdt2: u16,         // Command Retry Delay Time 2
    pub crdt3: u16,         // Command Retry Delay Time 3
    pub _reserved2: [u8; 122],

    // Admin Command Set Attributes & Optional Controller Capabilities (256-511)
    pub oacs: u16,          // Optional Admin Command Support
    pub acl: u8,            // Abort Command Limit
    pub aerl: u8,           // Asynchronous Event Request Limit
    pub frmw: u8,           // Firmware Updates
    pub lpa: u8,            // Log Page Attributes
    pub elpe: u8,           // Error Log Page Entries
    pub npss: u8,           // Number of Power States Support
    pub avscc: u8,          // Admin Vendor Specific Command Configuration
    pub apsta: u8,          // Autonomous Power State Transition Attributes
    pub wctemp: u16,        // Warning Composite Temperature Threshold
    pub cctemp: u16,        // Critical Composite Temperature Threshold
    pub mtfa: u16,          // Maximum Time for Firmware Activation
    pub hmpre: u32,         // Host Memory Buffer Preferred Size
    pub hmmin: u32,         // Host Memory Buffer Minimum Size
    pub tnvmcap: [u8; 16],  // Total NVM Capacity
    pub unvmcap: [u8; 16],  // Unallocated NVM Capacity
    pub rpmbs: u32,         // Replay Protected Memory Block Support
    pub edstt: u16,         // Extended Device Self-test Time
    pub dsto: u8,           // Device Self-test Options
    pub fwug: u8,           // Firmware Update Granularity
    pub kas: u16,           // Keep Alive Support
    pub hctma: u16,         // Host Controlled Thermal Management Attributes
    pub mntmt: u16,         // Minimum Thermal Management Temperature
    pub mxtmt: u16,         // Maximum Thermal Management Temperature
    pub sanicap: u32,       // Sanitize Capabilities
    pub hmminds: u32,       // Host Memory Buffer Minimum Descriptor Entry Size
    pub hmmaxd: u16,        // Host Memory Maximum Descriptors Entries
    pub nsetidmax: u16,     // NVM Set Identifier Maximum
    pub endgidmax: u16,     // Endurance Group Identifier Maximum
    pub anatt: u8,          // ANA Transition Time
    pub anacap: u8,         // Asymmetric Namespace Access Capabilities
    pub anagrpmax: u32,     // ANA Group Identifier Maximum
    pub nanagrpid: u32,     // Number of ANA Group Identifiers
    pub pels: u32,          // Persistent Event Log Size
    pub _reserved3: [u8; 156],

    // NVM Command Set Attributes (512-703)
    pub sqes: u8,           // Submission Queue Entry Size
    pub cqes: u8,           // Completion Queue Entry Size
    pub maxcmd: u16,        // Maximum Outstanding Commands
    pub nn: u32,            // Number of Namespaces
    pub oncs: u16,          // Optional NVM Command Support
    pub fuses: u16,         // Fused Operation Support
    pub fna: u8,            // Format NVM Attributes
    pub vwc: u8,            // Volatile Write Cache
    pub awun: u16,          // Atomic Write Unit Normal
    pub awupf: u16,         // Atomic Write Unit Power Fail
    pub nvscc: u8,          // NVM Vendor Specific Command Configuration
    pub nwpc: u8,           // Namespace Write Protection Capabilities
    pub acwu: u16,          // Atomic Compare & Write Unit
    pub _reserved4: [u8; 2],
    pub sgls: u32,          // SGL Support
    pub mnan: u32,          // Maximum Number of Allowed Namespaces
    pub _reserved5: [u8; 224],

    // I/O Command Set Independent Attributes (704-2047)
    pub subnqn: [u8; 256],  // NVM Subsystem NVMe Qualified Name
    pub _reserved6: [u8; 768],

    // NVMe over Fabrics Attributes (1792-2047)
    pub ioccsz: u32,        // I/O Queue Command Capsule Supported Size
    pub iorcsz: u32,        // I/O Queue Response Capsule Supported Size
    pub icdoff: u16,        // In Capsule Data Offset
    pub fcatt: u8,          // Fabrics Controller Attributes
    pub msdbd: u8,          // Maximum SGL Data Block Descriptors
    pub ofcs: u16,          // Optional Fabric Commands Support
    pub _reserved7: [u8; 242],

    // Power State Descriptors (2048-3071)
    pub psd: [u8; 1024],    // Power State Descriptors

    // Vendor Specific (3072-4095)
    pub vs: [u8; 1024],     // Vendor Specific
}

/// Space-padded ASCII field to a trimmed string slice.
fn ascii_field(raw: &[u8]) -> &str {
    core::str::from_utf8(raw)
        .unwrap_or("")
        .trim_end_matches('\0')
        .trim()
}

impl IdentifyController {
    pub fn model(&self) -> &str {
        ascii_field(&self.mn)
    }

    pub fn serial(&self) -> &str {
        ascii_field(&self.sn)
    }

    pub fn firmware(&self) -> &str {
        ascii_field(&self.fr)
    }
}

/// Namespace Identify Data Structure (4096 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IdentifyNamespace {
    pub nsze: u64,          // Namespace Size (logical blocks)
    pub ncap: u64,          // Namespace Capacity
    pub nuse: u64,          // Namespace Utilization
    pub nsfeat: u8,         // Namespace Features
    pub nlbaf: u8,          // Number of LBA Formats
    pub flbas: u8,          // Formatted LBA Size
    pub mc: u8,             // Metadata Capabilities
    pub dpc: u8,            // End-to-end Data Protection Capabilities
    pub dps: u8,            // End-to-end Data Protection Type Settings
    pub nmic: u8,           // Namespace Multi-path I/O and Namespace Sharing
    pub rescap: u8,         // Reservation Capabilities
    pub fpi: u8,            // Format Progress Indicator
    pub dlfeat: u8,         // Deallocate Logical Block Features
    pub nawun: u16,         // Namespace Atomic Write Unit Normal
    pub nawupf: u16,        // Namespace Atomic Write Unit Power Fail
    pub nacwu: u16,         // Namespace Atomic Compare & Write Unit
    pub nabsn: u16,         // Namespace Atomic Boundary Size Normal
    pub nabo: u16,          // Namespace Atomic Boundary Offset
    pub nabspf: u16,        // Namespace Atomic Boundary Size Power Fail
    pub noiob: u16,         // Namespace Optimal I/O Boundary
    pub nvmcap: [u8; 16],   // NVM Capacity
    pub npwg: u16,          // Namespace Preferred Write Granularity
    pub npwa: u16,          // Namespace Preferred Write Alignment
    pub npdg: u16,          // Namespace Preferred Deallocate Granularity
    pub npda: u16,          // Namespace Preferred Deallocate Alignment
    pub nows: u16,          // Namespace Optimal Write Size
    pub _reserved1: [u8; 18],
    pub anagrpid: u32,      // ANA Group Identifier
    pub _reserved2: [u8; 3],
    pub nsattr: u8,         // Namespace Attributes
    pub nvmsetid: u16,      // NVM Set Identifier
    pub endgid: u16,        // Endurance Group Identifier
    pub nguid: [u8; 16],    // Namespace Globally Unique Identifier
    pub eui64: [u8; 8],     // IEEE Extended Unique Identifier

    // LBA Format Support (128-191)
    pub lbaf: [LbaFormat; 16],

    // Reserved (192-383)
    pub _reserved3: [u8; 192],

    // Vendor Specific (384-4095)
    pub vs: [u8; 3712],
}

/// LBA Format Data Structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LbaFormat {
    pub ms: u16,            // Metadata Size
    pub lbads: u8,          // LBA Data Size (2^n bytes)
    pub rp: u8,             // Relative Performance
}

impl IdentifyNamespace {
    /// LBA size in bytes for the currently formatted LBA format.
    pub fn lba_size(&self) -> u32 {
        let format_index = (self.flbas & 0x0F) as usize;
        if format_index < self.lbaf.len() {
            1 << self.lbaf[format_index].lbads
        } else {
            512 // Default to 512 bytes
        }
    }

    /// Total namespace size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.nsze * self.lba_size() as u64
    }

    /// EUI-64 identifier, or `None` when the namespace does not report one.
    pub fn eui64(&self) -> Option<[u8; 8]> {
        if self.eui64 == [0; 8] {
            None
        } else {
            Some(self.eui64)
        }
    }
}
