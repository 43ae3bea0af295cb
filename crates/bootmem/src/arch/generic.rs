//! Page geometry for targets without a dedicated module.

/// Smallest page the platform maps, in bytes.
pub const PAGE_SIZE: u64 = 0x1000;
