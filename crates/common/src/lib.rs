//! Shared building blocks for the fleetsync system: the content-addressed
//! filesystem snapshot model, the drift comparator, update generation,
//! trigger rules, rate-limited I/O and the SRPC transport.

pub mod filter;
pub mod fs;
pub mod rateio;
pub mod srpc;
pub mod triggers;
pub mod update;

pub use fs::{Directory, FileSystem, Hash, Inode, InodeId, InodeTable, RegularInode};
