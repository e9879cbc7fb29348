//! Status enums shared by the merkletree engine and its consumers.
#![forbid(unsafe_code)]
pub mod scan_status;
pub mod sync_phase;
pub mod tree_validity;
