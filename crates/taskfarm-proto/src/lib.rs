//! Wire types and converters for the Task Farm sync protocol.
//!
//! This crate contains:
//! - JSON message types exchanged between agents and the control center
//! - Converters between wire types and domain types

pub mod convert;
pub mod pb;

// Re-export commonly used types
pub use pb::{
    Assignment, AssignmentKind, DoneReport, ExtractedReport, SyncAction, SyncRequest,
    SyncResponse,
};
