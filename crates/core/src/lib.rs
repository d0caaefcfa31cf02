//! `shelfkeep-core`: shared domain primitives.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod id;

pub use id::{InvalidId, InventoryId, ItemId, LoanId, PhotoId, RepairLogId, UserId, WorkspaceId};
