//! Core domain model types for stagepipe.
//!
//! This module contains the value types shared by every other module:
//! - Stage identity
//! - Run status of a stage driver
//! - Events and per-item failure records

mod event;
mod failure;
mod identity;
mod status;

pub use event::StageEvent;
pub use failure::ProcessingFailure;
pub use identity::{StageId, StageRef};
pub use status::StageStatus;
