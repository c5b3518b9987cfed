//! # PolySync Types
//!
//! Data types shared by the archive and the engine.
//!
//! This crate provides:
//! - Changes as reported by members (`Change`, `ChangeType`)
//! - Mapping identity (`Mapping`, `MappingEntry`)
//! - Sync group description (`Group`, `Member`, `ObjTypeSetting`)
//! - The format collaborator interface (`FormatEnv`) and `PlainFormat`
//!
//! ## Identity
//!
//! Members are identified by a stable `MemberId`. A mapping ties one uid per
//! member together as "the same logical item"; its id is assigned by the
//! archive on first save, so `0` means "not persisted yet".

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod format;
mod group;
mod mapping;

pub use change::{Change, ChangeType};
pub use error::{FormatError, FormatResult, GroupError, GroupResult};
pub use format::{CompareResult, ConvertTarget, Elevated, FormatEnv, PlainFormat};
pub use group::{Group, Member, ObjTypeSetting, GROUP_FILE};
pub use mapping::{Mapping, MappingEntry, MappingId, MemberId};
