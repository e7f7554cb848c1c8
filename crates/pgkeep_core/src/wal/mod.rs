//! Archived write-ahead log files.
//!
//! The `wal` storage category holds three kinds of files, all sharing one
//! naming grammar:
//!
//! ```text
//! <timeline:8><counter:16><ext>                   regular segment
//! <timeline:8><counter:16>.<offset:8>.backup<ext> backup label
//! <timeline:8>.history<ext>                       timeline history
//! ```
//!
//! ## Ordering
//!
//! Files are ordered by plain string comparison of their names. Within one
//! timeline this equals creation order because both components are fixed
//! width hex; across timelines the higher timeline sorts later.
//!
//! ## Invariants
//!
//! - Segment and label names are exactly 24 alphanumeric characters
//! - A sane regular segment is at most 16 MiB
//! - History files are never removed by retention

mod archive;
mod segment;

pub use archive::Archive;
pub use segment::{Wal, WalType, MAX_SEGMENT_SIZE, SEGMENT_NAME_LEN, TIMELINE_LEN};
