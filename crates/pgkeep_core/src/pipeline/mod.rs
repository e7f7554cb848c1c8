//! Streaming transfers through external filter programs.
//!
//! Archive and backup flows push bytes outbound:
//!
//! ```text
//! file / command / reader ──► compress ──► [encrypt] ──► storage
//! ```
//!
//! Restore and fetch flows pull them back:
//!
//! ```text
//! storage ──► [decrypt] ──► decompress ──► file / command / memory
//! ```
//!
//! Each [`FilterStage`] owns its process and stdio. [`Pipeline::execute`]
//! wires the stages together, joins them in a fixed order and decides the
//! outcome. Nothing is cancelled mid-stream; failures surface after every
//! process has been reaped.
//!
//! ## Invariants
//!
//! - Every stderr monitor is joined before any process is waited on
//!   ([`StageHandle::drain`] is the only way to reach [`DrainedStage::wait`])
//! - Any failed stage fails the transfer, except the terminal decompressor
//! - A failed transfer never publishes a storage object or a file

mod reader;
mod stage;
mod transfer;

pub use stage::{DrainedStage, FilterStage, StageHandle};
pub use transfer::{Pipeline, Sink, Source, TransferOutcome};
