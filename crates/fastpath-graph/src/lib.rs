//! Fastpath Graph - element graph scheduler
//!
//! Packets move through a DAG of elements in batches. The scheduler is
//! single-threaded per compute context and never blocks: offloadable
//! elements aggregate batches into tasks, hand them to a coprocessor, and
//! the graph resumes each task once its completions show up in the
//! device's poll ring.
//!
//! ## Offload lifecycle
//!
//! Each absorbed batch gets a slot id; per `(element, slot)` the graph
//! tracks PREPROC, POSTPROC and POSTPROC_FIN flags. A batch is
//! preprocessed at most once, postprocessed only after preprocessing and
//! its completion, and the task's batches leave the element only after
//! every slot is postprocessed.

#![warn(clippy::all)]

pub mod batch;
pub mod driver;
pub mod element;
pub mod error;
pub mod graph;
pub mod offload_state;
pub mod packet;
pub mod task;

pub use batch::PacketBatch;
pub use driver::{ComputeContext, DriverStats};
pub use element::{
    Dispatch, Element, ElementId, ElementKind, OffloadableElement, SchedulableElement, SlotId, Verdict,
    MAX_COPROCESSOR_TYPES, MAX_OUTPUTS,
};
pub use error::{GraphError, GraphResult};
pub use graph::{ElementGraph, GraphStats};
pub use offload_state::OffloadState;
pub use packet::{anno, AnnoSet, Packet, PacketOut, NUM_ANNOTATIONS};
pub use task::{OffloadTask, TaskPhase};
