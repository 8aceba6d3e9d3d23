#![deny(missing_docs)]
//! External-memory, vertex-centric graph processing engine.
//!
//! Executes user vertex programs over graphs larger than RAM by streaming
//! page-aligned adjacency records through an asynchronous block-I/O layer.
//! Activation frontiers advance level by level across parallel workers,
//! with inter-worker message passing, per-worker I/O reordering for page
//! cache locality and work stealing against frontier imbalance.
//!
//! The I/O layer itself is an external collaborator: the engine consumes
//! the [`IoBackend`]/[`IoFactory`] contract and never touches a device.

mod bitmap;
mod compute;
mod config;
mod engine;
mod error;
mod format;
mod frontier;
mod index;
mod io;
mod io_sched;
mod log;
mod message;
mod partition;
/// test fixtures: RAM-backed I/O, graph builders and reference programs
pub mod test_utils;
mod types;
mod vertex;
mod worker;

pub use bitmap::AtomicBitmap;
pub use compute::ComputeKey;
pub use config::GraphConfig;
pub use engine::{EngineContext, GraphEngine, VertexProgram};
pub use error::EngineError;
pub use format::{
    encode_directed, encode_ts, encode_undirected, DirectedDecoder, GraphHeader, GraphType,
    TsDecoder, TsIndex, UndirectedDecoder, VertexDecoder, FORMAT_VERSION, GRAPH_MAGIC,
    INDEX_MAGIC,
};
pub use frontier::{FrontierQueue, VertexScheduler};
pub use index::VertexIndex;
pub use io::{read_sync, IoBackend, IoCompletion, IoFactory, IoRequest, IoStats};
pub use io_sched::ThroughputScheduler;
pub use message::{
    ActivationSender, MessageBatch, MessageIter, MessageRef, MsgQueue, MulticastRef,
    MulticastSender, SimpleSender,
};
pub use partition::VertexPartitioner;
pub use types::{
    round_page, roundup_page, Level, Timestamp, VertexId, WorkerId, PAGE_SIZE,
};
pub use vertex::{
    EdgeDir, NeighborRequest, NeighborType, PageVertex, TimestampRange, Vertex, VertexArena,
};
