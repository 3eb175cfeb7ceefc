//! Point-to-point file transfer over a raw byte stream (serial line, socket, pipe).
//! The host owns the link: it hands the engine a writer, drives a `Pump` over the reader
//! and issues requests from any other thread.

pub mod chunk;
pub mod config;
pub mod core;
pub mod integrity;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod wire;

pub use crate::core::{Progress, Pump, RequestError, SendError, XferCore};
pub use chunk::{InboundFile, PlanError, Segment, SegmentPlan};
pub use config::{Config, ConfigError};
pub use parser::{Fault, ParseState, Parser};
pub use protocol::{FileList, Message, MessageId, NackCode};
pub use session::SessionState;
pub use storage::{MemoryStorage, Storage};
pub use wire::{FrameBuffer, FrameEncodeError};
