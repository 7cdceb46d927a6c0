//! bidsforge-engine library interface
//!
//! Rule engine that turns a flat list of converted scanner acquisitions into a
//! BIDS dataset: ordering, sectioning, entity resolution, run numbering,
//! dependent linkage, QA, events decoding and layout emission.

pub mod emitter;
pub mod entities;
pub mod error;
pub mod events;
pub mod ingest;
pub mod linkage;
pub mod model;
pub mod organizer;
pub mod pipeline;
pub mod qa;
pub mod resolver;
pub mod supervisor;

pub use crate::error::{EngineError, EngineResult};
pub use crate::model::{Acquisition, Document, Series};
pub use crate::pipeline::analyze;
