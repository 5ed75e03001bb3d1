//! cachemeta Event Stream
//!
//! Append-only log of serialized write requests. The master appends every
//! accepted write; a newly promoted master replays the entries written after
//! the latest checkpoint.
//!
//! ```text
//! events/
//! ├── events-00000000000000000001.log   (entries 1..=k, compacted once a
//! │                                      checkpoint covers them)
//! └── events-0000000000000000000k+1.log (current segment)
//! ```

pub mod error;
pub mod journal;
pub mod stream;

pub use error::{EventStreamError, EventStreamResult};
pub use journal::EventEntry;
pub use stream::{EventSink, EventStream, FileEventStream};
