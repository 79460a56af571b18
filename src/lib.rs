//! A file-backed durable queue and replayable disk cache for lazy
//! sequences of structured records.
//!
//! Four pieces compose into the storage conventions under a single base
//! directory: [`codec`] packs and unpacks self-delimiting records,
//! [`folder`] binds a directory to a small persisted string map,
//! [`queue`] is the append-only [`queue::Sink`]/[`queue::Source`] pair
//! built on content-addressed rotated files, and [`cache`] memoizes a
//! lazy producer's output to disk so later calls replay it instead of
//! recomputing it. [`project`] ties these into the `queue/<name>` and
//! `state/<name>` conventions a process actually uses.

pub mod cache;
pub mod codec;
pub mod error;
pub mod folder;
pub mod project;
pub mod queue;
pub mod value;

mod prelude;

pub use error::DqpError;
pub use project::Project;
pub use value::Value;
