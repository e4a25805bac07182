//! IPC bridge between the supervisor and the two workers.
//!
//! # Architecture
//!
//! - **protocol**: Message shapes (IntegerVector, CommandDescriptor, AggregateResult)
//! - **codec**: Binary framing codecs plus blocking send/receive over a channel end
//! - **transport**: Named-pipe and anonymous-pipe channels, byte-exact I/O

pub mod codec;
pub mod protocol;
pub mod transport;
