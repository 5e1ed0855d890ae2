//! Worker/host communication protocol.
//!
//! This module implements the worker side of a framed request/response protocol spoken
//! with a host application server over a duplex byte stream (normally the worker's
//! standard input and output). The host forwards HTTP-like requests; the worker answers
//! each one with zero or more provisional (1xx) responses followed by exactly one final
//! response, whose body is either buffered or streamed chunk by chunk.
//!
//! # Overview
//!
//! Handling is strictly sequential. A [`WorkerSession`] receives one request, lets the
//! application respond to it, and only then receives the next one. A streamed body is
//! pulled lazily from a [`BodyProducer`]; between pulls the session checks whether the
//! host asked to stop the stream, in which case the producer is cancelled and cleaned
//! up and the exchange ends without an error.
//!
//! # Key Components
//!
//! - [`Frame`] / [`FrameCodec`]: the unit of transfer and its binary encoding.
//! - [`WorkerSession`]: owns the duplex stream, tracks the in-flight exchange.
//! - [`ResponseEngine`]: turns one `respond` call into one or more frames.
//! - [`ChunkProducer`]: the standard cancellable, lazily opened chunk source.
//!
//! # Frame Sequence
//!
//! A request answered with two early hints and a three-chunk body looks like this on
//! the worker's output:
//!
//! ```text
//! Response(103) Response(103) Response(200, STREAMED) Chunk Chunk Chunk Chunk(END)
//! ```
//!
//! If the host sends a StreamStop for the request part-way through, the chunks stop and
//! no end marker is written.
//!
//! # Errors
//!
//! Malformed frames and protocol violations are fatal. The top-level loop in
//! [`WorkerSession::serve`] reports the first fatal error through an Error frame and
//! returns it, after which the process is expected to exit.
mod engine;
mod error;
pub mod frame;
mod producer;
mod request;
mod response;
mod session;
mod transport;

pub use engine::{Completion, Exchange, ResponseEngine};
pub use error::WorkerError;
pub use frame::{Frame, FrameCodec, FrameKind, Headers, RequestId};
pub use producer::{BodyProducer, ChunkProducer, ChunkSource, Pull, StopSignal, read_chunks};
pub use request::{METHOD_HEADER, Request, URI_HEADER};
pub use response::{Body, Response};
pub use session::WorkerSession;
pub use transport::{Inbound, InboundClosed, InboundMessage, InboundSender, Outbound, StreamWatch};
