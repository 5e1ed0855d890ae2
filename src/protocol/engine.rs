//! Response engine.
//!
//! Turns a single `respond` call into wire frames:
//!
//! - a provisional (1xx, not end-of-stream) response is one Response frame, written
//!   immediately;
//! - a final response with a buffered body is one Response frame carrying the body;
//! - a final response with a streamed body is a Response frame flagged
//!   [`FLAG_STREAMED`], one StreamChunk frame per pulled chunk (split to the
//!   configured chunk size) and a zero-length end marker.
//!
//! While streaming, the engine checks the inbound side for a StreamStop before and
//! after every pull. Each stream gets its own cancel signal, tripped by a delivered
//! StreamStop or by shutdown, which wakes a producer suspended inside a pull. A stop
//! ends the transfer without an end marker and is not an error; a chunk pulled after
//! the stop arrived is dropped.
use std::{
    io::Write,
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};

use crate::config::WorkerConfig;

use super::{
    WorkerError,
    frame::{FLAG_END_OF_STREAM, FLAG_STREAMED, Frame, RequestId},
    producer::{BodyProducer, Pull, StopSignal},
    response::{Body, Response},
    transport::{Inbound, Outbound},
};

/// State of the single in-flight request.
#[derive(Debug)]
pub struct Exchange {
    id: RequestId,
    provisional: usize,
    started: Instant,
}

impl Exchange {
    pub fn new(id: RequestId) -> Self {
        Self {
            id,
            provisional: 0,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Number of provisional responses sent so far.
    pub fn provisional(&self) -> usize {
        self.provisional
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// How a final response left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Buffered { bytes: usize },
    /// Producer ran dry; the end marker was sent.
    Streamed { chunks: usize, bytes: u64 },
    /// Stream hit `max_stream_bytes`; the end marker was sent.
    Truncated { chunks: usize, bytes: u64 },
    /// Peer (or shutdown) stopped the stream; no end marker.
    Stopped { chunks: usize, bytes: u64 },
}

pub struct ResponseEngine {
    max_chunk_size: usize,
    max_stream_bytes: Option<u64>,
}

impl ResponseEngine {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size.max(1),
            max_stream_bytes: config.max_stream_bytes,
        }
    }

    /// Writes a provisional response. The exchange stays open.
    pub fn provisional<W: Write>(
        &self,
        exchange: &mut Exchange,
        response: Response,
        out: &mut Outbound<W>,
    ) -> Result<(), WorkerError> {
        check_status(response.status)?;
        if !response.is_informational() {
            return Err(WorkerError::violation(format!(
                "status {} for {} must close the exchange",
                response.status, exchange.id
            )));
        }
        let Body::Bytes(body) = response.body else {
            return Err(WorkerError::violation(format!(
                "provisional response for {} cannot carry a streamed body",
                exchange.id
            )));
        };

        out.send(&Frame::response(
            exchange.id,
            response.status,
            response.headers,
            body,
            0,
        ))?;
        exchange.provisional += 1;
        debug!(
            "sent provisional {} for {} ({} so far)",
            response.status, exchange.id, exchange.provisional
        );
        Ok(())
    }

    /// Writes the final response, streaming the body if it has one.
    pub fn finish<W: Write>(
        &self,
        exchange: &Exchange,
        response: Response,
        out: &mut Outbound<W>,
        inbound: &mut Inbound,
        shutdown: &StopSignal,
    ) -> Result<Completion, WorkerError> {
        check_status(response.status)?;

        match response.body {
            Body::Bytes(body) => {
                let bytes = body.len();
                out.send(&Frame::response(
                    exchange.id,
                    response.status,
                    response.headers,
                    body,
                    FLAG_END_OF_STREAM,
                ))?;
                Ok(Completion::Buffered { bytes })
            }
            Body::Stream(mut producer) => {
                out.send(&Frame::response(
                    exchange.id,
                    response.status,
                    response.headers,
                    Vec::new(),
                    FLAG_STREAMED,
                ))?;
                self.stream(exchange.id, producer.as_mut(), out, inbound, shutdown)
            }
        }
    }

    fn stream<W: Write>(
        &self,
        id: RequestId,
        producer: &mut dyn BodyProducer,
        out: &mut Outbound<W>,
        inbound: &mut Inbound,
        shutdown: &StopSignal,
    ) -> Result<Completion, WorkerError> {
        let cancel = StopSignal::new();
        shutdown.link(&cancel);
        let watch = inbound.watch(id, cancel.clone());
        producer.observe(&cancel);

        let result = self.pump(id, producer, out, inbound, &cancel);
        drop(watch);
        cancel.stop();
        result
    }

    fn pump<W: Write>(
        &self,
        id: RequestId,
        producer: &mut dyn BodyProducer,
        out: &mut Outbound<W>,
        inbound: &mut Inbound,
        cancel: &StopSignal,
    ) -> Result<Completion, WorkerError> {
        let mut chunks = 0;
        let mut bytes = 0u64;

        loop {
            if stop_requested(id, inbound, cancel)? {
                debug!("stop received for {id} after {chunks} chunks");
                producer.stop();
                return Ok(Completion::Stopped { chunks, bytes });
            }

            let pulled = producer.next();
            // The producer may have been suspended when the stop arrived.
            if stop_requested(id, inbound, cancel)? {
                debug!("stop received for {id} during pull {}", chunks + 1);
                producer.stop();
                return Ok(Completion::Stopped { chunks, bytes });
            }

            let mut chunk = match pulled {
                Ok(Pull::Chunk(chunk)) => chunk,
                Ok(Pull::Exhausted) | Err(WorkerError::StreamStopped) => break,
                Err(e) => {
                    producer.stop();
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                trace!("skipping empty chunk for {id}");
                continue;
            }

            let mut truncated = false;
            if let Some(limit) = self.max_stream_bytes {
                let remaining = limit.saturating_sub(bytes);
                if chunk.len() as u64 > remaining {
                    truncated = true;
                    chunk.truncate(remaining as usize);
                }
            }

            for piece in chunk.chunks(self.max_chunk_size) {
                out.send(&Frame::chunk(id, piece.to_vec()))?;
                chunks += 1;
            }
            bytes += chunk.len() as u64;

            if truncated {
                warn!("stream for {id} reached the {bytes} byte limit; closing early");
                producer.stop();
                out.send(&Frame::end_marker(id))?;
                return Ok(Completion::Truncated { chunks, bytes });
            }
        }

        out.send(&Frame::end_marker(id))?;
        Ok(Completion::Streamed { chunks, bytes })
    }
}

/// Consumes a pending StreamStop for `id`, if any, and reports whether the stream
/// should end.
fn stop_requested(
    id: RequestId,
    inbound: &mut Inbound,
    cancel: &StopSignal,
) -> Result<bool, WorkerError> {
    let stopped = inbound.poll_stop(id)?;
    Ok(stopped || cancel.is_stopped())
}

fn check_status(status: u16) -> Result<(), WorkerError> {
    if !(100..600).contains(&status) {
        return Err(WorkerError::violation(format!(
            "unknown status code from worker: {status}"
        )));
    }
    Ok(())
}

pub(crate) fn log_completion(exchange: &Exchange, status: u16, completion: Completion) {
    info!(
        "{} responded {status} after {} provisional: {completion:?} in {:?}",
        exchange.id,
        exchange.provisional,
        exchange.elapsed()
    );
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc, thread};

    use super::*;
    use crate::protocol::{
        frame::{FrameCodec, FrameKind, Headers},
        producer::ChunkProducer,
        transport::InboundSender,
    };

    struct Harness {
        engine: ResponseEngine,
        out: Outbound<Vec<u8>>,
        inbound: Inbound,
        sender: InboundSender,
        shutdown: StopSignal,
    }

    impl Harness {
        fn new(config: WorkerConfig) -> Self {
            let (sender, inbound) = Inbound::channel();
            Self {
                engine: ResponseEngine::new(&config),
                out: Outbound::new(Vec::new(), config.codec()),
                inbound,
                sender,
                shutdown: StopSignal::new(),
            }
        }

        fn finish(&mut self, exchange: &Exchange, response: Response) -> Result<Completion, WorkerError> {
            self.engine.finish(
                exchange,
                response,
                &mut self.out,
                &mut self.inbound,
                &self.shutdown,
            )
        }

        fn frames(&self) -> Vec<Frame> {
            let codec = FrameCodec::default();
            let mut buf = self.out.get_ref().as_slice();
            let mut frames = Vec::new();
            while !buf.is_empty() {
                let (frame, consumed) = codec.decode(buf).unwrap();
                frames.push(frame);
                buf = &buf[consumed..];
            }
            frames
        }
    }

    fn chunks(items: &[&str]) -> ChunkProducer {
        ChunkProducer::from_chunks(
            items
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn buffered_final_is_one_frame() {
        let mut harness = Harness::new(WorkerConfig::default());
        let exchange = Exchange::new(RequestId(1));

        let completion = harness
            .finish(&exchange, Response::complete(200, Headers::new(), "hello"))
            .unwrap();

        assert_eq!(completion, Completion::Buffered { bytes: 5 });
        let frames = harness.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, 200);
        assert!(frames[0].is_end_of_stream());
        assert_eq!(frames[0].payload, b"hello");
    }

    #[test]
    fn empty_stream_still_sends_end_marker() {
        let mut harness = Harness::new(WorkerConfig::default());
        let exchange = Exchange::new(RequestId(1));

        let completion = harness
            .finish(&exchange, Response::streamed(200, Headers::new(), chunks(&[])))
            .unwrap();

        assert_eq!(completion, Completion::Streamed { chunks: 0, bytes: 0 });
        let frames = harness.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_streamed());
        assert!(frames[0].payload.is_empty());
        assert!(frames[1].is_end_marker());
    }

    #[test]
    fn large_chunks_are_split() {
        let config = WorkerConfig {
            max_chunk_size: 4,
            ..WorkerConfig::default()
        };
        let mut harness = Harness::new(config);
        let exchange = Exchange::new(RequestId(1));

        harness
            .finish(&exchange, Response::streamed(200, Headers::new(), chunks(&["abcdefghij"])))
            .unwrap();

        let payloads: Vec<_> = harness.frames()[1..]
            .iter()
            .map(|f| f.payload.clone())
            .collect();
        assert_eq!(
            payloads,
            vec![b"abcd".to_vec(), b"efgh".to_vec(), b"ij".to_vec(), Vec::new()]
        );
    }

    #[test]
    fn stream_limit_truncates_and_closes() {
        let config = WorkerConfig {
            max_stream_bytes: Some(5),
            ..WorkerConfig::default()
        };
        let mut harness = Harness::new(config);
        let exchange = Exchange::new(RequestId(1));
        let released = Rc::new(Cell::new(0));
        let count = Rc::clone(&released);
        let producer = chunks(&["abc", "def", "ghi"]).on_release(move || count.set(count.get() + 1));

        let completion = harness
            .finish(&exchange, Response::streamed(200, Headers::new(), producer))
            .unwrap();

        assert_eq!(completion, Completion::Truncated { chunks: 2, bytes: 5 });
        let frames = harness.frames();
        assert_eq!(frames[1].payload, b"abc");
        assert_eq!(frames[2].payload, b"de");
        assert!(frames[3].is_end_marker());
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn stream_ending_exactly_at_the_limit_is_complete() {
        let config = WorkerConfig {
            max_stream_bytes: Some(6),
            ..WorkerConfig::default()
        };
        let mut harness = Harness::new(config);
        let exchange = Exchange::new(RequestId(1));

        let completion = harness
            .finish(&exchange, Response::streamed(200, Headers::new(), chunks(&["abc", "def"])))
            .unwrap();

        assert_eq!(completion, Completion::Streamed { chunks: 2, bytes: 6 });
        assert!(harness.frames()[3].is_end_marker());
    }

    /// Sends one chunk, then blocks on the cancel signal and returns a second chunk
    /// whether or not it was woken.
    struct Stubborn {
        pulls: usize,
        cancel: StopSignal,
        woken: Rc<Cell<bool>>,
    }

    impl BodyProducer for Stubborn {
        fn next(&mut self) -> Result<Pull, WorkerError> {
            self.pulls += 1;
            if self.pulls > 1 {
                let woken = self.cancel.pause(Duration::from_secs(30)).is_err();
                self.woken.set(woken);
            }
            Ok(Pull::Chunk(format!("chunk {}", self.pulls).into_bytes()))
        }

        fn stop(&mut self) {}

        fn observe(&mut self, cancel: &StopSignal) {
            cancel.link(&self.cancel);
        }
    }

    #[test]
    fn stop_during_a_suspended_pull_drops_its_chunk() {
        let mut harness = Harness::new(WorkerConfig::default());
        let exchange = Exchange::new(RequestId(6));
        let woken = Rc::new(Cell::new(false));
        let producer = Stubborn {
            pulls: 0,
            cancel: StopSignal::new(),
            woken: Rc::clone(&woken),
        };

        let sender = harness.sender.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            sender.send(Ok(Frame::stream_stop(RequestId(6)))).unwrap();
        });

        let started = Instant::now();
        let completion = harness
            .finish(&exchange, Response::streamed(200, Headers::new(), producer))
            .unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(woken.get());
        assert_eq!(completion, Completion::Stopped { chunks: 1, bytes: 7 });
        let frames = harness.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload, b"chunk 1");
    }

    #[test]
    fn stop_before_first_pull() {
        let mut harness = Harness::new(WorkerConfig::default());
        let exchange = Exchange::new(RequestId(3));
        harness
            .sender
            .send(Ok(Frame::stream_stop(RequestId(3))))
            .unwrap();

        let completion = harness
            .finish(&exchange, Response::streamed(200, Headers::new(), chunks(&["a", "b"])))
            .unwrap();

        assert_eq!(completion, Completion::Stopped { chunks: 0, bytes: 0 });
        let frames = harness.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Response);
    }

    #[test]
    fn shutdown_stops_stream() {
        let mut harness = Harness::new(WorkerConfig::default());
        harness.shutdown.stop();
        let exchange = Exchange::new(RequestId(3));

        let completion = harness
            .finish(&exchange, Response::streamed(200, Headers::new(), chunks(&["a"])))
            .unwrap();

        assert!(matches!(completion, Completion::Stopped { .. }));
    }

    #[test]
    fn producer_fault_ends_without_marker() {
        let mut harness = Harness::new(WorkerConfig::default());
        let exchange = Exchange::new(RequestId(1));
        let producer = ChunkProducer::new(vec![
            Ok(b"first".to_vec()),
            Err(std::io::Error::other("read failed")),
        ]);

        let err = harness
            .finish(&exchange, Response::streamed(200, Headers::new(), producer))
            .unwrap_err();

        assert!(matches!(err, WorkerError::ProducerFault(_)));
        let frames = harness.frames();
        assert_eq!(frames.len(), 2);
        assert!(!frames.iter().any(Frame::is_end_marker));
    }

    #[test]
    fn provisional_rules() {
        let mut harness = Harness::new(WorkerConfig::default());
        let mut exchange = Exchange::new(RequestId(1));

        harness
            .engine
            .provisional(&mut exchange, Response::provisional(103, Headers::new()), &mut harness.out)
            .unwrap();
        assert_eq!(exchange.provisional(), 1);

        let not_informational = Response {
            end_of_stream: false,
            ..Response::complete(200, Headers::new(), "")
        };
        let streamed = Response {
            end_of_stream: false,
            ..Response::streamed(100, Headers::new(), chunks(&["a"]))
        };
        for response in [not_informational, streamed] {
            let err = harness
                .engine
                .provisional(&mut exchange, response, &mut harness.out)
                .unwrap_err();
            assert!(matches!(err, WorkerError::ProtocolViolation(_)));
        }
        assert_eq!(harness.frames().len(), 1);
    }

    #[test]
    #[should_panic(expected = "unknown status code from worker: 700")]
    fn rejects_unknown_status() {
        let mut harness = Harness::new(WorkerConfig::default());
        let exchange = Exchange::new(RequestId(1));

        harness
            .finish(&exchange, Response::complete(700, Headers::new(), ""))
            .unwrap();
    }
}
