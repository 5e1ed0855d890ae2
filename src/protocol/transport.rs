use std::{
    collections::VecDeque,
    io::{Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{self, RecvTimeoutError, TryRecvError},
    },
    thread,
    time::Duration,
};

use log::{debug, trace, warn};
use thiserror::Error;

use super::{
    WorkerError,
    frame::{CodecError, Frame, FrameCodec, FrameKind, RequestId},
    producer::StopSignal,
};

/// How often a blocked receive re-checks the shutdown signal.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub type InboundMessage = Result<Frame, CodecError>;

#[derive(Debug, Error)]
#[error("inbound receiver is gone")]
pub struct InboundClosed;

/// The stream currently being sent, and the signal that cancels it.
#[derive(Clone, Default)]
struct StopWatch(Arc<Mutex<Option<(RequestId, StopSignal)>>>);

impl StopWatch {
    fn set(&self, watched: Option<(RequestId, StopSignal)>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = watched;
    }

    fn notice(&self, frame: &Frame) {
        if frame.kind != FrameKind::StreamStop {
            return;
        }
        let watched = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, signal)) = watched.as_ref().filter(|(id, _)| *id == frame.id) {
            debug!("stop for {} arrived mid-stream", frame.id);
            signal.stop();
        }
    }
}

/// Clears the watched stream when dropped.
pub struct StreamWatch(StopWatch);

impl Drop for StreamWatch {
    fn drop(&mut self) {
        self.0.set(None);
    }
}

struct SenderInner {
    sender: mpsc::Sender<Option<InboundMessage>>,
    watch: StopWatch,
}

impl Drop for SenderInner {
    fn drop(&mut self) {
        // A sender unwound by a panic leaves the channel disconnected without a close.
        if !thread::panicking() {
            let _ = self.sender.send(None);
        }
    }
}

/// Feeds frames into an [`Inbound`].
///
/// A StreamStop for the stream being sent trips that stream's cancel signal as soon as
/// it is delivered, so a producer suspended mid-pull wakes up. Dropping the last clone
/// closes the stream cleanly.
#[derive(Clone)]
pub struct InboundSender {
    inner: Arc<SenderInner>,
}

impl InboundSender {
    pub fn send(&self, message: InboundMessage) -> Result<(), InboundClosed> {
        if let Ok(frame) = &message {
            self.inner.watch.notice(frame);
        }
        self.inner
            .sender
            .send(Some(message))
            .map_err(|_| InboundClosed)
    }
}

/// Receiving half of the duplex stream.
///
/// A background thread owns the input stream, decodes frames and forwards them over a
/// channel, followed by an explicit close once the input ends. A channel that
/// disconnects without that close means the reader died and is reported as an error.
/// Frames that arrive while a stream is in flight and are not meant for it are parked
/// and handed out, in order, by later receives.
pub struct Inbound {
    receiver: mpsc::Receiver<Option<InboundMessage>>,
    watch: StopWatch,
    pending: VecDeque<Frame>,
    closed: bool,
}

impl Inbound {
    /// Spawns the reader thread over `reader`.
    pub fn spawn<R>(mut reader: R, codec: FrameCodec) -> Self
    where
        R: Read + Send + 'static,
    {
        let (sender, inbound) = Self::channel();
        thread::spawn(move || {
            loop {
                match codec.read_frame(&mut reader) {
                    Ok(Some(frame)) => {
                        trace!("read {:?} frame for {}", frame.kind, frame.id);
                        if sender.send(Ok(frame)).is_err() {
                            debug!("inbound receiver dropped; reader exiting");
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("inbound stream closed");
                        return;
                    }
                    Err(e) => {
                        warn!("inbound stream failed: {e}");
                        let _ = sender.send(Err(e));
                        return;
                    }
                }
            }
        });

        inbound
    }

    /// In-process feed, for hosts living in the same process.
    pub fn channel() -> (InboundSender, Self) {
        let (sender, receiver) = mpsc::channel();
        let watch = StopWatch::default();
        let inbound = Self {
            receiver,
            watch: watch.clone(),
            pending: VecDeque::new(),
            closed: false,
        };
        let sender = InboundSender {
            inner: Arc::new(SenderInner { sender, watch }),
        };
        (sender, inbound)
    }

    /// Trips `cancel` when a StreamStop for `id` is delivered, until the returned
    /// guard is dropped.
    pub fn watch(&self, id: RequestId, cancel: StopSignal) -> StreamWatch {
        self.watch.set(Some((id, cancel)));
        StreamWatch(self.watch.clone())
    }

    fn accept(&mut self, message: Option<InboundMessage>) -> Result<Option<Frame>, WorkerError> {
        match message {
            Some(message) => message.map(Some).map_err(WorkerError::from),
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    fn reader_died(&mut self) -> WorkerError {
        self.closed = true;
        CodecError::Malformed("inbound reader stopped before the stream was closed".into()).into()
    }

    /// Blocks for the next frame. Returns `None` once the peer has closed the stream
    /// or `shutdown` has been tripped.
    pub fn recv(&mut self, shutdown: &StopSignal) -> Result<Option<Frame>, WorkerError> {
        loop {
            if shutdown.is_stopped() {
                debug!("shutdown requested while waiting for a frame");
                return Ok(None);
            }
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if self.closed {
                return Ok(None);
            }

            match self.receiver.recv_timeout(SHUTDOWN_POLL) {
                Ok(message) => {
                    if let Some(frame) = self.accept(message)? {
                        return Ok(Some(frame));
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(self.reader_died()),
            }
        }
    }

    /// Drains whatever has already arrived, looking for a StreamStop addressed to `id`.
    /// Other frames are parked for later receives.
    pub fn poll_stop(&mut self, id: RequestId) -> Result<bool, WorkerError> {
        while !self.closed {
            let message = match self.receiver.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(self.reader_died()),
            };
            match self.accept(message)? {
                Some(frame) if frame.kind == FrameKind::StreamStop && frame.id == id => {
                    return Ok(true);
                }
                Some(frame) => {
                    trace!("parking {:?} frame for {} until the stream ends", frame.kind, frame.id);
                    self.pending.push_back(frame);
                }
                None => {}
            }
        }
        Ok(false)
    }
}

/// Sending half of the duplex stream. Every frame is flushed as soon as it is written.
pub struct Outbound<W: Write> {
    writer: W,
    codec: FrameCodec,
}

impl<W: Write> Outbound<W> {
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self { writer, codec }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    pub fn send(&mut self, frame: &Frame) -> Result<(), WorkerError> {
        trace!(
            "sending {:?} frame for {} ({} bytes)",
            frame.kind,
            frame.id,
            frame.payload.len()
        );
        self.codec
            .write_frame(&mut self.writer, frame)
            .map_err(|e| match e {
                CodecError::Io(e) => WorkerError::Io(e),
                e => WorkerError::MalformedFrame(e),
            })?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
