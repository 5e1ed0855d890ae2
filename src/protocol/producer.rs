//! Streaming body producers.
//!
//! A streamed response body is pulled one chunk at a time through the [`BodyProducer`]
//! trait. Producers are finite and cannot be restarted: once a producer reports
//! [`Pull::Exhausted`], is stopped, or fails, it never yields again and its underlying
//! resource has been released.
//!
//! Cancellation is cooperative. A [`StopSignal`] can be tripped from any thread; the
//! producer notices it at its next suspension point (the start of a pull or while it
//! is pausing between chunks) and ends early as if it had run out of data.
use std::{
    fmt,
    io::{self, BufRead},
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, trace};

use super::WorkerError;

/// Result of pulling from a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    Chunk(Vec<u8>),
    Exhausted,
}

/// Pull-based source of body chunks.
pub trait BodyProducer {
    /// Pulls the next chunk. A [`WorkerError::StreamStopped`] returned from here is
    /// treated by the caller the same as [`Pull::Exhausted`].
    fn next(&mut self) -> Result<Pull, WorkerError>;

    /// Cancels the producer and releases its resources. Subsequent pulls report
    /// [`Pull::Exhausted`].
    fn stop(&mut self);

    /// Hands the producer the signal that cancels its stream, before the first pull.
    /// Producers that suspend inside [`BodyProducer::next`] should wake when it trips.
    fn observe(&mut self, _cancel: &StopSignal) {}
}

/// Shared cancellation flag.
///
/// Clones observe the same flag. [`StopSignal::pause`] sleeps until either the given
/// duration elapses or the signal is tripped, whichever happens first. Signals can be
/// chained with [`StopSignal::link`] so that stopping one stops the others.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<SignalState>, Condvar)>,
}

#[derive(Default)]
struct SignalState {
    stopped: bool,
    linked: Vec<StopSignal>,
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SignalState> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stop(&self) {
        let linked = {
            let mut state = self.state();
            if state.stopped {
                return;
            }
            state.stopped = true;
            self.inner.1.notify_all();
            mem::take(&mut state.linked)
        };

        for signal in linked {
            signal.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    /// Stops `other` whenever this signal stops, immediately if it already has.
    ///
    /// Links only run one way. `other` must not be linked back to this signal.
    pub fn link(&self, other: &StopSignal) {
        let mut state = self.state();
        if state.stopped {
            drop(state);
            other.stop();
            return;
        }
        state.linked.retain(|signal| !signal.is_stopped());
        state.linked.push(other.clone());
    }

    /// Suspends the caller for `duration`, waking early if the signal trips.
    pub fn pause(&self, duration: Duration) -> Result<(), WorkerError> {
        let deadline = Instant::now() + duration;
        let mut state = self.state();

        while !state.stopped {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .inner
                .1
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Err(WorkerError::StreamStopped)
    }
}

pub type ChunkSource = Box<dyn Iterator<Item = io::Result<Vec<u8>>>>;
type Opener = Box<dyn FnOnce() -> io::Result<ChunkSource>>;

enum State {
    Pending(Opener),
    Open(ChunkSource),
    Released,
}

/// The standard [`BodyProducer`], backed by a fallible chunk iterator.
///
/// The source can be supplied up front or opened lazily on the first pull. Pulls can
/// be spaced out with [`ChunkProducer::with_delay`] and capped with
/// [`ChunkProducer::with_limit`]. The source is dropped and the release hook runs
/// exactly once, on whichever path ends the stream.
pub struct ChunkProducer {
    state: State,
    signal: StopSignal,
    delay: Option<Duration>,
    limit: Option<usize>,
    yielded: usize,
    released: bool,
    on_release: Option<Box<dyn FnOnce()>>,
}

impl ChunkProducer {
    pub fn new<I>(source: I) -> Self
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
        I::IntoIter: 'static,
    {
        Self::with_state(State::Open(Box::new(source.into_iter())))
    }

    /// Infallible chunks, mostly useful for fixed data and tests.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: 'static,
    {
        Self::new(chunks.into_iter().map(Ok))
    }

    /// Defers opening the source until the first pull.
    pub fn lazy<F>(open: F) -> Self
    where
        F: FnOnce() -> io::Result<ChunkSource> + 'static,
    {
        Self::with_state(State::Pending(Box::new(open)))
    }

    fn with_state(state: State) -> Self {
        Self {
            state,
            signal: StopSignal::new(),
            delay: None,
            limit: None,
            yielded: 0,
            released: false,
            on_release: None,
        }
    }

    /// Waits `delay` before producing each chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Produces at most `limit` chunks.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn on_release<F: FnOnce() + 'static>(mut self, hook: F) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Handle for stopping this producer from another thread.
    pub fn signal(&self) -> StopSignal {
        self.signal.clone()
    }

    pub fn yielded(&self) -> usize {
        self.yielded
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.state = State::Released;
        debug!("chunk producer released after {} chunks", self.yielded);

        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }

    fn pull(&mut self) -> Result<Pull, WorkerError> {
        if self.signal.is_stopped() {
            return Err(WorkerError::StreamStopped);
        }
        if self.limit.is_some_and(|limit| self.yielded >= limit) {
            return Ok(Pull::Exhausted);
        }
        if let Some(delay) = self.delay {
            self.signal.pause(delay)?;
        }

        if let State::Pending(_) = self.state {
            let State::Pending(open) = mem::replace(&mut self.state, State::Released) else {
                unreachable!("state checked above");
            };
            trace!("opening chunk source");
            let source = open().map_err(|e| WorkerError::ProducerFault(e.to_string()))?;
            self.state = State::Open(source);
        }

        let State::Open(source) = &mut self.state else {
            return Ok(Pull::Exhausted);
        };
        match source.next() {
            Some(Ok(chunk)) => {
                self.yielded += 1;
                Ok(Pull::Chunk(chunk))
            }
            Some(Err(e)) => Err(WorkerError::ProducerFault(e.to_string())),
            None => Ok(Pull::Exhausted),
        }
    }
}

impl BodyProducer for ChunkProducer {
    fn next(&mut self) -> Result<Pull, WorkerError> {
        if self.released {
            return Ok(Pull::Exhausted);
        }

        match self.pull() {
            Ok(Pull::Chunk(chunk)) => Ok(Pull::Chunk(chunk)),
            Ok(Pull::Exhausted) => {
                self.release();
                Ok(Pull::Exhausted)
            }
            Err(WorkerError::StreamStopped) => {
                debug!("chunk producer stopped while waiting");
                self.release();
                Ok(Pull::Exhausted)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.signal.stop();
        self.release();
    }

    fn observe(&mut self, cancel: &StopSignal) {
        cancel.link(&self.signal);
    }
}

impl Drop for ChunkProducer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Splits a reader into chunks: one per line (newline kept) or, with a separator, the
/// pieces of each line split on that byte (separator dropped).
pub fn read_chunks<R>(reader: R, separator: Option<u8>) -> ChunkSource
where
    R: BufRead + 'static,
{
    let lines = LineReader { reader };
    match separator {
        None => Box::new(lines),
        Some(sep) => Box::new(lines.flat_map(move |line| match line {
            Ok(line) => line
                .split(|b| *b == sep)
                .map(|piece| Ok(piece.to_vec()))
                .collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })),
    }
}

struct LineReader<R> {
    reader: R,
}

impl<R: BufRead> Iterator for LineReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(_) => Some(Ok(line)),
            Err(e) => Some(Err(e)),
        }
    }
}
