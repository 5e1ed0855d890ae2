//! Application handlers served by the `duplex_worker` binary.
//!
//! Both handlers stream the contents of a source file as the final response body. The
//! file is opened lazily, on the first pull, and closed as soon as the stream ends for
//! any reason.
//!
//! - [`early_hints`]: sends the four informational statuses 100–103 (the 103 carrying a
//!   `Link` preload hint) before the final 200.
//! - [`stream_body`]: sends the final 200 straight away.
use std::{fs::File, io::BufReader, io::Write, path::PathBuf, time::Duration};

use log::debug;

use crate::protocol::{
    ChunkProducer, Headers, Request, Response, WorkerError, WorkerSession, read_chunks,
};

/// Preload hint sent with the 103 response.
pub const EARLY_HINT_LINK: &str = "</style111.css>; rel=preload; as=style";

/// File-backed body for a handler's final response.
#[derive(Debug, Clone, Default)]
pub struct BodySource {
    pub path: PathBuf,
    /// Split each line on this byte instead of sending whole lines.
    pub separator: Option<u8>,
    /// Pause before producing each chunk.
    pub delay: Option<Duration>,
    /// Maximum number of chunks to produce.
    pub limit: Option<usize>,
}

impl BodySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn producer(&self) -> ChunkProducer {
        let path = self.path.clone();
        let separator = self.separator;
        let mut producer = ChunkProducer::lazy(move || {
            debug!("opening body source {path:?}");
            let f = File::open(&path)?;
            Ok(read_chunks(BufReader::new(f), separator))
        });

        if let Some(delay) = self.delay {
            producer = producer.with_delay(delay);
        }
        if let Some(limit) = self.limit {
            producer = producer.with_limit(limit);
        }
        producer
    }
}

fn header(name: &str, value: &str) -> Headers {
    [(name, value)].into_iter().collect()
}

pub fn early_hints<W: Write>(
    session: &mut WorkerSession<W>,
    request: Request,
    source: &BodySource,
) -> Result<(), WorkerError> {
    for status in [100u16, 101, 102] {
        let name = format!("X-{status}");
        session.respond(
            request.id,
            Response::provisional(status, header(&name, &status.to_string())),
        )?;
    }

    let mut hints = header("X-103", "103");
    hints.append("Link", EARLY_HINT_LINK);
    session.respond(request.id, Response::provisional(103, hints))?;

    session.respond(
        request.id,
        Response::streamed(200, header("X-200", "200"), source.producer()),
    )
}

pub fn stream_body<W: Write>(
    session: &mut WorkerSession<W>,
    request: Request,
    source: &BodySource,
) -> Result<(), WorkerError> {
    session.respond(
        request.id,
        Response::streamed(200, Headers::new(), source.producer()),
    )
}
