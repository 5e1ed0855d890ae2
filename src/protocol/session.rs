use std::io::{self, Read, Write};

use log::{debug, error, info};

use crate::config::WorkerConfig;

use super::{
    Request, Response, WorkerError,
    engine::{Exchange, ResponseEngine, log_completion},
    frame::{Frame, FrameKind, RequestId},
    producer::StopSignal,
    transport::{Inbound, Outbound},
};

/// One worker's side of the duplex stream.
///
/// Requests are handled strictly one at a time: [`WorkerSession::wait_request`] opens
/// an exchange, any number of provisional responses may follow, and the final
/// response closes it. Only then can the next request be received.
pub struct WorkerSession<W: Write> {
    inbound: Inbound,
    outbound: Outbound<W>,
    engine: ResponseEngine,
    shutdown: StopSignal,
    current: Option<Exchange>,
    retired: Option<RequestId>,
    failed: Option<RequestId>,
}

impl WorkerSession<io::Stdout> {
    /// Session over the process' standard input and output.
    pub fn stdio(config: &WorkerConfig) -> Self {
        Self::new(io::stdin(), io::stdout(), config)
    }
}

impl<W: Write> WorkerSession<W> {
    pub fn new<R>(reader: R, writer: W, config: &WorkerConfig) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::with_inbound(Inbound::spawn(reader, config.codec()), writer, config)
    }

    pub fn with_inbound(inbound: Inbound, writer: W, config: &WorkerConfig) -> Self {
        Self {
            inbound,
            outbound: Outbound::new(writer, config.codec()),
            engine: ResponseEngine::new(config),
            shutdown: StopSignal::new(),
            current: None,
            retired: None,
            failed: None,
        }
    }

    /// Tripping this signal stops any stream in progress and makes the next
    /// [`WorkerSession::wait_request`] report end-of-stream.
    pub fn shutdown_signal(&self) -> StopSignal {
        self.shutdown.clone()
    }

    /// Blocks for the next request. `None` means the peer closed the stream cleanly.
    pub fn wait_request(&mut self) -> Result<Option<Request>, WorkerError> {
        if let Some(exchange) = &self.current {
            return Err(WorkerError::violation(format!(
                "{} was never given a final response",
                exchange.id()
            )));
        }

        loop {
            let Some(frame) = self.inbound.recv(&self.shutdown)? else {
                info!("peer closed the stream");
                return Ok(None);
            };

            match frame.kind {
                FrameKind::Request => {
                    let request = Request::try_from(frame)?;
                    debug!("received request {} {} {}", request.id, request.method, request.uri);
                    self.current = Some(Exchange::new(request.id));
                    return Ok(Some(request));
                }
                FrameKind::StreamStop => {
                    debug!("ignoring stop for {} outside of a stream", frame.id);
                }
                FrameKind::Error => {
                    return Err(WorkerError::violation(format!(
                        "peer reported an error: {}",
                        String::from_utf8_lossy(&frame.payload)
                    )));
                }
                kind => {
                    return Err(WorkerError::violation(format!(
                        "unexpected {kind:?} frame from peer for {}",
                        frame.id
                    )));
                }
            }
        }
    }

    /// Sends a response for the in-flight request `id`.
    pub fn respond(&mut self, id: RequestId, response: Response) -> Result<(), WorkerError> {
        let exchange = match self.current.as_mut() {
            Some(exchange) if exchange.id() == id => exchange,
            _ if self.retired == Some(id) => {
                return Err(WorkerError::violation(format!(
                    "{id} already received its final response"
                )));
            }
            _ => {
                return Err(WorkerError::violation(format!("unknown request id {id}")));
            }
        };

        if !response.end_of_stream {
            return self
                .engine
                .provisional(exchange, response, &mut self.outbound);
        }

        let status = response.status;
        let result = self.engine.finish(
            exchange,
            response,
            &mut self.outbound,
            &mut self.inbound,
            &self.shutdown,
        );

        if let Some(exchange) = self.current.take() {
            match &result {
                Ok(completion) => log_completion(&exchange, status, *completion),
                Err(_) => self.failed = Some(id),
            }
        }
        self.retired = Some(id);
        result.map(|_| ())
    }

    /// Writes an Error frame. This is the last thing a session does.
    ///
    /// The frame carries the id of the request being handled, or of the request whose
    /// final response failed part-way, so the peer can discard what it already got.
    pub fn report_error(mut self, message: &str) -> Result<(), WorkerError> {
        let id = self
            .current
            .take()
            .map(|exchange| exchange.id())
            .or(self.failed)
            .unwrap_or_default();
        error!("reporting error for {id}: {message}");
        self.outbound.send(&Frame::error(id, message))
    }

    /// Runs `handler` for every request until the peer closes the stream.
    ///
    /// The first fatal error is reported to the peer through an Error frame (unless the
    /// outbound stream itself failed) and returned.
    pub fn serve<F>(mut self, mut handler: F) -> Result<(), WorkerError>
    where
        F: FnMut(&mut Self, Request) -> Result<(), WorkerError>,
    {
        loop {
            let result = match self.wait_request() {
                Ok(Some(request)) => handler(&mut self, request),
                Ok(None) => return Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                if e.is_reportable() {
                    if let Err(report) = self.report_error(&e.to_string()) {
                        error!("failed to report error to peer: {report}");
                    }
                } else {
                    error!("outbound stream failed: {e}");
                }
                return Err(e);
            }
        }
    }

    pub fn into_writer(self) -> W {
        self.outbound.into_inner()
    }
}
