use super::{
    WorkerError,
    frame::{Frame, FrameKind, Headers, RequestId},
};

/// Pseudo-header carrying the request method.
pub const METHOD_HEADER: &str = ":method";
/// Pseudo-header carrying the request target.
pub const URI_HEADER: &str = ":uri";

/// A request forwarded by the host.
///
/// Method and target are opaque to the worker; they travel as pseudo-headers on the
/// Request frame and are lifted out of the header map on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id,
            method: method.into(),
            uri: uri.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

fn take_pseudo(headers: &mut Headers, name: &str) -> String {
    headers
        .remove(name)
        .and_then(|values| values.into_iter().next())
        .unwrap_or_default()
}

impl TryFrom<Frame> for Request {
    type Error = WorkerError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        if frame.kind != FrameKind::Request {
            return Err(WorkerError::violation(format!(
                "expected a request frame, got {:?} for {}",
                frame.kind, frame.id
            )));
        }

        let mut headers = frame.headers;
        let method = take_pseudo(&mut headers, METHOD_HEADER);
        let uri = take_pseudo(&mut headers, URI_HEADER);
        let body = (!frame.payload.is_empty()).then_some(frame.payload);

        Ok(Request {
            id: frame.id,
            method,
            uri,
            headers,
            body,
        })
    }
}

impl From<Request> for Frame {
    fn from(value: Request) -> Self {
        let mut headers = value.headers;
        headers.insert(METHOD_HEADER, vec![value.method]);
        headers.insert(URI_HEADER, vec![value.uri]);
        Frame::request(value.id, headers, value.body.unwrap_or_default())
    }
}
