use std::fmt;

use super::{
    frame::Headers,
    producer::BodyProducer,
};

/// Body of a [`Response`].
pub enum Body {
    Bytes(Vec<u8>),
    Stream(Box<dyn BodyProducer>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Bytes(Vec::new())
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Bytes(value.as_bytes().to_vec())
    }
}

/// One `respond` call: status, headers, body and whether it closes the exchange.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
    pub end_of_stream: bool,
}

impl Response {
    /// Interim 1xx response that leaves the exchange open.
    pub fn provisional(status: u16, headers: Headers) -> Self {
        Self {
            status,
            headers,
            body: Body::default(),
            end_of_stream: false,
        }
    }

    /// Final response with a buffered body.
    pub fn complete(status: u16, headers: Headers, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            end_of_stream: true,
        }
    }

    /// Final response whose body is pulled from `producer`.
    pub fn streamed<P: BodyProducer + 'static>(status: u16, headers: Headers, producer: P) -> Self {
        Self {
            status,
            headers,
            body: Body::Stream(Box::new(producer)),
            end_of_stream: true,
        }
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }
}
