// HTTP request and response types exchanged with the transport

use crate::content_negotiation::{MediaType, accept_refuses_all, parse_accept};
use crate::{Error, Result};
use bytes::{Buf, Bytes};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;

/// HTTP methods
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HttpMethod {
    GET,
    HEAD,
    POST,
    PUT,
    PATCH,
    DELETE,
    OPTIONS,
    TRACE,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 8] = [
        HttpMethod::GET,
        HttpMethod::HEAD,
        HttpMethod::POST,
        HttpMethod::PUT,
        HttpMethod::PATCH,
        HttpMethod::DELETE,
        HttpMethod::OPTIONS,
        HttpMethod::TRACE,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::TRACE => "TRACE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An aggregated inbound request.
///
/// The transport frames the whole message before the pipeline sees it, so the
/// body is always fully available.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Raw, undecoded path without the query string.
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    query_params: OnceCell<HashMap<String, Vec<String>>>,
}

impl HttpRequest {
    /// Builds a request from a method and a request target such as
    /// `/users/7?verbose=true`.
    pub fn new(method: HttpMethod, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        Self {
            method,
            path: if path.is_empty() { "/".into() } else { path.into() },
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            query_params: OnceCell::new(),
        }
    }

    /// Appends a header value. Invalid names or values are rejected.
    pub fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::BadRequest(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::BadRequest(format!("invalid value for header {name}: {e}")))?;
        self.headers.append(name, value);
        Ok(())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.append_header(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header, in arrival order.
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Decoded query parameters; repeated keys keep every value in order.
    pub fn query_params(&self) -> &HashMap<String, Vec<String>> {
        self.query_params.get_or_init(|| {
            let pairs: Vec<(String, String)> = self
                .query
                .as_deref()
                .and_then(|q| serde_urlencoded::from_str(q).ok())
                .unwrap_or_default();
            let mut params: HashMap<String, Vec<String>> = HashMap::new();
            for (key, value) in pairs {
                params.entry(key).or_default().push(value);
            }
            params
        })
    }

    pub fn query_values(&self, name: &str) -> &[String] {
        self.query_params()
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Cookie values with the given name across every `Cookie` header.
    pub fn cookie_values(&self, name: &str) -> Vec<String> {
        self.header_values(header::COOKIE.as_str())
            .into_iter()
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .filter(|(key, _)| *key == name)
            .map(|(_, value)| value.trim_matches('"').to_string())
            .collect()
    }

    pub fn content_type(&self) -> Option<MediaType> {
        self.header(header::CONTENT_TYPE.as_str())
            .and_then(MediaType::parse)
    }

    /// The caller's accepted media types in preference order.
    pub fn accept(&self) -> Vec<MediaType> {
        parse_accept(self.header_values(header::ACCEPT.as_str()))
    }

    /// Whether the `Accept` header refuses every type with `q=0`.
    pub fn accepts_nothing(&self) -> bool {
        accept_refuses_all(self.header_values(header::ACCEPT.as_str()))
    }

    /// Blocking-style view of the body.
    pub fn body_reader(&self) -> impl io::Read + use<> {
        self.body.clone().reader()
    }

    /// Parse the request body as JSON
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Default)]
enum Body {
    #[default]
    Unwritten,
    Sent(Bytes),
    Streaming(Vec<u8>),
}

/// Outbound response sink.
///
/// Exactly one write mode is allowed per request: either a single
/// [`send_bytes`](Self::send_bytes) or incremental writes through
/// [`output_stream`](Self::output_stream).
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    body: Body,
    aborted: bool,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::ok()
    }
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Unwritten,
            aborted: false,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Sets a header from strings, rejecting invalid names or values.
    pub fn insert_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::ResponseWrite(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::ResponseWrite(format!("invalid value for header {name}: {e}")))?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn set_content_type(&mut self, media_type: &MediaType) -> Result<()> {
        self.insert_header(header::CONTENT_TYPE.as_str(), &media_type.to_string())
    }

    pub fn content_type(&self) -> Option<MediaType> {
        self.header(header::CONTENT_TYPE.as_str())
            .and_then(MediaType::parse)
    }

    /// One-shot write of the complete body.
    pub fn send_bytes(&mut self, body: impl Into<Bytes>) -> Result<()> {
        match self.body {
            Body::Unwritten => {
                self.body = Body::Sent(body.into());
                Ok(())
            }
            Body::Sent(_) => Err(Error::ResponseWrite("response body already sent".into())),
            Body::Streaming(_) => Err(Error::ResponseWrite(
                "cannot send bytes after opening the output stream".into(),
            )),
        }
    }

    /// Opens, or reopens, the incremental output stream.
    pub fn output_stream(&mut self) -> Result<OutputStream<'_>> {
        if matches!(self.body, Body::Unwritten) {
            self.body = Body::Streaming(Vec::new());
        }
        match &mut self.body {
            Body::Streaming(buf) => Ok(OutputStream { buf }),
            _ => Err(Error::ResponseWrite(
                "cannot open the output stream after sending bytes".into(),
            )),
        }
    }

    /// Whether either write mode has been used.
    pub fn is_committed(&self) -> bool {
        !matches!(self.body, Body::Unwritten)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Streaming(_))
    }

    /// Marks the exchange as aborted; the transport should drop the
    /// connection instead of completing the message.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn body(&self) -> Bytes {
        match &self.body {
            Body::Unwritten => Bytes::new(),
            Body::Sent(bytes) => bytes.clone(),
            Body::Streaming(buf) => Bytes::copy_from_slice(buf),
        }
    }

    pub fn into_body(self) -> Bytes {
        match self.body {
            Body::Unwritten => Bytes::new(),
            Body::Sent(bytes) => bytes,
            Body::Streaming(buf) => Bytes::from(buf),
        }
    }

    /// Builds a complete JSON response.
    pub fn json<T: Serialize>(status: u16, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut response = Self::new(status);
        response.set_content_type(&MediaType::json())?;
        response.send_bytes(body)?;
        Ok(response)
    }
}

/// Incremental writer over the response body.
pub struct OutputStream<'a> {
    buf: &'a mut Vec<u8>,
}

impl io::Write for OutputStream<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
