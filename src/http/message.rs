//! HTTP message types
//!
//! Requests and responses as seen by route handlers. Header fields arrive one
//! at a time from the protocol engine, so both types accumulate them
//! incrementally, interpreting the HTTP/2 pseudo-header fields as they go.

use super::h2::HeaderField;
use super::{Error, Headers, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    /// Convert method to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "CONNECT" => Ok(Method::Connect),
            "OPTIONS" => Ok(Method::Options),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a new status code
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code)
    }

    pub const OK: Status = Status { code: 200 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const METHOD_NOT_ALLOWED: Status = Status { code: 405 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };
}

impl Default for Status {
    fn default() -> Self {
        Status::OK
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty() && !name.bytes().any(|b| b.is_ascii_uppercase() || b <= b' ' || b == b':')
}

/// HTTP request
///
/// Built up field by field while a stream's HEADERS arrive. Pseudo-header
/// fields must precede regular fields and may appear only once.
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: Option<Method>,
    path: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    headers: Headers,
    body: BytesMut,
}

impl Request {
    /// Create an empty request
    pub fn new() -> Self {
        Request::default()
    }

    /// Create a builder for outbound requests
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn method(&self) -> Option<Method> {
        self.method
    }

    /// The `:path` pseudo-header, query included; empty until received
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }

    /// The `:path` with any query string removed, used for route lookups
    pub fn route_path(&self) -> &str {
        let path = self.path();
        path.split_once('?').map_or(path, |(p, _)| p)
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Incorporate one header field received from the peer
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        if let Some(pseudo) = name.strip_prefix(':') {
            if !self.headers.is_empty() {
                return Err(Error::InvalidHeader(format!(
                    "pseudo-header {} after regular header",
                    name
                )));
            }
            let slot = match pseudo {
                "method" => {
                    if self.method.is_some() {
                        return Err(Error::InvalidHeader("duplicate :method".to_string()));
                    }
                    self.method = Some(value.parse()?);
                    return Ok(());
                }
                "path" => &mut self.path,
                "scheme" => &mut self.scheme,
                "authority" => &mut self.authority,
                _ => return Err(Error::InvalidHeader(format!("unknown pseudo-header {}", name))),
            };
            if slot.is_some() {
                return Err(Error::InvalidHeader(format!("duplicate {}", name)));
            }
            if pseudo == "path" && value.is_empty() {
                return Err(Error::InvalidHeader("empty :path".to_string()));
            }
            *slot = Some(value.to_string());
            return Ok(());
        }

        if !is_valid_field_name(name) {
            return Err(Error::InvalidHeader(format!("malformed field name {:?}", name)));
        }
        if name == "connection" || (name == "te" && value != "trailers") {
            return Err(Error::InvalidHeader(format!("connection-specific field {}", name)));
        }
        if !self.headers.insert(name, value) {
            return Err(Error::InvalidHeader("too many header fields".to_string()));
        }
        Ok(())
    }

    /// Append a body chunk received from the peer
    pub fn add_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Check that the mandatory pseudo-header fields arrived
    pub fn validate(&self) -> Result<()> {
        match self.method {
            None => Err(Error::Incomplete(":method")),
            Some(Method::Connect) if self.authority.is_none() => Err(Error::Incomplete(":authority")),
            Some(Method::Connect) => Ok(()),
            Some(_) if self.path.is_none() => Err(Error::Incomplete(":path")),
            Some(_) if self.scheme.is_none() => Err(Error::Incomplete(":scheme")),
            Some(_) => Ok(()),
        }
    }

    /// Header list for HEADERS or PUSH_PROMISE, pseudo-headers first
    pub(crate) fn header_fields(&self) -> Vec<HeaderField> {
        let mut fields = Vec::with_capacity(self.headers.len() + 4);
        fields.push((
            ":method".to_string(),
            self.method.unwrap_or(Method::Get).as_str().to_string(),
        ));
        fields.push((":scheme".to_string(), self.scheme.clone().unwrap_or_else(|| "https".to_string())));
        if let Some(authority) = &self.authority {
            fields.push((":authority".to_string(), authority.clone()));
        }
        fields.push((":path".to_string(), self.path().to_string()));
        fields.extend(self.headers.wire_fields());
        fields
    }

    /// Same request with a different `:path`, as announced in a PUSH_PROMISE
    pub(crate) fn promised(&self, path: &str) -> Request {
        Request {
            method: Some(Method::Get),
            path: Some(path.to_string()),
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            headers: Headers::new(),
            body: BytesMut::new(),
        }
    }
}

/// Builder for outbound requests
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    headers: Headers,
    body: BytesMut,
}

impl RequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl AsRef<[u8]>) -> Self {
        self.body = BytesMut::from(body.as_ref());
        self
    }

    /// Build the request, defaulting to `GET /` over https
    pub fn build(self) -> Request {
        Request {
            method: Some(self.method.unwrap_or(Method::Get)),
            path: Some(self.path.unwrap_or_else(|| "/".to_string())),
            scheme: Some(self.scheme.unwrap_or_else(|| "https".to_string())),
            authority: self.authority,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// HTTP response
///
/// Handlers receive a fresh response and fill it in. A response produced by
/// the push handler may name the path announced in the PUSH_PROMISE via
/// `set_push_path`; without one the originating request path is used.
#[derive(Debug, Clone, Default)]
pub struct Response {
    status: Status,
    headers: Headers,
    body: Bytes,
    push_path: Option<String>,
}

impl Response {
    /// Create an empty response with the given status
    pub fn new(status: Status) -> Self {
        Response {
            status,
            ..Response::default()
        }
    }

    /// Response whose body is the reason phrase of `status`
    pub fn error(status: Status) -> Self {
        let mut rep = Response::new(status);
        rep.headers.insert("content-type", "text/plain");
        rep.body = Bytes::from_static(status.reason_phrase().as_bytes());
        rep
    }

    pub fn not_found() -> Self {
        Response::error(Status::NOT_FOUND)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Set a header, replacing previous values
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn push_path(&self) -> Option<&str> {
        self.push_path.as_deref()
    }

    pub fn set_push_path(&mut self, path: impl Into<String>) {
        self.push_path = Some(path.into());
    }

    /// Incorporate one header field of a received response (client role)
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        if name == ":status" {
            let code = value
                .parse::<u16>()
                .map_err(|_| Error::InvalidStatus(value.to_string()))?;
            self.status = Status::new(code)?;
            return Ok(());
        }
        if name.starts_with(':') {
            return Err(Error::InvalidHeader(format!("unexpected pseudo-header {}", name)));
        }
        if !is_valid_field_name(name) {
            return Err(Error::InvalidHeader(format!("malformed field name {:?}", name)));
        }
        self.headers.insert(name, value);
        Ok(())
    }

    /// Header list for the response HEADERS frame
    pub(crate) fn header_fields(&self) -> Vec<HeaderField> {
        let mut fields = Vec::with_capacity(self.headers.len() + 2);
        fields.push((":status".to_string(), self.status.code().to_string()));
        fields.extend(self.headers.wire_fields());
        if !self.headers.contains("content-length") {
            fields.push(("content-length".to_string(), self.body.len().to_string()));
        }
        fields
    }
}
