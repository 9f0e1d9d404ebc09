//! Request and response types exchanged with a transport.

use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read request (queries).
    Get,
    /// Write request (saves).
    Post,
}

impl Method {
    /// Returns the method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a transport needs to perform one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Request method.
    pub method: Method,
    /// Absolute (or service-relative) URL.
    pub url: String,
    /// Resource path relative to the service, including the query string.
    pub resource: String,
    /// Request headers in insertion order.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    /// Creates a request without headers or body.
    pub fn new(method: Method, url: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            resource: resource.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Sets a header, replacing any existing header with the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Looks up a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns the request body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns the resource name without its query string.
    pub fn resource_name(&self) -> &str {
        self.resource
            .split_once('?')
            .map(|(name, _)| name)
            .unwrap_or(&self.resource)
    }
}

/// A raw response as received from the service.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Creates a response with the given status and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Creates a 200 response with a JSON body.
    pub fn ok_json(value: &serde_json::Value) -> Self {
        Self::json(200, value)
    }

    /// Creates a response with a JSON body.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns the body as UTF-8 text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> TransportResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON body: {e}")))
    }

    /// Converts a non-2xx response into a status error.
    pub fn error_for_status(self) -> TransportResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::status(self.status, self.text()))
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
