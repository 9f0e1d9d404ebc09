//! # entiq Transport
//!
//! Transport layer for the entiq data-access runtime.
//!
//! This crate provides:
//! - The [`Transport`] contract used by sessions for every exchange
//! - Request/response types and the [`ServiceEndpoint`] descriptor
//! - An HTTP transport shell over a pluggable [`HttpClient`]
//! - A loopback client for in-process servers
//! - [`MockTransport`], a scripted double for deterministic tests
//! - The process-wide [`ambient`] adapter slot
//!
//! ## Key Invariants
//!
//! - Non-2xx responses are errors carrying status and body
//! - Transports never retry; retry is a caller concern
//! - At most one ambient adapter is active per process

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod ambient;
mod endpoint;
mod error;
mod http;
mod request;
mod transport;

pub use endpoint::{ServiceEndpoint, DEFAULT_SAVE_RESOURCE};
pub use error::{TransportError, TransportResult};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use request::{Method, RawResponse, RequestDescriptor};
pub use transport::{DeferredReply, MockReply, MockTransport, Transport};
