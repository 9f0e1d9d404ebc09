//! # entiq Testkit
//!
//! Test utilities for entiq.
//!
//! This crate provides:
//! - An in-process fake data service answering queries and saves over
//!   the loopback HTTP client
//! - Session fixtures wired to the scripted transport or the fake service
//! - Save assertions that check the atomicity of failed saves
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use entiq_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn saves_a_todo() {
//!     let service = todo_service();
//!     let session = loopback_session(&service);
//!     session.create_entity("Todo", json!({"Title": "write docs"}))?;
//!     should_save(&session, None).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod assertions;
pub mod fake_service;
pub mod fixtures;
pub mod generators;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::fake_service::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use serde_json::json;
}

pub use assertions::*;
pub use fake_service::*;
pub use fixtures::*;
pub use generators::*;

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
