//! Service endpoint descriptor.

use crate::request::{Method, RequestDescriptor};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default resource that receives save bundles.
pub const DEFAULT_SAVE_RESOURCE: &str = "SaveChanges";

/// Describes where and how to reach a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoint {
    /// Base address of the service (e.g., "https://api.example.com/breeze/todos/").
    pub service_name: String,
    /// Whether the service publishes entity metadata.
    ///
    /// When false, entity types are inferred from the shape of responses.
    pub has_server_metadata: bool,
    /// Headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Resource name used for save requests.
    pub save_resource: String,
}

impl ServiceEndpoint {
    /// Creates an endpoint descriptor for the given service address.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            has_server_metadata: true,
            headers: Vec::new(),
            timeout: Duration::from_secs(30),
            save_resource: DEFAULT_SAVE_RESOURCE.to_string(),
        }
    }

    /// Sets whether the service publishes metadata.
    pub fn with_server_metadata(mut self, has_server_metadata: bool) -> Self {
        self.has_server_metadata = has_server_metadata;
        self
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the resource name used for saves.
    pub fn with_save_resource(mut self, resource: impl Into<String>) -> Self {
        self.save_resource = resource.into();
        self
    }

    /// Joins a resource path onto the service address.
    pub fn make_url(&self, resource: &str) -> String {
        let resource = resource.trim_start_matches('/');
        if self.service_name.is_empty() {
            resource.to_string()
        } else if self.service_name.ends_with('/') {
            format!("{}{}", self.service_name, resource)
        } else {
            format!("{}/{}", self.service_name, resource)
        }
    }

    /// Builds a GET request for a resource path (query string included).
    pub fn get(&self, resource: impl Into<String>) -> RequestDescriptor {
        self.request(Method::Get, resource.into(), None)
    }

    /// Builds a POST request carrying a JSON body.
    pub fn post_json(&self, resource: impl Into<String>, body: Vec<u8>) -> RequestDescriptor {
        let mut request = self.request(Method::Post, resource.into(), Some(body));
        request.set_header("Content-Type", "application/json");
        request
    }

    fn request(&self, method: Method, resource: String, body: Option<Vec<u8>>) -> RequestDescriptor {
        let mut request = RequestDescriptor::new(method, self.make_url(&resource), resource);
        request.set_header("Accept", "application/json");
        for (name, value) in &self.headers {
            request.set_header(name, value);
        }
        request.body = body.map(Into::into);
        request
    }
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self::new("")
    }
}
