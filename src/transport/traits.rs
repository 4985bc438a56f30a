//! Transport trait definitions
//!
//! A transport issues one HTTP request against the device REST API and
//! hands back parsed JSON or a typed failure. Scheduling, retries and error
//! accounting live above this layer.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// HTTP methods understood by the REST API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PATCH" => Ok(Method::Patch),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(Error::InvalidEndpoint {
                endpoint: other.to_string(),
                message: "unsupported HTTP method".to_string(),
            }),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Per-phase request timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// DNS lookup
    pub lookup: Duration,
    /// TCP connect
    pub connect: Duration,
    /// TLS handshake
    pub secure_connect: Duration,
    /// Socket inactivity
    pub socket: Duration,
    /// Uploading the request
    pub send: Duration,
    /// Waiting for the response
    pub response: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        let phase = Duration::from_millis(1000);
        Self {
            lookup: phase,
            connect: phase,
            secure_connect: phase,
            socket: phase,
            send: phase,
            response: phase,
        }
    }
}

impl RequestTimeouts {
    /// Budget for establishing a connection (lookup + connect + TLS)
    pub fn connect_phase(&self) -> Duration {
        self.lookup + self.connect + self.secure_connect
    }

    /// Upper bound for a whole request
    pub fn total(&self) -> Duration {
        self.connect_phase() + self.socket + self.send + self.response
    }
}

/// Something that can deliver a request to the device
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request. An empty response body yields `Value::Null`.
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        timeouts: &RequestTimeouts,
    ) -> Result<Value>;
}
