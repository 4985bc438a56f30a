//! reqwest-backed transport for the RealityHub REST API

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};
use crate::version::build_info;

use super::{Method, RequestTimeouts, Transport};

/// HTTP transport over a pooled reqwest client.
///
/// The connect phase is fixed when a client is built, so the client is
/// rebuilt whenever a request arrives with different timeouts.
pub struct HttpTransport {
    client: RwLock<PooledClient>,
}

struct PooledClient {
    timeouts: RequestTimeouts,
    client: Client,
}

impl HttpTransport {
    pub fn new(timeouts: &RequestTimeouts) -> Result<Self> {
        Ok(Self {
            client: RwLock::new(PooledClient {
                timeouts: *timeouts,
                client: build_client(timeouts)?,
            }),
        })
    }

    fn client_for(&self, timeouts: &RequestTimeouts) -> Result<Client> {
        {
            let pooled = self.client.read();
            if pooled.timeouts == *timeouts {
                return Ok(pooled.client.clone());
            }
        }

        let client = build_client(timeouts)?;
        debug!(
            connect_ms = timeouts.connect_phase().as_millis() as u64,
            "HTTP client rebuilt for new timeouts"
        );
        *self.client.write() = PooledClient {
            timeouts: *timeouts,
            client: client.clone(),
        };
        Ok(client)
    }
}

fn build_client(timeouts: &RequestTimeouts) -> Result<Client> {
    Client::builder()
        .user_agent(build_info().user_agent())
        .connect_timeout(timeouts.connect_phase())
        .pool_idle_timeout(timeouts.socket)
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        timeouts: &RequestTimeouts,
    ) -> Result<Value> {
        let target = url.to_string();
        trace!(%method, url = %target, "Sending request");

        let mut req = self
            .client_for(timeouts)?
            .request(method.into(), url)
            .timeout(timeouts.total());
        if let Some(ref body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| map_reqwest_error(&target, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(%method, url = %target, status = status.as_u16(), "Request rejected");
            return Err(Error::from_status(target, status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&target, e))?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&bytes).map_err(|e| Error::MalformedResponse {
            url: target,
            message: e.to_string(),
        })
    }
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout(url)
    } else if err.is_connect() {
        Error::connection_failed(url, err.to_string())
    } else if err.is_decode() {
        Error::MalformedResponse {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        Error::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use std::time::Duration;

    #[test]
    fn test_client_builds() {
        assert!(HttpTransport::new(&RequestTimeouts::default()).is_ok());
    }

    #[test]
    fn test_client_follows_new_timeouts() {
        let transport = HttpTransport::new(&RequestTimeouts::default()).unwrap();
        transport.client_for(&RequestTimeouts::default()).unwrap();
        assert_eq!(transport.client.read().timeouts, RequestTimeouts::default());

        let slower = RequestTimeouts {
            connect: Duration::from_secs(20),
            ..RequestTimeouts::default()
        };
        transport.client_for(&slower).unwrap();
        assert_eq!(transport.client.read().timeouts, slower);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_fatal() {
        let timeouts = RequestTimeouts {
            lookup: Duration::from_millis(50),
            connect: Duration::from_millis(50),
            secure_connect: Duration::from_millis(50),
            socket: Duration::from_millis(50),
            send: Duration::from_millis(50),
            response: Duration::from_millis(50),
        };
        let transport = HttpTransport::new(&timeouts).unwrap();

        // Port 9 (discard) on localhost is closed on any sane test machine
        let url = Url::parse("http://127.0.0.1:9/api/rest/v1/engines").unwrap();
        let err = transport
            .request(Method::Get, url, None, &timeouts)
            .await
            .unwrap_err();

        assert!(err.class().is_connection_fatal(), "unexpected error: {:?}", err);
        assert!(matches!(
            err.class(),
            ErrorClass::ConnectionRefused | ErrorClass::Timeout
        ));
        assert_eq!(err.subject(), Some("http://127.0.0.1:9/api/rest/v1/engines"));
    }
}
