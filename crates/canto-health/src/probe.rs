//! Backend health probe.
//!
//! [`HttpProbe`] issues one background `GET` against the health endpoint
//! over a fresh HTTP/1.1 connection. It carries no credentials and marks
//! itself with `X-Background: 1` so it never enters auth-refresh or
//! foreground-progress handling. Every failure folds into a [`ProbeResult`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http::Uri;
use http_body_util::BodyExt;
use thiserror::Error;
use tracing::debug;

use canto_core::HealthResponse;

use crate::checker::ProbeResult;

/// Header marking a request as background traffic.
pub const BACKGROUND_HEADER: &str = "x-background";

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = ProbeResult> + Send + 'a>>;

/// Anything that can check backend health once.
///
/// Implementations must not fail: transport problems are reported as
/// [`ProbeResult::Failed`].
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> ProbeFuture<'_>;
}

/// Errors building an [`HttpProbe`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid health url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme {0:?}, only http is supported")]
    UnsupportedScheme(String),
}

/// HTTP health probe against `{base_url}{health_path}`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    /// `host:port` to connect to.
    address: String,
    /// Value of the `Host` header.
    host: String,
    path: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(base_url: &str, health_path: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let invalid = |reason: &str| ProbeError::InvalidUrl {
            url: base_url.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = base_url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(ProbeError::UnsupportedScheme(other.to_string())),
            None => return Err(invalid("missing scheme")),
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;

        let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
        let prefix = uri.path().trim_end_matches('/');
        let suffix = health_path.trim_start_matches('/');
        let path = format!("{prefix}/{suffix}");

        Ok(Self {
            address,
            host: authority.as_str().to_string(),
            path,
            timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn check(&self) -> ProbeResult {
        match tokio::time::timeout(self.timeout, self.request()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(address = %self.address, path = %self.path, "health probe timed out");
                ProbeResult::Failed
            }
        }
    }

    async fn request(&self) -> ProbeResult {
        let stream = match tokio::net::TcpStream::connect(&self.address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, address = %self.address, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, address = %self.address, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&self.path)
            .header("host", &self.host)
            .header("accept", "application/json")
            .header("user-agent", "canto-health/0.1")
            .header(BACKGROUND_HEADER, "1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, path = %self.path, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        let resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, path = %self.path, "health probe request failed");
                return ProbeResult::Failed;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            debug!(%status, path = %self.path, "health probe non-2xx");
            return ProbeResult::Failed;
        }

        match resp.into_body().collect().await {
            Ok(body) => decode_body(&body.to_bytes()),
            Err(e) => {
                debug!(error = %e, path = %self.path, "health probe body read failed");
                ProbeResult::Failed
            }
        }
    }
}

impl HealthProbe for HttpProbe {
    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(self.check())
    }
}

/// Interpret a 2xx health body.
pub fn decode_body(body: &[u8]) -> ProbeResult {
    match serde_json::from_slice::<HealthResponse>(body) {
        Ok(resp) if resp.is_ok() => ProbeResult::Healthy,
        Ok(resp) => {
            debug!(ok = %resp.ok, "backend reported not ok");
            ProbeResult::Unhealthy
        }
        Err(e) => {
            debug!(error = %e, "health body is not a health response");
            ProbeResult::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_joins_base_path_and_health_path() {
        let probe = HttpProbe::new("http://127.0.0.1:9000/api/", "/health", Duration::from_secs(1))
            .unwrap();
        assert_eq!(probe.address(), "127.0.0.1:9000");
        assert_eq!(probe.path(), "/api/health");
        assert_eq!(probe.host, "127.0.0.1:9000");
    }

    #[test]
    fn new_defaults_port_80() {
        let probe = HttpProbe::new("http://backend.local", "health", Duration::from_secs(1)).unwrap();
        assert_eq!(probe.address(), "backend.local:80");
        assert_eq!(probe.path(), "/health");
    }

    #[test]
    fn new_rejects_https_and_garbage() {
        let err = HttpProbe::new("https://backend.local", "/health", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, ProbeError::UnsupportedScheme(ref s) if s == "https"));

        let err = HttpProbe::new("not a url", "/health", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidUrl { .. }));

        let err = HttpProbe::new("/relative/only", "/health", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidUrl { .. }));
    }

    #[test]
    fn decode_body_variants() {
        assert_eq!(decode_body(br#"{"ok":true,"timestamp":"t"}"#), ProbeResult::Healthy);
        assert_eq!(decode_body(br#"{"ok":1}"#), ProbeResult::Healthy);
        assert_eq!(decode_body(br#"{"ok":"true"}"#), ProbeResult::Healthy);
        assert_eq!(decode_body(br#"{"ok":false}"#), ProbeResult::Unhealthy);
        assert_eq!(decode_body(br#"{}"#), ProbeResult::Unhealthy);
        assert_eq!(decode_body(b"<html>maintenance</html>"), ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn probe_to_closed_port_returns_failed() {
        let probe =
            HttpProbe::new("http://127.0.0.1:1", "/health", Duration::from_millis(200)).unwrap();
        assert_eq!(probe.probe().await, ProbeResult::Failed);
    }
}
