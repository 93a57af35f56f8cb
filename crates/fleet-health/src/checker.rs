//! Access point availability check.
//!
//! One TCP connect probe per server plus a download probe for each package
//! URL, run concurrently under a semaphore. Every probe is awaited; the
//! check passes only if all of them do.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_core::ProbeSettings;
use http::header::{HOST, USER_AGENT};
use http::{Method, StatusCode, Uri};
use http_body_util::Empty;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::access_point::AccessPoint;

/// File every package URL must serve.
pub const SETUP_SCRIPT: &str = "setup_agent.sh";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("access point has no {0}")]
    MissingUrl(&'static str),

    #[error("server #{0} has no inner ip")]
    MissingIp(usize),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Info,
    Error,
}

/// Outcome line of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeLog {
    pub log_level: LogLevel,
    pub log: String,
}

impl ProbeLog {
    fn info(log: String) -> Self {
        Self {
            log_level: LogLevel::Info,
            log,
        }
    }

    fn error(log: String) -> Self {
        Self {
            log_level: LogLevel::Error,
            log,
        }
    }
}

/// Result of checking one access point: the AND of all probes, and their
/// logs in probe order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub ok: bool,
    pub logs: Vec<ProbeLog>,
}

#[derive(Debug, Clone)]
enum Probe {
    Connect { ip: String, port: u16 },
    Download { base_url: String },
}

/// Runs access point checks with the configured limits.
#[derive(Debug, Clone)]
pub struct AccessPointChecker {
    settings: ProbeSettings,
}

impl AccessPointChecker {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    pub async fn check(&self, ap: &AccessPoint) -> ProbeResult<CheckReport> {
        if ap.package_inner_url.trim().is_empty() {
            return Err(ProbeError::MissingUrl("package_inner_url"));
        }
        if ap.package_outer_url.trim().is_empty() {
            return Err(ProbeError::MissingUrl("package_outer_url"));
        }
        let port = ap
            .port_config
            .io_port
            .unwrap_or(self.settings.default_server_port);

        let mut probes = Vec::new();
        for (index, server) in ap.servers().enumerate() {
            if server.inner_ip.trim().is_empty() {
                return Err(ProbeError::MissingIp(index));
            }
            probes.push(Probe::Connect {
                ip: server.inner_ip.trim().to_string(),
                port,
            });
        }
        for url in [&ap.package_inner_url, &ap.package_outer_url] {
            probes.push(Probe::Download {
                base_url: url.trim().to_string(),
            });
        }

        let total = probes.len();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let connect_timeout = Duration::from_millis(self.settings.connect_timeout_ms);
        let download_timeout = Duration::from_millis(self.settings.download_timeout_ms);
        let mut set = JoinSet::new();
        for (index, probe) in probes.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let log = match probe {
                    Probe::Connect { ip, port } => connect_probe(&ip, port, connect_timeout).await,
                    Probe::Download { base_url } => {
                        download_probe(&base_url, download_timeout).await
                    }
                };
                (index, log)
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(error = %e, "probe task did not complete");
                    results.push((total, ProbeLog::error(format!("probe aborted: {e}"))));
                }
            }
        }
        results.sort_by_key(|(index, _)| *index);
        let logs: Vec<ProbeLog> = results.into_iter().map(|(_, log)| log).collect();
        let ok = logs.iter().all(|log| log.log_level == LogLevel::Info);
        info!(ok, probes = logs.len(), "access point checked");
        Ok(CheckReport { ok, logs })
    }
}

async fn connect_probe(ip: &str, port: u16, timeout: Duration) -> ProbeLog {
    let addr = if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    };
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => {
            debug!(%addr, "connect probe ok");
            ProbeLog::info(format!("connect to {addr} succeeded"))
        }
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "connect probe failed");
            ProbeLog::error(format!("connect to {addr} failed: {e}"))
        }
        Err(_) => ProbeLog::error(format!(
            "connect to {addr} timed out after {}ms",
            timeout.as_millis()
        )),
    }
}

async fn download_probe(base_url: &str, timeout: Duration) -> ProbeLog {
    let url = format!("{}/{SETUP_SCRIPT}", base_url.trim_end_matches('/'));
    match tokio::time::timeout(timeout, fetch_status(&url)).await {
        Ok(Ok(status)) if status == StatusCode::OK => {
            ProbeLog::info(format!("{url} download check succeeded"))
        }
        Ok(Ok(status)) => {
            debug!(%url, %status, "download probe non-200");
            ProbeLog::error(format!("{url} download check failed: status {status}"))
        }
        Ok(Err(reason)) => ProbeLog::error(format!(
            "{url} download check failed, no {SETUP_SCRIPT} reachable: {reason}"
        )),
        Err(_) => ProbeLog::error(format!(
            "{url} download check timed out after {}ms",
            timeout.as_millis()
        )),
    }
}

/// GET `url` over a fresh HTTP/1 connection and return the status.
async fn fetch_status(url: &str) -> Result<StatusCode, String> {
    let uri: Uri = url.parse().map_err(|e| format!("invalid url: {e}"))?;
    if uri.scheme_str() != Some("http") {
        return Err(format!("unsupported scheme in {url}"));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| format!("no host in {url}"))?
        .clone();
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let port = authority.port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| e.to_string())?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| e.to_string())?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "download probe connection closed");
        }
    });

    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    let req = http::Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, authority.as_str())
        .header(USER_AGENT, "fleet-health/0.1")
        .body(Empty::<Bytes>::new())
        .map_err(|e| e.to_string())?;
    let resp = sender.send_request(req).await.map_err(|e| e.to_string())?;
    Ok(resp.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_point::{PortConfig, ServerAddr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `status` for `GET /download/setup_agent.sh` and 404 otherwise.
    async fn package_server(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    while read < buf.len() {
                        let n = stream.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]);
                    let line = if request.starts_with("GET /download/setup_agent.sh ") {
                        status
                    } else {
                        "404 Not Found"
                    };
                    let resp = format!(
                        "HTTP/1.1 {line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/download")
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn settings() -> ProbeSettings {
        ProbeSettings {
            concurrency: 4,
            connect_timeout_ms: 1000,
            download_timeout_ms: 1000,
            default_server_port: 1,
        }
    }

    fn server(ip: &str) -> ServerAddr {
        ServerAddr {
            inner_ip: ip.to_string(),
            outer_ip: String::new(),
        }
    }

    fn access_point(port: u16, url: &str) -> AccessPoint {
        AccessPoint {
            btfileserver: vec![server("127.0.0.1")],
            dataserver: vec![server("127.0.0.1")],
            taskserver: Vec::new(),
            package_inner_url: url.to_string(),
            package_outer_url: format!("{url}/"),
            port_config: PortConfig {
                io_port: Some(port),
                ..PortConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn healthy_access_point_passes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = package_server("200 OK").await;

        let report = AccessPointChecker::new(settings())
            .check(&access_point(port, &url))
            .await
            .unwrap();
        assert!(report.ok, "{:?}", report.logs);
        assert_eq!(report.logs.len(), 4);
        assert!(
            report.logs[3]
                .log
                .ends_with("/download/setup_agent.sh download check succeeded")
        );
    }

    #[tokio::test]
    async fn missing_setup_script_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = package_server("500 Internal Server Error").await;

        let report = AccessPointChecker::new(settings())
            .check(&access_point(port, &url))
            .await
            .unwrap();
        assert!(!report.ok);
        let errors = report
            .logs
            .iter()
            .filter(|l| l.log_level == LogLevel::Error)
            .count();
        assert_eq!(errors, 2);
        assert!(report.logs[0..2].iter().all(|l| l.log_level == LogLevel::Info));
    }

    #[tokio::test]
    async fn refused_connection_fails_the_check() {
        let port = closed_port().await;
        let url = package_server("200 OK").await;
        let report = AccessPointChecker::new(settings())
            .check(&access_point(port, &url))
            .await
            .unwrap();
        assert!(!report.ok);
        assert_eq!(report.logs[0].log_level, LogLevel::Error);
        assert_eq!(report.logs[2].log_level, LogLevel::Info);
    }

    #[tokio::test]
    async fn default_port_applies_without_io_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = package_server("200 OK").await;
        let mut ap = access_point(port, &url);
        ap.port_config.io_port = None;

        let checker = AccessPointChecker::new(ProbeSettings {
            default_server_port: port,
            concurrency: 1,
            ..settings()
        });
        let report = checker.check(&ap).await.unwrap();
        assert!(report.ok, "{:?}", report.logs);
        assert!(report.logs[0].log.contains(&format!("127.0.0.1:{port}")));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_logged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut ap = access_point(port, "https://127.0.0.1/download");
        ap.btfileserver.clear();
        ap.dataserver.clear();

        let report = AccessPointChecker::new(settings()).check(&ap).await.unwrap();
        assert!(!report.ok);
        assert!(report.logs.iter().all(|l| l.log.contains("unsupported scheme")));
    }

    #[tokio::test]
    async fn empty_url_is_rejected() {
        let mut ap = access_point(1, "http://127.0.0.1/download");
        ap.package_outer_url = " ".to_string();
        let err = AccessPointChecker::new(settings()).check(&ap).await.unwrap_err();
        assert!(matches!(err, ProbeError::MissingUrl("package_outer_url")));
    }
}
