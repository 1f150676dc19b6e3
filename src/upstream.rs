//! The persistent upstream connection: host parsing, TLS setup and the
//! connection state machine.
//!
//! Grounded on the reconnect-loop shape in
//! `broker/mod.rs::wait_for_reconnect` (bounded retry against a peer that
//! may not be there yet) and on the DataDog pack's rustls `ClientConfig`
//! construction (`ddcommon-net1/src/connector/mod.rs::build_https_connector`)
//! for loading native root certificates.

use std::io::BufReader;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::BrokerError;

pub const DEFAULT_PORT: u16 = 12222;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse `HOST` or `HOST:PORT`. `HOST` is classified, in order, as dotted
/// IPv4, bracketed IPv6, or FQDN; a missing port defaults to
/// [`DEFAULT_PORT`]. Unparseable input is an error, not a connection
/// attempt.
pub fn parse_host_port(input: &str) -> Result<HostPort, BrokerError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(BrokerError::Configuration("empty graylog host".into()));
    }

    // Bracketed IPv6, with or without a trailing `:port`.
    if let Some(rest) = input.strip_prefix('[') {
        let (addr_part, after) = rest.split_once(']').ok_or_else(|| {
            BrokerError::Configuration(format!("unterminated IPv6 bracket in {input:?}"))
        })?;
        addr_part
            .parse::<Ipv6Addr>()
            .map_err(|e| BrokerError::Configuration(format!("invalid IPv6 address: {e}")))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if after.is_empty() => DEFAULT_PORT,
            None => {
                return Err(BrokerError::Configuration(format!(
                    "unexpected trailer after IPv6 bracket: {after:?}"
                )))
            }
        };
        return Ok(HostPort {
            host: addr_part.to_string(),
            port,
        });
    }

    // IPv4 dotted-quad, with an optional `:port` that isn't ambiguous with
    // the address's own dots.
    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host.parse::<Ipv4Addr>().is_ok() {
            return Ok(HostPort {
                host: host.to_string(),
                port: parse_port(port_str)?,
            });
        }
        if host.parse::<Ipv6Addr>().is_err() && is_fqdn(host) {
            return Ok(HostPort {
                host: host.to_string(),
                port: parse_port(port_str)?,
            });
        }
    }

    if input.parse::<Ipv4Addr>().is_ok() || is_fqdn(input) {
        return Ok(HostPort {
            host: input.to_string(),
            port: DEFAULT_PORT,
        });
    }

    Err(BrokerError::Configuration(format!(
        "unparseable graylog host: {input:?}"
    )))
}

fn parse_port(s: &str) -> Result<u16, BrokerError> {
    s.parse::<u16>()
        .map_err(|e| BrokerError::Configuration(format!("invalid port {s:?}: {e}")))
}

fn is_fqdn(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

/// The full TLS options whitelist. Only the keys meaningful to a rustls
/// client are actually consumed; the rest are accepted (for compatibility
/// with configs written for the reference broker) and ignored.
/// `verify_mode` is always force-set to peer verification regardless of
/// what's configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub ca: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub cert: Option<String>,
    pub key_file: Option<PathBuf>,
    pub key: Option<String>,
    pub password_cb: Option<String>,
    pub use_cert: Option<bool>,
    pub dh: Option<String>,
    pub verify_mode: Option<String>,
    pub verify_callback: Option<String>,
    pub reuse_ctx: Option<bool>,
    pub session_cache_size: Option<u32>,
    pub session_cache: Option<bool>,
    pub session_key: Option<String>,
    pub npn_protocols: Option<Vec<String>>,
    pub alpn_protocols: Option<Vec<String>>,
}

impl TlsOptions {
    /// Build a rustls client configuration. CA certs come from `ca` if
    /// given, else the platform's native root store. Client certificate
    /// auth is wired up when both `cert_file`/`cert` and `key_file`/`key`
    /// resolve to readable PEM material.
    pub fn build_client_config(&self) -> Result<Arc<rustls::ClientConfig>, BrokerError> {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca_path) = &self.ca {
            let data = std::fs::read(ca_path).map_err(|e| {
                BrokerError::Configuration(format!("read ca {}: {e}", ca_path.display()))
            })?;
            let mut reader = BufReader::new(data.as_slice());
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert
                    .map_err(|e| BrokerError::Configuration(format!("parse ca cert: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| BrokerError::Configuration(format!("add ca cert: {e}")))?;
            }
        } else {
            let certs = rustls_native_certs::load_native_certs()
                .map_err(|e| BrokerError::Configuration(format!("load native certs: {e}")))?;
            for cert in certs {
                let _ = roots.add(cert);
            }
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

        let config = if let (Some(cert_path), Some(key_path)) = (&self.cert_file, &self.key_file)
        {
            let certs = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| BrokerError::Configuration(format!("client auth cert: {e}")))?
        } else {
            builder.with_no_client_auth()
        };

        Ok(Arc::new(config))
    }
}

fn load_certs(path: &PathBuf) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, BrokerError> {
    let data = std::fs::read(path)
        .map_err(|e| BrokerError::Configuration(format!("read cert {}: {e}", path.display())))?;
    let mut reader = BufReader::new(data.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::Configuration(format!("parse cert {}: {e}", path.display())))
}

fn load_key(path: &PathBuf) -> Result<rustls::pki_types::PrivateKeyDer<'static>, BrokerError> {
    let data = std::fs::read(path)
        .map_err(|e| BrokerError::Configuration(format!("read key {}: {e}", path.display())))?;
    let mut reader = BufReader::new(data.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BrokerError::Configuration(format!("parse key {}: {e}", path.display())))?
        .ok_or_else(|| BrokerError::Configuration(format!("no private key in {}", path.display())))
}

/// Connection state. `PartialEq`/`Copy` so the control loop can cheaply
/// compare against the prior tick's state for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unknown,
    Connecting,
    Connected,
    Error,
    Shutdown,
}

impl State {
    /// The numeric encoding written to the status file.
    pub fn as_numeric(self) -> u8 {
        match self {
            State::Unknown => 0,
            State::Connecting => 1,
            State::Connected => 2,
            State::Error => 3,
            State::Shutdown => 4,
        }
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.write_all(buf).await,
            Transport::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush().await,
            Transport::Tls(s) => s.flush().await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.shutdown().await,
            Transport::Tls(s) => s.shutdown().await,
        }
    }
}

/// Base delay before the first post-failure reconnect attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Upper bound on the backoff delay, matching the control loop's main tick
/// period so a hard-down remote is retried no more often than once per
/// `T_MAIN` even after many consecutive failures.
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// `2^consecutive_failures` seconds, capped, with the first failure (n=1)
/// yielding exactly `BACKOFF_BASE`.
fn backoff_duration(consecutive_failures: u32) -> Duration {
    let shift = consecutive_failures.saturating_sub(1).min(31);
    let scaled = BACKOFF_BASE.saturating_mul(1u32 << shift);
    scaled.min(BACKOFF_CAP)
}

/// The upstream connector. Owns at most one live transport at a time; all
/// state transitions happen inside the control loop.
pub struct Upstream {
    hostport: HostPort,
    tls: Option<Arc<rustls::ClientConfig>>,
    state: State,
    transport: Option<Transport>,
    consecutive_failures: u32,
    retry_not_before: Option<Instant>,
}

impl Upstream {
    pub fn new(hostport: HostPort, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self {
            hostport,
            tls,
            state: State::Unknown,
            transport: None,
            consecutive_failures: 0,
            retry_not_before: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn hostport(&self) -> &HostPort {
        &self.hostport
    }

    /// Number of connect attempts that have failed in a row since the last
    /// successful connection.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Attempt a connection. On success, transitions to `CONNECTED` and
    /// clears the backoff state; on any resolve/connect/TLS failure,
    /// transitions to `ERROR` and schedules the next eligible retry per
    /// [`backoff_duration`].
    pub async fn connect(&mut self) {
        self.state = State::Connecting;
        match self.try_connect().await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = State::Connected;
                self.consecutive_failures = 0;
                self.retry_not_before = None;
            }
            Err(e) => {
                log::warn!("upstream connect to {} failed: {e}", self.hostport);
                self.transport = None;
                self.state = State::Error;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let delay = backoff_duration(self.consecutive_failures);
                self.retry_not_before = Some(Instant::now() + delay);
            }
        }
    }

    async fn try_connect(&self) -> Result<Transport, BrokerError> {
        let addr = resolve(&self.hostport)
            .await
            .map_err(|e| BrokerError::UpstreamTransport(format!("resolve: {e}")))?;
        let tcp = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr))
            .await
            .map_err(|_| BrokerError::UpstreamTransport("connect timed out".into()))?
            .map_err(|e| BrokerError::UpstreamTransport(format!("connect: {e}")))?;

        match &self.tls {
            Some(config) => {
                let connector = TlsConnector::from(config.clone());
                let server_name = rustls::pki_types::ServerName::try_from(self.hostport.host.clone())
                    .map_err(|e| BrokerError::UpstreamTransport(format!("invalid server name: {e}")))?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| BrokerError::UpstreamTransport(format!("TLS handshake: {e}")))?;
                Ok(Transport::Tls(Box::new(tls)))
            }
            None => Ok(Transport::Plain(tcp)),
        }
    }

    /// Send `record` as an upstream frame. Requires `CONNECTED`; a write
    /// failure transitions to `ERROR` and is surfaced to the caller so it
    /// can re-insert the record at the head of the queue.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), BrokerError> {
        if self.state != State::Connected {
            return Err(BrokerError::UpstreamTransport(
                "send attempted while not connected".into(),
            ));
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| BrokerError::UpstreamTransport("no transport".into()))?;

        let result = async {
            transport.write_all(frame).await?;
            transport.flush().await
        }
        .await;

        if let Err(e) = result {
            self.state = State::Error;
            self.transport = None;
            return Err(BrokerError::UpstreamTransport(format!("write: {e}")));
        }
        Ok(())
    }

    /// Write a keep-alive frame. Failures are treated the same as a send
    /// failure but are not re-queued (there's no record to restore).
    pub async fn send_keepalive(&mut self) -> Result<(), BrokerError> {
        let frame = crate::envelope::keepalive_frame();
        self.send(&frame).await
    }

    /// Half-close: flush pending bytes, close the stream, and settle back
    /// to `UNKNOWN` so the next reconnect attempt starts clean.
    pub async fn graceful_shutdown(&mut self) {
        self.state = State::Shutdown;
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.flush().await;
            let _ = transport.shutdown().await;
        }
        self.state = State::Unknown;
    }

    /// ERROR → UNKNOWN, readying the next tick's `CONNECTING` attempt — but
    /// only once the capped backoff delay from the last failure has
    /// elapsed. Called on every tick that finds the connector down, so
    /// without this gate a hard-down remote would be hammered with a fresh
    /// connect attempt every `T_RECONNECT`/`T_MAIN` tick.
    pub fn reset_after_error(&mut self) {
        if self.state != State::Error {
            return;
        }
        if let Some(not_before) = self.retry_not_before {
            if Instant::now() < not_before {
                return;
            }
        }
        self.state = State::Unknown;
    }
}

async fn resolve(hostport: &HostPort) -> std::io::Result<SocketAddr> {
    if let Ok(ip) = hostport.host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::new(ip.into(), hostport.port));
    }
    if let Ok(ip) = hostport.host.parse::<Ipv6Addr>() {
        return Ok(SocketAddr::new(ip.into(), hostport.port));
    }
    let addr = format!("{}:{}", hostport.host, hostport.port);
    tokio::net::lookup_host(&addr)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_fqdn_with_default_port() {
        let hp = parse_host_port("graylog.example.com").unwrap();
        assert_eq!(hp.host, "graylog.example.com");
        assert_eq!(hp.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_fqdn_with_explicit_port() {
        let hp = parse_host_port("graylog.example.com:9000").unwrap();
        assert_eq!(hp.host, "graylog.example.com");
        assert_eq!(hp.port, 9000);
    }

    #[test]
    fn parses_ipv4_with_and_without_port() {
        let hp = parse_host_port("10.0.0.5").unwrap();
        assert_eq!(hp.host, "10.0.0.5");
        assert_eq!(hp.port, DEFAULT_PORT);

        let hp = parse_host_port("10.0.0.5:1514").unwrap();
        assert_eq!(hp.host, "10.0.0.5");
        assert_eq!(hp.port, 1514);
    }

    #[test]
    fn parses_bracketed_ipv6_with_and_without_port() {
        let hp = parse_host_port("[::1]").unwrap();
        assert_eq!(hp.host, "::1");
        assert_eq!(hp.port, DEFAULT_PORT);

        let hp = parse_host_port("[::1]:9000").unwrap();
        assert_eq!(hp.host, "::1");
        assert_eq!(hp.port, 9000);
    }

    #[test]
    fn rejects_unparseable_host() {
        assert!(parse_host_port("").is_err());
        assert!(parse_host_port("[::1").is_err());
        assert!(parse_host_port("not a host!!").is_err());
    }

    #[test]
    fn state_numeric_encoding_is_stable() {
        assert_eq!(State::Unknown.as_numeric(), 0);
        assert_eq!(State::Connecting.as_numeric(), 1);
        assert_eq!(State::Connected.as_numeric(), 2);
        assert_eq!(State::Error.as_numeric(), 3);
        assert_eq!(State::Shutdown.as_numeric(), 4);
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let hp = HostPort {
            host: "127.0.0.1".into(),
            port: 1,
        };
        let mut upstream = Upstream::new(hp, None);
        let result = upstream.send(b"x\0").await;
        assert!(result.is_err());
        assert_eq!(upstream.state(), State::Unknown);
    }

    #[tokio::test]
    async fn connect_failure_transitions_to_error() {
        // Port 0 never accepts connections; an immediate connect failure is
        // expected without any real network activity.
        let hp = HostPort {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let mut upstream = Upstream::new(hp, None);
        upstream.connect().await;
        assert_eq!(upstream.state(), State::Error);
    }

    #[test]
    fn reset_after_error_returns_to_unknown() {
        let hp = HostPort {
            host: "127.0.0.1".into(),
            port: 1,
        };
        let mut upstream = Upstream::new(hp, None);
        upstream.state = State::Error;
        upstream.reset_after_error();
        assert_eq!(upstream.state(), State::Unknown);
    }

    #[test]
    fn backoff_duration_doubles_then_caps() {
        assert_eq!(backoff_duration(1), Duration::from_secs(1));
        assert_eq!(backoff_duration(2), Duration::from_secs(2));
        assert_eq!(backoff_duration(3), Duration::from_secs(4));
        assert_eq!(backoff_duration(4), Duration::from_secs(8));
        assert_eq!(backoff_duration(5), BACKOFF_CAP);
        assert_eq!(backoff_duration(20), BACKOFF_CAP);
    }

    #[tokio::test]
    async fn repeated_failures_pace_the_reset_with_backoff() {
        let hp = HostPort {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let mut upstream = Upstream::new(hp, None);

        upstream.connect().await;
        assert_eq!(upstream.state(), State::Error);
        assert_eq!(upstream.consecutive_failures(), 1);

        // The backoff window hasn't elapsed yet; the connector stays in
        // ERROR instead of bouncing straight back to UNKNOWN.
        upstream.reset_after_error();
        assert_eq!(upstream.state(), State::Error);

        // Once the window has passed, the reset goes through.
        upstream.retry_not_before = Some(Instant::now() - Duration::from_millis(1));
        upstream.reset_after_error();
        assert_eq!(upstream.state(), State::Unknown);
    }

    #[tokio::test]
    async fn consecutive_failures_increments_across_repeated_connect_attempts() {
        let hp = HostPort {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let mut upstream = Upstream::new(hp, None);

        upstream.connect().await;
        assert_eq!(upstream.consecutive_failures(), 1);

        upstream.retry_not_before = Some(Instant::now() - Duration::from_millis(1));
        upstream.reset_after_error();
        assert_eq!(upstream.state(), State::Unknown);

        upstream.connect().await;
        assert_eq!(upstream.consecutive_failures(), 2);
    }
}
