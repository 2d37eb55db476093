//! Proxy lifecycle and accept loop.

use crate::collection::ToxicCollection;
use crate::link::{Link, LinkSet};
use crate::stream::StreamConfig;
use crate::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime knobs shared by every proxy in a registry.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Upper bound on dialing the upstream for one accepted connection.
    /// Default: 5s
    pub connect_timeout: Duration,

    /// How long `stop` waits for links to finish before aborting them.
    /// Default: 5s
    pub drain_timeout: Duration,

    /// Largest chunk read from a socket at once.
    /// Default: 32 KiB
    pub read_buffer_size: usize,

    /// Capacity of the channel in front of each toxic stage.
    /// Default: 4
    pub stage_buffer: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
            read_buffer_size: 32 * 1024,
            stage_buffer: 4,
        }
    }
}

impl ProxyOptions {
    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            read_buffer: self.read_buffer_size,
            stage_buffer: self.stage_buffer,
        }
    }
}

/// Serialized proxy record.
///
/// ```json
/// {"name": "redis", "listen": "127.0.0.1:26379", "upstream": "127.0.0.1:6379"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    pub name: String,

    /// Address to listen on.
    /// Default: "127.0.0.1:0" (any free port)
    #[serde(default = "default_listen")]
    pub listen: String,

    pub upstream: String,

    /// Whether bulk population starts the proxy.
    /// Default: true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

fn default_listen() -> String {
    "127.0.0.1:0".to_string()
}

impl ProxySpec {
    pub fn new(
        name: impl Into<String>,
        listen: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            listen: listen.into(),
            upstream: upstream.into(),
            enabled: None,
        }
    }

    /// Check the fields bulk population requires.
    ///
    /// # Errors
    /// * `ProxyError::Validation` - empty name or upstream
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::Validation("proxy name must not be empty".to_string()));
        }
        if self.upstream.trim().is_empty() {
            return Err(ProxyError::Validation(format!(
                "proxy {} has an empty upstream address",
                self.name
            )));
        }
        Ok(())
    }
}

struct Running {
    shutdown: CancellationToken,
    acceptor: JoinHandle<()>,
}

/// A named listener relaying every accepted connection to one upstream.
///
/// A proxy is created stopped. `start` binds the listen address and spawns
/// the accept loop; `stop` closes the listener, cancels every link and
/// waits for them to finish.
pub struct Proxy {
    name: String,
    listen: String,
    upstream: String,
    bound: std::sync::Mutex<Option<SocketAddr>>,
    options: ProxyOptions,
    toxics: Arc<ToxicCollection>,
    lifecycle: Mutex<Option<Running>>,
    enabled: AtomicBool,
    links: Arc<LinkSet>,
}

impl Proxy {
    /// Create a stopped proxy.
    pub fn new(spec: &ProxySpec, options: ProxyOptions) -> Self {
        Self {
            name: spec.name.clone(),
            listen: spec.listen.clone(),
            upstream: spec.upstream.clone(),
            bound: std::sync::Mutex::new(None),
            options,
            toxics: Arc::new(ToxicCollection::new()),
            lifecycle: Mutex::new(None),
            enabled: AtomicBool::new(false),
            links: Arc::new(LinkSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured listen address.
    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// The address actually bound by the last `start`, or the configured
    /// address if the proxy never started.
    pub fn listen_addr(&self) -> String {
        match *self.bound.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(addr) => addr.to_string(),
            None => self.listen.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Both toxic chains of this proxy.
    pub fn toxics(&self) -> &ToxicCollection {
        &self.toxics
    }

    /// Number of links currently relaying. Connections still waiting on
    /// their upstream dial are not counted.
    pub fn active_links(&self) -> usize {
        self.links.established()
    }

    /// Record form of this proxy.
    pub fn to_spec(&self) -> ProxySpec {
        ProxySpec {
            name: self.name.clone(),
            listen: self.listen.clone(),
            upstream: self.upstream.clone(),
            enabled: Some(self.is_enabled()),
        }
    }

    /// Bind the listen address and start accepting.
    ///
    /// # Errors
    /// * `ProxyError::AlreadyStarted` - the proxy is already listening
    /// * `ProxyError::AddressInUse` - another socket holds the address
    /// * `ProxyError::Bind` - any other bind failure
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(ProxyError::AlreadyStarted {
                name: self.name.clone(),
            });
        }

        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| bind_error(&self.listen, e))?;
        let local = listener
            .local_addr()
            .map_err(|e| bind_error(&self.listen, e))?;
        *self.bound.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);

        let shutdown = CancellationToken::new();
        let acceptor = Acceptor {
            proxy: self.name.clone(),
            upstream: self.upstream.clone(),
            options: self.options.clone(),
            toxics: Arc::clone(&self.toxics),
            links: Arc::clone(&self.links),
        };
        let acceptor = tokio::spawn(acceptor.run(listener, shutdown.clone()));
        *lifecycle = Some(Running { shutdown, acceptor });
        self.enabled.store(true, Ordering::Release);

        info!(proxy = %self.name, listen = %local, upstream = %self.upstream, "Proxy started");
        Ok(())
    }

    /// Close the listener, cancel every link and wait for them to finish.
    ///
    /// Links still running after `drain_timeout` are aborted. Calling this
    /// on a stopped proxy does nothing.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };
        self.enabled.store(false, Ordering::Release);

        running.shutdown.cancel();
        if let Err(e) = running.acceptor.await {
            warn!(proxy = %self.name, error = %e, "Accept loop ended abnormally");
        }
        self.links.drain(self.options.drain_timeout).await;
        info!(proxy = %self.name, "Proxy stopped");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut() {
            running.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("listen", &self.listen_addr())
            .field("upstream", &self.upstream)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

fn bind_error(addr: &str, source: io::Error) -> ProxyError {
    if source.kind() == io::ErrorKind::AddrInUse {
        ProxyError::AddressInUse {
            addr: addr.to_string(),
        }
    } else {
        ProxyError::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

/// What the accept loop needs from its proxy.
struct Acceptor {
    proxy: String,
    upstream: String,
    options: ProxyOptions,
    toxics: Arc<ToxicCollection>,
    links: Arc<LinkSet>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let (client, client_addr) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(proxy = %self.proxy, error = %e, "TCP accept error");
                        continue;
                    }
                },
            };

            let cancel = shutdown.child_token();
            let proxy = self.proxy.clone();
            let upstream = self.upstream.clone();
            let connect_timeout = self.options.connect_timeout;
            let config = self.options.stream_config();
            let toxics = Arc::clone(&self.toxics);
            let links = Arc::clone(&self.links);

            self.links.spawn(client_addr, async move {
                let dialed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    dialed = dial(&upstream, connect_timeout) => dialed,
                };
                let upstream_conn = match dialed {
                    Ok(conn) => conn,
                    Err(e) => {
                        // Dropping the client closes it right away.
                        warn!(proxy = %proxy, client = %client_addr, error = %e, "Upstream dial failed");
                        return;
                    }
                };
                let _established = links.establish();
                for conn in [&client, &upstream_conn] {
                    if let Err(e) = conn.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                }
                Link::new(proxy, client_addr, client, upstream_conn, toxics, config, cancel)
                    .run()
                    .await;
            });
        }
        debug!(proxy = %self.proxy, "Accept loop stopped");
        // The listener is dropped here, releasing the port.
    }
}

async fn dial(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::UpstreamUnreachable {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::UpstreamUnreachable {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Direction, ToxicSpec};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    /// Bind a TCP listener, returning `None` if the environment disallows it.
    async fn tcp_listener_or_skip(addr: &str) -> Option<TcpListener> {
        match TcpListener::bind(addr).await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    /// Get a free port by binding to port 0.
    async fn get_free_port() -> Option<SocketAddr> {
        let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
        Some(listener.local_addr().unwrap())
    }

    /// Echo server accepting any number of connections.
    async fn spawn_echo() -> Option<SocketAddr> {
        let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        Some(addr)
    }

    fn options() -> ProxyOptions {
        ProxyOptions {
            connect_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
            ..ProxyOptions::default()
        }
    }

    /// A started proxy on an ephemeral port in front of `upstream`.
    async fn started_proxy(upstream: SocketAddr) -> Proxy {
        let spec = ProxySpec::new("test", "127.0.0.1:0", upstream.to_string());
        let proxy = Proxy::new(&spec, options());
        proxy.start().await.unwrap();
        proxy
    }

    // ========================================================================
    // Spec and Options Tests
    // ========================================================================

    #[test]
    fn test_proxy_options_default() {
        let options = ProxyOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.drain_timeout, Duration::from_secs(5));
        assert_eq!(options.read_buffer_size, 32 * 1024);
        assert_eq!(options.stage_buffer, 4);
    }

    #[test]
    fn test_proxy_spec_json_defaults() {
        let spec: ProxySpec =
            serde_json::from_str(r#"{"name": "db", "upstream": "127.0.0.1:5432"}"#).unwrap();
        assert_eq!(spec.listen, "127.0.0.1:0");
        assert_eq!(spec.enabled, None);
    }

    #[test]
    fn test_proxy_spec_validate() {
        assert!(ProxySpec::new("a", "127.0.0.1:0", "127.0.0.1:1").validate().is_ok());
        assert!(ProxySpec::new("", "127.0.0.1:0", "127.0.0.1:1").validate().is_err());
        assert!(ProxySpec::new("a", "127.0.0.1:0", " ").validate().is_err());
    }

    #[test]
    fn test_bind_error_maps_addr_in_use() {
        let err = bind_error("127.0.0.1:1", io::Error::from(io::ErrorKind::AddrInUse));
        assert!(matches!(err, ProxyError::AddressInUse { .. }));
        let err = bind_error("127.0.0.1:1", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    // ========================================================================
    // Lifecycle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_new_proxy_is_stopped() {
        let proxy = Proxy::new(&ProxySpec::new("p", "127.0.0.1:0", "127.0.0.1:1"), options());
        assert!(!proxy.is_enabled());
        assert_eq!(proxy.listen_addr(), "127.0.0.1:0");
        assert_eq!(proxy.active_links(), 0);
    }

    #[tokio::test]
    async fn test_start_reports_bound_address() {
        let Some(upstream) = get_free_port().await else {
            return;
        };
        let proxy = started_proxy(upstream).await;
        assert!(proxy.is_enabled());
        let bound: SocketAddr = proxy.listen_addr().parse().unwrap();
        assert_ne!(bound.port(), 0);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_already_started() {
        let Some(upstream) = get_free_port().await else {
            return;
        };
        let proxy = started_proxy(upstream).await;
        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyStarted { .. }));
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_start_address_in_use() {
        let Some(held) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let addr = held.local_addr().unwrap().to_string();
        let proxy = Proxy::new(&ProxySpec::new("p", addr, "127.0.0.1:1"), options());
        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::AddressInUse { .. }), "got {err:?}");
        assert!(!proxy.is_enabled());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let proxy = Proxy::new(&ProxySpec::new("p", "127.0.0.1:0", "127.0.0.1:1"), options());
        // Before start
        proxy.stop().await;
        proxy.stop().await;

        let Some(upstream) = get_free_port().await else {
            return;
        };
        let proxy = started_proxy(upstream).await;
        for _ in 0..3 {
            proxy.stop().await;
            assert!(!proxy.is_enabled());
        }
    }

    #[tokio::test]
    async fn test_stop_releases_port_and_restart_works() {
        let Some(echo) = spawn_echo().await else {
            return;
        };
        let proxy = started_proxy(echo).await;
        let addr = proxy.listen_addr();
        proxy.stop().await;
        assert!(TcpStream::connect(&addr).await.is_err());

        proxy.start().await.unwrap();
        let mut client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        client.write_all(b"again").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_active_links() {
        let Some(echo) = spawn_echo().await else {
            return;
        };
        let proxy = started_proxy(echo).await;
        let mut client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(proxy.active_links(), 1);

        tokio::time::timeout(Duration::from_secs(3), proxy.stop())
            .await
            .expect("stop should drain links");
        assert_eq!(proxy.active_links(), 0);
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    // ========================================================================
    // Relay Tests
    // ========================================================================

    #[tokio::test]
    async fn test_two_writes_arrive_concatenated() {
        let Some(listener) = tcp_listener_or_skip("127.0.0.1:0").await else {
            return;
        };
        let upstream_addr = listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let proxy = started_proxy(upstream_addr).await;
        let mut client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        client.write_all(b"hello world").await.unwrap();
        client.write_all(b"hello world").await.unwrap();
        client.shutdown().await.unwrap();

        let received = upstream.await.unwrap();
        assert_eq!(received.len(), 22);
        assert_eq!(received, b"hello worldhello world");
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_64k_echo_unaltered() {
        let Some(echo) = spawn_echo().await else {
            return;
        };
        let proxy = started_proxy(echo).await;
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 256) as u8).collect();

        let client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        let (mut reader, mut writer) = client.into_split();
        let sent = payload.clone();
        tokio::spawn(async move {
            writer.write_all(&sent).await.unwrap();
        });

        let mut received = vec![0u8; payload.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_closes_client() {
        let Some(dead) = get_free_port().await else {
            return;
        };
        let proxy = started_proxy(dead).await;
        let mut client = TcpStream::connect(proxy.listen_addr()).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should not hang");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(proxy.is_enabled());
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_pending_dial_is_not_an_active_link() {
        // Unroutable: the dial either hangs until the timeout or fails fast.
        let blackhole: SocketAddr = "10.255.255.1:9".parse().unwrap();
        let spec = ProxySpec::new("test", "127.0.0.1:0", blackhole.to_string());
        let proxy = Proxy::new(
            &spec,
            ProxyOptions {
                connect_timeout: Duration::from_secs(30),
                ..options()
            },
        );
        if proxy.start().await.is_err() {
            return;
        }
        let _client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(proxy.active_links(), 0);

        tokio::time::timeout(Duration::from_secs(3), proxy.stop())
            .await
            .expect("stop should not wait for the dial timeout");
    }

    #[tokio::test]
    async fn test_downstream_latency() {
        let Some(echo) = spawn_echo().await else {
            return;
        };
        let proxy = started_proxy(echo).await;
        proxy
            .toxics()
            .add(
                ToxicSpec::new("slow", "latency", Direction::Downstream)
                    .with_attribute("latency", 100.0),
            )
            .unwrap();

        let mut client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        let mut buf = [0u8; 5];
        for message in [b"first", b"later"] {
            let start = Instant::now();
            client.write_all(message).await.unwrap();
            client.read_exact(&mut buf).await.unwrap();
            let elapsed = start.elapsed();
            assert_eq!(&buf, message);
            assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
            assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
        }
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_downstream_limit_data_closes_after_cap() {
        let Some(echo) = spawn_echo().await else {
            return;
        };
        let proxy = started_proxy(echo).await;
        proxy
            .toxics()
            .add(
                ToxicSpec::new("cap", "limit_data", Direction::Downstream)
                    .with_attribute("bytes", 100.0),
            )
            .unwrap();

        let client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        let (mut reader, mut writer) = client.into_split();
        tokio::spawn(async move {
            for _ in 0..10 {
                if writer.write_all(&[b'z'; 64]).await.is_err() {
                    break;
                }
            }
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Ok(n) = reader.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .expect("link should close after the cap");
        assert_eq!(received.len(), 100);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_toxic_churn_under_traffic() {
        let Some(echo) = spawn_echo().await else {
            return;
        };
        let proxy = Arc::new(started_proxy(echo).await);

        let churn = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                for i in 0..100 {
                    let direction = Direction::ALL[i % 2];
                    let name = format!("t{i}");
                    let spec = if i % 3 == 0 {
                        ToxicSpec::new(&name, "slicer", direction).with_attribute("average_size", 5.0)
                    } else {
                        ToxicSpec::new(&name, "latency", direction).with_attribute("latency", 1.0)
                    };
                    proxy.toxics().add(spec).unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    proxy.toxics().remove(direction, &name).unwrap();
                }
            })
        };

        let payload: Vec<u8> = (0..32 * 1024).map(|i| (i % 253) as u8).collect();
        let client = TcpStream::connect(proxy.listen_addr()).await.unwrap();
        let (mut reader, mut writer) = client.into_split();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            for piece in sent.chunks(512) {
                writer.write_all(piece).await.unwrap();
                tokio::time::sleep(Duration::from_micros(200)).await;
            }
        });

        let mut received = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut received))
            .await
            .expect("echo should complete")
            .unwrap();
        assert_eq!(received, payload);
        writer.await.unwrap();
        churn.await.unwrap();
        proxy.stop().await;
    }
}
