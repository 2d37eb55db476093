//! Links: one accepted client paired with its dialed upstream.

use crate::collection::ToxicCollection;
use crate::stream::{Stream, StreamConfig, StreamEnd};
use crate::Direction;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Both directions of one proxied connection.
///
/// The link owns both sockets. Its streams borrow the halves, and every
/// task that belongs to the link observes the same cancellation token.
pub(crate) struct Link {
    proxy: String,
    client_addr: SocketAddr,
    client: TcpStream,
    upstream: TcpStream,
    toxics: Arc<ToxicCollection>,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl Link {
    pub(crate) fn new(
        proxy: String,
        client_addr: SocketAddr,
        client: TcpStream,
        upstream: TcpStream,
        toxics: Arc<ToxicCollection>,
        config: StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            proxy,
            client_addr,
            client,
            upstream,
            toxics,
            config,
            cancel,
        }
    }

    /// Relay until both streams finish or the link is cancelled.
    pub(crate) async fn run(self) {
        let Link {
            proxy,
            client_addr,
            mut client,
            mut upstream,
            toxics,
            config,
            cancel,
        } = self;
        // Cancels stages and the sibling stream however this future ends.
        let _guard = cancel.clone().drop_guard();

        debug!(proxy = %proxy, client = %client_addr, "Link opened");
        let reset = {
            let (client_read, client_write) = client.split();
            let (upstream_read, upstream_write) = upstream.split();
            let to_upstream = Stream::new(Direction::Upstream, &toxics, config, cancel.clone());
            let to_client = Stream::new(Direction::Downstream, &toxics, config, cancel.clone());

            let (up, down) = tokio::join!(
                to_upstream.run(client_read, upstream_write),
                to_client.run(upstream_read, client_write)
            );
            for (direction, end) in [(Direction::Upstream, &up), (Direction::Downstream, &down)] {
                if let StreamEnd::WriteFailed(e) = end {
                    debug!(proxy = %proxy, client = %client_addr, %direction, error = %e, "Write failed");
                }
            }
            debug!(
                proxy = %proxy,
                client = %client_addr,
                upstream = ?up,
                downstream = ?down,
                "Link closed"
            );
            matches!(up, StreamEnd::Reset) || matches!(down, StreamEnd::Reset)
        };

        if reset {
            abort_on_close(&client);
            abort_on_close(&upstream);
        }
    }
}

/// Make the next close send RST instead of FIN.
fn abort_on_close(stream: &TcpStream) {
    if let Err(e) = socket2::SockRef::from(stream).set_linger(Some(Duration::ZERO)) {
        debug!(error = %e, "Failed to set SO_LINGER");
    }
}

struct ActiveLink {
    client: SocketAddr,
    abort: AbortHandle,
}

/// Tasks of a proxy's live links, drained on stop.
///
/// A task is tracked from accept, so `drain` also covers dials still in
/// progress. It only counts as an established link once it holds an
/// [`Established`] guard.
pub(crate) struct LinkSet {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, ActiveLink>>,
    established: AtomicUsize,
    tracker: TaskTracker,
}

/// Marks one link as relaying. Dropped when its task ends or is aborted.
pub(crate) struct Established(Arc<LinkSet>);

impl Drop for Established {
    fn drop(&mut self) {
        self.0.established.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LinkSet {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            active: Mutex::new(HashMap::new()),
            established: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn the task serving `client`. It deregisters itself when done.
    pub(crate) fn spawn<F>(self: &Arc<Self>, client: SocketAddr, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let set = Arc::clone(self);
        // Held across the spawn so the task cannot deregister before it is registered.
        let mut active = self.lock();
        let handle = self.tracker.spawn(async move {
            task.await;
            set.lock().remove(&id);
        });
        active.insert(
            id,
            ActiveLink {
                client,
                abort: handle.abort_handle(),
            },
        );
    }

    /// Number of tracked tasks, dialing or relaying.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Count the calling task as an established link until the guard drops.
    pub(crate) fn establish(self: &Arc<Self>) -> Established {
        self.established.fetch_add(1, Ordering::AcqRel);
        Established(Arc::clone(self))
    }

    /// Number of links whose upstream dial succeeded and that are still running.
    pub(crate) fn established(&self) -> usize {
        self.established.load(Ordering::Acquire)
    }

    /// Wait for every link to finish, aborting whatever is left after `grace`.
    /// Links must already have been cancelled.
    pub(crate) async fn drain(&self, grace: Duration) {
        debug!(
            tasks = self.len(),
            established = self.established(),
            "Draining links"
        );
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            let stragglers: Vec<(u64, ActiveLink)> = self.lock().drain().collect();
            for (id, link) in stragglers {
                warn!(link = id, client = %link.client, "Link did not drain in time, aborting");
                link.abort.abort();
            }
            self.tracker.wait().await;
        }
        self.lock().clear();
        self.tracker.reopen();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ActiveLink>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToxicSpec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CONFIG: StreamConfig = StreamConfig {
        read_buffer: 4096,
        stage_buffer: 4,
    };

    async fn tcp_listener_or_skip(addr: &str) -> Option<TcpListener> {
        match TcpListener::bind(addr).await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    /// A connected (local, remote) socket pair over loopback.
    async fn socket_pair() -> Option<(TcpStream, TcpStream)> {
        let listener = tcp_listener_or_skip("127.0.0.1:0").await?;
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        Some((connected.unwrap(), accepted.unwrap().0))
    }

    /// (test client, test upstream, link task) with a link in between.
    async fn spawn_link(
        toxics: Arc<ToxicCollection>,
        cancel: CancellationToken,
    ) -> Option<(TcpStream, TcpStream, tokio::task::JoinHandle<()>)> {
        let (client, proxied_client) = socket_pair().await?;
        let (proxied_upstream, upstream) = socket_pair().await?;
        let client_addr = client.local_addr().unwrap();
        let link = Link::new(
            "test".to_string(),
            client_addr,
            proxied_client,
            proxied_upstream,
            toxics,
            CONFIG,
            cancel,
        );
        Some((client, upstream, tokio::spawn(link.run())))
    }

    // ========================================================================
    // Link Tests
    // ========================================================================

    #[tokio::test]
    async fn test_link_relays_both_directions() {
        let toxics = Arc::new(ToxicCollection::new());
        let Some((mut client, mut upstream, handle)) =
            spawn_link(toxics, CancellationToken::new()).await
        else {
            return;
        };

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        client.shutdown().await.unwrap();
        upstream.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("link should end after both sides close")
            .unwrap();
    }

    #[tokio::test]
    async fn test_link_half_close_keeps_other_direction() {
        let toxics = Arc::new(ToxicCollection::new());
        let Some((mut client, mut upstream, _handle)) =
            spawn_link(toxics, CancellationToken::new()).await
        else {
            return;
        };

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        upstream.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        upstream.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");
    }

    #[tokio::test]
    async fn test_link_cancel_closes_both_sockets() {
        let toxics = Arc::new(ToxicCollection::new());
        let cancel = CancellationToken::new();
        let Some((mut client, mut upstream, handle)) = spawn_link(toxics, cancel.clone()).await
        else {
            return;
        };

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("link should end on cancel")
            .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_link_reset_peer_resets_client() {
        let toxics = Arc::new(ToxicCollection::new());
        toxics
            .add(ToxicSpec::new("rst", "reset_peer", Direction::Downstream))
            .unwrap();
        let Some((mut client, _upstream, handle)) =
            spawn_link(toxics, CancellationToken::new()).await
        else {
            return;
        };

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("link should end on reset")
            .unwrap();

        let mut buf = [0u8; 1];
        match client.read(&mut buf).await {
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            Ok(n) => panic!("expected a reset, read {n} bytes"),
        }
    }

    // ========================================================================
    // LinkSet Tests
    // ========================================================================

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_link_set_deregisters_finished_tasks() {
        let links = Arc::new(LinkSet::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        links.spawn(addr(), async move {
            let _ = rx.await;
        });
        assert_eq!(links.len(), 1);

        tx.send(()).unwrap();
        links.drain(Duration::from_secs(1)).await;
        assert_eq!(links.len(), 0);
    }

    #[tokio::test]
    async fn test_link_set_drain_aborts_stragglers() {
        let links = Arc::new(LinkSet::new());
        links.spawn(addr(), std::future::pending());
        links.spawn(addr(), std::future::pending());
        assert_eq!(links.len(), 2);

        tokio::time::timeout(Duration::from_secs(2), links.drain(Duration::from_millis(50)))
            .await
            .expect("drain should be bounded by the grace period");
        assert_eq!(links.len(), 0);
    }

    #[tokio::test]
    async fn test_link_set_counts_only_established_links() {
        let links = Arc::new(LinkSet::new());
        let (dialed_tx, dialed_rx) = tokio::sync::oneshot::channel::<()>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let set = Arc::clone(&links);
        links.spawn(addr(), async move {
            let _ = dialed_rx.await;
            let _established = set.establish();
            let _ = done_rx.await;
        });
        links.spawn(addr(), std::future::pending());

        tokio::task::yield_now().await;
        assert_eq!(links.len(), 2);
        assert_eq!(links.established(), 0);

        dialed_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while links.established() != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("link should be counted once established");

        done_tx.send(()).unwrap();
        links.drain(Duration::from_millis(50)).await;
        assert_eq!(links.established(), 0);
    }

    #[tokio::test]
    async fn test_link_set_reusable_after_drain() {
        let links = Arc::new(LinkSet::new());
        links.drain(Duration::from_millis(10)).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        links.spawn(addr(), async move {
            tx.send(()).unwrap();
        });
        rx.await.unwrap();
    }
}
