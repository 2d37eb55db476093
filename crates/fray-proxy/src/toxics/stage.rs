//! Per-connection execution of one toxic.
//!
//! A stage is a task sitting between two bounded channels. It receives
//! [`Frame`]s from the previous stage (or the read loop), applies its toxic
//! and forwards the result in order. Every wait (channel receive, channel
//! send, timer) also observes the link's cancellation token.
//!
//! A stage exits when:
//! - it forwarded a terminal frame (`Eof`, `Close`, `Reset`)
//! - its input closed without a terminal frame (the chain is being rebuilt)
//! - the next stage is gone, or the link was cancelled

use super::{DrawScope, ToxicKind, ToxicWrapper};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes read from the source in one read call.
#[derive(Debug)]
pub(crate) struct Chunk {
    pub data: Vec<u8>,
    /// When the read loop got the bytes. Latency is measured from here.
    pub read_at: Instant,
    /// Snapshot version the chunk was admitted under.
    pub version: u64,
}

/// Unit of traffic between stages.
#[derive(Debug)]
pub(crate) enum Frame {
    Data(Chunk),
    /// Source reached end of stream; half-close the destination.
    Eof,
    /// A toxic ended the link; close both sockets in an orderly way.
    Close,
    /// A toxic ended the link abruptly.
    Reset,
}

impl Frame {
    fn is_terminal(&self) -> bool {
        !matches!(self, Frame::Data(_))
    }
}

/// Toxic state that outlives a chain rebuild within one link direction.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageState {
    /// Connection-scoped toxicity draw.
    engaged: Option<bool>,
    /// When the toxic first ran on this link.
    started: Option<Instant>,
    /// Bytes forwarded so far (`limit_data`).
    forwarded: u64,
    /// Last frame that passed through (`timeout`).
    last_activity: Option<Instant>,
}

/// One toxic running on one link direction.
pub(crate) struct Stage {
    toxic: Arc<ToxicWrapper>,
    version: u64,
    state: StageState,
    input: mpsc::Receiver<Frame>,
    output: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl Stage {
    pub(crate) fn new(
        toxic: Arc<ToxicWrapper>,
        version: u64,
        state: StageState,
        input: mpsc::Receiver<Frame>,
        output: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            toxic,
            version,
            state,
            input,
            output,
            cancel,
        }
    }

    /// Run until exit, then hand back the state for the next chain, keyed
    /// by the toxic's serial.
    pub(crate) async fn run(mut self) -> (u64, StageState) {
        self.execute().await;
        (self.toxic.serial(), self.state)
    }

    async fn execute(&mut self) {
        let kind = self.toxic.kind();
        let toxicity = self.toxic.toxicity();
        let engaged = match kind.scope() {
            DrawScope::Connection => *self.state.engaged.get_or_insert_with(|| draw(toxicity)),
            DrawScope::Chunk => true,
        };
        let started = *self.state.started.get_or_insert_with(Instant::now);

        if !engaged {
            return self.passthrough().await;
        }
        match kind {
            ToxicKind::Timeout { timeout } if !timeout.is_zero() => {
                self.close_when_idle(timeout).await
            }
            ToxicKind::SlowClose { delay } => self.slow_close(delay).await,
            ToxicKind::ResetPeer { timeout } => {
                self.reset_at(deadline_after(started, timeout)).await
            }
            ToxicKind::LimitData { bytes } => self.limit(bytes).await,
            _ => self.per_chunk(kind).await,
        }
    }

    async fn recv(&mut self) -> Option<Frame> {
        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            frame = self.input.recv() => frame,
        };
        if let Some(Frame::Data(chunk)) = &frame {
            debug_assert_eq!(chunk.version, self.version, "chunk crossed into another chain");
        }
        frame
    }

    async fn send(&self, frame: Frame) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.output.send(frame) => sent.is_ok(),
        }
    }

    async fn sleep_until(&self, deadline: Instant) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }

    /// Forward one frame. Returns false when the stage should exit.
    async fn forward(&self, frame: Frame) -> bool {
        let terminal = frame.is_terminal();
        self.send(frame).await && !terminal
    }

    async fn passthrough(&mut self) {
        while let Some(frame) = self.recv().await {
            if !self.forward(frame).await {
                return;
            }
        }
    }

    async fn per_chunk(&mut self, kind: ToxicKind) {
        let mut next_release = Instant::now();
        while let Some(frame) = self.recv().await {
            let chunk = match frame {
                Frame::Data(chunk) => chunk,
                terminal => {
                    self.send(terminal).await;
                    return;
                }
            };
            let delivered = if draw(self.toxic.toxicity()) {
                match kind {
                    ToxicKind::Latency { latency, jitter } => {
                        self.delay(chunk, latency, jitter).await
                    }
                    ToxicKind::Bandwidth { rate_kbps } => {
                        self.throttle(chunk, rate_kbps, &mut next_release).await
                    }
                    ToxicKind::Slicer {
                        average_size,
                        size_variation,
                        delay,
                    } => self.slice(chunk, average_size, size_variation, delay).await,
                    _ => self.send(Frame::Data(chunk)).await,
                }
            } else {
                self.send(Frame::Data(chunk)).await
            };
            if !delivered {
                return;
            }
        }
    }

    async fn delay(&self, chunk: Chunk, latency: Duration, jitter: Duration) -> bool {
        let deadline = deadline_after(chunk.read_at, jittered(latency, jitter));
        self.sleep_until(deadline).await && self.send(Frame::Data(chunk)).await
    }

    async fn throttle(&self, chunk: Chunk, rate_kbps: u64, next_release: &mut Instant) -> bool {
        if rate_kbps == 0 {
            return self.send(Frame::Data(chunk)).await;
        }
        let bytes_per_sec = rate_kbps.saturating_mul(1_000);
        // Release at most 100ms worth of bytes at a time.
        let piece_size = usize::try_from(bytes_per_sec / 10)
            .unwrap_or(usize::MAX)
            .max(1);

        let Chunk {
            data,
            read_at,
            version,
        } = chunk;
        for piece in data.chunks(piece_size) {
            let cost = Duration::from_secs_f64(piece.len() as f64 / bytes_per_sec as f64);
            *next_release = deadline_after((*next_release).max(Instant::now()), cost);
            if !self.sleep_until(*next_release).await {
                return false;
            }
            let piece = Chunk {
                data: piece.to_vec(),
                read_at,
                version,
            };
            if !self.send(Frame::Data(piece)).await {
                return false;
            }
        }
        true
    }

    async fn slice(
        &self,
        chunk: Chunk,
        average_size: usize,
        size_variation: usize,
        delay: Duration,
    ) -> bool {
        if average_size == 0 {
            return self.send(Frame::Data(chunk)).await;
        }
        let sizes = slice_sizes(chunk.data.len(), average_size, size_variation);
        let mut offset = 0;
        for (i, size) in sizes.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                let resume = deadline_after(Instant::now(), delay);
                if !self.sleep_until(resume).await {
                    return false;
                }
            }
            let piece = Chunk {
                data: chunk.data[offset..offset + size].to_vec(),
                read_at: chunk.read_at,
                version: chunk.version,
            };
            offset += size;
            if !self.send(Frame::Data(piece)).await {
                return false;
            }
        }
        true
    }

    /// The idle window survives chain rebuilds: it starts at the last frame
    /// seen by this toxic on this link, not when the stage was spawned.
    async fn close_when_idle(&mut self, timeout: Duration) {
        loop {
            let idle_since = *self.state.last_activity.get_or_insert_with(Instant::now);
            let deadline = deadline_after(idle_since, timeout);
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                frame = self.input.recv() => frame,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(toxic = %self.toxic.name(), "Idle timeout reached, closing link");
                    self.send(Frame::Close).await;
                    return;
                }
            };
            let Some(frame) = frame else {
                return;
            };
            self.state.last_activity = Some(Instant::now());
            if !self.forward(frame).await {
                return;
            }
        }
    }

    async fn slow_close(&mut self, delay: Duration) {
        while let Some(frame) = self.recv().await {
            if matches!(frame, Frame::Eof | Frame::Close)
                && !self.sleep_until(deadline_after(Instant::now(), delay)).await
            {
                return;
            }
            if !self.forward(frame).await {
                return;
            }
        }
    }

    async fn reset_at(&mut self, deadline: Instant) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(toxic = %self.toxic.name(), "Resetting link");
                    self.send(Frame::Reset).await;
                    return;
                }
                frame = self.input.recv() => frame,
            };
            match frame {
                Some(frame) => {
                    if !self.forward(frame).await {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    async fn limit(&mut self, bytes: u64) {
        if self.state.forwarded >= bytes {
            self.send(Frame::Close).await;
            return;
        }
        while let Some(frame) = self.recv().await {
            let mut chunk = match frame {
                Frame::Data(chunk) => chunk,
                terminal => {
                    self.send(terminal).await;
                    return;
                }
            };
            let remaining = bytes - self.state.forwarded;
            let reached = chunk.data.len() as u64 >= remaining;
            if reached {
                // remaining <= len here, so it fits in usize
                chunk.data.truncate(remaining as usize);
            }
            self.state.forwarded += chunk.data.len() as u64;
            if !self.send(Frame::Data(chunk)).await {
                return;
            }
            if reached {
                debug!(toxic = %self.toxic.name(), bytes, "Data limit reached, closing link");
                self.send(Frame::Close).await;
                return;
            }
        }
    }
}

/// `from + delay`, or a point decades away when that overflows.
fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay).unwrap_or_else(far_future)
}

fn far_future() -> Instant {
    // Roughly 30 years, same horizon tokio uses for an unbounded sleep.
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

/// Draw against a toxicity probability.
fn draw(toxicity: f64) -> bool {
    if toxicity >= 1.0 {
        true
    } else if toxicity <= 0.0 {
        false
    } else {
        rand::thread_rng().gen::<f64>() < toxicity
    }
}

fn jittered(latency: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return latency;
    }
    let spread = jitter.as_secs_f64();
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    Duration::try_from_secs_f64((latency.as_secs_f64() + offset).max(0.0)).unwrap_or(latency)
}

fn slice_sizes(len: usize, average_size: usize, size_variation: usize) -> Vec<usize> {
    let mut rng = rand::thread_rng();
    let mut sizes = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        let size = if size_variation == 0 {
            average_size
        } else {
            rng.gen_range(
                average_size.saturating_sub(size_variation)
                    ..=average_size.saturating_add(size_variation),
            )
        };
        let size = size.clamp(1, remaining);
        sizes.push(size);
        remaining -= size;
    }
    sizes
}
