//! One direction of a link.
//!
//! ```text
//! source --read--> [stage 1] --> [stage 2] --> ... --> sink --write--> destination
//!           ^          bounded channels (stage_buffer)
//!           |
//!   ToxicCollection snapshot, re-checked between chunks
//! ```
//!
//! The read loop tags every chunk with the version of the chain it enters.
//! When the collection publishes a new version, the read loop stops
//! admitting chunks, closes the old pipeline's input, waits for every old
//! stage to flush and exit, then builds the new pipeline in front of the
//! same sink. The sink therefore sees all of the old chain's output before
//! any of the new chain's.

use crate::collection::{ToxicChain, ToxicCollection};
use crate::toxics::{Chunk, Frame, Stage, StageState};
use crate::Direction;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Buffer sizes for one stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamConfig {
    /// Largest chunk taken from the source in one read.
    pub read_buffer: usize,
    /// Capacity of each channel between stages.
    pub stage_buffer: usize,
}

/// How a stream finished.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    /// The source ended and the destination was half-closed.
    Eof,
    /// A toxic closed the link.
    Closed,
    /// A toxic reset the link.
    Reset,
    /// The link was cancelled elsewhere.
    Cancelled,
    /// Writing to the destination failed.
    WriteFailed(io::Error),
}

pub(crate) struct Stream<'a> {
    direction: Direction,
    toxics: &'a ToxicCollection,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl<'a> Stream<'a> {
    pub(crate) fn new(
        direction: Direction,
        toxics: &'a ToxicCollection,
        config: StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            direction,
            toxics,
            config,
            cancel,
        }
    }

    /// Relay `source` into `destination` until the stream finishes.
    pub(crate) async fn run<R, W>(self, source: R, destination: W) -> StreamEnd
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (sink, frames) = mpsc::channel(self.config.stage_buffer.max(1));
        let ((), end) = tokio::join!(
            self.read_loop(source, sink),
            write_loop(destination, frames, &self.cancel)
        );
        end
    }

    async fn read_loop<R>(&self, mut source: R, sink: mpsc::Sender<Frame>)
    where
        R: AsyncRead + Unpin,
    {
        let mut changes = self.toxics.subscribe(self.direction);
        let mut chain = self.toxics.snapshot(self.direction);
        let mut pipeline = Pipeline::build(&chain, HashMap::new(), &sink, self.config, &self.cancel);
        let mut buf = vec![0u8; self.config.read_buffer.max(1)];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Ok(()) = changes.changed() => None,
                read = source.read(&mut buf) => Some(read),
            };

            let current = self.toxics.snapshot(self.direction);
            if current.version() != chain.version() {
                debug!(
                    direction = %self.direction,
                    from = chain.version(),
                    to = current.version(),
                    "Rebuilding toxic chain"
                );
                let states = pipeline.drain().await;
                pipeline = Pipeline::build(&current, states, &sink, self.config, &self.cancel);
                chain = current;
            }

            let frame = match read {
                None => continue,
                Some(Ok(0)) => Frame::Eof,
                Some(Ok(n)) => Frame::Data(Chunk {
                    data: buf[..n].to_vec(),
                    read_at: Instant::now(),
                    version: chain.version(),
                }),
                Some(Err(e)) => {
                    debug!(direction = %self.direction, error = %e, "Source read failed");
                    Frame::Eof
                }
            };
            let terminal = matches!(frame, Frame::Eof);
            if !pipeline.push(frame, &self.cancel).await || terminal {
                break;
            }
        }
        pipeline.drain().await;
    }
}

/// The stage tasks of one chain version.
struct Pipeline {
    input: mpsc::Sender<Frame>,
    stages: Vec<JoinHandle<(u64, StageState)>>,
}

impl Pipeline {
    /// Spawn one stage per enabled toxic, wired back to front into `sink`.
    /// Stages pick up the state their toxic had in the previous chain. State
    /// is matched by serial, so a removed and re-added toxic starts fresh.
    fn build(
        chain: &ToxicChain,
        mut states: HashMap<u64, StageState>,
        sink: &mpsc::Sender<Frame>,
        config: StreamConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let mut output = sink.clone();
        let mut stages = Vec::new();
        for toxic in chain.enabled().rev() {
            let (input, frames) = mpsc::channel(config.stage_buffer.max(1));
            let state = states.remove(&toxic.serial()).unwrap_or_default();
            let stage = Stage::new(
                Arc::clone(toxic),
                chain.version(),
                state,
                frames,
                output,
                cancel.clone(),
            );
            stages.push(tokio::spawn(stage.run()));
            output = input;
        }
        Self {
            input: output,
            stages,
        }
    }

    /// Hand a frame to the first stage. False when the pipeline is gone.
    async fn push(&self, frame: Frame, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            sent = self.input.send(frame) => sent.is_ok(),
        }
    }

    /// Close the input and wait for every stage to flush and exit.
    async fn drain(self) -> HashMap<u64, StageState> {
        drop(self.input);
        let mut states = HashMap::new();
        for stage in self.stages {
            match stage.await {
                Ok((serial, state)) => {
                    states.insert(serial, state);
                }
                Err(e) => debug!(error = %e, "Toxic stage ended abnormally"),
            }
        }
        states
    }
}

async fn write_loop<W>(
    mut destination: W,
    mut frames: mpsc::Receiver<Frame>,
    cancel: &CancellationToken,
) -> StreamEnd
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            frame = frames.recv() => frame,
        };
        match frame {
            Some(Frame::Data(chunk)) => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return StreamEnd::Cancelled,
                    written = destination.write_all(&chunk.data) => written,
                };
                if let Err(e) = written {
                    cancel.cancel();
                    return StreamEnd::WriteFailed(e);
                }
            }
            Some(Frame::Eof) => {
                if let Err(e) = destination.shutdown().await {
                    debug!(error = %e, "Half-close failed");
                }
                return StreamEnd::Eof;
            }
            Some(Frame::Close) => {
                if let Err(e) = destination.shutdown().await {
                    debug!(error = %e, "Close failed");
                }
                cancel.cancel();
                return StreamEnd::Closed;
            }
            Some(Frame::Reset) => {
                cancel.cancel();
                return StreamEnd::Reset;
            }
            None => return StreamEnd::Cancelled,
        }
    }
}
