//! Backend half of the bridge: reads frames, runs calls and stream
//! producers, and writes their results back in production order.

use super::service::Router;
use super::wire::{Frame, FrameReader, FrameWriter};
use super::BridgeError;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Registry = Arc<Mutex<HashMap<u64, CancellationToken>>>;

fn registry_insert(registry: &Registry, id: u64, token: CancellationToken) {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(id, token);
}

fn registry_remove(registry: &Registry, id: u64) -> Option<CancellationToken> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&id)
}

pub struct BridgeServer {
    router: Router,
}

struct Session {
    router: Router,
    out: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    calls: Registry,
    streams: Registry,
}

impl BridgeServer {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Serves one peer until its input closes or `shutdown` fires. Every
    /// outstanding call and stream producer is cancelled and joined before
    /// this returns.
    pub async fn serve<R, W>(&self, reader: R, writer: W, shutdown: CancellationToken)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out, mut outgoing) = mpsc::unbounded_channel::<Frame>();
        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(frame) = outgoing.recv().await {
                if let Err(err) = writer.write_frame(&frame).await {
                    warn!(error = %err, "Bridge writer failed");
                    break;
                }
            }
        });

        let session = Session {
            router: self.router.clone(),
            out,
            cancel: shutdown.child_token(),
            calls: Arc::default(),
            streams: Arc::default(),
        };
        let mut tasks = JoinSet::new();
        let mut frames = FrameReader::new(BufReader::new(reader));

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                frame = frames.next_frame() => match frame {
                    Ok(Some(frame)) => session.dispatch(frame, &mut tasks),
                    Ok(None) => {
                        debug!("Bridge peer closed its input");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "Bridge reader failed");
                        break;
                    }
                },
            }
        }

        session.cancel.cancel();
        while tasks.join_next().await.is_some() {}
        drop(session);
        let _ = writer_task.await;
    }
}

impl Session {
    fn dispatch(&self, frame: Frame, tasks: &mut JoinSet<()>) {
        match frame {
            Frame::Call { id, method, params } => self.start_call(id, method, params, tasks),
            Frame::Cancel { id } => {
                if let Some(token) = registry_remove(&self.calls, id) {
                    token.cancel();
                }
            }
            Frame::OpenStream { id, method, params } => {
                self.start_stream(id, method, params, tasks)
            }
            Frame::StopStream { id } => match registry_remove(&self.streams, id) {
                Some(token) => token.cancel(),
                // Already finished: acknowledge so the consumer's stop resolves.
                None => {
                    let _ = self.out.send(Frame::Stopped { id });
                }
            },
            other => warn!(frame = ?other, "Ignoring unexpected bridge frame"),
        }
    }

    fn start_call(&self, id: u64, method: String, params: Value, tasks: &mut JoinSet<()>) {
        let token = self.cancel.child_token();
        registry_insert(&self.calls, id, token.clone());
        let router = self.router.clone();
        let out = self.out.clone();
        let calls = self.calls.clone();
        tasks.spawn(async move {
            debug!(call_id = id, method = %method, "Bridge call started");
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(BridgeError::aborted()),
                result = router.call(&method, params, token.clone()) => result,
            };
            registry_remove(&calls, id);
            let frame = match result {
                Ok(value) => Frame::Reply { id, value },
                Err(error) => Frame::Fault { id, error },
            };
            let _ = out.send(frame);
        });
    }

    fn start_stream(&self, id: u64, method: String, params: Value, tasks: &mut JoinSet<()>) {
        let token = self.cancel.child_token();
        registry_insert(&self.streams, id, token.clone());
        let router = self.router.clone();
        let out = self.out.clone();
        let streams = self.streams.clone();
        tasks.spawn(async move {
            debug!(stream_id = id, method = %method, "Bridge stream opened");
            let mut source = match router.open_stream(&method, params) {
                Ok(source) => source,
                Err(error) => {
                    registry_remove(&streams, id);
                    let _ = out.send(Frame::Failed { id, error });
                    return;
                }
            };
            loop {
                let pulled = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    item = source.next() => Some(item),
                };
                let Some(item) = pulled else {
                    // Subscriptions must be gone before the consumer hears back.
                    drop(source);
                    registry_remove(&streams, id);
                    debug!(stream_id = id, "Bridge stream stopped by consumer");
                    let _ = out.send(Frame::Stopped { id });
                    return;
                };
                match item {
                    Some(Ok(value)) => {
                        let _ = out.send(Frame::Item { id, value });
                    }
                    Some(Err(error)) => {
                        let _ = out.send(Frame::Failed { id, error });
                        break;
                    }
                    None => {
                        let _ = out.send(Frame::End { id });
                        break;
                    }
                }
            }
            drop(source);
            registry_remove(&streams, id);
        });
    }
}
