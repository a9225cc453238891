//! UI half of the bridge: issues calls and pulls remote streams.

use super::wire::{Frame, FrameReader, FrameWriter};
use super::BridgeError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type PendingCall = oneshot::Sender<Result<Value, BridgeError>>;

#[derive(Debug)]
enum StreamFrame {
    Item(Value),
    End,
    Failed(BridgeError),
    Stopped,
}

#[derive(Default)]
struct Shared {
    next_id: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, PendingCall>>,
    streams: Mutex<HashMap<u64, mpsc::UnboundedSender<StreamFrame>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn route(&self, frame: Frame) {
        let (id, stream_frame, terminal) = match frame {
            Frame::Reply { id, value } => {
                self.resolve(id, Ok(value));
                return;
            }
            Frame::Fault { id, error } => {
                self.resolve(id, Err(error));
                return;
            }
            Frame::Item { id, value } => (id, StreamFrame::Item(value), false),
            Frame::End { id } => (id, StreamFrame::End, true),
            Frame::Failed { id, error } => (id, StreamFrame::Failed(error), true),
            Frame::Stopped { id } => (id, StreamFrame::Stopped, true),
            other => {
                warn!(frame = ?other, "Ignoring unexpected bridge frame");
                return;
            }
        };
        let mut streams = locked(&self.streams);
        let sender = if terminal {
            streams.remove(&id)
        } else {
            streams.get(&id).cloned()
        };
        drop(streams);
        match sender {
            Some(sender) => {
                let _ = sender.send(stream_frame);
            }
            None => debug!(stream_id = id, "Dropping frame for released stream"),
        }
    }

    fn resolve(&self, id: u64, result: Result<Value, BridgeError>) {
        match locked(&self.pending).remove(&id) {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => debug!(call_id = id, "Dropping reply for abandoned call"),
        }
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, sender) in locked(&self.pending).drain() {
            let _ = sender.send(Err(BridgeError::disconnected()));
        }
        // Dropping the senders ends every open stream with a disconnect.
        locked(&self.streams).clear();
    }
}

#[derive(Clone)]
pub struct BridgeClient {
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<Frame>,
}

impl BridgeClient {
    /// Starts the frame reader and writer tasks over the given byte pipes.
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let (out, mut outgoing) = mpsc::unbounded_channel::<Frame>();

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(frame) = outgoing.recv().await {
                if let Err(err) = writer.write_frame(&frame).await {
                    warn!(error = %err, "Bridge writer failed");
                    writer_shared.disconnect();
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut frames = FrameReader::new(BufReader::new(reader));
            loop {
                match frames.next_frame().await {
                    Ok(Some(frame)) => reader_shared.route(frame),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "Bridge reader failed");
                        break;
                    }
                }
            }
            debug!("Bridge backend closed");
            reader_shared.disconnect();
        });

        Self { shared, out }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::disconnected());
        }
        self.out
            .send(frame)
            .map_err(|_| BridgeError::disconnected())
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.call_with_cancel(method, params, None).await
    }

    /// Like [`BridgeClient::call`]; firing `cancel` tells the backend to
    /// abandon the work and resolves this call with an aborted error.
    pub async fn call_with_cancel(
        &self,
        method: &str,
        params: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, BridgeError> {
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        locked(&self.shared.pending).insert(id, tx);
        if let Err(err) = self.send(Frame::Call {
            id,
            method: method.to_string(),
            params,
        }) {
            locked(&self.shared.pending).remove(&id);
            return Err(err);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => {
                locked(&self.shared.pending).remove(&id);
                let _ = self.send(Frame::Cancel { id });
                Err(BridgeError::aborted())
            }
            result = rx => result.unwrap_or_else(|_| Err(BridgeError::disconnected())),
        }
    }

    pub async fn call_as<P, R>(&self, method: &str, params: &P) -> Result<R, BridgeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = super::service::encode_value(params)?;
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|err| {
            BridgeError::new(
                super::ErrorKind::ProtocolGuard,
                format!("unexpected reply to {method}: {err}"),
            )
        })
    }

    /// Prepares a remote stream. Nothing is sent until the first pull.
    pub fn open_stream(&self, method: &str, params: Value) -> RemoteStream {
        RemoteStream {
            client: self.clone(),
            id: self.shared.next_id(),
            state: RemoteState::Unopened {
                method: method.to_string(),
                params,
            },
        }
    }
}

enum RemoteState {
    Unopened { method: String, params: Value },
    Open(mpsc::UnboundedReceiver<StreamFrame>),
    Done,
}

pub struct RemoteStream {
    client: BridgeClient,
    id: u64,
    state: RemoteState,
}

impl RemoteStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, RemoteState::Done)
    }

    fn open(&mut self) -> Result<(), BridgeError> {
        if !matches!(self.state, RemoteState::Unopened { .. }) {
            return Ok(());
        }
        let RemoteState::Unopened { method, params } =
            std::mem::replace(&mut self.state, RemoteState::Done)
        else {
            return Ok(());
        };
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&self.client.shared.streams).insert(self.id, tx);
        if let Err(err) = self.client.send(Frame::OpenStream {
            id: self.id,
            method,
            params,
        }) {
            locked(&self.client.shared.streams).remove(&self.id);
            return Err(err);
        }
        self.state = RemoteState::Open(rx);
        Ok(())
    }

    /// Next value in production order, a terminal error, or `None` once the
    /// stream has ended or been stopped.
    pub async fn next(&mut self) -> Option<Result<Value, BridgeError>> {
        if let Err(err) = self.open() {
            return Some(Err(err));
        }
        let RemoteState::Open(rx) = &mut self.state else {
            return None;
        };
        let frame = rx.recv().await;
        match frame {
            Some(StreamFrame::Item(value)) => Some(Ok(value)),
            Some(StreamFrame::Failed(err)) => {
                self.state = RemoteState::Done;
                Some(Err(err))
            }
            Some(StreamFrame::End) | Some(StreamFrame::Stopped) => {
                self.state = RemoteState::Done;
                None
            }
            None => {
                self.state = RemoteState::Done;
                Some(Err(BridgeError::disconnected()))
            }
        }
    }

    pub async fn next_as<T: DeserializeOwned>(&mut self) -> Option<Result<T, BridgeError>> {
        let value = match self.next().await? {
            Ok(value) => value,
            Err(err) => return Some(Err(err)),
        };
        Some(serde_json::from_value(value).map_err(|err| {
            BridgeError::new(
                super::ErrorKind::ProtocolGuard,
                format!("unexpected stream value: {err}"),
            )
        }))
    }

    /// Stops the producer and waits for it to acknowledge. Stopping an
    /// unopened stream sends nothing. Idempotent.
    pub async fn stop(&mut self) {
        match std::mem::replace(&mut self.state, RemoteState::Done) {
            RemoteState::Unopened { .. } | RemoteState::Done => {}
            RemoteState::Open(mut rx) => {
                if self.client.send(Frame::StopStream { id: self.id }).is_err() {
                    locked(&self.client.shared.streams).remove(&self.id);
                    return;
                }
                while let Some(frame) = rx.recv().await {
                    if !matches!(frame, StreamFrame::Item(_)) {
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        if let RemoteState::Open(_) = self.state {
            locked(&self.client.shared.streams).remove(&self.id);
            let _ = self.client.send(Frame::StopStream { id: self.id });
        }
    }
}
