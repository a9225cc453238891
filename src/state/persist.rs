//! Write-through persistence for a [`StateContainer`].
//!
//! Each store is a single MessagePack file, `<dir>/<name>.msgpack`, holding
//! the full state. Transitions are encoded synchronously in commit order and
//! written by one background task, so the file always converges on the
//! latest committed state. Write failures are logged and never interrupt
//! in-memory operation.

use super::container::StateContainer;
use super::projection::Subscription;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

const STORE_EXTENSION: &str = "msgpack";

enum WriteCommand {
    Write(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

pub struct PersistentContainer<T> {
    container: StateContainer<T>,
    path: PathBuf,
    writer: mpsc::UnboundedSender<WriteCommand>,
    _write_through: Subscription,
}

pub fn store_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{STORE_EXTENSION}"))
}

fn load_store<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|err| Error::Persistence(err.to_string()))?;
    rmp_serde::from_slice(&bytes)
        .map(Some)
        .map_err(|err| Error::Persistence(err.to_string()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Some(dir) = parent {
        fs::create_dir_all(dir).map_err(|err| Error::Persistence(err.to_string()))?;
    }
    let mut temp_file = match parent {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .map_err(|err| Error::Persistence(err.to_string()))?;
    temp_file
        .write_all(bytes)
        .and_then(|_| temp_file.as_file_mut().sync_all())
        .map_err(|err| Error::Persistence(err.to_string()))?;
    temp_file
        .persist(path)
        .map_err(|err| Error::Persistence(err.to_string()))?;
    Ok(())
}

async fn write_loop(path: PathBuf, mut commands: mpsc::UnboundedReceiver<WriteCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Write(bytes) => {
                let target = path.clone();
                let outcome = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
                    .await
                    .unwrap_or_else(|err| Err(Error::Persistence(err.to_string())));
                match outcome {
                    Ok(()) => debug!(path = %path.display(), "Persisted state store"),
                    Err(err) => error!(path = %path.display(), error = %err, "State store write failed"),
                }
            }
            WriteCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl<T> PersistentContainer<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens the named store, seeding it from disk or from `default`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(dir: impl AsRef<Path>, name: &str, default: T) -> Self {
        let path = store_path(dir.as_ref(), name);
        let initial = match load_store::<T>(&path) {
            Ok(Some(state)) => state,
            Ok(None) => default,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Discarding unreadable state store");
                default
            }
        };

        let container = StateContainer::new(initial);
        let (writer, commands) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), commands));

        let sink = writer.clone();
        let store = path.clone();
        let write_through = container.subscribe(move |transition| {
            match rmp_serde::to_vec_named(&*transition.next) {
                Ok(bytes) => {
                    let _ = sink.send(WriteCommand::Write(bytes));
                }
                Err(err) => {
                    error!(path = %store.display(), error = %err, "State store encode failed")
                }
            }
        });

        Self {
            container,
            path,
            writer,
            _write_through: write_through,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container(&self) -> &StateContainer<T> {
        &self.container
    }

    /// Waits until every transition committed so far has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writer.send(WriteCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl<T> Deref for PersistentContainer<T> {
    type Target = StateContainer<T>;

    fn deref(&self) -> &Self::Target {
        &self.container
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Session {
        active: BTreeSet<String>,
        revision: u32,
    }

    #[tokio::test]
    async fn missing_store_uses_default() {
        let dir = TempDir::new().expect("temp dir");
        let store = PersistentContainer::open(dir.path(), "session", Session::default());
        assert_eq!(*store.state(), Session::default());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn transitions_are_written_through_in_order() {
        let dir = TempDir::new().expect("temp dir");
        {
            let store = PersistentContainer::open(dir.path(), "session", Session::default());
            for revision in 1..=20 {
                store.update(|draft| {
                    draft.revision = revision;
                    draft.active.insert(format!("server-{revision}"));
                });
            }
            store.flush().await;
        }

        let reopened = PersistentContainer::open(dir.path(), "session", Session::default());
        assert_eq!(reopened.state().revision, 20);
        assert_eq!(reopened.state().active.len(), 20);
        assert_eq!(reopened.initial_state().revision, 20);
    }

    #[tokio::test]
    async fn unreadable_store_falls_back_to_default() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(store_path(dir.path(), "session"), b"\xc1not msgpack").expect("write");
        let fallback = Session {
            revision: 7,
            ..Session::default()
        };
        let store = PersistentContainer::open(dir.path(), "session", fallback.clone());
        assert_eq!(*store.state(), fallback);
    }
}
