use super::client::RemoteStream;
use super::BridgeError;
use crate::error::{Error, Result};
use crate::state::{StateContainer, StateUpdate};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Rebuilds a backend container on the consuming side of a raw state stream.
///
/// The first update must be a full snapshot; it seeds the local container.
/// Every later update is replayed through [`StateContainer::apply`], so local
/// subscribers see the same transitions the backend committed.
pub struct StateMirror<T> {
    container: Option<StateContainer<T>>,
}

impl<T> Default for StateMirror<T> {
    fn default() -> Self {
        Self { container: None }
    }
}

impl<T> StateMirror<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror that replays into an existing container, e.g. one the UI has
    /// already subscribed to.
    pub fn with_container(container: StateContainer<T>) -> Self {
        Self {
            container: Some(container),
        }
    }

    pub fn container(&self) -> Option<&StateContainer<T>> {
        self.container.as_ref()
    }

    pub fn ingest(&mut self, update: StateUpdate) -> Result<Arc<T>> {
        let Some(patches) = update.patches else {
            let state: T = serde_json::from_value(update.state)
                .map_err(|err| Error::illegal_state(format!("invalid snapshot: {err}")))?;
            return Ok(match &self.container {
                Some(container) => container.replace(state),
                None => {
                    let container = StateContainer::new(state);
                    let current = container.state();
                    self.container = Some(container);
                    current
                }
            });
        };

        let container = self
            .container
            .as_ref()
            .ok_or_else(|| Error::illegal_state("patches received before any snapshot"))?;
        match container.apply(&patches.forward) {
            Ok(next) if *container.snapshot() == update.state => Ok(next),
            outcome => {
                if let Err(err) = &outcome {
                    warn!(error = %err, "Mirror patch failed; resyncing from snapshot");
                } else {
                    warn!("Mirror diverged from backend; resyncing from snapshot");
                }
                let state: T = serde_json::from_value(update.state)
                    .map_err(|err| Error::illegal_state(format!("invalid snapshot: {err}")))?;
                Ok(container.replace(state))
            }
        }
    }

    /// Pulls `stream` to completion, ingesting every update.
    pub async fn follow(
        &mut self,
        stream: &mut RemoteStream,
    ) -> std::result::Result<(), BridgeError> {
        while let Some(update) = stream.next_as::<StateUpdate>().await {
            self.ingest(update?)?;
        }
        Ok(())
    }
}
