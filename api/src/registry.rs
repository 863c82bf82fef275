use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use roadwatch_pipeline::engine::{
    new_shared_state, read_state, CancelFlag, SharedStreamState, StreamPhase, StreamState,
};
use roadwatch_pipeline::source::SourceSpec;
use tracing::info;
use uuid::Uuid;

/// Handles for one playback of a registered stream.
#[derive(Debug, Clone)]
pub struct Playback {
    pub state: SharedStreamState,
    pub cancel: CancelFlag,
}

#[derive(Debug)]
struct StreamEntry {
    spec: SourceSpec,
    /// Oldest first; the last one is what status reports.
    playbacks: Vec<Playback>,
}

/// Registered stream sources, keyed by a generated id.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, spec: SourceSpec) -> String {
        let id = Uuid::new_v4().to_string();
        info!(stream_id = %id, source = %spec.describe(), "stream registered");
        self.lock().insert(
            id.clone(),
            StreamEntry {
                spec,
                playbacks: Vec::new(),
            },
        );
        id
    }

    #[cfg(test)]
    pub fn spec(&self, id: &str) -> Option<SourceSpec> {
        self.lock().get(id).map(|e| e.spec.clone())
    }

    /// Fresh state and cancel flag for a new playback of `id`. Finished
    /// playbacks are forgotten.
    pub fn begin_playback(&self, id: &str) -> Option<(SourceSpec, Playback)> {
        let mut streams = self.lock();
        let entry = streams.get_mut(id)?;
        entry
            .playbacks
            .retain(|p| read_state(&p.state).phase != StreamPhase::Closed);
        let playback = Playback {
            state: new_shared_state(),
            cancel: CancelFlag::new(),
        };
        entry.playbacks.push(playback.clone());
        Some((entry.spec.clone(), playback))
    }

    /// State of the most recent playback, or the initial state if the stream
    /// has never been played.
    pub fn status(&self, id: &str) -> Option<(SourceSpec, StreamState)> {
        let streams = self.lock();
        let entry = streams.get(id)?;
        let state = entry
            .playbacks
            .last()
            .map(|p| read_state(&p.state))
            .unwrap_or_default();
        Some((entry.spec.clone(), state))
    }

    /// Cancel every live playback of `id` and forget it.
    pub fn remove(&self, id: &str) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        for playback in &entry.playbacks {
            playback.cancel.cancel();
        }
        info!(stream_id = %id, playbacks = entry.playbacks.len(), "stream removed");
        true
    }

    /// Cancel every playback of every stream, keeping the registrations.
    pub fn cancel_all(&self) {
        for entry in self.lock().values() {
            for playback in &entry.playbacks {
                playback.cancel.cancel();
            }
        }
    }
}
