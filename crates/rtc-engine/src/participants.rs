//! Remote participant bookkeeping.
//!
//! Every update is apply-if-present: notifications that reference a
//! participant who already left are ignored, so the order in which joins,
//! leaves and publishes arrive cannot create half-registered entries.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::debug;

use rtc_ipc::MediaKind;
use rtc_transport::TrackHandle;

/// One peer in the channel.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    id: String,
    published: BTreeSet<MediaKind>,
    subscribed: HashMap<MediaKind, TrackHandle>,
}

impl RemoteParticipant {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            published: BTreeSet::new(),
            subscribed: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kinds the participant currently publishes.
    pub fn published_kinds(&self) -> impl Iterator<Item = MediaKind> + '_ {
        self.published.iter().copied()
    }

    pub fn has_published(&self, kind: MediaKind) -> bool {
        self.published.contains(&kind)
    }

    /// The subscribed track of a kind, if any.
    pub fn track(&self, kind: MediaKind) -> Option<&TrackHandle> {
        self.subscribed.get(&kind)
    }

    fn stop_tracks(&self) {
        for track in self.subscribed.values() {
            track.stop();
        }
    }
}

/// Known remote participants, keyed by id.
#[derive(Default)]
pub struct ParticipantRegistry {
    participants: Mutex<HashMap<String, RemoteParticipant>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. Returns false if it was already known.
    pub fn insert(&self, id: &str) -> bool {
        let mut participants = self.participants.lock();
        if participants.contains_key(id) {
            return false;
        }
        participants.insert(id.to_string(), RemoteParticipant::new(id));
        true
    }

    /// Remove a participant and stop its remote tracks.
    pub fn remove(&self, id: &str) -> Option<RemoteParticipant> {
        let removed = self.participants.lock().remove(id);
        if let Some(ref participant) = removed {
            participant.stop_tracks();
        }
        removed
    }

    /// Record a published kind. Returns false if the participant is unknown.
    pub fn mark_published(&self, id: &str, kind: MediaKind) -> bool {
        match self.participants.lock().get_mut(id) {
            Some(participant) => {
                participant.published.insert(kind);
                true
            }
            None => false,
        }
    }

    /// Attach a subscribed track.
    ///
    /// Returns false, leaving the registry untouched, if the participant is
    /// gone or no longer publishes `kind`. A previously attached track of
    /// the same kind is stopped.
    pub fn attach(&self, id: &str, kind: MediaKind, track: TrackHandle) -> bool {
        let replaced = {
            let mut participants = self.participants.lock();
            let Some(participant) = participants.get_mut(id) else {
                return false;
            };
            if !participant.published.contains(&kind) {
                return false;
            }
            participant.subscribed.insert(kind, track)
        };

        if let Some(old) = replaced {
            debug!(participant = id, %kind, "Replacing subscribed track");
            old.stop();
        }
        true
    }

    /// Forget a published kind without a track, e.g. after a failed subscribe.
    pub fn forget_kind(&self, id: &str, kind: MediaKind) {
        if let Some(participant) = self.participants.lock().get_mut(id) {
            participant.published.remove(&kind);
        }
    }

    /// Clear a published kind and return its subscribed track.
    ///
    /// `None` if the participant is unknown; `Some(None)` if known but
    /// nothing was subscribed.
    pub fn unpublish(&self, id: &str, kind: MediaKind) -> Option<Option<TrackHandle>> {
        let mut participants = self.participants.lock();
        let participant = participants.get_mut(id)?;
        participant.published.remove(&kind);
        Some(participant.subscribed.remove(&kind))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.lock().contains_key(id)
    }

    /// Snapshot of one participant.
    pub fn get(&self, id: &str) -> Option<RemoteParticipant> {
        self.participants.lock().get(id).cloned()
    }

    /// Known ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.participants.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.participants.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everyone, stopping their tracks.
    pub fn clear(&self) -> usize {
        let drained: Vec<RemoteParticipant> =
            self.participants.lock().drain().map(|(_, p)| p).collect();
        for participant in &drained {
            participant.stop_tracks();
        }
        drained.len()
    }
}
