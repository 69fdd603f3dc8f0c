use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use log::debug;

use crate::{
    document::{DocumentMirror, NodeClass, NodeId, VideoElement},
    messages::MutationRecordV1,
    rate::RateController,
};

/// Observation contract the agent is asked to register: child-list changes
/// across the whole document subtree.
pub const OBSERVE_SUBTREE: bool = true;
pub const OBSERVE_CHILD_LIST: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherState {
    /// No snapshot yet; mutation batches are not expected.
    Inactive,
    /// Observing. The watcher stays active for the rest of the session.
    Active,
}

/// Identity record of the videos that already received the rate, so a video
/// that several observer rounds re-announce is only written once. Entries are
/// weak handles; elements pruned from the mirror expire here on their own,
/// and dead entries are swept whenever a new one is added.
#[derive(Debug, Default)]
struct SeenSet {
    entries: HashMap<NodeId, Weak<VideoElement>>,
}

impl SeenSet {
    fn contains(&self, element: &Arc<VideoElement>) -> bool {
        self.entries
            .get(&element.id())
            .and_then(Weak::upgrade)
            .is_some_and(|known| Arc::ptr_eq(&known, element))
    }

    fn insert(&mut self, element: &Arc<VideoElement>) {
        self.entries.retain(|_, entry| entry.strong_count() > 0);
        self.entries.insert(element.id(), Arc::downgrade(element));
    }

    fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}

/// Consumes mutation batches, keeps the mirror current and makes sure every
/// newly discovered video gets the target rate exactly once.
#[derive(Debug)]
pub struct DiscoveryWatcher {
    state: WatcherState,
    seen: SeenSet,
}

impl DiscoveryWatcher {
    pub fn new() -> Self {
        Self {
            state: WatcherState::Inactive,
            seen: SeenSet::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == WatcherState::Active
    }

    /// One-way transition into the active state; covers everything already
    /// in the document before the first mutation batch arrives.
    pub fn activate(&mut self, controller: &mut RateController, mirror: &DocumentMirror) {
        if self.state == WatcherState::Active {
            debug!("Discovery watcher is already active");
            return;
        }
        self.state = WatcherState::Active;
        controller.apply_rate_to_all(mirror);
        for element in mirror.videos() {
            self.seen.insert(&element);
        }
        debug!(
            "Discovery watcher active, {} videos covered at start",
            self.seen.live_count()
        );
    }

    /// One observer round: every record is ingested into the mirror, then
    /// each added node is classified and its videos (the node itself, or all
    /// video descendants of a container) receive the rate. Records are
    /// handled in batch order.
    pub fn handle_records(
        &mut self,
        records: &[MutationRecordV1],
        controller: &mut RateController,
        mirror: &mut DocumentMirror,
    ) {
        for record in records {
            mirror.apply_record(record);
            for desc in &record.added {
                match NodeClass::of(desc) {
                    NodeClass::MediaElement => {
                        if let Some(element) = mirror.element(NodeId::from(desc.id)) {
                            self.apply_if_unseen(&element, controller);
                        }
                    }
                    NodeClass::Container => {
                        for element in mirror.videos_under(NodeId::from(desc.id)) {
                            self.apply_if_unseen(&element, controller);
                        }
                    }
                    NodeClass::Inert => {}
                }
            }
        }
    }

    fn apply_if_unseen(&mut self, element: &Arc<VideoElement>, controller: &mut RateController) {
        if self.seen.contains(element) {
            return;
        }
        self.seen.insert(element);
        controller.set_rate(element);
    }
}
