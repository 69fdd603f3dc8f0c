use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::messages::{MediaStateV1, MutationRecordV1, NodeDescV1};

const MEDIA_TAG: &str = "video";
const BODY_TAG: &str = "body";

/// Agent-assigned identifier for a node in the host document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an inserted node means to the discovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// A video element, the target of rate application.
    MediaElement,

    /// An element that may hold video descendants and is worth scanning.
    Container,

    /// A node that can neither be nor contain a video (text, comments).
    Inert,
}

impl NodeClass {
    pub fn of(desc: &NodeDescV1) -> Self {
        match &desc.tag {
            Some(tag) if tag.eq_ignore_ascii_case(MEDIA_TAG) => Self::MediaElement,
            Some(_) => Self::Container,
            None => Self::Inert,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MediaState {
    rate: f64,
    errored: bool,
}

impl From<&MediaStateV1> for MediaState {
    fn from(state: &MediaStateV1) -> Self {
        Self {
            rate: state.playback_rate,
            errored: state.media_error,
        }
    }
}

impl Default for MediaState {
    fn default() -> Self {
        // Media elements start at normal speed unless the agent says otherwise.
        Self {
            rate: 1.0,
            errored: false,
        }
    }
}

/// Server-side stand-in for one video element on the page. The identity of
/// the `Arc` is stable for the lifetime of the page-side node, which is what
/// the discovery watcher's seen set keys on.
#[derive(Debug)]
pub struct VideoElement {
    id: NodeId,
    state: Mutex<MediaState>,
}

impl VideoElement {
    fn new(id: NodeId, media: Option<&MediaStateV1>) -> Self {
        Self {
            id,
            state: Mutex::new(media.map(MediaState::from).unwrap_or_default()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    /// Whether the underlying element is in a state that rejects rate writes.
    pub fn media_error(&self) -> bool {
        self.state.lock().errored
    }

    pub(crate) fn record_rate(&self, rate: f64) {
        self.state.lock().rate = rate;
    }

    fn record_state(&self, state: &MediaStateV1) {
        *self.state.lock() = MediaState::from(state);
    }
}

#[derive(Debug)]
struct MirrorEntry {
    tag: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    media: Option<Arc<VideoElement>>,
}

/// In-process model of the page's element tree, built from the agent's
/// snapshot and kept current from its mutation records. Full-document video
/// queries, subtree scans and body presence are all answered from here.
///
/// Removed subtrees are dropped from the index, so `Arc<VideoElement>`
/// handles die with their nodes and weak references held elsewhere expire on
/// their own.
#[derive(Debug, Default)]
pub struct DocumentMirror {
    root: Option<NodeId>,
    orphans: Vec<NodeId>,
    nodes: HashMap<NodeId, MirrorEntry>,
}

impl DocumentMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Replaces the whole mirror with a fresh document snapshot.
    pub fn apply_snapshot(&mut self, root: &NodeDescV1) {
        self.nodes.clear();
        self.orphans.clear();
        self.root = Some(NodeId::from(root.id));
        self.index_subtree(root, None);
    }

    /// Ingests one mutation record: added subtrees are indexed under the
    /// record's target, removed ids drop their whole subtree.
    pub fn apply_record(&mut self, record: &MutationRecordV1) {
        let target = NodeId::from(record.target);
        for desc in &record.added {
            let id = NodeId::from(desc.id);
            self.index_subtree(desc, Some(target));
            if let Some(parent) = self.nodes.get_mut(&target) {
                if !parent.children.contains(&id) {
                    parent.children.push(id);
                }
            } else {
                // The parent never made it into the mirror; keep the subtree
                // reachable anyway.
                self.orphans.push(id);
                if let Some(entry) = self.nodes.get_mut(&id) {
                    entry.parent = None;
                }
            }
        }
        for &removed in &record.removed {
            self.remove_subtree(NodeId::from(removed));
        }
    }

    /// Every video element currently in the document, in document order.
    pub fn videos(&self) -> Vec<Arc<VideoElement>> {
        let mut found = Vec::new();
        if let Some(root) = self.root {
            self.collect_videos(root, &mut found);
        }
        for &orphan in &self.orphans {
            self.collect_videos(orphan, &mut found);
        }
        found
    }

    /// Video elements inside the subtree rooted at `id`, including `id`.
    pub fn videos_under(&self, id: NodeId) -> Vec<Arc<VideoElement>> {
        let mut found = Vec::new();
        self.collect_videos(id, &mut found);
        found
    }

    pub fn element(&self, id: NodeId) -> Option<Arc<VideoElement>> {
        self.nodes.get(&id).and_then(|entry| entry.media.clone())
    }

    pub fn has_body(&self) -> bool {
        self.nodes
            .values()
            .any(|entry| matches!(&entry.tag, Some(tag) if tag.eq_ignore_ascii_case(BODY_TAG)))
    }

    fn collect_videos(&self, id: NodeId, found: &mut Vec<Arc<VideoElement>>) {
        let Some(entry) = self.nodes.get(&id) else {
            return;
        };
        if let Some(element) = &entry.media {
            found.push(Arc::clone(element));
        }
        for &child in &entry.children {
            self.collect_videos(child, found);
        }
    }

    fn index_subtree(&mut self, desc: &NodeDescV1, parent: Option<NodeId>) {
        let id = NodeId::from(desc.id);

        // A re-announced node keeps its element identity. Only unlink it from
        // its old position when the parent actually changed; with an unchanged
        // parent the old link is still the right one (and the parent entry may
        // just have been rebuilt with this child in place).
        let previous = self.nodes.remove(&id);
        if let Some(entry) = &previous {
            if entry.parent != parent {
                self.unlink(id, entry.parent);
            }
        }
        self.orphans.retain(|&orphan| orphan != id);

        let media = if NodeClass::of(desc) == NodeClass::MediaElement {
            let element = match previous.and_then(|entry| entry.media) {
                Some(existing) => {
                    if let Some(state) = &desc.media {
                        existing.record_state(state);
                    }
                    existing
                }
                None => Arc::new(VideoElement::new(id, desc.media.as_ref())),
            };
            Some(element)
        } else {
            None
        };

        self.nodes.insert(
            id,
            MirrorEntry {
                tag: desc.tag.clone(),
                parent,
                children: desc.children.iter().map(|c| NodeId::from(c.id)).collect(),
                media,
            },
        );

        for child in &desc.children {
            self.index_subtree(child, Some(id));
        }
    }

    fn remove_subtree(&mut self, id: NodeId) {
        let Some(entry) = self.nodes.remove(&id) else {
            return;
        };
        self.unlink(id, entry.parent);
        self.orphans.retain(|&orphan| orphan != id);
        for child in entry.children {
            self.drop_descendants(child);
        }
    }

    fn drop_descendants(&mut self, id: NodeId) {
        if let Some(entry) = self.nodes.remove(&id) {
            for child in entry.children {
                self.drop_descendants(child);
            }
        }
    }

    fn unlink(&mut self, id: NodeId, parent: Option<NodeId>) {
        if let Some(parent_id) = parent {
            if let Some(parent_entry) = self.nodes.get_mut(&parent_id) {
                parent_entry.children.retain(|&child| child != id);
            }
        }
    }
}

/// Node description builders shared by tests across the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn element(id: u64, tag: &str, children: Vec<NodeDescV1>) -> NodeDescV1 {
        NodeDescV1 {
            id,
            tag: Some(tag.to_string()),
            media: None,
            children,
        }
    }

    pub(crate) fn video(id: u64) -> NodeDescV1 {
        NodeDescV1 {
            id,
            tag: Some("video".to_string()),
            media: Some(MediaStateV1 {
                playback_rate: 1.0,
                media_error: false,
            }),
            children: vec![],
        }
    }

    pub(crate) fn broken_video(id: u64) -> NodeDescV1 {
        NodeDescV1 {
            id,
            tag: Some("video".to_string()),
            media: Some(MediaStateV1 {
                playback_rate: 1.0,
                media_error: true,
            }),
            children: vec![],
        }
    }

    pub(crate) fn text(id: u64) -> NodeDescV1 {
        NodeDescV1 {
            id,
            tag: None,
            media: None,
            children: vec![],
        }
    }

    pub(crate) fn page_with_body(content: Vec<NodeDescV1>) -> NodeDescV1 {
        element(
            1,
            "html",
            vec![element(2, "head", vec![]), element(3, "body", content)],
        )
    }

    pub(crate) fn mirror_of(root: NodeDescV1) -> DocumentMirror {
        let mut mirror = DocumentMirror::new();
        mirror.apply_snapshot(&root);
        mirror
    }
}
