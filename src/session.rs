use std::{fmt, sync::Arc};

use anyhow::Context;
use log::{debug, error, info};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use uuid::Uuid;

use crate::{
    connection::Connection,
    discovery::DiscoveryWatcher,
    document::DocumentMirror,
    messages::{
        AlertShowMsgBodyV1, ConnectionClientErrorMsgBodyV1, InputPromptReplyMsgBodyV1, Message,
        MessageBody, NodeDescV1, PromptShowMsgBodyV1, StepDirectionV1,
    },
    panel::{Panel, BODY_POLL_INTERVAL},
    rate::{
        display_rate, ApplyStats, RateController, RateInput, UpdateOrigin, MAX_RATE, MIN_RATE,
        RATE_STEP,
    },
    store::RateStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of the session's outbound queue. Domain components emit page
/// commands through this handle; the session drains the queue to the socket
/// after every dispatched event, so emit order is wire order.
#[derive(Debug, Clone)]
pub struct PageHandle {
    tx: mpsc::UnboundedSender<MessageBody>,
}

impl PageHandle {
    pub fn new(tx: mpsc::UnboundedSender<MessageBody>) -> Self {
        Self { tx }
    }

    /// Best-effort send. Delivery only fails while the session is tearing
    /// down, and anything queued at that point has nowhere to go anyway.
    pub fn send(&self, body: MessageBody) -> bool {
        let delivered = self.tx.send(body).is_ok();
        if !delivered {
            debug!("Dropped a page command, the session is closing");
        }
        delivered
    }
}

/// The per-page state machine: document mirror, rate controller, discovery
/// watcher and panel, driven one inbound message at a time.
struct Engine {
    id: SessionId,
    page: PageHandle,
    mirror: DocumentMirror,
    controller: RateController,
    watcher: DiscoveryWatcher,
    panel: Panel,
    snapshot_seen: bool,
}

impl Engine {
    fn new(id: SessionId, store: Arc<RateStore>) -> (Self, mpsc::UnboundedReceiver<MessageBody>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let page = PageHandle::new(tx);
        let engine = Self {
            id,
            controller: RateController::new(store, page.clone()),
            page,
            mirror: DocumentMirror::new(),
            watcher: DiscoveryWatcher::new(),
            panel: Panel::new(),
            snapshot_seen: false,
        };
        (engine, rx)
    }

    fn wants_poll(&self) -> bool {
        self.snapshot_seen && self.panel.wants_poll()
    }

    fn poll_panel(&mut self) {
        self.panel
            .try_mount(self.controller.target(), &self.mirror, &self.page);
    }

    fn stats(&self) -> ApplyStats {
        self.controller.stats()
    }

    fn dispatch(&mut self, body: MessageBody) {
        match body {
            MessageBody::DocumentSnapshotV1(snapshot) => self.handle_snapshot(&snapshot.root),
            MessageBody::DocumentMutationsV1(batch) => {
                if self.watcher.is_active() {
                    self.watcher
                        .handle_records(&batch.records, &mut self.controller, &mut self.mirror);
                } else {
                    debug!(
                        "Session {}: ignoring mutations before the first snapshot",
                        self.id
                    );
                }
            }
            MessageBody::InputRateEntryV1(entry) => {
                debug!(
                    "Session {}: rate entry {:?} from the {:?}",
                    self.id, entry.value, entry.control
                );
                self.controller.update(
                    RateInput::Text(entry.value),
                    UpdateOrigin::UserInput,
                    &self.mirror,
                    &self.panel,
                );
            }
            MessageBody::InputRateStepV1(step) => {
                let stepped = match step.direction {
                    StepDirectionV1::Up => self.controller.target() + RATE_STEP,
                    StepDirectionV1::Down => self.controller.target() - RATE_STEP,
                };
                self.controller.update(
                    RateInput::Value(stepped),
                    UpdateOrigin::UserInput,
                    &self.mirror,
                    &self.panel,
                );
            }
            MessageBody::InputHotkeyV1 => {
                self.panel
                    .toggle(self.controller.target(), &self.mirror, &self.page);
            }
            MessageBody::InputPanelCloseV1 => self.panel.hide(&self.page),
            MessageBody::InputMenuCommandV1 => {
                self.page
                    .send(MessageBody::PromptShowV1(PromptShowMsgBodyV1 {
                        message: format!("Enter playback speed ({MIN_RATE} - {MAX_RATE}):"),
                        initial: display_rate(self.controller.target()),
                    }));
            }
            MessageBody::InputPromptReplyV1(reply) => self.handle_prompt_reply(reply),
            other => {
                debug!("Session {}: unexpected message: {other:?}", self.id);
                self.page.send(MessageBody::ConnectionClientErrorV1(
                    ConnectionClientErrorMsgBodyV1 {
                        message: "Unexpected message".to_string(),
                    },
                ));
            }
        }
    }

    fn handle_snapshot(&mut self, root: &NodeDescV1) {
        self.mirror.apply_snapshot(root);
        if self.snapshot_seen {
            // The page replaced its whole document, e.g. a soft navigation.
            debug!(
                "Session {}: replacement snapshot, re-covering the page",
                self.id
            );
            self.controller.apply_rate_to_all(&self.mirror);
            return;
        }
        self.snapshot_seen = true;
        debug!(
            "Session {}: initial snapshot with {} nodes",
            self.id,
            self.mirror.node_count()
        );
        self.panel
            .try_mount(self.controller.target(), &self.mirror, &self.page);
        self.controller.restore(&self.mirror, &self.panel);
        self.watcher.activate(&mut self.controller, &self.mirror);
    }

    fn handle_prompt_reply(&mut self, reply: InputPromptReplyMsgBodyV1) {
        // A cancelled prompt changes nothing.
        let Some(raw) = reply.value else { return };
        match raw.trim().parse::<f64>() {
            Ok(requested) if !requested.is_nan() => {
                self.controller.update(
                    RateInput::Value(requested),
                    UpdateOrigin::UserInput,
                    &self.mirror,
                    &self.panel,
                );
            }
            _ => {
                self.page.send(MessageBody::AlertShowV1(AlertShowMsgBodyV1 {
                    message: "Invalid speed, please enter a number.".to_string(),
                }));
            }
        }
    }
}

/// One connected page. Owns the websocket and the engine behind it; inbound
/// messages are dispatched to completion and the resulting page commands are
/// flushed before the next message is taken.
pub struct PageSession {
    id: SessionId,
    conn: Connection,
    out_rx: mpsc::UnboundedReceiver<MessageBody>,
    engine: Engine,
}

impl PageSession {
    pub fn new(conn: Connection, store: Arc<RateStore>) -> Self {
        let id = SessionId::new();
        let (engine, out_rx) = Engine::new(id, store);
        Self {
            id,
            conn,
            out_rx,
            engine,
        }
    }

    pub async fn run(&mut self) {
        info!("Session {} attached to {}", self.id, self.conn.page_href());
        if let Err(err) = self.drive().await {
            error!("Session {} failed: {err:?}", self.id);
        }
        info!("Session {} ended: {}", self.id, self.engine.stats());
    }

    async fn drive(&mut self) -> anyhow::Result<()> {
        let mut poll = tokio::time::interval(BODY_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = self.conn.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    self.engine.dispatch(msg.body);
                }
                _ = poll.tick(), if self.engine.wants_poll() => {
                    self.engine.poll_panel();
                }
            }
            self.flush().await?;
        }
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        while let Ok(body) = self.out_rx.try_recv() {
            self.conn
                .send(Message::new(body))
                .await
                .context("Failed to send page commands")?;
        }
        Ok(())
    }
}
