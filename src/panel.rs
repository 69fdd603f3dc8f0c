use std::time::Duration;

use log::{debug, warn};

use crate::{
    document::DocumentMirror,
    messages::{
        HotkeySpecV1, MessageBody, NumberFieldSpecV1, PanelMountMsgBodyV1, PanelRefreshMsgBodyV1,
        PanelSpecV1, PanelVisibilityMsgBodyV1, SliderSpecV1, StepButtonsSpecV1,
        StyleInjectMsgBodyV1,
    },
    rate::{display_rate, MAX_RATE, MIN_RATE, RATE_STEP},
    session::PageHandle,
};

const PANEL_ID: &str = "presto-panel";
const PANEL_TITLE: &str = "Playback speed";
const CLOSE_ID: &str = "presto-close";
const CLOSE_HINT: &str = "Hide panel (Alt+S)";
const NUMBER_FIELD_ID: &str = "presto-rate-field";
const NUMBER_FIELD_LABEL: &str = "Speed:";
const STEP_DOWN_ID: &str = "presto-step-down";
const STEP_UP_ID: &str = "presto-step-up";
const SLIDER_ID: &str = "presto-rate-slider";

pub const BODY_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const BODY_POLL_LIMIT: u32 = 50;

/// Keeps the panel usable before the agent's own theme loads; everything
/// cosmetic beyond pinning it to the viewport is left to the page side.
const STYLESHEET: &str = "\
#presto-panel {
    position: fixed;
    top: 20px;
    left: 20px;
    z-index: 2147483647;
    display: flex;
    flex-direction: column;
    gap: 8px;
    padding: 10px 14px;
}
#presto-panel header {
    cursor: move;
    user-select: none;
}
";

/// The fixed combination the agent registers for the visibility toggle.
pub fn hotkey() -> HotkeySpecV1 {
    HotkeySpecV1 {
        alt: true,
        code: "KeyS".to_string(),
    }
}

/// Server-side view of the in-page control panel. Mounting has to wait for
/// the document body, which pages that inject their markup late may grow
/// only after several observer rounds.
#[derive(Debug)]
pub struct Panel {
    mounted: bool,
    visible: bool,
    polls_left: u32,
}

impl Panel {
    pub fn new() -> Self {
        Self {
            mounted: false,
            visible: false,
            polls_left: BODY_POLL_LIMIT,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn wants_poll(&self) -> bool {
        !self.mounted && self.polls_left > 0
    }

    /// Mounts the panel if the document has a body, and otherwise burns one
    /// poll attempt. Pages whose body never appears within the poll budget
    /// run without a panel; the hotkey can still retry later.
    pub fn try_mount(&mut self, rate: f64, mirror: &DocumentMirror, page: &PageHandle) {
        if self.mounted {
            return;
        }
        if mirror.has_body() {
            page.send(MessageBody::StyleInjectV1(StyleInjectMsgBodyV1 {
                css: STYLESHEET.to_string(),
            }));
            page.send(MessageBody::PanelMountV1(PanelMountMsgBodyV1 {
                panel: Self::spec(rate),
            }));
            self.mounted = true;
            self.visible = true;
            debug!("Panel mounted");
        } else if self.polls_left > 0 {
            self.polls_left -= 1;
            if self.polls_left == 0 {
                warn!("Giving up on the panel mount: the document body never appeared");
            }
        }
    }

    /// Hotkey handler: flips visibility, or mounts the panel if it is still
    /// missing (re-arming the poll budget when the body is not there yet).
    pub fn toggle(&mut self, rate: f64, mirror: &DocumentMirror, page: &PageHandle) {
        if !self.mounted {
            self.polls_left = BODY_POLL_LIMIT;
            self.try_mount(rate, mirror, page);
            return;
        }
        self.visible = !self.visible;
        page.send(MessageBody::PanelVisibilityV1(PanelVisibilityMsgBodyV1 {
            visible: self.visible,
        }));
    }

    /// Close button handler.
    pub fn hide(&mut self, page: &PageHandle) {
        if !self.mounted || !self.visible {
            return;
        }
        self.visible = false;
        page.send(MessageBody::PanelVisibilityV1(PanelVisibilityMsgBodyV1 {
            visible: false,
        }));
    }

    /// Pushes the canonical rate into the bound fields. A panel that never
    /// mounted has nothing to refresh.
    pub fn refresh(&self, rate: f64, page: &PageHandle) {
        if !self.mounted {
            return;
        }
        page.send(MessageBody::PanelRefreshV1(PanelRefreshMsgBodyV1 {
            number_value: display_rate(rate),
            slider_value: rate,
        }));
    }

    fn spec(rate: f64) -> PanelSpecV1 {
        PanelSpecV1 {
            panel_id: PANEL_ID.to_string(),
            title: PANEL_TITLE.to_string(),
            close_id: CLOSE_ID.to_string(),
            close_hint: CLOSE_HINT.to_string(),
            draggable: true,
            number_field: NumberFieldSpecV1 {
                id: NUMBER_FIELD_ID.to_string(),
                label: NUMBER_FIELD_LABEL.to_string(),
                min: MIN_RATE,
                max: MAX_RATE,
                step: RATE_STEP,
                value: display_rate(rate),
            },
            step_buttons: StepButtonsSpecV1 {
                down_id: STEP_DOWN_ID.to_string(),
                down_label: "-".to_string(),
                up_id: STEP_UP_ID.to_string(),
                up_label: "+".to_string(),
            },
            slider: SliderSpecV1 {
                id: SLIDER_ID.to_string(),
                min: MIN_RATE,
                max: MAX_RATE,
                step: RATE_STEP,
                value: rate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::document::fixtures::*;

    fn page() -> (PageHandle, mpsc::UnboundedReceiver<MessageBody>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PageHandle::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MessageBody>) -> Vec<MessageBody> {
        let mut bodies = Vec::new();
        while let Ok(body) = rx.try_recv() {
            bodies.push(body);
        }
        bodies
    }

    fn bodyless_mirror() -> crate::document::DocumentMirror {
        mirror_of(element(1, "html", vec![element(2, "head", vec![])]))
    }

    #[test]
    fn should_mount_once_the_body_exists() {
        // given
        let (page, mut rx) = page();
        let mut panel = Panel::new();
        let mirror = mirror_of(page_with_body(vec![]));

        // when
        panel.try_mount(1.0, &mirror, &page);

        // then
        let sent = drain(&mut rx);
        assert!(matches!(sent[0], MessageBody::StyleInjectV1(..)));
        let MessageBody::PanelMountV1(ref mount) = sent[1] else {
            panic!("expected a panel mount, got {:?}", sent[1]);
        };
        assert_eq!(mount.panel.panel_id, "presto-panel");
        assert_eq!(mount.panel.number_field.value, "1.0");
        assert_eq!(mount.panel.slider.max, 20.0);
        assert!(panel.is_mounted());
        assert!(!panel.wants_poll());
    }

    #[test]
    fn should_mount_at_most_once() {
        // given
        let (page, mut rx) = page();
        let mut panel = Panel::new();
        let mirror = mirror_of(page_with_body(vec![]));
        panel.try_mount(1.0, &mirror, &page);
        drain(&mut rx);

        // when
        panel.try_mount(1.0, &mirror, &page);

        // then
        assert_eq!(drain(&mut rx), vec![]);
    }

    #[test]
    fn should_keep_polling_while_the_body_is_missing() {
        // given
        let (page, mut rx) = page();
        let mut panel = Panel::new();
        let mirror = bodyless_mirror();

        // when
        panel.try_mount(1.0, &mirror, &page);

        // then
        assert_eq!(drain(&mut rx), vec![]);
        assert!(!panel.is_mounted());
        assert!(panel.wants_poll());
    }

    #[test]
    fn should_give_up_after_the_poll_budget_runs_out() {
        // given
        let (page, _rx) = page();
        let mut panel = Panel::new();
        let mirror = bodyless_mirror();

        // when
        for _ in 0..BODY_POLL_LIMIT {
            panel.try_mount(1.0, &mirror, &page);
        }

        // then
        assert!(!panel.is_mounted());
        assert!(!panel.wants_poll());
    }

    #[test]
    fn should_toggle_visibility_once_mounted() {
        // given
        let (page, mut rx) = page();
        let mut panel = Panel::new();
        let mirror = mirror_of(page_with_body(vec![]));
        panel.try_mount(1.0, &mirror, &page);
        drain(&mut rx);

        // when
        panel.toggle(1.0, &mirror, &page);
        panel.toggle(1.0, &mirror, &page);

        // then
        assert_eq!(
            drain(&mut rx),
            vec![
                MessageBody::PanelVisibilityV1(PanelVisibilityMsgBodyV1 { visible: false }),
                MessageBody::PanelVisibilityV1(PanelVisibilityMsgBodyV1 { visible: true }),
            ]
        );
    }

    #[test]
    fn should_mount_from_the_hotkey_when_the_panel_is_missing() {
        // given
        let (page, mut rx) = page();
        let mut panel = Panel::new();
        let mirror = mirror_of(page_with_body(vec![]));

        // when
        panel.toggle(2.0, &mirror, &page);

        // then
        assert!(panel.is_mounted());
        let sent = drain(&mut rx);
        assert!(matches!(sent[1], MessageBody::PanelMountV1(..)));
    }

    #[test]
    fn should_rearm_polling_from_the_hotkey_after_giving_up() {
        // given
        let (page, _rx) = page();
        let mut panel = Panel::new();
        let mirror = bodyless_mirror();
        for _ in 0..BODY_POLL_LIMIT {
            panel.try_mount(1.0, &mirror, &page);
        }
        assert!(!panel.wants_poll());

        // when
        panel.toggle(1.0, &mirror, &page);

        // then
        assert!(!panel.is_mounted());
        assert!(panel.wants_poll());
    }

    #[test]
    fn should_hide_only_while_visible() {
        // given
        let (page, mut rx) = page();
        let mut panel = Panel::new();
        let mirror = mirror_of(page_with_body(vec![]));
        panel.try_mount(1.0, &mirror, &page);
        drain(&mut rx);

        // when
        panel.hide(&page);
        panel.hide(&page);

        // then
        assert_eq!(
            drain(&mut rx),
            vec![MessageBody::PanelVisibilityV1(PanelVisibilityMsgBodyV1 {
                visible: false
            })]
        );
    }

    #[test]
    fn should_not_refresh_an_unmounted_panel() {
        // given
        let (page, mut rx) = page();
        let panel = Panel::new();

        // when
        panel.refresh(2.0, &page);

        // then
        assert_eq!(drain(&mut rx), vec![]);
    }

    #[test]
    fn should_refresh_both_bound_fields() {
        // given
        let (page, mut rx) = page();
        let mut panel = Panel::new();
        let mirror = mirror_of(page_with_body(vec![]));
        panel.try_mount(1.0, &mirror, &page);
        drain(&mut rx);

        // when
        panel.refresh(2.5, &page);

        // then
        assert_eq!(
            drain(&mut rx),
            vec![MessageBody::PanelRefreshV1(PanelRefreshMsgBodyV1 {
                number_value: "2.5".to_string(),
                slider_value: 2.5,
            })]
        );
    }
}
