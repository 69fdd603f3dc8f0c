use std::{fmt, sync::Arc};

use log::{debug, warn};

use crate::{
    document::{DocumentMirror, VideoElement},
    messages::{ElementSetRateMsgBodyV1, MessageBody},
    panel::Panel,
    session::PageHandle,
    store::RateStore,
};

pub const MIN_RATE: f64 = 0.1;
pub const MAX_RATE: f64 = 20.0;
pub const RATE_STEP: f64 = 0.1;

const DEFAULT_RATE: f64 = 1.0;

/// A requested rate before canonicalization. Field entries and prompt
/// replies arrive as text; sliders and steppers as numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum RateInput {
    Text(String),
    Value(f64),
}

impl From<&str> for RateInput {
    fn from(raw: &str) -> Self {
        Self::Text(raw.to_string())
    }
}

impl From<f64> for RateInput {
    fn from(value: f64) -> Self {
        Self::Value(value)
    }
}

/// Where an update came from. Persisted values must not be written straight
/// back to the store they were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    UserInput,
    PersistedStore,
}

/// Result of pushing the target rate to a single element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyCurrent,
    /// The element refused the write (its media state is broken). The batch
    /// carries on; the rejection is only counted.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub applied: u64,
    pub already_current: u64,
    pub rejected: u64,
}

impl ApplyStats {
    fn count(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::AlreadyCurrent => self.already_current += 1,
            ApplyOutcome::Rejected => self.rejected += 1,
        }
    }
}

impl fmt::Display for ApplyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rate writes applied, {} already current, {} rejected",
            self.applied, self.already_current, self.rejected
        )
    }
}

/// The canonical form of a requested rate: parsed (unparsable text falls
/// back to 1.0), clamped to [MIN_RATE, MAX_RATE] and snapped to the step
/// grid. Canonical values are always the nearest representable tenth, so
/// two equal requests compare equal as floats.
pub fn canonical_rate(input: &RateInput) -> f64 {
    let requested = match input {
        RateInput::Text(raw) => raw.trim().parse::<f64>().unwrap_or(DEFAULT_RATE),
        RateInput::Value(value) => *value,
    };
    if requested.is_nan() {
        return DEFAULT_RATE;
    }
    quantize(requested.clamp(MIN_RATE, MAX_RATE))
}

// Snapping is computed in tenths (10.0 is the exact reciprocal of
// RATE_STEP), not by multiplying the rounded step count by 0.1.
fn quantize(rate: f64) -> f64 {
    (rate * 10.0).round() / 10.0
}

/// One-decimal text form shown in the number field and the prompt.
pub fn display_rate(rate: f64) -> String {
    format!("{rate:.1}")
}

/// Owner of the target rate. All rate changes funnel through [`Self::update`],
/// which canonicalizes the request, refreshes the panel, persists the value
/// and pushes it to every video in the document.
#[derive(Debug)]
pub struct RateController {
    target: f64,
    store: Arc<RateStore>,
    page: PageHandle,
    stats: ApplyStats,
}

impl RateController {
    pub fn new(store: Arc<RateStore>, page: PageHandle) -> Self {
        Self {
            target: DEFAULT_RATE,
            store,
            page,
            stats: ApplyStats::default(),
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    /// Applies the persisted rate, or the 1.0 default when nothing is
    /// stored, without writing the value straight back to the store.
    pub fn restore(&mut self, mirror: &DocumentMirror, panel: &Panel) {
        let raw = self
            .store
            .load()
            .unwrap_or_else(|| DEFAULT_RATE.to_string());
        self.update(RateInput::Text(raw), UpdateOrigin::PersistedStore, mirror, panel);
    }

    pub fn update(
        &mut self,
        input: RateInput,
        origin: UpdateOrigin,
        mirror: &DocumentMirror,
        panel: &Panel,
    ) {
        self.target = canonical_rate(&input);
        debug!("Target rate set to {} ({origin:?})", display_rate(self.target));

        panel.refresh(self.target, &self.page);

        if origin == UpdateOrigin::UserInput {
            if let Err(err) = self.store.save(self.target) {
                warn!("Failed to persist playback rate: {err:?}");
            }
        }

        self.apply_rate_to_all(mirror);
    }

    /// Pushes the current target to every video in the document, in document
    /// order. Individual rejections never abort the sweep.
    pub fn apply_rate_to_all(&mut self, mirror: &DocumentMirror) {
        for element in mirror.videos() {
            self.set_rate(&element);
        }
    }

    /// Pushes the current target to one element. Elements already at the
    /// target are left alone so unrelated playback state is not disturbed.
    pub fn set_rate(&mut self, element: &Arc<VideoElement>) -> ApplyOutcome {
        let outcome = if element.media_error() {
            debug!(
                "Skipping rate write on {}: element reports a media error",
                element.id()
            );
            ApplyOutcome::Rejected
        } else if element.playback_rate() == self.target {
            ApplyOutcome::AlreadyCurrent
        } else {
            element.record_rate(self.target);
            self.page
                .send(MessageBody::ElementSetRateV1(ElementSetRateMsgBodyV1 {
                    node: element.id().raw(),
                    rate: self.target,
                }));
            ApplyOutcome::Applied
        };
        self.stats.count(outcome);
        outcome
    }
}
