//! Receiver-side smoothing between decoded frames
//!
//! Frames arrive at the sender's tick rate, far below render rate. After each
//! applied frame the renderer blends from the previous buffers to the current
//! ones with a weight that steps towards 1 at a fixed wall-clock cadence.

use crate::frame::{FrameDecoder, FrameKind};
use crate::quantize::Position;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    /// Showing the latest frame as-is
    Snapped,
    /// Blending from the previous frame to the latest one
    Interpolating,
    /// Updates stalled after a fragment; showing the latest frame until the next update
    LagCatchup,
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub interpolate: bool,
    /// Wall-clock time between two weight steps
    pub time_span: Duration,
    pub weight_step: f32,
    pub lag_threshold: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            interpolate: true,
            time_span: Duration::from_millis(10),
            weight_step: 0.1,
            lag_threshold: Duration::from_millis(100),
        }
    }
}

/// Interpolation state driven by frame updates and render ticks
#[derive(Debug, Clone)]
pub struct PlaybackState {
    config: PlaybackConfig,
    phase: PlaybackPhase,
    weight: f32,
    since_update: Duration,
    since_step: Duration,
    last_kind: Option<FrameKind>,
}

impl PlaybackState {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            phase: PlaybackPhase::Snapped,
            weight: 1.0,
            since_update: Duration::ZERO,
            since_step: Duration::ZERO,
            last_kind: None,
        }
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.phase
    }

    /// Blend weight between previous (0.0) and current (1.0) buffers
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Record a freshly applied keyframe or fragment
    pub fn on_update(&mut self, kind: FrameKind) {
        self.last_kind = Some(kind);
        self.since_update = Duration::ZERO;
        self.since_step = Duration::ZERO;
        if self.config.interpolate {
            self.phase = PlaybackPhase::Interpolating;
            self.weight = 0.0;
        } else {
            self.phase = PlaybackPhase::Snapped;
            self.weight = 1.0;
        }
    }

    /// Advance wall-clock time by `elapsed` and return the weight to render with
    pub fn advance(&mut self, elapsed: Duration) -> f32 {
        self.since_update = self.since_update.saturating_add(elapsed);

        if self.phase != PlaybackPhase::LagCatchup
            && self.last_kind == Some(FrameKind::Fragment)
            && self.since_update > self.config.lag_threshold
        {
            debug!(
                "No update for {:?} after a fragment, snapping to latest frame",
                self.since_update
            );
            self.phase = PlaybackPhase::LagCatchup;
            self.weight = 1.0;
            return self.weight;
        }

        if self.phase == PlaybackPhase::Interpolating {
            self.since_step = self.since_step.saturating_add(elapsed);
            if self.config.time_span.is_zero() {
                self.weight = 1.0;
            } else {
                while self.since_step >= self.config.time_span && self.weight < 1.0 {
                    self.since_step -= self.config.time_span;
                    self.weight += self.config.weight_step;
                }
            }
            if self.weight >= 1.0 {
                self.weight = 1.0;
                self.phase = PlaybackPhase::Snapped;
            }
        }

        self.weight
    }

    /// Positions to draw for the current weight
    pub fn render(&self, decoder: &FrameDecoder) -> RenderFrame {
        let w = self.weight;
        let meshes = decoder
            .previous()
            .iter()
            .zip(decoder.current())
            .map(|(old, new)| old.iter().zip(new).map(|(a, b)| lerp(*a, *b, w)).collect())
            .collect();
        RenderFrame {
            meshes,
            translation: lerp(decoder.previous_position(), decoder.position(), w),
        }
    }
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::new(PlaybackConfig::default())
    }
}

/// Blended vertex buffers and root translation
#[derive(Debug, Clone, PartialEq)]
pub struct RenderFrame {
    pub meshes: Vec<Vec<Position>>,
    pub translation: Position,
}

fn lerp(a: Position, b: Position, w: f32) -> Position {
    [
        a[0] + (b[0] - a[0]) * w,
        a[1] + (b[1] - a[1]) * w,
        a[2] + (b[2] - a[2]) * w,
    ]
}
