//! Inference boundary.
//!
//! The model behind [`Predictor`] is opaque to the reader. [`ColorPredictor`]
//! stands in for a classifier so the consumer binary runs end to end without
//! model weights.

use log::info;
use serde::Serialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    pub score: f32,
}

pub trait Predictor: Send + Sync {
    /// Predictions for one frame, best first.
    fn predict(&self, frame: &Frame) -> Vec<Prediction>;
}

/// Scores each colour channel by its share of the frame's total intensity.
#[derive(Clone, Copy, Debug)]
pub struct ColorPredictor {
    topk: usize,
}

impl ColorPredictor {
    const LABELS: [&'static str; 3] = ["red", "green", "blue"];

    pub fn new(topk: usize) -> Self {
        Self { topk }
    }
}

impl Predictor for ColorPredictor {
    fn predict(&self, frame: &Frame) -> Vec<Prediction> {
        let mut sums = [0u64; 3];
        for pixel in frame.image.pixels() {
            for (sum, value) in sums.iter_mut().zip(pixel.0) {
                *sum += u64::from(value);
            }
        }
        let total = sums.iter().sum::<u64>().max(1) as f64;

        let mut predictions: Vec<Prediction> = Self::LABELS
            .iter()
            .zip(sums)
            .map(|(label, sum)| Prediction {
                label: label.to_string(),
                score: (sum as f64 / total) as f32,
            })
            .collect();
        predictions.sort_by(|a, b| b.score.total_cmp(&a.score));
        predictions.truncate(self.topk);
        predictions
    }
}

/// One line of consumer output.
#[derive(Debug, Serialize)]
pub struct InferenceEvent<'a> {
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
    pub sequence: u64,
    pub source: &'a str,
    pub latency_ms: f64,
    pub topk: Vec<Prediction>,
}

impl<'a> InferenceEvent<'a> {
    pub fn new(frame: &Frame, source: &'a str, latency: Duration, topk: Vec<Prediction>) -> Self {
        Self {
            timestamp: unix_seconds(frame.captured_at),
            sequence: frame.sequence,
            source,
            latency_ms: round2(latency.as_secs_f64() * 1000.0),
            topk,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub frames: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub fps: f64,
}

/// Inference latency and throughput, logged every `log_every` frames.
#[derive(Debug)]
pub struct Metrics {
    log_every: u64,
    frames: u64,
    errors: u64,
    total_latency: Duration,
    last_log: Instant,
}

impl Metrics {
    pub fn new(log_every: u64) -> Self {
        Self {
            log_every: log_every.max(1),
            frames: 0,
            errors: 0,
            total_latency: Duration::ZERO,
            last_log: Instant::now(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Records one frame and returns the snapshot when one is due.
    pub fn record(&mut self, latency: Duration, error: bool) -> Option<MetricsSnapshot> {
        self.frames += 1;
        self.total_latency += latency;
        if error {
            self.errors += 1;
        }
        if self.frames % self.log_every != 0 {
            return None;
        }

        let now = Instant::now();
        let snapshot = self.snapshot(now);
        match serde_json::to_string(&snapshot) {
            Ok(payload) => info!("metrics={payload}"),
            Err(_) => info!("metrics={snapshot:?}"),
        }
        self.last_log = now;
        Some(snapshot)
    }

    fn snapshot(&self, now: Instant) -> MetricsSnapshot {
        let elapsed = now
            .saturating_duration_since(self.last_log)
            .as_secs_f64()
            .max(1e-6);
        let avg = self.total_latency.as_secs_f64() / self.frames.max(1) as f64;
        MetricsSnapshot {
            frames: self.frames,
            errors: self.errors,
            avg_latency_ms: round2(avg * 1000.0),
            fps: round2(self.log_every as f64 / elapsed),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Seconds since the Unix epoch, 0 before it.
fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
