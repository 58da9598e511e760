//! Connection quality history for diagnostics

use shared::ConnectionStats;
use std::collections::VecDeque;

/// Connection metrics captured at one point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSample {
    /// Client time in seconds when the sample was taken
    pub time: f64,
    pub stats: ConnectionStats,
}

/// Fixed-interval sampler over a connection's RTT, loss and bandwidth
///
/// Samples are taken at most once per `sample_interval` and only the latest
/// `max_samples` are kept, so the history always covers a bounded window.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    // Historical data storage
    history: VecDeque<NetworkSample>,
    max_samples: usize,
    sample_interval: f64,
    last_sample_time: Option<f64>,

    // Display scaling
    rtt_scale_max: f32,
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::with_capacity(100, 0.1)
    }

    /// History of `max_samples` entries taken every `sample_interval` seconds
    pub fn with_capacity(max_samples: usize, sample_interval: f64) -> Self {
        Self {
            history: VecDeque::with_capacity(max_samples.max(1)),
            max_samples: max_samples.max(1),
            sample_interval,
            last_sample_time: None,
            rtt_scale_max: 100.0,
        }
    }

    /// Offers the current stats; returns true if a sample was recorded
    pub fn record(&mut self, time: f64, stats: ConnectionStats) -> bool {
        if let Some(last) = self.last_sample_time {
            if time - last < self.sample_interval {
                return false;
            }
        }
        self.last_sample_time = Some(time);

        self.history.push_back(NetworkSample { time, stats });
        while self.history.len() > self.max_samples {
            self.history.pop_front();
        }
        self.update_auto_scale();
        true
    }

    /// Update RTT scale based on recent data
    fn update_auto_scale(&mut self) {
        let max_rtt = self.max_rtt();

        // Headroom above the worst sample, never below 50 ms
        let desired_scale = (max_rtt * 1.2).max(50.0);

        // Smooth scale changes to prevent jitter
        self.rtt_scale_max = self.rtt_scale_max * 0.9 + desired_scale * 0.1;
    }

    pub fn samples(&self) -> impl Iterator<Item = &NetworkSample> {
        self.history.iter()
    }

    pub fn latest(&self) -> Option<&NetworkSample> {
        self.history.back()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn average_rtt(&self) -> f32 {
        self.average(|stats| stats.rtt)
    }

    pub fn max_rtt(&self) -> f32 {
        self.history
            .iter()
            .map(|sample| sample.stats.rtt)
            .fold(0.0f32, f32::max)
    }

    pub fn average_packet_loss(&self) -> f32 {
        self.average(|stats| stats.packet_loss)
    }

    /// Smoothed upper bound for plotting RTT, in milliseconds
    pub fn rtt_scale_max(&self) -> f32 {
        self.rtt_scale_max
    }

    /// Seconds between the oldest and newest sample
    pub fn time_span(&self) -> f64 {
        match (self.history.front(), self.history.back()) {
            (Some(first), Some(last)) => last.time - first.time,
            _ => 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.last_sample_time = None;
    }

    fn average(&self, metric: impl Fn(&ConnectionStats) -> f32) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let total: f32 = self.history.iter().map(|sample| metric(&sample.stats)).sum();
        total / self.history.len() as f32
    }
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self::new()
    }
}
