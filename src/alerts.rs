use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// An immutable record of one positive detection or one analysis error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub confidence: Option<f32>,
}

/// Ordered alert list plus the derived detection counter.
#[derive(Debug, Default)]
pub struct AlertLog {
    alerts: Vec<Alert>,
    detection_count: u64,
    sequence: AtomicU64,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Millisecond timestamp plus a sequence number, so alerts raised in the
    /// same millisecond still get distinct ids.
    fn next_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", now.timestamp_millis(), seq)
    }

    fn push(&mut self, message: String, confidence: Option<f32>) -> Alert {
        let now = Utc::now();
        let alert = Alert {
            id: self.next_id(now),
            timestamp: now,
            message,
            confidence,
        };
        self.alerts.push(alert.clone());
        alert
    }

    /// Appends a detection alert and bumps the detection counter.
    pub fn record_detection(&mut self, message: String, confidence: f32) -> Alert {
        self.detection_count += 1;
        self.push(message, Some(confidence))
    }

    /// Appends an error alert; the detection counter is untouched.
    pub fn record_error(&mut self, error: &str) -> Alert {
        self.push(format!("Detection error: {}", error), Some(0.0))
    }

    /// Removes exactly the alert with `id`. Returns whether one was removed.
    pub fn dismiss(&mut self, id: &str) -> bool {
        match self.alerts.iter().position(|alert| alert.id == id) {
            Some(index) => {
                self.alerts.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn detection_count(&self) -> u64 {
        self.detection_count
    }
}
