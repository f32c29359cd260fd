use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::window::Window;

/// Non-overlapping windows: the advance interval equals the window length, so
/// every event time falls in exactly one aligned window.
#[derive(Debug, Clone)]
pub struct TumblingWindower {
    window_length: Duration,
}

impl TumblingWindower {
    pub(crate) fn new(window_length: Duration) -> Self {
        Self { window_length }
    }

    pub(crate) fn assign_windows(&self, event_time: DateTime<Utc>) -> Vec<Window> {
        let length_millis = self.window_length.as_millis() as i64;
        let event_millis = event_time.timestamp_millis();
        // Euclidean division floors pre-epoch timestamps toward the aligned
        // start instead of truncating toward zero.
        let start_millis = event_millis.div_euclid(length_millis) * length_millis;
        vec![Window::from_millis(
            start_millis,
            start_millis + length_millis,
        )]
    }
}
