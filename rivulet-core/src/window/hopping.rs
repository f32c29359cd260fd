use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::window::Window;

/// Overlapping windows: a new window starts every advance interval, so an
/// event time falls in up to `length / advance` windows.
#[derive(Debug, Clone)]
pub struct HoppingWindower {
    window_length: Duration,
    advance: Duration,
}

impl HoppingWindower {
    pub(crate) fn new(window_length: Duration, advance: Duration) -> Self {
        Self {
            window_length,
            advance,
        }
    }

    pub(crate) fn assign_windows(&self, event_time: DateTime<Utc>) -> Vec<Window> {
        let length_millis = self.window_length.as_millis() as i64;
        let advance_millis = self.advance.as_millis() as i64;
        let event_millis = event_time.timestamp_millis();

        let mut start_millis = event_millis.div_euclid(advance_millis) * advance_millis;
        let mut windows = Vec::new();
        while start_millis + length_millis > event_millis {
            windows.push(Window::from_millis(
                start_millis,
                start_millis + length_millis,
            ));
            start_millis -= advance_millis;
        }
        // Oldest first.
        windows.reverse();
        windows
    }
}
