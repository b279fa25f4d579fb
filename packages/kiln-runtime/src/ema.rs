//! Multi-window exponential moving average of execution time
//!
//! Each window smooths with an alpha derived from the gap between samples,
//! `alpha = 1 - exp(-dt / window)`, so irregular sampling does not skew the
//! average the way a fixed-alpha EMA would.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Window {
    span: Duration,
    avg_secs: Option<f64>,
}

struct Inner {
    windows: Vec<Window>,
    last_sample: Option<Instant>,
}

pub struct ExecAvg {
    inner: Mutex<Inner>,
}

impl ExecAvg {
    /// Typical scheduler windows: one, five, and fifteen minutes
    pub fn standard() -> Self {
        Self::new(&[
            Duration::from_secs(60),
            Duration::from_secs(300),
            Duration::from_secs(900),
        ])
    }

    pub fn new(spans: &[Duration]) -> Self {
        ExecAvg {
            inner: Mutex::new(Inner {
                windows: spans
                    .iter()
                    .map(|span| Window {
                        span: *span,
                        avg_secs: None,
                    })
                    .collect(),
                last_sample: None,
            }),
        }
    }

    /// Fold one observed execution time into every window
    pub fn observe(&self, sample: Duration) {
        let now = Instant::now();
        let sample_secs = sample.as_secs_f64();
        let mut inner = self.inner.lock();

        let dt = inner
            .last_sample
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        inner.last_sample = Some(now);

        for window in inner.windows.iter_mut() {
            match window.avg_secs {
                None => window.avg_secs = Some(sample_secs),
                Some(ref mut avg) => {
                    let alpha = 1.0 - (-dt / window.span.as_secs_f64()).exp();
                    *avg += alpha * (sample_secs - *avg);
                }
            }
        }
    }

    /// Current average for the window closest to `span`
    pub fn value(&self, span: Duration) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .windows
            .iter()
            .min_by_key(|w| {
                let diff = w.span.as_secs_f64() - span.as_secs_f64();
                (diff.abs() * 1000.0) as u64
            })?
            .avg_secs
            .map(Duration::from_secs_f64)
    }

    /// All windows with their current averages
    pub fn snapshot(&self) -> Vec<(Duration, Option<Duration>)> {
        let inner = self.inner.lock();
        inner
            .windows
            .iter()
            .map(|w| (w.span, w.avg_secs.map(Duration::from_secs_f64)))
            .collect()
    }
}
