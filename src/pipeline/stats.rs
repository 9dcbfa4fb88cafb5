use std::time::{Duration, Instant};

use tracing::info;

use crate::StreamIndex;

/// One closed throughput window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub frames: u64,
    pub elapsed: Duration,
    pub fps: f64,
}

/// Rolling per-stream frame counter, diagnostics only.
#[derive(Debug)]
pub struct Throughput {
    stream: StreamIndex,
    interval: Duration,
    started: Option<Instant>,
    first_frame: Option<Duration>,
    window_start: Option<Instant>,
    window_frames: u64,
    total: u64,
}

impl Throughput {
    pub fn new(stream: StreamIndex, interval: Duration) -> Self {
        Self {
            stream,
            interval,
            started: None,
            first_frame: None,
            window_start: None,
            window_frames: 0,
            total: 0,
        }
    }

    /// Mark stream-on. The first window opens here.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        self.started = Some(now);
        self.first_frame = None;
        self.window_start = Some(now);
        self.window_frames = 0;
    }

    /// Stream-on to first completed frame.
    pub fn first_frame_latency(&self) -> Option<Duration> {
        self.first_frame
    }

    pub fn record(&mut self) -> Option<Sample> {
        self.record_at(Instant::now())
    }

    pub fn record_at(&mut self, now: Instant) -> Option<Sample> {
        self.total += 1;
        metrics::counter!("frames_captured", "stream" => self.stream.to_string()).increment(1);

        if self.total == 1 {
            match self.started {
                Some(started) => {
                    let latency = now.saturating_duration_since(started);
                    self.first_frame = Some(latency);
                    info!(stream = self.stream, "first frame in {:.2} s", latency.as_secs_f64());
                }
                None => info!(stream = self.stream, "first frame"),
            }
        }

        let start = *self.window_start.get_or_insert(now);
        self.window_frames += 1;

        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        let sample = Sample {
            frames: self.window_frames,
            elapsed,
            fps: self.window_frames as f64 / elapsed.as_secs_f64(),
        };
        info!(
            stream = self.stream,
            total = self.total,
            "{} frames in {:.2} s, {:.2} fps",
            sample.frames,
            sample.elapsed.as_secs_f64(),
            sample.fps
        );

        self.window_start = Some(now);
        self.window_frames = 0;
        Some(sample)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
