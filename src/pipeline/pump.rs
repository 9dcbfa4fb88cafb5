//! Capture-to-display/sink routing

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::capture::{BufferRequest, CaptureStream, FrameBuffer, FrameView, StreamInfo};
use crate::display::{DisplayCompositor, DisplayDevice, PlaneId};
use crate::pipeline::control::ControlInput;
use crate::pipeline::scheduler::{Dispatch, EventScheduler, Source, StopHandle};
use crate::pipeline::stats::Throughput;
use crate::sink::{DiscardSink, FrameSink};
use crate::{Error, Result, StreamIndex};

const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Sink,
    Display { plane: PlaneId },
}

struct PumpStream {
    capture: CaptureStream,
    route: Route,
    throughput: Throughput,
}

fn position(streams: &[PumpStream], index: StreamIndex) -> Result<usize> {
    streams
        .iter()
        .position(|s| s.capture.index() == index)
        .ok_or_else(|| Error::assertion(format!("no stream {}", index)))
}

/// Collects the pump's collaborators and performs pool setup.
#[derive(Default)]
pub struct PumpBuilder {
    streams: Vec<CaptureStream>,
    display: Option<Box<dyn DisplayDevice>>,
    sink: Option<Box<dyn FrameSink>>,
    save: Option<Box<dyn FrameSink>>,
    control: Option<ControlInput>,
    modeset_delay: Option<Duration>,
    stats_interval: Option<Duration>,
}

impl PumpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(mut self, stream: CaptureStream) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn display(mut self, device: Box<dyn DisplayDevice>) -> Self {
        self.display = Some(device);
        self
    }

    /// Consumer of frames from streams that are not displayed.
    pub fn sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Consumer of every frame, displayed or not, ahead of routing.
    pub fn save_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.save = Some(sink);
        self
    }

    pub fn control(mut self, control: ControlInput) -> Self {
        self.control = Some(control);
        self
    }

    pub fn modeset_delay(mut self, delay: Option<Duration>) -> Self {
        self.modeset_delay = delay;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    /// Bind planes and reserve every pool. No device streams yet.
    #[instrument(skip_all, fields(streams = self.streams.len()))]
    pub fn build(self) -> Result<FramePump> {
        if self.streams.is_empty() {
            return Err(Error::config("no capture streams"));
        }

        let mut seen = BTreeSet::new();
        for stream in &self.streams {
            if !seen.insert(stream.index()) {
                return Err(Error::config(format!("stream index {} used twice", stream.index())));
            }
        }

        let displayed: Vec<StreamInfo> = self
            .streams
            .iter()
            .filter(|s| s.info().display)
            .map(|s| s.info().clone())
            .collect();

        let mut compositor = match (self.display, displayed.is_empty()) {
            (Some(device), false) => Some(DisplayCompositor::new(device)),
            (None, false) => {
                return Err(Error::config("streams marked for display but no display device"))
            }
            (Some(device), true) => {
                warn!(device = device.name(), "display opened but no stream is displayed");
                None
            }
            (None, true) => None,
        };

        let mut display_requests = match compositor.as_mut() {
            Some(compositor) => {
                let infos: Vec<&StreamInfo> = displayed.iter().collect();
                compositor.add_planes(&infos)?
            }
            None => Vec::new(),
        }
        .into_iter();

        let interval = self.stats_interval.unwrap_or(DEFAULT_STATS_INTERVAL);
        let mut streams = Vec::with_capacity(self.streams.len());

        for mut capture in self.streams {
            let index = capture.index();
            let (request, route) = if capture.info().display {
                let request = display_requests
                    .next()
                    .ok_or_else(|| Error::assertion(format!("stream {}: no plane", index)))?;
                let plane = compositor
                    .as_ref()
                    .and_then(|c| c.planes().iter().find(|p| p.stream() == index))
                    .map(|p| p.plane())
                    .ok_or_else(|| Error::assertion(format!("stream {}: no plane", index)))?;
                (request, Route::Display { plane })
            } else {
                (BufferRequest::Mmap(capture.info().buffer_count), Route::Sink)
            };

            capture.reserve(request)?;
            streams.push(PumpStream {
                capture,
                route,
                throughput: Throughput::new(index, interval),
            });
        }

        Ok(FramePump {
            streams,
            compositor,
            sink: self.sink.unwrap_or_else(|| Box::new(DiscardSink)),
            save: self.save,
            control: self.control,
            modeset_delay: self.modeset_delay,
            started: false,
            shut_down: false,
        })
    }
}

/// Owns every capture stream, the optional compositor and the sink, and
/// moves buffers between them on readiness callbacks.
pub struct FramePump {
    streams: Vec<PumpStream>,
    compositor: Option<DisplayCompositor>,
    sink: Box<dyn FrameSink>,
    save: Option<Box<dyn FrameSink>>,
    control: Option<ControlInput>,
    modeset_delay: Option<Duration>,
    started: bool,
    shut_down: bool,
}

impl FramePump {
    pub fn builder() -> PumpBuilder {
        PumpBuilder::new()
    }

    /// Put the initial frames on screen, then turn every stream on in
    /// order. If any stream fails to start, the ones already started are
    /// turned off again.
    #[instrument(skip_all)]
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::assertion("pump started twice"));
        }
        self.started = true;

        if let Some(compositor) = self.compositor.as_mut() {
            let mut initial = Vec::new();
            for stream in self
                .streams
                .iter_mut()
                .filter(|s| matches!(s.route, Route::Display { .. }))
            {
                let buf = stream.capture.detach_idle().ok_or_else(|| {
                    Error::assertion(format!(
                        "stream {}: no buffer for the initial frame",
                        stream.capture.index()
                    ))
                })?;
                initial.push(buf);
            }
            compositor.modeset(initial)?;

            if let Some(delay) = self.modeset_delay {
                info!("waiting {:?} for the display to settle", delay);
                thread::sleep(delay);
            }
        }

        for i in 0..self.streams.len() {
            if let Err(e) = self.streams[i].capture.start() {
                for started in self.streams[..i].iter_mut().rev() {
                    if let Err(stop_err) = started.capture.stop() {
                        warn!(
                            device = %started.capture.info().device,
                            "stream off after failed start: {}",
                            stop_err
                        );
                    }
                }
                return Err(e);
            }
            self.streams[i].throughput.start();
        }

        info!(streams = self.streams.len(), "pump started");
        Ok(())
    }

    pub fn register(&self, scheduler: &mut EventScheduler) -> Result<()> {
        if let Some(control) = &self.control {
            scheduler.register(control.readiness_fd(), Source::Control)?;
        }
        if let Some(compositor) = &self.compositor {
            scheduler.register(compositor.readiness_fd(), Source::Display)?;
        }
        for stream in &self.streams {
            scheduler.register(stream.capture.readiness_fd(), Source::Capture(stream.capture.index()))?;
        }
        Ok(())
    }

    /// One completed capture on `index`: take it and route it.
    pub fn on_capture_ready(&mut self, index: StreamIndex) -> Result<()> {
        let slot = position(&self.streams, index)?;
        let stream = &mut self.streams[slot];

        let buf = stream.capture.take()?;
        stream.throughput.record();

        if let Some(save) = self.save.as_mut() {
            let saved = save.consume(FrameView {
                stream: stream.capture.info(),
                buffer: &buf,
                data: stream.capture.data(&buf),
            });
            if let Err(e) = saved {
                stream.capture.give(buf)?;
                return Err(e);
            }
        }

        match stream.route {
            Route::Display { .. } => {
                let compositor = self.compositor.as_mut().ok_or_else(|| {
                    Error::assertion(format!("stream {} routed to missing display", index))
                })?;
                compositor.enqueue(buf)?;
                compositor.present_pending()?;
            }
            Route::Sink => {
                let consumed = {
                    let view = FrameView {
                        stream: stream.capture.info(),
                        buffer: &buf,
                        data: stream.capture.data(&buf),
                    };
                    self.sink.consume(view)
                };
                stream.capture.give(buf)?;
                consumed?;
            }
        }
        Ok(())
    }

    /// Flip completion: recycle retired buffers, then present whatever
    /// queued up while the flip was outstanding.
    pub fn on_display_completion(&mut self) -> Result<()> {
        let compositor = self
            .compositor
            .as_mut()
            .ok_or_else(|| Error::assertion("display completion without a display"))?;
        let retired = compositor.complete_flips()?;

        for buf in retired {
            self.give_back(buf)?;
        }

        if let Some(compositor) = self.compositor.as_mut() {
            compositor.present_pending()?;
        }
        Ok(())
    }

    /// Turn every stream off in reverse order. Best effort: every stream is
    /// attempted, the first error is returned.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let mut first_err = None;
        for stream in self.streams.iter_mut().rev() {
            if let Err(e) = stream.capture.stop() {
                warn!(device = %stream.capture.info().device, "stream off failed: {}", e);
                first_err.get_or_insert(e);
            }
        }

        if let Some(compositor) = &self.compositor {
            info!(
                issued = compositor.flips_issued(),
                completed = compositor.flips_completed(),
                "display idle"
            );
        }
        for stream in &self.streams {
            info!(
                stream = stream.capture.index(),
                frames = stream.throughput.total(),
                first_frame = ?stream.throughput.first_frame_latency(),
                "stream finished"
            );
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Buffers of `index` accounted for across the capture queue, idle
    /// pool and display. Equals the pool size between dispatches.
    pub fn accounted_buffers(&self, index: StreamIndex) -> Result<usize> {
        let stream = &self.streams[position(&self.streams, index)?];
        let held = self
            .compositor
            .as_ref()
            .map(|c| c.held(index))
            .unwrap_or(0);
        Ok(stream.capture.queued_count() + stream.capture.idle_count() + held)
    }

    pub fn compositor(&self) -> Option<&DisplayCompositor> {
        self.compositor.as_ref()
    }

    pub fn frames(&self, index: StreamIndex) -> u64 {
        position(&self.streams, index)
            .map(|slot| self.streams[slot].throughput.total())
            .unwrap_or(0)
    }

    /// Stream-on to first frame of `index`, once a frame has arrived.
    pub fn first_frame_latency(&self, index: StreamIndex) -> Option<Duration> {
        position(&self.streams, index)
            .ok()
            .and_then(|slot| self.streams[slot].throughput.first_frame_latency())
    }

    /// Human-readable routing plan, one line per stream.
    pub fn plan(&self) -> Vec<String> {
        self.streams
            .iter()
            .map(|s| {
                let info = s.capture.info();
                let head = format!(
                    "stream {}: {} {}x{} {} x{}",
                    info.index, info.device, info.width, info.height, info.format, info.buffer_count
                );
                match (s.route, self.compositor.as_ref()) {
                    (Route::Display { plane }, Some(c)) => {
                        let geometry = c
                            .planes()
                            .iter()
                            .find(|p| p.stream() == info.index)
                            .map(|p| p.geometry());
                        match geometry {
                            Some(g) => format!(
                                "{} -> plane {} src {:?} dst {:?}",
                                head, plane.0, g.src, g.dst
                            ),
                            None => format!("{} -> plane {}", head, plane.0),
                        }
                    }
                    _ => format!("{} -> sink", head),
                }
            })
            .collect()
    }

    pub fn log_plan(&self) {
        for line in self.plan() {
            info!("{}", line);
        }
    }

    fn give_back(&mut self, buf: FrameBuffer) -> Result<()> {
        let slot = position(&self.streams, buf.stream())?;
        debug!(stream = buf.stream(), index = buf.index(), "retired");
        self.streams[slot].capture.give(buf)
    }
}

impl Dispatch for FramePump {
    fn dispatch(&mut self, source: Source, stop: &StopHandle) -> Result<()> {
        match source {
            Source::Control => {
                let control = self
                    .control
                    .as_mut()
                    .ok_or_else(|| Error::assertion("control readiness without control input"))?;
                control.drain()?;
                stop.stop();
                Ok(())
            }
            Source::Display => self.on_display_completion(),
            Source::Capture(index) => self.on_capture_ready(index),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        FramePump::shutdown(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::display::CommitMode;
    use crate::testing::{CaptureHandle, DisplayHandle, MockCapture, MockDisplay, RecordingSink};

    fn stream(index: StreamIndex, buffer_count: usize, display: bool) -> (CaptureStream, CaptureHandle) {
        let device = format!("/dev/video{index}");
        let (mock, handle) = MockCapture::new(&device);
        let info = StreamInfo {
            index,
            device,
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            buffer_count,
            display,
            embedded: false,
        };
        (CaptureStream::new(info, Box::new(mock)), handle)
    }

    fn displayed_pump(buffer_count: usize) -> (FramePump, CaptureHandle, DisplayHandle) {
        let (capture, cap) = stream(0, buffer_count, true);
        let (display, disp) = MockDisplay::new();
        let pump = FramePump::builder()
            .stream(capture)
            .display(Box::new(display))
            .build()
            .unwrap();
        (pump, cap, disp)
    }

    /// Deliver the outstanding flip completion.
    fn complete(pump: &mut FramePump, disp: &DisplayHandle) {
        disp.complete_flip();
        pump.on_display_completion().unwrap();
    }

    #[test]
    fn test_single_display_stream_flips_and_recycles() {
        let (mut pump, cap, disp) = displayed_pump(3);
        pump.start().unwrap();
        assert_eq!(cap.queue(), vec![1, 2]);

        pump.on_capture_ready(0).unwrap();

        let commits = disp.commits();
        assert_eq!(commits.len(), 2);
        let (mode, txn) = &commits[1];
        assert_eq!(*mode, CommitMode::Flip);
        assert_eq!(txn.len(), 1);
        let compositor = pump.compositor().unwrap();
        assert_eq!(txn.assignments()[0].fb, compositor.framebuffer(0, 1).unwrap());
        assert_eq!(compositor.on_screen(0).unwrap().index(), 1);

        complete(&mut pump, &disp);
        assert_eq!(cap.queue(), vec![2, 0]);
        assert_eq!(disp.flips(), 1);
        assert_eq!(pump.accounted_buffers(0).unwrap(), 3);
    }

    #[test]
    fn test_flips_track_completions_under_latency() {
        let (display_capture, cap) = stream(0, 5, true);
        let (side_capture, side) = stream(1, 4, false);
        let (display, disp) = MockDisplay::new();
        let sink = RecordingSink::default();

        let mut pump = FramePump::builder()
            .stream(display_capture)
            .stream(side_capture)
            .display(Box::new(display))
            .sink(Box::new(sink.clone()))
            .build()
            .unwrap();
        pump.start().unwrap();

        let mut last_taken = None;
        for event in 0..12 {
            // The display catches up every other frame, or whenever the
            // capture queue ran dry.
            let in_flight = pump.compositor().unwrap().flip_in_flight();
            if in_flight && (event % 2 == 0 || cap.queue().is_empty()) {
                complete(&mut pump, &disp);
            }

            last_taken = cap.queue().first().copied();
            pump.on_capture_ready(0).unwrap();
            pump.on_capture_ready(1).unwrap();

            assert_eq!(pump.accounted_buffers(0).unwrap(), 5);
            assert_eq!(pump.accounted_buffers(1).unwrap(), 4);
            assert_eq!(side.queue().len(), 4);
        }

        while pump.compositor().unwrap().flip_in_flight() {
            complete(&mut pump, &disp);
        }

        let compositor = pump.compositor().unwrap();
        assert_eq!(compositor.flips_issued(), compositor.flips_completed());
        assert_eq!(compositor.flips_issued() as usize, disp.flips());
        assert_eq!(compositor.pending_depth(0), 0);
        assert_eq!(compositor.on_screen(0).map(|b| b.index()), last_taken);
        assert_eq!(sink.frames().len(), 12);
        assert_eq!(pump.frames(0), 12);
    }

    #[test]
    fn test_modeset_once_before_first_flip() {
        let (capture0, _c0) = stream(0, 3, true);
        let (capture1, _c1) = stream(1, 3, true);
        let (display, disp) = MockDisplay::new();
        let mut pump = FramePump::builder()
            .stream(capture0)
            .stream(capture1)
            .display(Box::new(display))
            .build()
            .unwrap();
        assert!(disp.commits().is_empty());

        pump.start().unwrap();
        pump.on_capture_ready(1).unwrap();
        pump.on_capture_ready(0).unwrap();
        complete(&mut pump, &disp);

        let modes: Vec<CommitMode> = disp.commits().iter().map(|(m, _)| *m).collect();
        assert_eq!(modes, vec![CommitMode::Modeset, CommitMode::Flip, CommitMode::Flip]);
        assert_eq!(disp.commits()[0].1.len(), 2);
        // Stream 0 waited out stream 1's flip and went alone.
        assert_eq!(disp.commits()[2].1.len(), 1);
    }

    #[test]
    fn test_sink_path_returns_buffers_immediately() {
        let (capture, cap) = stream(2, 3, false);
        let sink = RecordingSink::default();
        let mut pump = FramePump::builder()
            .stream(capture)
            .sink(Box::new(sink.clone()))
            .build()
            .unwrap();
        assert_eq!(cap.reserved(), Some(BufferRequest::Mmap(3)));
        pump.start().unwrap();

        for _ in 0..4 {
            pump.on_capture_ready(2).unwrap();
            assert_eq!(pump.accounted_buffers(2).unwrap(), 3);
        }

        assert_eq!(
            sink.frames(),
            vec![(2, 0, 16), (2, 1, 16), (2, 2, 16), (2, 0, 16)]
        );
    }

    #[test]
    fn test_save_sink_sees_displayed_frames() {
        let (display_capture, _cap) = stream(0, 3, true);
        let (side_capture, _side) = stream(1, 3, false);
        let (display, disp) = MockDisplay::new();
        let saved = RecordingSink::default();
        let sent = RecordingSink::default();

        let mut pump = FramePump::builder()
            .stream(display_capture)
            .stream(side_capture)
            .display(Box::new(display))
            .sink(Box::new(sent.clone()))
            .save_sink(Box::new(saved.clone()))
            .build()
            .unwrap();
        pump.start().unwrap();

        pump.on_capture_ready(0).unwrap();
        pump.on_capture_ready(1).unwrap();
        complete(&mut pump, &disp);
        pump.on_capture_ready(0).unwrap();

        assert_eq!(saved.frames(), vec![(0, 1, 16), (1, 0, 16), (0, 2, 16)]);
        assert_eq!(sent.frames(), vec![(1, 0, 16)]);
        assert_eq!(disp.flips(), 2);
        assert_eq!(pump.accounted_buffers(0).unwrap(), 3);
    }

    struct BrokenSink;

    impl FrameSink for BrokenSink {
        fn consume(&mut self, _frame: FrameView<'_>) -> Result<()> {
            Err(Error::device("/tmp/full", std::io::Error::other("no space left")))
        }
    }

    #[test]
    fn test_failed_save_returns_buffer_and_fails() {
        let (mut pump, cap, disp) = {
            let (capture, cap) = stream(0, 3, true);
            let (display, disp) = MockDisplay::new();
            let pump = FramePump::builder()
                .stream(capture)
                .display(Box::new(display))
                .save_sink(Box::new(BrokenSink))
                .build()
                .unwrap();
            (pump, cap, disp)
        };
        pump.start().unwrap();

        let err = pump.on_capture_ready(0).unwrap_err();
        assert!(matches!(err, Error::DeviceIo { .. }));
        assert_eq!(disp.flips(), 0);
        assert_eq!(cap.queue(), vec![2, 1]);
        assert_eq!(pump.accounted_buffers(0).unwrap(), 3);
    }

    #[test]
    fn test_first_frame_latency_starts_at_stream_on() {
        let (capture, _cap) = stream(0, 3, false);
        let mut pump = FramePump::builder().stream(capture).build().unwrap();
        pump.start().unwrap();
        assert!(pump.first_frame_latency(0).is_none());

        pump.on_capture_ready(0).unwrap();
        let latency = pump.first_frame_latency(0).unwrap();
        assert!(latency < Duration::from_secs(5));
        assert!(pump.first_frame_latency(7).is_none());
    }

    #[test]
    fn test_failed_start_turns_earlier_streams_off() {
        let (first, c0) = stream(0, 3, false);
        let (second, c1) = stream(1, 3, false);
        c1.fail_stream_on();

        let mut pump = FramePump::builder()
            .stream(first)
            .stream(second)
            .build()
            .unwrap();
        let err = pump.start().unwrap_err();

        assert!(matches!(err, Error::DeviceIo { .. }));
        assert_eq!(c0.stream_on_calls(), 1);
        assert_eq!(c0.stream_off_calls(), 1);
        assert!(!c0.streaming());
        assert!(!c1.streaming());
    }

    #[test]
    fn test_display_stream_without_display_rejected() {
        let (capture, _cap) = stream(0, 3, true);
        let err = FramePump::builder().stream(capture).build().err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_failed_flip_commit_is_fatal() {
        let (mut pump, _cap, disp) = displayed_pump(3);
        pump.start().unwrap();
        disp.fail_commits();
        assert!(matches!(
            pump.on_capture_ready(0),
            Err(Error::DeviceIo { .. })
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut pump, cap, _disp) = displayed_pump(3);
        pump.start().unwrap();
        pump.shutdown().unwrap();
        pump.shutdown().unwrap();
        assert_eq!(cap.stream_off_calls(), 1);
    }

    #[test]
    fn test_scheduler_drives_pump_until_control_stop() {
        let (capture, cap) = stream(0, 4, true);
        let (display, disp) = MockDisplay::new();
        let control = ControlInput::signal().unwrap();
        let trigger = control.trigger().unwrap();

        let mut pump = FramePump::builder()
            .stream(capture)
            .display(Box::new(display))
            .control(control)
            .build()
            .unwrap();
        pump.start().unwrap();

        let mut scheduler = EventScheduler::new();
        pump.register(&mut scheduler).unwrap();
        assert_eq!(
            scheduler.sources().collect::<Vec<_>>(),
            vec![Source::Control, Source::Display, Source::Capture(0)]
        );

        cap.ring();
        trigger.fire().unwrap();
        scheduler.run(&mut pump).unwrap();

        assert_eq!(disp.flips(), 1);
        assert_eq!(pump.frames(0), 1);
        assert_eq!(cap.stream_off_calls(), 1);
        assert!(!cap.streaming());
    }
}
