pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod utils;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::{PixelFormat, StreamInfo};
use serde::{Deserialize, Serialize};

pub use error::{Backpressure, Error, Result};
pub use sink::StreamFilter;

/// Position of a stream in the configuration, stable for the process.
pub type StreamIndex = usize;

/// Environment overrides, e.g. `FRAMEPUMP__DISPLAY__ENABLED=true`.
pub const ENV_PREFIX: &str = "FRAMEPUMP";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub streams: Vec<StreamDescriptor>,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// One capture device as described by the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Video node path.
    #[serde(default)]
    pub device: Option<String>,
    /// V4L2 card name to look up when no path is given. A trailing `*`
    /// matches any suffix.
    #[serde(default)]
    pub card: Option<String>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    #[serde(default = "default_true")]
    pub display: bool,
    /// Sensor embedded-data (metadata) stream.
    #[serde(default)]
    pub embedded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    pub card: String,
    /// Pause between modeset and stream-on, for slow monitors.
    pub modeset_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub save_dir: Option<PathBuf>,
    pub tx: Option<TxConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfig {
    pub address: String,
    #[serde(default)]
    pub streams: StreamFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub stats_interval_secs: u64,
    /// Core to pin the pump thread to.
    pub cpu_affinity: Option<usize>,
    pub control: ControlKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// Stop on Enter.
    Stdin,
    /// Stop on SIGINT/SIGTERM.
    #[default]
    Signal,
}

fn default_buffer_count() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            card: "/dev/dri/card0".into(),
            modeset_delay_secs: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 5,
            cpu_affinity: None,
            control: ControlKind::Signal,
        }
    }
}

impl Config {
    /// Load a TOML file, overlaid with `FRAMEPUMP__*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    fn displayed(&self, stream: &StreamDescriptor) -> bool {
        self.display.enabled && stream.display
    }

    /// Reject topologies the pump cannot run. Nothing is opened here.
    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(Error::config("no streams configured"));
        }

        for (index, stream) in self.streams.iter().enumerate() {
            let name = stream
                .device
                .as_deref()
                .or(stream.card.as_deref())
                .ok_or_else(|| Error::config(format!("stream {}: no device or card", index)))?;

            if stream.buffer_count == 0 {
                return Err(Error::config(format!("{}: buffer_count must be at least 1", name)));
            }
            if stream.width == 0 || stream.height == 0 {
                return Err(Error::config(format!(
                    "{}: invalid size {}x{}",
                    name, stream.width, stream.height
                )));
            }

            if self.displayed(stream) {
                // One buffer always sits on screen.
                if stream.buffer_count < 2 {
                    return Err(Error::config(format!(
                        "{}: a displayed stream needs at least 2 buffers",
                        name
                    )));
                }
                if stream.pixel_format.display_format().is_none() {
                    return Err(Error::config(format!(
                        "{}: {} cannot be displayed",
                        name, stream.pixel_format
                    )));
                }
            }
        }

        let displayed = self.streams.iter().filter(|s| self.displayed(s)).count();
        if displayed > display::layout::MAX_PLANES {
            return Err(Error::config(format!(
                "{} streams displayed, at most {} planes",
                displayed,
                display::layout::MAX_PLANES
            )));
        }

        Ok(())
    }

    pub fn any_displayed(&self) -> bool {
        self.streams.iter().any(|s| self.displayed(s))
    }

    /// Resolve descriptors into stream identities, looking up cards by name.
    pub fn stream_infos(&self) -> Result<Vec<StreamInfo>> {
        self.streams
            .iter()
            .enumerate()
            .map(|(index, stream)| {
                let device = match (&stream.device, &stream.card) {
                    (Some(path), _) => path.clone(),
                    (None, Some(card)) => utils::find_video_device(card)?,
                    (None, None) => {
                        return Err(Error::config(format!("stream {}: no device or card", index)))
                    }
                };
                Ok(StreamInfo {
                    index,
                    device,
                    width: stream.width,
                    height: stream.height,
                    format: stream.pixel_format,
                    buffer_count: stream.buffer_count,
                    display: self.displayed(stream),
                    embedded: stream.embedded,
                })
            })
            .collect()
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.stats_interval_secs.max(1))
    }

    pub fn modeset_delay(&self) -> Option<Duration> {
        self.display.modeset_delay_secs.map(Duration::from_secs)
    }
}
