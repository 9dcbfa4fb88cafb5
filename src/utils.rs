use std::fs;

use tracing::{debug, info};
use v4l::Device;

use crate::{Error, Result};

/// Does a V4L2 card/driver name match `pattern`? A trailing `*` matches
/// any suffix.
pub fn card_matches(pattern: &str, card: &str, driver: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => card.starts_with(prefix) || driver.starts_with(prefix),
        None => card == pattern || driver == pattern,
    }
}

/// Numeric suffix of a `/dev/videoN` entry name.
fn video_index(name: &str) -> Option<u32> {
    name.strip_prefix("video")?.parse().ok()
}

/// Find the first `/dev/video*` node whose card name matches `pattern`.
pub fn find_video_device(pattern: &str) -> Result<String> {
    info!("Looking for capture device '{}'", pattern);

    let entries = fs::read_dir("/dev").map_err(|e| Error::device("/dev", e))?;
    let mut nodes: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(video_index))
        .collect();
    nodes.sort_unstable();

    for n in nodes {
        let path = format!("/dev/video{}", n);
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };

        debug!("{}: {} ({})", path, caps.card, caps.driver);
        if card_matches(pattern, &caps.card, &caps.driver) {
            info!("Found {} at {}", caps.card, path);
            return Ok(path);
        }
    }

    Err(Error::config(format!("no video device named '{}'", pattern)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_matching() {
        assert!(card_matches("rp1-cfe", "rp1-cfe", "rp1-cfe"));
        assert!(card_matches("rp1-*", "rp1-cfe-csi2_ch0", "rp1-cfe"));
        assert!(card_matches("uvcvideo", "HD Webcam", "uvcvideo"));
        assert!(!card_matches("rp1-cfe", "rp1-cfe-csi2_ch0", "x"));
    }

    #[test]
    fn test_video_index_parsing() {
        assert_eq!(video_index("video12"), Some(12));
        assert_eq!(video_index("video-loop"), None);
        assert_eq!(video_index("vhci"), None);
    }
}
