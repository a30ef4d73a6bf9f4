use serde::{Deserialize, Serialize};

#[cfg(feature = "v4l2")]
use tracing::{debug, info};
#[cfg(feature = "v4l2")]
use v4l::{capability::Flags, video::Capture, Device, FourCC};

/// FourCCs of 16-bit little-endian depth formats we can stream directly
pub const DEPTH_FOURCCS: [[u8; 4]; 2] = [*b"Z16 ", *b"Y16 "];

/// Depth-capable V4L2 node found while scanning `/dev`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub card: String,
    pub bus: String,
    pub driver: String,
    pub fourcc: [u8; 4],
}

/// Scan `/dev/video*` for capture nodes offering a 16-bit depth format
#[cfg(feature = "v4l2")]
pub fn find_depth_nodes() -> Vec<FoundDevice> {
    use std::path::Path;

    debug!("Scanning for V4L2 depth nodes...");

    let mut found = Vec::new();
    for i in 0..64 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        if let Some(dev) = probe_depth_node(&path) {
            info!(path = %dev.path, card = %dev.card, "Found depth node");
            found.push(dev);
        }
    }
    found
}

/// Check a single node for depth capture support
#[cfg(feature = "v4l2")]
pub fn probe_depth_node(path: &str) -> Option<FoundDevice> {
    let dev = Device::with_path(path).ok()?;
    let caps = dev.query_caps().ok()?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return None;
    }

    let formats = dev.enum_formats().ok()?;
    let fourcc = DEPTH_FOURCCS
        .iter()
        .find(|want| formats.iter().any(|f| f.fourcc == FourCC::new(want)))?;

    Some(FoundDevice {
        path: path.to_string(),
        card: caps.card,
        bus: caps.bus,
        driver: caps.driver,
        fourcc: *fourcc,
    })
}

/// Principal point used when the caller passes the zero sentinel.
///
/// Only `x == 0` is checked, so `(0, y)` also selects the image center and
/// an actual principal point at the origin cannot be expressed.
pub fn default_principal_point(x: f32, y: f32, width: u32, height: u32) -> (f32, f32) {
    if x == 0.0 {
        ((width / 2) as f32, (height / 2) as f32)
    } else {
        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_principal_point_selects_center() {
        assert_eq!(default_principal_point(0.0, 0.0, 512, 424), (256.0, 212.0));
        assert_eq!(default_principal_point(0.0, 17.0, 640, 480), (320.0, 240.0));
        assert_eq!(default_principal_point(255.3, 208.1, 512, 424), (255.3, 208.1));
    }

    #[test]
    fn odd_dimensions_round_down() {
        assert_eq!(default_principal_point(0.0, 0.0, 511, 423), (255.0, 211.0));
    }
}
