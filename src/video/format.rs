//! Pixel format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Supported pixel formats
///
/// Only packed raster formats the normalizer understands are listed;
/// anything else a driver offers is rejected during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// BGR24 format (3 bytes per pixel, blue first)
    Bgr24,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// RGBA32 format (4 bytes per pixel, alpha last)
    Rgba32,
    /// Grayscale format (1 byte per pixel)
    Grey,
}

impl PixelFormat {
    /// Negotiation preference order, best first.
    ///
    /// BGR24 leads because most UVC drivers that expose packed RGB expose
    /// it blue-first; the normalizer corrects the channel order.
    pub const PREFERENCE: &'static [PixelFormat] = &[
        PixelFormat::Bgr24,
        PixelFormat::Rgb24,
        PixelFormat::Rgba32,
        PixelFormat::Grey,
    ];

    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Bgr24 => fourcc::FourCC::new(b"BGR3"),
            PixelFormat::Rgb24 => fourcc::FourCC::new(b"RGB3"),
            PixelFormat::Rgba32 => fourcc::FourCC::new(b"AB24"),
            PixelFormat::Grey => fourcc::FourCC::new(b"GREY"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"BGR3" => Some(PixelFormat::Bgr24),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"AB24" => Some(PixelFormat::Rgba32),
            b"GREY" | b"Y800" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
            PixelFormat::Grey => 1,
        }
    }

    /// Expected packed frame size for a resolution
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        resolution.pixels() as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Rgba32 => "RGBA32",
            PixelFormat::Grey => "GREY",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const QVGA: Resolution = Resolution {
        width: 320,
        height: 240,
    };
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const SVGA: Resolution = Resolution {
        width: 800,
        height: 600,
    };
    pub const XGA: Resolution = Resolution {
        width: 1024,
        height: 768,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };

    /// The selectable capture resolutions
    pub const PRESETS: &'static [Resolution] = &[
        Resolution::QVGA,
        Resolution::VGA,
        Resolution::SVGA,
        Resolution::XGA,
        Resolution::HD720,
        Resolution::HD1080,
    ];

    pub fn is_preset(&self) -> bool {
        Resolution::PRESETS.contains(self)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution: {} (expected WxH)", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid width: {}", w))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid height: {}", h))?;
        Ok(Resolution { width, height })
    }
}

/// The selectable frame rates
pub const FPS_PRESETS: &[u32] = &[10, 15, 20, 25, 30];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_round_trip() {
        for &fmt in PixelFormat::PREFERENCE {
            assert_eq!(PixelFormat::from_fourcc(fmt.to_fourcc()), Some(fmt));
        }
    }

    #[test]
    fn test_preference_starts_with_bgr() {
        assert_eq!(PixelFormat::PREFERENCE[0], PixelFormat::Bgr24);
        assert_eq!(
            PixelFormat::PREFERENCE.last(),
            Some(&PixelFormat::Grey)
        );
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Bgr24.frame_size(Resolution::VGA), 640 * 480 * 3);
        assert_eq!(PixelFormat::Rgba32.frame_size(Resolution::QVGA), 320 * 240 * 4);
        assert_eq!(PixelFormat::Grey.frame_size(Resolution::VGA), 640 * 480);
    }

    #[test]
    fn test_unknown_fourcc_rejected() {
        assert_eq!(
            PixelFormat::from_fourcc(fourcc::FourCC::new(b"MJPG")),
            None
        );
    }

    #[test]
    fn test_resolution_parse() {
        let res: Resolution = "1280x720".parse().unwrap();
        assert_eq!(res, Resolution::HD720);
        assert!("1280".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::HD1080.to_string(), "1920x1080");
    }

    #[test]
    fn test_presets() {
        assert!(Resolution::VGA.is_preset());
        assert!(!Resolution::new(123, 456).is_preset());
        assert!(FPS_PRESETS.contains(&25));
        assert!(!FPS_PRESETS.contains(&24));
    }
}
