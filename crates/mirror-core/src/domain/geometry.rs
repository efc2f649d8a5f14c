//! Display geometry: video-size fitting and view-to-device coordinate mapping.
//!
//! All sizes are in device pixels.  Orientation is a quadrant 0-3 counting
//! 90° steps clockwise from the display's natural orientation.

use serde::{Deserialize, Serialize};

/// Largest width or height the video encoder accepts.
pub const MAX_ENCODER_RESOLUTION: u32 = 2048;

/// A width/height pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns `true` if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns the size after rotating by `quadrants` quarter turns.
    pub fn rotated_by_quadrants(self, quadrants: u8) -> Self {
        if quadrants % 2 == 0 {
            self
        } else {
            Self::new(self.height, self.width)
        }
    }
}

/// A point in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Computes the encoded video size for one render pass.
///
/// The display is first rotated to `orientation`, then scaled down (never
/// up) to fit inside both `max_resolution` and [`MAX_ENCODER_RESOLUTION`]
/// while preserving its aspect ratio.  A zero dimension in `max_resolution`
/// means "no limit" on that axis.  Both dimensions are rounded down to even
/// numbers because hardware encoders reject odd sizes.
///
/// Returns [`Size::default`] for an empty display.
///
/// # Examples
///
/// ```rust
/// use mirror_core::domain::geometry::{compute_video_size, Size};
///
/// let size = compute_video_size(Size::new(1080, 2400), 0, Size::new(200, 180));
/// assert_eq!(size, Size::new(80, 180));
/// ```
pub fn compute_video_size(display: Size, orientation: u8, max_resolution: Size) -> Size {
    let rotated = display.rotated_by_quadrants(orientation);
    if rotated.is_empty() {
        return Size::default();
    }
    let limit = |max: u32| {
        if max == 0 {
            MAX_ENCODER_RESOLUTION
        } else {
            max.min(MAX_ENCODER_RESOLUTION)
        }
    };
    let (w, h) = (u64::from(rotated.width), u64::from(rotated.height));
    let (max_w, max_h) = (
        u64::from(limit(max_resolution.width)),
        u64::from(limit(max_resolution.height)),
    );

    let (width, height) = if w <= max_w && h <= max_h {
        (w, h)
    } else if w * max_h <= h * max_w {
        // Height is the binding constraint.
        (w * max_h / h, max_h)
    } else {
        (max_w, h * max_w / w)
    };

    Size::new(even_floor(width), even_floor(height))
}

/// Maps a point in the viewer's coordinate space to device pixels.
///
/// `scale` is the zoom factor of the view (view pixels per device pixel) and
/// `orientation` is the quadrant the device image is currently shown in.
/// Returns `None` if the point falls outside the device display or `scale`
/// is not positive.
///
/// # Examples
///
/// ```rust
/// use mirror_core::domain::geometry::{view_to_device, Point, Size};
///
/// // Shown rotated a quarter turn clockwise at half size.
/// let device = view_to_device(Point::new(0, 0), 0.5, 1, Size::new(1080, 2400));
/// assert_eq!(device, Some(Point::new(0, 2399)));
/// ```
pub fn view_to_device(view: Point, scale: f64, orientation: u8, device: Size) -> Option<Point> {
    if scale <= 0.0 || !scale.is_finite() || device.is_empty() {
        return None;
    }
    let sx = (f64::from(view.x) / scale).floor() as i64;
    let sy = (f64::from(view.y) / scale).floor() as i64;
    let (w, h) = (i64::from(device.width), i64::from(device.height));

    let (dx, dy) = match orientation % 4 {
        0 => (sx, sy),
        1 => (sy, h - 1 - sx),
        2 => (w - 1 - sx, h - 1 - sy),
        _ => (w - 1 - sy, sx),
    };

    if (0..w).contains(&dx) && (0..h).contains(&dy) {
        Some(Point::new(dx as i32, dy as i32))
    } else {
        None
    }
}

fn even_floor(value: u64) -> u32 {
    let even = (value & !1).max(2);
    u32::try_from(even).unwrap_or(u32::MAX & !1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHONE: Size = Size::new(1080, 2400);

    // ── compute_video_size ───────────────────────────────────────────────────

    #[test]
    fn test_video_size_fits_max_resolution_portrait() {
        let size = compute_video_size(PHONE, 0, Size::new(200, 180));
        assert_eq!(size, Size::new(80, 180));
    }

    #[test]
    fn test_video_size_fits_max_resolution_landscape() {
        // Rotated a quarter turn the display is 2400x1080.
        let size = compute_video_size(PHONE, 1, Size::new(200, 180));
        assert_eq!(size, Size::new(200, 90));
    }

    #[test]
    fn test_video_size_is_clamped_to_encoder_limit() {
        let size = compute_video_size(PHONE, 0, Size::default());
        assert_eq!(size.height, MAX_ENCODER_RESOLUTION);
        assert_eq!(size.width, 920, "1080 * 2048 / 2400 = 921.6, rounded down to even");
    }

    #[test]
    fn test_video_size_never_upscales() {
        let size = compute_video_size(Size::new(320, 240), 0, Size::new(1920, 1080));
        assert_eq!(size, Size::new(320, 240));
    }

    #[test]
    fn test_video_size_rounds_odd_display_to_even() {
        let size = compute_video_size(Size::new(481, 853), 0, Size::default());
        assert_eq!(size, Size::new(480, 852));
    }

    #[test]
    fn test_video_size_preserves_aspect_ratio() {
        // Arrange
        let display = Size::new(1440, 3120);

        for max in [Size::new(200, 180), Size::new(720, 1280), Size::new(1000, 300)] {
            // Act
            let size = compute_video_size(display, 0, max);

            // Assert
            assert!(size.width <= max.width && size.height <= max.height, "{size:?} vs {max:?}");
            let expected = f64::from(display.width) / f64::from(display.height);
            let actual = f64::from(size.width) / f64::from(size.height);
            assert!((expected - actual).abs() < 0.05, "{size:?}");
        }
    }

    #[test]
    fn test_empty_display_gives_empty_size() {
        assert_eq!(compute_video_size(Size::new(0, 100), 0, Size::default()), Size::default());
    }

    // ── view_to_device ───────────────────────────────────────────────────────

    #[test]
    fn test_view_to_device_identity() {
        let p = view_to_device(Point::new(10, 20), 1.0, 0, PHONE);
        assert_eq!(p, Some(Point::new(10, 20)));
    }

    #[test]
    fn test_view_to_device_applies_scale() {
        let p = view_to_device(Point::new(100, 50), 0.25, 0, PHONE);
        assert_eq!(p, Some(Point::new(400, 200)));
    }

    #[test]
    fn test_view_to_device_undoes_each_quadrant() {
        // The view's top-left corner lands on a different device corner for
        // each clockwise rotation.
        let corners = [
            Point::new(0, 0),
            Point::new(0, 2399),
            Point::new(1079, 2399),
            Point::new(1079, 0),
        ];
        for (quadrant, expected) in corners.into_iter().enumerate() {
            let p = view_to_device(Point::new(0, 0), 1.0, quadrant as u8, PHONE);
            assert_eq!(p, Some(expected), "quadrant {quadrant}");
        }
    }

    #[test]
    fn test_view_to_device_rejects_points_outside_display() {
        assert_eq!(view_to_device(Point::new(1080, 0), 1.0, 0, PHONE), None);
        assert_eq!(view_to_device(Point::new(-1, 0), 1.0, 0, PHONE), None);
        // Landscape view is 2400 wide; x = 2400 is past the edge.
        assert_eq!(view_to_device(Point::new(2400, 0), 1.0, 1, PHONE), None);
    }

    #[test]
    fn test_view_to_device_rejects_non_positive_scale() {
        assert_eq!(view_to_device(Point::new(1, 1), 0.0, 0, PHONE), None);
    }
}
