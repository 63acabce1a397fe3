//! Resize-to-fit for captured frames.
//!
//! Lanczos3 keeps glyph edges crisp, which matters more for shared
//! documents and terminals than smooth gradients do.

use image::imageops::{self, FilterType};

use super::{FrameBuffer, ResolutionLimit};

const FILTER: FilterType = FilterType::Lanczos3;

/// Dimensions `(w, h)` scaled uniformly to fit inside `(max_w, max_h)`.
pub fn fit_dimensions(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w <= max_w && h <= max_h {
        return (w, h);
    }
    let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    let new_w = ((w as f64 * scale) as u32).clamp(1, max_w.max(1));
    let new_h = ((h as f64 * scale) as u32).clamp(1, max_h.max(1));
    (new_w, new_h)
}

/// Downscale `frame` so both sides fit the ceiling. Frames that already
/// fit are returned untouched.
pub fn limit(frame: FrameBuffer, max_w: u32, max_h: u32) -> FrameBuffer {
    let (w, h) = frame.dimensions();
    let (new_w, new_h) = fit_dimensions(w, h, max_w, max_h);
    if (new_w, new_h) == (w, h) {
        return frame;
    }
    resize_exact(frame, new_w, new_h)
}

pub fn limit_to(frame: FrameBuffer, ceiling: ResolutionLimit) -> FrameBuffer {
    let (max_w, max_h) = ceiling.max_dimensions();
    limit(frame, max_w, max_h)
}

/// Resize to exactly `(w, h)`, ignoring aspect ratio.
pub fn resize_exact(frame: FrameBuffer, w: u32, h: u32) -> FrameBuffer {
    if frame.dimensions() == (w, h) {
        return frame;
    }
    let img = frame.into_image();
    FrameBuffer::from_image(imageops::resize(&img, w, h, FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_within_ceiling_is_unchanged() {
        let frame = FrameBuffer::filled(800, 600, [10, 20, 30]);
        let out = limit(frame.clone(), 1920, 1080);
        assert_eq!(out, frame);
        // Idempotent
        assert_eq!(limit(out, 1920, 1080), frame);
    }

    #[test]
    fn uhd_source_fits_full_hd() {
        assert_eq!(fit_dimensions(3840, 2160, 1920, 1080), (1920, 1080));
    }

    #[test]
    fn tall_source_is_bounded_by_height() {
        let (w, h) = fit_dimensions(1000, 4000, 1920, 1080);
        assert_eq!(h, 1080);
        assert_eq!(w, 270);
    }

    #[test]
    fn odd_aspect_ratio_is_preserved_within_rounding() {
        let (src_w, src_h) = (3440u32, 1440u32);
        let (w, h) = fit_dimensions(src_w, src_h, 1920, 1080);
        assert!(w <= 1920 && h <= 1080);
        let src_ratio = src_w as f64 / src_h as f64;
        let out_ratio = w as f64 / h as f64;
        assert!((src_ratio - out_ratio).abs() < 0.01, "{src_ratio} vs {out_ratio}");
    }

    #[test]
    fn limit_resizes_pixels() {
        let frame = FrameBuffer::filled(400, 200, [200, 100, 50]);
        let out = limit(frame, 100, 100);
        assert_eq!(out.dimensions(), (100, 50));
        assert_eq!(out.data.len(), 100 * 50 * 3);
        // Flat colour survives the filter (within rounding).
        for (got, want) in out.data[..3].iter().zip([200u8, 100, 50]) {
            assert!(got.abs_diff(want) <= 1, "{got} vs {want}");
        }
    }

    #[test]
    fn native_never_resizes() {
        let frame = FrameBuffer::filled(64, 32, [1, 2, 3]);
        assert_eq!(limit_to(frame.clone(), ResolutionLimit::Native), frame);
    }
}
