//! Pixel extents and capture-resolution negotiation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest chroma extent `scale` will produce, so the luma plane never
/// collapses to zero on pathological aspect ratios.
const MIN_CHROMA_EXTENT: u32 = 4;

/// Smallest luma extent [`scale`] produces. A maximum below it in either
/// axis cannot be honored.
pub const MIN_CAPTURE_EXTENT: u32 = 2 * MIN_CHROMA_EXTENT;

/// Integer pixel extents of a plane, surface or display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both extents are positive.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Taller than wide.
    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }

    /// Width and height exchanged.
    pub fn swapped(&self) -> Self {
        Self::new(self.height, self.width)
    }

    /// Half resolution in both axes (4:2:0 chroma plane of a luma plane).
    pub fn half(&self) -> Self {
        Self::new(self.width / 2, self.height / 2)
    }

    /// Number of pixels, i.e. bytes in a tightly packed 8-bit plane.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether the chroma planes of a luma plane this size sample clean
    /// 2x2 blocks: even extents whose halves are divisible by 4.
    pub fn is_chroma_aligned(&self) -> bool {
        self.width % 8 == 0 && self.height % 8 == 0
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Dimensions {
    type Err = String;

    /// Parse `"<width>x<height>"`, e.g. `1920x1080`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected <width>x<height>, got `{s}`"))?;
        let width = w
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid width `{w}`: {e}"))?;
        let height = h
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid height `{h}`: {e}"))?;
        let dims = Dimensions::new(width, height);
        if !dims.is_valid() {
            return Err(format!("dimensions must be positive, got `{s}`"));
        }
        Ok(dims)
    }
}

/// Largest uniform scaling of `source` that fits inside `max`, before any
/// chroma alignment. `max` is rotated to follow the source orientation.
///
/// Integer arithmetic keeps the result exact: the limiting axis lands on
/// the bound and the other axis is floored.
pub fn fit(source: Dimensions, max: Dimensions) -> Dimensions {
    let max = if source.is_portrait() {
        max.swapped()
    } else {
        max
    };

    let src_w = source.width.max(1) as u64;
    let src_h = source.height.max(1) as u64;
    let max_w = max.width as u64;
    let max_h = max.height as u64;

    // max_w / src_w <= max_h / src_h  <=>  max_w * src_h <= max_h * src_w
    if max_w * src_h <= max_h * src_w {
        Dimensions::new(max_w as u32, (src_h * max_w / src_w) as u32)
    } else {
        Dimensions::new((src_w * max_h / src_h) as u32, max_h as u32)
    }
}

/// Negotiate the luma capture resolution for `source` under `max`.
///
/// The result is the orientation-aware best fit rounded down so that the
/// half-resolution chroma planes are multiples of 4 in both axes. Luma
/// extents are therefore multiples of 8.
pub fn scale(source: Dimensions, max: Dimensions) -> Dimensions {
    let scaled = fit(source, max);
    let uv_width = (4 * (scaled.width / 2 / 4)).max(MIN_CHROMA_EXTENT);
    let uv_height = (4 * (scaled.height / 2 / 4)).max(MIN_CHROMA_EXTENT);
    Dimensions::new(2 * uv_width, 2 * uv_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn portrait_source_swaps_bound() {
        let out = scale(Dimensions::new(1080, 1920), Dimensions::new(1920, 1080));
        assert_eq!(out, Dimensions::new(1080, 1920));
        assert_eq!(out.half(), Dimensions::new(540, 960));
        assert!(out.is_chroma_aligned());
    }

    #[test]
    fn landscape_phone_downscales_to_bound() {
        let out = scale(Dimensions::new(2400, 1080), Dimensions::new(1920, 1080));
        // 2400x1080 -> 1920x864, already aligned
        assert_eq!(out, Dimensions::new(1920, 864));
    }

    #[test]
    fn odd_sizes_round_down_to_alignment() {
        let out = scale(Dimensions::new(1366, 768), Dimensions::new(1366, 768));
        // 683 -> 680, 384 -> 384
        assert_eq!(out, Dimensions::new(1360, 768));
    }

    #[test]
    fn small_source_is_upscaled_to_fit() {
        let out = scale(Dimensions::new(960, 540), Dimensions::new(1920, 1080));
        assert_eq!(out, Dimensions::new(1920, 1080));
    }

    #[test]
    fn degenerate_aspect_keeps_minimum_plane() {
        let out = scale(Dimensions::new(4000, 1), Dimensions::new(64, 64));
        assert!(out.is_valid());
        assert_eq!(out.height, 2 * MIN_CHROMA_EXTENT);
    }

    #[test]
    fn smallest_honored_bound_is_met_exactly() {
        let min = Dimensions::new(MIN_CAPTURE_EXTENT, MIN_CAPTURE_EXTENT);
        assert_eq!(scale(Dimensions::new(1920, 1080), min), Dimensions::new(8, 8));
        assert_eq!(scale(Dimensions::new(1080, 1920), min), Dimensions::new(8, 8));
    }

    #[test]
    fn parse_and_display() {
        let dims: Dimensions = "1280x720".parse().unwrap();
        assert_eq!(dims, Dimensions::new(1280, 720));
        assert_eq!(dims.to_string(), "1280x720");
        assert!("1280".parse::<Dimensions>().is_err());
        assert!("0x720".parse::<Dimensions>().is_err());
        assert!("axb".parse::<Dimensions>().is_err());
    }

    proptest! {
        #[test]
        fn scaled_output_is_chroma_aligned(
            sw in 1u32..8192, sh in 1u32..8192,
            mw in 1u32..4096, mh in 1u32..4096,
        ) {
            let out = scale(Dimensions::new(sw, sh), Dimensions::new(mw, mh));
            prop_assert!(out.is_valid());
            prop_assert_eq!(out.width % 2, 0);
            prop_assert_eq!(out.height % 2, 0);
            prop_assert_eq!(out.half().width % 4, 0);
            prop_assert_eq!(out.half().height % 4, 0);
        }

        #[test]
        fn scaled_output_fits_oriented_bound(
            sw in 16u32..8192, sh in 16u32..8192,
            mw in 16u32..4096, mh in 16u32..4096,
        ) {
            let source = Dimensions::new(sw, sh);
            let bound = if source.is_portrait() {
                Dimensions::new(mh, mw)
            } else {
                Dimensions::new(mw, mh)
            };
            let fitted = fit(source, Dimensions::new(mw, mh));
            prop_assume!(fitted.width >= 8 && fitted.height >= 8);

            let out = scale(source, Dimensions::new(mw, mh));
            prop_assert!(fitted.width <= bound.width);
            prop_assert!(fitted.height <= bound.height);
            prop_assert!(out.width <= fitted.width);
            prop_assert!(out.height <= fitted.height);
            // alignment never removes a full 8-pixel block
            prop_assert!(fitted.width - out.width < 8);
            prop_assert!(fitted.height - out.height < 8);
        }

        #[test]
        fn fit_preserves_aspect_within_one_unit(
            sw in 16u32..8192, sh in 16u32..8192,
            mw in 16u32..4096, mh in 16u32..4096,
        ) {
            let source = Dimensions::new(sw, sh);
            let fitted = fit(source, Dimensions::new(mw, mh));
            prop_assume!(fitted.width > 0 && fitted.height > 0);

            // height implied by the fitted width and the source aspect
            let implied_h = fitted.width as f64 * sh as f64 / sw as f64;
            let implied_w = fitted.height as f64 * sw as f64 / sh as f64;
            prop_assert!(
                (implied_h - fitted.height as f64).abs() <= 1.0
                    || (implied_w - fitted.width as f64).abs() <= 1.0
            );
        }
    }
}
