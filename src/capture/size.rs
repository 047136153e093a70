//! Resolution negotiation against the discrete sizes a device offers.
//!
//! Two policies coexist and are kept apart on purpose:
//!
//! - [`select_best_size`] is used for stills. It walks the candidates from
//!   largest to smallest and returns the *first* one whose aspect ratio is
//!   within tolerance and whose pixel count fits the budget.
//! - [`select_closest_by_ratio_then_height`] is used for preview. It returns
//!   the candidate with the globally closest height/width ratio to the
//!   target, ties broken by the closest height.
//!
//! Both iterate in the order produced by [`ordered`], so results never depend
//! on how the driver happened to list its sizes.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::frame::Size;
use crate::error::SizeError;

/// Filter and ranking parameters for still-size selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeConstraint {
    /// width / height
    pub target_aspect_ratio: f64,
    pub tolerance: f64,
    pub max_pixels: u64,
}

/// Candidates sorted by descending pixel count, then descending width, with
/// duplicates removed.
pub fn ordered(candidates: &[Size]) -> Vec<Size> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|s| (Reverse(s.pixels()), Reverse(s.width())));
    sorted.dedup();
    sorted
}

/// First-match still-size selection.
///
/// Oversized candidates are skipped; the first remaining candidate whose
/// ratio differs from the target by strictly less than the tolerance wins.
pub fn select_best_size(candidates: &[Size], constraint: &SizeConstraint) -> Result<Size, SizeError> {
    if candidates.is_empty() {
        return Err(SizeError::NoSupportedSizes);
    }

    for candidate in ordered(candidates) {
        if candidate.pixels() > constraint.max_pixels {
            trace!(%candidate, "skipping size over pixel budget");
            continue;
        }
        let difference = (candidate.aspect_ratio() - constraint.target_aspect_ratio).abs();
        if difference < constraint.tolerance {
            return Ok(candidate);
        }
    }

    Err(SizeError::NoMatch {
        target: constraint.target_aspect_ratio,
        tolerance: constraint.tolerance,
        max_pixels: constraint.max_pixels,
    })
}

/// Closest-ratio preview-size selection; never needs a threshold.
pub fn select_closest_by_ratio_then_height(candidates: &[Size], target: Size) -> Result<Size, SizeError> {
    let target_ratio = target.inverse_aspect_ratio();
    let mut best: Option<(Size, f64, u32)> = None;

    for candidate in ordered(candidates) {
        let ratio_diff = (candidate.inverse_aspect_ratio() - target_ratio).abs();
        let height_diff = candidate.height().abs_diff(target.height());
        let better = match best {
            None => true,
            Some((_, best_ratio, best_height)) => {
                ratio_diff < best_ratio || (ratio_diff == best_ratio && height_diff < best_height)
            }
        };
        if better {
            best = Some((candidate, ratio_diff, height_diff));
        }
    }

    best.map(|(size, _, _)| size).ok_or(SizeError::NoSupportedSizes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo_constraint() -> SizeConstraint {
        SizeConstraint {
            target_aspect_ratio: 1.3333,
            tolerance: 0.01,
            max_pixels: 2_048_000,
        }
    }

    #[test]
    fn picks_four_by_three_under_budget() {
        let candidates = [Size::new(1920, 1080), Size::new(1600, 1200), Size::new(640, 480)];
        let best = select_best_size(&candidates, &photo_constraint()).unwrap();
        assert_eq!(best, Size::new(1600, 1200));
    }

    #[test]
    fn first_match_prefers_largest_not_closest() {
        // 1280x960 is an exact 4:3 but 1600x1200 comes first in order.
        let constraint = SizeConstraint {
            target_aspect_ratio: 4.0 / 3.0,
            tolerance: 0.1,
            max_pixels: u64::MAX,
        };
        let candidates = [Size::new(1280, 960), Size::new(1600, 1210)];
        assert_eq!(select_best_size(&candidates, &constraint).unwrap(), Size::new(1600, 1210));
    }

    #[test]
    fn respects_pixel_budget() {
        let constraint = SizeConstraint {
            target_aspect_ratio: 4.0 / 3.0,
            tolerance: 0.01,
            max_pixels: 1280 * 960,
        };
        let candidates = [
            Size::new(2592, 1944),
            Size::new(2048, 1536),
            Size::new(1280, 960),
            Size::new(640, 480),
        ];
        let best = select_best_size(&candidates, &constraint).unwrap();
        assert_eq!(best, Size::new(1280, 960));
        assert!(best.pixels() <= constraint.max_pixels);
    }

    #[test]
    fn reports_no_match_and_empty_sets() {
        let candidates = [Size::new(1920, 1080), Size::new(1280, 720)];
        assert!(matches!(
            select_best_size(&candidates, &photo_constraint()),
            Err(SizeError::NoMatch { .. })
        ));
        assert_eq!(select_best_size(&[], &photo_constraint()), Err(SizeError::NoSupportedSizes));
        assert_eq!(
            select_closest_by_ratio_then_height(&[], Size::new(640, 480)),
            Err(SizeError::NoSupportedSizes)
        );
    }

    #[test]
    fn selection_ignores_input_order() {
        let mut candidates = vec![
            Size::new(640, 480),
            Size::new(1600, 1200),
            Size::new(1920, 1080),
            Size::new(1200, 900),
        ];
        let first = select_best_size(&candidates, &photo_constraint()).unwrap();
        candidates.reverse();
        assert_eq!(select_best_size(&candidates, &photo_constraint()).unwrap(), first);

        let target = Size::new(640, 480);
        let preview = select_closest_by_ratio_then_height(&candidates, target).unwrap();
        candidates.rotate_left(1);
        assert_eq!(select_closest_by_ratio_then_height(&candidates, target).unwrap(), preview);
    }

    #[test]
    fn equal_pixel_counts_break_ties_by_width() {
        let sorted = ordered(&[Size::new(600, 800), Size::new(800, 600), Size::new(800, 600)]);
        assert_eq!(sorted, vec![Size::new(800, 600), Size::new(600, 800)]);
    }

    #[test]
    fn closest_ratio_then_height() {
        let candidates = [
            Size::new(1920, 1080),
            Size::new(1280, 960),
            Size::new(800, 600),
            Size::new(640, 480),
            Size::new(320, 240),
        ];
        let best = select_closest_by_ratio_then_height(&candidates, Size::new(640, 480)).unwrap();
        assert_eq!(best, Size::new(640, 480));

        // No exact ratio: the closest ratio wins even if its height is far off.
        let wide = [Size::new(1920, 1080), Size::new(352, 288)];
        let best = select_closest_by_ratio_then_height(&wide, Size::new(640, 480)).unwrap();
        assert_eq!(best, Size::new(352, 288));
    }
}
