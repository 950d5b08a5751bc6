//! Heat bucket classification.
//!
//! A monotonic step function from normalized heat to a discrete color and
//! line width. Colors run cool to hot; widths grow faster towards the top
//! so the busiest paths stand out.

use serde::Serialize;

use crate::aggregator::HeatKey;

/// Lower bound (inclusive) of each bucket above the first.
const THRESHOLDS: [f64; 5] = [0.1, 0.25, 0.45, 0.65, 0.85];

const COLORS: [&str; 6] = ["#2b83ba", "#64abb0", "#abdda4", "#fdae61", "#f46d43", "#d7191c"];

/// Line widths in screen points. The first entry is the minimum visible width.
const WIDTHS: [f64; 6] = [2.0, 2.5, 3.5, 4.5, 6.0, 8.0];

/// Number of heat buckets.
pub const BUCKET_COUNT: usize = 6;

/// Rendering style for one heat level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatBucket {
    /// 0 (coolest) to `BUCKET_COUNT - 1` (hottest)
    pub index: usize,
    pub color: &'static str,
    pub width: f64,
}

/// Map normalized heat onto its bucket.
///
/// Input is clamped to [0, 1]; NaN counts as 0.
///
/// # Example
/// ```
/// use heatline::classify;
///
/// assert_eq!(classify(0.0).index, 0);
/// assert_eq!(classify(1.0).index, 5);
/// assert!(classify(0.9).width > classify(0.2).width);
/// ```
pub fn classify(normalized_heat: f64) -> HeatBucket {
    let heat = clamp_heat(normalized_heat);
    let index = THRESHOLDS.iter().take_while(|&&t| heat >= t).count();
    HeatBucket {
        index,
        color: COLORS[index],
        width: WIDTHS[index],
    }
}

/// Clamp to [0, 1], mapping NaN to 0.
pub fn clamp_heat(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Traversal count relative to a ceiling, saturating at 1.0. Zero ceiling gives 0.
pub fn normalized_heat(count: u64, ceiling: u64) -> f64 {
    if ceiling == 0 {
        0.0
    } else {
        (count as f64 / ceiling as f64).min(1.0)
    }
}

/// One renderable heat line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatSegment {
    /// `[[lon, lat], [lon, lat]]` in the corrected frame
    pub coordinates: [[f64; 2]; 2],
    pub normalized_heat: f64,
    pub color: &'static str,
    pub width: f64,
    pub bucket: usize,
    /// Source cell, e.g. `edge:3` or `grid:12:-4`
    pub key: HeatKey,
}

impl HeatSegment {
    pub fn new(key: HeatKey, coordinates: [[f64; 2]; 2], normalized_heat: f64) -> Self {
        let normalized_heat = clamp_heat(normalized_heat);
        let bucket = classify(normalized_heat);
        Self {
            coordinates,
            normalized_heat,
            color: bucket.color,
            width: bucket.width,
            bucket: bucket.index,
            key,
        }
    }
}
