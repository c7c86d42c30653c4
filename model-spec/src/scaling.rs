//! Compound-scaling arithmetic shared by the plan builder.

/// Rounds `value` to the nearest multiple of `divisor` (ties away from
/// zero), never below `divisor` itself, and bumps the result one multiple
/// up when rounding would fall below 90% of `value`.
pub fn make_divisible(value: f64, divisor: i64) -> i64 {
    let divisor = divisor as f64;
    let rounded = ((value + divisor / 2.0) / divisor).floor() * divisor;
    let rounded = rounded.max(divisor);
    let rounded = if rounded < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    };
    rounded as i64
}

/// Applies the width multiplier to a declared channel count, snapping to
/// hardware-friendly multiples of 8.
pub fn scale_channels(channels: usize, width_multiple: f64) -> usize {
    make_divisible(channels as f64 * width_multiple, 8) as usize
}

/// Applies the depth multiplier to a repeat count. Single repeats stay
/// exempt so that one-off layers never vanish under small multipliers.
pub fn scale_repeat(repeat: usize, depth_multiple: f64) -> usize {
    if repeat > 1 {
        ((repeat as f64 * depth_multiple).round() as usize).max(1)
    } else {
        repeat
    }
}
