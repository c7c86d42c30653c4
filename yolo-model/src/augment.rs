//! Multi-scale flipped inference with inverse coordinate transforms.

use crate::common::*;
use crate::detect::DetectionOutput;
use crate::model::YoloModel;
use crate::utils;

/// The fixed augmentation schedule, one `(scale ratio, flip)` pair per pass.
const PASSES: [(f64, Flip); 3] = [
    (1.0, Flip::None),
    (0.83, Flip::Horizontal),
    (0.67, Flip::None),
];

/// Grid levels dropped at each scale extreme before concatenation.
const EXCLUDED_LEVELS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flip {
    None,
    Horizontal,
    Vertical,
}

impl YoloModel {
    /// Runs the fixed multi-scale, flipped inference schedule and merges the
    /// de-transformed predictions into a single tensor. The merged output
    /// carries no raw per-scale maps.
    pub fn forward_augmented(&mut self, xs: &Tensor) -> Result<DetectionOutput> {
        let (_batch, _channels, height, width) = xs.size4()?;
        let strides = self
            .strides()
            .ok_or_else(|| format_err!("the detection head is not calibrated"))?;
        let max_stride = strides
            .iter()
            .max()
            .copied()
            .ok_or_else(|| format_err!("the detection head has no scales"))?;
        let num_scales = strides.len();

        let mut passes = Vec::with_capacity(PASSES.len());
        for &(ratio, flip) in PASSES.iter() {
            let flipped = match flip {
                Flip::None => xs.shallow_clone(),
                Flip::Horizontal => xs.flip(&[3]),
                Flip::Vertical => xs.flip(&[2]),
            };
            let scaled = utils::scale_img(&flipped, ratio, max_stride)?;
            let output = self.forward_t(&scaled, false)?;
            let predictions = output
                .predictions
                .ok_or_else(|| format_err!("the inference pass produced no decoded predictions"))?;
            passes.push(descale_predictions(&predictions, ratio, flip, height, width));
        }

        let passes = clip_tails(passes, num_scales)?;
        let predictions = Tensor::cat(&passes, 1);

        Ok(DetectionOutput {
            predictions: Some(predictions),
            feature_maps: vec![],
        })
    }
}

/// Maps decoded boxes from an augmented frame back to the original frame.
fn descale_predictions(
    predictions: &Tensor,
    ratio: f64,
    flip: Flip,
    height: i64,
    width: i64,
) -> Tensor {
    let x = predictions.i((.., .., 0..1)) / ratio;
    let y = predictions.i((.., .., 1..2)) / ratio;
    let wh = predictions.i((.., .., 2..4)) / ratio;
    let rest = predictions.i((.., .., 4..));

    let (x, y) = match flip {
        Flip::None => (x, y),
        Flip::Horizontal => (x.neg() + width as f64, y),
        Flip::Vertical => (x, y.neg() + height as f64),
    };
    Tensor::cat(&[x, y, wh, rest], 2)
}

/// Drops the coarsest-level block from the unscaled pass and the
/// finest-level block from the smallest-scale pass.
fn clip_tails(mut passes: Vec<Tensor>, num_scales: usize) -> Result<Vec<Tensor>> {
    ensure!(!passes.is_empty(), "no augmentation passes to clip");
    ensure!(num_scales > 0, "the head has no detection scales");

    // locations per grid-cell group across all scales, 21 for three scales
    let grid_points: i64 = (0..num_scales).map(|level| 4i64.pow(level as u32)).sum();
    let head_block: i64 = (0..EXCLUDED_LEVELS)
        .map(|level| 4i64.pow(level as u32))
        .sum();
    let tail_block: i64 = (0..EXCLUDED_LEVELS)
        .map(|level| 4i64.pow((num_scales - 1 - level) as u32))
        .sum();
    let last = passes.len() - 1;

    let (_b, locations, _entries) = passes[0].size3()?;
    let trim = locations / grid_points * head_block;
    passes[0] = passes[0].narrow(1, 0, locations - trim);

    let (_b, locations, _entries) = passes[last].size3()?;
    let trim = locations / grid_points * tail_block;
    passes[last] = passes[last].narrow(1, trim, locations - trim);

    Ok(passes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn synthetic_prediction() -> Tensor {
        Tensor::of_slice(&[10.0f32, 20.0, 30.0, 40.0, 0.9, 0.5]).view([1, 1, 6])
    }

    #[test]
    fn horizontal_deflip_reflects_x() {
        // a box at x = 10 in the flipped frame sits at 630 in a 640 wide image
        let output =
            descale_predictions(&synthetic_prediction(), 1.0, Flip::Horizontal, 640, 640);
        let values = Vec::<f64>::from(&output.reshape(&[-1]));
        assert_abs_diff_eq!(values[0], 630.0, epsilon = 1e-6);
        assert_abs_diff_eq!(values[1], 20.0, epsilon = 1e-6);
    }

    #[test]
    fn vertical_deflip_reflects_y() {
        let output =
            descale_predictions(&synthetic_prediction(), 1.0, Flip::Vertical, 480, 640);
        let values = Vec::<f64>::from(&output.reshape(&[-1]));
        assert_abs_diff_eq!(values[0], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(values[1], 460.0, epsilon = 1e-6);
    }

    #[test]
    fn descale_divides_boxes_only() {
        let output = descale_predictions(&synthetic_prediction(), 0.5, Flip::None, 640, 640);
        let values = Vec::<f64>::from(&output.reshape(&[-1]));
        let expect = [20.0, 40.0, 60.0, 80.0, 0.9, 0.5];
        izip!(values, expect).for_each(|(value, expect)| {
            assert_abs_diff_eq!(value, expect, epsilon = 1e-6);
        });
    }

    #[test]
    fn clip_removes_one_level_at_each_extreme() -> Result<()> {
        // three scales: 21 grid points per cell group
        let passes: Vec<Tensor> = (0..3)
            .map(|_| Tensor::zeros(&[1, 21 * 4, 6], (Kind::Float, Device::Cpu)))
            .collect();
        let clipped = clip_tails(passes, 3)?;

        // the unscaled pass loses 4 * 1 trailing entries, the smallest scale
        // loses 4 * 16 leading entries
        assert_eq!(clipped[0].size()[1], 84 - 4);
        assert_eq!(clipped[1].size()[1], 84);
        assert_eq!(clipped[2].size()[1], 84 - 64);
        Ok(())
    }
}
