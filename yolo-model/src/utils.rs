//! Small tensor helpers shared by the inference paths.

use crate::common::*;

/// Mean gray used to fill padded image borders.
pub const PAD_FILL: f64 = 0.447;

/// Resizes a batched image tensor by `ratio` with bilinear interpolation,
/// then pads the right and bottom edges with mean gray so that both spatial
/// dimensions are multiples of `gs`.
pub fn scale_img(xs: &Tensor, ratio: f64, gs: i64) -> Result<Tensor> {
    ensure!(
        ratio > 0.0,
        "the scaling ratio must be positive, found {}",
        ratio
    );
    ensure!(
        gs > 0,
        "the stride granularity must be positive, found {}",
        gs
    );

    if ratio == 1.0 {
        return Ok(xs.shallow_clone());
    }

    let (batch_size, channels, height, width) = xs.size4()?;
    let scaled_h = (height as f64 * ratio) as i64;
    let scaled_w = (width as f64 * ratio) as i64;
    ensure!(
        scaled_h > 0 && scaled_w > 0,
        "the ratio {} collapses the {}x{} image",
        ratio,
        height,
        width
    );
    let scaled = xs.upsample_bilinear2d(&[scaled_h, scaled_w], false, None, None);

    let padded_h = (height as f64 * ratio / gs as f64).ceil() as i64 * gs;
    let padded_w = (width as f64 * ratio / gs as f64).ceil() as i64 * gs;
    if padded_h == scaled_h && padded_w == scaled_w {
        return Ok(scaled);
    }

    let canvas = Tensor::full(
        &[batch_size, channels, padded_h, padded_w],
        PAD_FILL,
        (xs.kind(), xs.device()),
    );
    canvas
        .narrow(2, 0, scaled_h)
        .narrow(3, 0, scaled_w)
        .copy_(&scaled);
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn unit_ratio_is_identity() -> Result<()> {
        let xs = Tensor::rand(&[1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let ys = scale_img(&xs, 1.0, 32)?;
        assert_eq!(xs.size(), ys.size());
        assert_abs_diff_eq!(f64::from((xs - ys).abs().max()), 0.0);
        Ok(())
    }

    #[test]
    fn downscale_pads_to_the_stride_granularity() -> Result<()> {
        let xs = Tensor::ones(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
        let ys = scale_img(&xs, 0.83, 32)?;
        assert_eq!(ys.size(), vec![1, 3, 64, 64]);

        // the resized content keeps its values, the border takes mean gray
        assert_abs_diff_eq!(f64::from(ys.i((0, 0, 0, 0))), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(f64::from(ys.i((0, 0, 63, 63))), PAD_FILL, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn halving_needs_no_padding() -> Result<()> {
        let xs = Tensor::ones(&[1, 3, 64, 64], (Kind::Float, Device::Cpu));
        let ys = scale_img(&xs, 0.5, 32)?;
        assert_eq!(ys.size(), vec![1, 3, 32, 32]);
        Ok(())
    }
}
