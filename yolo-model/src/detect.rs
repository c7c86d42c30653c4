//! Multi-scale detection head with cached decoding grids.

use crate::common::*;

pub use detect_::*;
pub use output_::*;

mod detect_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct DetectInit {
        pub num_classes: usize,
        pub anchors: Vec<Vec<(R64, R64)>>,
        pub in_channels: Vec<usize>,
    }

    impl DetectInit {
        pub fn build<'p, P>(self, path: P) -> Detect
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();
            let device = path.device();

            let Self {
                num_classes,
                anchors,
                in_channels,
            } = self;
            debug_assert!(!anchors.is_empty());
            debug_assert_eq!(anchors.len(), in_channels.len());
            debug_assert!(anchors.iter().map(|row| row.len()).all_equal());

            let num_scales = anchors.len();
            let num_anchors = anchors[0].len() as i64;
            let num_entries = num_classes as i64 + 5;

            let convs: Vec<_> = in_channels
                .iter()
                .enumerate()
                .map(|(index, &in_c)| {
                    nn::conv2d(
                        path / format!("conv_{}", index),
                        in_c as i64,
                        num_anchors * num_entries,
                        1,
                        Default::default(),
                    )
                })
                .collect();

            // [num_scales, num_anchors, 2] in (width, height) pixel units
            let anchor_values: Vec<f32> = anchors
                .iter()
                .flatten()
                .flat_map(|&(w, h)| [w.raw() as f32, h.raw() as f32])
                .collect();
            let anchors = Tensor::of_slice(&anchor_values)
                .view([num_scales as i64, num_anchors, 2])
                .to_device(device)
                .set_requires_grad(false);

            Detect {
                num_classes: num_classes as i64,
                num_entries,
                num_anchors,
                num_scales,
                convs,
                anchors,
                strides: None,
                caches: (0..num_scales).map(|_| None).collect(),
                dynamic: false,
                device,
            }
        }
    }

    #[derive(Debug)]
    pub struct Detect {
        num_classes: i64,
        num_entries: i64,
        num_anchors: i64,
        num_scales: usize,
        convs: Vec<nn::Conv2D>,
        // pixel units until calibration, grid units afterwards
        anchors: Tensor,
        strides: Option<Vec<i64>>,
        pub(super) caches: Vec<Option<ScaleCache>>,
        dynamic: bool,
        device: Device,
    }

    impl Detect {
        pub fn forward<T>(&mut self, tensors: &[T], train: bool) -> Result<DetectionOutput>
        where
            T: Borrow<Tensor>,
        {
            ensure!(
                tensors.len() == self.num_scales,
                "expected {} feature maps, found {}",
                self.num_scales,
                tensors.len()
            );

            let feature_maps: Vec<Tensor> = izip!(tensors.iter(), self.convs.iter())
                .map(|(xs, conv)| -> Result<_> {
                    let xs = xs.borrow().apply(conv);
                    let (batch_size, _channels, feature_h, feature_w) = xs.size4()?;
                    let xs = xs
                        .view([
                            batch_size,
                            self.num_anchors,
                            self.num_entries,
                            feature_h,
                            feature_w,
                        ])
                        .permute(&[0, 1, 3, 4, 2]);
                    Ok(xs)
                })
                .try_collect()?;

            if train {
                return Ok(DetectionOutput {
                    predictions: None,
                    feature_maps,
                });
            }

            let strides = self
                .strides
                .clone()
                .ok_or_else(|| format_err!("the detection head is not calibrated"))?;

            let mut decoded = Vec::with_capacity(self.num_scales);
            for (scale_index, (xs, &stride)) in
                izip!(feature_maps.iter(), strides.iter()).enumerate()
            {
                decoded.push(self.decode_scale(scale_index, xs, stride)?);
            }
            let predictions = Tensor::cat(&decoded, 1);

            Ok(DetectionOutput {
                predictions: Some(predictions),
                feature_maps,
            })
        }

        pub(super) fn decode_scale(
            &mut self,
            scale_index: usize,
            xs: &Tensor,
            stride: i64,
        ) -> Result<Tensor> {
            let (batch_size, _anchors, feature_h, feature_w, _entries) = xs.size5()?;

            let (grid, anchor_grid) = {
                let cache = self.cache(scale_index, feature_h, feature_w, stride)?;
                (
                    cache.grid.shallow_clone(),
                    cache.anchor_grid.shallow_clone(),
                )
            };

            let sigmoid = xs.sigmoid();
            let xy = (sigmoid.i((.., .., .., .., 0..2)) * 2.0 - 0.5 + grid) * stride as f64;
            let wh = (sigmoid.i((.., .., .., .., 2..4)) * 2.0).pow_tensor_scalar(2.0) * anchor_grid;
            let rest = sigmoid.i((.., .., .., .., 4..));

            let output = Tensor::cat(&[xy, wh, rest], 4).view([
                batch_size,
                self.num_anchors * feature_h * feature_w,
                self.num_entries,
            ]);
            Ok(output)
        }

        fn cache(
            &mut self,
            scale_index: usize,
            feature_h: i64,
            feature_w: i64,
            stride: i64,
        ) -> Result<&ScaleCache> {
            tch::no_grad(move || -> Result<_> {
                let Self {
                    device,
                    num_anchors,
                    dynamic,
                    ref anchors,
                    ref mut caches,
                    ..
                } = *self;

                let expect_size = (feature_h, feature_w);
                let is_hit = !dynamic
                    && caches[scale_index]
                        .as_ref()
                        .map(|cache| cache.feature_size == expect_size)
                        .unwrap_or(false);

                if !is_hit {
                    info!(
                        "building the decoding grid for scale {} at {}x{}",
                        scale_index, feature_h, feature_w
                    );

                    let ys = Tensor::arange(feature_h, (Kind::Float, device));
                    let xs = Tensor::arange(feature_w, (Kind::Float, device));
                    let offsets = Tensor::meshgrid(&[ys, xs]);
                    let grid = Tensor::stack(&[&offsets[1], &offsets[0]], 2)
                        .view(&[1, 1, feature_h, feature_w, 2] as &[_])
                        .set_requires_grad(false);

                    let anchor_grid = (anchors.i((scale_index as i64, .., ..))
                        * stride as f64)
                        .view([1, num_anchors, 1, 1, 2])
                        .set_requires_grad(false);

                    caches[scale_index] = Some(ScaleCache {
                        feature_size: expect_size,
                        grid,
                        anchor_grid,
                    });
                }

                Ok(caches[scale_index].as_ref().unwrap())
            })
        }

        /// Records the stride table measured on a reference forward pass and
        /// rescales the anchors to grid units.
        pub fn set_strides(&mut self, strides: Vec<i64>) -> Result<()> {
            ensure!(
                self.strides.is_none(),
                "the stride table is already calibrated"
            );
            ensure!(
                strides.len() == self.num_scales,
                "expected {} strides, found {}",
                self.num_scales,
                strides.len()
            );
            ensure!(
                strides.iter().all(|&stride| stride > 0),
                "strides must be positive, found {:?}",
                strides
            );

            tch::no_grad(|| {
                // reverse the anchor rows when their areas run against the
                // stride ordering
                let flat: Vec<f64> = Vec::<f64>::from(&self.anchors.reshape(&[-1]));
                let num_anchors = self.num_anchors as usize;
                let mean_areas: Vec<f64> = flat
                    .chunks(num_anchors * 2)
                    .map(|row| {
                        row.chunks(2).map(|pair| pair[0] * pair[1]).sum::<f64>()
                            / num_anchors as f64
                    })
                    .collect();

                let area_delta = mean_areas[mean_areas.len() - 1] - mean_areas[0];
                let stride_delta = (strides[strides.len() - 1] - strides[0]) as f64;
                if area_delta != 0.0
                    && stride_delta != 0.0
                    && area_delta.signum() != stride_delta.signum()
                {
                    info!("reversing the anchor rows to match the stride order");
                    self.anchors = self.anchors.flip(&[0]);
                }

                let stride_values: Vec<f32> =
                    strides.iter().map(|&stride| stride as f32).collect();
                let stride_tensor = Tensor::of_slice(&stride_values)
                    .to_device(self.device)
                    .view([self.num_scales as i64, 1, 1]);
                self.anchors = (&self.anchors / stride_tensor).set_requires_grad(false);
            });

            self.strides = Some(strides);
            Ok(())
        }

        /// Seeds the objectness and class biases with priors, assuming about
        /// eight objects per 640 pixel image.
        pub fn init_biases(&mut self, class_frequency: Option<&[f64]>) -> Result<()> {
            let strides = self
                .strides
                .clone()
                .ok_or_else(|| format_err!("the detection head is not calibrated"))?;

            let num_classes = self.num_classes;
            let class_delta: Vec<f64> = match class_frequency {
                Some(frequency) => {
                    ensure!(
                        frequency.len() as i64 == num_classes,
                        "expected {} class frequencies, found {}",
                        num_classes,
                        frequency.len()
                    );
                    ensure!(
                        frequency.iter().all(|&count| count > 0.0),
                        "class frequencies must be positive"
                    );
                    let total: f64 = frequency.iter().sum();
                    frequency
                        .iter()
                        .map(|&count| (count / total).ln())
                        .collect()
                }
                None => {
                    let fill = (0.6 / (num_classes as f64 - 0.999999)).ln();
                    vec![fill; num_classes as usize]
                }
            };

            tch::no_grad(|| -> Result<_> {
                for (conv, &stride) in izip!(self.convs.iter_mut(), strides.iter()) {
                    let bs = conv
                        .bs
                        .as_mut()
                        .ok_or_else(|| format_err!("the output convolutions have no bias"))?;

                    let obj_delta = (8.0 / (640.0 / stride as f64).powi(2)).ln();
                    let entry_delta: Vec<f32> = (0..self.num_entries)
                        .map(|entry| match entry {
                            4 => obj_delta as f32,
                            entry if entry >= 5 => class_delta[(entry - 5) as usize] as f32,
                            _ => 0.0,
                        })
                        .collect();
                    let delta: Vec<f32> = iter::repeat(entry_delta)
                        .take(self.num_anchors as usize)
                        .flatten()
                        .collect();

                    let delta = Tensor::of_slice(&delta).to_device(self.device);
                    let updated = &*bs + delta;
                    bs.copy_(&updated);
                }
                Ok(())
            })?;

            Ok(())
        }

        /// Forces the decoding grids to be rebuilt on every pass.
        pub fn set_dynamic(&mut self, dynamic: bool) {
            self.dynamic = dynamic;
            if dynamic {
                self.caches.iter_mut().for_each(|cache| *cache = None);
            }
        }

        pub fn strides(&self) -> Option<&[i64]> {
            self.strides.as_deref()
        }

        pub fn num_scales(&self) -> usize {
            self.num_scales
        }

        pub fn num_classes(&self) -> i64 {
            self.num_classes
        }

        pub fn num_params(&self) -> usize {
            self.convs
                .iter()
                .map(|conv| {
                    conv.ws.numel() + conv.bs.as_ref().map(|bs| bs.numel()).unwrap_or(0)
                })
                .sum()
        }
    }

    #[derive(Debug)]
    pub(super) struct ScaleCache {
        pub(super) feature_size: (i64, i64),
        pub(super) grid: Tensor,
        pub(super) anchor_grid: Tensor,
    }
}

mod output_ {
    use super::*;

    #[derive(Debug, TensorLike)]
    pub struct DetectionOutput {
        /// Decoded boxes with shape `[batch, num_locations, num_entries]`,
        /// absent in training mode.
        pub predictions: Option<Tensor>,
        /// Raw maps with shape `[batch, anchors, height, width, entries]`,
        /// one per scale.
        pub feature_maps: Vec<Tensor>,
    }

    impl DetectionOutput {
        pub fn num_locations(&self) -> Option<i64> {
            let predictions = self.predictions.as_ref()?;
            predictions
                .size3()
                .ok()
                .map(|(_batch, locations, _entries)| locations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn single_scale_head(vs: &nn::VarStore) -> Detect {
        DetectInit {
            num_classes: 1,
            anchors: vec![vec![(r64(4.0), r64(8.0))]],
            in_channels: vec![8],
        }
        .build(&vs.root())
    }

    #[test]
    fn decode_offsets_follow_the_grid() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = single_scale_head(&vs);
        head.set_strides(vec![8])?;

        // sigmoid(0) = 0.5 puts every box at its cell center
        let xs = Tensor::zeros(&[1, 1, 2, 2, 6], (Kind::Float, Device::Cpu));
        let output = head.decode_scale(0, &xs, 8)?;
        assert_eq!(output.size(), &[1, 4, 6]);

        let values = Vec::<f64>::from(&output.reshape(&[-1]));
        let expect = vec![
            4.0, 4.0, 4.0, 8.0, 0.5, 0.5, //
            12.0, 4.0, 4.0, 8.0, 0.5, 0.5, //
            4.0, 12.0, 4.0, 8.0, 0.5, 0.5, //
            12.0, 12.0, 4.0, 8.0, 0.5, 0.5, //
        ];
        izip!(values, expect).for_each(|(value, expect)| {
            assert_abs_diff_eq!(value, expect, epsilon = 1e-5);
        });
        Ok(())
    }

    #[test]
    fn grids_are_rebuilt_only_on_size_changes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = single_scale_head(&vs);
        head.set_strides(vec![8])?;

        let xs = Tensor::zeros(&[1, 1, 2, 2, 6], (Kind::Float, Device::Cpu));
        head.decode_scale(0, &xs, 8)?;
        let first_ptr = head.caches[0].as_ref().unwrap().grid.data_ptr();

        // same size: the cached grid is reused untouched
        head.decode_scale(0, &xs, 8)?;
        assert_eq!(head.caches[0].as_ref().unwrap().grid.data_ptr(), first_ptr);

        // new size: the grid is rebuilt and spans the new extent exactly
        let ys = Tensor::zeros(&[1, 1, 3, 4, 6], (Kind::Float, Device::Cpu));
        head.decode_scale(0, &ys, 8)?;
        let cache = head.caches[0].as_ref().unwrap();
        assert_eq!(cache.feature_size, (3, 4));

        let coords = Vec::<f64>::from(&cache.grid.reshape(&[-1]));
        let max_x = coords.chunks(2).map(|pair| pair[0]).fold(0.0, f64::max);
        let max_y = coords.chunks(2).map(|pair| pair[1]).fold(0.0, f64::max);
        assert_eq!((max_x, max_y), (3.0, 2.0));
        Ok(())
    }

    #[test]
    fn dynamic_mode_rebuilds_every_pass() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = single_scale_head(&vs);
        head.set_strides(vec![8])?;

        let xs = Tensor::zeros(&[1, 1, 2, 2, 6], (Kind::Float, Device::Cpu));
        head.decode_scale(0, &xs, 8)?;
        head.set_dynamic(true);
        assert!(head.caches[0].is_none());

        head.decode_scale(0, &xs, 8)?;
        let first_ptr = head.caches[0].as_ref().unwrap().grid.data_ptr();
        head.decode_scale(0, &xs, 8)?;
        assert_ne!(head.caches[0].as_ref().unwrap().grid.data_ptr(), first_ptr);
        Ok(())
    }

    #[test]
    fn calibration_runs_once() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = single_scale_head(&vs);
        head.set_strides(vec![8])?;

        let error = head.set_strides(vec![8]).unwrap_err();
        assert!(format!("{:#}", error).contains("already calibrated"));
        Ok(())
    }

    #[test]
    fn anchor_rows_follow_the_stride_order() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = DetectInit {
            num_classes: 1,
            anchors: vec![
                vec![(r64(10.0), r64(10.0))],
                vec![(r64(2.0), r64(2.0))],
            ],
            in_channels: vec![8, 16],
        }
        .build(&vs.root());
        head.set_strides(vec![8, 16])?;

        // the small anchors belong to the fine scale after reordering
        let xs = Tensor::zeros(&[1, 1, 1, 1, 6], (Kind::Float, Device::Cpu));
        let fine = head.decode_scale(0, &xs, 8)?;
        let wh = Vec::<f64>::from(&fine.i((0, 0, 2..4)));
        assert_abs_diff_eq!(wh[0], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(wh[1], 2.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn train_mode_skips_decoding() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = single_scale_head(&vs);

        let xs = Tensor::randn(&[1, 8, 4, 4], (Kind::Float, Device::Cpu));
        let output = head.forward(&[&xs], true)?;
        assert!(output.predictions.is_none());
        assert_eq!(output.feature_maps.len(), 1);
        assert_eq!(output.feature_maps[0].size(), &[1, 1, 4, 4, 6]);

        // evaluation requires a calibrated head
        let error = head.forward(&[&xs], false).unwrap_err();
        assert!(format!("{:#}", error).contains("not calibrated"));
        Ok(())
    }

    #[test]
    fn bias_priors_shift_the_logits() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = DetectInit {
            num_classes: 2,
            anchors: vec![vec![(r64(4.0), r64(4.0)), (r64(8.0), r64(8.0))]],
            in_channels: vec![8],
        }
        .build(&vs.root());
        head.set_strides(vec![8])?;

        let xs = Tensor::randn(&[1, 8, 4, 4], (Kind::Float, Device::Cpu));
        let before = head
            .forward(&[&xs], true)?
            .feature_maps
            .into_iter()
            .next()
            .unwrap();
        head.init_biases(None)?;
        let after = head
            .forward(&[&xs], true)?
            .feature_maps
            .into_iter()
            .next()
            .unwrap();

        let delta = after - before;
        let obj_shift = f64::from(delta.i((.., .., .., .., 4..5)).mean(Kind::Float));
        assert_abs_diff_eq!(
            obj_shift,
            (8.0 / (640.0f64 / 8.0).powi(2)).ln(),
            epsilon = 1e-4
        );
        let class_shift = f64::from(delta.i((.., .., .., .., 5..)).mean(Kind::Float));
        assert_abs_diff_eq!(
            class_shift,
            (0.6 / (2.0 - 0.999999)).ln(),
            epsilon = 1e-4
        );
        let box_shift = f64::from(delta.i((.., .., .., .., 0..4)).abs().max());
        assert_abs_diff_eq!(box_shift, 0.0, epsilon = 1e-6);
        Ok(())
    }
}
