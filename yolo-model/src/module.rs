//! Building blocks for the detection network.

use crate::common::*;
use crate::detect::{Detect, DetectInit, DetectionOutput};
use model_spec::Module as ModuleConfig;

pub use bottleneck_::*;
pub use c3_::*;
pub use concat_::*;
pub use contract_::*;
pub use conv_block_::*;
pub use conv_next_stage_::*;
pub use expand_::*;
pub use focus_::*;
pub use module_::*;
pub use module_input_::*;
pub use reorg_::*;
pub use spp_::*;
pub use sppf_::*;
pub use sum_::*;
pub use up_sample_::*;
pub use weighted_sum_::*;

mod module_ {
    use super::*;

    #[derive(Debug, AsRefStr)]
    pub enum Module {
        Conv(ConvBlock),
        Focus(Focus),
        Bottleneck(Bottleneck),
        C3(C3),
        Spp(Spp),
        Sppf(Sppf),
        Reorg(Reorg),
        Contract(Contract),
        Expand(Expand),
        ConvNextStage(ConvNextStage),
        Upsample(Upsample),
        Concat(Concat),
        Sum(Sum),
        WeightedSum(WeightedSum),
        Detect(Detect),
    }

    impl Module {
        pub fn from_config<'p, P>(config: &ModuleConfig, path: P) -> Self
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();

            match config {
                ModuleConfig::Conv(cfg) => Self::Conv(
                    ConvBlockInit {
                        s: cfg.s,
                        p: cfg.p,
                        ..ConvBlockInit::new(cfg.in_c, cfg.out_c, cfg.k)
                    }
                    .build(path),
                ),
                ModuleConfig::Focus(cfg) => Self::Focus(
                    FocusInit {
                        in_c: cfg.in_c,
                        out_c: cfg.out_c,
                        k: cfg.k,
                    }
                    .build(path),
                ),
                ModuleConfig::Bottleneck(cfg) => Self::Bottleneck(
                    BottleneckInit {
                        shortcut: cfg.shortcut,
                        ..BottleneckInit::new(cfg.in_c, cfg.out_c)
                    }
                    .build(path),
                ),
                ModuleConfig::C3(cfg) => Self::C3(
                    C3Init {
                        depth: cfg.depth,
                        shortcut: cfg.shortcut,
                        ..C3Init::new(cfg.in_c, cfg.out_c)
                    }
                    .build(path),
                ),
                ModuleConfig::Spp(cfg) => Self::Spp(
                    SppInit {
                        ks: cfg.kernels.clone(),
                        ..SppInit::new(cfg.in_c, cfg.out_c)
                    }
                    .build(path),
                ),
                ModuleConfig::Sppf(cfg) => Self::Sppf(
                    SppfInit {
                        k: cfg.k,
                        ..SppfInit::new(cfg.in_c, cfg.out_c)
                    }
                    .build(path),
                ),
                ModuleConfig::Reorg(_) => Self::Reorg(Reorg),
                ModuleConfig::Contract(cfg) => Self::Contract(Contract::new(cfg.gain)),
                ModuleConfig::Expand(cfg) => Self::Expand(Expand::new(cfg.gain)),
                ModuleConfig::ConvNextStage(cfg) => Self::ConvNextStage(
                    ConvNextStageInit {
                        in_c: cfg.in_c,
                        out_c: cfg.out_c,
                        depth: cfg.depth,
                        downsample: cfg.downsample,
                    }
                    .build(path),
                ),
                ModuleConfig::Upsample(cfg) => Self::Upsample(Upsample::new(cfg.scale.raw())),
                ModuleConfig::Concat(_) => Self::Concat(Concat),
                ModuleConfig::Sum(_) => Self::Sum(Sum),
                ModuleConfig::WeightedSum(cfg) => Self::WeightedSum(
                    WeightedSumInit {
                        num_inputs: cfg.in_channels.len(),
                    }
                    .build(path),
                ),
                ModuleConfig::Detect(cfg) => Self::Detect(
                    DetectInit {
                        num_classes: cfg.num_classes,
                        anchors: cfg.anchors.clone(),
                        in_channels: cfg.in_channels.clone(),
                    }
                    .build(path),
                ),
            }
        }

        pub fn forward_t<'a>(
            &mut self,
            input: impl Into<ModuleInput<'a>>,
            train: bool,
        ) -> Result<ModuleOutput> {
            let input = input.into();

            let output: ModuleOutput = match self {
                Self::Conv(module) => module
                    .forward_t(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                        train,
                    )
                    .into(),
                Self::Focus(module) => module
                    .forward_t(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                        train,
                    )?
                    .into(),
                Self::Bottleneck(module) => module
                    .forward_t(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                        train,
                    )
                    .into(),
                Self::C3(module) => module
                    .forward_t(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                        train,
                    )
                    .into(),
                Self::Spp(module) => module
                    .forward_t(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                        train,
                    )
                    .into(),
                Self::Sppf(module) => module
                    .forward_t(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                        train,
                    )
                    .into(),
                Self::Reorg(module) => module
                    .forward(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                    )?
                    .into(),
                Self::Contract(module) => module
                    .forward(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                    )?
                    .into(),
                Self::Expand(module) => module
                    .forward(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                    )?
                    .into(),
                Self::ConvNextStage(module) => module
                    .forward_t(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                        train,
                    )
                    .into(),
                Self::Upsample(module) => module
                    .forward(
                        input
                            .tensor()
                            .ok_or_else(|| format_err!("expected a single input"))?,
                    )?
                    .into(),
                Self::Concat(module) => module
                    .forward(
                        &input
                            .indexed_tensor()
                            .ok_or_else(|| format_err!("expected an indexed input"))?,
                    )?
                    .into(),
                Self::Sum(module) => module
                    .forward(
                        &input
                            .indexed_tensor()
                            .ok_or_else(|| format_err!("expected an indexed input"))?,
                    )?
                    .into(),
                Self::WeightedSum(module) => module
                    .forward(
                        &input
                            .indexed_tensor()
                            .ok_or_else(|| format_err!("expected an indexed input"))?,
                    )?
                    .into(),
                Self::Detect(module) => {
                    let tensors = match &input {
                        ModuleInput::Single(tensor) => vec![*tensor],
                        ModuleInput::Indexed(tensors) => tensors.clone(),
                    };
                    module.forward(&tensors, train)?.into()
                }
            };

            Ok(output)
        }

        /// Folds batch norms into their preceding convolutions. Returns the
        /// number of normalization layers removed.
        pub fn fuse(&mut self) -> usize {
            match self {
                Self::Conv(module) => module.fuse(),
                Self::Focus(module) => module.fuse(),
                Self::Bottleneck(module) => module.fuse(),
                Self::C3(module) => module.fuse(),
                Self::Spp(module) => module.fuse(),
                Self::Sppf(module) => module.fuse(),
                _ => 0,
            }
        }

        pub fn num_params(&self) -> usize {
            match self {
                Self::Conv(module) => module.num_params(),
                Self::Focus(module) => module.num_params(),
                Self::Bottleneck(module) => module.num_params(),
                Self::C3(module) => module.num_params(),
                Self::Spp(module) => module.num_params(),
                Self::Sppf(module) => module.num_params(),
                Self::ConvNextStage(module) => module.num_params(),
                Self::WeightedSum(module) => module.num_params(),
                Self::Detect(module) => module.num_params(),
                Self::Reorg(_)
                | Self::Contract(_)
                | Self::Expand(_)
                | Self::Upsample(_)
                | Self::Concat(_)
                | Self::Sum(_) => 0,
            }
        }

        pub fn as_detect(&self) -> Option<&Detect> {
            match self {
                Self::Detect(module) => Some(module),
                _ => None,
            }
        }

        pub fn as_detect_mut(&mut self) -> Option<&mut Detect> {
            match self {
                Self::Detect(module) => Some(module),
                _ => None,
            }
        }
    }
}

mod module_input_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub enum ModuleInput<'a> {
        Single(&'a Tensor),
        Indexed(Vec<&'a Tensor>),
    }

    impl<'a> ModuleInput<'a> {
        pub fn tensor(&self) -> Option<&'a Tensor> {
            match *self {
                Self::Single(tensor) => Some(tensor),
                _ => None,
            }
        }

        pub fn indexed_tensor(&self) -> Option<Vec<&'a Tensor>> {
            match self {
                Self::Indexed(tensors) => Some(tensors.clone()),
                _ => None,
            }
        }
    }

    impl<'a> From<&'a Tensor> for ModuleInput<'a> {
        fn from(from: &'a Tensor) -> Self {
            Self::Single(from)
        }
    }

    impl<'a> From<Vec<&'a Tensor>> for ModuleInput<'a> {
        fn from(from: Vec<&'a Tensor>) -> Self {
            Self::Indexed(from)
        }
    }

    impl<'a, 'b> From<&'b [&'a Tensor]> for ModuleInput<'a> {
        fn from(from: &'b [&'a Tensor]) -> Self {
            Self::Indexed(from.to_vec())
        }
    }

    #[derive(Debug)]
    pub enum ModuleOutput {
        Tensor(Tensor),
        Detect(DetectionOutput),
    }

    impl ModuleOutput {
        pub fn as_tensor(&self) -> Option<&Tensor> {
            match self {
                Self::Tensor(tensor) => Some(tensor),
                _ => None,
            }
        }

        pub fn tensor(self) -> Option<Tensor> {
            match self {
                Self::Tensor(tensor) => Some(tensor),
                _ => None,
            }
        }

        pub fn detect(self) -> Option<DetectionOutput> {
            match self {
                Self::Detect(detect) => Some(detect),
                _ => None,
            }
        }
    }

    impl From<Tensor> for ModuleOutput {
        fn from(tensor: Tensor) -> Self {
            Self::Tensor(tensor)
        }
    }

    impl From<DetectionOutput> for ModuleOutput {
        fn from(from: DetectionOutput) -> Self {
            Self::Detect(from)
        }
    }
}

mod conv_block_ {
    use super::*;

    pub(super) const BN_EPS: f64 = 1e-5;

    #[derive(Debug, Clone)]
    pub struct ConvBlockInit {
        pub in_c: usize,
        pub out_c: usize,
        pub k: usize,
        pub s: usize,
        pub p: usize,
        pub g: usize,
    }

    impl ConvBlockInit {
        pub fn new(in_c: usize, out_c: usize, k: usize) -> Self {
            Self {
                in_c,
                out_c,
                k,
                s: 1,
                p: k / 2,
                g: 1,
            }
        }

        pub fn build<'p, P>(self, path: P) -> ConvBlock
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();

            let Self {
                in_c,
                out_c,
                k,
                s,
                p,
                g,
            } = self;

            let conv = nn::conv2d(
                path / "conv",
                in_c as i64,
                out_c as i64,
                k as i64,
                nn::ConvConfig {
                    stride: s as i64,
                    padding: p as i64,
                    groups: g as i64,
                    bias: false,
                    ..Default::default()
                },
            );
            let bn = nn::batch_norm2d(path / "bn", out_c as i64, Default::default());

            ConvBlock {
                conv,
                bn: Some(bn),
            }
        }
    }

    #[derive(Debug)]
    pub struct ConvBlock {
        conv: nn::Conv2D,
        bn: Option<nn::BatchNorm>,
    }

    impl nn::ModuleT for ConvBlock {
        fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let Self { ref conv, ref bn } = *self;

            let xs = xs.apply(conv);
            let xs = match bn {
                Some(bn) => xs.apply_t(bn, train),
                None => xs,
            };
            &xs * xs.sigmoid()
        }
    }

    impl ConvBlock {
        /// Folds the batch norm statistics into the convolution weights and
        /// bias. Returns the number of normalization layers removed.
        pub fn fuse(&mut self) -> usize {
            let bn = match self.bn.take() {
                Some(bn) => bn,
                None => return 0,
            };

            tch::no_grad(|| {
                let scale = &bn.ws / (&bn.running_var + BN_EPS).sqrt();

                let out_c = self.conv.ws.size()[0];
                let zero_bias;
                let bias = match &self.conv.bs {
                    Some(bs) => bs,
                    None => {
                        zero_bias =
                            Tensor::zeros(&[out_c], (Kind::Float, self.conv.ws.device()));
                        &zero_bias
                    }
                };

                let fused_ws = &self.conv.ws * scale.view([-1, 1, 1, 1]);
                let fused_bs = &bn.bs + (bias - &bn.running_mean) * &scale;

                self.conv.ws = fused_ws.set_requires_grad(false);
                self.conv.bs = Some(fused_bs.set_requires_grad(false));
            });

            1
        }

        pub fn num_params(&self) -> usize {
            let Self { conv, bn } = self;
            let conv_params =
                conv.ws.numel() + conv.bs.as_ref().map(|bs| bs.numel()).unwrap_or(0);
            let bn_params = bn
                .as_ref()
                .map(|bn| bn.ws.numel() + bn.bs.numel())
                .unwrap_or(0);
            conv_params + bn_params
        }
    }
}

mod focus_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct FocusInit {
        pub in_c: usize,
        pub out_c: usize,
        pub k: usize,
    }

    impl FocusInit {
        pub fn build<'p, P>(self, path: P) -> Focus
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();
            let Self { in_c, out_c, k } = self;

            Focus {
                conv: ConvBlockInit::new(in_c * 4, out_c, k).build(path / "conv"),
            }
        }
    }

    #[derive(Debug)]
    pub struct Focus {
        conv: ConvBlock,
    }

    impl Focus {
        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
            let (_b, _c, height, width) = xs.size4()?;
            let xs = Tensor::cat(
                &[
                    xs.slice(2, 0, height, 2).slice(3, 0, width, 2),
                    xs.slice(2, 1, height, 2).slice(3, 0, width, 2),
                    xs.slice(2, 0, height, 2).slice(3, 1, width, 2),
                    xs.slice(2, 1, height, 2).slice(3, 1, width, 2),
                ],
                1,
            );
            Ok(self.conv.forward_t(&xs, train))
        }

        pub fn fuse(&mut self) -> usize {
            self.conv.fuse()
        }

        pub fn num_params(&self) -> usize {
            self.conv.num_params()
        }
    }
}

mod bottleneck_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct BottleneckInit {
        pub in_c: usize,
        pub out_c: usize,
        pub shortcut: bool,
        pub g: usize,
        pub expansion: R64,
    }

    impl BottleneckInit {
        pub fn new(in_c: usize, out_c: usize) -> Self {
            Self {
                in_c,
                out_c,
                shortcut: true,
                g: 1,
                expansion: R64::new(0.5),
            }
        }

        pub fn build<'p, P>(self, path: P) -> Bottleneck
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();

            let Self {
                in_c,
                out_c,
                shortcut,
                g,
                expansion,
            } = self;

            let intermediate_channels = (out_c as f64 * expansion.raw()) as usize;

            let conv1 =
                ConvBlockInit::new(in_c, intermediate_channels, 1).build(path / "conv1");
            let conv2 = ConvBlockInit {
                g,
                ..ConvBlockInit::new(intermediate_channels, out_c, 3)
            }
            .build(path / "conv2");
            let with_add = shortcut && in_c == out_c;

            Bottleneck {
                conv1,
                conv2,
                with_add,
            }
        }
    }

    #[derive(Debug)]
    pub struct Bottleneck {
        conv1: ConvBlock,
        conv2: ConvBlock,
        with_add: bool,
    }

    impl Bottleneck {
        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let ys = self.conv1.forward_t(xs, train);
            let ys = self.conv2.forward_t(&ys, train);
            if self.with_add {
                xs + ys
            } else {
                ys
            }
        }

        pub fn fuse(&mut self) -> usize {
            self.conv1.fuse() + self.conv2.fuse()
        }

        pub fn num_params(&self) -> usize {
            self.conv1.num_params() + self.conv2.num_params()
        }
    }
}

mod c3_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct C3Init {
        pub in_c: usize,
        pub out_c: usize,
        pub depth: usize,
        pub shortcut: bool,
        pub g: usize,
        pub expansion: R64,
    }

    impl C3Init {
        pub fn new(in_c: usize, out_c: usize) -> Self {
            Self {
                in_c,
                out_c,
                depth: 1,
                shortcut: true,
                g: 1,
                expansion: R64::new(0.5),
            }
        }

        pub fn build<'p, P>(self, path: P) -> C3
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();

            let Self {
                in_c,
                out_c,
                depth,
                shortcut,
                g,
                expansion,
            } = self;
            debug_assert!(depth > 0);

            let intermediate_channels = (out_c as f64 * expansion.raw()) as usize;

            let conv1 =
                ConvBlockInit::new(in_c, intermediate_channels, 1).build(path / "conv1");
            let conv2 =
                ConvBlockInit::new(in_c, intermediate_channels, 1).build(path / "conv2");
            let conv3 = ConvBlockInit::new(intermediate_channels * 2, out_c, 1)
                .build(path / "conv3");
            let bottlenecks: Vec<_> = (0..depth)
                .map(|index| {
                    BottleneckInit {
                        shortcut,
                        g,
                        expansion: R64::new(1.0),
                        ..BottleneckInit::new(
                            intermediate_channels,
                            intermediate_channels,
                        )
                    }
                    .build(path / format!("bottleneck_{}", index))
                })
                .collect();

            C3 {
                conv1,
                conv2,
                conv3,
                bottlenecks,
            }
        }
    }

    #[derive(Debug)]
    pub struct C3 {
        conv1: ConvBlock,
        conv2: ConvBlock,
        conv3: ConvBlock,
        bottlenecks: Vec<Bottleneck>,
    }

    impl C3 {
        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let Self {
                ref conv1,
                ref conv2,
                ref conv3,
                ref bottlenecks,
            } = *self;

            let main = bottlenecks
                .iter()
                .fold(conv1.forward_t(xs, train), |xs, block| {
                    block.forward_t(&xs, train)
                });
            let skip = conv2.forward_t(xs, train);
            conv3.forward_t(&Tensor::cat(&[main, skip], 1), train)
        }

        pub fn fuse(&mut self) -> usize {
            self.conv1.fuse()
                + self.conv2.fuse()
                + self.conv3.fuse()
                + self
                    .bottlenecks
                    .iter_mut()
                    .map(|block| block.fuse())
                    .sum::<usize>()
        }

        pub fn num_params(&self) -> usize {
            self.conv1.num_params()
                + self.conv2.num_params()
                + self.conv3.num_params()
                + self
                    .bottlenecks
                    .iter()
                    .map(|block| block.num_params())
                    .sum::<usize>()
        }
    }
}

mod spp_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct SppInit {
        pub in_c: usize,
        pub out_c: usize,
        pub ks: Vec<usize>,
    }

    impl SppInit {
        pub fn new(in_c: usize, out_c: usize) -> Self {
            Self {
                in_c,
                out_c,
                ks: vec![5, 9, 13],
            }
        }

        pub fn build<'p, P>(self, path: P) -> Spp
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();
            let Self { in_c, out_c, ks } = self;

            let intermediate_channels = in_c / 2;

            let conv1 =
                ConvBlockInit::new(in_c, intermediate_channels, 1).build(path / "conv1");
            let conv2 = ConvBlockInit::new(intermediate_channels * (ks.len() + 1), out_c, 1)
                .build(path / "conv2");

            Spp {
                conv1,
                conv2,
                ks: ks.into_iter().map(|k| k as i64).collect(),
            }
        }
    }

    #[derive(Debug)]
    pub struct Spp {
        conv1: ConvBlock,
        conv2: ConvBlock,
        ks: Vec<i64>,
    }

    impl Spp {
        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let Self {
                ref conv1,
                ref conv2,
                ref ks,
            } = *self;

            let xs = conv1.forward_t(xs, train);

            let pyramid_iter = ks.iter().cloned().map(|k| {
                let padding = k / 2;
                let s = 1;
                let dilation = 1;
                let ceil_mode = false;
                xs.max_pool2d(
                    &[k, k],
                    &[s, s],
                    &[padding, padding],
                    &[dilation, dilation],
                    ceil_mode,
                )
            });
            let cat_xs = Tensor::cat(
                &iter::once(xs.shallow_clone())
                    .chain(pyramid_iter)
                    .collect::<Vec<_>>(),
                1,
            );

            conv2.forward_t(&cat_xs, train)
        }

        pub fn fuse(&mut self) -> usize {
            self.conv1.fuse() + self.conv2.fuse()
        }

        pub fn num_params(&self) -> usize {
            self.conv1.num_params() + self.conv2.num_params()
        }
    }
}

mod sppf_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct SppfInit {
        pub in_c: usize,
        pub out_c: usize,
        pub k: usize,
    }

    impl SppfInit {
        pub fn new(in_c: usize, out_c: usize) -> Self {
            Self { in_c, out_c, k: 5 }
        }

        pub fn build<'p, P>(self, path: P) -> Sppf
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();
            let Self { in_c, out_c, k } = self;

            let intermediate_channels = in_c / 2;

            let conv1 =
                ConvBlockInit::new(in_c, intermediate_channels, 1).build(path / "conv1");
            let conv2 = ConvBlockInit::new(intermediate_channels * 4, out_c, 1)
                .build(path / "conv2");

            Sppf {
                conv1,
                conv2,
                k: k as i64,
            }
        }
    }

    /// Equivalent to [Spp] with kernels `[k, 2k - 1, 3k - 2]`, computed with
    /// three chained poolings instead of three parallel ones.
    #[derive(Debug)]
    pub struct Sppf {
        conv1: ConvBlock,
        conv2: ConvBlock,
        k: i64,
    }

    impl Sppf {
        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
            let Self {
                ref conv1,
                ref conv2,
                k,
            } = *self;

            let pool = |xs: &Tensor| {
                let padding = k / 2;
                xs.max_pool2d(&[k, k], &[1, 1], &[padding, padding], &[1, 1], false)
            };

            let xs = conv1.forward_t(xs, train);
            let y1 = pool(&xs);
            let y2 = pool(&y1);
            let y3 = pool(&y2);

            conv2.forward_t(&Tensor::cat(&[xs, y1, y2, y3], 1), train)
        }

        pub fn fuse(&mut self) -> usize {
            self.conv1.fuse() + self.conv2.fuse()
        }

        pub fn num_params(&self) -> usize {
            self.conv1.num_params() + self.conv2.num_params()
        }
    }
}

mod reorg_ {
    use super::*;

    /// Moves each 2x2 pixel block into four channels, like [Focus] without
    /// the trailing convolution.
    #[derive(Debug, Clone)]
    pub struct Reorg;

    impl Reorg {
        pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
            let (_b, _c, height, width) = xs.size4()?;
            let output = Tensor::cat(
                &[
                    xs.slice(2, 0, height, 2).slice(3, 0, width, 2),
                    xs.slice(2, 1, height, 2).slice(3, 0, width, 2),
                    xs.slice(2, 0, height, 2).slice(3, 1, width, 2),
                    xs.slice(2, 1, height, 2).slice(3, 1, width, 2),
                ],
                1,
            );
            Ok(output)
        }
    }
}

mod contract_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Contract {
        gain: i64,
    }

    impl Contract {
        pub fn new(gain: usize) -> Self {
            Self { gain: gain as i64 }
        }

        pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
            let Self { gain } = *self;
            let (b, c, h, w) = xs.size4()?;
            ensure!(
                h % gain == 0 && w % gain == 0,
                "feature size ({}, {}) is not divisible by {}",
                h,
                w,
                gain
            );

            let output = xs
                .view(&[b, c, h / gain, gain, w / gain, gain] as &[_])
                .permute(&[0, 3, 5, 1, 2, 4])
                .contiguous()
                .view([b, c * gain * gain, h / gain, w / gain]);
            Ok(output)
        }
    }
}

mod expand_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Expand {
        gain: i64,
    }

    impl Expand {
        pub fn new(gain: usize) -> Self {
            Self { gain: gain as i64 }
        }

        pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
            let Self { gain } = *self;
            let (b, c, h, w) = xs.size4()?;
            let squared = gain * gain;
            ensure!(
                c % squared == 0,
                "channel count {} is not divisible by {}",
                c,
                squared
            );

            let output = xs
                .view(&[b, gain, gain, c / squared, h, w] as &[_])
                .permute(&[0, 3, 4, 1, 5, 2])
                .contiguous()
                .view([b, c / squared, h * gain, w * gain]);
            Ok(output)
        }
    }
}

mod conv_next_stage_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct ConvNextStageInit {
        pub in_c: usize,
        pub out_c: usize,
        pub depth: usize,
        pub downsample: bool,
    }

    impl ConvNextStageInit {
        pub fn build<'p, P>(self, path: P) -> ConvNextStage
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();

            let Self {
                in_c,
                out_c,
                depth,
                downsample,
            } = self;
            debug_assert!(depth > 0);
            debug_assert!(downsample || in_c == out_c);

            let downsample = downsample.then(|| {
                nn::conv2d(
                    path / "downsample",
                    in_c as i64,
                    out_c as i64,
                    2,
                    nn::ConvConfig {
                        stride: 2,
                        ..Default::default()
                    },
                )
            });
            let blocks: Vec<_> = (0..depth)
                .map(|index| conv_next_block(path / format!("block_{}", index), out_c as i64))
                .collect();

            ConvNextStage { downsample, blocks }
        }
    }

    #[derive(Debug)]
    pub struct ConvNextStage {
        downsample: Option<nn::Conv2D>,
        blocks: Vec<ConvNextBlock>,
    }

    impl ConvNextStage {
        pub fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
            let Self {
                ref downsample,
                ref blocks,
            } = *self;

            let xs = match downsample {
                Some(conv) => xs.apply(conv),
                None => xs.shallow_clone(),
            };
            blocks.iter().fold(xs, |xs, block| block.forward(&xs))
        }

        pub fn num_params(&self) -> usize {
            let downsample_params = self
                .downsample
                .as_ref()
                .map(|conv| {
                    conv.ws.numel() + conv.bs.as_ref().map(|bs| bs.numel()).unwrap_or(0)
                })
                .unwrap_or(0);
            downsample_params
                + self
                    .blocks
                    .iter()
                    .map(|block| block.num_params())
                    .sum::<usize>()
        }
    }

    fn conv_next_block<'p, P>(path: P, dim: i64) -> ConvNextBlock
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let depthwise = nn::conv2d(
            path / "depthwise",
            dim,
            dim,
            7,
            nn::ConvConfig {
                padding: 3,
                groups: dim,
                ..Default::default()
            },
        );
        let norm = nn::layer_norm(path / "norm", vec![dim], Default::default());
        let pointwise1 = nn::linear(path / "pointwise1", dim, dim * 4, Default::default());
        let pointwise2 = nn::linear(path / "pointwise2", dim * 4, dim, Default::default());
        let scale = path.var("scale", &[dim], nn::Init::Const(1e-6));

        ConvNextBlock {
            depthwise,
            norm,
            pointwise1,
            pointwise2,
            scale,
            dim,
        }
    }

    /// Depthwise 7x7 convolution followed by a pointwise inverted bottleneck,
    /// normalized and gated in channels-last layout.
    #[derive(Debug)]
    struct ConvNextBlock {
        depthwise: nn::Conv2D,
        norm: nn::LayerNorm,
        pointwise1: nn::Linear,
        pointwise2: nn::Linear,
        scale: Tensor,
        dim: i64,
    }

    impl ConvNextBlock {
        fn forward(&self, xs: &Tensor) -> Tensor {
            let Self {
                ref depthwise,
                ref norm,
                ref pointwise1,
                ref pointwise2,
                ref scale,
                ..
            } = *self;

            let ys = xs
                .apply(depthwise)
                .permute(&[0, 2, 3, 1])
                .apply(norm)
                .apply(pointwise1)
                .gelu()
                .apply(pointwise2);
            let ys = (ys * scale).permute(&[0, 3, 1, 2]);
            xs + ys
        }

        fn num_params(&self) -> usize {
            let Self {
                depthwise,
                pointwise1,
                pointwise2,
                scale,
                dim,
                ..
            } = self;

            let conv_params = depthwise.ws.numel()
                + depthwise.bs.as_ref().map(|bs| bs.numel()).unwrap_or(0);
            let norm_params = 2 * *dim as usize;
            let linear_params = pointwise1.ws.numel()
                + pointwise1.bs.as_ref().map(|bs| bs.numel()).unwrap_or(0)
                + pointwise2.ws.numel()
                + pointwise2.bs.as_ref().map(|bs| bs.numel()).unwrap_or(0);
            conv_params + norm_params + linear_params + scale.numel()
        }
    }
}

mod up_sample_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Upsample {
        scale: f64,
    }

    impl Upsample {
        pub fn new(scale: f64) -> Self {
            debug_assert!(scale.is_finite() && scale.is_sign_positive());
            Self { scale }
        }

        pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
            let Self { scale } = *self;
            let (_b, _c, in_h, in_w) = xs.size4()?;
            let out_h = (in_h as f64 * scale) as i64;
            let out_w = (in_w as f64 * scale) as i64;
            let output = xs.upsample_nearest2d(&[out_h, out_w], None, None);
            Ok(output)
        }
    }
}

mod concat_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Concat;

    impl Concat {
        pub fn forward<T>(&self, tensors: &[T]) -> Result<Tensor>
        where
            T: Borrow<Tensor>,
        {
            ensure!(!tensors.is_empty(), "empty input is not allowed");

            let (_b, _c, expect_h, expect_w) = tensors[0].borrow().size4()?;
            tensors
                .iter()
                .enumerate()
                .skip(1)
                .try_for_each(|(index, tensor)| -> Result<_> {
                    let (_b, _c, h, w) = tensor.borrow().size4()?;
                    ensure!(
                        (h, w) == (expect_h, expect_w),
                        "input {} has feature size ({}, {}), but the leading input has ({}, {})",
                        index,
                        h,
                        w,
                        expect_h,
                        expect_w
                    );
                    Ok(())
                })?;

            let output = Tensor::f_cat(tensors, 1)?;
            Ok(output)
        }
    }
}

mod sum_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct Sum;

    impl Sum {
        pub fn forward<T>(&self, tensors: &[T]) -> Result<Tensor>
        where
            T: Borrow<Tensor>,
        {
            let mut iter = tensors.iter();
            let first = iter
                .next()
                .ok_or_else(|| format_err!("empty input is not allowed"))?
                .borrow()
                .shallow_clone();
            let size = first.size();

            let output = iter.enumerate().try_fold(first, |acc, (index, tensor)| {
                let tensor = tensor.borrow();
                ensure!(
                    tensor.size() == size,
                    "input {} has shape {:?}, but the leading input has shape {:?}",
                    index + 1,
                    tensor.size(),
                    size
                );
                Ok(acc + tensor)
            })?;
            Ok(output)
        }
    }
}

mod weighted_sum_ {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct WeightedSumInit {
        pub num_inputs: usize,
    }

    impl WeightedSumInit {
        pub fn build<'p, P>(self, path: P) -> WeightedSum
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();
            let device = path.device();
            let Self { num_inputs } = self;
            debug_assert!(num_inputs >= 2);

            // one gate per source after the first, starting below parity
            let mut weights =
                path.var("weights", &[num_inputs as i64 - 1], nn::Init::Const(0.0));
            tch::no_grad(|| {
                let init: Vec<f32> = (1..num_inputs)
                    .map(|index| -(index as f32) / 2.0)
                    .collect();
                weights.copy_(&Tensor::of_slice(&init).to_device(device));
            });

            WeightedSum { weights }
        }
    }

    /// Adds the trailing inputs onto the first one, each scaled by a learned
    /// sigmoid gate in `(0, 2)`.
    #[derive(Debug)]
    pub struct WeightedSum {
        weights: Tensor,
    }

    impl WeightedSum {
        pub fn forward<T>(&self, tensors: &[T]) -> Result<Tensor>
        where
            T: Borrow<Tensor>,
        {
            let num_weights = self.weights.size1()?;
            ensure!(
                tensors.len() as i64 == num_weights + 1,
                "expected {} inputs, found {}",
                num_weights + 1,
                tensors.len()
            );

            let mut iter = tensors.iter();
            let first = iter
                .next()
                .ok_or_else(|| format_err!("empty input is not allowed"))?
                .borrow()
                .shallow_clone();
            let size = first.size();

            let gates = self.weights.sigmoid() * 2.0;
            let output = iter.enumerate().try_fold(first, |acc, (index, tensor)| {
                let tensor = tensor.borrow();
                ensure!(
                    tensor.size() == size,
                    "input {} has shape {:?}, but the leading input has shape {:?}",
                    index + 1,
                    tensor.size(),
                    size
                );
                Ok(acc + tensor * gates.i(index as i64))
            })?;
            Ok(output)
        }

        pub fn num_params(&self) -> usize {
            self.weights.numel()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reorg_rearranges_pixels() -> Result<()> {
        let xs = Tensor::arange(16, (Kind::Float, Device::Cpu)).view([1, 1, 4, 4]);
        let output = Reorg.forward(&xs)?;

        assert_eq!(output.size(), &[1, 4, 2, 2]);
        assert_eq!(
            Vec::<f64>::from(&output.reshape(&[-1])),
            vec![
                0.0, 2.0, 8.0, 10.0, // even rows, even cols
                4.0, 6.0, 12.0, 14.0, // odd rows, even cols
                1.0, 3.0, 9.0, 11.0, // even rows, odd cols
                5.0, 7.0, 13.0, 15.0, // odd rows, odd cols
            ]
        );
        Ok(())
    }

    #[test]
    fn contract_and_expand_are_inverses() -> Result<()> {
        let xs = Tensor::randn(&[2, 4, 6, 6], (Kind::Float, Device::Cpu));

        let contracted = Contract::new(2).forward(&xs)?;
        assert_eq!(contracted.size(), &[2, 16, 3, 3]);

        let expanded = Expand::new(2).forward(&contracted)?;
        assert_eq!(expanded.size(), xs.size());
        let diff = f64::from((&expanded - &xs).abs().max());
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn contract_rejects_odd_feature_sizes() {
        let xs = Tensor::randn(&[1, 2, 5, 6], (Kind::Float, Device::Cpu));
        let error = Contract::new(2).forward(&xs).unwrap_err();
        assert!(format!("{:#}", error).contains("not divisible"));
    }

    #[test]
    fn focus_halves_the_feature_size() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let focus = FocusInit {
            in_c: 3,
            out_c: 16,
            k: 3,
        }
        .build(&vs.root());

        let xs = Tensor::randn(&[1, 3, 8, 8], (Kind::Float, Device::Cpu));
        let output = focus.forward_t(&xs, false)?;
        assert_eq!(output.size(), &[1, 16, 4, 4]);
        Ok(())
    }

    #[test]
    fn conv_block_fuse_keeps_outputs() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut block = ConvBlockInit::new(4, 8, 3).build(&vs.root());

        let xs = Tensor::randn(&[2, 4, 8, 8], (Kind::Float, Device::Cpu));

        // drift the running statistics away from their defaults
        for _ in 0..3 {
            let _ = block.forward_t(&xs, true);
        }

        let before = block.forward_t(&xs, false);
        assert_eq!(block.fuse(), 1);
        assert_eq!(block.fuse(), 0);
        let after = block.forward_t(&xs, false);

        assert_eq!(after.size(), &[2, 8, 8, 8]);
        let diff = f64::from((&before - &after).abs().max());
        assert_abs_diff_eq!(diff, 0.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn spp_and_sppf_keep_the_feature_size() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let spp = SppInit::new(8, 16).build(&vs.root() / "spp");
        let sppf = SppfInit::new(8, 16).build(&vs.root() / "sppf");

        let xs = Tensor::randn(&[1, 8, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(spp.forward_t(&xs, false).size(), &[1, 16, 8, 8]);
        assert_eq!(sppf.forward_t(&xs, false).size(), &[1, 16, 8, 8]);
        Ok(())
    }

    #[test]
    fn c3_stacks_bottlenecks() {
        let vs = nn::VarStore::new(Device::Cpu);
        let c3 = C3Init {
            depth: 2,
            ..C3Init::new(16, 32)
        }
        .build(&vs.root());

        let xs = Tensor::randn(&[1, 16, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(c3.forward_t(&xs, false).size(), &[1, 32, 8, 8]);
    }

    #[test]
    fn conv_next_stage_downsamples() {
        let vs = nn::VarStore::new(Device::Cpu);
        let stage = ConvNextStageInit {
            in_c: 8,
            out_c: 16,
            depth: 2,
            downsample: true,
        }
        .build(&vs.root());

        let xs = Tensor::randn(&[1, 8, 8, 8], (Kind::Float, Device::Cpu));
        assert_eq!(stage.forward_t(&xs, false).size(), &[1, 16, 4, 4]);
    }

    #[test]
    fn upsample_repeats_nearest_values() -> Result<()> {
        let xs = Tensor::arange(4, (Kind::Float, Device::Cpu)).view([1, 1, 2, 2]);
        let output = Upsample::new(2.0).forward(&xs)?;

        assert_eq!(output.size(), &[1, 1, 4, 4]);
        assert_eq!(
            Vec::<f64>::from(&output.reshape(&[-1])),
            vec![
                0.0, 0.0, 1.0, 1.0, //
                0.0, 0.0, 1.0, 1.0, //
                2.0, 2.0, 3.0, 3.0, //
                2.0, 2.0, 3.0, 3.0, //
            ]
        );
        Ok(())
    }

    #[test]
    fn sum_requires_matching_shapes() -> Result<()> {
        let a = Tensor::ones(&[1, 2, 4, 4], (Kind::Float, Device::Cpu));
        let b = &a * 2.0;

        let output = Sum.forward(&[&a, &b])?;
        assert_abs_diff_eq!(f64::from(output.mean(Kind::Float)), 3.0);

        let c = Tensor::ones(&[1, 2, 2, 2], (Kind::Float, Device::Cpu));
        let error = Sum.forward(&[&a, &c]).unwrap_err();
        assert!(format!("{:#}", error).contains("shape"));
        Ok(())
    }

    #[test]
    fn weighted_sum_gates_the_tail_inputs() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let module = WeightedSumInit { num_inputs: 2 }.build(&vs.root());

        let a = Tensor::zeros(&[1, 2, 2, 2], (Kind::Float, Device::Cpu));
        let b = Tensor::ones(&[1, 2, 2, 2], (Kind::Float, Device::Cpu));
        let output = module.forward(&[&a, &b])?;

        // the first gate starts at 2 * sigmoid(-1/2)
        let expect = 2.0 / (1.0 + 0.5f64.exp());
        assert_abs_diff_eq!(f64::from(output.mean(Kind::Float)), expect, epsilon = 1e-6);

        let error = module.forward(&[&a, &b, &a]).unwrap_err();
        assert!(format!("{:#}", error).contains("expected 2 inputs"));
        Ok(())
    }

    #[test]
    fn dispatch_checks_the_input_arity() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = ModuleConfig::Conv(model_spec::ConvSpec {
            in_c: 3,
            out_c: 8,
            k: 3,
            s: 2,
            p: 1,
        });
        let mut module = Module::from_config(&config, &vs.root());

        let xs = Tensor::randn(&[1, 3, 8, 8], (Kind::Float, Device::Cpu));
        let output = module.forward_t(&xs, false)?.tensor().unwrap();
        assert_eq!(output.size(), &[1, 8, 4, 4]);

        let error = module.forward_t(vec![&xs, &xs], false).unwrap_err();
        assert!(format!("{:#}", error).contains("single input"));
        Ok(())
    }
}
