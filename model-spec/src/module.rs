//! Resolved per-kind layer configurations.
//!
//! The plan builder turns raw `[from, repeat, kind, args]` rows into these
//! fully-typed configs. Channel counts here are final: width scaling and
//! source resolution have already been applied.

use crate::{common::*, config::ModuleKind};

pub use detect_::*;
pub use module_::*;
pub use shape_::*;
pub use standard_::*;

mod standard_ {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ConvSpec {
        pub in_c: usize,
        pub out_c: usize,
        pub k: usize,
        pub s: usize,
        pub p: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FocusSpec {
        pub in_c: usize,
        pub out_c: usize,
        pub k: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct BottleneckSpec {
        pub in_c: usize,
        pub out_c: usize,
        pub shortcut: bool,
    }

    /// CSP bottleneck stack with three projection convs. `depth` is the
    /// number of internal bottlenecks and absorbs the layer's repeat count.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct C3Spec {
        pub in_c: usize,
        pub out_c: usize,
        pub depth: usize,
        pub shortcut: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SppSpec {
        pub in_c: usize,
        pub out_c: usize,
        pub kernels: Vec<usize>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SppfSpec {
        pub in_c: usize,
        pub out_c: usize,
        pub k: usize,
    }

    /// Opaque backbone stage. Channels pass through exactly as declared,
    /// exempt from width scaling.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ConvNextStageSpec {
        pub in_c: usize,
        pub out_c: usize,
        pub depth: usize,
        pub downsample: bool,
    }
}

mod shape_ {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReorgSpec {
        pub in_c: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ContractSpec {
        pub in_c: usize,
        pub gain: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExpandSpec {
        pub in_c: usize,
        pub gain: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct UpsampleSpec {
        pub in_c: usize,
        pub scale: R64,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ConcatSpec {
        pub in_channels: Vec<usize>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SumSpec {
        pub in_channels: Vec<usize>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WeightedSumSpec {
        pub in_channels: Vec<usize>,
    }
}

mod detect_ {
    use super::*;

    /// Detection head config. The builder injects the class count and the
    /// anchor table from the document header and appends the per-source
    /// channel list.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DetectSpec {
        pub num_classes: usize,
        pub anchors: Vec<Vec<(R64, R64)>>,
        pub in_channels: Vec<usize>,
    }

    impl DetectSpec {
        pub fn num_scales(&self) -> usize {
            self.in_channels.len()
        }

        pub fn num_anchors(&self) -> usize {
            self.anchors.first().map(|row| row.len()).unwrap_or(0)
        }

        /// Output width per grid position, `na * (nc + 5)`.
        pub fn num_outputs(&self) -> usize {
            self.num_anchors() * (self.num_classes + 5)
        }
    }
}

mod module_ {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Module {
        Conv(ConvSpec),
        Focus(FocusSpec),
        Bottleneck(BottleneckSpec),
        C3(C3Spec),
        Spp(SppSpec),
        Sppf(SppfSpec),
        Reorg(ReorgSpec),
        Contract(ContractSpec),
        Expand(ExpandSpec),
        ConvNextStage(ConvNextStageSpec),
        Upsample(UpsampleSpec),
        Concat(ConcatSpec),
        Sum(SumSpec),
        WeightedSum(WeightedSumSpec),
        Detect(DetectSpec),
    }

    impl Module {
        pub fn kind(&self) -> ModuleKind {
            match self {
                Self::Conv(_) => ModuleKind::Conv,
                Self::Focus(_) => ModuleKind::Focus,
                Self::Bottleneck(_) => ModuleKind::Bottleneck,
                Self::C3(_) => ModuleKind::C3,
                Self::Spp(_) => ModuleKind::Spp,
                Self::Sppf(_) => ModuleKind::Sppf,
                Self::Reorg(_) => ModuleKind::Reorg,
                Self::Contract(_) => ModuleKind::Contract,
                Self::Expand(_) => ModuleKind::Expand,
                Self::ConvNextStage(_) => ModuleKind::ConvNextStage,
                Self::Upsample(_) => ModuleKind::Upsample,
                Self::Concat(_) => ModuleKind::Concat,
                Self::Sum(_) => ModuleKind::Sum,
                Self::WeightedSum(_) => ModuleKind::WeightedSum,
                Self::Detect(_) => ModuleKind::Detect,
            }
        }

        pub fn input_channels(&self) -> Vec<usize> {
            match self {
                Self::Conv(spec) => vec![spec.in_c],
                Self::Focus(spec) => vec![spec.in_c],
                Self::Bottleneck(spec) => vec![spec.in_c],
                Self::C3(spec) => vec![spec.in_c],
                Self::Spp(spec) => vec![spec.in_c],
                Self::Sppf(spec) => vec![spec.in_c],
                Self::Reorg(spec) => vec![spec.in_c],
                Self::Contract(spec) => vec![spec.in_c],
                Self::Expand(spec) => vec![spec.in_c],
                Self::ConvNextStage(spec) => vec![spec.in_c],
                Self::Upsample(spec) => vec![spec.in_c],
                Self::Concat(spec) => spec.in_channels.clone(),
                Self::Sum(spec) => spec.in_channels.clone(),
                Self::WeightedSum(spec) => spec.in_channels.clone(),
                Self::Detect(spec) => spec.in_channels.clone(),
            }
        }

        pub fn output_channels(&self) -> usize {
            match self {
                Self::Conv(spec) => spec.out_c,
                Self::Focus(spec) => spec.out_c,
                Self::Bottleneck(spec) => spec.out_c,
                Self::C3(spec) => spec.out_c,
                Self::Spp(spec) => spec.out_c,
                Self::Sppf(spec) => spec.out_c,
                Self::Reorg(spec) => spec.in_c * 4,
                Self::Contract(spec) => spec.in_c * spec.gain * spec.gain,
                Self::Expand(spec) => spec.in_c / (spec.gain * spec.gain),
                Self::ConvNextStage(spec) => spec.out_c,
                Self::Upsample(spec) => spec.in_c,
                Self::Concat(spec) => spec.in_channels.iter().sum(),
                Self::Sum(spec) => spec.in_channels.iter().sum::<usize>() / 2,
                Self::WeightedSum(spec) => {
                    spec.in_channels.iter().copied().max().unwrap_or(0)
                }
                Self::Detect(spec) => spec.num_outputs(),
            }
        }

        pub fn as_detect(&self) -> Option<&DetectSpec> {
            match self {
                Self::Detect(spec) => Some(spec),
                _ => None,
            }
        }

        /// Compact argument summary for the assembly log table.
        pub fn describe(&self) -> String {
            match self {
                Self::Conv(spec) => format!(
                    "[{}, {}, k{}, s{}, p{}]",
                    spec.in_c, spec.out_c, spec.k, spec.s, spec.p
                ),
                Self::Focus(spec) => {
                    format!("[{}, {}, k{}]", spec.in_c, spec.out_c, spec.k)
                }
                Self::Bottleneck(spec) => {
                    format!("[{}, {}, shortcut={}]", spec.in_c, spec.out_c, spec.shortcut)
                }
                Self::C3(spec) => format!(
                    "[{}, {}, n{}, shortcut={}]",
                    spec.in_c, spec.out_c, spec.depth, spec.shortcut
                ),
                Self::Spp(spec) => format!(
                    "[{}, {}, {:?}]",
                    spec.in_c, spec.out_c, spec.kernels
                ),
                Self::Sppf(spec) => {
                    format!("[{}, {}, k{}]", spec.in_c, spec.out_c, spec.k)
                }
                Self::Reorg(spec) => format!("[{}]", spec.in_c),
                Self::Contract(spec) => format!("[{}, gain={}]", spec.in_c, spec.gain),
                Self::Expand(spec) => format!("[{}, gain={}]", spec.in_c, spec.gain),
                Self::ConvNextStage(spec) => format!(
                    "[{}, {}, n{}, downsample={}]",
                    spec.in_c, spec.out_c, spec.depth, spec.downsample
                ),
                Self::Upsample(spec) => format!("[{}, x{}]", spec.in_c, spec.scale),
                Self::Concat(spec) => format!("{:?}", spec.in_channels),
                Self::Sum(spec) => format!("{:?}", spec.in_channels),
                Self::WeightedSum(spec) => format!("{:?}", spec.in_channels),
                Self::Detect(spec) => format!(
                    "[nc={}, anchors={}x{}, {:?}]",
                    spec.num_classes,
                    spec.num_scales(),
                    spec.num_anchors(),
                    spec.in_channels
                ),
            }
        }
    }
}
