//! The assembly plan builder.
//!
//! [Graph::new] walks the backbone and head rows of a [ModelFile] in order,
//! resolves every source reference, applies the compound scaling rules and
//! produces one fully-typed [Node] per layer together with the save set,
//! the keys whose outputs must be retained during execution because a later
//! layer reads them.

use crate::{
    common::*,
    config::{Anchors, ArgValue, LayerSpec, ModelFile, ModuleKind},
    module::{
        BottleneckSpec, C3Spec, ConcatSpec, ContractSpec, ConvNextStageSpec, ConvSpec, DetectSpec,
        ExpandSpec, FocusSpec, Module, ReorgSpec, SppSpec, SppfSpec, SumSpec, UpsampleSpec,
        WeightedSumSpec,
    },
    scaling,
};

pub use graph_::*;
pub use key_::*;
pub use node_::*;

mod key_ {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeKey(pub usize);

    impl Display for NodeKey {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            Display::fmt(&self.0, f)
        }
    }

    /// A resolved source. `Prev` is the immediately preceding output, the
    /// network input when at the first layer; it never enters the save set.
    #[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum InputKey {
        Prev,
        Node(NodeKey),
    }

    impl InputKey {
        pub fn node(&self) -> Option<NodeKey> {
            match *self {
                Self::Node(key) => Some(key),
                Self::Prev => None,
            }
        }
    }

    impl Display for InputKey {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                Self::Prev => write!(f, "-1"),
                Self::Node(key) => Display::fmt(key, f),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum InputKeys {
        Single(InputKey),
        Indexed(Vec<InputKey>),
    }

    impl InputKeys {
        pub fn iter(&self) -> impl Iterator<Item = InputKey> + '_ {
            let iter: Box<dyn Iterator<Item = InputKey> + '_> = match self {
                Self::Single(key) => Box::new(iter::once(*key)),
                Self::Indexed(keys) => Box::new(keys.iter().copied()),
            };
            iter
        }

        pub fn single(&self) -> Option<InputKey> {
            match *self {
                Self::Single(key) => Some(key),
                _ => None,
            }
        }

        pub fn indexed(&self) -> Option<&[InputKey]> {
            match self {
                Self::Indexed(keys) => Some(keys.as_slice()),
                _ => None,
            }
        }

        pub fn len(&self) -> usize {
            match self {
                Self::Single(_) => 1,
                Self::Indexed(keys) => keys.len(),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl Display for InputKeys {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                Self::Single(key) => Display::fmt(key, f),
                Self::Indexed(keys) => {
                    write!(f, "[{}]", keys.iter().map(|key| key.to_string()).join(", "))
                }
            }
        }
    }
}

mod node_ {
    use super::*;

    /// One built plan entry. `repeat` is the sequential replication count
    /// after depth scaling; kinds with an internal block count absorb it
    /// and keep `repeat` at 1.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Node {
        pub input_keys: InputKeys,
        pub repeat: usize,
        pub output_channels: usize,
        pub config: Module,
    }
}

mod graph_ {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, getset::Getters)]
    pub struct Graph {
        #[getset(get = "pub")]
        pub(crate) nodes: IndexMap<NodeKey, Node>,
        /// Keys retained during execution, sorted ascending.
        #[getset(get = "pub")]
        pub(crate) save_keys: Vec<NodeKey>,
        #[getset(get = "pub")]
        pub(crate) input_channels: usize,
        #[getset(get = "pub")]
        pub(crate) num_classes: usize,
    }

    impl Graph {
        pub fn new(config: &ModelFile) -> Result<Self> {
            let input_channels = config.input_channels;
            let num_layers = config.backbone.len() + config.head.len();
            let resolver = Resolver {
                depth_multiple: config.depth_multiple.raw(),
                width_multiple: config.width_multiple.raw(),
                num_outputs: config.num_detection_outputs(),
                num_classes: config.num_classes,
                anchors: &config.anchors,
            };

            let mut nodes: IndexMap<NodeKey, Node> = IndexMap::new();
            let mut saved: Vec<NodeKey> = vec![];
            // per-layer output channels; the seed entry stands for the
            // network input and is replaced by the first layer
            let mut channels: Vec<usize> = vec![input_channels];
            let mut prev_channels = input_channels;

            for (index, spec) in config.layers().enumerate() {
                let LayerSpec {
                    from,
                    repeat,
                    kind,
                    args,
                } = spec;

                let input_keys: Vec<InputKey> = from
                    .iter()
                    .map(|raw| {
                        let key = if raw == -1 {
                            InputKey::Prev
                        } else if raw < 0 {
                            let resolved = index as isize + raw;
                            ensure!(
                                resolved >= 0,
                                "the reference {} reaches before the network input",
                                raw
                            );
                            InputKey::Node(NodeKey(resolved as usize))
                        } else {
                            ensure!(
                                (raw as usize) < index,
                                "forward reference to layer {}",
                                raw
                            );
                            InputKey::Node(NodeKey(raw as usize))
                        };
                        Ok(key)
                    })
                    .try_collect()
                    .with_context(|| format!("failed to resolve the sources of layer {}", index))?;

                let in_channels: Vec<usize> = input_keys
                    .iter()
                    .map(|&key| match key {
                        InputKey::Prev => prev_channels,
                        InputKey::Node(key) => channels[key.0],
                    })
                    .collect();

                let (module, node_repeat) = resolver
                    .resolve(*kind, args, &in_channels, *repeat)
                    .with_context(|| format!("failed to build layer {} ({})", index, kind))?;
                let output_channels = module.output_channels();

                if matches!(module, Module::Detect(_)) {
                    ensure!(
                        index + 1 == num_layers,
                        "the detection head at layer {} must be the final layer",
                        index
                    );
                }
                if node_repeat > 1 {
                    ensure!(
                        in_channels.len() == 1 && in_channels[0] == output_channels,
                        "layer {}: a repeated layer must preserve its channel count, found {} -> {}",
                        index,
                        in_channels[0],
                        output_channels
                    );
                }

                saved.extend(input_keys.iter().filter_map(|key| key.node()));
                let input_keys = if from.single().is_some() {
                    InputKeys::Single(input_keys[0])
                } else {
                    InputKeys::Indexed(input_keys)
                };

                nodes.insert(
                    NodeKey(index),
                    Node {
                        input_keys,
                        repeat: node_repeat,
                        output_channels,
                        config: module,
                    },
                );

                if index == 0 {
                    channels.clear();
                }
                channels.push(output_channels);
                prev_channels = output_channels;
            }

            let save_keys: Vec<NodeKey> = saved.into_iter().sorted().dedup().collect();

            Ok(Self {
                nodes,
                save_keys,
                input_channels,
                num_classes: config.num_classes,
            })
        }

        pub fn num_layers(&self) -> usize {
            self.nodes.len()
        }

        /// The terminal detection-head config, when the plan ends in one.
        pub fn detect_spec(&self) -> Option<&DetectSpec> {
            self.nodes.values().last()?.config.as_detect()
        }
    }

    struct Resolver<'a> {
        depth_multiple: f64,
        width_multiple: f64,
        num_outputs: usize,
        num_classes: usize,
        anchors: &'a Anchors,
    }

    impl Resolver<'_> {
        /// Width-scale a declared channel count. A value equal to the
        /// detection output width passes through unscaled so the head keeps
        /// its exact anchor/class layout.
        fn scale_channels(&self, declared: usize) -> usize {
            if declared == self.num_outputs {
                declared
            } else {
                scaling::scale_channels(declared, self.width_multiple)
            }
        }

        fn resolve(
            &self,
            kind: ModuleKind,
            args: &[ArgValue],
            in_channels: &[usize],
            repeat: usize,
        ) -> Result<(Module, usize)> {
            let scaled_repeat = scaling::scale_repeat(repeat, self.depth_multiple);

            let built = match kind {
                ModuleKind::Conv => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        (1..=4).contains(&args.len()),
                        "Conv takes [out_c, k, s, p], found {} arguments",
                        args.len()
                    );
                    let out_c = self.scale_channels(args[0].as_usize()?);
                    let k = opt_usize(args, 1)?.unwrap_or(1);
                    let s = opt_usize(args, 2)?.unwrap_or(1);
                    let p = opt_usize(args, 3)?.unwrap_or(k / 2);
                    ensure!(k >= 1 && s >= 1, "kernel and stride must be positive");
                    (Module::Conv(ConvSpec { in_c, out_c, k, s, p }), scaled_repeat)
                }
                ModuleKind::Focus => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        (1..=2).contains(&args.len()),
                        "Focus takes [out_c, k], found {} arguments",
                        args.len()
                    );
                    let out_c = self.scale_channels(args[0].as_usize()?);
                    let k = opt_usize(args, 1)?.unwrap_or(1);
                    ensure!(k >= 1, "the kernel size must be positive");
                    (Module::Focus(FocusSpec { in_c, out_c, k }), scaled_repeat)
                }
                ModuleKind::Bottleneck => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        (1..=2).contains(&args.len()),
                        "Bottleneck takes [out_c, shortcut], found {} arguments",
                        args.len()
                    );
                    let out_c = self.scale_channels(args[0].as_usize()?);
                    let shortcut = opt_bool(args, 1)?.unwrap_or(true);
                    (
                        Module::Bottleneck(BottleneckSpec {
                            in_c,
                            out_c,
                            shortcut,
                        }),
                        scaled_repeat,
                    )
                }
                ModuleKind::C3 => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        (1..=2).contains(&args.len()),
                        "C3 takes [out_c, shortcut], found {} arguments",
                        args.len()
                    );
                    let out_c = self.scale_channels(args[0].as_usize()?);
                    let shortcut = opt_bool(args, 1)?.unwrap_or(true);
                    // the repeat count becomes the internal bottleneck depth
                    (
                        Module::C3(C3Spec {
                            in_c,
                            out_c,
                            depth: scaled_repeat,
                            shortcut,
                        }),
                        1,
                    )
                }
                ModuleKind::Spp => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        (1..=2).contains(&args.len()),
                        "Spp takes [out_c, kernels], found {} arguments",
                        args.len()
                    );
                    let out_c = self.scale_channels(args[0].as_usize()?);
                    let kernels = match args.get(1) {
                        Some(arg) => arg
                            .as_list()?
                            .iter()
                            .map(|kernel| kernel.as_usize())
                            .try_collect()?,
                        None => vec![5, 9, 13],
                    };
                    ensure!(!kernels.is_empty(), "the kernel list must not be empty");
                    ensure!(
                        kernels.iter().all(|&k| k % 2 == 1),
                        "pooling kernels must be odd"
                    );
                    (
                        Module::Spp(SppSpec {
                            in_c,
                            out_c,
                            kernels,
                        }),
                        scaled_repeat,
                    )
                }
                ModuleKind::Sppf => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        (1..=2).contains(&args.len()),
                        "Sppf takes [out_c, k], found {} arguments",
                        args.len()
                    );
                    let out_c = self.scale_channels(args[0].as_usize()?);
                    let k = opt_usize(args, 1)?.unwrap_or(5);
                    ensure!(k % 2 == 1, "the pooling kernel must be odd");
                    (Module::Sppf(SppfSpec { in_c, out_c, k }), scaled_repeat)
                }
                ModuleKind::Reorg => {
                    let in_c = single_source(in_channels)?;
                    ensure!(args.is_empty(), "Reorg takes no arguments");
                    (Module::Reorg(ReorgSpec { in_c }), scaled_repeat)
                }
                ModuleKind::Contract => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        args.len() <= 1,
                        "Contract takes [gain], found {} arguments",
                        args.len()
                    );
                    let gain = opt_usize(args, 0)?.unwrap_or(2);
                    ensure!(gain >= 1, "the gain must be positive");
                    (Module::Contract(ContractSpec { in_c, gain }), scaled_repeat)
                }
                ModuleKind::Expand => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        args.len() <= 1,
                        "Expand takes [gain], found {} arguments",
                        args.len()
                    );
                    let gain = opt_usize(args, 0)?.unwrap_or(2);
                    ensure!(gain >= 1, "the gain must be positive");
                    ensure!(
                        in_c % (gain * gain) == 0,
                        "the input channel count {} is not divisible by {}",
                        in_c,
                        gain * gain
                    );
                    (Module::Expand(ExpandSpec { in_c, gain }), scaled_repeat)
                }
                ModuleKind::ConvNextStage => {
                    let in_c = single_source(in_channels)?;
                    ensure!(
                        (1..=2).contains(&args.len()),
                        "ConvNextStage takes [out_c, downsample], found {} arguments",
                        args.len()
                    );
                    // opaque pretrained stage, channels taken as declared
                    let out_c = args[0].as_usize()?;
                    let downsample = opt_bool(args, 1)?.unwrap_or(true);
                    ensure!(
                        downsample || in_c == out_c,
                        "a stage without downsampling cannot change {} channels to {}",
                        in_c,
                        out_c
                    );
                    (
                        Module::ConvNextStage(ConvNextStageSpec {
                            in_c,
                            out_c,
                            depth: scaled_repeat,
                            downsample,
                        }),
                        1,
                    )
                }
                ModuleKind::Upsample => {
                    let in_c = single_source(in_channels)?;
                    let scale_arg = match args.len() {
                        1 => &args[0],
                        2 | 3 => {
                            ensure!(
                                args[0].is_null(),
                                "fixed target sizes are not supported, the size argument must be null"
                            );
                            if let Some(mode) = args.get(2) {
                                ensure!(
                                    mode.as_str()? == "nearest",
                                    "only nearest upsampling is supported, found {}",
                                    mode
                                );
                            }
                            &args[1]
                        }
                        len => bail!(
                            "Upsample takes [scale] or [null, scale, mode], found {} arguments",
                            len
                        ),
                    };
                    let scale = scale_arg.as_f64()?;
                    ensure!(scale > 0.0, "the scale factor must be positive");
                    (
                        Module::Upsample(UpsampleSpec {
                            in_c,
                            scale: r64(scale),
                        }),
                        scaled_repeat,
                    )
                }
                ModuleKind::Concat => {
                    ensure!(
                        in_channels.len() >= 2,
                        "Concat requires at least two sources, found {}",
                        in_channels.len()
                    );
                    if let Some(arg) = args.first() {
                        ensure!(
                            args.len() == 1 && arg.as_i64()? == 1,
                            "only channel-dimension concatenation is supported"
                        );
                    }
                    (
                        Module::Concat(ConcatSpec {
                            in_channels: in_channels.to_vec(),
                        }),
                        scaled_repeat,
                    )
                }
                ModuleKind::Sum => {
                    ensure!(args.is_empty(), "Sum takes no arguments");
                    ensure!(
                        in_channels.len() == 2 && in_channels[0] == in_channels[1],
                        "Sum requires exactly two equal-channel sources, found {:?}",
                        in_channels
                    );
                    (
                        Module::Sum(SumSpec {
                            in_channels: in_channels.to_vec(),
                        }),
                        scaled_repeat,
                    )
                }
                ModuleKind::WeightedSum => {
                    ensure!(args.is_empty(), "WeightedSum takes no arguments");
                    ensure!(
                        in_channels.len() >= 2,
                        "WeightedSum requires at least two sources, found {}",
                        in_channels.len()
                    );
                    ensure!(
                        in_channels.iter().all(|&c| c == in_channels[0]),
                        "WeightedSum requires equal-channel sources, found {:?}",
                        in_channels
                    );
                    (
                        Module::WeightedSum(WeightedSumSpec {
                            in_channels: in_channels.to_vec(),
                        }),
                        scaled_repeat,
                    )
                }
                ModuleKind::Detect => {
                    ensure!(
                        args.is_empty(),
                        "the class count and anchors are taken from the document header"
                    );
                    ensure!(repeat == 1, "the detection head cannot be repeated");
                    ensure!(
                        !in_channels.is_empty(),
                        "the detection head requires at least one source"
                    );
                    if let Some(num_scales) = self.anchors.num_scales() {
                        ensure!(
                            num_scales == in_channels.len(),
                            "the anchor table declares {} scales but the head consumes {} feature maps",
                            num_scales,
                            in_channels.len()
                        );
                    }
                    (
                        Module::Detect(DetectSpec {
                            num_classes: self.num_classes,
                            anchors: self.anchors.to_pairs(in_channels.len()),
                            in_channels: in_channels.to_vec(),
                        }),
                        1,
                    )
                }
            };

            Ok(built)
        }
    }

    fn single_source(in_channels: &[usize]) -> Result<usize> {
        match *in_channels {
            [channels] => Ok(channels),
            ref list => bail!("expected a single source, found {}", list.len()),
        }
    }

    fn opt_usize(args: &[ArgValue], position: usize) -> Result<Option<usize>> {
        match args.get(position) {
            None => Ok(None),
            Some(arg) if arg.is_null() => Ok(None),
            Some(arg) => {
                let value = arg
                    .as_usize()
                    .with_context(|| format!("in argument {}", position))?;
                Ok(Some(value))
            }
        }
    }

    fn opt_bool(args: &[ArgValue], position: usize) -> Result<Option<bool>> {
        match args.get(position) {
            None => Ok(None),
            Some(arg) if arg.is_null() => Ok(None),
            Some(arg) => {
                let value = arg
                    .as_bool()
                    .with_context(|| format!("in argument {}", position))?;
                Ok(Some(value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ModelFile {
        json5::from_str(text).unwrap()
    }

    #[test]
    fn trace_and_save_set() -> Result<()> {
        let config = parse(
            r#"{
                num_classes: 2,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 2,
                backbone: [
                    [-1, 1, "Conv", [16, 3, 2]],
                    [-1, 1, "Conv", [32, 3, 2]],
                    [-1, 1, "Conv", [32, 3, 1]],
                ],
                head: [
                    [[-1, 1], 1, "Concat", [1]],
                    [-1, 1, "Conv", [16, 1, 1]],
                    [[4], 1, "Detect", []],
                ],
            }"#,
        );
        let graph = Graph::new(&config)?;

        assert_eq!(graph.num_layers(), 6);
        assert_eq!(graph.save_keys(), &vec![NodeKey(1), NodeKey(4)]);

        let channels: Vec<_> = graph
            .nodes()
            .values()
            .map(|node| node.output_channels)
            .collect();
        assert_eq!(channels, vec![16, 32, 32, 64, 16, 14]);

        let detect = graph.detect_spec().unwrap();
        assert_eq!(detect.in_channels, vec![16]);
        assert_eq!(detect.num_outputs(), 2 * (2 + 5));
        // a bare anchor count expands to synthetic index pairs
        assert_eq!(detect.anchors[0][1], (r64(2.0), r64(3.0)));

        let concat = &graph.nodes()[&NodeKey(3)];
        assert_eq!(
            concat.input_keys,
            InputKeys::Indexed(vec![InputKey::Prev, InputKey::Node(NodeKey(1))])
        );
        Ok(())
    }

    #[test]
    fn builds_are_deterministic() -> Result<()> {
        let config = parse(
            r#"{
                num_classes: 4,
                depth_multiple: 0.33,
                width_multiple: 0.5,
                anchors: [[10, 13, 16, 30, 33, 23]],
                backbone: [
                    [-1, 1, "Conv", [64, 6, 2, 2]],
                    [-1, 6, "C3", [64]],
                ],
                head: [[[-1], 1, "Detect", []]],
            }"#,
        );
        assert_eq!(Graph::new(&config)?, Graph::new(&config)?);
        Ok(())
    }

    #[test]
    fn forward_references_are_rejected() {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [16, 3, 1]],
                    [2, 1, "Conv", [16, 3, 1]],
                    [-1, 1, "Conv", [16, 3, 1]],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let error = Graph::new(&config).unwrap_err();
        assert!(format!("{:#}", error).contains("forward reference"));
    }

    #[test]
    fn references_before_the_input_are_rejected() {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [[-2, 1, "Conv", [16, 3, 1]]],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let error = Graph::new(&config).unwrap_err();
        assert!(format!("{:#}", error).contains("before the network input"));
    }

    #[test]
    fn expand_requires_divisible_channels() {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [24, 3, 1]],
                    [-1, 1, "Expand", [4]],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let error = Graph::new(&config).unwrap_err();
        assert!(format!("{:#}", error).contains("not divisible"));
    }

    #[test]
    fn shape_transform_arithmetic() -> Result<()> {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [16, 3, 1]],
                    [-1, 1, "Reorg", []],
                    [-1, 1, "Contract", [2]],
                    [-1, 1, "Expand", [4]],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let graph = Graph::new(&config)?;
        let channels: Vec<_> = graph
            .nodes()
            .values()
            .map(|node| node.output_channels)
            .collect();
        assert_eq!(channels, vec![16, 64, 256, 16, 6]);
        Ok(())
    }

    #[test]
    fn detect_must_be_terminal() {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [16, 3, 1]],
                    [-1, 1, "Detect", []],
                ],
                head: [[-1, 1, "Conv", [16, 3, 1]]],
            }"#,
        );
        let error = Graph::new(&config).unwrap_err();
        assert!(format!("{:#}", error).contains("final layer"));
    }

    #[test]
    fn sum_arity_and_channels_are_checked() {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [16, 3, 1]],
                    [-1, 1, "Conv", [32, 3, 1]],
                    [[0, 1], 1, "Sum", []],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let error = Graph::new(&config).unwrap_err();
        assert!(format!("{:#}", error).contains("equal-channel"));
    }

    #[test]
    fn weighted_sum_takes_the_maximum_channel_count() -> Result<()> {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [16, 3, 1]],
                    [-1, 1, "Conv", [16, 3, 1]],
                    [[0, 1], 1, "WeightedSum", []],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let graph = Graph::new(&config)?;
        assert_eq!(graph.nodes()[&NodeKey(2)].output_channels, 16);
        Ok(())
    }

    #[test]
    fn repeated_layers_must_preserve_channels() {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [[-1, 2, "Conv", [32, 3, 1]]],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let error = Graph::new(&config).unwrap_err();
        assert!(format!("{:#}", error).contains("preserve its channel count"));
    }

    #[test]
    fn c3_absorbs_the_scaled_repeat() -> Result<()> {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 0.33,
                width_multiple: 1.0,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [64, 3, 1]],
                    [-1, 6, "C3", [64]],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let graph = Graph::new(&config)?;
        let node = &graph.nodes()[&NodeKey(1)];
        assert_eq!(node.repeat, 1);
        assert_eq!(
            node.config,
            Module::C3(C3Spec {
                in_c: 64,
                out_c: 64,
                depth: 2,
                shortcut: true,
            })
        );
        Ok(())
    }

    #[test]
    fn detection_width_is_exempt_from_scaling() -> Result<()> {
        let config = parse(
            r#"{
                num_classes: 80,
                depth_multiple: 1.0,
                width_multiple: 0.5,
                anchors: 3,
                backbone: [
                    [-1, 1, "Conv", [64, 3, 1]],
                    [-1, 1, "Conv", [255, 1, 1]],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let graph = Graph::new(&config)?;
        let channels: Vec<_> = graph
            .nodes()
            .values()
            .map(|node| node.output_channels)
            .collect();
        assert_eq!(channels, vec![32, 255, 255]);
        Ok(())
    }

    #[test]
    fn pass_through_stages_keep_declared_channels() -> Result<()> {
        let config = parse(
            r#"{
                num_classes: 1,
                depth_multiple: 1.0,
                width_multiple: 0.5,
                anchors: 1,
                backbone: [
                    [-1, 1, "Conv", [96, 3, 2]],
                    [-1, 3, "ConvNextStage", [192]],
                ],
                head: [[-1, 1, "Detect", []]],
            }"#,
        );
        let graph = Graph::new(&config)?;
        let node = &graph.nodes()[&NodeKey(1)];
        assert_eq!(node.output_channels, 192);
        assert_eq!(
            node.config,
            Module::ConvNextStage(ConvNextStageSpec {
                in_c: 48,
                out_c: 192,
                depth: 3,
                downsample: true,
            })
        );
        Ok(())
    }
}
