//! Model assembly and the save-set routed execution engine.

use crate::common::*;
use crate::detect::{Detect, DetectionOutput};
use crate::module::{Module, ModuleInput, ModuleOutput};
use model_spec::{Graph, InputKey, InputKeys, ModelFile, NodeKey};

pub use model_::*;
pub use run_options_::*;

mod run_options_ {
    use super::*;

    /// Per-layer feature sink for external visualization. A failing sink is
    /// logged and never alters the forward results.
    pub trait FeatureSink {
        fn record(&self, layer_index: usize, kind_name: &str, output: &Tensor) -> Result<()>;
    }

    #[derive(Derivative, Default)]
    #[derivative(Debug)]
    pub struct RunOptions<'a> {
        /// Times each layer and reports a flop estimate.
        pub profile: bool,
        #[derivative(Debug = "ignore")]
        pub visualizer: Option<&'a dyn FeatureSink>,
    }
}

mod model_ {
    use super::*;

    const CALIBRATION_SIZE: i64 = 256;
    const PROFILE_ITERATIONS: usize = 10;

    #[derive(Debug)]
    pub(crate) struct Layer {
        pub(crate) key: NodeKey,
        pub(crate) input_keys: InputKeys,
        pub(crate) input_channels: Vec<usize>,
        pub(crate) kind_name: String,
        pub(crate) num_params: usize,
        /// Depth-scaled sequential replicas, usually a single entry.
        pub(crate) modules: Vec<Module>,
    }

    #[derive(Debug)]
    pub struct YoloModel {
        layers: Vec<Layer>,
        /// Layer indexes whose outputs later layers read, sorted ascending.
        save_indexes: Vec<usize>,
        input_channels: usize,
        num_classes: usize,
        device: Device,
        fused: bool,
    }

    impl YoloModel {
        /// Builds the assembly plan for `config` and instantiates it under
        /// `path`, then calibrates the detection head on a throwaway pass.
        pub fn new<'p, P>(path: P, config: &ModelFile) -> Result<Self>
        where
            P: Borrow<nn::Path<'p>>,
        {
            let path = path.borrow();
            let device = path.device();
            let graph = Graph::new(config)?;

            info!(
                "{:>4} {:>12} {:>6} {:>10}  {:<16} arguments",
                "", "from", "repeat", "params", "module"
            );
            let layers: Vec<Layer> = graph
                .nodes()
                .iter()
                .map(|(&key, node)| {
                    let layer_path = path / format!("layer_{}", key);
                    let modules: Vec<Module> = if node.repeat == 1 {
                        vec![Module::from_config(&node.config, &layer_path)]
                    } else {
                        (0..node.repeat)
                            .map(|replica| {
                                Module::from_config(&node.config, &layer_path / replica)
                            })
                            .collect()
                    };
                    let num_params: usize =
                        modules.iter().map(|module| module.num_params()).sum();
                    let kind_name = modules[0].as_ref().to_owned();

                    info!(
                        "{:>4} {:>12} {:>6} {:>10}  {:<16} {}",
                        key,
                        node.input_keys.to_string(),
                        node.repeat,
                        num_params,
                        kind_name,
                        node.config.describe()
                    );

                    Layer {
                        key,
                        input_keys: node.input_keys.clone(),
                        input_channels: node.config.input_channels(),
                        kind_name,
                        num_params,
                        modules,
                    }
                })
                .collect();

            ensure!(
                layers
                    .last()
                    .map(|layer| matches!(layer.modules.last(), Some(Module::Detect(_))))
                    .unwrap_or(false),
                "the final layer must be a detection head"
            );

            let save_indexes: Vec<usize> =
                graph.save_keys().iter().map(|key| key.0).collect();

            let mut model = Self {
                layers,
                save_indexes,
                input_channels: *graph.input_channels(),
                num_classes: *graph.num_classes(),
                device,
                fused: false,
            };
            model.calibrate()?;
            Ok(model)
        }

        /// Measures the per-scale strides on a zero input, rescales the
        /// anchors and seeds the detection priors.
        fn calibrate(&mut self) -> Result<()> {
            let xs = Tensor::zeros(
                &[
                    1,
                    self.input_channels as i64,
                    CALIBRATION_SIZE,
                    CALIBRATION_SIZE,
                ],
                (Kind::Float, self.device),
            );
            let output = tch::no_grad(|| self.forward_t(&xs, true))?;

            let strides: Vec<i64> = output
                .feature_maps
                .iter()
                .map(|xs| -> Result<_> {
                    let (_b, _anchors, feature_h, _w, _entries) = xs.size5()?;
                    ensure!(
                        feature_h > 0 && CALIBRATION_SIZE % feature_h == 0,
                        "the {} pixel calibration pass produced a {} row feature map",
                        CALIBRATION_SIZE,
                        feature_h
                    );
                    Ok(CALIBRATION_SIZE / feature_h)
                })
                .try_collect()?;
            info!("calibrated strides {:?}", strides);

            let detect = self.detect_mut()?;
            detect.set_strides(strides)?;
            detect.init_biases(None)
        }

        pub fn forward_t(&mut self, xs: &Tensor, train: bool) -> Result<DetectionOutput> {
            self.forward_with(xs, train, &RunOptions::default())
        }

        /// Walks the layer sequence, routing each layer's inputs from the
        /// previous output or the retained history slots.
        pub fn forward_with(
            &mut self,
            xs: &Tensor,
            train: bool,
            opts: &RunOptions<'_>,
        ) -> Result<DetectionOutput> {
            let Self {
                ref mut layers,
                ref save_indexes,
                ..
            } = *self;
            let num_layers = layers.len();

            let mut history: Vec<Option<Tensor>> = (0..num_layers).map(|_| None).collect();
            let mut prev = xs.shallow_clone();
            let mut detection = None;
            let mut profile_total = opts.profile.then(|| 0.0f64);

            for (position, layer) in layers.iter_mut().enumerate() {
                let Layer {
                    key,
                    ref input_keys,
                    ref input_channels,
                    ref kind_name,
                    num_params,
                    ref mut modules,
                } = *layer;

                let input: ModuleInput = match input_keys {
                    InputKeys::Single(InputKey::Prev) => ModuleInput::Single(&prev),
                    InputKeys::Single(InputKey::Node(node)) => {
                        ModuleInput::Single(retained(&history, *node, key)?)
                    }
                    InputKeys::Indexed(keys) => {
                        let tensors: Vec<&Tensor> = keys
                            .iter()
                            .map(|&input_key| match input_key {
                                InputKey::Prev => Ok(&prev),
                                InputKey::Node(node) => retained(&history, node, key),
                            })
                            .try_collect()?;
                        ModuleInput::Indexed(tensors)
                    }
                };

                if let (Some(tensor), Some(&expect)) =
                    (input.tensor(), input_channels.first())
                {
                    if let Ok((_b, channels, _h, _w)) = tensor.size4() {
                        ensure!(
                            channels == expect as i64,
                            "channel mismatch at layer {}: the plan expects {} input channels, found {}",
                            key,
                            expect,
                            channels
                        );
                    }
                }

                let output = run_modules(modules, &input, train)
                    .with_context(|| format!("failed to run layer {} ({})", key, kind_name))?;

                if let Some(total_ms) = profile_total.as_mut() {
                    if position == 0 {
                        info!(
                            "{:>10} {:>10} {:>10}  module",
                            "time (ms)", "GFLOPs", "params"
                        );
                    }
                    let gflops = estimate_gflops(num_params, &output, kind_name);
                    let start = Instant::now();
                    for _ in 0..PROFILE_ITERATIONS {
                        run_modules(modules, &input, train)?;
                    }
                    let elapsed_ms =
                        start.elapsed().as_secs_f64() * 1000.0 / PROFILE_ITERATIONS as f64;
                    info!(
                        "{:>10.2} {:>10.2} {:>10}  {}",
                        elapsed_ms, gflops, num_params, kind_name
                    );
                    *total_ms += elapsed_ms;
                }

                if let Some(sink) = opts.visualizer {
                    if let Some(tensor) = output.as_tensor() {
                        if let Err(err) = sink.record(key.0, kind_name, tensor) {
                            warn!("the feature sink failed at layer {}: {:#}", key, err);
                        }
                    }
                }

                match output {
                    ModuleOutput::Tensor(tensor) => {
                        if save_indexes.binary_search(&position).is_ok() {
                            history[position] = Some(tensor.shallow_clone());
                        }
                        prev = tensor;
                    }
                    ModuleOutput::Detect(output) => {
                        detection = Some(output);
                    }
                }
            }

            if let Some(total_ms) = profile_total {
                info!("{:>10.2} {:>10} {:>10}  total", total_ms, "-", "-");
            }

            detection.ok_or_else(|| format_err!("the model produced no detection output"))
        }

        /// Folds every batch norm into its preceding convolution. One-way;
        /// fusing twice is an error.
        pub fn fuse(mut self) -> Result<Self> {
            ensure!(!self.fused, "the model is already fused");
            let fused_count: usize = self
                .layers
                .iter_mut()
                .flat_map(|layer| layer.modules.iter_mut())
                .map(|module| module.fuse())
                .sum();
            self.fused = true;
            info!("fused {} normalization layers", fused_count);
            Ok(self)
        }

        /// Re-seeds the detection priors from dataset class frequencies.
        pub fn init_biases(&mut self, class_frequency: &[f64]) -> Result<()> {
            self.detect_mut()?.init_biases(Some(class_frequency))
        }

        fn detect_mut(&mut self) -> Result<&mut Detect> {
            self.layers
                .last_mut()
                .and_then(|layer| layer.modules.last_mut())
                .and_then(|module| module.as_detect_mut())
                .ok_or_else(|| format_err!("the final layer is not a detection head"))
        }

        pub fn strides(&self) -> Option<Vec<i64>> {
            let detect = self.layers.last()?.modules.last()?.as_detect()?;
            Some(detect.strides()?.to_vec())
        }

        pub fn num_classes(&self) -> usize {
            self.num_classes
        }

        pub fn num_layers(&self) -> usize {
            self.layers.len()
        }

        pub fn num_params(&self) -> usize {
            self.layers.iter().map(|layer| layer.num_params).sum()
        }

        pub fn save_indexes(&self) -> &[usize] {
            &self.save_indexes
        }

        pub fn is_fused(&self) -> bool {
            self.fused
        }
    }

    fn retained<'h>(
        history: &'h [Option<Tensor>],
        node: NodeKey,
        consumer: NodeKey,
    ) -> Result<&'h Tensor> {
        history
            .get(node.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| {
                format_err!(
                    "the output of layer {} was not retained for layer {}",
                    node,
                    consumer
                )
            })
    }

    fn run_modules(
        modules: &mut [Module],
        input: &ModuleInput<'_>,
        train: bool,
    ) -> Result<ModuleOutput> {
        let (first, rest) = modules
            .split_first_mut()
            .ok_or_else(|| format_err!("the layer holds no modules"))?;

        let mut output = first.forward_t(input.clone(), train)?;
        for module in rest {
            let tensor = output
                .tensor()
                .ok_or_else(|| format_err!("a repeated layer must produce a single tensor"))?;
            output = module.forward_t(&tensor, train)?;
        }
        Ok(output)
    }

    fn estimate_gflops(num_params: usize, output: &ModuleOutput, kind_name: &str) -> f64 {
        match output
            .as_tensor()
            .and_then(|tensor| tensor.size4().ok())
        {
            Some((_b, _c, height, width)) => {
                num_params as f64 * (height * width) as f64 * 2.0 / 1e9
            }
            None => {
                warn!("no flop estimate for a {} output, reporting zero", kind_name);
                0.0
            }
        }
    }
}
