//! Backbone trunks and the feature-extractor capability.
//!
//! A [`BackboneNet`] mirrors the top-level module layout of a classification
//! network (`features`/`classifier` for the plain families, flat children for
//! resnet). [`BackboneNet::into_features`] applies the hardcoded per-family
//! rule that keeps only the feature-producing part.

use std::fmt;

use ndarray::{s, Array1, Array2, Array4, ArrayView2, Axis};
use tracing::debug;

use crate::linear::Linear;
use crate::state::{join, to_dyn, StateDict, Stateful};
use crate::tensor::{positions_to_rows, rows_to_positions, Mode};
use crate::LayerError;

const BN_EPS: f32 = 1e-5;
const NUM_CLASSES: usize = 1000;

/// Anything that maps an image batch `(B, 3, H, W)` to a feature map.
pub trait FeatureExtractor: Stateful + Send + Sync + fmt::Debug {
    fn forward(&self, x: &Array4<f32>, mode: Mode) -> Result<Array4<f32>, LayerError>;

    /// Channel count of the produced feature map, when it can be inferred.
    fn out_channels(&self) -> Option<usize>;

    fn describe(&self) -> String;
}

/// Pointwise (1x1) convolution. Stored as `[out, in, 1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Conv {
    /// Kaiming-uniform weights (`bound = sqrt(6 / fan_in)`), zero bias.
    pub fn kaiming(in_ch: usize, out_ch: usize, bias: bool, rng: &mut fastrand::Rng) -> Self {
        let bound = (6.0 / in_ch as f32).sqrt();
        let weight = Array2::from_shape_simple_fn((out_ch, in_ch), || (rng.f32() * 2.0 - 1.0) * bound);
        Self {
            weight,
            bias: bias.then(|| Array1::zeros(out_ch)),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, LayerError> {
        let (b, c, h, w) = x.dim();
        if c != self.in_channels() {
            return Err(LayerError::ChannelMismatch {
                layer: "conv".into(),
                expected: self.in_channels(),
                actual: c,
            });
        }
        let out_ch = self.out_channels();
        let mut out = Array4::zeros((b, out_ch, h, w));
        for bi in 0..b {
            let plane = x.index_axis(Axis(0), bi);
            let mat = plane.to_shape((c, h * w))?;
            let mut y = self.weight.dot(&mat);
            if let Some(bias) = &self.bias {
                y += &bias.view().insert_axis(Axis(1));
            }
            out.index_axis_mut(Axis(0), bi)
                .assign(&y.into_shape_with_order((out_ch, h, w))?);
        }
        Ok(out)
    }
}

/// Batch normalization over channels.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
}

impl BatchNorm {
    pub fn new(channels: usize) -> Self {
        Self {
            weight: Array1::ones(channels),
            bias: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
        }
    }

    pub fn channels(&self) -> usize {
        self.weight.len()
    }

    /// Test mode uses the running statistics; train mode normalizes with the
    /// statistics of the current batch and leaves the running ones untouched.
    pub fn forward(&self, x: &Array4<f32>, mode: Mode) -> Result<Array4<f32>, LayerError> {
        let c = x.dim().1;
        if c != self.channels() {
            return Err(LayerError::ChannelMismatch {
                layer: "batchnorm".into(),
                expected: self.channels(),
                actual: c,
            });
        }
        let mut out = x.clone();
        for (ci, mut channel) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (mean, var) = if mode.is_train() {
                let n = channel.len() as f32;
                let mean = channel.sum() / n;
                let var = channel.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
                (mean, var)
            } else {
                (self.running_mean[ci], self.running_var[ci])
            };
            let scale = self.weight[ci] / (var + BN_EPS).sqrt();
            let shift = self.bias[ci] - mean * scale;
            channel.mapv_inplace(|v| v * scale + shift);
        }
        Ok(out)
    }
}

impl Stateful for Conv {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        let (out, inp) = self.weight.dim();
        self.weight = dict.param2(&join(prefix, "weight"), out, inp, &[out, inp, 1, 1])?;
        if let Some(bias) = &mut self.bias {
            *bias = dict.param1(&join(prefix, "bias"), out)?;
        }
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        let (o, i) = self.weight.dim();
        out.insert(join(prefix, "weight"), to_dyn(self.weight.iter(), &[o, i, 1, 1]));
        if let Some(bias) = &self.bias {
            out.insert(join(prefix, "bias"), to_dyn(bias.iter(), &[o]));
        }
    }
}

impl Stateful for BatchNorm {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        let c = self.channels();
        self.weight = dict.param1(&join(prefix, "weight"), c)?;
        self.bias = dict.param1(&join(prefix, "bias"), c)?;
        self.running_mean = dict.param1(&join(prefix, "running_mean"), c)?;
        self.running_var = dict.param1(&join(prefix, "running_var"), c)?;
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        let c = self.channels();
        out.insert(join(prefix, "weight"), to_dyn(self.weight.iter(), &[c]));
        out.insert(join(prefix, "bias"), to_dyn(self.bias.iter(), &[c]));
        out.insert(join(prefix, "running_mean"), to_dyn(self.running_mean.iter(), &[c]));
        out.insert(join(prefix, "running_var"), to_dyn(self.running_var.iter(), &[c]));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Conv(Conv),
    BatchNorm(BatchNorm),
    Relu,
    MaxPool { kernel: usize, stride: usize },
    AvgPool { kernel: usize, stride: usize },
    AdaptiveAvgPool(usize),
    /// Identity: the crate never trains.
    Dropout,
    /// Classifier head, applied per spatial position.
    Linear(Linear),
    Block(Sequential),
}

impl Layer {
    pub fn forward(&self, x: &Array4<f32>, mode: Mode) -> Result<Array4<f32>, LayerError> {
        match self {
            Layer::Conv(conv) => conv.forward(x),
            Layer::BatchNorm(bn) => bn.forward(x, mode),
            Layer::Relu => Ok(x.mapv(|v| v.max(0.0))),
            Layer::MaxPool { kernel, stride } => Ok(pool_windows(x, *kernel, *stride, |w| {
                w.fold(f32::NEG_INFINITY, |m, &v| m.max(v))
            })),
            Layer::AvgPool { kernel, stride } => {
                Ok(pool_windows(x, *kernel, *stride, |w| w.mean().unwrap_or(0.0)))
            }
            Layer::AdaptiveAvgPool(size) => Ok(adaptive_avg_pool(x, *size)),
            Layer::Dropout => Ok(x.clone()),
            Layer::Linear(linear) => {
                let (b, _, h, w) = x.dim();
                let rows = linear.forward(positions_to_rows(x).view())?;
                rows_to_positions(rows, b, h, w)
            }
            Layer::Block(seq) => seq.forward(x, mode),
        }
    }

    fn out_channels(&self) -> Option<usize> {
        match self {
            Layer::Conv(conv) => Some(conv.out_channels()),
            Layer::BatchNorm(bn) => Some(bn.channels()),
            Layer::Linear(linear) => Some(linear.out_features()),
            Layer::Block(seq) => seq.out_channels(),
            _ => None,
        }
    }
}

impl Stateful for Layer {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        match self {
            Layer::Conv(conv) => conv.load_state(dict, prefix)?,
            Layer::BatchNorm(bn) => bn.load_state(dict, prefix)?,
            Layer::Linear(linear) => linear.load_state(dict, prefix)?,
            Layer::Block(seq) => seq.load_state(dict, prefix)?,
            _ => {}
        }
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        match self {
            Layer::Conv(conv) => conv.export_state(prefix, out),
            Layer::BatchNorm(bn) => bn.export_state(prefix, out),
            Layer::Linear(linear) => linear.export_state(prefix, out),
            Layer::Block(seq) => seq.export_state(prefix, out),
            _ => {}
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Conv(conv) => write!(
                f,
                "Conv2d({}, {}, kernel_size=(1, 1), bias={})",
                conv.in_channels(),
                conv.out_channels(),
                conv.bias.is_some()
            ),
            Layer::BatchNorm(bn) => write!(f, "BatchNorm2d({}, eps={BN_EPS})", bn.channels()),
            Layer::Relu => f.write_str("ReLU()"),
            Layer::MaxPool { kernel, stride } => {
                write!(f, "MaxPool2d(kernel_size={kernel}, stride={stride})")
            }
            Layer::AvgPool { kernel, stride } => {
                write!(f, "AvgPool2d(kernel_size={kernel}, stride={stride})")
            }
            Layer::AdaptiveAvgPool(size) => {
                write!(f, "AdaptiveAvgPool2d(output_size=({size}, {size}))")
            }
            Layer::Dropout => f.write_str("Dropout()"),
            Layer::Linear(linear) => write!(
                f,
                "Linear(in_features={}, out_features={})",
                linear.in_features(),
                linear.out_features()
            ),
            Layer::Block(seq) => seq.write_indented(f, 0),
        }
    }
}

/// Ordered, named children applied in sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sequential {
    children: Vec<(String, Layer)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Children named `0..n`.
    pub fn indexed(layers: impl IntoIterator<Item = Layer>) -> Self {
        Self {
            children: layers
                .into_iter()
                .enumerate()
                .map(|(i, layer)| (i.to_string(), layer))
                .collect(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, layer: Layer) {
        self.children.push((name.into(), layer));
    }

    pub fn with(mut self, name: impl Into<String>, layer: Layer) -> Self {
        self.push(name, layer);
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.children.iter().map(|(name, layer)| (name.as_str(), layer))
    }

    pub fn into_layers(self) -> Vec<Layer> {
        self.children.into_iter().map(|(_, layer)| layer).collect()
    }

    fn take(&mut self, name: &str) -> Option<Layer> {
        let idx = self.children.iter().position(|(n, _)| n == name)?;
        Some(self.children.remove(idx).1)
    }

    pub fn forward(&self, x: &Array4<f32>, mode: Mode) -> Result<Array4<f32>, LayerError> {
        let mut out = x.clone();
        for (_, layer) in &self.children {
            out = layer.forward(&out, mode)?;
        }
        Ok(out)
    }

    /// Runs a single child by position.
    pub fn forward_child(
        &self,
        index: usize,
        x: &Array4<f32>,
        mode: Mode,
    ) -> Result<Array4<f32>, LayerError> {
        match self.children.get(index) {
            Some((_, layer)) => layer.forward(x, mode),
            None => Ok(x.clone()),
        }
    }

    /// Channels produced by the last layer that changes or fixes them.
    pub fn out_channels(&self) -> Option<usize> {
        self.children.iter().rev().find_map(|(_, layer)| layer.out_channels())
    }

    /// Channels produced after the child at `index` has run.
    pub fn channels_after(&self, index: usize) -> Option<usize> {
        self.children
            .iter()
            .take(index + 1)
            .rev()
            .find_map(|(_, layer)| layer.out_channels())
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth + 1);
        writeln!(f, "Sequential(")?;
        for (name, layer) in &self.children {
            write!(f, "{pad}({name}): ")?;
            match layer {
                Layer::Block(seq) => seq.write_indented(f, depth + 1)?,
                other => write!(f, "{other}")?,
            }
            writeln!(f)?;
        }
        write!(f, "{})", "  ".repeat(depth))
    }
}

impl fmt::Display for Sequential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl Stateful for Sequential {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        for (name, layer) in &mut self.children {
            layer.load_state(dict, &join(prefix, name))?;
        }
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        for (name, layer) in &self.children {
            layer.export_state(&join(prefix, name), out);
        }
    }
}

impl FeatureExtractor for Sequential {
    fn forward(&self, x: &Array4<f32>, mode: Mode) -> Result<Array4<f32>, LayerError> {
        Sequential::forward(self, x, mode)
    }

    fn out_channels(&self) -> Option<usize> {
        Sequential::out_channels(self)
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

/// Backbone families, each with its own head-stripping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchitectureFamily {
    AlexNet,
    Vgg,
    ResNet,
    DenseNet,
    SqueezeNet,
}

impl ArchitectureFamily {
    pub fn from_architecture(architecture: &str) -> Result<Self, LayerError> {
        const PREFIXES: [(&str, ArchitectureFamily); 5] = [
            ("alexnet", ArchitectureFamily::AlexNet),
            ("vgg", ArchitectureFamily::Vgg),
            ("resnet", ArchitectureFamily::ResNet),
            ("densenet", ArchitectureFamily::DenseNet),
            ("squeezenet", ArchitectureFamily::SqueezeNet),
        ];
        PREFIXES
            .iter()
            .find(|(prefix, _)| architecture.starts_with(prefix))
            .map(|(_, family)| *family)
            .ok_or_else(|| LayerError::UnknownArchitecture(architecture.to_string()))
    }
}

/// A complete classification network before its head is removed.
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneNet {
    pub architecture: String,
    pub family: ArchitectureFamily,
    pub modules: Sequential,
}

impl BackboneNet {
    /// Keeps the convolutional trunk:
    ///
    /// * alexnet, vgg: `features` without its final max-pool
    /// * resnet: every top-level child except `avgpool` and `fc`
    /// * densenet: `features` followed by a ReLU
    /// * squeezenet: `features`
    ///
    /// Children are renumbered `0..n`.
    pub fn into_features(mut self) -> Result<Sequential, LayerError> {
        let layers = match self.family {
            ArchitectureFamily::AlexNet | ArchitectureFamily::Vgg => {
                let mut layers = self.take_features()?;
                layers.pop();
                layers
            }
            ArchitectureFamily::ResNet => {
                let mut layers = self.modules.into_layers();
                let keep = layers.len().saturating_sub(2);
                layers.truncate(keep);
                layers
            }
            ArchitectureFamily::DenseNet => {
                let mut layers = self.take_features()?;
                layers.push(Layer::Relu);
                layers
            }
            ArchitectureFamily::SqueezeNet => self.take_features()?,
        };
        Ok(Sequential::indexed(layers))
    }

    fn take_features(&mut self) -> Result<Vec<Layer>, LayerError> {
        match self.modules.take("features") {
            Some(Layer::Block(seq)) => Ok(seq.into_layers()),
            _ => Err(LayerError::UnknownArchitecture(format!(
                "{} has no `features` module",
                self.architecture
            ))),
        }
    }
}

impl Stateful for BackboneNet {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        self.modules.load_state(dict, prefix)
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        self.modules.export_state(prefix, out)
    }
}

/// Source of backbone networks, with or without general-purpose weights.
pub trait BackboneProvider: Send + Sync {
    /// Builds `architecture` with a trunk producing `width` channels.
    fn build(
        &self,
        architecture: &str,
        width: usize,
        pretrained: bool,
    ) -> Result<BackboneNet, LayerError>;

    /// Whether the built trunks share the parameter layout of the published
    /// feature weights, so that a registered features artifact can be loaded
    /// into them.
    fn accepts_published_features(&self) -> bool {
        true
    }
}

/// Built-in trunks with the stage layout and output width of each supported
/// architecture and pointwise convolutions in place of spatial kernels.
///
/// "Pretrained" trunks are seeded from a hash of the architecture name, so
/// every run sees the same weights; untrained trunks use `seed` when set and
/// fresh entropy otherwise.
#[derive(Debug, Clone, Default)]
pub struct ReferenceBackbones {
    pub seed: Option<u64>,
}

impl ReferenceBackbones {
    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

impl BackboneProvider for ReferenceBackbones {
    fn build(
        &self,
        architecture: &str,
        width: usize,
        pretrained: bool,
    ) -> Result<BackboneNet, LayerError> {
        let family = ArchitectureFamily::from_architecture(architecture)?;
        let mut rng = match (pretrained, self.seed) {
            (true, _) => fastrand::Rng::with_seed(fxhash::hash64(architecture.as_bytes())),
            (false, Some(seed)) => fastrand::Rng::with_seed(seed),
            (false, None) => fastrand::Rng::new(),
        };
        debug!(architecture, pretrained, width, "building reference backbone");

        let modules = match family {
            ArchitectureFamily::AlexNet => plain_net(&[64, 192, 384, width], &mut rng, width),
            ArchitectureFamily::Vgg => plain_net(&[64, 128, 256, 512, width], &mut rng, width),
            ArchitectureFamily::ResNet => {
                resnet(&[width / 8, width / 4, width / 2, width], &mut rng)
            }
            ArchitectureFamily::DenseNet => densenet(width, &mut rng),
            ArchitectureFamily::SqueezeNet => {
                let stem = if architecture == "squeezenet1_1" { 64 } else { 96 };
                squeezenet(stem, width, &mut rng)
            }
        };
        Ok(BackboneNet {
            architecture: architecture.to_string(),
            family,
            modules,
        })
    }

    /// Pointwise kernels never match the published spatial ones.
    fn accepts_published_features(&self) -> bool {
        false
    }
}

fn conv(in_ch: usize, out_ch: usize, bias: bool, rng: &mut fastrand::Rng) -> Layer {
    Layer::Conv(Conv::kaiming(in_ch, out_ch, bias, rng))
}

fn classifier(in_features: usize, rng: &mut fastrand::Rng) -> Layer {
    Layer::Linear(Linear::random(in_features, NUM_CLASSES, rng))
}

/// alexnet/vgg layout: conv-relu-maxpool stages, then avgpool and classifier.
fn plain_net(stages: &[usize], rng: &mut fastrand::Rng, width: usize) -> Sequential {
    let mut features = Vec::new();
    let mut in_ch = 3;
    for &out_ch in stages {
        features.push(conv(in_ch, out_ch, true, rng));
        features.push(Layer::Relu);
        features.push(Layer::MaxPool { kernel: 2, stride: 2 });
        in_ch = out_ch;
    }
    Sequential::new()
        .with("features", Layer::Block(Sequential::indexed(features)))
        .with("avgpool", Layer::AdaptiveAvgPool(1))
        .with(
            "classifier",
            Layer::Block(Sequential::indexed([
                Layer::Dropout,
                classifier(width, rng),
            ])),
        )
}

fn resnet(stages: &[usize; 4], rng: &mut fastrand::Rng) -> Sequential {
    let mut net = Sequential::new()
        .with("conv1", conv(3, 64, false, rng))
        .with("bn1", Layer::BatchNorm(BatchNorm::new(64)))
        .with("relu", Layer::Relu)
        .with("maxpool", Layer::MaxPool { kernel: 2, stride: 2 });
    let mut in_ch = 64;
    for (i, &out_ch) in stages.iter().enumerate() {
        let mut block = Sequential::new()
            .with("conv1", conv(in_ch, out_ch, false, rng))
            .with("bn1", Layer::BatchNorm(BatchNorm::new(out_ch)))
            .with("relu", Layer::Relu);
        if i > 0 {
            block.push("downsample", Layer::AvgPool { kernel: 2, stride: 2 });
        }
        net.push(
            format!("layer{}", i + 1),
            Layer::Block(Sequential::new().with("0", Layer::Block(block))),
        );
        in_ch = out_ch;
    }
    let width = stages[3];
    net.with("avgpool", Layer::AdaptiveAvgPool(1))
        .with("fc", classifier(width, rng))
}

fn densenet(width: usize, rng: &mut fastrand::Rng) -> Sequential {
    let mid = width / 2;
    let features = Sequential::new()
        .with("conv0", conv(3, 64, false, rng))
        .with("norm0", Layer::BatchNorm(BatchNorm::new(64)))
        .with("relu0", Layer::Relu)
        .with("pool0", Layer::MaxPool { kernel: 2, stride: 2 })
        .with(
            "transition1",
            Layer::Block(
                Sequential::new()
                    .with("conv", conv(64, mid, false, rng))
                    .with("norm", Layer::BatchNorm(BatchNorm::new(mid)))
                    .with("relu", Layer::Relu)
                    .with("pool", Layer::AvgPool { kernel: 2, stride: 2 }),
            ),
        )
        .with(
            "transition2",
            Layer::Block(
                Sequential::new()
                    .with("conv", conv(mid, width, false, rng))
                    .with("pool", Layer::AvgPool { kernel: 2, stride: 2 }),
            ),
        )
        .with("norm5", Layer::BatchNorm(BatchNorm::new(width)));
    Sequential::new()
        .with("features", Layer::Block(features))
        .with("classifier", classifier(width, rng))
}

fn squeezenet(stem: usize, width: usize, rng: &mut fastrand::Rng) -> Sequential {
    let features = Sequential::indexed([
        conv(3, stem, true, rng),
        Layer::Relu,
        Layer::MaxPool { kernel: 2, stride: 2 },
        conv(stem, 256, true, rng),
        Layer::Relu,
        Layer::MaxPool { kernel: 2, stride: 2 },
        conv(256, 384, true, rng),
        Layer::Relu,
        Layer::MaxPool { kernel: 2, stride: 2 },
        conv(384, width, true, rng),
        Layer::Relu,
    ]);
    Sequential::new()
        .with("features", Layer::Block(features))
        .with(
            "classifier",
            Layer::Block(Sequential::indexed([
                Layer::Dropout,
                conv(width, NUM_CLASSES, true, rng),
                Layer::Relu,
                Layer::AdaptiveAvgPool(1),
            ])),
        )
}

/// Window reduction with ceil-mode output size; windows are clipped at the
/// border and inputs smaller than the kernel reduce to a single cell.
fn pool_windows<F>(x: &Array4<f32>, kernel: usize, stride: usize, reduce: F) -> Array4<f32>
where
    F: Fn(ArrayView2<'_, f32>) -> f32,
{
    let (b, c, h, w) = x.dim();
    let out_len = |n: usize| {
        if n <= kernel {
            1
        } else {
            (n - kernel).div_ceil(stride) + 1
        }
    };
    let (oh, ow) = (out_len(h), out_len(w));
    let mut out = Array4::zeros((b, c, oh, ow));
    for ((bi, ci, i, j), slot) in out.indexed_iter_mut() {
        let (y0, x0) = (i * stride, j * stride);
        let window = x.slice(s![bi, ci, y0..(y0 + kernel).min(h), x0..(x0 + kernel).min(w)]);
        *slot = reduce(window);
    }
    out
}

fn adaptive_avg_pool(x: &Array4<f32>, size: usize) -> Array4<f32> {
    let (b, c, h, w) = x.dim();
    let bounds = |i: usize, n: usize| (i * n / size, ((i + 1) * n).div_ceil(size).max(i * n / size + 1));
    let mut out = Array4::zeros((b, c, size, size));
    for ((bi, ci, i, j), slot) in out.indexed_iter_mut() {
        let (y0, y1) = bounds(i, h);
        let (x0, x1) = bounds(j, w);
        let window = x.slice(s![bi, ci, y0..y1.min(h), x0..x1.min(w)]);
        *slot = window.mean().unwrap_or(0.0);
    }
    out
}
