//! The retrieval pipeline: features, then an ordered list of optional
//! stages, then a fixed unit-norm output.

use std::fmt;
use std::ops::Deref;

use layers::{
    join, positions_to_rows, rows_to_positions, FeatureExtractor, LayerError, Linear, Mode,
    Pooling, StateDict, Stateful, L2N,
};
use ndarray::{Array2, Array4};
use tracing::debug;

use crate::meta::NetworkMeta;
use crate::NetworkError;

/// One step after feature extraction. Stages run in the order they are
/// stored; [`RetrievalNet::new`] enforces local whitening, pooling, global
/// whitening.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Per-position linear map on the feature map, channel count preserved.
    LocalWhiten(Linear),
    /// Global pooling followed by l2 normalization.
    Pool(Pooling),
    /// Linear map on pooled vectors followed by l2 normalization.
    Whiten(Linear),
}

impl Stage {
    /// Parameter prefix, matching published state dicts.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::LocalWhiten(_) => "lwhiten",
            Stage::Pool(_) => "pool",
            Stage::Whiten(_) => "whiten",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Stage::LocalWhiten(_) => 0,
            Stage::Pool(_) => 1,
            Stage::Whiten(_) => 2,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Stage::LocalWhiten(l) | Stage::Whiten(l) => format!(
                "Linear(in_features={}, out_features={}, bias=True)",
                l.in_features(),
                l.out_features()
            ),
            Stage::Pool(pool) => match pool.p() {
                Some(p) => format!("{}(p={p:.4})", pool.name()),
                None => format!("{}()", pool.name()),
            },
        }
    }
}

/// Intermediate value flowing through the stages.
enum Flow {
    Map(Array4<f32>),
    Vectors(Array2<f32>),
}

/// A composed retrieval network.
///
/// The structure is fixed at construction; only the train/test mode can
/// change afterwards.
#[derive(Debug)]
pub struct RetrievalNet {
    features: Box<dyn FeatureExtractor>,
    stages: Vec<Stage>,
    norm: L2N,
    meta: NetworkMeta,
    mode: Mode,
    deferred_transpose: bool,
}

impl RetrievalNet {
    /// Builds a network from parts. `stages` must contain exactly one pooling
    /// stage and at most one of each whitening stage, in pipeline order.
    pub fn new(
        features: Box<dyn FeatureExtractor>,
        stages: Vec<Stage>,
        meta: NetworkMeta,
        mode: Mode,
        deferred_transpose: bool,
    ) -> Result<Self, NetworkError> {
        let pools = stages.iter().filter(|s| matches!(s, Stage::Pool(_))).count();
        if pools != 1 {
            return Err(NetworkError::InvalidConfig(format!(
                "expected exactly one pooling stage, got {pools}"
            )));
        }
        if stages.windows(2).any(|w| w[0].rank() >= w[1].rank()) {
            return Err(NetworkError::InvalidConfig(
                "stages must be ordered local whitening, pooling, whitening".into(),
            ));
        }
        Ok(Self {
            features,
            stages,
            norm: L2N,
            meta,
            mode,
            deferred_transpose,
        })
    }

    pub fn meta(&self) -> &NetworkMeta {
        &self.meta
    }

    pub fn outputdim(&self) -> usize {
        self.meta.outputdim
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn features(&self) -> &dyn FeatureExtractor {
        self.features.as_ref()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switches mode and returns the previous one.
    pub fn set_mode(&mut self, mode: Mode) -> Mode {
        std::mem::replace(&mut self.mode, mode)
    }

    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    pub fn eval(&mut self) {
        self.mode = Mode::Test;
    }

    /// Pins the network to test mode until the guard is dropped, then
    /// restores whatever mode it had before.
    pub fn eval_guard(&mut self) -> EvalGuard<'_> {
        let previous = self.set_mode(Mode::Test);
        EvalGuard {
            net: self,
            previous,
        }
    }

    /// `true` when [`RetrievalNet::forward`] returns N×D and the caller
    /// transposes after gathering outputs.
    pub fn deferred_transpose(&self) -> bool {
        self.deferred_transpose
    }

    /// Descriptors as rows: `(N, outputdim)`, each row of unit l2 norm.
    pub fn forward_rows(&self, x: &Array4<f32>) -> Result<Array2<f32>, NetworkError> {
        let map = self.features.forward(x, self.mode)?;
        debug!(shape = ?map.dim(), "feature map");

        let mut flow = Flow::Map(map);
        for stage in &self.stages {
            flow = match (stage, flow) {
                (Stage::LocalWhiten(linear), Flow::Map(map)) => {
                    let (b, _, h, w) = map.dim();
                    let rows = linear.forward(positions_to_rows(&map).view())?;
                    Flow::Map(rows_to_positions(rows, b, h, w)?)
                }
                (Stage::Pool(pool), Flow::Map(map)) => {
                    Flow::Vectors(self.norm.forward(pool.forward(map.view())?))
                }
                (Stage::Whiten(linear), Flow::Vectors(v)) => {
                    Flow::Vectors(self.norm.forward(linear.forward(v.view())?))
                }
                (stage, _) => {
                    return Err(NetworkError::InvalidConfig(format!(
                        "stage '{}' received the wrong input kind",
                        stage.name()
                    )))
                }
            };
        }
        match flow {
            Flow::Vectors(v) => Ok(v),
            Flow::Map(_) => Err(NetworkError::InvalidConfig(
                "network has no pooling stage".into(),
            )),
        }
    }

    /// D×N descriptors, or N×D when [`RetrievalNet::deferred_transpose`].
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array2<f32>, NetworkError> {
        let rows = self.forward_rows(x)?;
        Ok(if self.deferred_transpose {
            rows
        } else {
            rows.reversed_axes()
        })
    }

    /// Structure and metadata in a human-readable form.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RetrievalNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.deferred_transpose {
            "SOLAR_Global_Retrieval"
        } else {
            "ImageRetrievalNet"
        };
        writeln!(f, "{name} (")?;
        let features = self.features.describe();
        writeln!(f, "  (features): {}", features.trim_end().replace('\n', "\n  "))?;
        for stage in &self.stages {
            writeln!(f, "  ({}): {}", stage.name(), stage.describe())?;
        }
        write!(f, "{}", self.meta)?;
        write!(f, ")")
    }
}

impl Stateful for RetrievalNet {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        self.features.load_state(dict, &join(prefix, "features"))?;
        for stage in &mut self.stages {
            let stage_prefix = join(prefix, stage.name());
            match stage {
                Stage::LocalWhiten(l) | Stage::Whiten(l) => l.load_state(dict, &stage_prefix)?,
                Stage::Pool(pool) => pool.load_state(dict, &stage_prefix)?,
            }
        }
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        self.features.export_state(&join(prefix, "features"), out);
        for stage in &self.stages {
            let stage_prefix = join(prefix, stage.name());
            match stage {
                Stage::LocalWhiten(l) | Stage::Whiten(l) => l.export_state(&stage_prefix, out),
                Stage::Pool(pool) => pool.export_state(&stage_prefix, out),
            }
        }
    }
}

/// Borrow of a [`RetrievalNet`] pinned to test mode.
pub struct EvalGuard<'a> {
    net: &'a mut RetrievalNet,
    previous: Mode,
}

impl Deref for EvalGuard<'_> {
    type Target = RetrievalNet;

    fn deref(&self) -> &RetrievalNet {
        self.net
    }
}

impl Drop for EvalGuard<'_> {
    fn drop(&mut self) {
        self.net.set_mode(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layers::{Layer, PoolingKind, Sequential};
    use ndarray::Array;

    fn tiny_features() -> Box<dyn FeatureExtractor> {
        let mut rng = fastrand::Rng::with_seed(1);
        Box::new(Sequential::indexed([
            Layer::Conv(layers::Conv::kaiming(3, 4, true, &mut rng)),
            Layer::Relu,
        ]))
    }

    fn meta() -> NetworkMeta {
        NetworkMeta {
            architecture: "tiny".into(),
            local_whitening: true,
            pooling: "gem".into(),
            regional: false,
            whitening: true,
            mean: [0.0; 3],
            std: [1.0; 3],
            outputdim: 4,
            soa: false,
            soa_layers: "45".into(),
        }
    }

    fn tiny_net(deferred: bool) -> RetrievalNet {
        let mut rng = fastrand::Rng::with_seed(2);
        RetrievalNet::new(
            tiny_features(),
            vec![
                Stage::LocalWhiten(Linear::random(4, 4, &mut rng)),
                Stage::Pool(Pooling::new(PoolingKind::Gem, 3.0, 4)),
                Stage::Whiten(Linear::random(4, 4, &mut rng)),
            ],
            meta(),
            Mode::Train,
            deferred,
        )
        .unwrap()
    }

    fn input(n: usize) -> Array4<f32> {
        Array::from_shape_fn((n, 3, 5, 6), |(b, c, y, x)| {
            ((b * 7 + c * 5 + y * 3 + x) % 11) as f32 / 11.0
        })
    }

    #[test]
    fn forward_is_dimension_major_and_unit_norm() {
        let net = tiny_net(false);
        let out = net.forward(&input(3)).unwrap();
        assert_eq!(out.dim(), (4, 3));
        for col in out.columns() {
            let norm = col.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm {norm}");
        }
    }

    #[test]
    fn deferred_transpose_returns_rows() {
        let plain = tiny_net(false);
        let deferred = tiny_net(true);
        let x = input(2);
        let a = plain.forward(&x).unwrap();
        let b = deferred.forward(&x).unwrap();
        assert_eq!(b.dim(), (2, 4));
        assert_eq!(a.t(), b);
    }

    #[test]
    fn stages_must_be_ordered() {
        let mut rng = fastrand::Rng::with_seed(3);
        let err = RetrievalNet::new(
            tiny_features(),
            vec![
                Stage::Pool(Pooling::Mac),
                Stage::LocalWhiten(Linear::random(4, 4, &mut rng)),
            ],
            meta(),
            Mode::Test,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig(_)));

        let err = RetrievalNet::new(tiny_features(), vec![], meta(), Mode::Test, false).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig(_)));
    }

    #[test]
    fn eval_guard_restores_mode() {
        let mut net = tiny_net(false);
        assert_eq!(net.mode(), Mode::Train);
        {
            let guard = net.eval_guard();
            assert_eq!(guard.mode(), Mode::Test);
        }
        assert_eq!(net.mode(), Mode::Train);

        net.eval();
        drop(net.eval_guard());
        assert_eq!(net.mode(), Mode::Test);
    }

    #[test]
    fn state_dict_uses_module_prefixes() {
        let net = tiny_net(false);
        let keys: Vec<String> = net.state_dict().keys().map(str::to_string).collect();
        assert_eq!(
            keys,
            vec![
                "features.0.bias",
                "features.0.weight",
                "lwhiten.bias",
                "lwhiten.weight",
                "pool.p",
                "whiten.bias",
                "whiten.weight",
            ]
        );
    }

    #[test]
    fn describe_includes_stages_and_meta() {
        let text = tiny_net(false).describe();
        assert!(text.starts_with("ImageRetrievalNet ("));
        assert!(text.contains("(lwhiten): Linear(in_features=4, out_features=4, bias=True)"));
        assert!(text.contains("(pool): gem(p=3.0000)"));
        assert!(text.contains("(meta): dict("));
        assert!(text.ends_with(')'));
    }
}
