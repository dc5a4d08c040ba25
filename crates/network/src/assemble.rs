//! Turning a [`NetworkConfig`] into a [`RetrievalNet`].

use artifacts::{load_artifact, ArtifactFetcher};
use layers::{
    ArchitectureFamily, AttentionExtractor, BackboneProvider, FeatureExtractor, LayerError,
    Linear, Mode, Pooling, PoolingKind, ReferenceBackbones, Stateful,
};
use registry::{Registry, NETWORKS_DIR, WHITEN_DIR};
use tracing::info;

use crate::config::NetworkConfig;
use crate::meta::NetworkMeta;
use crate::model::{RetrievalNet, Stage};
use crate::NetworkError;

/// Assembles a network with the built-in reference backbones.
pub fn init_network(
    config: &NetworkConfig,
    registry: &Registry,
    fetcher: &dyn ArtifactFetcher,
) -> Result<RetrievalNet, NetworkError> {
    init_network_with(config, registry, fetcher, &ReferenceBackbones::default())
}

/// Assembles a network: backbone trunk, optional local whitening, pooling
/// (optionally regional), optional global whitening and metadata.
///
/// Pretrained artifacts are looked up in `registry`. A missing entry is not
/// an error: the stage keeps its random initialization and a notice is
/// logged. An entry that cannot be fetched or does not fit fails the whole
/// assembly with [`NetworkError::ArtifactLoad`].
pub fn init_network_with(
    config: &NetworkConfig,
    registry: &Registry,
    fetcher: &dyn ArtifactFetcher,
    backbones: &dyn BackboneProvider,
) -> Result<RetrievalNet, NetworkError> {
    let architecture = config.architecture.as_str();
    let unsupported = || NetworkError::UnsupportedArchitecture(architecture.to_string());

    let dim = registry.output_dim(architecture).ok_or_else(unsupported)?;
    let family = ArchitectureFamily::from_architecture(architecture).map_err(|_| unsupported())?;
    let pooling_kind: PoolingKind = config
        .pooling
        .parse()
        .map_err(|_| NetworkError::UnsupportedPooling(config.pooling.clone()))?;
    if config.soa && family != ArchitectureFamily::ResNet {
        return Err(NetworkError::InvalidConfig(format!(
            "second-order attention needs a resnet backbone, got {architecture}"
        )));
    }

    let mut substituted = config
        .pretrained
        .then(|| registry.features(architecture))
        .flatten();
    if substituted.is_some() && !backbones.accepts_published_features() {
        info!(
            architecture,
            "published feature weights for '{architecture}' do not fit this backbone, general-purpose weights are used"
        );
        substituted = None;
    }
    let backbone = backbones
        .build(architecture, dim, config.pretrained && substituted.is_none())
        .map_err(|err| match err {
            LayerError::UnknownArchitecture(_) => unsupported(),
            other => NetworkError::Layer(other),
        })?;
    let mut trunk = backbone.into_features()?;

    let actual = trunk.out_channels().unwrap_or(0);
    if actual != dim {
        return Err(NetworkError::DimensionMismatch {
            architecture: architecture.to_string(),
            expected: dim,
            actual,
        });
    }

    if let Some(uri) = substituted {
        info!(architecture, artifact = uri, "loading substituted feature weights");
        let state = load_artifact(fetcher, uri, NETWORKS_DIR)
            .map_err(|err| NetworkError::artifact(uri, err))?;
        trunk
            .load_state_dict(&state)
            .map_err(|err| NetworkError::artifact(uri, err))?;
    }

    let mut rng = init_rng(config);
    let mut stages = Vec::with_capacity(3);

    if config.local_whitening {
        let mut lwhiten = Linear::random(dim, dim, &mut rng);
        if config.pretrained {
            load_optional(
                &mut lwhiten,
                registry.local_whitening(architecture),
                architecture,
                "local whitening",
                fetcher,
            )?;
        }
        stages.push(Stage::LocalWhiten(lwhiten));
    }

    let mut pool = Pooling::new(pooling_kind, config.p, dim);
    if config.regional {
        let mut rwhiten = Linear::random(dim, dim, &mut rng);
        if config.pretrained {
            let key = Registry::regional_key(architecture, pooling_kind.as_str());
            load_optional(
                &mut rwhiten,
                registry.regional_whitening(&key),
                &key,
                "regional whitening",
                fetcher,
            )?;
        }
        pool = pool.regional(Some(rwhiten));
    }
    stages.push(Stage::Pool(pool));

    if config.whitening {
        let mut whiten = Linear::random(dim, dim, &mut rng);
        if config.pretrained {
            let key = Registry::whitening_key(
                architecture,
                config.local_whitening,
                pooling_kind.as_str(),
                config.regional,
            );
            load_optional(&mut whiten, registry.whitening(&key), &key, "whitening", fetcher)?;
        }
        stages.push(Stage::Whiten(whiten));
    }

    let meta = NetworkMeta {
        architecture: architecture.to_string(),
        local_whitening: config.local_whitening,
        pooling: pooling_kind.as_str().to_string(),
        regional: config.regional,
        whitening: config.whitening,
        mean: config.mean,
        std: config.std,
        outputdim: dim,
        soa: config.soa,
        soa_layers: config.soa_layers.clone(),
    };

    let features: Box<dyn FeatureExtractor> = if config.soa {
        Box::new(AttentionExtractor::new(trunk, &config.soa_layers, &mut rng)?)
    } else {
        Box::new(trunk)
    };

    RetrievalNet::new(features, stages, meta, config.mode, config.soa)
}

/// Whitening and attention weights are seeded from the configuration when
/// pretrained, so two assemblies of the same config agree.
fn init_rng(config: &NetworkConfig) -> fastrand::Rng {
    if config.pretrained {
        let key = format!(
            "{}-{}-{}{}{}",
            config.architecture,
            config.pooling,
            config.local_whitening as u8,
            config.regional as u8,
            config.whitening as u8
        );
        fastrand::Rng::with_seed(fxhash::hash64(key.as_bytes()))
    } else {
        fastrand::Rng::new()
    }
}

fn load_optional(
    target: &mut Linear,
    uri: Option<&str>,
    key: &str,
    what: &str,
    fetcher: &dyn ArtifactFetcher,
) -> Result<(), NetworkError> {
    let Some(uri) = uri else {
        info!(key, "no {what} computed for '{key}', random weights are used");
        return Ok(());
    };
    info!(key, artifact = uri, "custom computed {what} is used");
    let state = load_artifact(fetcher, uri, WHITEN_DIR).map_err(|err| NetworkError::artifact(uri, err))?;
    target
        .load_state_dict(&state)
        .map_err(|err| NetworkError::artifact(uri, err))
}

/// Builds a complete pretrained retrieval network by name, e.g.
/// `gl18-tl-resnet101-gem-w`.
///
/// The configuration is derived from the name
/// (`<dataset>-tl-<arch>-<pool>[-lw][-r][-w]`); the network is assembled
/// without pretrained parts and then loaded from the registered artifact.
pub fn load_pretrained_network(
    name: &str,
    registry: &Registry,
    fetcher: &dyn ArtifactFetcher,
) -> Result<RetrievalNet, NetworkError> {
    load_pretrained_network_with(name, registry, fetcher, &ReferenceBackbones::default())
}

/// [`load_pretrained_network`] over a caller-supplied backbone provider.
///
/// When the provider declines published feature weights, only the stages
/// after the trunk are taken from the artifact.
pub fn load_pretrained_network_with(
    name: &str,
    registry: &Registry,
    fetcher: &dyn ArtifactFetcher,
    backbones: &dyn BackboneProvider,
) -> Result<RetrievalNet, NetworkError> {
    let uri = registry
        .pretrained_network(name)
        .ok_or_else(|| NetworkError::UnknownPretrainedNetwork(name.to_string()))?;
    let config = config_from_name(name)?;

    let mut net = init_network_with(&config, registry, fetcher, backbones)?;
    info!(name, artifact = uri, "loading pretrained retrieval network");
    let mut state = load_artifact(fetcher, uri, NETWORKS_DIR).map_err(|err| NetworkError::artifact(uri, err))?;
    if !backbones.accepts_published_features() {
        info!(name, "published trunk weights do not fit this backbone, loading the head only");
        let mut merged = net.state_dict();
        for (key, tensor) in state.iter().filter(|(key, _)| !key.starts_with("features.")) {
            merged.insert(key, tensor.clone());
        }
        state = merged;
    }
    net.load_state_dict(&state)
        .map_err(|err| NetworkError::artifact(uri, err))?;
    net.set_mode(Mode::Test);
    Ok(net)
}

/// Parses `<dataset>-tl-<arch>-<pool>[-lw][-r][-w]`.
pub fn config_from_name(name: &str) -> Result<NetworkConfig, NetworkError> {
    let unknown = || NetworkError::UnknownPretrainedNetwork(name.to_string());
    let parts: Vec<&str> = name.split('-').collect();
    let tl = parts.iter().position(|p| *p == "tl").ok_or_else(unknown)?;
    let (architecture, pooling) = match (parts.get(tl + 1), parts.get(tl + 2)) {
        (Some(a), Some(p)) => (*a, *p),
        _ => return Err(unknown()),
    };

    let mut config = NetworkConfig {
        architecture: architecture.to_string(),
        pooling: pooling.to_string(),
        pretrained: false,
        ..NetworkConfig::default()
    };
    for flag in &parts[tl + 3..] {
        match *flag {
            "lw" => config.local_whitening = true,
            "r" => config.regional = true,
            "w" => config.whitening = true,
            _ => return Err(unknown()),
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use artifacts::testing::write_torch_checkpoint;
    use artifacts::{write_state_dict, ArtifactError, CachedFetcher};
    use layers::{to_dyn, BackboneNet, Conv, Layer, Sequential};
    use ndarray::{Array, Array4};
    use registry::RegistryOverrides;
    use std::path::PathBuf;

    /// Refuses every fetch; assembly must not need one.
    struct NoFetch;

    impl ArtifactFetcher for NoFetch {
        fn fetch(&self, uri: &str, _subdir: &str) -> Result<PathBuf, ArtifactError> {
            Err(ArtifactError::Fetch {
                uri: uri.to_string(),
                reason: "fetching disabled".into(),
            })
        }
    }

    fn image(h: usize, w: usize) -> Array4<f32> {
        Array::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            ((c * 13 + y * 5 + x * 3) % 23) as f32 / 23.0 - 0.3
        })
    }

    fn untrained(architecture: &str) -> NetworkConfig {
        NetworkConfig {
            pretrained: false,
            ..NetworkConfig::for_architecture(architecture)
        }
    }

    fn assert_unit_columns(out: &ndarray::Array2<f32>) {
        for col in out.columns() {
            let norm = col.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5, "norm {norm}");
        }
    }

    #[test]
    fn every_registered_architecture_assembles() {
        let registry = Registry::default();
        for architecture in registry.architectures() {
            let net = init_network(&untrained(architecture), &registry, &NoFetch).unwrap();
            let dim = registry.output_dim(architecture).unwrap();
            assert_eq!(net.outputdim(), dim, "{architecture}");

            let out = net.forward(&image(32, 32)).unwrap();
            assert_eq!(out.dim(), (dim, 1), "{architecture}");
            assert_unit_columns(&out);
        }
    }

    #[test]
    fn unsupported_architecture_fails() {
        let err = init_network(&untrained("not-a-real-net"), &Registry::default(), &NoFetch)
            .unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedArchitecture(name) if name == "not-a-real-net"));
    }

    #[test]
    fn registered_dim_without_family_is_unsupported() {
        let registry = Registry::default().with_overrides(
            RegistryOverrides::from_yaml("output_dim:\n  tinynet: 32\n").unwrap(),
        );
        let err = init_network(&untrained("tinynet"), &registry, &NoFetch).unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedArchitecture(_)));
    }

    #[test]
    fn unsupported_pooling_fails() {
        let config = NetworkConfig {
            pooling: "avg".into(),
            ..untrained("resnet18")
        };
        let err = init_network(&config, &Registry::default(), &NoFetch).unwrap_err();
        assert!(matches!(err, NetworkError::UnsupportedPooling(_)));
    }

    #[test]
    fn pretrained_without_any_artifacts_falls_back_to_random() {
        let config = NetworkConfig {
            pretrained: true,
            local_whitening: true,
            regional: true,
            whitening: true,
            ..NetworkConfig::for_architecture("resnet18")
        };
        let net = init_network(&config, &Registry::default(), &NoFetch).unwrap();
        assert_eq!(net.outputdim(), 512);
        assert_eq!(net.stages().len(), 3);
        let out = net.forward(&image(40, 24)).unwrap();
        assert_eq!(out.dim(), (512, 1));
        assert_unit_columns(&out);
    }

    #[test]
    fn registered_artifact_that_cannot_be_fetched_is_fatal() {
        let config = NetworkConfig {
            whitening: true,
            ..NetworkConfig::for_architecture("alexnet")
        };
        let err = init_network(&config, &Registry::default(), &NoFetch).unwrap_err();
        match err {
            NetworkError::ArtifactLoad { artifact, .. } => {
                assert!(artifact.ends_with("alexnet-gem-whiten-454ad53.pth"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn whitening_artifact_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = layers::StateDict::new();
        let identity: Vec<f32> = (0..256 * 256)
            .map(|i| if i / 256 == i % 256 { 1.0 } else { 0.0 })
            .collect();
        dict.insert("weight", to_dyn(&identity, &[256, 256]));
        dict.insert("bias", to_dyn(&vec![0.0; 256], &[256]));
        write_state_dict(&dict, &dir.path().join("alexnet-gem.safetensors")).unwrap();

        let registry = Registry::default().with_overrides(
            RegistryOverrides::from_yaml("whitening:\n  alexnet-gem: alexnet-gem.safetensors\n")
                .unwrap(),
        );
        let config = NetworkConfig {
            whitening: true,
            ..NetworkConfig::for_architecture("alexnet")
        };
        let net = init_network(&config, &registry, &CachedFetcher::new(dir.path())).unwrap();
        match net.stages().last() {
            Some(Stage::Whiten(linear)) => assert_eq!(linear.weight[(3, 3)], 1.0),
            other => panic!("unexpected stage {other:?}"),
        }

        let plain = init_network(&NetworkConfig::for_architecture("alexnet"), &registry, &NoFetch)
            .unwrap();
        let x = image(32, 32);
        let a = net.forward(&x).unwrap();
        let b = plain.forward(&x).unwrap();
        for (u, v) in a.iter().zip(b.iter()) {
            assert!((u - v).abs() < 1e-5);
        }
    }

    fn identity(dim: usize) -> layers::StateDict {
        let mut dict = layers::StateDict::new();
        let weight: Vec<f32> = (0..dim * dim)
            .map(|i| if i / dim == i % dim { 1.0 } else { 0.0 })
            .collect();
        dict.insert("weight", to_dyn(&weight, &[dim, dim]));
        dict.insert("bias", to_dyn(&vec![0.0; dim], &[dim]));
        dict
    }

    #[test]
    fn default_config_assembles_with_default_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::default();
        let fetcher = CachedFetcher::new(dir.path()).offline(true);
        let features = registry.features("resnet101").unwrap();
        let cached = fetcher.cache_path(features, NETWORKS_DIR).unwrap();
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"PK\x03\x04 caffe weights").unwrap();

        let net = init_network(&NetworkConfig::default(), &registry, &fetcher).unwrap();
        assert_eq!(net.outputdim(), 2048);
        assert_eq!(net.meta().architecture, "resnet101");

        let again = init_network(&NetworkConfig::default(), &registry, &NoFetch).unwrap();
        assert_eq!(net.state_dict(), again.state_dict());
        let out = net.forward(&image(32, 32)).unwrap();
        assert_eq!(out.dim(), (2048, 1));
        assert_unit_columns(&out);
    }

    #[test]
    fn published_whitening_checkpoint_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::default();
        let fetcher = CachedFetcher::new(dir.path()).offline(true);
        let uri = registry.whitening("alexnet-gem").unwrap();
        write_torch_checkpoint(&identity(256), &fetcher.cache_path(uri, WHITEN_DIR).unwrap())
            .unwrap();

        let config = NetworkConfig {
            whitening: true,
            ..NetworkConfig::for_architecture("alexnet")
        };
        let net = init_network(&config, &registry, &fetcher).unwrap();
        match net.stages().last() {
            Some(Stage::Whiten(linear)) => {
                assert_eq!(linear.weight[(7, 7)], 1.0);
                assert_eq!(linear.weight[(7, 8)], 0.0);
            }
            other => panic!("unexpected stage {other:?}"),
        }
    }

    /// Trunks with a single pointwise stem, laid out like the published
    /// feature weights it is given.
    struct StemOnly;

    impl BackboneProvider for StemOnly {
        fn build(
            &self,
            architecture: &str,
            width: usize,
            _pretrained: bool,
        ) -> Result<BackboneNet, LayerError> {
            let mut rng = fastrand::Rng::with_seed(3);
            Ok(BackboneNet {
                architecture: architecture.to_string(),
                family: ArchitectureFamily::from_architecture(architecture)?,
                modules: Sequential::new()
                    .with("conv1", Layer::Conv(Conv::kaiming(3, width, false, &mut rng)))
                    .with("avgpool", Layer::AdaptiveAvgPool(1))
                    .with("fc", Layer::Linear(Linear::random(width, 10, &mut rng))),
            })
        }
    }

    #[test]
    fn accepting_provider_loads_published_features() {
        let dir = tempfile::tempdir().unwrap();
        let mut features = layers::StateDict::new();
        features.insert("0.weight", to_dyn(&vec![0.5; 512 * 3], &[512, 3, 1, 1]));
        write_torch_checkpoint(&features, &dir.path().join("stem.pth")).unwrap();

        let registry = Registry::default().with_overrides(
            RegistryOverrides::from_yaml("features:\n  resnet18: stem.pth\n").unwrap(),
        );
        let fetcher = CachedFetcher::new(dir.path());
        let config = NetworkConfig::for_architecture("resnet18");
        let net = init_network_with(&config, &registry, &fetcher, &StemOnly).unwrap();
        let loaded = net.state_dict();
        assert!(loaded.get("features.0.weight").unwrap().iter().all(|v| *v == 0.5));

        // The reference trunks never fetch the published features.
        let net = init_network(&config, &registry, &NoFetch).unwrap();
        assert_eq!(net.outputdim(), 512);

        std::fs::write(dir.path().join("stem.pth"), b"PK\x03\x04").unwrap();
        let err = init_network_with(&config, &registry, &fetcher, &StemOnly).unwrap_err();
        assert!(matches!(err, NetworkError::ArtifactLoad { ref artifact, .. } if artifact == "stem.pth"));
    }

    #[test]
    fn mis_shaped_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = layers::StateDict::new();
        dict.insert("weight", to_dyn(&[0.0; 16], &[4, 4]));
        dict.insert("bias", to_dyn(&[0.0; 4], &[4]));
        write_state_dict(&dict, &dir.path().join("lw.safetensors")).unwrap();

        let registry = Registry::default().with_overrides(
            RegistryOverrides::from_yaml("local_whitening:\n  resnet18: lw.safetensors\n").unwrap(),
        );
        let config = NetworkConfig {
            local_whitening: true,
            ..NetworkConfig::for_architecture("resnet18")
        };
        let err = init_network(&config, &registry, &CachedFetcher::new(dir.path())).unwrap_err();
        assert!(matches!(err, NetworkError::ArtifactLoad { .. }));
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn forward_is_idempotent_in_eval_mode() {
        let config = NetworkConfig {
            regional: true,
            whitening: true,
            ..untrained("resnet18")
        };
        let mut net = init_network(&config, &Registry::default(), &NoFetch).unwrap();
        net.eval();
        let x = image(48, 40);
        assert_eq!(net.forward(&x).unwrap(), net.forward(&x).unwrap());
    }

    #[test]
    fn every_pooling_kind_assembles() {
        for pooling in ["mac", "spoc", "gem", "gemmp", "rmac"] {
            for regional in [false, true] {
                let config = NetworkConfig {
                    pooling: pooling.into(),
                    regional,
                    ..untrained("vgg11")
                };
                let net = init_network(&config, &Registry::default(), &NoFetch).unwrap();
                let out = net.forward(&image(64, 64)).unwrap();
                assert_eq!(out.dim(), (512, 1), "{pooling} regional={regional}");
                assert_unit_columns(&out);
            }
        }
    }

    #[test]
    fn attention_variant_defers_transpose() {
        let config = NetworkConfig {
            soa: true,
            soa_layers: "5".into(),
            mode: Mode::Test,
            ..untrained("resnet18")
        };
        let net = init_network(&config, &Registry::default(), &NoFetch).unwrap();
        assert!(net.deferred_transpose());
        assert!(net.meta().soa);
        let out = net.forward(&image(32, 32)).unwrap();
        assert_eq!(out.dim(), (1, 512));
        assert!(net.state_dict().get("features.soa5.query.weight").is_some());
        assert!(net.describe().starts_with("SOLAR_Global_Retrieval ("));
    }

    #[test]
    fn attention_requires_resnet() {
        let config = NetworkConfig {
            soa: true,
            ..untrained("vgg16")
        };
        assert!(matches!(
            init_network(&config, &Registry::default(), &NoFetch),
            Err(NetworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn metadata_mirrors_structure() {
        let config = NetworkConfig {
            local_whitening: true,
            pooling: "mac".into(),
            regional: true,
            ..untrained("squeezenet1_1")
        };
        let net = init_network(&config, &Registry::default(), &NoFetch).unwrap();
        let meta = net.meta();
        assert_eq!(meta.architecture, "squeezenet1_1");
        assert!(meta.local_whitening && meta.regional && !meta.whitening);
        assert_eq!(meta.pooling, "mac");
        assert_eq!(meta.outputdim, 512);
        assert_eq!(net.stages().len(), 2);
        assert!(net.state_dict().get("pool.whiten.weight").is_some());
    }

    #[test]
    fn names_parse_into_configs() {
        let config = config_from_name("gl18-tl-resnet101-gem-w").unwrap();
        assert_eq!(config.architecture, "resnet101");
        assert_eq!(config.pooling, "gem");
        assert!(config.whitening && !config.regional && !config.local_whitening);
        assert!(!config.pretrained);

        let config = config_from_name("rSfM120k-tl-vgg16-mac-lw-r-w").unwrap();
        assert!(config.local_whitening && config.regional && config.whitening);

        assert!(matches!(
            config_from_name("resnet101-gem"),
            Err(NetworkError::UnknownPretrainedNetwork(_))
        ));
        assert!(matches!(
            config_from_name("gl18-tl-resnet101-gem-x"),
            Err(NetworkError::UnknownPretrainedNetwork(_))
        ));
    }

    #[test]
    fn pretrained_network_loads_full_state() {
        let dir = tempfile::tempdir().unwrap();
        let source = init_network(
            &config_from_name("demo-tl-resnet18-gem-w").unwrap(),
            &Registry::default(),
            &NoFetch,
        )
        .unwrap();
        write_state_dict(&source.state_dict(), &dir.path().join("demo.safetensors")).unwrap();

        let registry = Registry::default().with_overrides(
            RegistryOverrides::from_yaml("pretrained:\n  demo-tl-resnet18-gem-w: demo.safetensors\n")
                .unwrap(),
        );
        let fetcher = CachedFetcher::new(dir.path());
        let loaded = load_pretrained_network("demo-tl-resnet18-gem-w", &registry, &fetcher).unwrap();
        assert_eq!(loaded.mode(), Mode::Test);
        assert_eq!(loaded.state_dict(), source.state_dict());

        assert!(matches!(
            load_pretrained_network("nope-tl-resnet18-gem", &registry, &fetcher),
            Err(NetworkError::UnknownPretrainedNetwork(_))
        ));
    }

    #[test]
    fn published_network_keeps_reference_trunk() {
        let name = "rSfM120k-tl-resnet101-gem-w";
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::default();
        let fetcher = CachedFetcher::new(dir.path()).offline(true);
        let reference = init_network(&config_from_name(name).unwrap(), &registry, &NoFetch).unwrap();

        let mut published = layers::StateDict::new();
        for (key, tensor) in reference.state_dict().iter() {
            if key == "features.0.weight" {
                let shape = [tensor.shape()[0], tensor.shape()[1], 7, 7];
                let len: usize = shape.iter().product();
                published.insert(key, to_dyn(&vec![0.1; len], &shape));
            } else if key == "whiten.bias" {
                published.insert(key, to_dyn(&vec![0.25; 2048], &[2048]));
            } else {
                published.insert(key, tensor.clone());
            }
        }
        let uri = registry.pretrained_network(name).unwrap();
        write_torch_checkpoint(&published, &fetcher.cache_path(uri, NETWORKS_DIR).unwrap()).unwrap();

        let net = load_pretrained_network(name, &registry, &fetcher).unwrap();
        let state = net.state_dict();
        assert_eq!(
            state.get("features.0.weight").unwrap(),
            reference.state_dict().get("features.0.weight").unwrap()
        );
        assert!(state.get("whiten.bias").unwrap().iter().all(|v| *v == 0.25));
        assert_eq!(net.mode(), Mode::Test);
        assert_eq!(net.forward(&image(32, 32)).unwrap().dim(), (2048, 1));

        // A provider that takes published trunks must fit them exactly.
        assert!(matches!(
            load_pretrained_network_with(name, &registry, &fetcher, &StemOnly),
            Err(NetworkError::ArtifactLoad { .. })
        ));
    }
}
