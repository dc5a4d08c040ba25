//! Built-in lookup tables.
//!
//! Keys follow the naming used by the published artifacts: architectures are
//! bare torchvision names, regional whitening is keyed `{arch}-{pool}-r` and
//! global whitening `{arch}[-lw]-{pool}[-r]`.

const CMP: &str = "http://cmp.felk.cvut.cz/cnnimageretrieval/data";

pub(crate) const OUTPUT_DIM: &[(&str, usize)] = &[
    ("alexnet", 256),
    ("vgg11", 512),
    ("vgg13", 512),
    ("vgg16", 512),
    ("vgg19", 512),
    ("resnet18", 512),
    ("resnet34", 512),
    ("resnet50", 2048),
    ("resnet101", 2048),
    ("resnet152", 2048),
    ("densenet121", 1024),
    ("densenet169", 1664),
    ("densenet201", 1920),
    ("densenet161", 2208),
    ("squeezenet1_0", 512),
    ("squeezenet1_1", 512),
];

/// Convolutional weights imported from caffe; retrieval quality is higher
/// with these than with the torchvision ImageNet weights.
pub(crate) const FEATURES: &[(&str, &str)] = &[
    ("vgg16", "networks/imagenet/imagenet-caffe-vgg16-features-d369c8e.pth"),
    ("resnet50", "networks/imagenet/imagenet-caffe-resnet50-features-ac468af.pth"),
    ("resnet101", "networks/imagenet/imagenet-caffe-resnet101-features-10a101d.pth"),
    ("resnet152", "networks/imagenet/imagenet-caffe-resnet152-features-1011020.pth"),
];

/// Local PCA whitening applied before pooling (no pre l2 norm).
pub(crate) const L_WHITENING: &[(&str, &str)] = &[(
    "resnet101",
    "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet101-lwhiten-9f830ef.pth",
)];

pub(crate) const R_WHITENING: &[(&str, &str)] = &[
    ("alexnet-gem-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-alexnet-gem-r-rwhiten-c8cf7e2.pth"),
    ("vgg16-gem-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-vgg16-gem-r-rwhiten-19b204e.pth"),
    ("resnet101-mac-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet101-mac-r-rwhiten-7f1ed8c.pth"),
    ("resnet101-gem-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet101-gem-r-rwhiten-adace84.pth"),
];

pub(crate) const WHITENING: &[(&str, &str)] = &[
    ("alexnet-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-alexnet-gem-whiten-454ad53.pth"),
    ("alexnet-gem-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-alexnet-gem-r-whiten-4c9126b.pth"),
    ("vgg16-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-vgg16-gem-whiten-eaa6695.pth"),
    ("vgg16-gem-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-vgg16-gem-r-whiten-83582df.pth"),
    ("resnet50-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet50-gem-whiten-f15da7b.pth"),
    ("resnet101-mac-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet101-mac-r-whiten-9df41d3.pth"),
    ("resnet101-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet101-gem-whiten-22ab0c1.pth"),
    ("resnet101-gem-r", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet101-gem-r-whiten-b379c0a.pth"),
    ("resnet101-gemmp", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet101-gemmp-whiten-770f53c.pth"),
    ("resnet152-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-resnet152-gem-whiten-abe7b93.pth"),
    ("densenet121-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-densenet121-gem-whiten-79e3eea.pth"),
    ("densenet169-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-densenet169-gem-whiten-6b2a76a.pth"),
    ("densenet201-gem", "whiten/retrieval-SfM-120k/retrieval-SfM-120k-densenet201-gem-whiten-22ea45c.pth"),
];

/// Complete retrieval networks (backbone, pooling and whitening trained together).
pub(crate) const PRETRAINED: &[(&str, &str)] = &[
    ("rSfM120k-tl-resnet50-gem-w", "networks/retrieval-SfM-120k/rSfM120k-tl-resnet50-gem-w-97bf910.pth"),
    ("rSfM120k-tl-resnet101-gem-w", "networks/retrieval-SfM-120k/rSfM120k-tl-resnet101-gem-w-a155e54.pth"),
    ("rSfM120k-tl-resnet152-gem-w", "networks/retrieval-SfM-120k/rSfM120k-tl-resnet152-gem-w-f39cada.pth"),
    ("gl18-tl-resnet50-gem-w", "networks/gl18/gl18-tl-resnet50-gem-w-83fdc30.pth"),
    ("gl18-tl-resnet101-gem-w", "networks/gl18/gl18-tl-resnet101-gem-w-a4d43db.pth"),
    ("gl18-tl-resnet152-gem-w", "networks/gl18/gl18-tl-resnet152-gem-w-21278d5.pth"),
];

pub(crate) fn remote(path: &str) -> String {
    format!("{CMP}/{path}")
}
