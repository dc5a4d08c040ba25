use std::fmt;

use serde::{Deserialize, Serialize};

/// Read-only snapshot of how a network was assembled. Consumers size their
/// result buffers from `outputdim`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMeta {
    pub architecture: String,
    pub local_whitening: bool,
    pub pooling: String,
    pub regional: bool,
    pub whitening: bool,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub outputdim: usize,
    pub soa: bool,
    pub soa_layers: String,
}

fn py_bool(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

impl fmt::Display for NetworkMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  (meta): dict( ")?;
        writeln!(f, "     architecture: {}", self.architecture)?;
        writeln!(f, "     local_whitening: {}", py_bool(self.local_whitening))?;
        writeln!(f, "     pooling: {}", self.pooling)?;
        writeln!(f, "     regional: {}", py_bool(self.regional))?;
        writeln!(f, "     whitening: {}", py_bool(self.whitening))?;
        writeln!(f, "     outputdim: {}", self.outputdim)?;
        writeln!(f, "     mean: {:?}", self.mean)?;
        writeln!(f, "     std: {:?}", self.std)?;
        writeln!(f, "     soa: {}", py_bool(self.soa))?;
        writeln!(f, "     soa_layers: {}", self.soa_layers)?;
        writeln!(f, "  )")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_every_field() {
        let meta = NetworkMeta {
            architecture: "resnet50".into(),
            local_whitening: false,
            pooling: "gem".into(),
            regional: true,
            whitening: true,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            outputdim: 2048,
            soa: false,
            soa_layers: "45".into(),
        };
        let text = meta.to_string();
        assert!(text.starts_with("  (meta): dict( \n"));
        assert!(text.contains("     architecture: resnet50\n"));
        assert!(text.contains("     regional: True\n"));
        assert!(text.contains("     local_whitening: False\n"));
        assert!(text.contains("     outputdim: 2048\n"));
        assert!(text.ends_with("  )\n"));
    }
}
