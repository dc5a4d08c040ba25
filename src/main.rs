use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use irnet::{
    ImageTransform, IrnetConfig, Registry, extract_folder, extract_vectors, save_path_feature,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Image retrieval descriptors from the command line.
#[derive(Parser)]
#[command(name = "irnet", version, about)]
struct Cli {
    /// YAML run configuration; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract descriptors and write them as a feature file
    Extract {
        /// Image files, described in the given order
        #[arg(long, num_args = 1.., conflicts_with = "folder", required_unless_present = "folder")]
        images: Vec<PathBuf>,

        /// Describe every JPEG below this folder instead
        #[arg(long)]
        folder: Option<PathBuf>,

        /// Feature file paths are stored relative to this directory
        #[arg(long)]
        root: Option<PathBuf>,

        /// Directory the feature file is written to
        #[arg(long)]
        output: PathBuf,

        /// Feature file name; defaults to the config name or the folder name
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the structure and metadata of the configured network
    Describe,
    /// List supported architectures and registered pretrained networks
    List,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => IrnetConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => IrnetConfig::default(),
    };

    match cli.command {
        Command::List => {
            let registry: Registry = config.registry();
            println!("architectures:");
            for arch in registry.architectures() {
                let dim = registry.output_dim(arch).unwrap_or_default();
                println!("  {arch} ({dim})");
            }
            println!("pretrained networks:");
            for name in registry.pretrained_networks() {
                println!("  {name}");
            }
        }
        Command::Describe => {
            let net = config.build_network()?;
            println!("{}", net.describe());
        }
        Command::Extract {
            images,
            folder,
            root,
            output,
            name,
        } => {
            let mut net = config.build_network()?;
            let transform = ImageTransform::from_meta(net.meta());

            let (name, paths, vecs) = match folder {
                Some(folder) => {
                    let root = root.unwrap_or_else(|| folder.clone());
                    let name = name
                        .or_else(|| config.name.clone())
                        .or_else(|| folder.file_name().map(|n| n.to_string_lossy().into_owned()))
                        .unwrap_or_else(|| "images".to_string());
                    let (paths, vecs) =
                        extract_folder(&mut net, &folder, &root, &transform, &config.extract)?;
                    (name, paths, vecs)
                }
                None => {
                    if images.is_empty() {
                        bail!("either --images or --folder is required");
                    }
                    let name = name
                        .or_else(|| config.name.clone())
                        .unwrap_or_else(|| "images".to_string());
                    let vecs = extract_vectors(&mut net, &images, &transform, None, &config.extract)?;
                    let paths = match &root {
                        Some(root) => images
                            .iter()
                            .map(|p| p.strip_prefix(root).map(PathBuf::from).unwrap_or_else(|_| p.clone()))
                            .collect(),
                        None => images,
                    };
                    (name, paths, vecs)
                }
            };

            let written = save_path_feature(&name, &output, vecs.view(), &paths)?;
            info!(path = %written.display(), images = paths.len(), "done");
        }
    }
    Ok(())
}
