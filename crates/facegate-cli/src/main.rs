use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::cascade::{MIN_NEIGHBORS, SCALE_FACTOR};
use facegate_core::pipeline::CONFIDENCE_THRESHOLD;
use facegate_core::{
    image_ops, CascadeClassifier, FaceDetector, FaceSelection, HaarFaceDetector, LabelMap,
    OnnxClassifier, Verifier, VerifierSettings,
};
use std::path::{Path, PathBuf};

const DEFAULT_CASCADE: &str = "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml";

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face verification diagnostics")]
struct Cli {
    /// Haar cascade XML file
    #[arg(long, global = true, default_value = DEFAULT_CASCADE)]
    cascade: PathBuf,

    /// Pyramid step between detection scales
    #[arg(long, global = true, default_value_t = SCALE_FACTOR)]
    scale_factor: f64,

    /// Neighbouring detections a face needs to survive grouping
    #[arg(long, global = true, default_value_t = MIN_NEIGHBORS)]
    min_neighbors: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the face rectangles found in an image
    Detect {
        /// Image file (PNG, JPEG, ...)
        image: PathBuf,
    },
    /// Run the full verification pipeline on an image
    Verify {
        /// Image file (PNG, JPEG, ...)
        image: PathBuf,

        /// ONNX classifier model
        #[arg(long)]
        model: PathBuf,

        /// TOML label map (defaults to the built-in one)
        #[arg(long)]
        labels: Option<PathBuf>,

        /// Minimum top-1 score (exclusive) for a positive identification
        #[arg(long, default_value_t = CONFIDENCE_THRESHOLD)]
        threshold: f32,

        /// Pick the largest detected face instead of the first
        #[arg(long)]
        largest: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cascade = CascadeClassifier::load(&cli.cascade.to_string_lossy())
        .with_context(|| format!("loading cascade {}", cli.cascade.display()))?;
    let detector = HaarFaceDetector::with_params(cascade, cli.scale_factor, cli.min_neighbors);

    match cli.command {
        Commands::Detect { image } => {
            let bytes = read_image(&image)?;
            let gray = image_ops::to_grayscale(&image_ops::decode_rgb(&bytes)?);
            let faces = detector.detect(&gray)?;
            tracing::info!(
                width = gray.width(),
                height = gray.height(),
                faces = faces.len(),
                "detection done"
            );
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Verify {
            image,
            model,
            labels,
            threshold,
            largest,
        } => {
            let bytes = read_image(&image)?;
            let classifier = OnnxClassifier::load(&model.to_string_lossy())
                .with_context(|| format!("loading model {}", model.display()))?;
            let labels = match labels {
                Some(path) => LabelMap::load(&path.to_string_lossy())?,
                None => LabelMap::default(),
            };
            let selection = if largest {
                FaceSelection::Largest
            } else {
                FaceSelection::First
            };

            let mut verifier = Verifier::new(
                Box::new(detector),
                Box::new(classifier),
                labels,
                VerifierSettings {
                    confidence_threshold: threshold,
                    selection,
                },
            );
            let verdict = verifier.verify_bytes(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&verdict.body())?);
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}
