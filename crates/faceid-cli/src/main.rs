mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::anchors::AnchorSet;
use faceid_core::{ExtractOptions, ExtractPipeline, FaceBox, Landmarks, OrtModelClient};
use image::RgbImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "faceid", about = "Face detection, quality and embedding extraction")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect every face in an image
    Detect { image: PathBuf },
    /// Run the full extraction pipeline on an image
    Extract {
        image: PathBuf,
        /// Apply the enrollment selection policy and quality gate
        #[arg(long)]
        enroll: bool,
        /// Score liveness of the selected face
        #[arg(long)]
        spoofing_check: bool,
    },
    /// Extract both images and print their cosine similarity
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(long)]
        enroll: bool,
    },
    /// Print the base anchors of every detector level
    Anchors,
}

#[derive(Serialize)]
struct DetectedFace {
    bbox: FaceBox,
    score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    landmarks: Option<Landmarks>,
}

#[derive(Serialize)]
struct Comparison {
    similarity: f32,
    distance: f32,
}

#[derive(Serialize)]
struct LevelAnchors {
    stride: usize,
    anchors: Vec<Vec<f32>>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(model_dir = %config.model_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Detect { image } => {
            let pipeline = build_pipeline(&config)?;
            let detections = pipeline.detect(&open_image(&image)?)?;
            let faces: Vec<DetectedFace> = detections
                .iter()
                .map(|(bbox, score, landmarks)| DetectedFace {
                    bbox,
                    score,
                    landmarks,
                })
                .collect();
            print_json(&faces)?;
        }
        Commands::Extract {
            image,
            enroll,
            spoofing_check,
        } => {
            let pipeline = build_pipeline(&config)?;
            let result = pipeline.extract(
                &open_image(&image)?,
                ExtractOptions {
                    enroll,
                    spoofing_check,
                },
            )?;
            print_json(&result)?;
        }
        Commands::Compare { a, b, enroll } => {
            let pipeline = build_pipeline(&config)?;
            let options = ExtractOptions {
                enroll,
                spoofing_check: false,
            };
            let mut embeddings = Vec::with_capacity(2);
            for path in [&a, &b] {
                let result = pipeline.extract(&open_image(path)?, options)?;
                let Some(embedding) = result.embedding else {
                    bail!(
                        "no embedding for {} ({} faces, quality {:?})",
                        path.display(),
                        result.face_count,
                        result.quality
                    );
                };
                embeddings.push(embedding);
            }
            print_json(&Comparison {
                similarity: embeddings[0].similarity(&embeddings[1]),
                distance: embeddings[0].euclidean_distance(&embeddings[1]),
            })?;
        }
        Commands::Anchors => {
            let detection = &config.pipeline.detection;
            let anchors = AnchorSet::generate_with(&detection.anchor_configs(), detection.dense_anchor)
                .context("generating anchors")?;
            let levels: Vec<LevelAnchors> = anchors
                .levels()
                .iter()
                .map(|level| LevelAnchors {
                    stride: level.stride,
                    anchors: level.base.rows().into_iter().map(|r| r.to_vec()).collect(),
                })
                .collect();
            print_json(&levels)?;
        }
    }

    Ok(())
}

fn build_pipeline(config: &Config) -> Result<ExtractPipeline> {
    let client = Arc::new(OrtModelClient::new(&config.model_dir));
    ExtractPipeline::new(client, config.pipeline.clone()).context("building extraction pipeline")
}

fn open_image(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).with_context(|| format!("opening image {}", path.display()))?;
    Ok(image.to_rgb8())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
