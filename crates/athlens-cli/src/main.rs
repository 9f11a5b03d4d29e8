use anyhow::{Context, Result};
use athlens_core::types::ChannelOrder;
use athlens_core::{ClassLabel, FaceCandidateDetector, LoadedModel, Pipeline, RawImage};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "athlens", about = "Classify athlete faces in photos")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over `ATHLENS_*` environment variables.
#[derive(Args)]
struct Overrides {
    /// Directory holding the classifier and cascade files
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Classifier model file
    #[arg(long, global = true)]
    weights: Option<PathBuf>,
    /// Frontal-face cascade XML
    #[arg(long, global = true)]
    face_cascade: Option<PathBuf>,
    /// Eye cascade XML
    #[arg(long, global = true)]
    eye_cascade: Option<PathBuf>,
    /// Channel order the classifier expects (rgb or bgr)
    #[arg(long, global = true)]
    channel_order: Option<ChannelOrder>,
    /// ONNX Runtime intra-op threads
    #[arg(long, global = true)]
    threads: Option<usize>,
    /// Images processed at once
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the face in each image, one JSON line per file
    Predict {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show which face region and eyes the detector selects
    Detect { file: PathBuf },
    /// List class labels in model output order
    Labels,
    /// Load every startup dependency and report the result
    Status,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(dir) = self.model_dir {
            config.set_model_dir(dir);
        }
        if let Some(path) = self.weights {
            config.model_path = path;
        }
        if let Some(path) = self.face_cascade {
            config.face_cascade_path = path;
        }
        if let Some(path) = self.eye_cascade {
            config.eye_cascade_path = path;
        }
        if let Some(order) = self.channel_order {
            config.model_channel_order = order;
        }
        if let Some(n) = self.threads {
            config.intra_threads = n;
        }
        if let Some(n) = self.max_concurrency {
            config.max_concurrency = n;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.overrides.apply(&mut config);

    match cli.command {
        Commands::Predict { files } => predict(&config, files).await?,
        Commands::Detect { file } => detect(&config, &file)?,
        Commands::Labels => {
            for (i, label) in ClassLabel::ALL.iter().enumerate() {
                println!("{i}\t{label}");
            }
        }
        Commands::Status => status(&config),
    }

    Ok(())
}

async fn predict(config: &Config, files: Vec<PathBuf>) -> Result<()> {
    let pipeline = Arc::new(Pipeline::load(&config.pipeline_config()).context("failed to load pipeline")?);
    let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));

    tracing::info!(files = files.len(), max_concurrency = config.max_concurrency, "predicting");

    let mut handles = Vec::with_capacity(files.len());
    for file in files {
        let permit = Arc::clone(&permits).acquire_owned().await?;
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            predict_file(&pipeline, &file)
        }));
    }

    // Printed in argument order regardless of completion order.
    for handle in handles {
        println!("{}", handle.await?);
    }
    Ok(())
}

fn predict_file(pipeline: &Pipeline, file: &Path) -> Value {
    let name = file.display().to_string();
    let result = std::fs::read(file)
        .map_err(|e| e.to_string())
        .and_then(|bytes| athlens_core::run_pipeline(pipeline, &bytes).map_err(|e| e.to_string()));

    match result {
        Ok(outcome) => {
            let mut line = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
            if let Value::Object(map) = &mut line {
                map.insert("file".into(), Value::String(name));
            }
            line
        }
        Err(error) => {
            tracing::warn!(file = %name, %error, "prediction failed");
            json!({ "file": name, "error": error })
        }
    }
}

fn detect(config: &Config, file: &Path) -> Result<()> {
    let scan = config.pipeline_config().scan;
    let detector = FaceCandidateDetector::load(
        &config.face_cascade_path.to_string_lossy(),
        &config.eye_cascade_path.to_string_lossy(),
        scan,
    )
    .context("failed to load cascades")?;

    let bytes = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let image = RawImage::decode(&bytes)?;

    let report = match detector.find_face_candidate(&image) {
        Some(candidate) => json!({
            "file": file.display().to_string(),
            "face": candidate.region,
            "eyes": candidate.eyes,
        }),
        None => json!({
            "file": file.display().to_string(),
            "face": null,
            "message": athlens_core::pipeline::NO_FACE_MESSAGE,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn status(config: &Config) {
    let model = match LoadedModel::load(&config.model_path.to_string_lossy(), config.intra_threads.max(1)) {
        Ok(_) => json!({ "path": config.model_path, "loaded": true }),
        Err(e) => json!({ "path": config.model_path, "loaded": false, "error": e.to_string() }),
    };
    let cascades = match FaceCandidateDetector::load(
        &config.face_cascade_path.to_string_lossy(),
        &config.eye_cascade_path.to_string_lossy(),
        config.pipeline_config().scan,
    ) {
        Ok(_) => json!({ "loaded": true }),
        Err(e) => json!({ "loaded": false, "error": e.to_string() }),
    };

    let report = json!({
        "model_dir": config.model_dir,
        "model": model,
        "face_cascade": config.face_cascade_path,
        "eye_cascade": config.eye_cascade_path,
        "cascades": cascades,
        "model_channel_order": config.model_channel_order,
        "intra_threads": config.intra_threads,
        "max_concurrency": config.max_concurrency,
        "labels": ClassLabel::ALL.iter().map(|l| l.name()).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
}
