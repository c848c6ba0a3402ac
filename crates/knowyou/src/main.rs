use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use knowyou_core::{
    build_reference_set, render_detections, Dataset, DefaultPhotoLoader, FaceAnalyzer, FaceMatcher,
    OnnxFaceAnalyzer, ReferenceBuild,
};
use knowyou_hw::Camera;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod poll;
mod session;

use config::Config;
use session::Session;

#[derive(Parser)]
#[command(name = "knowyou", about = "Live camera face recognition overlay")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/knowyou/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Camera device path
    #[arg(long, global = true)]
    device: Option<String>,

    /// Directory containing the ONNX models
    #[arg(long, global = true)]
    models: Option<PathBuf>,

    /// Dataset JSON file
    #[arg(long, global = true)]
    dataset: Option<PathBuf>,

    /// Distance below which a face matches a person
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live overlay until interrupted
    Run {
        /// Print every cycle report as a JSON line
        #[arg(long)]
        json: bool,
        /// Write the composited frame here after every cycle
        #[arg(long)]
        overlay: Option<PathBuf>,
        /// Font used for label text
        #[arg(long)]
        font: Option<PathBuf>,
    },
    /// List video capture devices
    Devices,
    /// Describe the dataset photos and print a summary
    References,
    /// Label the faces in a still image
    Annotate {
        image: PathBuf,
        output: PathBuf,
        /// Font used for label text
        #[arg(long)]
        font: Option<PathBuf>,
    },
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.camera_device = device.clone();
        }
        if let Some(models) = &self.models {
            config.model_dir = models.clone();
        }
        if let Some(dataset) = &self.dataset {
            config.dataset_path = dataset.clone();
        }
        if let Some(threshold) = self.threshold {
            config.distance_threshold = threshold;
        }
        match &self.command {
            Commands::Run { overlay, font, .. } => {
                if overlay.is_some() {
                    config.overlay_output = overlay.clone();
                }
                if font.is_some() {
                    config.font_path = font.clone();
                }
            }
            Commands::Annotate { font: Some(font), .. } => config.font_path = Some(font.clone()),
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    ExitCode::from(exit_status(execute(Cli::parse()).await))
}

/// Log a failure once and map it to the process exit status.
fn exit_status(result: Result<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "knowyou failed");
            1
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    match cli.command {
        Commands::Run { json, .. } => run(config, json).await,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::References => {
            let (_, build) = tokio::task::spawn_blocking(move || describe_dataset(&config)).await??;
            print_summary(&build)
        }
        Commands::Annotate { image, output, .. } => {
            tokio::task::spawn_blocking(move || annotate(&config, &image, &output)).await?
        }
    }
}

async fn run(config: Config, json: bool) -> Result<()> {
    tracing::info!(device = %config.camera_device, dataset = %config.dataset_path.display(), "knowyou starting");

    let session = Session::bootstrap(&config).await.context("bootstrap failed")?;
    tracing::info!("knowyou ready");

    let printer = json.then(|| {
        let mut rx = session.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let report = rx.borrow_and_update().clone();
                match serde_json::to_string(&report) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "failed to encode cycle report"),
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("knowyou shutting down");

    session.shutdown().await;
    // Shutdown drops the report sender, which ends the printer.
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(())
}

/// Load the models and describe every dataset photo.
fn describe_dataset(config: &Config) -> Result<(OnnxFaceAnalyzer, ReferenceBuild)> {
    let mut analyzer = OnnxFaceAnalyzer::load(&config.model_paths(), config.detection_confidence)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    let dataset = Dataset::load(&config.dataset_path)?;
    let build = build_reference_set(&dataset, &mut analyzer, &DefaultPhotoLoader::new());
    Ok((analyzer, build))
}

fn print_summary(build: &ReferenceBuild) -> Result<()> {
    let summary = serde_json::json!({
        "people": build.entries.iter().map(|e| serde_json::json!({
            "name": e.name,
            "descriptors": e.descriptors.len(),
        })).collect::<Vec<_>>(),
        "failures": build.failures.iter().map(|f| serde_json::json!({
            "name": f.name,
            "photo": f.photo.to_string(),
            "reason": f.reason.to_string(),
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn annotate(config: &Config, image_path: &std::path::Path, output: &std::path::Path) -> Result<()> {
    let (mut analyzer, build) = describe_dataset(config)?;
    let matcher = FaceMatcher::new(build.entries, config.distance_threshold, config.metric)?;

    let frame = image::open(image_path)
        .with_context(|| format!("failed to open {}", image_path.display()))?
        .to_rgb8();
    let faces = analyzer.detect_all(&frame)?;

    let size = frame.dimensions();
    let mut canvas = session::raster_canvas(&Config {
        width: size.0,
        height: size.1,
        ..config.clone()
    })?;
    let annotations = render_detections(&mut canvas, &matcher, &faces, size);
    canvas.save_composite(&frame, output)?;
    tracing::info!(faces = annotations.len(), output = %output.display(), "annotated image written");

    println!("{}", serde_json::to_string_pretty(&annotations)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_override_config() {
        let cli = Cli::parse_from([
            "knowyou",
            "--device",
            "/dev/video9",
            "--threshold",
            "0.45",
            "run",
            "--overlay",
            "/tmp/out.png",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.camera_device, "/dev/video9");
        assert_eq!(config.distance_threshold, 0.45);
        assert_eq!(config.overlay_output, Some(PathBuf::from("/tmp/out.png")));
        assert!(matches!(cli.command, Commands::Run { json: false, .. }));
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(Ok(())), 0);
        assert_eq!(exit_status(Err(anyhow::anyhow!("camera missing"))), 1);
    }

    #[test]
    fn test_annotate_args() {
        let cli = Cli::parse_from(["knowyou", "annotate", "in.jpg", "out.png", "--dataset", "people.json"]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.dataset_path, PathBuf::from("people.json"));
        match cli.command {
            Commands::Annotate { image, output, font } => {
                assert_eq!(image, PathBuf::from("in.jpg"));
                assert_eq!(output, PathBuf::from("out.png"));
                assert!(font.is_none());
            }
            _ => panic!("expected annotate"),
        }
    }
}
