/// Edge analytics runner
///
/// Reads frames from a video source, runs person, fall, fire/smoke and
/// person-attribute detection on every sampled frame and writes annotated
/// images plus JSON reports below the output directory.
///
/// Usage:
///   edge_analytics [--config pipeline.toml] [--output DIR] [--model-dir DIR] <SOURCE>
///
/// Examples:
///   edge_analytics test_data/frames/
///   edge_analytics --config pipeline.toml rtsp://10.0.0.7/stream1   # needs --features opencv
///   edge_analytics --output /tmp/out 0                               # webcam, needs opencv
use anyhow::Context;
use clap::Parser;
use edge_analytics::{open_source, BackendSet, ExitReason, FileSink, Pipeline, PipelineConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time edge video analytics", long_about = None)]
struct Args {
    /// Video file, image directory, camera index or stream URI
    source: String,

    /// TOML pipeline configuration (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for images, reports and the log store
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory holding the detector models
    #[arg(short, long)]
    model_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.output {
        config.set_output_dir(dir);
    }
    if let Some(dir) = &args.model_dir {
        config.detectors.model_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> anyhow::Result<i32> {
    let config = load_config(&args)?;

    let backends = BackendSet::stubs(&config.detectors);
    let pipeline = Pipeline::new(config.clone(), backends).context("initialising detectors")?;

    let token = pipeline.shutdown_token();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received, stopping");
        token.cancel(ExitReason::Interrupted);
    })
    .context("installing interrupt handler")?;

    let source = open_source(&args.source).with_context(|| format!("opening {}", args.source))?;
    let sink = FileSink::new(&config.output, args.source.clone())
        .with_context(|| format!("preparing {}", config.output.dir.display()))?;

    log::info!(
        "edge_analytics {} processing {} into {}",
        edge_analytics::version(),
        args.source,
        config.output.dir.display()
    );
    let summary = pipeline.run(source, Box::new(sink))?;
    Ok(summary.exit_code())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("❌ {:#}", e);
            std::process::exit(1);
        }
    }
}
