use anyhow::Context;
use clap::{Parser, Subcommand};
use generator::profile::{write_capture, GeometryPreset};
use log::{info, warn};
use pomaarcore::geometry::VirtualArray;
use std::path::PathBuf;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use tokio::sync::watch;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Polarimetric MIMO radar detection driver")]
struct Args {
    /// Load a workflow config from YAML
    #[arg(long, global = true)]
    workflow: Option<PathBuf>,
    /// Geometry preset used when no workflow pipeline is given
    #[arg(long, value_enum, global = true)]
    preset: Option<GeometryPreset>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the detection pipeline over a capture and write a JSON report
    Process {
        capture: PathBuf,
        /// Calibration table overriding the workflow's
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// Report path; stdout when absent
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Process through concurrent stage tasks (Ctrl+C stops ingestion)
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Render a synthetic capture with an identity calibration table
    Generate {
        #[arg(long, short, default_value = "capture")]
        out_dir: PathBuf,
        #[arg(long)]
        frames: Option<u32>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Describe the virtual array and its polarization overlaps
    Geometry,
}

fn load_workflow(args: &Args) -> anyhow::Result<WorkflowConfig> {
    let Some(path) = &args.workflow else {
        return Ok(WorkflowConfig::from_preset(args.preset.unwrap_or_default()));
    };
    let mut workflow = WorkflowConfig::load(path)?;
    if let Some(preset) = args.preset {
        workflow.preset = preset;
    }
    Ok(workflow)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut workflow = load_workflow(&args)?;

    match args.command {
        Command::Process {
            capture,
            calibration,
            output,
            stream,
        } => {
            if calibration.is_some() {
                workflow.calibration = calibration;
            }
            let streaming = stream || workflow.streaming;
            let runner = Runner::new(workflow);
            let report = if streaming {
                let runtime = TokioBuilder::new_multi_thread()
                    .enable_all()
                    .build()
                    .context("creating runtime for streaming pipeline")?;
                runtime.block_on(async {
                    let (stop, shutdown) = watch::channel(false);
                    tokio::spawn(async move {
                        if signal::ctrl_c().await.is_ok() {
                            warn!("Ctrl+C received, draining in-flight frames");
                            let _ = stop.send(true);
                        }
                    });
                    runner.execute_streaming(&capture, shutdown).await
                })?
            } else {
                runner.execute(&capture)?
            };

            match output {
                Some(path) => {
                    report
                        .write_json(&path)
                        .with_context(|| format!("writing report {}", path.display()))?;
                    info!("report written to {}", path.display());
                }
                None => {
                    let stdout = std::io::stdout();
                    report
                        .write_to(stdout.lock())
                        .context("writing report to stdout")?;
                    println!();
                }
            }
            println!(
                "{} frames processed, {} skipped, {} dropped, {} detections",
                report.summary.frames_processed,
                report.summary.frames_skipped,
                report.summary.frames_dropped,
                report.detection_count()
            );
        }
        Command::Generate {
            out_dir,
            frames,
            seed,
        } => {
            if let Some(frames) = frames {
                workflow.generator.frames = frames;
            }
            if let Some(seed) = seed {
                workflow.generator.scene.seed = seed;
            }
            if let Some(description) = &workflow.generator.description {
                info!("generating scenario: {}", description);
            }
            let config = workflow.pipeline_config()?;
            let written = write_capture(&config, &workflow.generator, &out_dir)?;
            println!(
                "wrote {} frames with {} targets to {} (calibration {})",
                workflow.generator.frames,
                written.scene.targets.len(),
                written.capture.display(),
                written.calibration.display()
            );
        }
        Command::Geometry => {
            let config = workflow.pipeline_config()?;
            let array = VirtualArray::synthesize(&config.geometry);
            println!(
                "{} transmitters, {} receivers, {} virtual channels ({:?})",
                config.geometry.tx_count(),
                config.geometry.rx_count(),
                array.len(),
                config.geometry.multiplexing
            );
            for element in array.elements() {
                println!(
                    "  tx {:>2} rx {:>2}  {}  at ({:.2}, {:.2})",
                    element.tx,
                    element.rx,
                    element.polarization,
                    element.position[0],
                    element.position[1]
                );
            }
            let overlaps = array.overlaps();
            println!("calibration overlaps: {:?}", overlaps.calibration);
            println!("redundant overlaps: {:?}", overlaps.redundant);
        }
    }

    Ok(())
}
