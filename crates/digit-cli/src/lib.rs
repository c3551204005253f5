mod pipeline;
mod plot;

use std::{error::Error, fs::File, io, path::PathBuf};

use burn_wgpu::WgpuDevice;
use clap::{Parser, Subcommand};
use digit_engine::Precision;
use pipeline::{InferenceBackend, PipelineConfig};
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::EnvFilter;

pub use pipeline::{Inference, PipelineError};

#[derive(Parser)]
#[command(version = "0.1.0")]
#[command(about = "Train an MNIST classifier, compile it to an inference engine and run it")]
struct Cli {
    #[arg(
        short,
        long,
        help = "Activate tracing and write results to the specified file after truncating or creating it"
    )]
    trace_file: Option<PathBuf>,
    #[arg(
        short,
        long,
        help = "Read the pipeline configuration from this JSON file, writing the defaults to it if it does not exist"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Train the network, writing checkpoints and summaries to the log directory")]
    Train,
    #[command(about = "Write a training checkpoint to the exchange file")]
    Export {
        #[arg(long, help = "Checkpoint to export instead of the one from the last training step")]
        checkpoint: Option<PathBuf>,
    },
    #[command(about = "Compile the exchange file into an engine plan")]
    Convert {
        #[arg(long, help = "External converter taking the ten positional plan arguments")]
        converter: Option<PathBuf>,
        #[arg(long, help = "Engine precision, `float` or `half`")]
        precision: Option<Precision>,
    },
    #[command(about = "Run the engine plan on one test image")]
    Infer,
    #[command(about = "Train, export, convert and infer in one go")]
    Run,
}

fn initialize_tracing(trace_file: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    match trace_file {
        Some(trace_file) => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(File::create(trace_file)?)
                .event_format(tracing_subscriber::fmt::format().without_time().json())
                .with_thread_ids(true)
                .with_max_level(Level::TRACE)
                .finish();

            Ok(tracing::subscriber::set_global_default(subscriber)?)
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(io::stderr)
                .with_env_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .from_env_lossy(),
                )
                .finish();

            Ok(tracing::subscriber::set_global_default(subscriber)?)
        }
    }
}

fn print_inference(inference: &Inference) {
    print!("{}", inference.report());
}

pub fn cli() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    initialize_tracing(cli.trace_file)?;

    let mut config = match cli.config {
        Some(path) => PipelineConfig::load_or_init(&path)?,
        None => PipelineConfig::new(),
    };
    let device = WgpuDevice::default();

    match cli.command {
        Command::Train => {
            let mut datasets = pipeline::read_datasets(&config)?;
            pipeline::train_network(&config, &mut datasets, &device)?;
        }
        Command::Export { checkpoint } => {
            pipeline::export_checkpoint(&config, checkpoint.as_deref(), &device)?;
        }
        Command::Convert {
            converter,
            precision,
        } => {
            if converter.is_some() {
                config.converter = converter;
            }

            if let Some(precision) = precision {
                config.conversion.data_type = precision;
            }

            pipeline::convert(&config)?;
        }
        Command::Infer => {
            let mut datasets = pipeline::read_datasets(&config)?;
            let inference =
                pipeline::infer::<InferenceBackend>(&config, &mut datasets.test, &device)?;

            print_inference(&inference);
        }
        Command::Run => print_inference(&pipeline::run(&config, &device)?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use test_case::test_case;

    use super::*;

    #[test]
    fn command_line_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn reports_crate_version() {
        assert_eq!(
            Cli::command().get_version(),
            Some(env!("CARGO_PKG_VERSION"))
        );
    }

    #[test_case(&["digit", "run"]; "run")]
    #[test_case(&["digit", "--config", "pipeline.json", "train"]; "train with config")]
    #[test_case(&["digit", "-t", "trace.json", "infer"]; "infer traced")]
    #[test_case(&["digit", "export", "--checkpoint", "log/model.ckpt-999"]; "export checkpoint")]
    fn accepts(args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_ok());
    }

    #[test]
    fn convert_options_are_parsed() {
        let cli = Cli::try_parse_from([
            "digit",
            "convert",
            "--converter",
            "./u2p/build/uff_to_plan",
            "--precision",
            "half",
        ])
        .unwrap();

        assert!(matches!(
            cli.command,
            Command::Convert {
                converter: Some(_),
                precision: Some(Precision::Half),
            }
        ));
    }

    #[test]
    fn rejects_unknown_precision() {
        assert!(Cli::try_parse_from(["digit", "convert", "--precision", "double"]).is_err());
    }
}
