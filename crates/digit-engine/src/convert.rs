use std::{
    ffi::OsString,
    fmt::{self, Display},
    fs::File,
    io::{self, BufWriter},
    marker::PhantomData,
    path::PathBuf,
    process::{Command, ExitStatus},
    str::FromStr,
};

use burn::{
    config::Config,
    module::Module,
    record::{
        BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder, RecorderError,
    },
    tensor::backend::Backend,
};
use digit_network::NetworkConfig;
use serde::{Deserialize, Serialize};

use crate::{
    container::{Container, ContainerError},
    exchange::{ExchangeError, ExchangeGraph, TensorBinding},
};

pub const PLAN_MAGIC: [u8; 4] = *b"DGPL";

/// Element type the engine stores its weights in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float,
    Half,
}

impl Precision {
    pub fn bytes_per_element(self) -> usize {
        match self {
            Self::Float => 4,
            Self::Half => 2,
        }
    }
}

impl Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => "float".fmt(f),
            Self::Half => "half".fmt(f),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("precision must be `float` or `half`")]
pub struct ParsePrecisionError;

impl FromStr for Precision {
    type Err = ParsePrecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" => Ok(Self::Float),
            "half" => Ok(Self::Half),
            _ => Err(ParsePrecisionError),
        }
    }
}

/// Everything about the engine that is fixed at conversion time.
#[derive(Config, Debug, PartialEq)]
pub struct ConversionConfig {
    #[config(default = "digit_network::INPUT_NAME.to_owned()")]
    pub input_name: String,
    #[config(default = "digit_network::OUTPUT_NAME.to_owned()")]
    pub output_name: String,
    #[config(default = 1)]
    pub input_channel: usize,
    #[config(default = 28)]
    pub input_height: usize,
    #[config(default = 28)]
    pub input_width: usize,
    #[config(default = 4)]
    pub max_batch_size: usize,
    #[config(default = 1048576)]
    pub max_workspace_size: usize,
    #[config(default = "Precision::Float")]
    pub data_type: Precision,
}

/// The arguments of a single conversion, in the order an external converter takes them.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub config: ConversionConfig,
}

impl ConversionRequest {
    pub fn new(
        input_file: impl Into<PathBuf>,
        output_file: impl Into<PathBuf>,
        config: ConversionConfig,
    ) -> Self {
        Self {
            input_file: input_file.into(),
            output_file: output_file.into(),
            config,
        }
    }

    pub fn args(&self) -> Vec<OsString> {
        let config = &self.config;

        vec![
            self.input_file.clone().into_os_string(),
            self.output_file.clone().into_os_string(),
            config.input_name.clone().into(),
            config.output_name.clone().into(),
            config.input_channel.to_string().into(),
            config.input_height.to_string().into(),
            config.input_width.to_string().into(),
            config.max_batch_size.to_string().into(),
            config.max_workspace_size.to_string().into(),
            config.data_type.to_string().into(),
        ]
    }

    fn input_dims(&self) -> Vec<usize> {
        vec![
            self.config.input_channel,
            self.config.input_height,
            self.config.input_width,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineManifest {
    pub input: TensorBinding,
    pub output: TensorBinding,
    pub network: NetworkConfig,
    pub max_batch_size: usize,
    pub max_workspace_size: usize,
    pub precision: Precision,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConvertError {
    #[error("failed to launch converter `{}`", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("converter `{}` exited with {status}", executable.display())]
    Failed {
        executable: PathBuf,
        status: ExitStatus,
    },
    #[error("failed to read exchange graph")]
    Exchange(#[from] ExchangeError),
    #[error("graph has no {kind} named `{name}`")]
    UnknownBinding { kind: &'static str, name: String },
    #[error("input must be {expected:?}, the request says {requested:?}")]
    InputShape {
        expected: Vec<usize>,
        requested: Vec<usize>,
    },
    #[error("max batch size must be at least 1")]
    ZeroBatchSize,
    #[error("engine needs {required} bytes of workspace, only {available} are allowed")]
    WorkspaceTooSmall { required: usize, available: usize },
    #[error("failed to re-encode weights: {0:?}")]
    Record(RecorderError),
    #[error("failed to write engine plan")]
    Plan(#[from] ContainerError),
    #[error("failed to create engine plan file")]
    Io(#[from] io::Error),
}

/// Compiles an exchange graph into an engine plan.
pub trait Converter {
    fn convert(&self, request: &ConversionRequest) -> Result<(), ConvertError>;
}

/// Hands the request to an external compiler as ten positional arguments.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    executable: PathBuf,
}

impl ExternalConverter {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn command(&self, request: &ConversionRequest) -> Command {
        let mut command = Command::new(&self.executable);
        command.args(request.args());
        command
    }
}

impl Converter for ExternalConverter {
    fn convert(&self, request: &ConversionRequest) -> Result<(), ConvertError> {
        tracing::info!(
            executable = %self.executable.display(),
            args = ?request.args(),
            "running external converter"
        );

        let status = self
            .command(request)
            .status()
            .map_err(|source| ConvertError::Spawn {
                executable: self.executable.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ConvertError::Failed {
                executable: self.executable.clone(),
                status,
            })
        }
    }
}

/// Scratch memory needed by the widest layer: its input and output for a full batch.
pub fn required_workspace(
    network: &NetworkConfig,
    max_batch_size: usize,
    precision: Precision,
) -> usize {
    let widest = network
        .activation_sizes()
        .windows(2)
        .map(|pair| pair[0] + pair[1])
        .max()
        .unwrap_or_default();

    widest * max_batch_size * precision.bytes_per_element()
}

/// Validates the request against the graph and writes the plan in-process.
///
/// `B` is only used to materialize the weights while re-encoding them.
#[derive(Debug, Default)]
pub struct BuiltinConverter<B: Backend> {
    _backend: PhantomData<B>,
}

impl<B: Backend> BuiltinConverter<B> {
    pub fn new() -> Self {
        Self {
            _backend: PhantomData,
        }
    }

    /// Checks the request against `graph` and produces the manifest of the engine to build.
    pub fn plan(
        &self,
        graph: &ExchangeGraph,
        request: &ConversionRequest,
    ) -> Result<EngineManifest, ConvertError> {
        let config = &request.config;
        let manifest = &graph.manifest;

        if manifest.input.name != config.input_name {
            return Err(ConvertError::UnknownBinding {
                kind: "input",
                name: config.input_name.clone(),
            });
        }

        if manifest.output.name != config.output_name {
            return Err(ConvertError::UnknownBinding {
                kind: "output",
                name: config.output_name.clone(),
            });
        }

        if manifest.input.dims != request.input_dims() {
            return Err(ConvertError::InputShape {
                expected: manifest.input.dims.clone(),
                requested: request.input_dims(),
            });
        }

        if config.max_batch_size == 0 {
            return Err(ConvertError::ZeroBatchSize);
        }

        let required =
            required_workspace(&manifest.network, config.max_batch_size, config.data_type);

        if required > config.max_workspace_size {
            return Err(ConvertError::WorkspaceTooSmall {
                required,
                available: config.max_workspace_size,
            });
        }

        Ok(EngineManifest {
            input: manifest.input.clone(),
            output: manifest.output.clone(),
            network: manifest.network.clone(),
            max_batch_size: config.max_batch_size,
            max_workspace_size: config.max_workspace_size,
            precision: config.data_type,
        })
    }

    /// Re-encodes the graph's weights at `precision`, after checking them against its manifest.
    fn encode_weights(
        &self,
        graph: &ExchangeGraph,
        precision: Precision,
    ) -> Result<Vec<u8>, ConvertError> {
        let record = graph.network::<B>(&Default::default())?.into_record();

        match precision {
            Precision::Float => {
                BinBytesRecorder::<FullPrecisionSettings>::default().record(record, ())
            }
            Precision::Half => {
                BinBytesRecorder::<HalfPrecisionSettings>::default().record(record, ())
            }
        }
        .map_err(ConvertError::Record)
    }
}

impl<B: Backend> Converter for BuiltinConverter<B> {
    fn convert(&self, request: &ConversionRequest) -> Result<(), ConvertError> {
        let graph = ExchangeGraph::read(&request.input_file)?;
        let manifest = self.plan(&graph, request)?;
        let payload = self.encode_weights(&graph, manifest.precision)?;

        tracing::info!(
            output = %request.output_file.display(),
            precision = %manifest.precision,
            max_batch_size = manifest.max_batch_size,
            weight_bytes = payload.len(),
            "compiled engine"
        );

        Container { manifest, payload }.write(
            PLAN_MAGIC,
            BufWriter::new(File::create(&request.output_file)?),
        )?;

        Ok(())
    }
}
