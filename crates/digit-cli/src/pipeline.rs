use std::path::{Path, PathBuf};

use burn::{backend::Autodiff, config::Config, module::Module, tensor::backend::Backend};
use burn_wgpu::{Wgpu, WgpuDevice};
use digit_data::{DataSet, LoadMnistError, MnistDatasets, WIDTH};
use digit_engine::{
    argmax, export, BuiltinConverter, ConversionConfig, ConversionRequest, ConvertError,
    Converter, Engine, EngineError, ExchangeError, ExternalConverter,
};
use digit_network::Network;
use digit_train::{
    train::{self, TrainError},
    TrainingConfig,
};

use crate::plot::Plot;

pub type InferenceBackend = Wgpu;
pub type TrainingBackend = Autodiff<Wgpu>;

/// Where every stage reads from and writes to, plus the stage configurations.
#[derive(Config, Debug)]
pub struct PipelineConfig {
    #[config(default = "PathBuf::from(\"/tmp/tensorflow/mnist/input_data\")")]
    pub dataset_dir: PathBuf,
    #[config(default = "PathBuf::from(\"/tmp/tensorflow/mnist/log\")")]
    pub log_dir: PathBuf,
    #[config(default = "PathBuf::from(\"tf2trt.dxf\")")]
    pub exchange_file: PathBuf,
    #[config(default = "PathBuf::from(\"tf2trt.PLAN\")")]
    pub plan_file: PathBuf,
    /// External plan compiler, such as `./u2p/build/uff_to_plan`. The built-in one is used when
    /// absent.
    #[config(default = "None")]
    pub converter: Option<PathBuf>,
    #[config(default = "TrainingConfig::new()")]
    pub training: TrainingConfig,
    #[config(default = "ConversionConfig::new()")]
    pub conversion: ConversionConfig,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("failed to read configuration `{}`: {message}", path.display())]
    Config { path: PathBuf, message: String },
    #[error("failed to write configuration `{}`", path.display())]
    SaveConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load the dataset")]
    Data(#[from] LoadMnistError),
    #[error("training failed")]
    Train(#[from] TrainError),
    #[error("export failed")]
    Export(#[from] ExchangeError),
    #[error("conversion failed")]
    Convert(#[from] ConvertError),
    #[error("inference failed")]
    Engine(#[from] EngineError),
    #[error("test split is empty")]
    EmptyTestSet,
    #[error("training ran for zero steps, there is no checkpoint to export")]
    NoCheckpoint,
}

impl PipelineConfig {
    /// Loads the configuration at `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, PipelineError> {
        let file = path.to_string_lossy();

        if path.exists() {
            return Self::load(&*file).map_err(|error| PipelineError::Config {
                path: path.to_path_buf(),
                message: format!("{error:?}"),
            });
        }

        let config = Self::new();
        config
            .save(&*file)
            .map_err(|source| PipelineError::SaveConfig {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!(path = %path.display(), "wrote default configuration");

        Ok(config)
    }

    fn conversion_request(&self) -> ConversionRequest {
        ConversionRequest::new(
            &self.exchange_file,
            &self.plan_file,
            self.conversion.clone(),
        )
    }

    fn final_checkpoint(&self) -> Result<PathBuf, PipelineError> {
        let last_step = self
            .training
            .max_steps
            .checked_sub(1)
            .ok_or(PipelineError::NoCheckpoint)?;

        Ok(train::checkpoint_path(&self.log_dir, last_step))
    }
}

/// The result of running the engine on one test image.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub label: u8,
    pub prediction: Option<usize>,
    pub scores: Vec<f32>,
    pub image: Vec<f32>,
}

impl Inference {
    pub fn report(&self) -> String {
        let prediction = self
            .prediction
            .map_or_else(|| "none".to_owned(), |prediction| prediction.to_string());

        format!(
            "Test Case: {}\nPrediction: {prediction}\n{}",
            self.label,
            Plot::new(&self.image, WIDTH)
        )
    }
}

pub fn read_datasets(config: &PipelineConfig) -> Result<MnistDatasets, PipelineError> {
    Ok(MnistDatasets::read(
        &config.dataset_dir,
        config.training.validation_size,
        config.training.seed,
    )?)
}

pub fn train_network(
    config: &PipelineConfig,
    datasets: &mut MnistDatasets,
    device: &WgpuDevice,
) -> Result<Network<TrainingBackend>, PipelineError> {
    let _span = tracing::info_span!("train").entered();

    Ok(train::run::<TrainingBackend>(
        &config.training,
        datasets,
        &config.log_dir,
        device,
    )?)
}

/// Exports `network` to the configured exchange file.
pub fn export_network<B: Backend>(
    config: &PipelineConfig,
    network: &Network<B>,
) -> Result<(), PipelineError> {
    export(&config.training.network, network, &config.exchange_file)?;

    Ok(())
}

/// Exports the checkpoint written at the last training step.
pub fn export_checkpoint(
    config: &PipelineConfig,
    checkpoint: Option<&Path>,
    device: &WgpuDevice,
) -> Result<(), PipelineError> {
    let checkpoint = match checkpoint {
        Some(checkpoint) => checkpoint.to_path_buf(),
        None => config.final_checkpoint()?,
    };

    let network = train::load_checkpoint(
        config
            .training
            .network
            .init::<InferenceBackend>()
            .to_device(device),
        &checkpoint,
    )?;

    tracing::info!(checkpoint = %checkpoint.display(), "restored checkpoint");

    export_network(config, &network)
}

pub fn convert(config: &PipelineConfig) -> Result<(), PipelineError> {
    let _span = tracing::info_span!("convert").entered();
    let request = config.conversion_request();

    match &config.converter {
        Some(executable) => ExternalConverter::new(executable).convert(&request)?,
        None => BuiltinConverter::<InferenceBackend>::new().convert(&request)?,
    }

    Ok(())
}

/// Runs the compiled engine on the next image of `test_set`.
pub fn infer<B: Backend>(
    config: &PipelineConfig,
    test_set: &mut DataSet,
    device: &B::Device,
) -> Result<Inference, PipelineError> {
    let _span = tracing::info_span!("infer").entered();

    if test_set.num_examples() == 0 {
        return Err(PipelineError::EmptyTestSet);
    }

    let engine = Engine::<B>::load(&config.plan_file, device)?;
    let item = test_set
        .next_batch(1)
        .pop()
        .ok_or(PipelineError::EmptyTestSet)?;

    let scores = engine.infer(&item.image, 1)?;

    Ok(Inference {
        label: item.label,
        prediction: argmax(&scores),
        scores,
        image: item.image,
    })
}

/// Trains, freezes, exports, compiles and runs the network once.
pub fn run(config: &PipelineConfig, device: &WgpuDevice) -> Result<Inference, PipelineError> {
    let mut datasets = read_datasets(config)?;
    let network = train_network(config, &mut datasets, device)?;

    export_network(config, &train::freeze(&network))?;
    convert(config)?;

    infer::<InferenceBackend>(config, &mut datasets.test, device)
}
