use std::{
    fmt::{self, Display},
    io,
    path::{Path, PathBuf},
    time::Instant,
};

use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLoss,
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    record::{FullPrecisionSettings, NamedMpkFileRecorder, RecorderError},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use digit_data::{DataSet, MnistBatch, MnistBatcher, MnistDatasets};
use digit_network::{Network, ShapeMismatch};
use ringbuffer::{ConstGenericRingBuffer, RingBuffer};

use crate::{schedule::ExponentialDecay, summary::SummaryWriter, TrainingConfig};

pub const CHECKPOINT_NAME: &str = "model.ckpt";
pub const VALIDATION_DIR: &str = "validation";

const SMOOTHING_WINDOW: usize = 1 << 7;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrainError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("failed to write summaries")]
    Summary(#[source] io::Error),
    #[error("failed to save checkpoint `{}`: {source:?}", path.display())]
    Checkpoint { path: PathBuf, source: RecorderError },
    #[error("failed to load checkpoint `{}`: {source:?}", path.display())]
    LoadCheckpoint { path: PathBuf, source: RecorderError },
    #[error("checkpoint `{}` was written by a different network", path.display())]
    CheckpointShape {
        path: PathBuf,
        #[source]
        source: ShapeMismatch,
    },
}

/// Top-1 accuracy and mean loss over the whole batches of a split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub num_examples: usize,
    pub true_count: usize,
    pub loss: f64,
}

impl Evaluation {
    pub fn precision(&self) -> f64 {
        if self.num_examples == 0 {
            0.0
        } else {
            self.true_count as f64 / self.num_examples as f64
        }
    }
}

impl Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Num examples {}, Num Correct: {} Precision @ 1: {:.4}",
            self.num_examples,
            self.true_count,
            self.precision()
        )
    }
}

/// Returns the number of top-1 hits and the mean loss of one batch.
fn evaluate_batch<B: Backend>(
    network: &Network<B>,
    loss_function: &CrossEntropyLoss<B>,
    batch: MnistBatch<B>,
) -> (usize, f64) {
    let logits = network.forward(batch.images);
    let loss = loss_function
        .forward(logits.clone(), batch.targets.clone())
        .into_scalar()
        .elem::<f64>();

    let true_count = logits
        .argmax(1)
        .squeeze::<1>(1)
        .equal(batch.targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize;

    (true_count, loss)
}

/// Runs `num_examples / batch_size` batches of `data_set` through `network`.
pub fn evaluate<B: Backend>(
    network: &Network<B>,
    data_set: &mut DataSet,
    batch_size: usize,
    device: &B::Device,
) -> Evaluation {
    let batcher = MnistBatcher::<B>::new(device.clone());
    let loss_function = CrossEntropyLoss::new(None);
    let steps_per_epoch = data_set.num_examples() / batch_size.max(1);

    let (true_count, total_loss) = (0..steps_per_epoch)
        .map(|_| {
            let batch = batcher.batch(data_set.next_batch(batch_size));
            evaluate_batch(network, &loss_function, batch)
        })
        .fold((0, 0.0), |(hits, losses), (batch_hits, batch_loss)| {
            (hits + batch_hits, losses + batch_loss)
        });

    Evaluation {
        num_examples: steps_per_epoch * batch_size,
        true_count,
        loss: total_loss / steps_per_epoch.max(1) as f64,
    }
}

/// Drops the autodiff graph, leaving a network made of constants only.
pub fn freeze<B: AutodiffBackend>(network: &Network<B>) -> Network<B::InnerBackend> {
    network.valid()
}

pub fn save_checkpoint<B: Backend>(
    network: &Network<B>,
    log_dir: &Path,
    step: usize,
) -> Result<PathBuf, TrainError> {
    let path = checkpoint_path(log_dir, step);

    network
        .clone()
        .save_file(path.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|source| TrainError::Checkpoint {
            path: path.clone(),
            source,
        })?;

    Ok(path)
}

pub fn load_checkpoint<B: Backend>(network: Network<B>, path: &Path) -> Result<Network<B>, TrainError> {
    let expected = network.parameter_shapes();
    let network = network
        .load_file(path, &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|source| TrainError::LoadCheckpoint {
            path: path.to_path_buf(),
            source,
        })?;

    ShapeMismatch::check(expected, network.parameter_shapes()).map_err(|source| {
        TrainError::CheckpointShape {
            path: path.to_path_buf(),
            source,
        }
    })?;

    Ok(network)
}

/// Path of the checkpoint written after `step`, without the recorder's extension.
pub fn checkpoint_path(log_dir: &Path, step: usize) -> PathBuf {
    log_dir.join(format!("{CHECKPOINT_NAME}-{step}"))
}

/// Trains a freshly initialized network with momentum SGD on minibatches of the training split.
///
/// Scalars go to `log_dir` and `log_dir/validation`, checkpoints to `log_dir/model.ckpt-<step>`.
pub fn run<B: AutodiffBackend>(
    config: &TrainingConfig,
    datasets: &mut MnistDatasets,
    log_dir: &Path,
    device: &B::Device,
) -> Result<Network<B>, TrainError> {
    if datasets.train.num_examples() == 0 {
        return Err(TrainError::EmptyTrainingSet);
    }

    let mut summary_writer = SummaryWriter::create(log_dir).map_err(TrainError::Summary)?;
    let mut validation_writer =
        SummaryWriter::create(&log_dir.join(VALIDATION_DIR)).map_err(TrainError::Summary)?;

    let schedule = ExponentialDecay {
        starter: config.learning_rate,
        decay_steps: config.decay_steps,
        decay_rate: config.decay_rate,
    };
    let mut optimizer = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(config.momentum)
                .with_dampening(0.0),
        ))
        .init();
    let loss_function = CrossEntropyLoss::new(None);
    let batcher = MnistBatcher::<B>::new(device.clone());

    let mut network = config.network.init::<B>().to_device(device);
    let mut recent_losses = ConstGenericRingBuffer::<f32, SMOOTHING_WINDOW>::new();

    tracing::info!(
        steps = config.max_steps,
        batch_size = config.batch_size,
        parameters = network.num_params(),
        "begin training"
    );

    for step in 0..config.max_steps {
        let start = Instant::now();
        let learning_rate = schedule.learning_rate(step);

        let batch = batcher.batch(datasets.train.next_batch(config.batch_size));
        let logits = network.forward(batch.images);
        let loss = loss_function.forward(logits, batch.targets);
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        let gradients = GradientsParams::from_grads(loss.backward(), &network);
        network = optimizer.step(learning_rate, network, gradients);

        let duration = start.elapsed().as_secs_f64();
        recent_losses.push(loss_value);

        if step % config.log_interval.max(1) == 0 {
            let smoothed_loss =
                recent_losses.iter().sum::<f32>() / recent_losses.len().max(1) as f32;

            tracing::info!(
                step,
                loss = loss_value,
                smoothed_loss,
                learning_rate,
                "Step {step}: loss = {loss_value:.2} ({duration:.3} sec)"
            );

            summary_writer
                .add_scalar("loss", f64::from(loss_value), step)
                .and_then(|()| summary_writer.add_scalar("learning_rate", learning_rate, step))
                .and_then(|()| summary_writer.flush())
                .map_err(TrainError::Summary)?;
        }

        if (step + 1) % config.checkpoint_interval.max(1) == 0 || step + 1 == config.max_steps {
            let path = save_checkpoint(&network, log_dir, step)?;
            tracing::info!(path = %path.display(), "saved checkpoint");

            tracing::info!("Validation Data Eval:");

            let evaluation = tracing::info_span!("validation", step).in_scope(|| {
                evaluate(
                    &network.valid(),
                    &mut datasets.validation,
                    config.batch_size,
                    device,
                )
            });

            tracing::info!(
                num_examples = evaluation.num_examples,
                true_count = evaluation.true_count,
                "{evaluation}"
            );

            validation_writer
                .add_scalar("loss", evaluation.loss, step)
                .and_then(|()| validation_writer.add_scalar("learning_rate", learning_rate, step))
                .and_then(|()| {
                    validation_writer.add_scalar("precision", evaluation.precision(), step)
                })
                .and_then(|()| validation_writer.flush())
                .map_err(TrainError::Summary)?;
        }
    }

    Ok(network)
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};
    use digit_data::{MnistItem, HEIGHT, WIDTH};
    use digit_network::NetworkConfig;
    use test_case::test_case;

    use super::*;
    use crate::summary::{read_events, EVENTS_FILE};

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn data_set(count: usize, seed: u64) -> DataSet {
        let items = (0..count)
            .map(|index| {
                let label = (index % 2) as u8;

                MnistItem {
                    image: vec![f32::from(label); WIDTH * HEIGHT],
                    label,
                }
            })
            .collect();

        DataSet::new(items, seed)
    }

    fn small_config() -> TrainingConfig {
        TrainingConfig::new()
            .with_network(
                NetworkConfig::new()
                    .with_conv1_filters(2)
                    .with_conv2_filters(4)
                    .with_hidden_size(8),
            )
            .with_batch_size(4)
            .with_max_steps(3)
            .with_log_interval(1)
            .with_checkpoint_interval(2)
    }

    #[test_case(0, 0, 0.0; "no examples")]
    #[test_case(10, 7, 0.7; "partial")]
    fn precision(num_examples: usize, true_count: usize, expected: f64) {
        let evaluation = Evaluation {
            num_examples,
            true_count,
            loss: 0.0,
        };

        assert!((evaluation.precision() - expected).abs() < 1e-12);
    }

    #[test]
    fn evaluation_report_format() {
        let evaluation = Evaluation {
            num_examples: 5000,
            true_count: 4901,
            loss: 0.1,
        };

        assert_eq!(
            evaluation.to_string(),
            "Num examples 5000, Num Correct: 4901 Precision @ 1: 0.9802"
        );
    }

    #[test]
    fn evaluate_counts_whole_batches_only() {
        let network = NetworkConfig::new()
            .with_conv1_filters(2)
            .with_conv2_filters(2)
            .with_hidden_size(4)
            .init::<TestBackend>();

        let evaluation = evaluate(&network, &mut data_set(25, 0), 10, &Default::default());

        assert_eq!(evaluation.num_examples, 20);
        assert!(evaluation.true_count <= 20);
        assert!(evaluation.loss.is_finite() && evaluation.loss > 0.0);
    }

    #[test]
    fn run_writes_checkpoints_and_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut datasets = MnistDatasets {
            train: data_set(16, 0),
            validation: data_set(8, 1),
            test: data_set(4, 2),
        };

        let network = run::<TestAutodiffBackend>(
            &small_config(),
            &mut datasets,
            dir.path(),
            &Default::default(),
        )
        .unwrap();

        assert!(dir.path().join("model.ckpt-1.mpk").exists());
        assert!(dir.path().join("model.ckpt-2.mpk").exists());

        let events = read_events(&dir.path().join(EVENTS_FILE)).unwrap();
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|event| event.value.is_finite()));

        let validation = read_events(&dir.path().join(VALIDATION_DIR).join(EVENTS_FILE)).unwrap();
        assert_eq!(
            validation
                .iter()
                .map(|event| (event.step, event.tag.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (1, "loss"),
                (1, "learning_rate"),
                (1, "precision"),
                (2, "loss"),
                (2, "learning_rate"),
                (2, "precision"),
            ]
        );
        assert!(validation.iter().all(|event| event.value.is_finite()));

        let frozen = freeze(&network);
        let restored = load_checkpoint(
            small_config().network.init::<TestBackend>(),
            &checkpoint_path(dir.path(), 2),
        )
        .unwrap();

        let images = burn::tensor::Tensor::<TestBackend, 4>::ones([1, 1, 28, 28]);
        let expected = frozen.forward(images.clone()).into_data().value;
        let actual = restored.forward(images).into_data().value;

        assert!(expected
            .iter()
            .zip(&actual)
            .all(|(expected, actual)| (expected - actual).abs() < 1e-5));
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let network = small_config().network.init::<TestBackend>();

        assert!(matches!(
            load_checkpoint(network, &checkpoint_path(dir.path(), 7)),
            Err(TrainError::LoadCheckpoint { path, .. }) if path.ends_with("model.ckpt-7")
        ));
    }

    #[test]
    fn checkpoint_of_other_network_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 0);

        small_config()
            .network
            .with_hidden_size(16)
            .init::<TestBackend>()
            .save_file(path.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        assert!(matches!(
            load_checkpoint(small_config().network.init::<TestBackend>(), &path),
            Err(TrainError::CheckpointShape { source, .. }) if source.found.contains(&vec![16, 10])
        ));
    }

    #[test]
    fn rejects_empty_training_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut datasets = MnistDatasets {
            train: data_set(0, 0),
            validation: data_set(4, 1),
            test: data_set(4, 2),
        };

        assert!(matches!(
            run::<TestAutodiffBackend>(&small_config(), &mut datasets, dir.path(), &Default::default()),
            Err(TrainError::EmptyTrainingSet)
        ));
    }
}
