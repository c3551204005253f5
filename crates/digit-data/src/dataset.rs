use std::path::Path;

use burn::data::dataset::{Dataset, InMemDataset};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::idx::{IdxImages, IdxLabels, ReadIdxError};

pub const WIDTH: usize = 28;
pub const HEIGHT: usize = 28;
pub const NUM_CLASSES: usize = 10;

const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

/// Number of training images held back for validation.
pub const VALIDATION_SIZE: usize = 5000;

/// A single digit, with brightness scaled into `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MnistItem {
    /// Row-major pixels, `WIDTH * HEIGHT` of them.
    pub image: Vec<f32>,
    pub label: u8,
}

impl MnistItem {
    fn from_bytes(bytes: &[u8], label: u8) -> Self {
        Self {
            image: bytes.iter().map(|&pixel| f32::from(pixel) / 255.0).collect(),
            label,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LoadMnistError {
    #[error("failed to read `{file}`")]
    Idx {
        file: &'static str,
        #[source]
        source: ReadIdxError,
    },
    #[error("images must be {HEIGHT}x{WIDTH}, found {rows}x{columns}")]
    InvalidImageShape { rows: usize, columns: usize },
    #[error("{images} images were given {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error("validation size {validation} exceeds the {train} training images")]
    ValidationTooLarge { validation: usize, train: usize },
}

/// An in-memory split which hands out batches in a freshly shuffled order every epoch.
///
/// A batch that crosses an epoch boundary takes the remainder of the current epoch and is filled
/// up from the start of the next one.
pub struct DataSet {
    items: InMemDataset<MnistItem>,
    order: Vec<usize>,
    position: usize,
    epochs_completed: usize,
    rng: StdRng,
}

impl DataSet {
    pub fn new(items: Vec<MnistItem>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order = (0..items.len()).collect::<Vec<_>>();
        order.shuffle(&mut rng);

        Self {
            items: InMemDataset::new(items),
            order,
            position: 0,
            epochs_completed: 0,
            rng,
        }
    }

    pub fn num_examples(&self) -> usize {
        self.items.len()
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn get(&self, index: usize) -> Option<MnistItem> {
        self.items.get(index)
    }

    pub fn next_batch(&mut self, batch_size: usize) -> Vec<MnistItem> {
        if self.order.is_empty() {
            return Vec::new();
        }

        let mut batch = Vec::with_capacity(batch_size);

        while batch.len() < batch_size {
            if self.position == self.order.len() {
                self.epochs_completed += 1;
                self.position = 0;
                self.order.shuffle(&mut self.rng);

                tracing::debug!(epochs = self.epochs_completed, "finished epoch");
            }

            let take = (batch_size - batch.len()).min(self.order.len() - self.position);

            batch.extend(
                self.order[self.position..self.position + take]
                    .iter()
                    .filter_map(|&index| self.items.get(index)),
            );
            self.position += take;
        }

        batch
    }
}

/// The three MNIST splits.
pub struct MnistDatasets {
    pub train: DataSet,
    pub validation: DataSet,
    pub test: DataSet,
}

impl MnistDatasets {
    /// Reads the four standard IDX files, optionally gzipped, from `dir`.
    ///
    /// The first `validation_size` training images become the validation split.
    pub fn read(dir: &Path, validation_size: usize, seed: u64) -> Result<Self, LoadMnistError> {
        let mut train = read_split(dir, TRAIN_IMAGES, TRAIN_LABELS)?;
        let test = read_split(dir, TEST_IMAGES, TEST_LABELS)?;

        if validation_size > train.len() {
            return Err(LoadMnistError::ValidationTooLarge {
                validation: validation_size,
                train: train.len(),
            });
        }

        let train_rest = train.split_off(validation_size);
        let validation = train;

        tracing::info!(
            train = train_rest.len(),
            validation = validation.len(),
            test = test.len(),
            "read mnist"
        );

        Ok(Self {
            train: DataSet::new(train_rest, seed),
            validation: DataSet::new(validation, seed.wrapping_add(1)),
            test: DataSet::new(test, seed.wrapping_add(2)),
        })
    }
}

fn read_split(
    dir: &Path,
    images_file: &'static str,
    labels_file: &'static str,
) -> Result<Vec<MnistItem>, LoadMnistError> {
    let images = IdxImages::open(&dir.join(images_file)).map_err(|source| LoadMnistError::Idx {
        file: images_file,
        source,
    })?;
    let labels = IdxLabels::open(&dir.join(labels_file)).map_err(|source| LoadMnistError::Idx {
        file: labels_file,
        source,
    })?;

    if (images.rows, images.columns) != (HEIGHT, WIDTH) {
        return Err(LoadMnistError::InvalidImageShape {
            rows: images.rows,
            columns: images.columns,
        });
    }

    if images.len() != labels.len() {
        return Err(LoadMnistError::CountMismatch {
            images: images.len(),
            labels: labels.len(),
        });
    }

    Ok(images
        .iter()
        .zip(labels.as_slice())
        .map(|(bytes, &label)| MnistItem::from_bytes(bytes, label))
        .collect())
}
