use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Data, Int, Shape, Tensor},
};

use crate::dataset::{MnistItem, HEIGHT, WIDTH};

/// Stacks items into NCHW image tensors and integer class targets on a fixed device.
pub struct MnistBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Clone, Debug)]
pub struct MnistBatch<B: Backend> {
    /// `[batch, 1, HEIGHT, WIDTH]`
    pub images: Tensor<B, 4>,
    /// `[batch]`
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> MnistBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<MnistItem, MnistBatch<B>> for MnistBatcher<B> {
    fn batch(&self, items: Vec<MnistItem>) -> MnistBatch<B> {
        let batch_size = items.len();

        let pixels = items
            .iter()
            .flat_map(|item| item.image.iter().copied())
            .collect::<Vec<f32>>();
        let labels = items
            .iter()
            .map(|item| i64::from(item.label))
            .collect::<Vec<_>>();

        let images = Tensor::from_data_device(
            Data::new(pixels, Shape::new([batch_size, 1, HEIGHT, WIDTH])).convert(),
            &self.device,
        );
        let targets = Tensor::from_data_device(
            Data::new(labels, Shape::new([batch_size])).convert(),
            &self.device,
        );

        MnistBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;

    #[test]
    fn batches_into_nchw() {
        let items = vec![
            MnistItem {
                image: vec![0.5; WIDTH * HEIGHT],
                label: 3,
            },
            MnistItem {
                image: vec![1.0; WIDTH * HEIGHT],
                label: 8,
            },
        ];

        let batch = MnistBatcher::<NdArray>::new(Default::default()).batch(items);

        assert_eq!(batch.images.dims(), [2, 1, 28, 28]);
        assert_eq!(batch.targets.into_data().convert::<i64>().value, vec![3, 8]);
        assert_eq!(
            batch.images.sum().into_scalar(),
            0.5 * 784.0 + 784.0
        );
    }
}
