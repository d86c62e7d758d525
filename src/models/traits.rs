use ndarray::{Array2, ArrayView2, Axis};
use serde_json::{Map, Value as Json};
use tracing::warn;

use crate::data_loader::TrainData;
use crate::error::Result;
use crate::flags::{PredictOptions, TrainFlags};
use crate::metrics::{classification_error, mean_squared_error};

/// Output of [`StatModel::predict`].
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// One row per input sample.
    pub results: Array2<f32>,
    /// Value for the first sample, 0 when there are none.
    pub first: f32,
}

/// A trainable statistical model as seen by the dispatcher.
pub trait StatModel {
    /// Tag of the model's serialized document.
    fn default_name(&self) -> &'static str;

    /// Drops all trained state; hyperparameters are kept.
    fn clear(&mut self);

    fn is_trained(&self) -> bool;

    fn is_classifier(&self) -> bool;

    /// Number of active input variables, 0 when untrained.
    fn var_count(&self) -> usize;

    fn empty(&self) -> bool {
        !self.is_trained()
    }

    fn train(&mut self, data: &TrainData, flags: TrainFlags) -> Result<bool>;

    fn predict(&self, samples: ArrayView2<f32>, options: PredictOptions) -> Result<Prediction>;

    /// Error on the training subset, or on the test subset when `test` is
    /// set, together with the predicted responses (n x 1). An empty subset
    /// falls back to every sample.
    fn calc_error(&self, data: &TrainData, test: bool) -> Result<(f32, Array2<f32>)> {
        let subset = if test {
            data.test_sample_idx()
        } else {
            data.train_sample_idx()
        };
        let subset: Vec<usize> = if subset.is_empty() {
            warn!(test, "Requested subset is empty, evaluating all samples");
            (0..data.n_samples()).collect()
        } else {
            subset.to_vec()
        };

        let samples = data.samples().select(Axis(0), &subset);
        let prediction = self.predict(samples.view(), PredictOptions::default())?;
        let predicted: Vec<f32> = prediction.results.iter().copied().collect();
        let actual: Vec<f32> = subset.iter().map(|&i| data.responses().value(i)).collect();
        let err = if self.is_classifier() {
            classification_error(&predicted, &actual)
        } else {
            mean_squared_error(&predicted, &actual)
        };
        Ok((err, prediction.results))
    }

    /// Field dump written inside the document envelope.
    fn write(&self) -> Result<Map<String, Json>>;

    /// Rebuilds a model from the fields written by [`StatModel::write`].
    fn read(node: &Map<String, Json>) -> Result<Self>
    where
        Self: Sized;
}

pub trait ModelFactory {
    type Params;
    type ModelType: StatModel;

    fn create(params: &Self::Params) -> Self::ModelType;
}
