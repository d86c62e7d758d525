//! Boosted decision-tree classifier.
//!
//! Two-class AdaBoost in its four classic flavours over weighted CART weak
//! learners: Discrete and Real fit classification trees on the labels,
//! LogitBoost and Gentle fit regression trees on working responses. Every
//! weak learner contributes its leaf value to an additive score; the sign of
//! the score picks the class.

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

use super::traits::{ModelFactory, Prediction, StatModel};
use super::tree::{Forest, LeafRule, Node, Problem, Split, TreeBuilder, TreeParams, EPS};
use crate::data_loader::{Responses, TrainData, VarType};
use crate::error::{DispatchError, Result};
use crate::flags::{PredictMode, PredictOptions, TrainFlags};

/// Clamp for LogitBoost working responses.
const LOGIT_Z_MAX: f64 = 10.0;

/// Deepest tree a weak learner may grow; larger `MaxDepth` values are
/// clamped to it.
pub const MAX_TREE_DEPTH: i32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoostType {
    Discrete,
    #[default]
    Real,
    Logit,
    Gentle,
}

impl BoostType {
    pub const ALL: [BoostType; 4] = [Self::Discrete, Self::Real, Self::Logit, Self::Gentle];

    pub fn code(self) -> i32 {
        match self {
            Self::Discrete => 0,
            Self::Real => 1,
            Self::Logit => 2,
            Self::Gentle => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Discrete => "Discrete",
            Self::Real => "Real",
            Self::Logit => "Logit",
            Self::Gentle => "Gentle",
        }
    }
}

impl fmt::Display for BoostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BoostType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| DispatchError::invalid(format!("unknown BoostType {s}")))
    }
}

/// Hyperparameters of a [`Boost`] model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostParams {
    pub boost_type: BoostType,
    pub weak_count: i32,
    pub weight_trim_rate: f64,
    pub max_depth: i32,
    pub min_sample_count: i32,
    pub max_categories: i32,
    /// Stored only; weak learners are never pruned.
    pub cv_folds: i32,
    pub regression_accuracy: f64,
    pub use_surrogates: bool,
    pub use_1se_rule: bool,
    pub truncate_pruned_tree: bool,
    /// Per-class weight multipliers, empty for none.
    pub priors: Vec<f32>,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            boost_type: BoostType::Real,
            weak_count: 100,
            weight_trim_rate: 0.95,
            max_depth: 1,
            min_sample_count: 10,
            max_categories: 10,
            cv_folds: 0,
            regression_accuracy: 0.01,
            use_surrogates: false,
            use_1se_rule: true,
            truncate_pruned_tree: true,
            priors: Vec::new(),
        }
    }
}

impl BoostParams {
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: &str| {
            if ok {
                Ok(())
            } else {
                Err(DispatchError::invalid(msg))
            }
        };
        check(self.weak_count >= 1, "WeakCount should be >= 1")?;
        check(
            (0.0..=1.0).contains(&self.weight_trim_rate),
            "WeightTrimRate should be in [0,1]",
        )?;
        check(self.max_depth >= 0, "MaxDepth should be >= 0")?;
        check(self.min_sample_count >= 1, "MinSampleCount should be >= 1")?;
        check(self.max_categories >= 2, "MaxCategories should be >= 2")?;
        check(self.cv_folds >= 0, "CVFolds should be >= 0")?;
        check(
            self.regression_accuracy >= 0.0,
            "RegressionAccuracy should be >= 0",
        )?;
        check(
            self.priors.iter().all(|p| p.is_finite() && *p >= 0.0),
            "Priors should be finite and non-negative",
        )
    }

    fn tree_params(&self) -> TreeParams {
        TreeParams {
            max_depth: self.max_depth.min(MAX_TREE_DEPTH) as usize,
            min_sample_count: self.min_sample_count as usize,
            regression_accuracy: self.regression_accuracy,
            use_surrogates: self.use_surrogates,
        }
    }
}

/// Everything `train` learns, including what prediction needs to encode
/// raw samples the way training saw them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedState {
    pub var_all: usize,
    pub var_idx: Vec<usize>,
    pub var_type: Vec<VarType>,
    /// Sorted category values per variable, empty for ordered ones.
    pub cat_map: Vec<Vec<i32>>,
    /// Negative class first.
    pub class_labels: Vec<i32>,
    pub ensemble: Forest,
}

impl TrainedState {
    fn n_cats(&self) -> Vec<usize> {
        self.cat_map.iter().map(Vec::len).collect()
    }

    /// Maps a raw value to what the trees compare against. Unknown
    /// categories become missing.
    fn encode(&self, var: usize, v: f32, preprocessed: bool) -> f32 {
        if v.is_nan() || self.var_type[var] == VarType::Ordered {
            return v;
        }
        let cats = &self.cat_map[var];
        if preprocessed {
            return if v >= 0.0 && (v as usize) < cats.len() {
                v.trunc()
            } else {
                f32::NAN
            };
        }
        match cats.binary_search(&(v.round() as i32)) {
            Ok(i) => i as f32,
            Err(_) => f32::NAN,
        }
    }

    fn encode_row(&self, sample: ArrayView1<f32>, row: &mut [f32], compressed: bool, preprocessed: bool) {
        for (k, &var) in self.var_idx.iter().enumerate() {
            let raw = if compressed { sample[k] } else { sample[var] };
            row[var] = self.encode(var, raw, preprocessed);
        }
    }

    fn score(&self, row: &[f32], mode: PredictMode) -> f64 {
        self.ensemble
            .roots
            .iter()
            .map(|&root| {
                let value = self.ensemble.leaf(root, |v| row[v]).value;
                match mode {
                    PredictMode::Auto | PredictMode::Sum => value,
                    PredictMode::MaxVote => value.signum() * f64::from(u8::from(value != 0.0)),
                }
            })
            .sum()
    }

    fn label(&self, score: f64) -> i32 {
        self.class_labels[usize::from(score > 0.0)]
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.var_type.len() != self.var_all || self.cat_map.len() != self.var_all {
            return Err("variable metadata does not match var_all".to_owned());
        }
        if self.var_idx.iter().any(|&v| v >= self.var_all) {
            return Err("active variable out of range".to_owned());
        }
        if self.class_labels.len() != 2 {
            return Err(format!("expected 2 class labels, got {}", self.class_labels.len()));
        }
        self.ensemble.validate(self.var_all)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Boost {
    params: BoostParams,
    state: Option<TrainedState>,
}

impl ModelFactory for Boost {
    type Params = BoostParams;
    type ModelType = Self;

    fn create(params: &BoostParams) -> Self {
        Self {
            params: params.clone(),
            state: None,
        }
    }
}

impl Boost {
    pub const DEFAULT_NAME: &'static str = "ml_boost";

    pub fn params(&self) -> &BoostParams {
        &self.params
    }

    /// Replaces all hyperparameters at once; nothing changes on error.
    pub fn set_params(&mut self, params: BoostParams) -> Result<()> {
        params.validate()?;
        self.params = params;
        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        self.state.as_ref().map_or(&[][..], |s| s.ensemble.nodes.as_slice())
    }

    pub fn splits(&self) -> &[Split] {
        self.state.as_ref().map_or(&[][..], |s| s.ensemble.splits.as_slice())
    }

    pub fn subsets(&self) -> &[i32] {
        self.state.as_ref().map_or(&[][..], |s| s.ensemble.subsets.as_slice())
    }

    pub fn roots(&self) -> &[i32] {
        self.state.as_ref().map_or(&[][..], |s| s.ensemble.roots.as_slice())
    }

    /// Metadata for a fresh ensemble, or the existing one when updating.
    fn start_state(&self, data: &TrainData, classes: &[i32], update: bool) -> Result<TrainedState> {
        if update {
            if let Some(state) = &self.state {
                if state.var_all != data.n_vars()
                    || state.var_idx != data.var_idx()
                    || state.class_labels != classes
                {
                    return Err(DispatchError::model(
                        "cannot update the model: data layout or classes differ from the trained model",
                    ));
                }
                return Ok(state.clone());
            }
        }

        let samples = data.samples();
        let mut cat_map = vec![Vec::new(); data.n_vars()];
        for &var in data.var_idx() {
            if data.var_types()[var] != VarType::Categorical {
                continue;
            }
            let mut cats: Vec<i32> = data
                .train_sample_idx()
                .iter()
                .map(|&i| samples[[i, var]])
                .filter(|v| !v.is_nan())
                .map(|v| v.round() as i32)
                .collect();
            cats.sort_unstable();
            cats.dedup();
            if cats.len() > self.params.max_categories as usize {
                debug!(var, n_cats = cats.len(), "Variable has more categories than MaxCategories");
            }
            cat_map[var] = cats;
        }
        Ok(TrainedState {
            var_all: data.n_vars(),
            var_idx: data.var_idx().to_vec(),
            var_type: data.var_types().to_vec(),
            cat_map,
            class_labels: classes.to_vec(),
            ensemble: Forest::default(),
        })
    }
}

fn normalize(w: &mut [f64]) -> bool {
    let sum: f64 = w.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return false;
    }
    w.iter_mut().for_each(|x| *x /= sum);
    true
}

/// Smallest set of heaviest samples holding `rate` of the total weight.
fn trimmed(w: &[f64], rate: f64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..w.len()).filter(|&i| w[i] > 0.0).collect();
    if rate <= 0.0 || rate >= 1.0 {
        return order;
    }
    order.sort_by(|&a, &b| w[b].total_cmp(&w[a]));
    let total: f64 = order.iter().map(|&i| w[i]).sum();
    let mut acc = 0.0;
    let mut keep = order.len();
    for (k, &i) in order.iter().enumerate() {
        acc += w[i];
        if acc >= rate * total {
            keep = k + 1;
            break;
        }
    }
    order.truncate(keep);
    order.sort_unstable();
    order
}

/// LogitBoost weights and working responses from the current scores.
fn logit_step(f: &[f64], y: &[f64], base: &[f64], w: &mut [f64], z: &mut [f64]) {
    for i in 0..f.len() {
        let p = 1.0 / (1.0 + (-2.0 * f[i]).exp());
        let var = (p * (1.0 - p)).max(EPS);
        let y01 = if y[i] > 0.0 { 1.0 } else { 0.0 };
        w[i] = base[i] * var;
        z[i] = ((y01 - p) / var).clamp(-LOGIT_Z_MAX, LOGIT_Z_MAX);
    }
}

impl StatModel for Boost {
    fn default_name(&self) -> &'static str {
        Self::DEFAULT_NAME
    }

    fn clear(&mut self) {
        self.state = None;
    }

    fn is_trained(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.ensemble.roots.is_empty())
    }

    fn is_classifier(&self) -> bool {
        self.state.is_some()
    }

    fn var_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.var_idx.len())
    }

    #[instrument(skip_all, fields(boost_type = %self.params.boost_type, weak_count = self.params.weak_count))]
    fn train(&mut self, data: &TrainData, flags: TrainFlags) -> Result<bool> {
        self.params.validate()?;
        let labels = match data.responses() {
            Responses::Categorical(labels) => labels,
            Responses::Ordered(_) => {
                return Err(DispatchError::model(
                    "Boosting is not supported for regression problems",
                ))
            }
        };
        let idx = data.train_sample_idx();
        if idx.is_empty() || data.var_idx().is_empty() {
            return Err(DispatchError::model("the training set is empty"));
        }
        let mut classes: Vec<i32> = idx.iter().map(|&i| labels[i]).collect();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() != 2 {
            return Err(DispatchError::model(format!(
                "Boosting supports only two-class problems, got {} classes",
                classes.len()
            )));
        }
        let priors = match self.params.priors.as_slice() {
            [] => [1.0, 1.0],
            [a, b] => [f64::from(*a), f64::from(*b)],
            other => {
                return Err(DispatchError::model(format!(
                    "Priors has {} entries for 2 classes",
                    other.len()
                )))
            }
        };

        let mut state = self.start_state(data, &classes, flags.update_model)?;
        let n = idx.len();
        let n_cats = state.n_cats();
        let mut x = Array2::from_elem((n, state.var_all), f32::NAN);
        for (pos, &i) in idx.iter().enumerate() {
            let mut row = x.row_mut(pos);
            let row = row
                .as_slice_mut()
                .ok_or_else(|| DispatchError::model("non-contiguous training row"))?;
            state.encode_row(data.samples().row(i), row, false, false);
        }
        let y: Vec<f64> = idx
            .iter()
            .map(|&i| if labels[i] == classes[1] { 1.0 } else { -1.0 })
            .collect();
        let base: Vec<f64> = idx
            .iter()
            .zip(&y)
            .map(|(&i, &yi)| f64::from(data.sample_weights()[i]) * priors[usize::from(yi > 0.0)])
            .collect();

        // Scores of the ensemble so far; all zero for a fresh model.
        let mut f: Vec<f64> = (0..n)
            .map(|pos| {
                let row = x.row(pos);
                state
                    .ensemble
                    .roots
                    .iter()
                    .map(|&root| state.ensemble.leaf(root, |v| row[v]).value)
                    .sum()
            })
            .collect();
        let boost_type = self.params.boost_type;
        let mut w = vec![0.0; n];
        let mut z = vec![0.0; n];
        if boost_type == BoostType::Logit {
            logit_step(&f, &y, &base, &mut w, &mut z);
        } else {
            // exp(-y*f) relative to its largest term, so long ensembles do not underflow
            let top = (0..n).map(|i| -y[i] * f[i]).fold(f64::NEG_INFINITY, f64::max);
            for i in 0..n {
                w[i] = base[i] * (-y[i] * f[i] - top).exp();
            }
        }
        if !normalize(&mut w) {
            return Err(DispatchError::model("all sample weights are zero"));
        }

        let tree_params = self.params.tree_params();
        let first_tree = state.ensemble.roots.len();
        for round in 0..self.params.weak_count {
            let subset = trimmed(&w, self.params.weight_trim_rate);
            let (targets, leaf) = match boost_type {
                BoostType::Discrete => (&y, LeafRule::Sign),
                BoostType::Real => (&y, LeafRule::HalfLogOdds),
                BoostType::Logit => (&z, LeafRule::Mean),
                BoostType::Gentle => (&y, LeafRule::Mean),
            };
            let first_node = state.ensemble.nodes.len();
            let root = TreeBuilder::new(
                Problem {
                    x: x.view(),
                    vars: &state.var_idx,
                    n_cats: &n_cats,
                    targets,
                    weights: &w,
                },
                &tree_params,
                leaf,
                &mut state.ensemble,
            )
            .grow(subset);

            let out: Vec<f64> = (0..n)
                .map(|pos| {
                    let row = x.row(pos);
                    state.ensemble.leaf(root, |v| row[v]).value
                })
                .collect();

            match boost_type {
                BoostType::Discrete => {
                    let miss: f64 = (0..n).filter(|&i| out[i] * y[i] < 0.0).map(|i| w[i]).sum();
                    let err = miss.clamp(EPS, 1.0 - EPS);
                    let c = ((1.0 - err) / err).ln();
                    for node in &mut state.ensemble.nodes[first_node..] {
                        node.value *= c;
                    }
                    for i in 0..n {
                        if out[i] * y[i] < 0.0 {
                            w[i] *= c.exp();
                        }
                        f[i] += c * out[i];
                    }
                }
                BoostType::Real | BoostType::Gentle => {
                    for i in 0..n {
                        w[i] *= (-y[i] * out[i]).exp();
                        f[i] += out[i];
                    }
                }
                BoostType::Logit => {
                    for node in &mut state.ensemble.nodes[first_node..] {
                        node.value *= 0.5;
                    }
                    for i in 0..n {
                        f[i] += 0.5 * out[i];
                    }
                    logit_step(&f, &y, &base, &mut w, &mut z);
                }
            }
            if !normalize(&mut w) {
                warn!(round, "Sample weights collapsed, stopping early");
                break;
            }
        }

        info!(
            samples = n,
            vars = state.var_idx.len(),
            trees = state.ensemble.roots.len() - first_tree,
            nodes = state.ensemble.nodes.len(),
            "Boosting finished"
        );
        self.state = Some(state);
        Ok(true)
    }

    fn predict(&self, samples: ArrayView2<f32>, options: PredictOptions) -> Result<Prediction> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| DispatchError::model("the model has not been trained"))?;
        let mode = options.mode()?;
        let expected = if options.compressed_input {
            state.var_idx.len()
        } else {
            state.var_all
        };
        if samples.ncols() != expected {
            return Err(DispatchError::invalid(format!(
                "samples have {} columns, the model expects {expected}",
                samples.ncols()
            )));
        }

        let mut results = Array2::zeros((samples.nrows(), 1));
        let mut row = vec![f32::NAN; state.var_all];
        for (i, sample) in samples.rows().into_iter().enumerate() {
            state.encode_row(sample, &mut row, options.compressed_input, options.preprocessed_input);
            let score = state.score(&row, mode);
            results[[i, 0]] = if options.raw_output {
                score as f32
            } else {
                state.label(score) as f32
            };
        }
        let first = results.get((0, 0)).copied().unwrap_or(0.0);
        Ok(Prediction { results, first })
    }

    fn write(&self) -> Result<Map<String, Json>> {
        let to_json = |v: serde_json::Result<Json>| {
            v.map_err(|e| DispatchError::model(format!("failed to serialize model: {e}")))
        };
        let mut fields = Map::new();
        fields.insert(
            "training_params".to_owned(),
            to_json(serde_json::to_value(&self.params))?,
        );
        if let Some(state) = &self.state {
            fields.insert("model".to_owned(), to_json(serde_json::to_value(state))?);
        }
        Ok(fields)
    }

    fn read(node: &Map<String, Json>) -> Result<Self> {
        let bad = |e: String| DispatchError::Deserialization(e);
        let params: BoostParams = match node.get("training_params") {
            Some(p) => serde_json::from_value(p.clone()).map_err(|e| bad(e.to_string()))?,
            None => BoostParams::default(),
        };
        params.validate().map_err(|e| bad(e.to_string()))?;
        let state = match node.get("model") {
            Some(m) => {
                let state: TrainedState =
                    serde_json::from_value(m.clone()).map_err(|e| bad(e.to_string()))?;
                state.validate().map_err(bad)?;
                Some(state)
            }
            None => None,
        };
        Ok(Self { params, state })
    }
}
