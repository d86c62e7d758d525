//! Command dispatcher.
//!
//! A request is `(handle, method, positional..., name/value pairs...)` plus
//! the number of requested outputs. Method names, property names and option
//! names are parsed into closed enums and typed structs before anything is
//! looked up or mutated, so a malformed request never executes partially.

use ndarray::Array2;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument};

use crate::data_loader::{option_pairs, DataSource};
use crate::error::{DispatchError, Result};
use crate::flags::{PredictOptions, TrainFlags};
use crate::models::{
    Boost, BoostParams, BoostType, ModelFactory, Node, Split, StatModel, MAX_TREE_DEPTH,
};
use crate::persist;
use crate::registry::{Handle, Registry};
use crate::value::{Record, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    New,
    Delete,
    Clear,
    Load,
    Save,
    Empty,
    IsTrained,
    IsClassifier,
    GetVarCount,
    GetDefaultName,
    Train,
    CalcError,
    Predict,
    GetNodes,
    GetRoots,
    GetSplits,
    GetSubsets,
    Get,
    Set,
}

impl Method {
    pub const ALL: [Method; 19] = [
        Self::New,
        Self::Delete,
        Self::Clear,
        Self::Load,
        Self::Save,
        Self::Empty,
        Self::IsTrained,
        Self::IsClassifier,
        Self::GetVarCount,
        Self::GetDefaultName,
        Self::Train,
        Self::CalcError,
        Self::Predict,
        Self::GetNodes,
        Self::GetRoots,
        Self::GetSplits,
        Self::GetSubsets,
        Self::Get,
        Self::Set,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Delete => "delete",
            Self::Clear => "clear",
            Self::Load => "load",
            Self::Save => "save",
            Self::Empty => "empty",
            Self::IsTrained => "isTrained",
            Self::IsClassifier => "isClassifier",
            Self::GetVarCount => "getVarCount",
            Self::GetDefaultName => "getDefaultName",
            Self::Train => "train",
            Self::CalcError => "calcError",
            Self::Predict => "predict",
            Self::GetNodes => "getNodes",
            Self::GetRoots => "getRoots",
            Self::GetSplits => "getSplits",
            Self::GetSubsets => "getSubsets",
            Self::Get => "get",
            Self::Set => "set",
        }
    }

    /// `nrhs` counts every input including handle and method name, `nlhs`
    /// the requested outputs.
    pub fn check_arity(self, nrhs: usize, nlhs: usize) -> Result<()> {
        let odd = nrhs % 2 == 1;
        let ok = match self {
            Self::New => nrhs == 2 && nlhs <= 1,
            Self::Delete | Self::Clear => nrhs == 2 && nlhs == 0,
            Self::Load => nrhs >= 3 && odd && nlhs == 0,
            Self::Save => nrhs == 3 && nlhs <= 1,
            Self::Empty
            | Self::IsTrained
            | Self::IsClassifier
            | Self::GetVarCount
            | Self::GetDefaultName
            | Self::GetNodes
            | Self::GetRoots
            | Self::GetSplits
            | Self::GetSubsets => nrhs == 2 && nlhs <= 1,
            Self::Train => nrhs >= 4 && !odd && nlhs <= 1,
            Self::CalcError => nrhs >= 4 && !odd && nlhs <= 2,
            Self::Predict => nrhs >= 3 && odd && nlhs <= 2,
            Self::Get => nrhs == 3 && nlhs <= 1,
            Self::Set => nrhs == 4 && nlhs == 0,
        };
        if ok {
            Ok(())
        } else {
            Err(DispatchError::Arity(format!(
                "{} called with {nrhs} inputs and {nlhs} outputs",
                self.name()
            )))
        }
    }
}

impl FromStr for Method {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| DispatchError::UnknownMethod(s.to_owned()))
    }
}

/// Hyperparameters reachable through `get`/`set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    CVFolds,
    MaxCategories,
    MaxDepth,
    MinSampleCount,
    Priors,
    RegressionAccuracy,
    TruncatePrunedTree,
    Use1SERule,
    UseSurrogates,
    BoostType,
    WeakCount,
    WeightTrimRate,
}

impl Property {
    pub const ALL: [Property; 12] = [
        Self::CVFolds,
        Self::MaxCategories,
        Self::MaxDepth,
        Self::MinSampleCount,
        Self::Priors,
        Self::RegressionAccuracy,
        Self::TruncatePrunedTree,
        Self::Use1SERule,
        Self::UseSurrogates,
        Self::BoostType,
        Self::WeakCount,
        Self::WeightTrimRate,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CVFolds => "CVFolds",
            Self::MaxCategories => "MaxCategories",
            Self::MaxDepth => "MaxDepth",
            Self::MinSampleCount => "MinSampleCount",
            Self::Priors => "Priors",
            Self::RegressionAccuracy => "RegressionAccuracy",
            Self::TruncatePrunedTree => "TruncatePrunedTree",
            Self::Use1SERule => "Use1SERule",
            Self::UseSurrogates => "UseSurrogates",
            Self::BoostType => "BoostType",
            Self::WeakCount => "WeakCount",
            Self::WeightTrimRate => "WeightTrimRate",
        }
    }

    pub fn get(self, params: &BoostParams) -> Value {
        match self {
            Self::CVFolds => Value::from(params.cv_folds),
            Self::MaxCategories => Value::from(params.max_categories),
            Self::MaxDepth => Value::from(params.max_depth),
            Self::MinSampleCount => Value::from(params.min_sample_count),
            Self::Priors if params.priors.is_empty() => Value::Single(Array2::zeros((0, 0))),
            Self::Priors => Value::Single(Array2::from_shape_fn((1, params.priors.len()), |(_, j)| {
                params.priors[j]
            })),
            Self::RegressionAccuracy => Value::from(params.regression_accuracy),
            Self::TruncatePrunedTree => Value::from(params.truncate_pruned_tree),
            Self::Use1SERule => Value::from(params.use_1se_rule),
            Self::UseSurrogates => Value::from(params.use_surrogates),
            Self::BoostType => Value::from(params.boost_type.name()),
            Self::WeakCount => Value::from(params.weak_count),
            Self::WeightTrimRate => Value::from(params.weight_trim_rate),
        }
    }

    /// Converts `value` and stores it; range checks happen in
    /// [`BoostParams::validate`]. `MaxDepth` is clamped to
    /// [`MAX_TREE_DEPTH`] and `BoostType` takes a name or its 0..3 code.
    pub fn set(self, params: &mut BoostParams, value: &Value) -> Result<()> {
        match self {
            Self::CVFolds => params.cv_folds = value.to_i32()?,
            Self::MaxCategories => params.max_categories = value.to_i32()?,
            Self::MaxDepth => params.max_depth = value.to_i32()?.min(MAX_TREE_DEPTH),
            Self::MinSampleCount => params.min_sample_count = value.to_i32()?,
            Self::Priors => params.priors = value.to_f32_vec()?,
            Self::RegressionAccuracy => params.regression_accuracy = value.to_f64()?,
            Self::TruncatePrunedTree => params.truncate_pruned_tree = value.to_bool()?,
            Self::Use1SERule => params.use_1se_rule = value.to_bool()?,
            Self::UseSurrogates => params.use_surrogates = value.to_bool()?,
            Self::BoostType if value.is_text() => {
                params.boost_type = value.as_text()?.parse::<BoostType>()?
            }
            Self::BoostType => {
                let code = value.to_i32()?;
                params.boost_type = BoostType::from_code(code)
                    .ok_or_else(|| DispatchError::invalid(format!("unknown BoostType code {code}")))?
            }
            Self::WeakCount => params.weak_count = value.to_i32()?,
            Self::WeightTrimRate => params.weight_trim_rate = value.to_f64()?,
        }
        Ok(())
    }
}

impl FromStr for Property {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| DispatchError::UnknownProperty(s.to_owned()))
    }
}

/// A fully validated request body.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    New,
    Delete,
    Clear,
    Load {
        source: String,
        from_string: bool,
        obj_name: String,
    },
    Save {
        path: String,
        to_memory: bool,
    },
    Empty,
    IsTrained,
    IsClassifier,
    GetVarCount,
    GetDefaultName,
    Train {
        data: DataSource,
        flags: TrainFlags,
    },
    CalcError {
        data: DataSource,
        test: bool,
        want_responses: bool,
    },
    Predict {
        samples: Array2<f32>,
        options: PredictOptions,
        want_first: bool,
    },
    GetNodes,
    GetRoots,
    GetSplits,
    GetSubsets,
    Get(Property),
    Set(Property, Value),
}

impl Command {
    /// `args` are the inputs after handle and method name; arity has been
    /// checked already.
    fn parse(method: Method, args: &[Value], nlhs: usize) -> Result<Self> {
        Ok(match method {
            Method::New => Self::New,
            Method::Delete => Self::Delete,
            Method::Clear => Self::Clear,
            Method::Load => {
                let mut obj_name = String::new();
                let mut from_string = false;
                for (key, value) in option_pairs(&args[1..])? {
                    match key {
                        "ObjName" => obj_name = value.as_text()?.to_owned(),
                        "FromString" => from_string = value.to_bool()?,
                        _ => return Err(DispatchError::UnknownOption(key.to_owned())),
                    }
                }
                Self::Load {
                    source: args[0].as_text()?.to_owned(),
                    from_string,
                    obj_name,
                }
            }
            Method::Save => Self::Save {
                path: args[0].as_text()?.to_owned(),
                to_memory: nlhs > 0,
            },
            Method::Empty => Self::Empty,
            Method::IsTrained => Self::IsTrained,
            Method::IsClassifier => Self::IsClassifier,
            Method::GetVarCount => Self::GetVarCount,
            Method::GetDefaultName => Self::GetDefaultName,
            Method::Train => {
                let mut data_options: &[Value] = &[];
                let mut flags = TrainFlags::default();
                for (key, value) in option_pairs(&args[2..])? {
                    match key {
                        "Data" => data_options = value.as_cell()?,
                        "Flags" => flags = TrainFlags::from_bits(value.to_i32()?),
                        "RawOutput" => flags.update_model = value.to_bool()?,
                        "CompressedInput" => flags.compressed_input = value.to_bool()?,
                        "PredictSum" => flags.predict_sum = value.to_bool()?,
                        "PredictMaxVote" => flags.predict_max_vote = value.to_bool()?,
                        _ => return Err(DispatchError::UnknownOption(key.to_owned())),
                    }
                }
                Self::Train {
                    data: DataSource::from_args(&args[0], &args[1], data_options)?,
                    flags,
                }
            }
            Method::CalcError => {
                let mut data_options: &[Value] = &[];
                let mut test = false;
                for (key, value) in option_pairs(&args[2..])? {
                    match key {
                        "Data" => data_options = value.as_cell()?,
                        "TestError" => test = value.to_bool()?,
                        _ => return Err(DispatchError::UnknownOption(key.to_owned())),
                    }
                }
                Self::CalcError {
                    data: DataSource::from_args(&args[0], &args[1], data_options)?,
                    test,
                    want_responses: nlhs > 1,
                }
            }
            Method::Predict => {
                let mut options = PredictOptions::default();
                for (key, value) in option_pairs(&args[1..])? {
                    match key {
                        "Flags" => options = PredictOptions::from_bits(value.to_i32()?),
                        "RawOutput" => options.raw_output = value.to_bool()?,
                        "CompressedInput" => options.compressed_input = value.to_bool()?,
                        "PreprocessedInput" => options.preprocessed_input = value.to_bool()?,
                        "PredictAuto" => options.apply_predict_auto(value.to_bool()?),
                        "PredictSum" => options.predict_sum = value.to_bool()?,
                        "PredictMaxVote" => options.predict_max_vote = value.to_bool()?,
                        _ => return Err(DispatchError::UnknownOption(key.to_owned())),
                    }
                }
                options.mode()?;
                Self::Predict {
                    samples: args[0].to_single()?,
                    options,
                    want_first: nlhs > 1,
                }
            }
            Method::GetNodes => Self::GetNodes,
            Method::GetRoots => Self::GetRoots,
            Method::GetSplits => Self::GetSplits,
            Method::GetSubsets => Self::GetSubsets,
            Method::Get => Self::Get(args[0].as_text()?.parse()?),
            Method::Set => Self::Set(args[0].as_text()?.parse()?, args[1].clone()),
        })
    }
}

fn node_records(nodes: &[Node]) -> Value {
    Value::Struct(
        nodes
            .iter()
            .map(|n| -> Record {
                vec![
                    ("value".to_owned(), Value::from(n.value)),
                    ("classIdx".to_owned(), Value::from(n.class_idx)),
                    ("parent".to_owned(), Value::from(n.parent)),
                    ("left".to_owned(), Value::from(n.left)),
                    ("right".to_owned(), Value::from(n.right)),
                    ("defaultDir".to_owned(), Value::from(n.default_dir)),
                    ("split".to_owned(), Value::from(n.split)),
                ]
            })
            .collect(),
    )
}

fn split_records(splits: &[Split]) -> Value {
    Value::Struct(
        splits
            .iter()
            .map(|s| -> Record {
                vec![
                    ("varIdx".to_owned(), Value::from(s.var_idx)),
                    ("inversed".to_owned(), Value::from(s.inversed)),
                    ("quality".to_owned(), Value::from(s.quality)),
                    ("next".to_owned(), Value::from(s.next)),
                    ("c".to_owned(), Value::from(s.c)),
                    ("subsetOfs".to_owned(), Value::from(s.subset_ofs)),
                ]
            })
            .collect(),
    )
}

fn int_column(values: &[i32]) -> Value {
    Value::Int32(Array2::from_shape_fn((values.len(), 1), |(i, _)| values[i]))
}

/// Owns the model registry and executes requests against it.
#[derive(Debug, Default)]
pub struct Dispatcher {
    registry: Registry<Boost>,
    defaults: BoostParams,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `new` model starts from `defaults`.
    pub fn with_defaults(defaults: BoostParams) -> Result<Self> {
        defaults.validate()?;
        Ok(Self {
            registry: Registry::new(),
            defaults,
        })
    }

    pub fn registry(&self) -> &Registry<Boost> {
        &self.registry
    }

    /// Executes one request. `rhs` starts with the handle and the method
    /// name; `nargout` is the number of outputs the caller asks for.
    #[instrument(skip_all, fields(method = tracing::field::Empty))]
    pub fn call(&mut self, rhs: &[Value], nargout: usize) -> Result<Vec<Value>> {
        if rhs.len() < 2 || nargout > 2 {
            return Err(DispatchError::Arity(format!(
                "expected at least 2 inputs and at most 2 outputs, got {} and {nargout}",
                rhs.len()
            )));
        }
        let method: Method = rhs[1].as_text()?.parse()?;
        tracing::Span::current().record("method", method.name());
        method.check_arity(rhs.len(), nargout)?;
        let command = Command::parse(method, &rhs[2..], nargout)?;
        debug!(nrhs = rhs.len(), nargout, "Dispatching");
        self.execute(&rhs[0], command)
    }

    /// Resolves the handle argument to a live entry.
    fn handle(&self, target: &Value) -> Result<Handle> {
        let handle = Handle::from_raw(target.to_int()?)?;
        self.registry.resolve(handle)?;
        Ok(handle)
    }

    fn model(&self, target: &Value) -> Result<&Boost> {
        self.registry.resolve(self.handle(target)?)
    }

    fn model_mut(&mut self, target: &Value) -> Result<&mut Boost> {
        let handle = self.handle(target)?;
        self.registry.resolve_mut(handle)
    }

    fn execute(&mut self, target: &Value, command: Command) -> Result<Vec<Value>> {
        let outputs = match command {
            Command::New => {
                let handle = self.registry.create(Boost::create(&self.defaults));
                info!(%handle, "Created model");
                vec![Value::Int(handle.id() as i64)]
            }
            Command::Delete => {
                let handle = self.handle(target)?;
                self.registry.destroy(handle)?;
                info!(%handle, "Deleted model");
                vec![]
            }
            Command::Clear => {
                self.model_mut(target)?.clear();
                vec![]
            }
            Command::Load {
                source,
                from_string,
                obj_name,
            } => {
                let handle = self.handle(target)?;
                let model: Boost = if from_string {
                    persist::from_str(&source, &obj_name)?
                } else {
                    persist::load(&source, &obj_name)?
                };
                self.registry.replace(handle, model)?;
                info!(%handle, from_string, "Loaded model");
                vec![]
            }
            Command::Save { path, to_memory } => {
                let model = self.model(target)?;
                if to_memory {
                    vec![Value::Text(persist::to_string(model)?)]
                } else {
                    persist::save(model, &path)?;
                    vec![]
                }
            }
            Command::Empty => vec![Value::from(self.model(target)?.empty())],
            Command::IsTrained => vec![Value::from(self.model(target)?.is_trained())],
            Command::IsClassifier => vec![Value::from(self.model(target)?.is_classifier())],
            Command::GetVarCount => vec![Value::Int(self.model(target)?.var_count() as i64)],
            Command::GetDefaultName => vec![Value::from(self.model(target)?.default_name())],
            Command::Train { data, flags } => {
                let handle = self.handle(target)?;
                let data = data.build()?;
                let trained = self.registry.resolve_mut(handle)?.train(&data, flags)?;
                info!(%handle, trained, "Trained model");
                vec![Value::from(trained)]
            }
            Command::CalcError {
                data,
                test,
                want_responses,
            } => {
                let handle = self.handle(target)?;
                let data = data.build()?;
                let (err, responses) = self.registry.resolve(handle)?.calc_error(&data, test)?;
                let mut out = vec![Value::from(err)];
                if want_responses {
                    out.push(Value::Single(responses));
                }
                out
            }
            Command::Predict {
                samples,
                options,
                want_first,
            } => {
                let prediction = self.model(target)?.predict(samples.view(), options)?;
                let mut out = vec![Value::Single(prediction.results)];
                if want_first {
                    out.push(Value::from(prediction.first));
                }
                out
            }
            Command::GetNodes => vec![node_records(self.model(target)?.nodes())],
            Command::GetRoots => vec![int_column(self.model(target)?.roots())],
            Command::GetSplits => vec![split_records(self.model(target)?.splits())],
            Command::GetSubsets => vec![int_column(self.model(target)?.subsets())],
            Command::Get(property) => vec![property.get(self.model(target)?.params())],
            Command::Set(property, value) => {
                let model = self.model_mut(target)?;
                let mut params = model.params().clone();
                property.set(&mut params, &value)?;
                model.set_params(params)?;
                vec![]
            }
        };
        Ok(outputs)
    }
}

/// A dispatcher behind one lock, for hosts that call from several threads.
/// Each request holds the lock for its whole duration.
#[derive(Debug, Clone, Default)]
pub struct SharedDispatcher {
    inner: Arc<Mutex<Dispatcher>>,
}

impl SharedDispatcher {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            inner: Arc::new(Mutex::new(dispatcher)),
        }
    }

    pub fn call(&self, rhs: &[Value], nargout: usize) -> Result<Vec<Value>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .call(rhs, nargout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_model(d: &mut Dispatcher) -> Value {
        d.call(&[Value::from(0), Value::from("new")], 1).unwrap().remove(0)
    }

    #[test]
    fn test_method_names_round_trip() {
        for m in Method::ALL {
            assert_eq!(m.name().parse::<Method>().unwrap(), m);
        }
        for p in Property::ALL {
            assert_eq!(p.name().parse::<Property>().unwrap(), p);
        }
    }

    #[test]
    fn test_unknown_method() {
        let mut d = Dispatcher::new();
        let h = new_model(&mut d);
        let err = d.call(&[h, Value::from("fit")], 0).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownMethod(ref m) if m == "fit"));
    }

    #[test]
    fn test_arity_is_checked_before_handle() {
        let mut d = Dispatcher::new();
        // handle 42 does not exist, but the arity error wins
        let err = d.call(&[Value::from(42), Value::from("delete")], 1).unwrap_err();
        assert!(matches!(err, DispatchError::Arity(_)));
        let err = d.call(&[Value::from(42), Value::from("predict"), Value::Empty, Value::from("Flags")], 1);
        assert!(matches!(err, Err(DispatchError::Arity(_))));
        let err = d.call(&[Value::from(42)], 0).unwrap_err();
        assert!(matches!(err, DispatchError::Arity(_)));
    }

    #[test]
    fn test_property_defaults() {
        let mut d = Dispatcher::new();
        let h = new_model(&mut d);
        let get = |d: &mut Dispatcher, name: &str| {
            d.call(&[h.clone(), Value::from("get"), Value::from(name)], 1).unwrap().remove(0)
        };
        assert_eq!(get(&mut d, "BoostType"), Value::from("Real"));
        assert_eq!(get(&mut d, "WeakCount"), Value::Int(100));
        assert_eq!(get(&mut d, "WeightTrimRate"), Value::Float(0.95));
        assert_eq!(get(&mut d, "MaxDepth"), Value::Int(1));
        assert_eq!(get(&mut d, "Priors"), Value::Single(Array2::zeros((0, 0))));
    }

    #[test]
    fn test_invalid_value_leaves_params_untouched() {
        let mut d = Dispatcher::new();
        let h = new_model(&mut d);
        let err = d
            .call(&[h.clone(), Value::from("set"), Value::from("MaxCategories"), Value::from(1)], 0)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
        let err = d
            .call(&[h.clone(), Value::from("set"), Value::from("BoostType"), Value::from("Adaptive")], 0)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));

        let out = d.call(&[h.clone(), Value::from("get"), Value::from("MaxCategories")], 1).unwrap();
        assert_eq!(out, vec![Value::Int(10)]);
        let out = d.call(&[h, Value::from("get"), Value::from("BoostType")], 1).unwrap();
        assert_eq!(out, vec![Value::from("Real")]);
    }

    #[test]
    fn test_boost_type_accepts_codes() {
        let mut d = Dispatcher::new();
        let h = new_model(&mut d);
        d.call(&[h.clone(), Value::from("set"), Value::from("BoostType"), Value::from(3)], 0)
            .unwrap();
        let out = d.call(&[h.clone(), Value::from("get"), Value::from("BoostType")], 1).unwrap();
        assert_eq!(out, vec![Value::from("Gentle")]);

        let err = d
            .call(&[h.clone(), Value::from("set"), Value::from("BoostType"), Value::from(4)], 0)
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
        let out = d.call(&[h, Value::from("get"), Value::from("BoostType")], 1).unwrap();
        assert_eq!(out, vec![Value::from("Gentle")]);
    }

    #[test]
    fn test_defaults_apply_to_new_models() {
        let defaults = BoostParams {
            boost_type: BoostType::Discrete,
            ..BoostParams::default()
        };
        let mut d = Dispatcher::with_defaults(defaults).unwrap();
        let h = new_model(&mut d);
        let out = d.call(&[h, Value::from("get"), Value::from("BoostType")], 1).unwrap();
        assert_eq!(out, vec![Value::from("Discrete")]);

        let bad = BoostParams {
            weak_count: 0,
            ..BoostParams::default()
        };
        assert!(Dispatcher::with_defaults(bad).is_err());
    }
}
