pub mod config;
pub mod data_loader;
pub mod dispatch;
pub mod error;
pub mod flags;
pub mod metrics;
pub mod models;
pub mod persist;
pub mod registry;
pub mod value;

pub use config::Config;
pub use data_loader::{DataSource, TrainData};
pub use dispatch::{Dispatcher, Method, Property, SharedDispatcher};
pub use error::{DispatchError, Result};
pub use models::{Boost, BoostParams, BoostType};
pub use registry::{Handle, Registry};
pub use value::Value;
