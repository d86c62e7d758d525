pub mod boost;
pub mod traits;
pub mod tree;

pub use boost::{Boost, BoostParams, BoostType, TrainedState, MAX_TREE_DEPTH};
pub use traits::{ModelFactory, Prediction, StatModel};
pub use tree::{Forest, Node, Split};
