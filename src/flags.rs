//! Typed train/predict options.
//!
//! The host protocol speaks in library bit masks (`Flags`) and named boolean
//! toggles. Both are folded into the structs below; bits are only read by
//! `from_bits`.

use crate::error::{DispatchError, Result};

pub const RAW_OUTPUT: i32 = 1;
/// Shares its bit with [`RAW_OUTPUT`]; meaningful only when training.
pub const UPDATE_MODEL: i32 = 1;
pub const COMPRESSED_INPUT: i32 = 2;
pub const PREPROCESSED_INPUT: i32 = 4;
pub const PREDICT_SUM: i32 = 1 << 8;
pub const PREDICT_MAX_VOTE: i32 = 2 << 8;

fn bit(flags: i32, mask: i32) -> bool {
    flags & mask != 0
}

/// Options accepted by `train`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainFlags {
    /// Keep the current ensemble and append new weak learners to it.
    pub update_model: bool,
    pub compressed_input: bool,
    pub predict_sum: bool,
    pub predict_max_vote: bool,
}

impl TrainFlags {
    pub fn from_bits(flags: i32) -> Self {
        Self {
            update_model: bit(flags, UPDATE_MODEL),
            compressed_input: bit(flags, COMPRESSED_INPUT),
            predict_sum: bit(flags, PREDICT_SUM),
            predict_max_vote: bit(flags, PREDICT_MAX_VOTE),
        }
    }
}

/// How weak-learner outputs are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictMode {
    Auto,
    Sum,
    MaxVote,
}

/// Options accepted by `predict`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictOptions {
    pub raw_output: bool,
    pub compressed_input: bool,
    pub preprocessed_input: bool,
    pub predict_sum: bool,
    pub predict_max_vote: bool,
}

impl PredictOptions {
    pub fn from_bits(flags: i32) -> Self {
        Self {
            raw_output: bit(flags, RAW_OUTPUT),
            compressed_input: bit(flags, COMPRESSED_INPUT),
            preprocessed_input: bit(flags, PREPROCESSED_INPUT),
            predict_sum: bit(flags, PREDICT_SUM),
            predict_max_vote: bit(flags, PREDICT_MAX_VOTE),
        }
    }

    /// `PredictAuto=auto` sets both combination bits to `!auto`.
    pub fn apply_predict_auto(&mut self, auto: bool) {
        self.predict_sum = !auto;
        self.predict_max_vote = !auto;
    }

    pub fn mode(&self) -> Result<PredictMode> {
        match (self.predict_sum, self.predict_max_vote) {
            (false, false) => Ok(PredictMode::Auto),
            (true, false) => Ok(PredictMode::Sum),
            (false, true) => Ok(PredictMode::MaxVote),
            (true, true) => Err(DispatchError::invalid(
                "PredictSum and PredictMaxVote are mutually exclusive",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_bits() {
        let opts = PredictOptions::from_bits(RAW_OUTPUT | PREDICT_MAX_VOTE);
        assert!(opts.raw_output);
        assert!(opts.predict_max_vote);
        assert!(!opts.predict_sum);
        assert!(!opts.compressed_input);
        assert_eq!(opts.mode().unwrap(), PredictMode::MaxVote);
    }

    #[test]
    fn test_predict_auto_clears_both() {
        let mut opts = PredictOptions::from_bits(PREDICT_SUM);
        opts.apply_predict_auto(true);
        assert_eq!(opts, PredictOptions::default());
        assert_eq!(opts.mode().unwrap(), PredictMode::Auto);

        opts.apply_predict_auto(false);
        assert!(opts.mode().is_err());
    }

    #[test]
    fn test_train_update_model_shares_raw_output_bit() {
        let flags = TrainFlags::from_bits(RAW_OUTPUT | COMPRESSED_INPUT);
        assert!(flags.update_model);
        assert!(flags.compressed_input);
        assert!(!flags.predict_sum);
    }
}
