//! Immutable flag/segment configuration records.
//!
//! Records are replaced whole by the data source; the evaluator only ever
//! reads them. Each record carries an optional preprocessed cache computed
//! once after deserialization (see [preprocess]).

pub mod flag;
pub mod preprocess;
pub mod segment;

pub use flag::{
    Flag, FlagRule, Prerequisite, Rollout, RolloutKind, Target, VariationOrRollout,
    WeightedVariation,
};
pub use flag::{Clause, Operator};
pub use segment::{Segment, SegmentRule, SegmentTarget};
