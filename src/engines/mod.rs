//! Engines that drive a network over a data loader.

mod evaluator;

pub use evaluator::{
    EngineState, IMAGE_KEY, PRED_KEY, SupervisedEvaluator, SupervisedEvaluatorBuilder,
};
