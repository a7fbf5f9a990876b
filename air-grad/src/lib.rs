pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_moving_average;
pub mod candle_toy_model;
pub mod cli;
pub mod estimator;

pub use candle_core;
pub use candle_nn;
