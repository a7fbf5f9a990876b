use std::fmt;

/// Result of every estimator operation
pub type Result<T> = std::result::Result<T, EstimatorError>;

/// Failures raised while building or running a training step.
///
/// Tensor failures from candle travel in `Candle`, so `?` works on any
/// candle call while the estimator's own variants stay matchable.
#[derive(Debug)]
pub enum EstimatorError {
    /// A per-sample tensor does not have one of the allowed shapes
    ShapeContractViolation {
        what: &'static str,
        expected: String,
        got: Vec<usize>,
    },
    /// The host model is missing or mis-reports a required quantity
    MisconfiguredHost(String),
    /// Declared estimator variant without an implementation
    Unimplemented(&'static str),
    Candle(candle_core::Error),
}

impl fmt::Display for EstimatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeContractViolation {
                what,
                expected,
                got,
            } => write!(f, "{}: expected shape {}, got {:?}", what, expected, got),
            Self::MisconfiguredHost(msg) => write!(f, "misconfigured host: {}", msg),
            Self::Unimplemented(name) => write!(f, "{} is not implemented", name),
            Self::Candle(e) => write!(f, "candle error: {}", e),
        }
    }
}

impl std::error::Error for EstimatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Candle(e) => Some(e),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for EstimatorError {
    fn from(err: candle_core::Error) -> Self {
        Self::Candle(err)
    }
}
