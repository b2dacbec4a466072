use thiserror::Error;

/// Errors raised while binning, smoothing, combining or correcting slices.
///
/// Division by a zero normalization is not an error: it yields `NaN` in the
/// affected bin and every later stage carries the `NaN` along.
#[derive(Debug, Error)]
pub enum SliceError {
    /// Missing or malformed input: undefined flipping ratio, bad range or
    /// symmetry string, dimensionality mismatch, unknown correction name.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A referenced artifact is neither in memory nor on disk.
    #[error("not found: {0}")]
    NotFound(String),
    /// Histograms that have to be combined disagree in shape, or a numeric
    /// input makes the algebra undefined.
    #[error("computation error: {0}")]
    Computation(String),
    /// Another job is already writing the named output.
    #[error("output '{0}' is already being computed")]
    Busy(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode artifact: {0}")]
    Decode(String),
}

impl SliceError {
    pub fn config(msg: impl Into<String>) -> Self {
        SliceError::Configuration(msg.into())
    }

    pub fn computation(msg: impl Into<String>) -> Self {
        SliceError::Computation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SliceError>;
