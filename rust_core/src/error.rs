//! Error types shared by every stage of the pipeline.

use thiserror::Error;

/// Errors raised while building, sampling or predicting with a model.
#[derive(Debug, Error)]
pub enum BnnError {
    /// No splitting rule is registered for this network topology.
    #[error("unsupported network topology: {0}")]
    UnsupportedTopology(String),

    /// A pretrained-centered prior was requested for a parameter the
    /// pretrained dictionary does not contain.
    #[error("no pretrained value for `{layer}.{param}`")]
    MissingPretrained { layer: String, param: String },

    /// Feature widths of consecutive layers (or of data and first layer) disagree.
    #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    /// The stochastic boundary does not describe a valid split.
    #[error("invalid stochastic boundary: {0}")]
    InvalidBoundary(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported device `{0}`")]
    UnsupportedDevice(String),

    /// `X` and `y` have different row counts.
    #[error("row count mismatch: X has {x_rows} rows, y has {y_rows}")]
    RowMismatch { x_rows: usize, y_rows: usize },

    #[error("invalid shape for {what}: expected {expected}, got {got:?}")]
    InvalidShape {
        what: String,
        expected: String,
        got: Vec<usize>,
    },

    /// The model log-density is not finite at the chosen initial point.
    #[error("model cannot be evaluated at the initial point of chain {chain}: {reason}")]
    InitialPoint { chain: usize, reason: String },

    #[error("model has not been fitted yet")]
    NotFitted,

    #[error("unknown sample site `{0}`")]
    UnknownSite(String),

    #[error("unknown extra field `{0}`")]
    UnknownExtraField(String),

    /// A prediction batch references a task with no trained noise entry.
    #[error("task {task} was not present when the model was fitted (known tasks: {known:?})")]
    UnseenTask { task: i64, known: Vec<i64> },

    #[error("matrix is not positive definite at pivot {pivot}")]
    NotPositiveDefinite { pivot: usize },

    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BnnError>;

impl BnnError {
    pub(crate) fn shape(what: impl Into<String>, expected: impl Into<String>, got: &[usize]) -> Self {
        BnnError::InvalidShape {
            what: what.into(),
            expected: expected.into(),
            got: got.to_vec(),
        }
    }

    /// True for errors that indicate a malformed model rather than bad data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BnnError::UnsupportedTopology(_)
                | BnnError::MissingPretrained { .. }
                | BnnError::DimensionMismatch { .. }
                | BnnError::InvalidBoundary(_)
                | BnnError::InvalidConfig(_)
                | BnnError::UnsupportedDevice(_)
                | BnnError::Config(_)
                | BnnError::ConfigWrite(_)
        )
    }
}
