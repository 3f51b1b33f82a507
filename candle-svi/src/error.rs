use thiserror::Error;

/// Errors raised while running or scoring a model/guide pair.
///
/// Apart from [`SviError::Candle`], every variant signals a programming
/// error in the model, the guide or the configuration. None of them is
/// transient, so callers should not retry.
#[derive(Error, Debug)]
pub enum SviError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("model and guide disagree at site \"{site}\": {reason}")]
    ModelGuideMismatch { site: String, reason: String },

    #[error("multiple sites named \"{0}\"")]
    DuplicateSite(String),

    #[error("at site \"{site}\" within plate \"{plate}\", dim collision at {dim}")]
    PlateDimCollision {
        site: String,
        plate: String,
        dim: isize,
    },

    #[error("at site \"{site}\", plate stack overflow: try increasing max_plate_nesting to at least {required}")]
    PlateOverflow { site: String, required: usize },

    #[error("at site \"{site}\", invalid log_pdf shape: expected {expected:?}, actual {actual:?}")]
    InvalidSiteShape {
        site: String,
        expected: Vec<Option<usize>>,
        actual: Vec<usize>,
    },

    #[error("no sample site named \"{0}\"")]
    UnknownSite(String),

    #[error("site \"{0}\" has no computed log density")]
    MissingLogPdf(String),

    #[error("cannot contract a term of shape {from:?} into shape {to:?}")]
    IncompatibleShape { from: Vec<usize>, to: Vec<usize> },

    #[error("cannot contract an empty multi-view tensor")]
    EmptyContraction,

    #[error("unknown parameter \"{0}\"")]
    UnknownParam(String),

    #[error("parameter store lock poisoned")]
    ParamStorePoisoned,
}

pub type Result<T> = std::result::Result<T, SviError>;
