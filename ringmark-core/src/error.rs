use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingmarkError {
    #[error("failure detected: {0}")]
    Generic(String),

    #[error("runtime call failed with code {code}: {description}")]
    RuntimeCall { code: i32, description: String },

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("invalid argument for {field}: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("check failed: {check}")]
    CheckFailed { check: String },

    #[error("'{operation}' blocked past the {deadline_secs} s deadline")]
    HangTimeout {
        operation: String,
        deadline_secs: u64,
    },

    #[error("fatal signal {signal} observed")]
    FatalSignal { signal: i32 },

    #[error("probe '{probe}' failed with fail code {code}")]
    ProbeFailed { probe: String, code: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RingmarkResult<T> = std::result::Result<T, RingmarkError>;

impl From<crate::runtime::CommError> for RingmarkError {
    fn from(err: crate::runtime::CommError) -> Self {
        RingmarkError::RuntimeCall {
            code: err.code(),
            description: err.description().to_string(),
        }
    }
}
