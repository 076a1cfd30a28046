use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Profiler is already enabled; pass force to restart it")]
    AlreadyEnabled,

    #[error("Profiler is not enabled")]
    AlreadyDisabled,

    #[error("{0}. Preload the shim: LD_PRELOAD=liballoctrace_preload.so")]
    ResourceUnavailable(String),

    #[error("Emergency dump already ran in this process")]
    EmergencyDumpAlreadyRan,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors on the hook path are never surfaced to the host; everything
    /// else is an operator error and gets reported synchronously.
    pub fn is_operator_error(&self) -> bool {
        !matches!(self, Error::EmergencyDumpAlreadyRan)
    }
}
