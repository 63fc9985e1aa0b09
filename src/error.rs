pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("construction error: {0}")]
    Construction(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device mismatch: expected {expected}, found {found}")]
    DeviceMismatch { expected: String, found: String },

    #[error("topology violation: {0}")]
    TopologyViolation(String),

    #[error("parameter update error: {0}")]
    ParameterUpdate(String),

    #[error("device runtime error: {0}")]
    RuntimeLaunch(String),

    #[error("task `{task}` failed: {message}")]
    HostTask { task: String, message: String },

    #[error("run cancelled before all nodes were dispatched")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl Error {
    pub fn construction<S: Into<String>>(msg: S) -> Self {
        Error::Construction(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn device_mismatch(expected: impl ToString, found: impl ToString) -> Self {
        Error::DeviceMismatch {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub fn topology<S: Into<String>>(msg: S) -> Self {
        Error::TopologyViolation(msg.into())
    }

    pub fn parameter_update<S: Into<String>>(msg: S) -> Self {
        Error::ParameterUpdate(msg.into())
    }

    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        Error::RuntimeLaunch(msg.into())
    }

    pub fn host_task<T: Into<String>, S: Into<String>>(task: T, message: S) -> Self {
        Error::HostTask {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Error::Executor(msg.into())
    }

    pub fn telemetry<S: Into<String>>(msg: S) -> Self {
        Error::Telemetry(msg.into())
    }
}
