use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(String),

    #[error("{0}: already exists")]
    AlreadyExists(String),

    #[error("{0}: invalid argument")]
    InvalidArgument(String),

    #[error("{0}: no buffer space available")]
    ResourceExhausted(String),

    #[error("core {0} is not enabled for workers")]
    InvalidCore(u16),

    #[error("core {0} is already used by another stage")]
    CoreConflict(u16),

    #[error("{op} failed on device: error {code}")]
    Device { op: &'static str, code: i32 },

    #[error("{op} failed on event device: error {code}")]
    EventDev { op: &'static str, code: i32 },

    /// A node instance has no registered context. This is an assembly bug,
    /// never a runtime condition.
    #[error("node {0} has no registered context")]
    Wiring(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap_file::PcapError),
}

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const ENODEV: i32 = 19;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;
pub const ENOBUFS: i32 = 105;

impl Error {
    /// Negative errno equivalent, as reported over the control channel.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => -ENOENT,
            Error::AlreadyExists(_) | Error::CoreConflict(_) => -EEXIST,
            Error::InvalidArgument(_) | Error::InvalidCore(_) => -EINVAL,
            Error::ResourceExhausted(_) => -ENOBUFS,
            Error::Device { code, .. } | Error::EventDev { code, .. } => *code,
            Error::Wiring(_) => -EPERM,
            Error::Io(e) => -e.raw_os_error().unwrap_or(EIO),
            Error::Json(_) => -EINVAL,
            Error::Pcap(_) => -EIO,
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Error::NotFound(name.into())
    }

    pub fn exists(name: impl Into<String>) -> Self {
        Error::AlreadyExists(name.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Error::InvalidArgument(what.into())
    }

    pub fn exhausted(what: impl Into<String>) -> Self {
        Error::ResourceExhausted(what.into())
    }
}
