//! Error taxonomy for VIRTA
//!
//! Every failure in the engine is one of a fixed set of kinds. The kind
//! determines the blast radius: `Config` refuses engine start,
//! `EndpointStart` and `SourceFatal` fail one route, everything else drops
//! one message and leaves the route running.

use thiserror::Error;

/// Result type alias for VIRTA operations
pub type Result<T> = std::result::Result<T, RouteError>;

/// Main error type for routes, drivers, and processors
#[derive(Error, Debug)]
pub enum RouteError {
    /// Invalid configuration: missing env var, unknown scheme, invalid URI,
    /// unknown processor type. Fatal at startup; the engine refuses to run.
    #[error("configuration error: {0}")]
    Config(String),

    /// A source or sink failed to initialize. The route fails; peers continue.
    #[error("endpoint '{endpoint}' failed to start: {message}")]
    EndpointStart {
        /// URI or scheme of the endpoint that failed
        endpoint: String,
        /// What went wrong
        message: String,
    },

    /// An in-engine processor raised. Drops one message; the route continues.
    #[error("processor '{processor}' failed: {message}")]
    Processing {
        /// Name of the processor stage
        processor: String,
        /// What went wrong
        message: String,
    },

    /// External subprocess exited non-zero. Drops one message.
    #[error("external command exited with code {code}: {stderr}")]
    ExternalProcess {
        /// Exit code of the subprocess (-1 when killed by signal or unspawnable)
        code: i32,
        /// Captured stderr of the subprocess
        stderr: String,
    },

    /// External subprocess exceeded its deadline and was terminated.
    #[error("external command timed out after {timeout_secs}s")]
    ExternalTimeout {
        /// The deadline that was exceeded, in seconds
        timeout_secs: u64,
    },

    /// A sink refused the message or the network failed. Logged and counted
    /// per sink; peer sinks are unaffected.
    #[error("delivery to '{sink}' failed: {message}")]
    Delivery {
        /// Name of the sink
        sink: String,
        /// What went wrong
        message: String,
    },

    /// A source driver returned an unrecoverable error. The route fails.
    #[error("source terminated: {0}")]
    SourceFatal(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouteError {
    /// The coarse kind of this error, used as a metrics label
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouteError::Config(_) => ErrorKind::Config,
            RouteError::EndpointStart { .. } => ErrorKind::EndpointStart,
            RouteError::Processing { .. } => ErrorKind::Processing,
            RouteError::ExternalProcess { .. } => ErrorKind::ExternalProcess,
            RouteError::ExternalTimeout { .. } => ErrorKind::ExternalTimeout,
            RouteError::Delivery { .. } => ErrorKind::Delivery,
            RouteError::SourceFatal(_) => ErrorKind::SourceFatal,
            RouteError::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for a [`RouteError::Processing`] error
    pub fn processing(processor: impl Into<String>, message: impl Into<String>) -> Self {
        RouteError::Processing {
            processor: processor.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`RouteError::Delivery`] error
    pub fn delivery(sink: impl Into<String>, message: impl Into<String>) -> Self {
        RouteError::Delivery {
            sink: sink.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`RouteError::EndpointStart`] error
    pub fn endpoint_start(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        RouteError::EndpointStart {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// Coarse error categories matching [`RouteError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    Config,
    EndpointStart,
    Processing,
    ExternalProcess,
    ExternalTimeout,
    Delivery,
    SourceFatal,
    Io,
}

impl ErrorKind {
    /// Stable lowercase label for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::EndpointStart => "endpoint_start",
            ErrorKind::Processing => "processing",
            ErrorKind::ExternalProcess => "external_process",
            ErrorKind::ExternalTimeout => "external_timeout",
            ErrorKind::Delivery => "delivery",
            ErrorKind::SourceFatal => "source_fatal",
            ErrorKind::Io => "io",
        }
    }
}
