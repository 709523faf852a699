//! Error types for media-bridge.
//!
//! Errors are split by failure domain:
//! - **External tools** ([`ExecError`], [`OutputError`], [`PipelineError`]): a
//!   helper process failed, timed out, or is not installed
//! - **Source operations** ([`SourceError`]): the success/failure result every
//!   [`AudioSource`](crate::AudioSource) call returns
//! - **Mixer and commands** ([`MixerError`], [`CommandError`]): invalid input and
//!   routed failures; these are logged by callers, never fatal
//! - **Startup** ([`ConfigError`], [`BridgeError`]): prevent the bridge from starting

use std::path::PathBuf;
use std::time::Duration;

use crate::source::SourceKind;

/// An external helper program could not be run to completion.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The program is not installed or not on `PATH`.
    #[error("{program} not found")]
    NotFound {
        /// Program that was looked up.
        program: String,
    },

    /// The program did not finish within its deadline and was killed.
    #[error("{program} timed out after {after:?}")]
    Timeout {
        /// Program that timed out.
        program: String,
        /// Deadline that expired.
        after: Duration,
    },

    /// The program exited unsuccessfully.
    #[error("{program} failed (exit code {code:?}): {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// Spawning or talking to the program failed.
    #[error("{program}: {source}")]
    Io {
        /// Program being run.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Returns `true` if the program is missing entirely.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from the shared physical output path.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// The output control tool failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The tool's output could not be understood.
    #[error("could not parse {what}")]
    Parse {
        /// What was being parsed.
        what: String,
    },
}

impl OutputError {
    /// Creates a parse error.
    pub fn parse(what: impl Into<String>) -> Self {
        Self::Parse { what: what.into() }
    }
}

/// Errors launching a decode pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A program the pipeline needs is not installed.
    #[error("pipeline tool missing: {tool}")]
    ToolMissing {
        /// Missing program.
        tool: String,
    },

    /// The pipeline process could not be spawned.
    #[error("failed to spawn pipeline: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result of a failed source operation.
///
/// Every source operation reports success or one of these. The mixer logs
/// them and carries on; none of them is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source does not implement this operation (e.g. play on a cast receiver).
    #[error("{operation} not supported by this source")]
    Unsupported {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// The source disabled itself because a dependency is missing.
    #[error("source disabled: {reason}")]
    Disabled {
        /// Why the source is disabled.
        reason: String,
    },

    /// The thing the operation targets does not exist yet (e.g. no audio stream).
    #[error("not ready: {what}")]
    NotReady {
        /// What is missing.
        what: String,
    },

    /// The output path rejected the operation.
    #[error(transparent)]
    Output(#[from] OutputError),

    /// The remote playback controller rejected the operation.
    #[error("remote control failed: {0}")]
    Remote(#[source] ExecError),

    /// A decode pipeline could not be started.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl SourceError {
    /// Creates an unsupported-operation error.
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    /// Creates a disabled-source error.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self::Disabled {
            reason: reason.into(),
        }
    }

    /// Creates a not-ready error.
    pub fn not_ready(what: impl Into<String>) -> Self {
        Self::NotReady { what: what.into() }
    }
}

/// Failures of mixer-routed operations.
#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    /// The named source does not exist.
    #[error("unknown source: {name}")]
    UnknownSource {
        /// The name that was looked up.
        name: String,
    },

    /// The operation needs a capability no registered source provides.
    #[error("no source provides {capability}")]
    MissingCapability {
        /// Capability that was requested.
        capability: &'static str,
    },

    /// The source rejected the delegated operation.
    #[error("{source_kind}: {error}")]
    Source {
        /// Source the operation was routed to.
        source_kind: SourceKind,
        /// What the source reported.
        #[source]
        error: SourceError,
    },

    /// Writing the master volume failed.
    #[error(transparent)]
    Output(#[from] OutputError),
}

impl MixerError {
    /// Creates an unknown-source error.
    pub fn unknown_source(name: impl Into<String>) -> Self {
        Self::UnknownSource { name: name.into() }
    }

    pub(crate) fn source(source_kind: SourceKind, error: SourceError) -> Self {
        Self::Source { source_kind, error }
    }
}

/// Errors handling an inbound command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command name is not recognised.
    #[error("unknown command: {command}")]
    Unknown {
        /// The command as received.
        command: String,
    },

    /// The payload could not be parsed for this command.
    #[error("invalid payload for {command}: {payload:?}")]
    InvalidPayload {
        /// The command as received.
        command: String,
        /// The payload as received.
        payload: String,
    },

    /// The mixer rejected the command.
    #[error(transparent)]
    Mixer(#[from] MixerError),
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path to the file.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid-value error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors that can occur within a [`Publisher`](crate::Publisher).
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The receiving channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Custom error for user-implemented publishers.
    #[error("{0}")]
    Custom(String),
}

impl PublishError {
    /// Creates a custom publish error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Fatal errors that prevent the bridge from starting.
///
/// Returned from [`MediaBridgeBuilder::start()`](crate::MediaBridgeBuilder::start).
/// Anything that goes wrong after startup is logged and retried instead.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No publisher was configured before starting.
    #[error("no publisher configured - call publisher() before start()")]
    NoPublisher,
}
