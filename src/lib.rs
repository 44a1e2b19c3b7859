//! Ephemeral sandboxed execution of user submissions inside containers.
//!
//! A [`Sandbox`] resolves the submission's [`LanguageProfile`], creates and
//! starts a container, streams the encoded [`Submission`] into its standard
//! input while waiting for it to exit, and decodes the framed output stream
//! into an [`ExecutionResult`]. The container is removed on every path out.
//!
//! The container runtime is reached through the narrow [`ContainerRuntime`]
//! capability; [`DockerCli`] implements it on top of the `docker` binary.

use std::{io, time::Duration};
use thiserror::Error;

pub mod decoder;
pub mod docker;
pub mod frame;
pub mod profile;
pub mod runtime;
pub mod session;
pub mod submission;
pub mod writer;

pub use crate::decoder::{DecodeError, Decoded, OutputChunk, Transcript};
pub use crate::docker::DockerCli;
pub use crate::frame::StreamKind;
pub use crate::profile::{LanguageProfile, ProfileRegistry};
pub use crate::runtime::{Connection, ContainerRuntime, OutputStream};
pub use crate::session::{
    RunOptions, Sandbox, SessionConfig, SessionReport, SessionState, DEFAULT_CLEANUP_TIMEOUT,
    DEFAULT_SESSION_TIMEOUT,
};
pub use crate::submission::{ExecutionResult, File, Submission};

#[derive(Error, Debug)]
pub enum Error {
    #[error("No language profile is registered for `{language}`")]
    UnknownLanguage { language: String },
    #[error("Unable to encode the submission: {source}")]
    EncodeFailed { source: serde_json::Error },
    #[error("Unable to create the container: {source}")]
    CreateFailed { source: io::Error },
    #[error("Unable to start the container: {source}")]
    StartFailed { source: io::Error },
    #[error("Unable to attach to the container: {source}")]
    AttachFailed { source: io::Error },
    #[error("Unable to write to the container after {written} bytes: {source}")]
    WriteFailed { source: io::Error, written: usize },
    #[error("Writing to the container stalled after {written} of {total} bytes")]
    WriteStalled { written: usize, total: usize },
    #[error("Unable to wait for the container: {source}")]
    WaitFailed { source: io::Error },
    #[error("Unable to read output from the container: {source}")]
    LogReadFailed { source: io::Error },
    #[error("Unable to decode output from the container: {source}")]
    DecodeFailed { source: DecodeError },
    #[error("Session took longer than {} ms", timeout.as_millis())]
    Timeout { timeout: Duration },
    #[error("Session was cancelled")]
    Cancelled,
    #[error("Unable to remove the container: {source}")]
    CleanupFailed { source: io::Error },
}

impl Error {
    /// Classifies a decoder failure: a failed read of the output stream is a
    /// log read failure, anything else is malformed output.
    pub(crate) fn from_decode(e: DecodeError) -> Self {
        match e {
            DecodeError::Read { source } => Error::LogReadFailed { source },
            source => Error::DecodeFailed { source },
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
