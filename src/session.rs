use crate::{
    decoder::{self, OutputChunk, Transcript},
    profile::{LanguageProfile, ProfileRegistry},
    runtime::ContainerRuntime,
    submission::{ExecutionResult, Submission},
    writer, Error, Result,
};
use std::{future::Future, io, mem, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Longest a session may take from container creation to decoded output.
    pub timeout: Duration,
    /// Longest container removal may take.
    pub cleanup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timeout: DEFAULT_SESSION_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// No container exists yet.
    Pending,
    Created,
    Started,
    Attached,
    Running,
    Exited,
    CleanedUp,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cancelling this token aborts the session and removes its container.
    pub cancel: CancellationToken,
    /// Receives program output as it is decoded, for streaming profiles.
    pub observer: Option<mpsc::Sender<OutputChunk>>,
}

/// Everything observed while running one submission.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: Option<String>,
    /// The furthest lifecycle state reached before cleanup.
    pub reached: SessionState,
    pub exit_code: Option<i64>,
    pub transcript: Option<Transcript>,
    pub outcome: Result<ExecutionResult>,
    /// Input delivery failures never decide the outcome on their own.
    pub write_error: Option<Error>,
    pub cleanup_error: Option<Error>,
}

impl SessionReport {
    fn new() -> Self {
        SessionReport {
            session_id: None,
            reached: SessionState::Pending,
            exit_code: None,
            transcript: None,
            outcome: Err(Error::Cancelled),
            write_error: None,
            cleanup_error: None,
        }
    }

    fn fail(mut self, e: Error) -> Self {
        self.outcome = Err(e);
        self
    }

    pub fn into_result(self) -> Result<ExecutionResult> {
        self.outcome
    }
}

/// Runs submissions in fresh containers, one container per submission.
pub struct Sandbox<R> {
    runtime: Arc<R>,
    profiles: ProfileRegistry,
    config: SessionConfig,
}

impl<R> Sandbox<R>
where
    R: ContainerRuntime + 'static,
{
    pub fn new(runtime: Arc<R>, profiles: ProfileRegistry) -> Self {
        Sandbox {
            runtime,
            profiles,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(&self, submission: &Submission) -> Result<ExecutionResult> {
        self.run_with(submission, RunOptions::default())
            .await
            .into_result()
    }

    pub async fn run_with(&self, submission: &Submission, options: RunOptions) -> SessionReport {
        let mut report = SessionReport::new();

        let profile = match self.profiles.resolve(&submission.language) {
            Ok(profile) => profile,
            Err(e) => return report.fail(e),
        };
        let payload = match submission.encode() {
            Ok(payload) => payload,
            Err(e) => return report.fail(e),
        };

        let cancel = options.cancel.child_token();
        let deadline = Instant::now() + self.config.timeout;

        // Not raced against cancellation: an id we never saw could not be removed.
        log::debug!("Creating container from {}", profile.image);
        let id = match self
            .runtime
            .create(&profile.image, &profile.launch_args, true)
            .await
        {
            Ok(id) => id,
            Err(e) => return report.fail(Error::CreateFailed { source: e }),
        };

        let mut session = SandboxSession {
            id,
            runtime: self.runtime.clone(),
            cancel,
            deadline,
            timeout: self.config.timeout,
            state: SessionState::Created,
            cleaned: false,
        };
        log::debug!("Session {} is {:?}", session.id, session.state);

        report.session_id = Some(session.id.clone());

        let outcome = drive(
            &mut session,
            profile,
            payload,
            options.observer.as_ref(),
            &mut report,
        )
        .await;
        report.outcome = outcome;
        report.reached = session.state;

        if let Err(e) = session.cleanup(self.config.cleanup_timeout).await {
            log::warn!("{}", e);
            report.cleanup_error = Some(e);
        }

        report
    }
}

async fn drive<R>(
    session: &mut SandboxSession<R>,
    profile: &LanguageProfile,
    payload: Vec<u8>,
    observer: Option<&mpsc::Sender<OutputChunk>>,
    report: &mut SessionReport,
) -> Result<ExecutionResult>
where
    R: ContainerRuntime + 'static,
{
    let runtime = session.runtime.clone();
    session.check()?;

    session
        .guard(runtime.start(&session.id))
        .await?
        .map_err(|e| Error::StartFailed { source: e })?;
    session.advance(SessionState::Started);

    let conn = session
        .guard(runtime.attach(&session.id))
        .await?
        .map_err(|e| Error::AttachFailed { source: e })?;
    session.advance(SessionState::Attached);

    let writer_cancel = session.cancel.child_token();
    let writer = tokio::spawn(writer::feed(conn, payload, writer_cancel.clone()));
    session.advance(SessionState::Running);

    let waited = session.guard(runtime.wait(&session.id)).await;

    // The runner may exit without reading all of its input.
    writer_cancel.cancel();
    match writer.await {
        Ok(Ok(n)) => log::debug!("Delivered {} bytes to container {}", n, session.id),
        Ok(Err(e)) => {
            log::warn!("Unable to deliver submission to container {}: {}", session.id, e);
            report.write_error = Some(e);
        }
        Err(e) => {
            log::warn!("Writer for container {} did not finish: {}", session.id, e);
            report.write_error = Some(Error::WriteFailed {
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                written: 0,
            });
        }
    }

    let exit_code = waited?.map_err(|e| Error::WaitFailed { source: e })?;
    report.exit_code = Some(exit_code);
    session.advance(SessionState::Exited);
    log::debug!("Container {} exited with {}", session.id, exit_code);

    let mut output = session
        .guard(runtime.read_output(&session.id, profile.streaming))
        .await?
        .map_err(|e| Error::LogReadFailed { source: e })?;

    let decoded = session
        .guard(decoder::decode(&mut output, profile.streaming, observer))
        .await?
        .map_err(Error::from_decode)?;

    report.transcript = Some(decoded.transcript);
    Ok(decoded.result)
}

/// One container's lifecycle. The container is removed exactly once, by
/// [`SandboxSession::cleanup`] or, failing that, when the session is dropped.
struct SandboxSession<R>
where
    R: ContainerRuntime + 'static,
{
    id: String,
    runtime: Arc<R>,
    cancel: CancellationToken,
    deadline: Instant,
    timeout: Duration,
    state: SessionState,
    cleaned: bool,
}

impl<R> SandboxSession<R>
where
    R: ContainerRuntime + 'static,
{
    fn advance(&mut self, state: SessionState) {
        log::debug!("Session {} is {:?}", self.id, state);
        self.state = state;
    }

    fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else if Instant::now() >= self.deadline {
            self.cancel.cancel();
            Err(Error::Timeout {
                timeout: self.timeout,
            })
        } else {
            Ok(())
        }
    }

    /// Runs one lifecycle step unless the session is cancelled or out of time first.
    async fn guard<F>(&self, step: F) -> Result<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => {
                self.cancel.cancel();
                Err(Error::Timeout { timeout: self.timeout })
            }
            out = step => Ok(out),
        }
    }

    async fn cleanup(&mut self, timeout: Duration) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        self.cleaned = true;

        log::debug!("Cleaning up container {}", self.id);
        let removed = tokio::time::timeout(timeout, self.runtime.remove(&self.id, true)).await;
        self.advance(SessionState::CleanedUp);

        match removed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::CleanupFailed { source: e }),
            Err(_) => Err(Error::CleanupFailed {
                source: io::Error::new(io::ErrorKind::TimedOut, "container removal timed out"),
            }),
        }
    }
}

impl<R> Drop for SandboxSession<R>
where
    R: ContainerRuntime + 'static,
{
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        self.cancel.cancel();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!("Container {} was abandoned without cleanup", self.id);
                return;
            }
        };

        log::debug!("Removing abandoned container {}", self.id);
        let runtime = self.runtime.clone();
        let id = mem::take(&mut self.id);
        handle.spawn(async move {
            if let Err(e) = runtime.remove(&id, true).await {
                log::warn!("Unable to remove abandoned container {}: {}", id, e);
            }
        });
    }
}
