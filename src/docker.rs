//! [`ContainerRuntime`] on top of the `docker` command line client.
//!
//! `docker logs` already splits the container's output into separate stdout
//! and stderr pipes, so [`DockerCli::read_output`] frames the two pipes back
//! into a single multiplexed stream as the chunks arrive.

use crate::{
    frame::{encode_frame, StreamKind},
    runtime::{Connection, ContainerRuntime, OutputStream},
};
use async_trait::async_trait;
use std::{
    ffi::OsString,
    io,
    pin::Pin,
    process::{Output, Stdio},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
};

const READ_CHUNK: usize = 8 * 1024;
const CHANNEL_CAPACITY: usize = 32;
/// How long `docker attach` may keep forwarding input after its stdin closes.
const ATTACH_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DockerCli {
    program: OsString,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! docker_command {
    ($program:expr, $($arg:expr),* $(,)?) => ({
        let mut cmd = Command::new($program);
        $( cmd.arg($arg); )*
        cmd
    });
}

impl DockerCli {
    pub fn new() -> Self {
        DockerCli {
            program: "docker".into(),
        }
    }

    pub fn with_program(program: impl Into<OsString>) -> Self {
        DockerCli {
            program: program.into(),
        }
    }

    async fn output(&self, mut cmd: Command) -> io::Result<Output> {
        log::debug!("Running {:?}", cmd);
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let output = cmd.output().await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "docker exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

fn first_line(output: &Output) -> io::Result<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "docker printed no output"))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, image: &str, cmd: &[String], open_stdin: bool) -> io::Result<String> {
        let mut command = docker_command!(
            &self.program,
            "create",
            "--cap-drop=ALL",
            "--security-opt=no-new-privileges",
        );
        if open_stdin {
            command.arg("--interactive");
        }
        command.arg(image).args(cmd);

        let output = self.output(command).await?;
        first_line(&output)
    }

    async fn start(&self, id: &str) -> io::Result<()> {
        self.output(docker_command!(&self.program, "start", id))
            .await
            .map(drop)
    }

    async fn attach(&self, id: &str) -> io::Result<Connection> {
        let mut command = docker_command!(&self.program, "attach", "--sig-proxy=false", id);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        log::debug!("Running {:?}", command);
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "attach has no stdin"))?;

        Ok(Box::new(Attached {
            stdin: Some(stdin),
            child: Some(child),
        }))
    }

    async fn wait(&self, id: &str) -> io::Result<i64> {
        let output = self.output(docker_command!(&self.program, "wait", id)).await?;
        let line = first_line(&output)?;
        line.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("docker wait printed `{}`", line),
            )
        })
    }

    async fn read_output(&self, id: &str, follow: bool) -> io::Result<OutputStream> {
        let mut command = docker_command!(&self.program, "logs");
        if follow {
            command.arg("--follow");
        }
        command
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("Running {:?}", command);
        let child = command.spawn()?;
        Ok(Box::new(reframe(child)?))
    }

    async fn remove(&self, id: &str, force: bool) -> io::Result<()> {
        let mut command = docker_command!(&self.program, "rm");
        if force {
            // Kills the container if it is still running
            command.arg("--force");
        }
        command.arg(id).stdout(Stdio::null());

        self.output(command).await.map(drop)
    }
}

type Chunk = io::Result<(StreamKind, Vec<u8>)>;

/// Frames the stdout and stderr pipes of `docker logs` into one stream. A
/// failed pipe read or a non-zero exit ends the stream with an error.
fn reframe(mut child: Child) -> io::Result<LogStream> {
    let broken = || io::Error::new(io::ErrorKind::BrokenPipe, "logs has no output pipe");
    let stdout = child.stdout.take().ok_or_else(broken)?;
    let stderr = child.stderr.take().ok_or_else(broken)?;

    let (chunks_tx, chunks_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(pump(StreamKind::Stdout, stdout, chunks_tx.clone()));
    tokio::spawn(pump(StreamKind::Stderr, stderr, chunks_tx));

    let (frames_tx, frames_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(multiplex(child, chunks_rx, frames_tx));

    Ok(LogStream {
        rx: frames_rx,
        buf: Vec::new(),
        pos: 0,
    })
}

async fn pump<R>(stream: StreamKind, mut pipe: R, tx: mpsc::Sender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; READ_CHUNK];
    loop {
        let chunk = match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => Ok((stream, buf[..n].to_vec())),
            Err(e) => {
                log::warn!("Unable to read docker logs {:?}: {}", stream, e);
                Err(e)
            }
        };
        let failed = chunk.is_err();
        if tx.send(chunk).await.is_err() || failed {
            break;
        }
    }
}

async fn multiplex(
    mut child: Child,
    mut rx: mpsc::Receiver<Chunk>,
    out: mpsc::Sender<io::Result<Vec<u8>>>,
) {
    while let Some(chunk) = rx.recv().await {
        let (stream, bytes) = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = out.send(Err(e)).await;
                return;
            }
        };

        let mut frame = Vec::with_capacity(bytes.len() + 8);
        encode_frame(stream, &bytes, &mut frame);
        if out.send(Ok(frame)).await.is_err() {
            log::debug!("Output reader went away");
            return;
        }
    }

    let failure = match child.wait().await {
        Ok(status) if status.success() => return,
        Ok(status) => {
            log::warn!("docker logs exited with {}", status);
            io::Error::new(
                io::ErrorKind::Other,
                format!("docker logs exited with {}", status),
            )
        }
        Err(e) => {
            log::warn!("Unable to wait for docker logs: {}", e);
            e
        }
    };
    let _ = out.send(Err(failure)).await;
}

/// Multiplexed output of `docker logs`, surfacing its failures as read errors.
struct LogStream {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    buf: Vec<u8>,
    pos: usize,
}

impl AsyncRead for LogStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pos == self.buf.len() {
            match self.rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(Some(Ok(frame))) => {
                    self.buf = frame;
                    self.pos = 0;
                }
            }
        }

        let n = buf.remaining().min(self.buf.len() - self.pos);
        let pos = self.pos;
        buf.put_slice(&self.buf[pos..pos + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Stdin of a running `docker attach`. Shutting the connection down closes
/// the pipe; the attach process is then given a grace period to forward what
/// it has read and exit before it is killed.
struct Attached {
    stdin: Option<ChildStdin>,
    child: Option<Child>,
}

fn stdin_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "attach stdin is closed")
}

impl AsyncWrite for Attached {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(stdin_closed())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(stdin) = self.stdin.as_mut() {
            match Pin::new(stdin).poll_flush(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        // Dropping the pipe is what delivers EOF.
        self.stdin = None;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        drop(self.stdin.take());

        let mut child = match self.child.take() {
            Some(child) => child,
            None => return,
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            // Killed on drop.
            Err(_) => return,
        };

        handle.spawn(async move {
            match tokio::time::timeout(ATTACH_GRACE, child.wait()).await {
                Ok(Ok(status)) => log::trace!("docker attach exited with {}", status),
                Ok(Err(e)) => log::warn!("Unable to wait for docker attach: {}", e),
                Err(_) => {
                    log::debug!("docker attach outlived its stdin, killing it");
                    if let Err(e) = child.kill().await {
                        log::warn!("Unable to kill docker attach: {}", e);
                    }
                }
            }
        });
    }
}
