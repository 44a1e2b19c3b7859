//! An in-memory container runtime for driving sessions in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sandbox_eval::{frame, Connection, ContainerRuntime, ExecutionResult, OutputStream, StreamKind};
use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf},
    sync::oneshot,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Create,
    Start,
    Attach,
    Wait,
    ReadOutput,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Exits once stdin is closed, after consuming all of it.
    AfterInput,
    /// Exits straight away without reading stdin.
    Immediately,
    /// Never exits.
    Never,
}

pub struct FakeRuntime {
    calls: Mutex<Vec<(Step, String)>>,
    fail_at: Option<Step>,
    output: Vec<u8>,
    exit_code: i64,
    exit: Exit,
    stdin_capacity: usize,
    stdin: Arc<Mutex<Vec<u8>>>,
    stdin_closed: Mutex<Option<oneshot::Receiver<()>>>,
    // Unread stdin of a runner that exits straight away.
    parked: Mutex<Option<DuplexStream>>,
    remove_delay: Option<Duration>,
    output_breaks: bool,
    crashing_stdin: bool,
}

impl FakeRuntime {
    pub fn new(output: Vec<u8>) -> Self {
        FakeRuntime {
            calls: Mutex::new(Vec::new()),
            fail_at: None,
            output,
            exit_code: 0,
            exit: Exit::AfterInput,
            stdin_capacity: 16,
            stdin: Arc::new(Mutex::new(Vec::new())),
            stdin_closed: Mutex::new(None),
            parked: Mutex::new(None),
            remove_delay: None,
            output_breaks: false,
            crashing_stdin: false,
        }
    }

    /// A runner that answers with `result` as its only frame.
    pub fn answering(result: &ExecutionResult) -> Self {
        Self::new(result_frame(result))
    }

    pub fn failing_at(mut self, step: Step) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn exit(mut self, exit: Exit) -> Self {
        self.exit = exit;
        self
    }

    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn slow_remove(mut self, delay: Duration) -> Self {
        self.remove_delay = Some(delay);
        self
    }

    /// The log stream fails after yielding all of the output.
    pub fn output_breaks(mut self) -> Self {
        self.output_breaks = true;
        self
    }

    /// Writing to the attached stdin panics.
    pub fn crashing_stdin(mut self) -> Self {
        self.crashing_stdin = true;
        self
    }

    pub fn calls(&self) -> Vec<Step> {
        self.calls.lock().unwrap().iter().map(|(s, _)| *s).collect()
    }

    pub fn count(&self, step: Step) -> usize {
        self.calls().into_iter().filter(|s| *s == step).count()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == Step::Remove)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn stdin(&self) -> Vec<u8> {
        self.stdin.lock().unwrap().clone()
    }

    fn record(&self, step: Step, id: &str) -> io::Result<()> {
        self.calls.lock().unwrap().push((step, id.to_string()));
        if self.fail_at == Some(step) {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected {:?} failure", step),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, image: &str, _cmd: &[String], open_stdin: bool) -> io::Result<String> {
        assert!(open_stdin, "sessions keep stdin open");
        self.record(Step::Create, image)?;
        Ok(format!("fake-{}", image.replace('/', "-")))
    }

    async fn start(&self, id: &str) -> io::Result<()> {
        self.record(Step::Start, id)
    }

    async fn attach(&self, id: &str) -> io::Result<Connection> {
        self.record(Step::Attach, id)?;
        if self.crashing_stdin {
            return Ok(Box::new(Crashing));
        }
        let (client, mut server) = tokio::io::duplex(self.stdin_capacity);

        if self.exit == Exit::Immediately {
            *self.parked.lock().unwrap() = Some(server);
            return Ok(Box::new(client));
        }

        let (closed_tx, closed_rx) = oneshot::channel();
        *self.stdin_closed.lock().unwrap() = Some(closed_rx);
        let stdin = self.stdin.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 7];
            loop {
                match server.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stdin.lock().unwrap().extend_from_slice(&buf[..n]),
                }
            }
            let _ = closed_tx.send(());
        });

        Ok(Box::new(client))
    }

    async fn wait(&self, id: &str) -> io::Result<i64> {
        self.record(Step::Wait, id)?;
        match self.exit {
            Exit::Immediately => {}
            Exit::Never => std::future::pending::<()>().await,
            Exit::AfterInput => {
                let closed = self.stdin_closed.lock().unwrap().take();
                if let Some(closed) = closed {
                    let _ = closed.await;
                }
            }
        }
        Ok(self.exit_code)
    }

    async fn read_output(&self, id: &str, _follow: bool) -> io::Result<OutputStream> {
        self.record(Step::ReadOutput, id)?;
        let output = io::Cursor::new(self.output.clone());
        if self.output_breaks {
            Ok(Box::new(output.chain(Broken)))
        } else {
            Ok(Box::new(output))
        }
    }

    async fn remove(&self, id: &str, force: bool) -> io::Result<()> {
        assert!(force, "containers are always force removed");
        if let Some(delay) = self.remove_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(Step::Remove, id)
    }
}

struct Broken;

impl AsyncRead for Broken {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "log stream went away",
        )))
    }
}

struct Crashing;

impl AsyncWrite for Crashing {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        panic!("stdin crashed");
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub fn frames(frames: &[(StreamKind, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (stream, payload) in frames {
        frame::encode_frame(*stream, payload, &mut out);
    }
    out
}

pub fn result_frame(result: &ExecutionResult) -> Vec<u8> {
    let envelope = serde_json::to_vec(result).unwrap();
    frames(&[(StreamKind::Stdout, &envelope)])
}
