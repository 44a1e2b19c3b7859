//! The container runtime capability a session drives.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Write half of the duplex stream attached to a container's stdin.
pub type Connection = Box<dyn AsyncWrite + Send + Unpin>;

/// The container's multiplexed output, see [`crate::frame`].
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container and returns its id.
    async fn create(&self, image: &str, cmd: &[String], open_stdin: bool) -> io::Result<String>;

    async fn start(&self, id: &str) -> io::Result<()>;

    async fn attach(&self, id: &str) -> io::Result<Connection>;

    /// Waits for the container's main process to exit and returns its exit code.
    async fn wait(&self, id: &str) -> io::Result<i64>;

    async fn read_output(&self, id: &str, follow: bool) -> io::Result<OutputStream>;

    async fn remove(&self, id: &str, force: bool) -> io::Result<()>;
}
