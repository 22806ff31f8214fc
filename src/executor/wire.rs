//! Line-based socket protocol spoken with a worker.
//!
//! One exchange = one fresh TCP connection: write the request as a single
//! line, read a single response line, close. The `TERMINATE` control line is
//! sent on its own connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ServiceError;

/// Control line asking a worker to shut itself down.
pub const TERMINATE_FRAME: &str = "TERMINATE";

/// Default buffer size for reading responses (64KB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Errors that can occur while talking to a worker.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("could not connect to worker on port {port}: {source}")]
    Connect { port: u16, source: io::Error },

    #[error("I/O error talking to worker on port {port}: {source}")]
    Io { port: u16, source: io::Error },

    #[error("worker on port {port} exited before accepting a connection")]
    WorkerGone { port: u16 },

    #[error("no answer from worker on port {port} within {timeout:?}")]
    TimedOut { port: u16, timeout: Duration },

    #[error("exchange with worker on port {port} was cancelled")]
    Cancelled { port: u16 },
}

impl From<WireError> for ServiceError {
    fn from(err: WireError) -> Self {
        let message = err.to_string();
        match err {
            WireError::Connect { source, .. } | WireError::Io { source, .. } => {
                ServiceError::delegate_io(message, source)
            }
            WireError::WorkerGone { .. } | WireError::TimedOut { .. } => {
                ServiceError::delegate(message, true)
            }
            WireError::Cancelled { .. } => ServiceError::delegate(message, false),
        }
    }
}

/// Client for the worker listening on one slot port.
#[derive(Debug, Clone)]
pub struct WireClient {
    addr: SocketAddr,
    connect_timeout: Duration,
    connect_retry: Duration,
}

impl WireClient {
    pub fn new(port: u16, connect_timeout: Duration, connect_retry: Duration) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            connect_timeout,
            connect_retry,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Send `payload` as one line and return the first line of the answer.
    ///
    /// The returned line has its terminator stripped and is not decoded; an
    /// empty line means the worker answered with an empty line or closed
    /// without answering.
    /// `worker_alive` is consulted while the port still refuses connections,
    /// so a worker that died during startup fails fast instead of waiting
    /// out the connect timeout.
    pub async fn exchange<F>(
        &self,
        payload: &str,
        deadline: Instant,
        cancel: &CancellationToken,
        worker_alive: F,
    ) -> Result<Vec<u8>, WireError>
    where
        F: FnMut() -> bool,
    {
        let port = self.port();
        let budget = deadline.saturating_duration_since(Instant::now());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WireError::Cancelled { port }),
            result = tokio::time::timeout_at(deadline, self.round_trip(payload, worker_alive)) => {
                result.unwrap_or(Err(WireError::TimedOut { port, timeout: budget }))
            }
        }
    }

    async fn round_trip<F>(&self, payload: &str, worker_alive: F) -> Result<Vec<u8>, WireError>
    where
        F: FnMut() -> bool,
    {
        let port = self.port();
        let stream = self.connect(worker_alive).await?;
        let (read_half, mut write_half) = stream.into_split();
        let io_err = |source| WireError::Io { port, source };

        trace!(port, bytes = payload.len(), "Sending request line");
        write_half
            .write_all(payload.as_bytes())
            .await
            .map_err(io_err)?;
        write_half.write_all(b"\n").await.map_err(io_err)?;
        write_half.flush().await.map_err(io_err)?;

        trace!(port, "Waiting for answer...");
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.map_err(io_err)?;

        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        trace!(port, bytes = line.len(), "Received answer");
        Ok(line)
    }

    /// Connect, retrying refused connections while the worker is still
    /// starting up.
    async fn connect<F>(&self, mut worker_alive: F) -> Result<TcpStream, WireError>
    where
        F: FnMut() -> bool,
    {
        let port = self.port();
        let give_up_at = Instant::now() + self.connect_timeout;
        loop {
            match TcpStream::connect(self.addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    if !worker_alive() {
                        return Err(WireError::WorkerGone { port });
                    }
                    if Instant::now() + self.connect_retry >= give_up_at {
                        return Err(WireError::Connect { port, source: e });
                    }
                    trace!(port, "Worker not listening yet, retrying");
                    tokio::time::sleep(self.connect_retry).await;
                }
                Err(e) => return Err(WireError::Connect { port, source: e }),
            }
        }
    }

    /// Deliver the `TERMINATE` control line on a fresh connection.
    ///
    /// Fails if the worker cannot be reached within `timeout`; the caller is
    /// then expected to kill the process.
    pub async fn send_terminate(&self, timeout: Duration) -> Result<(), WireError> {
        let port = self.port();
        let deliver = async {
            let mut stream = TcpStream::connect(self.addr)
                .await
                .map_err(|source| WireError::Connect { port, source })?;
            let frame = format!("{TERMINATE_FRAME}\n");
            stream
                .write_all(frame.as_bytes())
                .await
                .map_err(|source| WireError::Io { port, source })?;
            stream
                .flush()
                .await
                .map_err(|source| WireError::Io { port, source })
        };
        tokio::time::timeout(timeout, deliver)
            .await
            .unwrap_or(Err(WireError::TimedOut { port, timeout }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn client(port: u16) -> WireClient {
        WireClient::new(port, Duration::from_secs(2), Duration::from_millis(20))
    }

    fn deadline(secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    /// Accept one connection, read one line, answer with `answer` verbatim.
    async fn answer_once(listener: TcpListener, answer: &'static [u8]) -> String {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let _ = write_half.write_all(answer).await;
        line
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(answer_once(listener, b"{\"status\":\"success\"}\n"));

        let answer = client(port)
            .exchange(r#"{"records":[]}"#, deadline(5), &CancellationToken::new(), || true)
            .await
            .unwrap();
        assert_eq!(answer, br#"{"status":"success"}"#);

        let received = server.await.unwrap();
        assert_eq!(received, "{\"records\":[]}\n");
    }

    #[tokio::test]
    async fn test_answer_without_newline_is_read_until_close() {
        let (listener, port) = listener().await;
        tokio::spawn(answer_once(listener, b"{\"status\":\"success\"}"));

        let answer = client(port)
            .exchange("{}", deadline(5), &CancellationToken::new(), || true)
            .await
            .unwrap();
        assert_eq!(answer, br#"{"status":"success"}"#);
    }

    #[tokio::test]
    async fn test_crlf_is_stripped() {
        let (listener, port) = listener().await;
        tokio::spawn(answer_once(listener, b"ok\r\n"));

        let answer = client(port)
            .exchange("{}", deadline(5), &CancellationToken::new(), || true)
            .await
            .unwrap();
        assert_eq!(answer, b"ok");
    }

    #[tokio::test]
    async fn test_invalid_utf8_answer_is_returned_undecoded() {
        let (listener, port) = listener().await;
        tokio::spawn(answer_once(listener, b"{\"status\":\"success\",\"data\":[\xff\xfe]}\n"));

        let answer = client(port)
            .exchange("{}", deadline(5), &CancellationToken::new(), || true)
            .await
            .unwrap();
        assert_eq!(answer, b"{\"status\":\"success\",\"data\":[\xff\xfe]}");
    }

    #[tokio::test]
    async fn test_empty_answer() {
        let (listener, port) = listener().await;
        tokio::spawn(answer_once(listener, b"\n"));

        let answer = client(port)
            .exchange("{}", deadline(5), &CancellationToken::new(), || true)
            .await
            .unwrap();
        assert!(answer.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let (listener, port) = listener().await;
        // Accept but never answer
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        });

        let start = std::time::Instant::now();
        let err = client(port)
            .exchange(
                "{}",
                Instant::now() + Duration::from_millis(200),
                &CancellationToken::new(),
                || true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf).await;
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = client(port)
            .exchange("{}", deadline(30), &cancel, || true)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Cancelled { .. }));

        let service_err: ServiceError = err.into();
        assert!(!service_err.log_detail());
        server.abort();
    }

    #[tokio::test]
    async fn test_refused_connection_with_dead_worker_fails_fast() {
        // Bind and drop to get a port nobody listens on
        let (listener, port) = listener().await;
        drop(listener);

        let err = client(port)
            .exchange("{}", deadline(5), &CancellationToken::new(), || false)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::WorkerGone { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_gives_up_after_connect_timeout() {
        let (listener, port) = listener().await;
        drop(listener);

        let client = WireClient::new(port, Duration::from_millis(100), Duration::from_millis(20));
        let err = client
            .exchange("{}", deadline(5), &CancellationToken::new(), || true)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Connect { .. }));

        let service_err: ServiceError = err.into();
        assert!(service_err.log_detail());
        assert_eq!(service_err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_send_terminate() {
        let (listener, port) = listener().await;
        let server = tokio::spawn(answer_once(listener, b"OK"));

        client(port)
            .send_terminate(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(server.await.unwrap(), "TERMINATE\n");
    }

    #[tokio::test]
    async fn test_send_terminate_without_listener() {
        let (listener, port) = listener().await;
        drop(listener);

        let result = client(port).send_terminate(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(WireError::Connect { .. })));
    }
}
