//! TCP RPC client for one counter replica.
//!
//! Establishes a TCP connection to a replica and provides typed `increment`
//! and `greet` calls over the shared framing.
//!
//! # Thread Safety
//!
//! The client uses a tokio `Mutex` to serialize access to the TCP stream, so
//! one request/response exchange is in flight per connection at a time.

use crate::config::RpcConfig;
use crate::messages::{
    methods, FarewellMessage, GreetingMessage, IncrementAck, IncrementRequest, ProtocolVersion,
};
use crate::protocol::{read_frame, stream_end_method, write_frame, RpcRequest, RpcResponse};
use crate::{Result, TallyError};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Transport-level readiness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// Not dialed yet.
    Idle,
    /// Dial in progress.
    Connecting,
    /// Usable for calls.
    Ready,
    /// The connection broke; no automatic reconnect happens.
    TransientFailure,
    /// Closed locally.
    Shutdown,
}

impl ConnectivityState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectivityState::Idle => 0,
            ConnectivityState::Connecting => 1,
            ConnectivityState::Ready => 2,
            ConnectivityState::TransientFailure => 3,
            ConnectivityState::Shutdown => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "IDLE"),
            ConnectivityState::Connecting => write!(f, "CONNECTING"),
            ConnectivityState::Ready => write!(f, "READY"),
            ConnectivityState::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            ConnectivityState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Client connection to a single replica.
#[derive(Debug)]
pub struct RpcClient {
    address: String,
    peer_addr: SocketAddr,
    stream: Mutex<TcpStream>,
    state: AtomicU8,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl RpcClient {
    /// Dial `address` (`host:port`), giving up after `dial_timeout`.
    pub async fn connect(address: &str, dial_timeout: Duration) -> Result<Self> {
        debug!("Attempting to dial {} (timeout {:?})", address, dial_timeout);

        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TallyError::DialTimeout {
                address: address.to_string(),
                timeout: dial_timeout,
            })?
            .map_err(|e| TallyError::DialFailed {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr()?;

        debug!("Connected to {} ({})", address, peer_addr);

        Ok(Self {
            address: address.to_string(),
            peer_addr,
            stream: Mutex::new(stream),
            state: AtomicU8::new(ConnectivityState::Ready.as_u8()),
            next_id: AtomicU64::new(1),
            call_timeout: RpcConfig::CALL_TIMEOUT,
        })
    }

    /// Replace the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The address this client was dialed with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The resolved socket address of the replica.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current readiness, checked against the socket rather than cached.
    ///
    /// An idle socket that has seen the peer close, or has unexpected unread
    /// bytes, moves to `TransientFailure`. A socket with a call in flight is
    /// reported as `Ready`.
    pub fn state(&self) -> ConnectivityState {
        let state = self.load_state();
        if state != ConnectivityState::Ready {
            return state;
        }

        let Ok(stream) = self.stream.try_lock() else {
            return ConnectivityState::Ready;
        };

        let mut buf = [0u8; 1];
        match stream.peek(&mut buf).now_or_never() {
            None => ConnectivityState::Ready,
            Some(Ok(0)) => self.fail("peer closed the connection"),
            Some(Ok(_)) => self.fail("unexpected data between calls"),
            Some(Err(e)) => self.fail(&e.to_string()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectivityState::Ready
    }

    /// Increment the replica's counter.
    ///
    /// Amounts outside the version's width are rejected before anything is sent.
    pub async fn increment(
        &self,
        request: &IncrementRequest,
        version: ProtocolVersion,
    ) -> Result<IncrementAck> {
        version.check_amount(request.amount)?;
        let params = serde_json::to_value(request)?;
        let result = self.call(version.increment_method(), params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send every greeting as one client stream and wait for the farewell.
    pub async fn greet(&self, messages: &[GreetingMessage]) -> Result<FarewellMessage> {
        self.ensure_ready()?;

        let mut frames = Vec::with_capacity(messages.len() + 1);
        for message in messages {
            let item = RpcRequest::notification(methods::GREET, serde_json::to_value(message)?);
            frames.push(serde_json::to_vec(&item)?);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let end = RpcRequest::new(stream_end_method(methods::GREET), serde_json::Value::Null, id);
        frames.push(serde_json::to_vec(&end)?);

        let result = self.exchange(&frames, id).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Health check.
    pub async fn ping(&self) -> Result<()> {
        self.call(methods::PING, serde_json::json!({})).await?;
        Ok(())
    }

    /// Call a unary method and return its result value.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.ensure_ready()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(method, params, id);
        let frame = serde_json::to_vec(&request)?;

        self.exchange(&[frame], id).await
    }

    /// Close the connection. Later calls fail with `NotReady`.
    pub async fn close(&self) {
        self.state
            .store(ConnectivityState::Shutdown.as_u8(), Ordering::SeqCst);
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
        debug!("Closed connection to {}", self.address);
    }

    async fn exchange(&self, frames: &[Vec<u8>], id: u64) -> Result<serde_json::Value> {
        let mut stream = self.stream.lock().await;

        let io = send_and_receive(&mut stream, frames);
        let bytes = match tokio::time::timeout(self.call_timeout, io).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                self.fail("connection closed by peer");
                return Err(self.lost("connection closed by peer"));
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                self.fail(&message);
                return Err(self.lost(&message));
            }
            Err(_) => {
                // The response may still arrive later and would be read as the
                // answer to the next call, so the connection is unusable.
                self.fail("call timed out");
                return Err(TallyError::CallTimeout {
                    address: self.address.clone(),
                    timeout: self.call_timeout,
                });
            }
        };

        let response: RpcResponse = serde_json::from_slice(&bytes).map_err(|e| {
            self.fail("malformed response");
            TallyError::Protocol {
                message: format!("Failed to parse response from {}: {}", self.address, e),
            }
        })?;

        if response.id != Some(serde_json::Value::Number(id.into())) {
            self.fail("response id mismatch");
            return Err(TallyError::Protocol {
                message: format!(
                    "Response from {} has id {:?}, expected {}",
                    self.address, response.id, id
                ),
            });
        }

        response.into_result()
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectivityState::Ready => Ok(()),
            state => Err(TallyError::NotReady {
                address: self.address.clone(),
                state: state.to_string(),
            }),
        }
    }

    fn load_state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn fail(&self, reason: &str) -> ConnectivityState {
        let previous = self.state.compare_exchange(
            ConnectivityState::Ready.as_u8(),
            ConnectivityState::TransientFailure.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if previous.is_ok() {
            warn!("Connection to {} failed: {}", self.address, reason);
        }
        self.load_state()
    }

    fn lost(&self, message: &str) -> TallyError {
        TallyError::ConnectionLost {
            address: self.address.clone(),
            message: message.to_string(),
        }
    }
}

/// Write every frame, then read the single response frame.
async fn send_and_receive(stream: &mut TcpStream, frames: &[Vec<u8>]) -> Result<Option<Vec<u8>>> {
    let (mut reader, mut writer) = stream.split();
    for frame in frames {
        write_frame(&mut writer, frame).await?;
    }
    read_frame(&mut reader).await
}
