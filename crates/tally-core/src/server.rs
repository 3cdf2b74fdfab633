//! TCP RPC server.
//!
//! Binds a listener from an ordered list of candidate ports, accepts
//! connections, and routes JSON-RPC frames to an `RpcDispatch` implementation.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task, and each open client stream gets one more task that drives the
//! dispatcher while the connection keeps reading items. The dispatcher is
//! shared via `Arc` and handles its own synchronization.

use crate::config::RpcConfig;
use crate::protocol::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::{Result, TallyError};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Items of a client stream, in arrival order.
///
/// The stream ends cleanly when the client sends `<method>.end`, and yields an
/// error if the connection drops or breaks protocol first.
pub type ItemStream = BoxStream<'static, Result<serde_json::Value>>;

/// Trait for dispatching RPC calls to a service.
#[async_trait::async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    /// Dispatch a unary call and return its result.
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;

    /// Consume a client stream and return its single result.
    async fn dispatch_stream(&self, method: &str, items: ItemStream) -> Result<serde_json::Value> {
        drop(items);
        Err(TallyError::MethodNotFound {
            method: method.to_string(),
        })
    }
}

/// A listener that has claimed one of its candidate ports.
#[derive(Debug)]
pub struct BoundListener {
    listener: TcpListener,
    addr: SocketAddr,
    max_connections: usize,
}

impl BoundListener {
    /// Bind the first candidate port that is available.
    ///
    /// Ports are tried in order. Fails with `BindExhausted` once every
    /// candidate has failed, including when the list is empty.
    pub async fn bind(host: &str, candidate_ports: &[u16]) -> Result<Self> {
        for &port in candidate_ports {
            debug!("Attempting to create listener on {}:{}", host, port);
            match TcpListener::bind((host, port)).await {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    info!("Listening on {}", addr);
                    return Ok(Self {
                        listener,
                        addr,
                        max_connections: RpcConfig::MAX_CONNECTIONS,
                    });
                }
                Err(e) => {
                    warn!("Failed to listen on {}:{}: {}", host, port, e);
                }
            }
        }

        Err(TallyError::BindExhausted {
            host: host.to_string(),
            attempted: candidate_ports.to_vec(),
        })
    }

    /// Get the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Limit the number of connections served at once.
    ///
    /// Connections beyond the limit are accepted and closed immediately.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Stops accepting on shutdown and signals every open connection to close.
    pub async fn serve<D, F>(self, dispatch: Arc<D>, shutdown: F)
    where
        D: RpcDispatch,
        F: Future<Output = ()> + Send,
    {
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        accept_loop(
            self.listener,
            self.max_connections,
            dispatch,
            shutdown,
            conn_shutdown_rx,
            active_connections,
        )
        .await;

        let _ = conn_shutdown_tx.send(true);
    }

    /// Serve in a background task.
    pub fn spawn<D: RpcDispatch>(self, dispatch: Arc<D>) -> ServerHandle {
        let addr = self.addr;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task_handle = tokio::spawn(self.serve(dispatch, async move {
            let _ = shutdown_rx.await;
        }));

        ServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        }
    }
}

/// Handle to a server running in the background. Dropping shuts it down.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close the open ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Shut down and wait for the accept loop to exit.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

async fn accept_loop<D, F>(
    listener: TcpListener,
    max_connections: usize,
    dispatch: Arc<D>,
    shutdown: F,
    conn_shutdown_rx: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
) where
    D: RpcDispatch,
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let current = active_connections.load(Ordering::Relaxed);
                        if current >= max_connections {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                peer_addr, max_connections
                            );
                            drop(stream);
                            continue;
                        }

                        active_connections.fetch_add(1, Ordering::Relaxed);
                        let dispatch = dispatch.clone();
                        let conns = active_connections.clone();
                        let mut conn_shutdown = conn_shutdown_rx.clone();

                        tokio::spawn(async move {
                            debug!("Connection from {}", peer_addr);
                            if let Err(e) = handle_connection(stream, dispatch, &mut conn_shutdown).await {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                            conns.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

/// A client stream in progress on one connection.
struct OpenStream {
    method: String,
    tx: mpsc::Sender<Result<serde_json::Value>>,
    task: JoinHandle<Result<serde_json::Value>>,
}

impl OpenStream {
    const BUFFER: usize = 64;

    fn open<D: RpcDispatch>(dispatch: Arc<D>, method: &str) -> Self {
        let (tx, rx) = mpsc::channel(Self::BUFFER);
        let stream_method = method.to_string();
        let task = tokio::spawn(async move {
            dispatch
                .dispatch_stream(&stream_method, rx.boxed())
                .await
        });

        Self {
            method: method.to_string(),
            tx,
            task,
        }
    }

    async fn push(&mut self, item: Result<serde_json::Value>) {
        // The dispatcher may have stopped early; its result is collected on finish.
        let _ = self.tx.send(item).await;
    }

    /// Close the stream cleanly and collect the dispatcher's result.
    async fn finish(self) -> Result<serde_json::Value> {
        drop(self.tx);
        self.task.await.map_err(|e| TallyError::StreamAborted {
            message: e.to_string(),
        })?
    }

    /// Fail the stream; the dispatcher sees an error item and no clean end.
    async fn abort(mut self, reason: &str) {
        let method = self.method.clone();
        self.push(Err(TallyError::StreamAborted {
            message: reason.to_string(),
        }))
        .await;
        match self.finish().await {
            Ok(_) => debug!("Stream {} closed after abort: {}", method, reason),
            Err(e) => debug!("Stream {} aborted: {}", method, e),
        }
    }
}

async fn handle_connection<D: RpcDispatch>(
    mut stream: TcpStream,
    dispatch: Arc<D>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.split();
    let mut open: Option<OpenStream> = None;

    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => {
                match result {
                    Ok(Some(f)) => f,
                    Ok(None) => {
                        if let Some(s) = open.take() {
                            s.abort("peer closed the connection mid-stream").await;
                        }
                        return Ok(());
                    }
                    Err(e) => {
                        if let Some(s) = open.take() {
                            s.abort(&e.to_string()).await;
                        }
                        return Err(e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if let Some(s) = open.take() {
                    s.abort("server shutting down").await;
                }
                return Ok(());
            }
        };

        let request = match parse_request(&frame) {
            Ok(request) => request,
            Err(response) => {
                if let Some(s) = open.take() {
                    s.abort("malformed frame").await;
                }
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        let params = request
            .params
            .clone()
            .unwrap_or(serde_json::Value::Object(Default::default()));

        if request.is_notification() {
            if open.as_ref().is_some_and(|s| s.method != request.method) {
                if let Some(s) = open.take() {
                    s.abort("stream interrupted by another stream").await;
                }
            }
            let s = open.get_or_insert_with(|| OpenStream::open(dispatch.clone(), &request.method));
            s.push(Ok(params)).await;
            continue;
        }

        let result = if let Some(stream_method) = request.closed_stream() {
            let s = match open.take() {
                Some(s) if s.method == stream_method => s,
                other => {
                    if let Some(s) = other {
                        s.abort("stream interrupted by another stream").await;
                    }
                    // A stream closed before any item was sent is an empty stream.
                    OpenStream::open(dispatch.clone(), stream_method)
                }
            };
            s.finish().await
        } else {
            if let Some(s) = open.take() {
                s.abort("stream interrupted by a unary call").await;
            }
            dispatch.dispatch(&request.method, params).await
        };

        let response = match result {
            Ok(value) => RpcResponse::success(request.id, value),
            Err(e) => {
                debug!("RPC error for {}: {}", request.method, e);
                RpcResponse::from_error(request.id, &e)
            }
        };
        write_response(&mut writer, &response).await?;
    }
}

fn parse_request(frame: &[u8]) -> std::result::Result<RpcRequest, RpcResponse> {
    let request: RpcRequest = serde_json::from_slice(frame).map_err(|e| {
        RpcResponse::error(
            None,
            crate::error::codes::PARSE_ERROR,
            format!("Parse error: {}", e),
        )
    })?;

    if request.jsonrpc != "2.0" {
        return Err(RpcResponse::error(
            request.id,
            crate::error::codes::INVALID_REQUEST,
            "Invalid Request: expected jsonrpc 2.0".to_string(),
        ));
    }

    Ok(request)
}

async fn write_response<W>(writer: &mut W, response: &RpcResponse) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    let bytes = serde_json::to_vec(response)?;
    write_frame(writer, &bytes).await
}
