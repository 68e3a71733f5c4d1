//! Source Side
//!
//! The process that hosts a backend exposes it as a [`RemoteSource`]. The
//! [`ProxyTransportAdapter`] turns replica calls into source invocations and
//! the resulting pending replies into wire returns. A [`SourceHost`] serves
//! the adapters of a [`SourceRegistry`] on one endpoint; each replica
//! connection acquires one of them by name.

use std::collections::HashMap;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ivi_core::{ConnectionSet, PendingReplyBase, Signal};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::mpsc;

use crate::config::Endpoint;
use crate::error::{RemoteError, RemoteResult};
use crate::ipc;
use crate::protocol::{
    Call, CallError, CallReply, CallReturn, PendingResult, PendingResultAvailable,
    PropertyChanged, Ready, RemoteSignal, ReplicaMessage, SourceMessage, object_name,
    to_remote_variant,
};

/// Notification pushed by a source to every connected replica
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    PropertyChanged { name: String, value: Value },
    Signal { name: String, args: Value },
}

impl SourceEvent {
    fn into_message(self) -> SourceMessage {
        match self {
            SourceEvent::PropertyChanged { name, value } => {
                SourceMessage::PropertyChanged(PropertyChanged { name, value })
            }
            SourceEvent::Signal { name, args } => {
                SourceMessage::RemoteSignal(RemoteSignal { name, args })
            }
        }
    }
}

/// An object that can be served to remote replicas
pub trait RemoteSource: Send + Sync + 'static {
    /// Identifies the interface revision; replicas expecting a different
    /// signature refuse the connection.
    fn signature(&self) -> String;

    /// Name replicas acquire this source by. Defaults to the signature
    /// without its revision suffix.
    fn name(&self) -> String {
        object_name(&self.signature()).to_string()
    }

    /// Current property values, sent to each replica on connect
    fn properties(&self) -> Map<String, Value>;

    fn invoke(&self, method: &str, args: &[Value]) -> RemoteResult<PendingReplyBase>;

    fn events(&self) -> &Signal<SourceEvent>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Source helper
// ─────────────────────────────────────────────────────────────────────────────

/// Allocates correlation ids for replies that are not ready yet and announces
/// their results once they resolve.
#[derive(Debug, Default)]
pub struct SourceHelper {
    counter: AtomicU64,
    results: Signal<PendingResultAvailable>,
}

impl SourceHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications for resolved pending results
    pub fn results(&self) -> &Signal<PendingResultAvailable> {
        &self.results
    }

    /// Convert a reply into what goes back over the wire.
    ///
    /// A reply that already succeeded is returned by value. Anything else gets
    /// the next correlation id; if it is unresolved, its eventual result is
    /// announced through [`SourceHelper::results`].
    pub fn from_pending_reply(&self, reply: &PendingReplyBase) -> CallReturn {
        if reply.is_result_available() && reply.is_successful() {
            return CallReturn::Value {
                value: to_remote_variant(reply.value()),
            };
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let on_success = self.results.clone();
        let on_failure = self.results.clone();
        let outcome = reply.then_if_pending(
            move |value| {
                on_success.emit(&PendingResultAvailable {
                    id,
                    success: true,
                    value: to_remote_variant(value.clone()),
                });
            },
            move || {
                on_failure.emit(&PendingResultAvailable {
                    id,
                    success: false,
                    value: Value::Null,
                });
            },
        );

        match outcome {
            None => CallReturn::Pending {
                result: PendingResult::new(id),
            },
            Some((true, value)) => CallReturn::Value {
                value: to_remote_variant(value),
            },
            Some((false, _)) => CallReturn::Pending {
                result: PendingResult::failed(id),
            },
        }
    }

    /// Ids handed out so far
    pub fn allocated(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Bridges a [`RemoteSource`] to the wire protocol
pub struct ProxyTransportAdapter {
    source: Arc<dyn RemoteSource>,
    helper: SourceHelper,
}

impl ProxyTransportAdapter {
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self {
            source,
            helper: SourceHelper::new(),
        }
    }

    pub fn source(&self) -> &Arc<dyn RemoteSource> {
        &self.source
    }

    pub fn helper(&self) -> &SourceHelper {
        &self.helper
    }

    pub fn name(&self) -> String {
        self.source.name()
    }

    pub fn snapshot(&self) -> Ready {
        Ready {
            name: self.source.name(),
            signature: self.source.signature(),
            properties: self.source.properties(),
        }
    }

    /// Run the source method named by `call`
    pub fn invoke(&self, call: &Call) -> RemoteResult<PendingReplyBase> {
        self.source.invoke(&call.method, &call.args)
    }

    /// Wire answer for `call_id` once `invoke` produced `reply`
    pub fn reply_message(&self, call_id: u64, reply: &PendingReplyBase) -> SourceMessage {
        SourceMessage::CallReply(CallReply {
            call_id,
            ret: self.helper.from_pending_reply(reply),
        })
    }

    /// Invoke and build the answer in one step
    pub fn dispatch(&self, call: &Call) -> SourceMessage {
        match self.invoke(call) {
            Ok(reply) => self.reply_message(call.call_id, &reply),
            Err(e) => SourceMessage::CallError(CallError {
                call_id: call.call_id,
                message: e.to_string(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Adapters served on one endpoint, keyed by object name. Clones share the
/// table, so sources can be added while the host is serving.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    adapters: Arc<RwLock<HashMap<String, Arc<ProxyTransportAdapter>>>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `adapter` under its source's name. Returns false if the name is
    /// already taken.
    pub fn enable_remoting(&self, adapter: Arc<ProxyTransportAdapter>) -> bool {
        let name = adapter.name();
        let mut adapters = self.adapters.write();
        if adapters.contains_key(&name) {
            tracing::warn!(%name, "A source with this name is already being served");
            return false;
        }
        tracing::debug!(%name, "Source enabled for remoting");
        adapters.insert(name, adapter);
        true
    }

    /// Stop offering `name` to new connections
    pub fn disable_remoting(&self, name: &str) -> bool {
        self.adapters.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyTransportAdapter>> {
        self.adapters.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl From<Arc<ProxyTransportAdapter>> for SourceRegistry {
    fn from(adapter: Arc<ProxyTransportAdapter>) -> Self {
        let registry = Self::new();
        registry.enable_remoting(adapter);
        registry
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host
// ─────────────────────────────────────────────────────────────────────────────

enum HostListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Local(UnixListener, PathBuf),
}

/// Serves the sources of a [`SourceRegistry`] on a listening endpoint
pub struct SourceHost {
    sources: SourceRegistry,
    listener: HostListener,
}

impl SourceHost {
    pub async fn bind(endpoint: &Endpoint, sources: impl Into<SourceRegistry>) -> RemoteResult<Self> {
        let sources = sources.into();
        let listener = match endpoint {
            Endpoint::Tcp(addr) => HostListener::Tcp(TcpListener::bind(addr).await?),
            #[cfg(unix)]
            Endpoint::Local(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                HostListener::Local(UnixListener::bind(path)?, path.clone())
            }
            #[cfg(not(unix))]
            Endpoint::Local(path) => {
                return Err(RemoteError::InvalidUrl(path.display().to_string()));
            }
        };
        tracing::info!(endpoint = %endpoint, sources = ?sources.names(), "Remote sources listening");
        Ok(Self { sources, listener })
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Bound TCP address, useful when binding to port 0
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            HostListener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            HostListener::Local(..) => None,
        }
    }

    /// Accept replica connections until the listener fails
    pub async fn serve(self) -> RemoteResult<()> {
        loop {
            match &self.listener {
                HostListener::Tcp(listener) => {
                    let (stream, peer) = listener.accept().await?;
                    tracing::debug!(%peer, "Replica connected");
                    spawn_connection(self.sources.clone(), stream);
                }
                #[cfg(unix)]
                HostListener::Local(listener, _) => {
                    let (stream, _) = listener.accept().await?;
                    tracing::debug!("Replica connected");
                    spawn_connection(self.sources.clone(), stream);
                }
            }
        }
    }
}

#[cfg(unix)]
impl Drop for SourceHost {
    fn drop(&mut self) {
        if let HostListener::Local(_, path) = &self.listener {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn spawn_connection<S>(sources: SourceRegistry, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = serve_connection(sources, stream).await {
            tracing::warn!(error = %e, "Replica connection closed with error");
        }
    });
}

type Outbox = Arc<Mutex<mpsc::UnboundedSender<SourceMessage>>>;

/// Serve a single replica over `stream` until it disconnects.
///
/// The replica's first message must acquire one of `sources` by name. All
/// outgoing messages pass through one locked outbox, so a call's reply is
/// always queued before the result notification for its correlation id.
pub async fn serve_connection<S>(sources: impl Into<SourceRegistry>, stream: S) -> RemoteResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let sources = sources.into();
    let (mut reader, mut writer) = ipc::split(stream);

    let name = match reader.recv().await? {
        Some(frame) => match ReplicaMessage::from_frame(&frame)? {
            ReplicaMessage::Acquire(acquire) => acquire.name,
            ReplicaMessage::Call(call) => {
                return Err(RemoteError::Handshake(format!(
                    "call to {} before acquiring a source",
                    call.method
                )));
            }
        },
        None => return Ok(()),
    };
    let Some(adapter) = sources.get(&name) else {
        tracing::warn!(%name, available = ?sources.names(), "Replica acquired an unknown source");
        return Err(RemoteError::Handshake(format!("no source named {}", name)));
    };
    tracing::debug!(%name, "Replica acquired source");
    let (tx, mut rx) = mpsc::unbounded_channel::<SourceMessage>();
    let outbox: Outbox = Arc::new(Mutex::new(tx));
    let mut connections = subscribe(&adapter, &outbox);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = message.to_frame()?;
            writer.send(&frame).await?;
        }
        Ok::<(), RemoteError>(())
    });

    let result = loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        match ReplicaMessage::from_frame(&frame) {
            Ok(ReplicaMessage::Call(call)) => handle_call(&adapter, &outbox, &call),
            Ok(ReplicaMessage::Acquire(acquire)) => {
                tracing::warn!(name = %acquire.name, "Source already acquired on this connection. Ignoring!")
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed replica message"),
        }
    };

    connections.disconnect_all();
    drop(outbox);
    match writer_task.await {
        Ok(Err(e)) => tracing::debug!(error = %e, "Replica writer stopped"),
        Err(e) => tracing::error!(error = ?e, "Replica writer task panicked"),
        Ok(Ok(())) => {}
    }
    tracing::debug!("Replica disconnected");
    result
}

fn subscribe(adapter: &ProxyTransportAdapter, outbox: &Outbox) -> ConnectionSet {
    let mut connections = ConnectionSet::new();
    let out = outbox.lock();

    let events_outbox = Arc::clone(outbox);
    connections.push(adapter.source().events().connect(move |event| {
        let _ = events_outbox.lock().send(event.clone().into_message());
    }));

    let results_outbox = Arc::clone(outbox);
    connections.push(adapter.helper().results().connect(move |result| {
        let _ = results_outbox
            .lock()
            .send(SourceMessage::PendingResultAvailable(result.clone()));
    }));

    let _ = out.send(SourceMessage::Ready(adapter.snapshot()));
    connections
}

fn handle_call(adapter: &ProxyTransportAdapter, outbox: &Outbox, call: &Call) {
    tracing::debug!(call_id = call.call_id, method = %call.method, "Remote call");
    match adapter.invoke(call) {
        Ok(reply) => {
            let out = outbox.lock();
            let _ = out.send(adapter.reply_message(call.call_id, &reply));
        }
        Err(e) => {
            tracing::warn!(method = %call.method, error = %e, "Remote call failed");
            let _ = outbox.lock().send(SourceMessage::CallError(CallError {
                call_id: call.call_id,
                message: e.to_string(),
            }));
        }
    }
}
