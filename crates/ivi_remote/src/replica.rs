//! Replica Side
//!
//! [`ReplicaHelper`] keeps the table of correlation ids still waiting for a
//! result and maps connection trouble onto feature errors. [`ReplicaNode`] is
//! the client connection to one named source: it acquires the source, checks
//! its signature, mirrors the
//! source's properties and routes call replies back to their pending replies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use ivi_core::{FeatureError, PendingReply, PendingReplyBase, Signal};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Endpoint;
use crate::error::{RemoteError, RemoteResult};
use crate::ipc;
use crate::protocol::{
    Acquire, Call, CallReturn, NodeError, PropertyChanged, RemoteSignal, ReplicaMessage,
    ReplicaState, SourceMessage, from_remote_variant, object_name,
};

// ─────────────────────────────────────────────────────────────────────────────
// Replica helper
// ─────────────────────────────────────────────────────────────────────────────

/// Client-side bookkeeping of deferred results
#[derive(Debug)]
pub struct ReplicaHelper {
    pending: DashMap<u64, PendingReplyBase>,
    error_changed: Signal<(FeatureError, String)>,
}

impl ReplicaHelper {
    /// Errors are reported through `error_changed`, typically the owning
    /// backend's error signal.
    pub fn new(error_changed: Signal<(FeatureError, String)>) -> Self {
        Self {
            pending: DashMap::new(),
            error_changed,
        }
    }

    pub fn error_changed(&self) -> &Signal<(FeatureError, String)> {
        &self.error_changed
    }

    /// Resolve `reply` from a call's wire return, or park it under its
    /// correlation id until the result arrives.
    pub fn resolve_call_return(&self, reply: &PendingReplyBase, ret: CallReturn) {
        match ret {
            CallReturn::Value { value } => {
                reply.set_success(from_remote_variant(value));
            }
            CallReturn::Pending { result } if result.failed => {
                reply.set_failed();
            }
            CallReturn::Pending { result } => self.register_call(result.id, reply.clone()),
        }
    }

    /// Park `reply` until the result for `id` arrives
    pub fn register_call(&self, id: u64, reply: PendingReplyBase) {
        if self.pending.insert(id, reply).is_some() {
            tracing::warn!(id, "Correlation id reused, replacing the older reply");
        }
    }

    /// Deliver a result notification. Unknown ids are dropped.
    pub fn on_pending_result_available(&self, id: u64, success: bool, value: Value) {
        let Some((_, reply)) = self.pending.remove(&id) else {
            tracing::warn!(id, "Received a result for an unexpected id. Ignoring!");
            return;
        };

        if success {
            reply.set_success(from_remote_variant(value));
        } else {
            reply.set_failed();
        }
    }

    pub fn on_replica_state_changed(&self, new_state: ReplicaState, old_state: ReplicaState) {
        tracing::debug!(?old_state, ?new_state, "Replica state changed");
        match new_state {
            ReplicaState::Suspect => {
                tracing::warn!(?old_state, "Connection to the source lost");
                self.report(FeatureError::Unknown, "connection to the source lost")
            }
            ReplicaState::SignatureMismatch => {
                tracing::warn!(?old_state, "Source signature does not match the replica");
                self.report(FeatureError::Unknown, "signature mismatch")
            }
            ReplicaState::Valid => self.report(FeatureError::NoError, ""),
            ReplicaState::Uninitialized | ReplicaState::Default => {}
        }
    }

    pub fn on_node_error(&self, error: NodeError) {
        tracing::warn!(%error, "Remote node error");
        self.report(FeatureError::Unknown, &format!("remote node error, code: {}", error));
    }

    pub fn from_remote_variant(value: Value) -> Value {
        from_remote_variant(value)
    }

    /// Fail every parked reply. Returns how many there were.
    pub fn clear_pending(&self) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                reply.set_failed();
                failed += 1;
            }
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn report(&self, code: FeatureError, message: &str) {
        self.error_changed.emit(&(code, message.to_string()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replica node
// ─────────────────────────────────────────────────────────────────────────────

/// Notifications of a replica connection
#[derive(Debug, Default)]
pub struct ReplicaSignals {
    /// `(new, old)`
    pub state_changed: Signal<(ReplicaState, ReplicaState)>,
    /// The source's property snapshot was received
    pub initialized: Signal<Map<String, Value>>,
    pub property_changed: Signal<PropertyChanged>,
    pub remote_signal: Signal<RemoteSignal>,
}

struct NodeInner {
    name: String,
    signature: String,
    helper: ReplicaHelper,
    state: Mutex<ReplicaState>,
    properties: Mutex<Map<String, Value>>,
    calls: DashMap<u64, PendingReplyBase>,
    next_call_id: AtomicU64,
    outbox: Mutex<Option<mpsc::UnboundedSender<ReplicaMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    signals: ReplicaSignals,
}

/// Client connection to one source. Clones share the connection.
#[derive(Clone)]
pub struct ReplicaNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for ReplicaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaNode")
            .field("name", &self.inner.name)
            .field("signature", &self.inner.signature)
            .field("state", &self.state())
            .finish()
    }
}

impl ReplicaNode {
    /// A node expecting a source with `signature`, acquired by the name the
    /// signature implies
    pub fn new(signature: impl Into<String>, error_changed: Signal<(FeatureError, String)>) -> Self {
        let signature = signature.into();
        let name = object_name(&signature).to_string();
        Self::with_name(name, signature, error_changed)
    }

    /// A node acquiring the source called `name`
    pub fn with_name(
        name: impl Into<String>,
        signature: impl Into<String>,
        error_changed: Signal<(FeatureError, String)>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                name: name.into(),
                signature: signature.into(),
                helper: ReplicaHelper::new(error_changed),
                state: Mutex::new(ReplicaState::Uninitialized),
                properties: Mutex::new(Map::new()),
                calls: DashMap::new(),
                next_call_id: AtomicU64::new(0),
                outbox: Mutex::new(None),
                task: Mutex::new(None),
                signals: ReplicaSignals::default(),
            }),
        }
    }

    pub fn signals(&self) -> &ReplicaSignals {
        &self.inner.signals
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn helper(&self) -> &ReplicaHelper {
        &self.inner.helper
    }

    pub fn state(&self) -> ReplicaState {
        *self.inner.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == ReplicaState::Valid
    }

    pub fn properties(&self) -> Map<String, Value> {
        self.inner.properties.lock().clone()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.inner.properties.lock().get(name).cloned()
    }

    /// Connect to `endpoint` in the background
    pub fn connect(&self, endpoint: Endpoint) -> RemoteResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;
        self.inner.set_state(ReplicaState::Default);

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            tracing::debug!(endpoint = %endpoint, "Connecting to remote source");
            let result = match &endpoint {
                Endpoint::Tcp(addr) => match tokio::net::TcpStream::connect(addr).await {
                    Ok(stream) => {
                        run(inner.clone(), stream).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                #[cfg(unix)]
                Endpoint::Local(path) => match tokio::net::UnixStream::connect(path).await {
                    Ok(stream) => {
                        run(inner.clone(), stream).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                #[cfg(not(unix))]
                Endpoint::Local(_) => {
                    inner.helper.on_node_error(NodeError::HostUrlInvalid);
                    return;
                }
            };

            if let Err(e) = result {
                tracing::warn!(endpoint = %endpoint, error = %e, "Failed to connect to remote source");
                inner.helper.on_node_error(NodeError::ConnectionRefused);
            }
        });
        self.inner.replace_task(task);
        Ok(())
    }

    /// Run the protocol over an already established stream
    pub fn attach<S>(&self, stream: S) -> RemoteResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;
        self.inner.set_state(ReplicaState::Default);
        let task = runtime.spawn(run(Arc::clone(&self.inner), stream));
        self.inner.replace_task(task);
        Ok(())
    }

    /// Log an error if the source has not answered within `timeout`. The
    /// connection is not retried.
    pub fn watch_initialization(&self, endpoint: Endpoint, timeout: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let node = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if !node.is_initialized() {
                tracing::error!(
                    "{} wasn't initialized within the timeout period. Please make sure the server is running.",
                    endpoint
                );
            }
        });
    }

    /// Drop the connection. Outstanding calls fail.
    pub fn disconnect(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.abort();
            self.inner.connection_lost();
        }
    }

    /// Call `method` on the source; the reply resolves when its result arrives
    pub fn call(&self, method: &str, args: Vec<Value>) -> PendingReplyBase {
        let reply = PendingReplyBase::new();
        self.call_with(method, args, reply.clone());
        reply
    }

    /// Typed variant of [`ReplicaNode::call`]
    pub fn call_typed<T>(&self, method: &str, args: Vec<Value>) -> PendingReply<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let reply = PendingReply::<T>::new();
        self.call_with(method, args, reply.base().clone());
        reply
    }

    /// Call `method`, resolving the given `reply`
    pub fn call_with(&self, method: &str, args: Vec<Value>, reply: PendingReplyBase) {
        if !self.is_initialized() {
            tracing::warn!(method, "Remote source is not available, failing call");
            reply.set_failed();
            return;
        }
        let Some(outbox) = self.inner.outbox.lock().clone() else {
            tracing::warn!(method, "Not connected to the remote source, failing call");
            reply.set_failed();
            return;
        };

        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.calls.insert(call_id, reply);

        let message = ReplicaMessage::Call(Call {
            call_id,
            method: method.to_string(),
            args,
        });
        if outbox.send(message).is_err() {
            if let Some((_, reply)) = self.inner.calls.remove(&call_id) {
                reply.set_failed();
            }
        }
    }

    /// Calls waiting for their wire reply
    pub fn outstanding_calls(&self) -> usize {
        self.inner.calls.len()
    }
}

impl NodeInner {
    fn replace_task(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    fn set_state(&self, new_state: ReplicaState) {
        let old_state = std::mem::replace(&mut *self.state.lock(), new_state);
        if old_state != new_state {
            self.helper.on_replica_state_changed(new_state, old_state);
            self.signals.state_changed.emit(&(new_state, old_state));
        }
    }

    /// Returns false when the connection must be dropped
    fn handle(&self, message: SourceMessage) -> bool {
        match message {
            SourceMessage::Ready(ready) => {
                if ready.signature != self.signature {
                    tracing::error!(
                        expected = %self.signature,
                        actual = %ready.signature,
                        "Remote source signature mismatch"
                    );
                    self.set_state(ReplicaState::SignatureMismatch);
                    return false;
                }
                *self.properties.lock() = ready.properties.clone();
                self.set_state(ReplicaState::Valid);
                self.signals.initialized.emit(&ready.properties);
            }
            SourceMessage::PropertyChanged(change) => {
                self.properties
                    .lock()
                    .insert(change.name.clone(), change.value.clone());
                self.signals.property_changed.emit(&change);
            }
            SourceMessage::RemoteSignal(signal) => {
                self.signals.remote_signal.emit(&signal);
            }
            SourceMessage::CallReply(reply) => match self.calls.remove(&reply.call_id) {
                Some((_, pending)) => self.helper.resolve_call_return(&pending, reply.ret),
                None => tracing::warn!(call_id = reply.call_id, "Reply for an unknown call. Ignoring!"),
            },
            SourceMessage::CallError(error) => {
                tracing::warn!(call_id = error.call_id, detail = %error.message, "Remote call failed");
                if let Some((_, pending)) = self.calls.remove(&error.call_id) {
                    pending.set_failed();
                }
            }
            SourceMessage::PendingResultAvailable(result) => {
                self.helper
                    .on_pending_result_available(result.id, result.success, result.value);
            }
        }
        true
    }

    fn connection_lost(&self) {
        self.outbox.lock().take();

        let ids: Vec<u64> = self.calls.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.calls.remove(&id) {
                reply.set_failed();
            }
        }
        let parked = self.helper.clear_pending();
        if parked > 0 {
            tracing::debug!(parked, "Failed pending results after connection loss");
        }

        if *self.state.lock() != ReplicaState::SignatureMismatch {
            self.set_state(ReplicaState::Suspect);
        }
    }
}

async fn run<S>(inner: Arc<NodeInner>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = ipc::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<ReplicaMessage>();
    let _ = tx.send(ReplicaMessage::Acquire(Acquire {
        name: inner.name.clone(),
    }));
    *inner.outbox.lock() = Some(tx);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = message.to_frame()?;
            writer.send(&frame).await?;
        }
        Ok::<(), RemoteError>(())
    });

    loop {
        match reader.recv().await {
            Ok(Some(frame)) => match SourceMessage::from_frame(&frame) {
                Ok(message) => {
                    if !inner.handle(message) {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed source message"),
            },
            Ok(None) => {
                tracing::info!("Remote source closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Remote connection failed");
                inner.helper.on_node_error(NodeError::SocketAccessError);
                break;
            }
        }
    }

    inner.connection_lost();
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PendingResult, to_remote_variant};
    use crate::source::{ProxyTransportAdapter, RemoteSource, SourceEvent, serve_connection};
    use serde_json::json;

    fn helper() -> (ReplicaHelper, Arc<Mutex<Vec<(FeatureError, String)>>>) {
        let errors = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        errors.connect(move |e: &(FeatureError, String)| s.lock().push(e.clone()));
        (ReplicaHelper::new(errors), seen)
    }

    #[test]
    fn test_value_return_resolves_immediately() {
        let (helper, _) = helper();
        let reply = PendingReply::<u32>::new();
        helper.resolve_call_return(reply.base(), CallReturn::Value { value: to_remote_variant(json!(4)) });
        assert_eq!(reply.value(), Some(4));
        assert_eq!(helper.pending_count(), 0);
    }

    #[test]
    fn test_pending_result_resolves_exactly_once() {
        let (helper, _) = helper();
        let reply = PendingReply::<String>::new();
        helper.resolve_call_return(reply.base(), CallReturn::Pending { result: PendingResult::new(7) });
        assert!(!reply.is_result_available());
        assert_eq!(helper.pending_count(), 1);

        helper.on_pending_result_available(7, true, to_remote_variant(json!("first")));
        helper.on_pending_result_available(7, true, to_remote_variant(json!("second")));
        assert_eq!(reply.value().as_deref(), Some("first"));
        assert_eq!(helper.pending_count(), 0);
    }

    #[test]
    fn test_unknown_id_is_dropped() {
        let (helper, errors) = helper();
        helper.on_pending_result_available(12345, true, json!(1));
        assert_eq!(helper.pending_count(), 0);
        assert!(errors.lock().is_empty());
    }

    #[test]
    fn test_failed_pending_result() {
        let (helper, _) = helper();
        let failed_now = PendingReplyBase::new();
        helper.resolve_call_return(&failed_now, CallReturn::Pending { result: PendingResult::failed(1) });
        assert!(failed_now.is_result_available());
        assert!(!failed_now.is_successful());

        let failed_later = PendingReplyBase::new();
        helper.resolve_call_return(&failed_later, CallReturn::Pending { result: PendingResult::new(2) });
        helper.on_pending_result_available(2, false, Value::Null);
        assert!(failed_later.is_result_available());
        assert!(!failed_later.is_successful());
    }

    #[test]
    fn test_state_changes_map_to_errors() {
        let (helper, errors) = helper();
        helper.on_replica_state_changed(ReplicaState::Suspect, ReplicaState::Valid);
        helper.on_replica_state_changed(ReplicaState::SignatureMismatch, ReplicaState::Default);
        helper.on_replica_state_changed(ReplicaState::Valid, ReplicaState::Suspect);
        helper.on_node_error(NodeError::ConnectionRefused);

        assert_eq!(
            *errors.lock(),
            vec![
                (FeatureError::Unknown, "connection to the source lost".to_string()),
                (FeatureError::Unknown, "signature mismatch".to_string()),
                (FeatureError::NoError, String::new()),
                (FeatureError::Unknown, "remote node error, code: ConnectionRefused".to_string()),
            ]
        );
    }

    #[test]
    fn test_clear_pending_fails_parked_replies() {
        let (helper, _) = helper();
        let reply = PendingReplyBase::new();
        helper.resolve_call_return(&reply, CallReturn::Pending { result: PendingResult::new(3) });
        assert_eq!(helper.clear_pending(), 1);
        assert!(reply.is_result_available());
        assert!(!reply.is_successful());
        helper.on_pending_result_available(3, true, json!(1));
        assert!(!reply.is_successful());
    }

    #[test]
    fn test_call_without_connection_fails() {
        let node = ReplicaNode::new("sig", Signal::new());
        let reply = node.call("anything", vec![]);
        assert!(reply.is_result_available());
        assert!(!reply.is_successful());

        let typed = node.call_typed::<i32>("anything", vec![]);
        assert!(tokio_test::block_on(typed.wait()).is_err());
    }

    #[derive(Default)]
    struct Echo {
        events: Signal<SourceEvent>,
        deferred: Mutex<Vec<PendingReplyBase>>,
    }

    impl RemoteSource for Echo {
        fn signature(&self) -> String {
            "test.echo/1".to_string()
        }

        fn properties(&self) -> Map<String, Value> {
            let mut map = Map::new();
            map.insert("greeting".to_string(), json!("hi"));
            map
        }

        fn invoke(&self, method: &str, args: &[Value]) -> RemoteResult<PendingReplyBase> {
            let reply = PendingReplyBase::new();
            match method {
                "echo" => {
                    reply.set_success(args.first().cloned().unwrap_or(Value::Null));
                }
                "echo_later" => self.deferred.lock().push(reply.clone()),
                other => return Err(RemoteError::UnknownMethod(other.to_string())),
            }
            Ok(reply)
        }

        fn events(&self) -> &Signal<SourceEvent> {
            &self.events
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let source = Arc::new(Echo::default());
        let adapter = Arc::new(ProxyTransportAdapter::new(source.clone()));
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(adapter, server));

        let node = ReplicaNode::new("test.echo/1", Signal::new());
        node.attach(client).unwrap();
        wait_until(|| node.is_initialized()).await;
        assert_eq!(node.property("greeting"), Some(json!("hi")));

        let now = node.call_typed::<String>("echo", vec![json!("ping")]);
        assert_eq!(now.wait().await.unwrap(), "ping");

        let later = node.call_typed::<u32>("echo_later", vec![]);
        wait_until(|| source.deferred.lock().len() == 1).await;
        wait_until(|| node.helper().pending_count() == 1).await;
        let deferred = source.deferred.lock().pop().unwrap();
        deferred.set_success(json!(42));
        assert_eq!(later.wait().await.unwrap(), 42);

        let missing = node.call("nope", vec![]);
        wait_until(|| missing.is_result_available()).await;
        assert!(!missing.is_successful());

        source.events.emit(&SourceEvent::PropertyChanged {
            name: "greeting".to_string(),
            value: json!("hello"),
        });
        wait_until(|| node.property("greeting") == Some(json!("hello"))).await;
    }

    #[tokio::test]
    async fn test_disconnect_fails_calls() {
        let source = Arc::new(Echo::default());
        let adapter = Arc::new(ProxyTransportAdapter::new(source.clone()));
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(adapter, server));

        let node = ReplicaNode::new("test.echo/1", Signal::new());
        node.attach(client).unwrap();
        wait_until(|| node.is_initialized()).await;

        let later = node.call("echo_later", vec![]);
        wait_until(|| node.helper().pending_count() == 1).await;

        node.disconnect();
        assert_eq!(node.state(), ReplicaState::Suspect);
        assert!(later.is_result_available());
        assert!(!later.is_successful());
        assert_eq!(node.helper().pending_count(), 0);

        let after = node.call("echo", vec![json!(1)]);
        assert!(!after.is_successful());
    }

    #[tokio::test]
    async fn test_signature_mismatch() {
        let adapter = Arc::new(ProxyTransportAdapter::new(Arc::new(Echo::default())));
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(adapter, server));

        let errors = Signal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        errors.connect(move |e: &(FeatureError, String)| s.lock().push(e.clone()));

        let node = ReplicaNode::new("test.echo/2", errors);
        node.attach(client).unwrap();
        wait_until(|| node.state() == ReplicaState::SignatureMismatch).await;
        assert!(!node.is_initialized());
        assert!(seen.lock().contains(&(FeatureError::Unknown, "signature mismatch".to_string())));
    }

    #[tokio::test]
    async fn test_connection_loss_is_suspect() {
        let (client, server) = tokio::io::duplex(4096);
        let node = ReplicaNode::new("test.echo/1", Signal::new());
        node.attach(client).unwrap();

        let (_, mut writer) = ipc::split(server);
        writer
            .send(
                &SourceMessage::Ready(crate::protocol::Ready {
                    name: "test.echo".to_string(),
                    signature: "test.echo/1".to_string(),
                    properties: Map::new(),
                })
                .to_frame()
                .unwrap(),
            )
            .await
            .unwrap();
        wait_until(|| node.is_initialized()).await;

        let reply = node.call("echo_later", vec![]);
        wait_until(|| node.outstanding_calls() == 1).await;
        drop(writer);

        wait_until(|| node.state() == ReplicaState::Suspect).await;
        assert!(reply.is_result_available());
        assert!(!reply.is_successful());
    }
}
