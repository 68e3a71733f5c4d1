//! Pending Replies
//!
//! A call that cannot complete synchronously hands back a [`PendingReply`]
//! right away. All copies of a reply share one [`PendingReplyWatcher`], which
//! is resolved exactly once, either with a value or as failed. Later attempts
//! to resolve it again are ignored and logged.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::signal::Signal;

type SuccessFn = Box<dyn FnOnce(&Value) + Send>;
type FailureFn = Box<dyn FnOnce() + Send>;

struct Continuation {
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
}

impl Continuation {
    fn run(self, success: bool, value: &Value) {
        if success {
            if let Some(f) = self.on_success {
                f(value);
            }
        } else if let Some(f) = self.on_failure {
            f();
        }
    }
}

#[derive(Default)]
struct WatcherState {
    result_available: bool,
    success: bool,
    value: Value,
    continuations: Vec<Continuation>,
}

fn accepts_any(_: &Value) -> bool {
    true
}

fn accepts_type<T: DeserializeOwned>(value: &Value) -> bool {
    serde_json::from_value::<T>(value.clone()).is_ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Watcher
// ─────────────────────────────────────────────────────────────────────────────

/// Shared result cell behind every copy of a pending reply
pub struct PendingReplyWatcher {
    type_name: &'static str,
    accepts: fn(&Value) -> bool,
    state: Mutex<WatcherState>,
    value_changed: Signal<Value>,
    reply_success: Signal<()>,
    reply_failed: Signal<()>,
}

impl std::fmt::Debug for PendingReplyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PendingReplyWatcher")
            .field("type_name", &self.type_name)
            .field("result_available", &state.result_available)
            .field("success", &state.success)
            .field("value", &state.value)
            .finish()
    }
}

impl PendingReplyWatcher {
    fn new(type_name: &'static str, accepts: fn(&Value) -> bool) -> Self {
        Self {
            type_name,
            accepts,
            state: Mutex::new(WatcherState::default()),
            value_changed: Signal::new(),
            reply_success: Signal::new(),
            reply_failed: Signal::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_result_available(&self) -> bool {
        self.state.lock().result_available
    }

    /// Only meaningful once the result is available
    pub fn is_successful(&self) -> bool {
        self.state.lock().success
    }

    /// The resolved value, `Null` until a successful resolution
    pub fn value(&self) -> Value {
        self.state.lock().value.clone()
    }

    pub fn value_changed(&self) -> &Signal<Value> {
        &self.value_changed
    }

    pub fn reply_success(&self) -> &Signal<()> {
        &self.reply_success
    }

    pub fn reply_failed(&self) -> &Signal<()> {
        &self.reply_failed
    }

    fn then(&self, continuation: Continuation) {
        if let Err((continuation, success, value)) = self.register(continuation) {
            continuation.run(success, &value);
        }
    }

    /// Queue `continuation` if unresolved; otherwise hand it back together
    /// with the outcome.
    fn register(
        &self,
        continuation: Continuation,
    ) -> std::result::Result<(), (Continuation, bool, Value)> {
        let mut state = self.state.lock();
        if state.result_available {
            return Err((continuation, state.success, state.value.clone()));
        }
        state.continuations.push(continuation);
        Ok(())
    }

    fn resolve(&self, success: bool, value: Value) -> bool {
        let continuations = {
            let mut state = self.state.lock();
            if state.result_available {
                tracing::warn!(
                    type_name = self.type_name,
                    "Result is already set. Ignoring request"
                );
                return false;
            }
            if success && !(self.accepts)(&value) {
                tracing::warn!(
                    type_name = self.type_name,
                    value = %value,
                    "Result value does not match the reply type. Ignoring request"
                );
                return false;
            }

            state.result_available = true;
            state.success = success;
            state.value = value.clone();
            std::mem::take(&mut state.continuations)
        };

        if success {
            self.value_changed.emit(&value);
            self.reply_success.notify();
        } else {
            self.reply_failed.notify();
        }

        for continuation in continuations {
            continuation.run(success, &value);
        }
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Untyped reply
// ─────────────────────────────────────────────────────────────────────────────

/// Untyped handle to a pending result. Clones share the watcher.
#[derive(Debug, Clone)]
pub struct PendingReplyBase {
    watcher: Arc<PendingReplyWatcher>,
}

impl Default for PendingReplyBase {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReplyBase {
    /// A reply accepting any value
    pub fn new() -> Self {
        Self {
            watcher: Arc::new(PendingReplyWatcher::new("Value", accepts_any)),
        }
    }

    pub fn watcher(&self) -> &Arc<PendingReplyWatcher> {
        &self.watcher
    }

    pub fn is_result_available(&self) -> bool {
        self.watcher.is_result_available()
    }

    pub fn is_successful(&self) -> bool {
        self.watcher.is_successful()
    }

    pub fn value(&self) -> Value {
        self.watcher.value()
    }

    /// Resolve successfully. Returns false if the reply was already resolved
    /// or the value does not fit the reply type.
    pub fn set_success(&self, value: Value) -> bool {
        self.watcher.resolve(true, value)
    }

    /// Resolve as failed. Returns false if the reply was already resolved.
    pub fn set_failed(&self) -> bool {
        self.watcher.resolve(false, Value::Null)
    }

    /// Register continuations. If the reply is already resolved the matching
    /// one runs immediately.
    pub fn then<S, F>(&self, on_success: S, on_failure: F)
    where
        S: FnOnce(&Value) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.watcher.then(Continuation {
            on_success: Some(Box::new(on_success)),
            on_failure: Some(Box::new(on_failure)),
        });
    }

    /// Like [`PendingReplyBase::then`], but never runs a continuation
    /// synchronously: an already resolved reply returns its outcome
    /// `(success, value)` instead.
    pub fn then_if_pending<S, F>(&self, on_success: S, on_failure: F) -> Option<(bool, Value)>
    where
        S: FnOnce(&Value) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let continuation = Continuation {
            on_success: Some(Box::new(on_success)),
            on_failure: Some(Box::new(on_failure)),
        };
        match self.watcher.register(continuation) {
            Ok(()) => None,
            Err((_, success, value)) => Some((success, value)),
        }
    }

    /// Whether both handles share one watcher
    pub fn same_reply(&self, other: &PendingReplyBase) -> bool {
        Arc::ptr_eq(&self.watcher, &other.watcher)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed reply
// ─────────────────────────────────────────────────────────────────────────────

/// Typed view over a [`PendingReplyBase`]. Resolution with a value that does
/// not deserialize into `T` is rejected.
pub struct PendingReply<T> {
    base: PendingReplyBase,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PendingReply<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PendingReply").field(&self.base).finish()
    }
}

impl<T> Default for PendingReply<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingReply<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            base: PendingReplyBase {
                watcher: Arc::new(PendingReplyWatcher::new(
                    std::any::type_name::<T>(),
                    accepts_type::<T>,
                )),
            },
            _marker: PhantomData,
        }
    }

    /// A reply that is already resolved with `value`
    pub fn ready(value: T) -> Self {
        let reply = Self::new();
        reply.set_success(value);
        reply
    }

    /// A reply that is already resolved as failed
    pub fn create_failed_reply() -> Self {
        let reply = Self::new();
        reply.set_failed();
        reply
    }

    pub fn base(&self) -> &PendingReplyBase {
        &self.base
    }

    pub fn into_base(self) -> PendingReplyBase {
        self.base
    }

    pub fn is_result_available(&self) -> bool {
        self.base.is_result_available()
    }

    pub fn is_successful(&self) -> bool {
        self.base.is_successful()
    }

    /// The resolved value, if the reply succeeded
    pub fn value(&self) -> Option<T> {
        if !(self.base.is_result_available() && self.base.is_successful()) {
            return None;
        }
        serde_json::from_value(self.base.value()).ok()
    }

    pub fn set_success(&self, value: T) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.base.set_success(value),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode reply value");
                false
            }
        }
    }

    pub fn set_failed(&self) -> bool {
        self.base.set_failed()
    }

    pub fn then<S, F>(&self, on_success: S, on_failure: F)
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.base.then(
            move |value| {
                if let Ok(value) = serde_json::from_value::<T>(value.clone()) {
                    on_success(value);
                }
            },
            on_failure,
        );
    }

    /// Wait for the reply to resolve
    pub async fn wait(&self) -> Result<T> {
        let (tx, rx) = oneshot::channel::<Option<Value>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_failed = Arc::clone(&tx);

        self.base.then(
            move |value| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(Some(value.clone()));
                }
            },
            move || {
                if let Some(tx) = tx_failed.lock().take() {
                    let _ = tx.send(None);
                }
            },
        );

        match rx.await {
            Ok(Some(value)) => Ok(serde_json::from_value(value)?),
            Ok(None) => Err(Error::ReplyFailed),
            Err(_) => Err(Error::ReplyDropped),
        }
    }
}

impl<T> From<PendingReply<T>> for PendingReplyBase {
    fn from(reply: PendingReply<T>) -> Self {
        reply.base
    }
}
