//! Signals
//!
//! Explicit observer lists. A [`Signal`] holds callbacks registered with
//! [`Signal::connect`]; every registration yields a [`Connection`] that can be
//! used to unsubscribe. Emission snapshots the callback list and runs the
//! callbacks without holding the list lock, so a callback may freely connect,
//! disconnect or emit other signals.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SlotList<T> {
    next_id: u64,
    slots: Vec<(u64, Slot<T>)>,
}

trait Disconnect: Send + Sync {
    fn remove(&self, id: u64) -> bool;
}

impl<T: 'static> Disconnect for Mutex<SlotList<T>> {
    fn remove(&self, id: u64) -> bool {
        let mut list = self.lock();
        let before = list.slots.len();
        list.slots.retain(|(slot_id, _)| *slot_id != id);
        list.slots.len() != before
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal
// ─────────────────────────────────────────────────────────────────────────────

/// A list of callbacks invoked in connection order on [`Signal::emit`].
///
/// Cloning a signal yields another handle to the same callback list.
pub struct Signal<T> {
    slots: Arc<Mutex<SlotList<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slot_count())
            .finish()
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(SlotList {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Register a callback
    pub fn connect<F>(&self, slot: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut list = self.slots.lock();
            list.next_id += 1;
            let id = list.next_id;
            list.slots.push((id, Arc::new(slot)));
            id
        };

        let weak: Weak<dyn Disconnect> = Arc::downgrade(&self.slots) as Weak<dyn Disconnect>;
        Connection {
            id,
            target: weak,
        }
    }

    /// Invoke every connected callback with `value`
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Slot<T>> = self
            .slots
            .lock()
            .slots
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();

        for slot in snapshot {
            slot(value);
        }
    }

    pub fn disconnect_all(&self) {
        self.slots.lock().slots.clear();
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().slots.len()
    }
}

impl Signal<()> {
    /// Shorthand for `emit(&())`
    pub fn notify(&self) {
        self.emit(&());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one registered callback.
///
/// Dropping a `Connection` leaves the callback connected; call
/// [`Connection::disconnect`] or collect it in a [`ConnectionSet`].
pub struct Connection {
    id: u64,
    target: Weak<dyn Disconnect>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

impl Connection {
    /// Remove the callback. Returns false if it was already gone.
    pub fn disconnect(&self) -> bool {
        match self.target.upgrade() {
            Some(target) => target.remove(self.id),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.target.strong_count() > 0
    }
}

/// Connections that are torn down together, e.g. everything wired while a
/// feature is attached to one backend.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: Vec<Connection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, connection: Connection) {
        self.connections.push(connection);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn disconnect_all(&mut self) {
        for connection in self.connections.drain(..) {
            connection.disconnect();
        }
    }
}

impl Extend<Connection> for ConnectionSet {
    fn extend<I: IntoIterator<Item = Connection>>(&mut self, iter: I) {
        self.connections.extend(iter);
    }
}

impl Drop for ConnectionSet {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_in_connection_order() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        signal.connect(move |v| s1.lock().push(("first", *v)));
        let s2 = seen.clone();
        signal.connect(move |v| s2.lock().push(("second", *v)));

        signal.emit(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_disconnect() {
        let signal = Signal::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let connection = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        signal.notify();
        assert!(connection.disconnect());
        assert!(!connection.disconnect());
        signal.notify();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_disconnect_itself() {
        let signal = Signal::<()>::new();
        let slot_connection: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let (holder, c) = (slot_connection.clone(), count.clone());
        let connection = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(conn) = holder.lock().take() {
                conn.disconnect();
            }
        });
        *slot_connection.lock() = Some(connection);

        signal.notify();
        signal.notify();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.slot_count(), 0);
    }

    #[test]
    fn test_connection_set_drop_disconnects() {
        let signal = Signal::<()>::new();
        {
            let mut set = ConnectionSet::new();
            set.push(signal.connect(|_| {}));
            set.push(signal.connect(|_| {}));
            assert_eq!(signal.slot_count(), 2);
        }
        assert_eq!(signal.slot_count(), 0);
    }

    #[test]
    fn test_connection_outlives_signal() {
        let connection = {
            let signal = Signal::<()>::new();
            signal.connect(|_| {})
        };
        assert!(!connection.is_connected());
        assert!(!connection.disconnect());
    }
}
