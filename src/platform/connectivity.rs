use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::util::subscribe::Unsubscribe;

type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync + 'static>;

/// Process-wide online/offline flag with change notification.
///
/// Routing decisions read [`Connectivity::is_online`] synchronously; the host (or a test)
/// feeds transitions through [`Connectivity::set_online`].
#[derive(Clone)]
pub struct Connectivity {
    inner: Arc<ConnectivityInner>,
}

struct ConnectivityInner {
    online: AtomicBool,
    listeners: Mutex<BTreeMap<u64, ConnectivityCallback>>,
    next_listener_id: AtomicU64,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        Self {
            inner: Arc::new(ConnectivityInner {
                online: AtomicBool::new(initially_online),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Updates the flag; listeners only fire when the value actually changes.
    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        let listeners: Vec<ConnectivityCallback> = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(online);
        }
    }

    pub fn on_change<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));

        let weak: Weak<ConnectivityInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().unwrap().remove(&id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl fmt::Debug for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connectivity")
            .field("online", &self.is_online())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
