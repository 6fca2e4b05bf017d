//! Per-public-port tunnel registry.
//!
//! Each active public port owns a queue of ready, authenticated tunnel
//! sessions. Insertion is double-checked: a shared read lock covers the
//! common "port already active, enqueue" path, and the write lock is taken
//! only to create (or replace) a port entry, so exactly one caller per port
//! becomes the creator and spawns the public listener.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, RwLock};

use crate::backhaul::tunnel::{protocol::Frame, transport::TransportSession};

pub type SessionQueue = mpsc::UnboundedReceiver<Arc<dyn TransportSession>>;

struct TunnelContext {
    tx: mpsc::UnboundedSender<Arc<dyn TransportSession>>,
}

/// Outcome of registering an authenticated session.
pub enum Registered {
    /// The port was already active; the session joined its queue.
    Enqueued,
    /// The caller created the port entry and must start its public
    /// listener, consuming this queue.
    Created(SessionQueue),
}

pub struct Registry {
    inner: RwLock<HashMap<u16, TunnelContext>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Enqueue `session` for `request.port`, creating the port entry if
    /// needed. Only call with requests that already passed validation.
    pub async fn register(
        &self,
        request: &Frame,
        session: Arc<dyn TransportSession>,
    ) -> Registered {
        let port = request.port as u16;
        debug_assert_eq!(u32::from(port), request.port);

        {
            let map = self.inner.read().await;
            if let Some(ctx) = map.get(&port) {
                if ctx.tx.send(session.clone()).is_ok() {
                    return Registered::Enqueued;
                }
                // Consumer is gone (port torn down between lookup and send);
                // fall through and replace the entry.
            }
        }

        let mut map = self.inner.write().await;

        // Re-check: another session may have created the entry while this
        // one waited for the write lock.
        if let Some(ctx) = map.get(&port) {
            if ctx.tx.send(session.clone()).is_ok() {
                return Registered::Enqueued;
            }
            map.remove(&port);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(session).expect("fresh queue has its receiver");
        map.insert(port, TunnelContext { tx });
        Registered::Created(rx)
    }

    /// Drop the port entry. Queued sessions are released as their Arcs die.
    pub async fn remove(&self, port: u16) -> bool {
        self.inner.write().await.remove(&port).is_some()
    }

    pub async fn contains(&self, port: u16) -> bool {
        self.inner.read().await.contains_key(&port)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
