//! Link registry: tracks every CREATE_LINK'd session, its adapter, and the
//! client-assigned opaque identifier, keyed by a gateway-issued link-id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;

use crate::adapter::Adapter;

/// Default cap on how much unread response data a link will hold for a
/// DEVICE_READ to drain.
pub const DEFAULT_OUTPUT_BUFFER_CAP: usize = 64 * 1024;

/// Default `max_recv_size` advertised in the CREATE_LINK response: the
/// largest single transfer the gateway is willing to negotiate with a
/// client, independent of the output buffer cap above.
pub const DEFAULT_MAX_RECV_SIZE: u32 = 1024 * 1024;

pub struct Link {
    pub id: i32,
    pub device_name: String,
    pub physical_id: String,
    pub client_id: i32,
    pub adapter: Arc<AsyncMutex<Box<dyn Adapter>>>,
    pub created_at: Instant,
    /// Whether `acquire()` has been called on `adapter` since the last
    /// `release()`/destruction. Tracked per link (not per device) because a
    /// non-lock-required device may have one adapter instance per link.
    pub acquired: AtomicBool,
}

pub struct LinkRegistry {
    next_id: AtomicI32,
    links: Mutex<HashMap<i32, Arc<Link>>>,
}
impl LinkRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI32::new(1),
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(
        &self,
        device_name: String,
        physical_id: String,
        client_id: i32,
        adapter: Arc<AsyncMutex<Box<dyn Adapter>>>,
    ) -> Arc<Link> {
        let mut links = self.links.lock().unwrap();

        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        while id == 0 || links.contains_key(&id) {
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }

        let link = Arc::new(Link {
            id,
            device_name,
            physical_id,
            client_id,
            adapter,
            created_at: Instant::now(),
            acquired: AtomicBool::new(false),
        });
        links.insert(id, link.clone());
        link
    }

    pub fn get(&self, id: i32) -> Option<Arc<Link>> {
        self.links.lock().unwrap().get(&id).cloned()
    }

    pub fn destroy(&self, id: i32) -> Option<Arc<Link>> {
        self.links.lock().unwrap().remove(&id)
    }

    pub fn all(&self) -> Vec<Arc<Link>> {
        self.links.lock().unwrap().values().cloned().collect()
    }
}
impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::loopback::LoopbackAdapter;

    fn adapter() -> Arc<AsyncMutex<Box<dyn Adapter>>> {
        Arc::new(AsyncMutex::new(Box::new(LoopbackAdapter::new())))
    }

    #[test]
    fn link_ids_are_monotonic_and_collision_free() {
        let registry = LinkRegistry::new();
        let a = registry.create("dev".into(), "loopback".into(), 1, adapter());
        let b = registry.create("dev".into(), "loopback".into(), 2, adapter());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn destroy_removes_the_link() {
        let registry = LinkRegistry::new();
        let link = registry.create("dev".into(), "loopback".into(), 1, adapter());
        assert!(registry.get(link.id).is_some());
        registry.destroy(link.id);
        assert!(registry.get(link.id).is_none());
    }
}
