//! Serial-bus arbiter: a named mutex per physical serial path, held for the
//! duration of one request/response exchange. Separate from the VXI-11
//! device lock in `lock.rs` and held *inside* it — two logical MODBUS
//! devices on the same RS-485 bus can be locked independently by different
//! clients, but their adapters still serialize on the bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Error, Result};

pub struct SerialArbiter {
    buses: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}
impl SerialArbiter {
    pub fn new() -> Self {
        Self {
            buses: Mutex::new(HashMap::new()),
        }
    }

    /// Register a bus path up front (called once per distinct serial path
    /// found across the configured devices at startup).
    pub fn register(&self, path: &str) {
        self.buses
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())));
    }

    /// Claim exclusive use of `path` for one request/response exchange.
    pub async fn acquire(&self, path: &str) -> Result<OwnedMutexGuard<()>> {
        let bus = self
            .buses
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no serial bus registered for {path}")))?;
        Ok(bus.lock_owned().await)
    }
}
impl Default for SerialArbiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_waits_for_first_release() {
        let arbiter = Arc::new(SerialArbiter::new());
        arbiter.register("/dev/ttyUSB0");

        let guard = arbiter.acquire("/dev/ttyUSB0").await.unwrap();
        let arbiter2 = arbiter.clone();
        let handle = tokio::spawn(async move {
            let _guard = arbiter2.acquire("/dev/ttyUSB0").await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_path_is_not_found() {
        let arbiter = SerialArbiter::new();
        assert!(arbiter.acquire("/dev/nope").await.is_err());
    }
}
