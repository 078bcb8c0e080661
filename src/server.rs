//! The VXI-11 gateway: ties the RPC dispatch loop to the link registry, lock
//! table, serial arbiter, and per-device adapters.
//!
//! One task per accepted TCP connection (spec.md §5); DEVICE_CORE and
//! DEVICE_ASYNC are bound to the same port, so a single dispatch loop
//! handles both programs for a connection's lifetime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use crate::adapter::{self, Adapter};
use crate::arbiter::SerialArbiter;
use crate::config::{Config, DeviceConfig};
use crate::error::{Error, Result, VxiError};
use crate::link::{self, Link, LinkRegistry};
use crate::lock::LockTable;
use crate::mapping::{self, CompiledRule};
use crate::rpc::framing;
use crate::rpc::onc::RpcMessage;
use crate::rpc::vxi11::{
    self, AsyncProc, CoreProc, CreateLinkParms, CreateLinkResp, DeviceError, DeviceGenericParms, DeviceLockParms,
    DeviceReadParms, DeviceReadResp, DeviceReadStbResp, DeviceWriteParms, DeviceWriteResp, ReadReason,
    DEVICE_ASYNC_PROG, DEVICE_ASYNC_VERS, DEVICE_CORE_PROG, DEVICE_CORE_VERS,
};
use crate::xdr::XdrPack;

/// A configured device plus everything a CREATE_LINK needs to hand a link
/// an adapter. Devices whose transport requires exclusive hardware access
/// share one adapter instance across every link, since the physical resource
/// really is singular. Devices that don't require a lock (scpi-tcp,
/// modbus-tcp, loopback) build a fresh adapter per link, so concurrent links
/// each get their own socket (spec.md §4.4).
struct DeviceHandle {
    config: DeviceConfig,
    rules: Vec<CompiledRule>,
    shared: Option<Arc<AsyncMutex<Box<dyn Adapter>>>>,
}

pub struct Gateway {
    config: Config,
    devices: HashMap<String, DeviceHandle>,
    links: LinkRegistry,
    locks: LockTable,
    arbiter: Arc<SerialArbiter>,
}

impl Gateway {
    /// Build the gateway from a loaded configuration. Constructs (but does
    /// not open) every device's adapter; `CREATE_LINK` must not touch
    /// hardware, so adapter construction here must not either.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let arbiter = Arc::new(SerialArbiter::new());
        let mut devices = HashMap::new();

        for (name, device) in &config.devices {
            if let Some(path) = device.serial_path() {
                arbiter.register(path);
            }

            let rule_config = config.mappings.get(name).cloned().unwrap_or_default();
            let rules = mapping::compile(&rule_config)?;

            let shared = if device.requires_lock() {
                Some(Arc::new(AsyncMutex::new(adapter::build(
                    device,
                    rules.clone(),
                    arbiter.clone(),
                )?)))
            } else {
                None
            };

            devices.insert(
                name.clone(),
                DeviceHandle {
                    config: device.clone(),
                    rules,
                    shared,
                },
            );
        }

        Ok(Arc::new(Self {
            config,
            devices,
            links: LinkRegistry::new(),
            locks: LockTable::new(),
            arbiter,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the DEVICE_CORE/DEVICE_ASYNC TCP listener. Never returns under
    /// normal operation; call this from a spawned task.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("VXI-11 gateway listening on tcp {addr}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.serve_connection(stream).await {
                    debug!("connection from {peer} ended: {e}");
                }
            });
        }
    }

    /// One task per connection. On disconnect every link-id this connection
    /// created is destroyed, releasing its lock and closing its adapter
    /// (spec.md §5).
    async fn serve_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut owned_links: Vec<i32> = Vec::new();
        let result = self.connection_loop(&mut stream, &mut owned_links).await;
        for lid in owned_links {
            self.destroy_link(lid).await;
        }
        result
    }

    async fn connection_loop(&self, stream: &mut TcpStream, owned_links: &mut Vec<i32>) -> Result<()> {
        loop {
            let mut raw = framing::read_message(stream).await?;
            let msg = RpcMessage::unpack(&mut raw)?;
            let Some(call) = msg.as_call() else {
                continue;
            };
            let prog = call.prog;
            let vers = call.vers;
            let proc = call.proc;
            let mut args = call.args.clone();

            let reply = match (prog, vers) {
                (DEVICE_CORE_PROG, DEVICE_CORE_VERS) => self.dispatch_core(&msg, proc, &mut args, owned_links).await,
                (DEVICE_CORE_PROG, _) => msg.reply_prog_mismatch(DEVICE_CORE_VERS, DEVICE_CORE_VERS),
                (DEVICE_ASYNC_PROG, DEVICE_ASYNC_VERS) => self.dispatch_async(&msg, proc),
                (DEVICE_ASYNC_PROG, _) => msg.reply_prog_mismatch(DEVICE_ASYNC_VERS, DEVICE_ASYNC_VERS),
                _ => msg.reply_prog_unavail(),
            };

            let mut packed = vec![];
            reply.pack_xdr(&mut packed);
            framing::write_message(stream, packed).await?;
        }
    }

    async fn dispatch_core(&self, msg: &RpcMessage, proc: u32, args: &mut Vec<u8>, owned_links: &mut Vec<i32>) -> RpcMessage {
        let Some(proc) = CoreProc::from_u32(proc) else {
            return msg.reply_proc_unavail();
        };

        match proc {
            CoreProc::CreateLink => {
                let Ok(parms) = CreateLinkParms::unpack(args) else {
                    return msg.reply_garbage_args();
                };
                let resp = self.create_link(parms, owned_links).await;
                let mut out = vec![];
                resp.pack_xdr(&mut out);
                msg.reply_success(out)
            }
            CoreProc::DeviceWrite => {
                let Ok(parms) = DeviceWriteParms::unpack(args) else {
                    return msg.reply_garbage_args();
                };
                let resp = self.device_write(parms).await;
                let mut out = vec![];
                resp.pack_xdr(&mut out);
                msg.reply_success(out)
            }
            CoreProc::DeviceRead => {
                let Ok(parms) = DeviceReadParms::unpack(args) else {
                    return msg.reply_garbage_args();
                };
                let resp = self.device_read(parms).await;
                let mut out = vec![];
                resp.pack_xdr(&mut out);
                msg.reply_success(out)
            }
            CoreProc::DeviceReadStb => {
                let Ok(parms) = DeviceGenericParms::unpack(args) else {
                    return msg.reply_garbage_args();
                };
                let resp = self.device_readstb(parms);
                let mut out = vec![];
                resp.pack_xdr(&mut out);
                msg.reply_success(out)
            }
            CoreProc::DeviceTrigger | CoreProc::DeviceClear | CoreProc::DeviceRemote | CoreProc::DeviceLocal => {
                let Ok(parms) = DeviceGenericParms::unpack(args) else {
                    return msg.reply_garbage_args();
                };
                let error = self.device_passthrough(parms);
                let mut out = vec![];
                DeviceError { error }.pack_xdr(&mut out);
                msg.reply_success(out)
            }
            CoreProc::DeviceLock => {
                let Ok(parms) = DeviceLockParms::unpack(args) else {
                    return msg.reply_garbage_args();
                };
                let error = self.device_lock(parms).await;
                let mut out = vec![];
                DeviceError { error }.pack_xdr(&mut out);
                msg.reply_success(out)
            }
            CoreProc::DeviceUnlock => {
                let Ok(lid) = vxi11::unpack_device_link(args) else {
                    return msg.reply_garbage_args();
                };
                let error = self.device_unlock(lid).await;
                let mut out = vec![];
                DeviceError { error }.pack_xdr(&mut out);
                msg.reply_success(out)
            }
            CoreProc::DestroyLink => {
                let Ok(lid) = vxi11::unpack_device_link(args) else {
                    return msg.reply_garbage_args();
                };
                let error = self.destroy_link(lid).await;
                owned_links.retain(|id| *id != lid);
                let mut out = vec![];
                DeviceError { error }.pack_xdr(&mut out);
                msg.reply_success(out)
            }
        }
    }

    /// DEVICE_ASYNC is bound to the same port but only DEVICE_ABORT is
    /// recognized; this gateway has no in-flight operation worth cancelling
    /// between RPC calls, so it always answers NO_ERROR (spec.md §4.1).
    fn dispatch_async(&self, msg: &RpcMessage, proc: u32) -> RpcMessage {
        let Some(proc) = AsyncProc::from_u32(proc) else {
            return msg.reply_proc_unavail();
        };
        match proc {
            AsyncProc::DeviceAbort => {
                let mut out = vec![];
                DeviceError { error: VxiError::NoError }.pack_xdr(&mut out);
                msg.reply_success(out)
            }
        }
    }

    async fn create_link(&self, parms: CreateLinkParms, owned_links: &mut Vec<i32>) -> CreateLinkResp {
        let rejected = |error| CreateLinkResp {
            error,
            lid: 0,
            abort_port: self.config.server.port,
            max_recv_size: 0,
        };

        let Some(handle) = self.devices.get(&parms.device) else {
            return rejected(VxiError::DeviceNotAccessible);
        };

        let adapter = match &handle.shared {
            Some(shared) => shared.clone(),
            None => match adapter::build(&handle.config, handle.rules.clone(), self.arbiter.clone()) {
                Ok(adapter) => Arc::new(AsyncMutex::new(adapter)),
                Err(e) => {
                    warn!("failed to build adapter for device {}: {e}", parms.device);
                    return rejected(VxiError::DeviceNotAccessible);
                }
            },
        };

        let physical_id = handle.config.physical_id(&parms.device);
        let link = self.links.create(parms.device.clone(), physical_id.clone(), parms.client_id, adapter);
        owned_links.push(link.id);

        if parms.lock_device {
            let deadline = lock_deadline(true, parms.lock_timeout_ms);
            if let Err(e) = self.locks.lock(&physical_id, link.id, deadline).await {
                return CreateLinkResp {
                    error: (&e).into(),
                    lid: link.id,
                    abort_port: self.config.server.port,
                    max_recv_size: link::DEFAULT_MAX_RECV_SIZE,
                };
            }
            if let Err(e) = self.ensure_opened(&link).await {
                warn!("acquire on CREATE_LINK for device {} failed: {e}", parms.device);
                self.locks.release_all(&physical_id, link.id);
                return CreateLinkResp {
                    error: VxiError::IoError,
                    lid: link.id,
                    abort_port: self.config.server.port,
                    max_recv_size: link::DEFAULT_MAX_RECV_SIZE,
                };
            }
        }

        CreateLinkResp {
            error: VxiError::NoError,
            lid: link.id,
            abort_port: self.config.server.port,
            max_recv_size: link::DEFAULT_MAX_RECV_SIZE,
        }
    }

    async fn device_write(&self, parms: DeviceWriteParms) -> DeviceWriteResp {
        let Some(link) = self.links.get(parms.lid) else {
            return DeviceWriteResp {
                error: VxiError::InvalidLinkIdentifier,
                size: 0,
            };
        };
        let Some(handle) = self.devices.get(&link.device_name) else {
            return DeviceWriteResp {
                error: VxiError::DeviceNotAccessible,
                size: 0,
            };
        };

        if let Err(e) = self
            .ensure_access(&link, handle, parms.flags.wait_lock, parms.lock_timeout_ms)
            .await
        {
            return DeviceWriteResp {
                error: self.access_error(&link, e),
                size: 0,
            };
        }

        let mut adapter = link.adapter.lock().await;
        match adapter.write(&parms.data).await {
            Ok(size) => DeviceWriteResp {
                error: VxiError::NoError,
                size: size as u32,
            },
            Err(Error::Timeout(msg)) => {
                debug!("device_write to {} timed out: {msg}", link.device_name);
                DeviceWriteResp {
                    error: VxiError::IoTimeout,
                    size: 0,
                }
            }
            Err(e) => {
                drop(adapter);
                warn!("device_write to {} failed: {e}", link.device_name);
                self.ensure_closed(&link).await;
                self.locks.release_all(&link.physical_id, link.id);
                DeviceWriteResp {
                    error: VxiError::IoError,
                    size: 0,
                }
            }
        }
    }

    async fn device_read(&self, parms: DeviceReadParms) -> DeviceReadResp {
        let Some(link) = self.links.get(parms.lid) else {
            return DeviceReadResp {
                error: VxiError::InvalidLinkIdentifier,
                reason: ReadReason::default(),
                data: vec![],
            };
        };
        let Some(handle) = self.devices.get(&link.device_name) else {
            return DeviceReadResp {
                error: VxiError::DeviceNotAccessible,
                reason: ReadReason::default(),
                data: vec![],
            };
        };

        if let Err(e) = self
            .ensure_access(&link, handle, parms.flags.wait_lock, parms.lock_timeout_ms)
            .await
        {
            return DeviceReadResp {
                error: self.access_error(&link, e),
                reason: ReadReason::default(),
                data: vec![],
            };
        }

        let deadline = io_deadline(handle.config.io_timeout(), parms.io_timeout_ms);
        let mut adapter = link.adapter.lock().await;
        match adapter.read(parms.request_size as usize, deadline).await {
            Ok((data, outcome)) => DeviceReadResp {
                error: VxiError::NoError,
                reason: ReadReason {
                    request_size_satisfied: outcome.request_size_satisfied,
                    termchr_matched: outcome.termchr_matched,
                    end: outcome.end,
                },
                data,
            },
            Err(Error::Timeout(msg)) => {
                debug!("device_read from {} timed out: {msg}", link.device_name);
                DeviceReadResp {
                    error: VxiError::IoTimeout,
                    reason: ReadReason::default(),
                    data: vec![],
                }
            }
            Err(e) => {
                drop(adapter);
                warn!("device_read from {} failed: {e}", link.device_name);
                self.ensure_closed(&link).await;
                self.locks.release_all(&link.physical_id, link.id);
                DeviceReadResp {
                    error: VxiError::IoError,
                    reason: ReadReason::default(),
                    data: vec![],
                }
            }
        }
    }

    /// No adapter implements a status-byte query; an unknown link is still
    /// an error, but a valid one always answers NO_ERROR/0 rather than
    /// OPERATION_NOT_SUPPORTED, to stay compatible with clients that poll
    /// the status byte unconditionally (spec.md §4.7).
    fn device_readstb(&self, parms: DeviceGenericParms) -> DeviceReadStbResp {
        if self.links.get(parms.lid).is_none() {
            return DeviceReadStbResp {
                error: VxiError::InvalidLinkIdentifier,
                stb: 0,
            };
        }
        DeviceReadStbResp {
            error: VxiError::NoError,
            stb: 0,
        }
    }

    fn device_passthrough(&self, parms: DeviceGenericParms) -> VxiError {
        if self.links.get(parms.lid).is_none() {
            return VxiError::InvalidLinkIdentifier;
        }
        VxiError::NoError
    }

    async fn device_lock(&self, parms: DeviceLockParms) -> VxiError {
        let Some(link) = self.links.get(parms.lid) else {
            return VxiError::InvalidLinkIdentifier;
        };
        let deadline = lock_deadline(parms.flags.wait_lock, parms.lock_timeout_ms);
        match self.locks.lock(&link.physical_id, link.id, deadline).await {
            Ok(()) => match self.ensure_opened(&link).await {
                Ok(()) => VxiError::NoError,
                Err(e) => {
                    warn!("acquire on DEVICE_LOCK for link {} failed: {e}", link.id);
                    self.locks.release_all(&link.physical_id, link.id);
                    VxiError::IoError
                }
            },
            Err(e) => (&e).into(),
        }
    }

    async fn device_unlock(&self, lid: i32) -> VxiError {
        let Some(link) = self.links.get(lid) else {
            return VxiError::InvalidLinkIdentifier;
        };
        match self.locks.unlock(&link.physical_id, link.id) {
            Ok(()) => {
                self.ensure_closed(&link).await;
                VxiError::NoError
            }
            Err(e) => (&e).into(),
        }
    }

    async fn destroy_link(&self, lid: i32) -> VxiError {
        let Some(link) = self.links.destroy(lid) else {
            return VxiError::InvalidLinkIdentifier;
        };
        self.locks.release_all(&link.physical_id, link.id);
        self.ensure_closed(&link).await;
        VxiError::NoError
    }

    /// Enforce the lock (or opportunistically take it) for one DEVICE_WRITE
    /// or DEVICE_READ, then make sure the adapter is open.
    async fn ensure_access(&self, link: &Link, handle: &DeviceHandle, wait: bool, lock_timeout_ms: u32) -> Result<()> {
        if handle.config.requires_lock() {
            if self.locks.is_locked_by_another(&link.physical_id, link.id) {
                return Err(Error::Locked);
            }
            let deadline = lock_deadline(wait, lock_timeout_ms);
            self.locks.lock(&link.physical_id, link.id, deadline).await?;
        }
        self.ensure_opened(link).await
    }

    /// Maps an `ensure_access` failure onto a VXI-11 error code. Releasing
    /// the lock here is a no-op unless we actually acquired it, per
    /// `LockTable::release_all`'s contract.
    fn access_error(&self, link: &Link, e: Error) -> VxiError {
        if matches!(e, Error::Locked) {
            VxiError::DeviceLockedByAnotherLink
        } else {
            self.locks.release_all(&link.physical_id, link.id);
            VxiError::IoError
        }
    }

    async fn ensure_opened(&self, link: &Link) -> Result<()> {
        if link.acquired.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut adapter = link.adapter.lock().await;
        if let Err(e) = adapter.connect().await {
            link.acquired.store(false, Ordering::Release);
            return Err(e);
        }
        if let Err(e) = adapter.acquire(None).await {
            link.acquired.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    async fn ensure_closed(&self, link: &Link) {
        if link.acquired.swap(false, Ordering::AcqRel) {
            let mut adapter = link.adapter.lock().await;
            let _ = adapter.release().await;
        }
    }
}

/// `wait = false` means "fail immediately if not free"; `timeout_ms == 0`
/// with `wait = true` means "wait forever", matching the way `lock_timeout`
/// is used in the end-to-end lock-contention scenario (spec.md §8).
fn lock_deadline(wait: bool, timeout_ms: u32) -> Option<Instant> {
    if !wait {
        Some(Instant::now())
    } else if timeout_ms == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    }
}

/// `io_timeout_ms == 0` falls back to the device's configured `io_timeout`,
/// or blocks indefinitely if neither is set.
fn io_deadline(device_timeout: Option<Duration>, requested_ms: u32) -> Option<Instant> {
    if requested_ms != 0 {
        Some(Instant::now() + Duration::from_millis(requested_ms as u64))
    } else {
        device_timeout.map(|d| Instant::now() + d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> Config {
        Config::from_yaml_str(
            r#"
server:
  port: 1024
devices:
  dev:
    type: loopback
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_link_for_unknown_device_returns_device_not_accessible() {
        let gateway = Gateway::new(loopback_config()).unwrap();
        let mut owned = vec![];
        let resp = gateway
            .create_link(
                CreateLinkParms {
                    client_id: 1,
                    lock_device: false,
                    lock_timeout_ms: 0,
                    device: "nope".into(),
                },
                &mut owned,
            )
            .await;
        assert_eq!(resp.error, VxiError::DeviceNotAccessible);
        assert!(owned.is_empty());
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_loopback() {
        let gateway = Gateway::new(loopback_config()).unwrap();
        let mut owned = vec![];
        let link = gateway
            .create_link(
                CreateLinkParms {
                    client_id: 1,
                    lock_device: false,
                    lock_timeout_ms: 0,
                    device: "dev".into(),
                },
                &mut owned,
            )
            .await;
        assert_eq!(link.error, VxiError::NoError);

        let write = gateway
            .device_write(DeviceWriteParms {
                lid: link.lid,
                io_timeout_ms: 1000,
                lock_timeout_ms: 0,
                flags: Default::default(),
                data: b"hello".to_vec(),
            })
            .await;
        assert_eq!(write.error, VxiError::NoError);
        assert_eq!(write.size, 5);

        let read = gateway
            .device_read(DeviceReadParms {
                lid: link.lid,
                request_size: 5,
                io_timeout_ms: 1000,
                lock_timeout_ms: 0,
                flags: Default::default(),
                termchr: 0,
            })
            .await;
        assert_eq!(read.error, VxiError::NoError);
        assert_eq!(read.data, b"hello");
    }

    #[tokio::test]
    async fn destroy_link_on_unknown_id_returns_invalid_link_identifier() {
        let gateway = Gateway::new(loopback_config()).unwrap();
        assert_eq!(gateway.destroy_link(999).await, VxiError::InvalidLinkIdentifier);
    }

    #[tokio::test]
    async fn second_link_on_requires_lock_device_is_locked_out() {
        let config = Config::from_yaml_str(
            r#"
server:
  port: 1024
devices:
  dev:
    type: loopback
    requires_lock: true
"#,
        )
        .unwrap();
        let gateway = Gateway::new(config).unwrap();
        let mut owned1 = vec![];
        let link1 = gateway
            .create_link(
                CreateLinkParms {
                    client_id: 1,
                    lock_device: true,
                    lock_timeout_ms: 0,
                    device: "dev".into(),
                },
                &mut owned1,
            )
            .await;
        assert_eq!(link1.error, VxiError::NoError);

        let mut owned2 = vec![];
        let link2 = gateway
            .create_link(
                CreateLinkParms {
                    client_id: 2,
                    lock_device: false,
                    lock_timeout_ms: 0,
                    device: "dev".into(),
                },
                &mut owned2,
            )
            .await;
        assert_eq!(link2.error, VxiError::NoError);

        let write2 = gateway
            .device_write(DeviceWriteParms {
                lid: link2.lid,
                io_timeout_ms: 0,
                lock_timeout_ms: 1,
                flags: Default::default(),
                data: b"x".to_vec(),
            })
            .await;
        assert_eq!(write2.error, VxiError::DeviceLockedByAnotherLink);
    }
}
