//! Portmapper server, RFC1833 / program 100000 version 2.
//!
//! Answers PMAPPROC_NULL and PMAPPROC_GETPORT for the VXI-11 programs only;
//! this is not a general-purpose rpcbind.

use std::net::SocketAddr;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::{
    error::Result,
    rpc::{
        framing,
        onc::{MessageBody, RpcMessage},
        vxi11::{DEVICE_ASYNC_PROG, DEVICE_CORE_PROG},
    },
    xdr::{self, XdrPack},
};

pub const PORTMAP_PORT: u16 = 111;
const PORTMAP_PROG: u32 = 100000;
const PORTMAP_VERS: u32 = 2;

const PMAPPROC_NULL: u32 = 0;
const PMAPPROC_GETPORT: u32 = 3;

/// Resolves GETPORT requests against the gateway's single configured core
/// port. DEVICE_INTR and unknown programs always resolve to 0.
#[derive(Clone, Copy)]
pub struct Portmapper {
    core_port: u16,
}
impl Portmapper {
    pub fn new(core_port: u16) -> Self {
        Self { core_port }
    }

    fn resolve(&self, prog: u32, vers: u32) -> u16 {
        if vers < 1 {
            return 0;
        }
        match prog {
            DEVICE_CORE_PROG | DEVICE_ASYNC_PROG => self.core_port,
            _ => 0,
        }
    }

    /// Handle one already-decoded call, returning the packed reply bytes for
    /// the procedure result (or `None` if the call isn't ours to answer).
    fn handle_call(&self, prog: u32, vers: u32, proc: u32, args: &mut Vec<u8>) -> Option<Vec<u8>> {
        if prog != PORTMAP_PROG || vers != PORTMAP_VERS {
            return None;
        }

        match proc {
            PMAPPROC_NULL => Some(vec![]),
            PMAPPROC_GETPORT => {
                let mapping = match GetPortArgs::unpack(args) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("malformed PMAPPROC_GETPORT args: {e}");
                        return Some({
                            let mut out = vec![];
                            0u32.pack_xdr(&mut out);
                            out
                        });
                    }
                };
                let port = self.resolve(mapping.prog, mapping.vers);
                debug!(
                    "portmap GETPORT prog={:#x} vers={} -> {}",
                    mapping.prog, mapping.vers, port
                );
                let mut out = vec![];
                (port as u32).pack_xdr(&mut out);
                Some(out)
            }
            _ => None,
        }
    }

    /// Run the TCP listener for program 100000. Never returns under normal
    /// operation; call this from a spawned task.
    pub async fn serve_tcp(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("portmapper listening on tcp {addr}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self;
            tokio::spawn(async move {
                if let Err(e) = this.serve_tcp_connection(stream).await {
                    debug!("portmapper connection from {peer} ended: {e}");
                }
            });
        }
    }

    async fn serve_tcp_connection(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let mut raw = framing::read_message(&mut stream).await?;
            let msg = RpcMessage::unpack(&mut raw)?;
            let MessageBody::Call(call) = &msg.body else {
                continue;
            };
            let mut args = call.args.clone();
            let reply = match self.handle_call(call.prog, call.vers, call.proc, &mut args) {
                Some(results) => msg.reply_success(results),
                None => msg.reply_proc_unavail(),
            };
            let mut packed = vec![];
            reply.pack_xdr(&mut packed);
            framing::write_message(&mut stream, packed).await?;
        }
    }

    /// Run the UDP listener for program 100000. UDP carries one un-fragmented
    /// RPC message per datagram (no record marking).
    pub async fn serve_udp(self, addr: SocketAddr) -> Result<()> {
        let socket = UdpSocket::bind(addr).await?;
        info!("portmapper listening on udp {addr}");
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            let mut raw = buf[..len].to_vec();
            let msg = match RpcMessage::unpack(&mut raw) {
                Ok(m) => m,
                Err(e) => {
                    debug!("malformed portmap datagram from {peer}: {e}");
                    continue;
                }
            };
            let MessageBody::Call(call) = &msg.body else {
                continue;
            };
            let mut args = call.args.clone();
            let reply = match self.handle_call(call.prog, call.vers, call.proc, &mut args) {
                Some(results) => msg.reply_success(results),
                None => msg.reply_proc_unavail(),
            };
            let mut packed = vec![];
            reply.pack_xdr(&mut packed);
            if let Err(e) = socket.send_to(&packed, peer).await {
                error!("failed to send portmap reply to {peer}: {e}");
            }
        }
    }
}

struct GetPortArgs {
    prog: u32,
    vers: u32,
}
impl GetPortArgs {
    fn unpack(src: &mut Vec<u8>) -> Result<Self> {
        let prog = xdr::unpack_u32(src)?;
        let vers = xdr::unpack_u32(src)?;
        let _prot = xdr::unpack_u32(src)?;
        let _port = xdr::unpack_u32(src)?;
        Ok(Self { prog, vers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_core_and_async_programs_to_configured_port() {
        let pmap = Portmapper::new(1024);
        assert_eq!(pmap.resolve(DEVICE_CORE_PROG, 1), 1024);
        assert_eq!(pmap.resolve(DEVICE_ASYNC_PROG, 1), 1024);
    }

    #[test]
    fn resolves_interrupt_and_unknown_programs_to_zero() {
        let pmap = Portmapper::new(1024);
        assert_eq!(pmap.resolve(crate::rpc::vxi11::DEVICE_INTR_PROG, 1), 0);
        assert_eq!(pmap.resolve(0xDEAD, 1), 0);
    }

    #[test]
    fn getport_call_roundtrips_through_handle_call() {
        let pmap = Portmapper::new(5555);
        let mut args = vec![];
        DEVICE_CORE_PROG.pack_xdr(&mut args);
        1u32.pack_xdr(&mut args);
        6u32.pack_xdr(&mut args); // IPPROTO_TCP
        0u32.pack_xdr(&mut args);

        let mut results = pmap
            .handle_call(PORTMAP_PROG, PORTMAP_VERS, PMAPPROC_GETPORT, &mut args)
            .unwrap();
        assert_eq!(xdr::unpack_u32(&mut results).unwrap(), 5555);
    }
}
