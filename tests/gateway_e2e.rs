//! End-to-end tests that drive the gateway the way a real VXI-11 client
//! would: over a real TCP socket, framed with record marks, encoded as
//! ONC-RPC calls. Nothing here reaches into the gateway's internals — it's
//! all `rpc::onc`/`rpc::vxi11`/`rpc::framing`/`xdr`, the same surface a
//! client implementation would use.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;

use vxi11_gateway::config::Config;
use vxi11_gateway::rpc::framing;
use vxi11_gateway::rpc::onc::{AcceptedReplyBodyType, MessageBody, OpaqueAuth, ReplyBody, RpcMessage, RPC_VERSION};
use vxi11_gateway::rpc::vxi11::{CoreProc, DEVICE_CORE_PROG, DEVICE_CORE_VERS};
use vxi11_gateway::server::Gateway;
use vxi11_gateway::xdr::{self, XdrPack};

fn pack_call(xid: u32, proc: CoreProc, mut args: Vec<u8>) -> Vec<u8> {
    let mut buf = vec![];
    xid.pack_xdr(&mut buf);
    0u32.pack_xdr(&mut buf); // CALL
    RPC_VERSION.pack_xdr(&mut buf);
    DEVICE_CORE_PROG.pack_xdr(&mut buf);
    DEVICE_CORE_VERS.pack_xdr(&mut buf);
    (proc as u32).pack_xdr(&mut buf);
    OpaqueAuth::new_null().pack_xdr(&mut buf);
    OpaqueAuth::new_null().pack_xdr(&mut buf);
    buf.append(&mut args);
    buf
}

fn device_flags(wait_lock: bool, end: bool, termchr_set: bool) -> u32 {
    let mut v = 0;
    if wait_lock {
        v |= 0x01;
    }
    if end {
        v |= 0x08;
    }
    if termchr_set {
        v |= 0x80;
    }
    v
}

async fn call(stream: &mut TcpStream, xid: u32, proc: CoreProc, args: Vec<u8>) -> Vec<u8> {
    framing::write_message(stream, pack_call(xid, proc, args)).await.unwrap();
    let mut raw = framing::read_message(stream).await.unwrap();
    let msg = RpcMessage::unpack(&mut raw).unwrap();
    assert_eq!(msg.xid, xid);
    match msg.body {
        MessageBody::Reply(ReplyBody::Accepted(accepted)) => match accepted.body {
            AcceptedReplyBodyType::Success(results) => results,
            other => panic!("call rejected: {other:?}"),
        },
        other => panic!("not a reply: {other:?}"),
    }
}

async fn create_link(stream: &mut TcpStream, xid: u32, device: &str, lock: bool, lock_timeout_ms: u32) -> (u32, i32) {
    let mut args = vec![];
    1i32.pack_xdr(&mut args);
    lock.pack_xdr(&mut args);
    lock_timeout_ms.pack_xdr(&mut args);
    device.to_string().pack_xdr(&mut args);

    let mut resp = call(stream, xid, CoreProc::CreateLink, args).await;
    let error = xdr::unpack_u32(&mut resp).unwrap();
    let lid = xdr::unpack_i32(&mut resp).unwrap();
    let _abort_port = xdr::unpack_u32(&mut resp).unwrap();
    let _max_recv_size = xdr::unpack_u32(&mut resp).unwrap();
    (error, lid)
}

async fn device_write(stream: &mut TcpStream, xid: u32, lid: i32, wait_lock: bool, data: &[u8]) -> (u32, u32) {
    let mut args = vec![];
    lid.pack_xdr(&mut args);
    1000u32.pack_xdr(&mut args); // io_timeout_ms
    50u32.pack_xdr(&mut args); // lock_timeout_ms
    device_flags(wait_lock, true, false).pack_xdr(&mut args);
    data.to_vec().pack_xdr(&mut args);

    let mut resp = call(stream, xid, CoreProc::DeviceWrite, args).await;
    let error = xdr::unpack_u32(&mut resp).unwrap();
    let size = xdr::unpack_u32(&mut resp).unwrap();
    (error, size)
}

async fn device_read(stream: &mut TcpStream, xid: u32, lid: i32, request_size: u32) -> (u32, Vec<u8>) {
    let mut args = vec![];
    lid.pack_xdr(&mut args);
    request_size.pack_xdr(&mut args);
    1000u32.pack_xdr(&mut args); // io_timeout_ms
    0u32.pack_xdr(&mut args); // lock_timeout_ms
    device_flags(false, false, false).pack_xdr(&mut args);
    0u32.pack_xdr(&mut args); // termchr

    let mut resp = call(stream, xid, CoreProc::DeviceRead, args).await;
    let error = xdr::unpack_u32(&mut resp).unwrap();
    let _reason = xdr::unpack_u32(&mut resp).unwrap();
    let data = xdr::unpack_opaque(&mut resp).unwrap();
    (error, data)
}

async fn destroy_link(stream: &mut TcpStream, xid: u32, lid: i32) -> u32 {
    let mut args = vec![];
    lid.pack_xdr(&mut args);
    let mut resp = call(stream, xid, CoreProc::DestroyLink, args).await;
    xdr::unpack_u32(&mut resp).unwrap()
}

async fn spawn_gateway(yaml: &str, addr: SocketAddr) {
    let config = Config::from_yaml_str(yaml).unwrap();
    let gateway = Gateway::new(config).unwrap();
    tokio::spawn(async move {
        let _ = Arc::clone(&gateway).serve(addr).await;
    });
    // give the listener a moment to bind before the test starts connecting.
    sleep(Duration::from_millis(50)).await;
}

async fn connect(addr: SocketAddr) -> TcpStream {
    for _ in 0..20 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr}");
}

#[tokio::test]
async fn write_then_read_round_trips_over_the_wire() {
    let addr: SocketAddr = "127.0.0.1:18121".parse().unwrap();
    spawn_gateway(
        r#"
server:
  port: 18121
devices:
  dev:
    type: loopback
"#,
        addr,
    )
    .await;

    let mut stream = connect(addr).await;
    let (error, lid) = create_link(&mut stream, 1, "dev", false, 0).await;
    assert_eq!(error, 0);

    let (error, size) = device_write(&mut stream, 2, lid, false, b"hello").await;
    assert_eq!(error, 0);
    assert_eq!(size, 5);

    let (error, data) = device_read(&mut stream, 3, lid, 5).await;
    assert_eq!(error, 0);
    assert_eq!(data, b"hello");

    assert_eq!(destroy_link(&mut stream, 4, lid).await, 0);
}

#[tokio::test]
async fn destroyed_link_is_rejected_on_subsequent_use() {
    let addr: SocketAddr = "127.0.0.1:18122".parse().unwrap();
    spawn_gateway(
        r#"
server:
  port: 18122
devices:
  dev:
    type: loopback
"#,
        addr,
    )
    .await;

    let mut stream = connect(addr).await;
    let (error, lid) = create_link(&mut stream, 1, "dev", false, 0).await;
    assert_eq!(error, 0);
    assert_eq!(destroy_link(&mut stream, 2, lid).await, 0);

    let (error, _size) = device_write(&mut stream, 3, lid, false, b"x").await;
    assert_eq!(error, 4); // InvalidLinkIdentifier
}

#[tokio::test]
async fn second_client_is_locked_out_until_the_first_releases() {
    let addr: SocketAddr = "127.0.0.1:18123".parse().unwrap();
    spawn_gateway(
        r#"
server:
  port: 18123
devices:
  dev:
    type: loopback
    requires_lock: true
"#,
        addr,
    )
    .await;

    let mut client_a = connect(addr).await;
    let (error, lid_a) = create_link(&mut client_a, 1, "dev", true, 0).await;
    assert_eq!(error, 0);

    let mut client_b = connect(addr).await;
    let (error, lid_b) = create_link(&mut client_b, 1, "dev", false, 0).await;
    assert_eq!(error, 0);

    let (error, _) = device_write(&mut client_b, 2, lid_b, false, b"x").await;
    assert_eq!(error, 11); // DeviceLockedByAnotherLink

    // Dropping the first client's connection tears down its link and
    // releases the lock it held, without the second client ever asking.
    drop(client_a);

    let mut error = 11;
    for _ in 0..20 {
        let (e, _) = device_write(&mut client_b, 3, lid_b, false, b"x").await;
        error = e;
        if error == 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(error, 0);
}

#[tokio::test]
async fn create_link_for_unknown_device_is_rejected_before_any_lock_is_taken() {
    let addr: SocketAddr = "127.0.0.1:18124".parse().unwrap();
    spawn_gateway(
        r#"
server:
  port: 18124
devices:
  dev:
    type: loopback
"#,
        addr,
    )
    .await;

    let mut stream = connect(addr).await;
    let (error, lid) = create_link(&mut stream, 1, "nope", false, 0).await;
    assert_eq!(error, 3); // DeviceNotAccessible
    assert_eq!(lid, 0);
}
