//! ONC-RPC record-marking framing for TCP, per RFC5531 §10.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    rpc::onc::LAST_FRAGMENT_MARKER,
};

/// Largest single RPC message this gateway will reassemble from fragments.
/// Guards against a misbehaving client claiming an unbounded fragment length.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Read one complete, reassembled RPC message from a record-marked stream.
pub async fn read_message(stream: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let mut message = vec![];

    loop {
        let header = stream.read_u32().await?;
        let len = (header & !LAST_FRAGMENT_MARKER) as usize;
        let last = (header & LAST_FRAGMENT_MARKER) != 0;

        if message.len() + len > MAX_MESSAGE_SIZE {
            return Err(Error::Decode(format!(
                "RPC message exceeds maximum size of {MAX_MESSAGE_SIZE} bytes"
            )));
        }

        let mut fragment = vec![0; len];
        stream.read_exact(&mut fragment).await?;
        message.append(&mut fragment);

        if last {
            break;
        }
    }

    Ok(message)
}

/// Write a complete RPC message as a single, final fragment.
pub async fn write_message(stream: &mut (impl AsyncWrite + Unpin), data: Vec<u8>) -> Result<()> {
    let header = (data.len() as u32) | LAST_FRAGMENT_MARKER;
    stream.write_all(&header.to_be_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;
    Ok(())
}
