//! In-process loopback device: echoes whatever was last written. Useful for
//! exercising the gateway (locking, link lifecycle, framing) without real
//! hardware attached.

use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;

use crate::adapter::{Adapter, ReadOutcome};
use crate::error::Result;

pub struct LoopbackAdapter {
    buffer: VecDeque<u8>,
    connected: bool,
}
impl LoopbackAdapter {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            connected: false,
        }
    }
}
impl Default for LoopbackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for LoopbackAdapter {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.buffer.clear();
        Ok(())
    }

    async fn acquire(&mut self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.buffer.extend(data.iter().copied());
        Ok(data.len())
    }

    async fn read(&mut self, max_len: usize, _deadline: Option<Instant>) -> Result<(Vec<u8>, ReadOutcome)> {
        let n = max_len.min(self.buffer.len());
        let data: Vec<u8> = self.buffer.drain(..n).collect();
        let outcome = ReadOutcome {
            request_size_satisfied: data.len() == max_len,
            termchr_matched: false,
            end: self.buffer.is_empty(),
        };
        Ok((data, outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_written_bytes_back() {
        let mut adapter = LoopbackAdapter::new();
        adapter.connect().await.unwrap();
        adapter.write(b"*IDN?\n").await.unwrap();
        let (data, outcome) = adapter.read(64, None).await.unwrap();
        assert_eq!(data, b"*IDN?\n");
        assert!(outcome.end);
    }

    #[tokio::test]
    async fn read_respects_max_len_and_reports_partial() {
        let mut adapter = LoopbackAdapter::new();
        adapter.write(b"0123456789").await.unwrap();
        let (data, outcome) = adapter.read(4, None).await.unwrap();
        assert_eq!(data, b"0123");
        assert!(!outcome.end);
        assert!(outcome.request_size_satisfied);
    }
}
