//! Byte channel carrying provisioning PDUs
//!
//! The bearer (PB-ADV or PB-GATT) lives outside this crate; the state
//! machines only need to send a PDU and wait for the next one.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{MeshError, Result};

#[async_trait]
pub trait ProvisioningChannel: Send {
    async fn send(&mut self, pdu: Vec<u8>) -> Result<()>;

    /// Wait for the next PDU. `Ok(None)` means the timeout elapsed.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// In-process duplex channel over tokio mpsc queues
#[derive(Debug)]
pub struct MpscChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MpscChannel {
    /// Two connected ends
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

fn link_closed() -> MeshError {
    MeshError::malformed("provisioning link closed")
}

#[async_trait]
impl ProvisioningChannel for MpscChannel {
    async fn send(&mut self, pdu: Vec<u8>) -> Result<()> {
        trace!("TX {}", hex::encode(&pdu));
        self.tx.send(pdu).await.map_err(|_| link_closed())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(pdu)) => {
                trace!("RX {}", hex::encode(&pdu));
                Ok(Some(pdu))
            }
            Ok(None) => Err(link_closed()),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_duplex() {
        let (mut a, mut b) = MpscChannel::pair(4);
        a.send(vec![1, 2]).await.unwrap();
        b.send(vec![3]).await.unwrap();
        assert_eq!(b.receive(Duration::from_millis(100)).await.unwrap(), Some(vec![1, 2]));
        assert_eq!(a.receive(Duration::from_millis(100)).await.unwrap(), Some(vec![3]));
    }

    #[tokio::test]
    async fn test_timeout_and_close() {
        let (mut a, b) = MpscChannel::pair(1);
        assert_eq!(a.receive(Duration::from_millis(10)).await.unwrap(), None);
        drop(b);
        assert!(a.receive(Duration::from_millis(10)).await.is_err());
        assert!(a.send(vec![0]).await.is_err());
    }
}
