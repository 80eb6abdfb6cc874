//! TAP/TUN device seam.
//!
//! Platform drivers live outside the engine; the engine consumes this trait
//! and assumes whole frames per read/write. [`MemoryTap`] is an in-process
//! implementation used by tests and the diagnostic CLI.

use crate::types::EthernetAddress;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// TAP adapter errors
#[derive(Debug, Error)]
pub enum TapError {
    /// The device has been closed or removed
    #[error("tap device closed")]
    Closed,

    /// Underlying device I/O failed
    #[error("tap I/O error: {0}")]
    Io(String),
}

/// The virtual network device the engine tunnels frames through.
///
/// Reads deliver whole frames; writes accept whole frames. A read larger
/// than `buf` is a driver bug, not an engine concern.
#[async_trait]
pub trait TapAdapter: Send + Sync {
    /// Read one frame into `buf`; returns the frame size.
    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize, TapError>;

    /// Write one frame; returns the bytes accepted.
    async fn write_frame(&self, frame: &[u8]) -> Result<usize, TapError>;

    /// Device MTU
    fn mtu(&self) -> usize;

    /// Hardware address, when the device operates at the Ethernet layer
    fn hardware_address(&self) -> Option<EthernetAddress>;

    /// Signal link state to the OS side
    fn set_connected_state(&self, connected: bool);

    /// Close the device; pending reads complete with [`TapError::Closed`].
    fn close(&self);
}

/// In-process tap device backed by channels.
///
/// The engine side implements [`TapAdapter`]; the returned [`MemoryTapPort`]
/// is the "operating system" side, injecting frames the engine will read
/// and collecting frames the engine writes.
pub struct MemoryTap {
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    mtu: usize,
    hardware_address: Option<EthernetAddress>,
    connected: AtomicBool,
    closed: AtomicBool,
}

/// Test-side handle of a [`MemoryTap`]
pub struct MemoryTapPort {
    /// Inject a frame for the engine to read
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Collect frames the engine wrote
    pub collect: mpsc::Receiver<Vec<u8>>,
}

impl MemoryTap {
    /// Create a memory tap and its test-side port.
    #[must_use]
    pub fn new(mtu: usize, hardware_address: Option<EthernetAddress>) -> (Arc<Self>, MemoryTapPort) {
        let (inject, incoming) = mpsc::channel(256);
        let (outgoing, collect) = mpsc::channel(256);
        (
            Arc::new(Self {
                incoming: Mutex::new(incoming),
                outgoing,
                mtu,
                hardware_address,
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            MemoryTapPort { inject, collect },
        )
    }

    /// Whether the engine has signalled link-up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TapAdapter for MemoryTap {
    async fn read_frame(&self, buf: &mut [u8]) -> Result<usize, TapError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TapError::Closed);
        }
        let frame = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TapError::Closed)?;
        if frame.len() > buf.len() {
            return Err(TapError::Io(format!(
                "frame of {} bytes exceeds read buffer",
                frame.len()
            )));
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<usize, TapError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TapError::Closed);
        }
        self.outgoing
            .send(frame.to_vec())
            .await
            .map_err(|_| TapError::Closed)?;
        Ok(frame.len())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn hardware_address(&self) -> Option<EthernetAddress> {
        self.hardware_address
    }

    fn set_connected_state(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inject_and_read() {
        let (tap, port) = MemoryTap::new(1500, None);
        port.inject.send(b"a frame".to_vec()).await.unwrap();

        let mut buf = [0u8; 64];
        let size = tap.read_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..size], b"a frame");
    }

    #[tokio::test]
    async fn test_write_and_collect() {
        let (tap, mut port) = MemoryTap::new(1500, None);
        tap.write_frame(b"outbound").await.unwrap();
        assert_eq!(port.collect.recv().await.unwrap(), b"outbound");
    }

    #[tokio::test]
    async fn test_closed_tap() {
        let (tap, _port) = MemoryTap::new(1500, None);
        tap.close();
        let mut buf = [0u8; 8];
        assert!(matches!(
            tap.read_frame(&mut buf).await,
            Err(TapError::Closed)
        ));
        assert!(matches!(tap.write_frame(b"x").await, Err(TapError::Closed)));
    }

    #[tokio::test]
    async fn test_connected_state() {
        let (tap, _port) = MemoryTap::new(1500, None);
        assert!(!tap.is_connected());
        tap.set_connected_state(true);
        assert!(tap.is_connected());
    }

    #[tokio::test]
    async fn test_hardware_address() {
        let mac: EthernetAddress = "02:00:00:00:00:01".parse().unwrap();
        let (tap, _port) = MemoryTap::new(1400, Some(mac));
        assert_eq!(tap.hardware_address(), Some(mac));
        assert_eq!(tap.mtu(), 1400);
    }
}
