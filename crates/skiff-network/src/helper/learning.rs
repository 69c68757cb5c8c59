//! In-process MAC-learning switch.
//!
//! Used where the helper cannot create kernel bridges and in tests. Frames
//! entering a port teach the switch the source MAC; unicast frames to a
//! known MAC go to its port, everything else floods to all other ports.
//! There is no L3 gateway on this backend.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use skiff_common::{SkiffError, SkiffResult};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::SwitchBackend;
use crate::device::FrameDevice;
use crate::frame::MIN_FRAME_LEN;
use crate::mac::MacAddress;

const PORT_QUEUE_LEN: usize = 512;

type Mac = [u8; 6];

fn mac_at(frame: &[u8], offset: usize) -> Mac {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[offset..offset + 6]);
    mac
}

#[derive(Debug, Default)]
struct Fabric {
    ports: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    table: Mutex<HashMap<Mac, String>>,
}

impl Fabric {
    fn forward(&self, ingress: &str, frame: &[u8]) {
        if frame.len() < MIN_FRAME_LEN {
            return;
        }
        let dst = mac_at(frame, 0);
        let src = mac_at(frame, 6);

        let known = {
            let mut table = self.table.lock();
            if src[0] & 0x01 == 0 {
                table.insert(src, ingress.to_string());
            }
            if dst[0] & 0x01 == 0 {
                table.get(&dst).cloned()
            } else {
                None
            }
        };

        let ports = self.ports.read();
        match known.as_deref() {
            Some(egress) if egress == ingress => {}
            Some(egress) => {
                if let Some(tx) = ports.get(egress) {
                    let _ = tx.try_send(frame.to_vec());
                }
            }
            None => {
                for (name, tx) in ports.iter() {
                    if name != ingress {
                        let _ = tx.try_send(frame.to_vec());
                    }
                }
            }
        }
    }

    fn unplug(&self, port: &str) -> bool {
        self.table.lock().retain(|_, owner| owner != port);
        self.ports.write().remove(port).is_some()
    }
}

/// A port of a [`LearningSwitch`] bridge.
struct SwitchPort {
    name: String,
    fabric: Arc<Fabric>,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl FrameDevice for SwitchPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let frame = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "port removed"))?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.fabric.forward(&self.name, frame);
        Ok(())
    }
}

/// Software switch backend.
#[derive(Debug, Default)]
pub struct LearningSwitch {
    bridges: Mutex<HashMap<String, Arc<Fabric>>>,
}

impl LearningSwitch {
    /// A switch with no bridges.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of MAC addresses learned on `bridge`.
    #[must_use]
    pub fn learned(&self, bridge: &str) -> usize {
        self.bridges
            .lock()
            .get(bridge)
            .map_or(0, |fabric| fabric.table.lock().len())
    }

    fn fabric(&self, bridge: &str) -> SkiffResult<Arc<Fabric>> {
        self.bridges
            .lock()
            .get(bridge)
            .cloned()
            .ok_or_else(|| SkiffError::BridgeOperationFailed {
                message: format!("bridge {bridge} does not exist"),
            })
    }
}

#[async_trait]
impl SwitchBackend for LearningSwitch {
    fn name(&self) -> &'static str {
        "learning-switch"
    }

    async fn create_bridge(&self, bridge: &str, _gateway: Ipv4Addr, _prefix_len: u8) -> SkiffResult<()> {
        self.bridges.lock().entry(bridge.to_string()).or_default();
        tracing::debug!(bridge, "Software bridge created");
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> SkiffResult<()> {
        if let Some(fabric) = self.bridges.lock().remove(bridge) {
            fabric.ports.write().clear();
        }
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str, mac: MacAddress) -> SkiffResult<Arc<dyn FrameDevice>> {
        let fabric = self.fabric(bridge)?;
        let (tx, rx) = mpsc::channel(PORT_QUEUE_LEN);
        fabric.unplug(port);
        fabric.ports.write().insert(port.to_string(), tx);
        // The attached address is static; it never has to be learned.
        if !mac.is_multicast() {
            fabric.table.lock().insert(mac.octets(), port.to_string());
        }
        Ok(Arc::new(SwitchPort {
            name: port.to_string(),
            fabric,
            rx: AsyncMutex::new(rx),
        }))
    }

    async fn remove_port(&self, bridge: &str, port: &str) -> SkiffResult<()> {
        let fabric = self.bridges.lock().get(bridge).cloned();
        if let Some(fabric) = fabric {
            fabric.unplug(port);
        }
        Ok(())
    }

    async fn status(&self) -> SkiffResult<String> {
        Ok(format!("ok ({} bridges, in-process)", self.bridges.lock().len()))
    }
}
