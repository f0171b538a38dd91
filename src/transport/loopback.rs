//! In-process loopback fabric.
//!
//! Ports are attached by hardware address; a frame is routed by the
//! destination address in its first six bytes, broadcast going to every port
//! but the sender. The fabric can be told to misbehave the way a real link
//! does:
//!
//! - `loss`: probability a frame is silently dropped
//! - `duplicate`: probability a frame is delivered twice
//! - `reorder`: probability a frame is held back and released after the next
//!   one (or on [`LoopbackFabric::flush_held`])
//!
//! With a fixed `seed` the misbehaviour is reproducible.

use crate::core::packet::MacAddr;
use crate::error::{constants, MalformedKind, MxError, Result};
use crate::transport::FrameSink;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChaosConfig {
    pub loss: f64,
    pub duplicate: f64,
    pub reorder: f64,
    pub seed: Option<u64>,
}

impl ChaosConfig {
    pub fn is_calm(&self) -> bool {
        self.loss <= 0.0 && self.duplicate <= 0.0 && self.reorder <= 0.0
    }
}

#[derive(Debug)]
struct FabricInner {
    ports: RwLock<HashMap<MacAddr, mpsc::UnboundedSender<Bytes>>>,
    chaos: ChaosConfig,
    rng: Mutex<StdRng>,
    held: Mutex<Vec<Bytes>>,
}

enum Fate {
    Drop,
    Deliver,
    Twice,
    Hold,
}

impl FabricInner {
    fn fate(&self) -> Result<Fate> {
        if self.chaos.is_calm() {
            return Ok(Fate::Deliver);
        }
        let mut rng = self.rng.lock()?;
        let fate = if rng.random_bool(self.chaos.loss.clamp(0.0, 1.0)) {
            Fate::Drop
        } else if rng.random_bool(self.chaos.duplicate.clamp(0.0, 1.0)) {
            Fate::Twice
        } else if rng.random_bool(self.chaos.reorder.clamp(0.0, 1.0)) {
            Fate::Hold
        } else {
            Fate::Deliver
        };
        Ok(fate)
    }

    fn route(&self, frame: Bytes) -> Result<()> {
        match self.fate()? {
            Fate::Drop => {
                trace!(target: "mx::transport", len = frame.len(), "Loopback dropped frame");
                Ok(())
            }
            Fate::Hold => {
                self.held.lock()?.push(frame);
                Ok(())
            }
            Fate::Twice => {
                self.deliver(frame.clone())?;
                self.deliver(frame)?;
                self.release_held()
            }
            Fate::Deliver => {
                self.deliver(frame)?;
                self.release_held()
            }
        }
    }

    fn release_held(&self) -> Result<()> {
        let held = std::mem::take(&mut *self.held.lock()?);
        for frame in held {
            // A held frame whose port went away is simply lost.
            if let Err(e) = self.deliver(frame) {
                debug!(target: "mx::transport", error = %e, "Held frame undeliverable");
            }
        }
        Ok(())
    }

    fn deliver(&self, frame: Bytes) -> Result<()> {
        if frame.len() < 12 {
            return Err(MxError::MalformedPacket(MalformedKind::Truncated));
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[..6]);
        src.copy_from_slice(&frame[6..12]);
        let (dst, src) = (MacAddr(dst), MacAddr(src));

        let ports = self.ports.read()?;
        if dst.is_broadcast() {
            for (mac, port) in ports.iter().filter(|(mac, _)| **mac != src) {
                if port.send(frame.clone()).is_err() {
                    debug!(target: "mx::transport", port = %mac, "Broadcast to closed port");
                }
            }
            return Ok(());
        }

        let port = ports.get(&dst).ok_or_else(|| {
            MxError::Transport(format!("{}: {dst}", constants::ERR_UNKNOWN_DESTINATION))
        })?;
        port.send(frame)
            .map_err(|_| MxError::Transport(format!("{}: {dst}", constants::ERR_FABRIC_PORT_CLOSED)))
    }
}

/// A shared in-process link.
#[derive(Debug, Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::with_chaos(ChaosConfig::default())
    }

    pub fn with_chaos(chaos: ChaosConfig) -> Self {
        let rng = match chaos.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inner: Arc::new(FabricInner {
                ports: RwLock::new(HashMap::new()),
                chaos,
                rng: Mutex::new(rng),
                held: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a port for `mac`; frames addressed to it arrive on the returned
    /// receiver.
    pub fn attach(&self, mac: MacAddr) -> Result<(LoopbackPort, mpsc::UnboundedReceiver<Bytes>)> {
        if mac.is_broadcast() {
            return Err(MxError::Config("cannot attach the broadcast address".to_string()));
        }
        let mut ports = self.inner.ports.write()?;
        if ports.contains_key(&mac) {
            return Err(MxError::Config(format!("address {mac} already attached")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        ports.insert(mac, tx);
        debug!(target: "mx::transport", port = %mac, "Loopback port attached");
        Ok((
            LoopbackPort {
                mac,
                fabric: self.inner.clone(),
            },
            rx,
        ))
    }

    pub fn detach(&self, mac: MacAddr) -> Result<()> {
        self.inner.ports.write()?.remove(&mac);
        Ok(())
    }

    /// Deliver every frame currently held back for reordering.
    pub fn flush_held(&self) -> Result<usize> {
        let n = self.inner.held.lock()?.len();
        self.inner.release_held()?;
        Ok(n)
    }
}

/// Sending side of one attached port.
#[derive(Debug, Clone)]
pub struct LoopbackPort {
    mac: MacAddr,
    fabric: Arc<FabricInner>,
}

impl LoopbackPort {
    pub fn mac(&self) -> MacAddr {
        self.mac
    }
}

impl FrameSink for LoopbackPort {
    fn send(&self, frame: Bytes) -> Result<()> {
        self.fabric.route(frame)
    }
}
