//! Shared harness: NICs on a loopback fabric, pumped by hand.

#![allow(dead_code)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::Bytes;
use mx_ether::config::MxConfig;
use mx_ether::core::packet::{Frame, MacAddr, Packet};
use mx_ether::memory::{HostMemory, Span};
use mx_ether::protocol::{Completion, CompletionQueue, Endpoint, Nic};
use mx_ether::transport::loopback::LoopbackFabric;
use mx_ether::utils::Metrics;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Node {
    pub nic: Arc<Nic>,
    pub rx: mpsc::UnboundedReceiver<Bytes>,
    pub mem: Arc<HostMemory>,
    pub metrics: Arc<Metrics>,
}

impl Node {
    pub fn new(fabric: &LoopbackFabric, last: u8) -> Self {
        Self::with_config(fabric, last, |_| {})
    }

    pub fn with_config(fabric: &LoopbackFabric, last: u8, tweak: impl FnOnce(&mut MxConfig)) -> Self {
        let config = MxConfig::default_with_overrides(|c| {
            c.nic.mac = format!("02:00:00:00:00:{last:02x}");
            c.nic.hostname = format!("node{last}");
            tweak(c);
        });
        let (port, rx) = fabric.attach(config.nic.mac_addr().unwrap()).unwrap();
        let mem = Arc::new(HostMemory::new());
        let metrics = Arc::new(Metrics::new());
        let nic = Nic::with_metrics(config, Arc::new(port), mem.clone(), metrics.clone()).unwrap();
        Self { nic, rx, mem, metrics }
    }

    pub fn mac(&self) -> MacAddr {
        self.nic.mac()
    }

    pub fn open(&self, index: u8) -> (Endpoint, CompletionQueue) {
        self.nic.open_endpoint(Some(index)).unwrap()
    }

    /// Allocate a buffer holding `data`.
    pub fn buffer(&self, data: &[u8]) -> Span {
        let addr = self.mem.alloc(data.len().max(1));
        self.mem.write(addr, data).unwrap();
        Span::new(addr, data.len() as u64)
    }

    /// Allocate a zeroed buffer of `len` bytes.
    pub fn zeroed(&self, len: usize) -> Span {
        Span::new(self.mem.alloc(len.max(1)), len as u64)
    }

    pub fn read(&self, span: Span) -> Vec<u8> {
        self.mem.read(span.addr, span.len as usize).unwrap()
    }
}

/// Deliver frames until every queue is empty and nothing is held back.
pub fn pump(fabric: &LoopbackFabric, nodes: &mut [&mut Node]) -> usize {
    pump_filtered(fabric, nodes, |_| true)
}

/// Like [`pump`], but frames for which `keep` is false are dropped.
pub fn pump_filtered(
    fabric: &LoopbackFabric,
    nodes: &mut [&mut Node],
    mut keep: impl FnMut(&Packet) -> bool,
) -> usize {
    let mut delivered = 0;
    loop {
        let mut progress = false;
        for node in nodes.iter_mut() {
            while let Ok(frame) = node.rx.try_recv() {
                progress = true;
                if let Ok(decoded) = Frame::from_bytes(frame.clone()) {
                    if !keep(&decoded.packet) {
                        continue;
                    }
                }
                node.nic.handle_frame(frame);
                delivered += 1;
            }
        }
        if !progress && fabric.flush_held().unwrap() == 0 {
            return delivered;
        }
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Connect `a` to `b` and drain the connect completion.
pub fn connect(fabric: &LoopbackFabric, a: &mut Node, ep_a: &Endpoint, cq_a: &mut CompletionQueue, b: &mut Node, ep_b: &Endpoint) {
    ep_a.connect(ep_b.addr(), 0).unwrap();
    pump(fabric, &mut [a, b]);
    let done = cq_a.try_next().expect("connect completion");
    assert!(done.status.is_success(), "connect failed: {done:?}");
}

pub fn only(cq: &mut CompletionQueue) -> Completion {
    let mut all = cq.drain();
    assert_eq!(all.len(), 1, "expected exactly one completion, got {all:?}");
    all.remove(0)
}
