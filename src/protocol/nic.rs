//! # Interface
//!
//! One [`Nic`] per hardware address. It owns the endpoint slot table, hands
//! received frames to the endpoint a packet names, answers host queries and
//! drives timeouts.
//!
//! Frames addressed to a closed or never-opened endpoint are counted as
//! misrouted. Message bodies (and the first fragment of a medium message) are
//! also refused with a library nack so the sender learns about it before its
//! own timeout.

use crate::config::MxConfig;
use crate::core::packet::{Frame, MacAddr, NackLib, NackReason, Packet, Route};
use crate::error::{MxError, Result};
use crate::memory::PagePinner;
use crate::protocol::completion::CompletionQueue;
use crate::protocol::endpoint::{Endpoint, EndpointShared};
use crate::transport::FrameSink;
use crate::utils::metrics::{global_metrics, Metrics};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

#[derive(Default)]
struct EndpointSlot {
    /// Bumped on every open; 0 means the slot was never used.
    generation: u8,
    endpoint: Option<Arc<EndpointShared>>,
}

#[derive(Debug, Clone, Copy)]
struct PendingQuery {
    /// A broadcast query collects replies until its deadline.
    broadcast: bool,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct HostTable {
    pending: HashMap<u32, PendingQuery>,
    names: HashMap<MacAddr, String>,
}

impl HostTable {
    fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, q| q.deadline > now);
        before - self.pending.len()
    }
}

/// A network interface.
pub struct Nic {
    mac: MacAddr,
    config: MxConfig,
    sink: Arc<dyn FrameSink>,
    pinner: Arc<dyn PagePinner>,
    metrics: Arc<Metrics>,
    slots: RwLock<Vec<EndpointSlot>>,
    hosts: Mutex<HostTable>,
}

impl Nic {
    /// Create an interface reporting into the process-wide metrics.
    pub fn new(
        config: MxConfig,
        sink: Arc<dyn FrameSink>,
        pinner: Arc<dyn PagePinner>,
    ) -> Result<Arc<Self>> {
        Self::with_metrics(config, sink, pinner, global_metrics())
    }

    pub fn with_metrics(
        config: MxConfig,
        sink: Arc<dyn FrameSink>,
        pinner: Arc<dyn PagePinner>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        config.validate_strict()?;
        let mac = config.nic.mac_addr()?;
        let slots = (0..config.nic.max_endpoints)
            .map(|_| EndpointSlot::default())
            .collect();
        info!(target: "mx::nic", mac = %mac, hostname = %config.nic.hostname, "Interface up");
        Ok(Arc::new(Self {
            mac,
            config,
            sink,
            pinner,
            metrics,
            slots: RwLock::new(slots),
            hosts: Mutex::new(HostTable::default()),
        }))
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn config(&self) -> &MxConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Open an endpoint, in slot `index` or the first free one.
    #[instrument(level = "debug", skip(self), fields(mac = %self.mac))]
    pub fn open_endpoint(self: &Arc<Self>, index: Option<u8>) -> Result<(Endpoint, CompletionQueue)> {
        let mut slots = self.slots.write()?;
        let index = match index {
            Some(i) => {
                let slot = slots
                    .get(i as usize)
                    .ok_or_else(|| MxError::Config(format!("endpoint index {i} out of range")))?;
                if slot.endpoint.is_some() {
                    return Err(MxError::EndpointBusy(i));
                }
                i as usize
            }
            None => slots
                .iter()
                .position(|s| s.endpoint.is_none())
                .ok_or(MxError::EndpointTableFull)?,
        };

        let slot = &mut slots[index];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        let (shared, queue) = EndpointShared::new(
            index as u8,
            slot.generation,
            self.mac,
            &self.config,
            self.sink.clone(),
            self.pinner.clone(),
            self.metrics.clone(),
        );
        slot.endpoint = Some(shared.clone());
        info!(target: "mx::nic", index, generation = slot.generation, "Endpoint opened");
        Ok((Endpoint::new(shared, self.clone()), queue))
    }

    /// Free slot `index` if it still holds incarnation `generation`.
    pub(crate) fn detach(&self, index: u8, generation: u8) {
        let Ok(mut slots) = self.slots.write() else {
            return;
        };
        if let Some(slot) = slots.get_mut(index as usize) {
            if slot.generation == generation {
                slot.endpoint = None;
            }
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.slots
            .read()
            .map(|s| s.iter().filter(|s| s.endpoint.is_some()).count())
            .unwrap_or(0)
    }

    fn endpoint(&self, index: u8) -> Option<Arc<EndpointShared>> {
        self.slots
            .read()
            .ok()?
            .get(index as usize)
            .and_then(|s| s.endpoint.clone())
    }

    fn ever_opened(&self, index: u8) -> bool {
        self.slots
            .read()
            .ok()
            .and_then(|s| s.get(index as usize).map(|s| s.generation > 0))
            .unwrap_or(false)
    }

    fn send_packet(&self, dst: MacAddr, packet: Packet) {
        match self.sink.send(Frame::new(dst, self.mac, packet).to_bytes()) {
            Ok(()) => self.metrics.frame_sent(),
            Err(e) => {
                self.metrics.send_error();
                debug!(target: "mx::nic", dst = %dst, error = %e, "Frame not sent");
            }
        }
    }

    // ---- receive path ----

    /// Decode and dispatch one received frame. Malformed frames are counted
    /// and dropped.
    pub fn handle_frame(&self, frame: Bytes) {
        match Frame::from_bytes(frame) {
            Ok(frame) => self.handle_decoded(frame),
            Err(e) => {
                self.metrics.frame_received();
                self.record_malformed(&e);
            }
        }
    }

    /// Dispatch a frame the link already decoded.
    pub fn handle_decoded(&self, frame: Frame) {
        self.metrics.frame_received();
        self.dispatch(frame);
    }

    pub fn record_malformed(&self, error: &MxError) {
        self.metrics.malformed();
        trace!(target: "mx::wire", error = %error, "Malformed frame dropped");
    }

    fn dispatch(&self, frame: Frame) {
        let Frame { eth, packet } = frame;
        if eth.dst != self.mac && !eth.dst.is_broadcast() {
            self.metrics.misrouted();
            return;
        }

        match packet {
            Packet::HostQuery { magic } => {
                let hostname = Bytes::from(self.config.nic.hostname.clone().into_bytes());
                self.send_packet(eth.src, Packet::HostReply { magic, hostname });
            }
            Packet::HostReply { magic, hostname } => self.record_host(eth.src, magic, &hostname),
            Packet::Raw(_) | Packet::EtherUnicast(_) => {
                trace!(target: "mx::nic", src = %eth.src, "Raw frame ignored");
            }
            packet => {
                let Some(route) = packet.route().copied() else {
                    return;
                };
                match self.endpoint(route.dst_endpoint) {
                    Some(endpoint) => endpoint.handle_packet(eth.src, packet),
                    None => self.refuse(eth.src, route, &packet),
                }
            }
        }
    }

    fn refuse(&self, src: MacAddr, route: Route, packet: &Packet) {
        self.metrics.misrouted();
        let msg = match packet {
            Packet::Tiny(m) | Packet::Small(m) => m.msg,
            Packet::Rndv(r) => r.msg,
            Packet::MediumFrag(f) if f.frag_offset == 0 => f.msg,
            _ => {
                trace!(target: "mx::nic", endpoint = route.dst_endpoint, "Packet for closed endpoint dropped");
                return;
            }
        };
        let reason = if self.ever_opened(route.dst_endpoint) {
            NackReason::EndpointClosed
        } else {
            NackReason::BadEndpoint
        };
        debug!(target: "mx::nic", src = %src, endpoint = route.dst_endpoint, ?reason, "Message refused");
        self.send_packet(
            src,
            Packet::NackLib(NackLib {
                route: Route {
                    dst_endpoint: route.src_endpoint,
                    src_endpoint: route.dst_endpoint,
                    src_generation: 0,
                },
                session: msg.session,
                lib_seqnum: msg.lib_seqnum,
                reason,
            }),
        );
    }

    // ---- host queries ----

    /// Ask `dst` (or everyone, with the broadcast address) for its hostname.
    pub fn query_host(&self, dst: MacAddr) -> Result<u32> {
        let magic: u32 = rand::random();
        let query = PendingQuery {
            broadcast: dst.is_broadcast(),
            deadline: Instant::now() + self.host_query_timeout(),
        };
        self.hosts.lock()?.pending.insert(magic, query);
        self.sink
            .send(Frame::new(dst, self.mac, Packet::HostQuery { magic }).to_bytes())?;
        self.metrics.frame_sent();
        Ok(magic)
    }

    fn record_host(&self, mac: MacAddr, magic: u32, hostname: &[u8]) {
        let Ok(mut hosts) = self.hosts.lock() else {
            return;
        };
        let Some(query) = hosts.pending.get(&magic).copied() else {
            trace!(target: "mx::nic", src = %mac, "Unsolicited host reply");
            return;
        };
        if !query.broadcast {
            hosts.pending.remove(&magic);
        }
        let name = String::from_utf8_lossy(hostname).into_owned();
        debug!(target: "mx::nic", mac = %mac, hostname = %name, "Host resolved");
        hosts.names.insert(mac, name);
    }

    /// Queries outlive their sender's interest after one notify timeout.
    fn host_query_timeout(&self) -> Duration {
        self.config.engine.notify_timeout
    }

    /// Hostname learned from a host reply.
    pub fn hostname_of(&self, mac: MacAddr) -> Option<String> {
        self.hosts.lock().ok()?.names.get(&mac).cloned()
    }

    // ---- driving ----

    /// Run timeouts on every open endpoint.
    pub fn poll_timeouts(&self, now: Instant) {
        if let Ok(mut hosts) = self.hosts.lock() {
            let expired = hosts.expire(now);
            if expired > 0 {
                trace!(target: "mx::nic", expired, "Host queries expired");
            }
        }
        let endpoints: Vec<Arc<EndpointShared>> = match self.slots.read() {
            Ok(slots) => slots.iter().filter_map(|s| s.endpoint.clone()).collect(),
            Err(_) => return,
        };
        for endpoint in endpoints {
            endpoint.poll_timeouts(now);
        }
    }

    /// Pump received frames and timeouts until `shutdown` fires or the frame
    /// source closes.
    #[instrument(skip_all, fields(mac = %self.mac))]
    pub async fn run(
        self: Arc<Self>,
        mut frames: mpsc::UnboundedReceiver<Bytes>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        let mut tick = tokio::time::interval(self.config.engine.timeout_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(target: "mx::nic", "Interface shutting down");
                    break;
                }

                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => {
                        warn!(target: "mx::nic", "Frame source closed");
                        break;
                    }
                },

                _ = tick.tick() => self.poll_timeouts(Instant::now()),
            }
        }

        self.metrics.log_metrics();
        Ok(())
    }
}

impl std::fmt::Debug for Nic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nic")
            .field("mac", &self.mac)
            .field("hostname", &self.config.nic.hostname)
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}
