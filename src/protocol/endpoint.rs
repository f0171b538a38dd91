//! # Endpoint
//!
//! The application-facing object: regions, connections, sends, receives and
//! the completion queue.
//!
//! ## Locking
//! - `state` guards partners, match queues, pending large sends and receives,
//!   medium reassembly and pending connects
//! - the pull table and each pull context have their own locks; reply
//!   processing takes the state lock only after a context completes
//! - pull requests are serviced without the state lock
//! - frames are collected while locks are held and sent after they are
//!   released
//!
//! Completions for a request are pushed exactly once, whichever of success,
//! timeout, nack or close gets there first.

use crate::config::{EngineConfig, MxConfig};
use crate::core::match_info::MatchInfo;
use crate::core::packet::{
    ConnectReply, ConnectRequest, ConnectStatus, EagerMsg, Frame, MacAddr, MediumFrag,
    MsgHeader, NackLib, NackMcp, NackReason, Notify, Packet, PullReply, PullRequest, RegionId,
    Rndv, Route,
};
use crate::error::{MxError, Result};
use crate::memory::{PagePinner, RegionManager, Span};
use crate::protocol::completion::{
    Completion, CompletionKind, CompletionQueue, CompletionSender, CompletionStatus, PeerAddr,
    RequestId,
};
use crate::protocol::eager::{eager_packets, MediumReassembly, SizeClass};
use crate::protocol::matching::{Arrival, MatchQueues, PostedRecv, Unexpected};
use crate::protocol::nic::Nic;
use crate::protocol::partner::{GenerationCheck, Partner};
use crate::protocol::pull::{PullTable, ReplyOutcome};
use crate::protocol::rendezvous::{
    issue_pulls, service_pull_request, LargeRecv, LargeSend, PullPlan,
};
use crate::transport::FrameSink;
use crate::utils::metrics::Metrics;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

type Outbox = Vec<(MacAddr, Packet)>;

#[derive(Debug)]
struct ConnectAttempt {
    request: RequestId,
    deadline: Instant,
}

/// A rendezvous announce waiting to be pulled.
#[derive(Debug, Clone, Copy)]
struct Announce {
    peer: PeerAddr,
    match_info: MatchInfo,
    lib_seqnum: u16,
    msg_length: u32,
    sender_region: RegionId,
}

#[derive(Debug, Default)]
struct EndpointState {
    partners: HashMap<PeerAddr, Partner>,
    queues: MatchQueues,
    sends: HashMap<(PeerAddr, RegionId), LargeSend>,
    recvs: HashMap<RequestId, LargeRecv>,
    medium: HashMap<(PeerAddr, u16), MediumReassembly>,
    connects: HashMap<(PeerAddr, u8), ConnectAttempt>,
    connect_seqnum: u8,
}

impl EndpointState {
    fn session_of(&self, peer: PeerAddr) -> Option<u32> {
        self.partners.get(&peer).and_then(|p| p.session)
    }
}

/// Nack reason for a pull request the region table refused.
fn refusal_reason(error: &MxError) -> NackReason {
    match error {
        MxError::OutOfRange { .. } => NackReason::BadRange,
        _ => NackReason::BadRegion,
    }
}

/// Shared core of an endpoint, reachable from the NIC's receive path.
pub(crate) struct EndpointShared {
    index: u8,
    generation: u8,
    session: u32,
    mac: MacAddr,
    engine: EngineConfig,
    app_key: u32,
    regions: RegionManager,
    pulls: PullTable,
    state: Mutex<EndpointState>,
    completions: CompletionSender,
    sink: Arc<dyn FrameSink>,
    metrics: Arc<Metrics>,
    next_request: AtomicU64,
    closed: AtomicBool,
}

impl EndpointShared {
    pub(crate) fn new(
        index: u8,
        generation: u8,
        mac: MacAddr,
        config: &MxConfig,
        sink: Arc<dyn FrameSink>,
        pinner: Arc<dyn PagePinner>,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, CompletionQueue) {
        let (completions, queue) = CompletionQueue::channel();
        let shared = Arc::new(Self {
            index,
            generation,
            session: rand::random(),
            mac,
            engine: config.engine.clone(),
            app_key: config.nic.app_key,
            regions: RegionManager::with_metrics(pinner, config.nic.max_regions, metrics.clone()),
            pulls: PullTable::new(config.engine.max_pull_contexts, rand::random()),
            state: Mutex::new(EndpointState::default()),
            completions,
            sink,
            metrics,
            next_request: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        (shared, queue)
    }

    fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.mac, self.index)
    }

    fn route_to(&self, peer: PeerAddr) -> Route {
        Route {
            dst_endpoint: peer.endpoint,
            src_endpoint: self.index,
            src_generation: self.generation,
        }
    }

    fn next_request(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MxError::EndpointClosed);
        }
        Ok(())
    }

    fn complete(
        &self,
        request: RequestId,
        kind: CompletionKind,
        peer: Option<PeerAddr>,
        match_info: MatchInfo,
        length: u32,
        status: CompletionStatus,
    ) {
        trace!(target: "mx::endpoint", %request, ?kind, ?status, length, "Completion");
        self.completions.push(Completion {
            request,
            kind,
            peer,
            match_info,
            length,
            status,
        });
    }

    /// Hand frames to the link; the first failure is returned after every
    /// frame has been tried.
    fn transmit(&self, outbox: Outbox) -> Result<()> {
        let mut first_err = None;
        for (dst, packet) in outbox {
            let frame = Frame::new(dst, self.mac, packet).to_bytes();
            match self.sink.send(frame) {
                Ok(()) => self.metrics.frame_sent(),
                Err(e) => {
                    self.metrics.send_error();
                    debug!(target: "mx::endpoint", dst = %dst, error = %e, "Frame not sent");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Best-effort transmit for traffic the medium may lose anyway.
    fn flush(&self, outbox: Outbox) {
        if let Err(e) = self.transmit(outbox) {
            trace!(target: "mx::endpoint", error = %e, "Best-effort frames dropped");
        }
    }

    fn drop_region(&self, region: Option<RegionId>) {
        if let Some(id) = region {
            if let Err(e) = self.regions.deregister(id) {
                debug!(target: "mx::endpoint", region = %id, error = %e, "Internal region already gone");
            }
        }
    }

    fn register_internal(&self, spans: &[Span]) -> Result<(Option<RegionId>, u64)> {
        let length: u64 = spans.iter().map(|s| s.len).sum();
        if length > u32::MAX as u64 {
            return Err(MxError::OutOfRange {
                offset: 0,
                length,
                region_length: u32::MAX as u64,
            });
        }
        if length == 0 {
            return Ok((None, 0));
        }
        Ok((Some(self.regions.register(spans)?), length))
    }

    // ---- posting ----

    fn connect(&self, peer: PeerAddr, app_key: u32) -> Result<RequestId> {
        self.ensure_open()?;
        let request = self.next_request();
        let packet = {
            let mut state = self.state.lock()?;
            state.connect_seqnum = state.connect_seqnum.wrapping_add(1);
            let seq = state.connect_seqnum;
            state.partners.entry(peer).or_default();
            state.connects.insert(
                (peer, seq),
                ConnectAttempt {
                    request,
                    deadline: Instant::now() + self.engine.notify_timeout,
                },
            );
            Packet::ConnectRequest(ConnectRequest {
                route: self.route_to(peer),
                src_session: self.session,
                app_key,
                connect_seqnum: seq,
            })
        };
        debug!(target: "mx::endpoint", peer = %peer, %request, "Connecting");
        self.transmit(vec![(peer.mac, packet)])?;
        Ok(request)
    }

    fn isend(&self, peer: PeerAddr, spans: &[Span], match_info: MatchInfo) -> Result<RequestId> {
        self.ensure_open()?;
        if self.state.lock()?.session_of(peer).is_none() {
            return Err(MxError::NotConnected);
        }
        let (region, length) = self.register_internal(spans)?;
        let request = self.next_request();
        match (SizeClass::of(length, &self.engine), region) {
            (SizeClass::Rendezvous, Some(id)) => {
                self.send_rendezvous(request, peer, id, length as u32, match_info)?
            }
            (class, region) => self.send_eager(request, class, peer, region, length, match_info)?,
        }
        self.metrics.message_sent();
        Ok(request)
    }

    fn send_eager(
        &self,
        request: RequestId,
        class: SizeClass,
        peer: PeerAddr,
        region: Option<RegionId>,
        length: u64,
        match_info: MatchInfo,
    ) -> Result<()> {
        let payload = match region {
            Some(id) => {
                let copied = self.regions.acquire(id).and_then(|r| {
                    let mut buf = BytesMut::with_capacity(length as usize);
                    r.extract(0, length, &mut buf)?;
                    Ok(buf.freeze())
                });
                self.drop_region(Some(id));
                copied?
            }
            None => Bytes::new(),
        };

        let packets = {
            let mut state = self.state.lock()?;
            let partner = state.partners.get_mut(&peer).ok_or(MxError::NotConnected)?;
            let session = partner.session.ok_or(MxError::NotConnected)?;
            let msg = MsgHeader {
                lib_seqnum: partner.next_seqnum(),
                lib_piggyack: partner.piggyack(),
                match_info,
                session,
            };
            eager_packets(class, self.route_to(peer), msg, payload, self.engine.medium_frag_size)
        };
        self.transmit(packets.into_iter().map(|p| (peer.mac, p)).collect())?;
        self.complete(
            request,
            CompletionKind::Send,
            Some(peer),
            match_info,
            length as u32,
            CompletionStatus::Success,
        );
        Ok(())
    }

    fn send_rendezvous(
        &self,
        request: RequestId,
        peer: PeerAddr,
        region_id: RegionId,
        length: u32,
        match_info: MatchInfo,
    ) -> Result<()> {
        let region = match self.regions.acquire(region_id) {
            Ok(region) => region,
            Err(e) => {
                self.drop_region(Some(region_id));
                return Err(e);
            }
        };

        let packet = {
            let mut state = self.state.lock()?;
            let Some((session, lib_seqnum, lib_piggyack)) = state
                .partners
                .get_mut(&peer)
                .and_then(|p| Some((p.session?, p.next_seqnum(), p.piggyack())))
            else {
                drop(state);
                drop(region);
                self.drop_region(Some(region_id));
                return Err(MxError::NotConnected);
            };
            state.sends.insert(
                (peer, region_id),
                LargeSend {
                    request,
                    peer,
                    match_info,
                    length,
                    lib_seqnum,
                    region,
                    deadline: Instant::now() + self.engine.notify_timeout,
                },
            );
            Packet::Rndv(Rndv {
                route: self.route_to(peer),
                msg: MsgHeader {
                    lib_seqnum,
                    lib_piggyack,
                    match_info,
                    session,
                },
                msg_length: length,
                region: region_id,
            })
        };

        debug!(target: "mx::endpoint", peer = %peer, %request, region = %region_id, length, "Rendezvous announced");
        if let Err(e) = self.transmit(vec![(peer.mac, packet)]) {
            if let Ok(mut state) = self.state.lock() {
                state.sends.remove(&(peer, region_id));
            }
            self.drop_region(Some(region_id));
            return Err(e);
        }
        Ok(())
    }

    fn irecv(&self, spans: &[Span], match_info: MatchInfo, mask: u64) -> Result<RequestId> {
        self.ensure_open()?;
        let (region, length) = self.register_internal(spans)?;
        let request = self.next_request();
        let posted = PostedRecv {
            request,
            match_info,
            mask,
            region,
            length,
        };

        let mut outbox = Vec::new();
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => {
                    self.drop_region(region);
                    return Err(MxError::LockPoisoned);
                }
            };
            match state.queues.take_unexpected(match_info, mask) {
                Some(msg) => self.deliver(&mut state, posted, msg, &mut outbox),
                None => state.queues.post(posted),
            }
        }
        self.flush(outbox);
        Ok(request)
    }

    // ---- delivery ----

    fn deliver(
        &self,
        state: &mut EndpointState,
        posted: PostedRecv,
        msg: Unexpected,
        outbox: &mut Outbox,
    ) {
        match msg.arrival {
            Arrival::Eager(payload) => self.deliver_eager(posted, msg.peer, msg.match_info, payload),
            Arrival::Rendezvous {
                msg_length,
                sender_region,
            } => {
                let announce = Announce {
                    peer: msg.peer,
                    match_info: msg.match_info,
                    lib_seqnum: msg.lib_seqnum,
                    msg_length,
                    sender_region,
                };
                self.start_pull(state, posted, announce, outbox)
            }
        }
    }

    fn deliver_eager(&self, posted: PostedRecv, peer: PeerAddr, match_info: MatchInfo, payload: Bytes) {
        let deliver = payload.len().min(posted.length as usize);
        let filled = match posted.region {
            Some(id) if deliver > 0 => self
                .regions
                .acquire(id)
                .and_then(|r| r.fill(0, &payload[..deliver])),
            _ => Ok(()),
        };
        self.drop_region(posted.region);

        let status = match filled {
            Err(e) => {
                warn!(target: "mx::endpoint", request = %posted.request, error = %e, "Eager delivery failed");
                CompletionStatus::Abandoned
            }
            Ok(()) if deliver < payload.len() => CompletionStatus::Truncated {
                msg_length: payload.len() as u32,
            },
            Ok(()) => CompletionStatus::Success,
        };
        self.metrics.message_received();
        self.complete(
            posted.request,
            CompletionKind::Recv,
            Some(peer),
            match_info,
            deliver as u32,
            status,
        );
    }

    fn notify_packet(&self, state: &EndpointState, peer: PeerAddr, lib_seqnum: u16, total_length: u32, pulled_region: RegionId) -> Packet {
        let partner = state.partners.get(&peer);
        Packet::Notify(Notify {
            route: self.route_to(peer),
            session: partner.and_then(|p| p.session).unwrap_or_default(),
            total_length,
            pulled_region,
            lib_seqnum,
            lib_piggyack: partner.map(|p| p.piggyack()).unwrap_or_default(),
        })
    }

    fn start_pull(
        &self,
        state: &mut EndpointState,
        posted: PostedRecv,
        ann: Announce,
        outbox: &mut Outbox,
    ) {
        let deliver = (ann.msg_length as u64).min(posted.length);
        let status = if deliver < ann.msg_length as u64 {
            CompletionStatus::Truncated {
                msg_length: ann.msg_length,
            }
        } else {
            CompletionStatus::Success
        };

        let (Some(region), Some(session)) = (posted.region, state.session_of(ann.peer)) else {
            if deliver > 0 {
                warn!(target: "mx::endpoint", peer = %ann.peer, "Rendezvous from peer without session");
                self.drop_region(posted.region);
                self.complete(posted.request, CompletionKind::Recv, Some(ann.peer), ann.match_info, 0, CompletionStatus::Abandoned);
                return;
            }
            // Nothing to pull: release the sender straight away.
            outbox.push((ann.peer.mac, self.notify_packet(state, ann.peer, ann.lib_seqnum, 0, ann.sender_region)));
            self.drop_region(posted.region);
            self.metrics.message_received();
            self.complete(posted.request, CompletionKind::Recv, Some(ann.peer), ann.match_info, 0, status);
            return;
        };

        let plan = PullPlan {
            owner: posted.request,
            recv_region: region,
            sender_region: ann.sender_region,
            length: deliver,
            chunk: self.engine.max_pull_chunk as u64,
            route: self.route_to(ann.peer),
            session,
            deadline: Instant::now() + self.engine.pull_timeout,
        };
        match issue_pulls(&self.pulls, &self.regions, &plan) {
            Ok((handles, requests)) => {
                for req in requests {
                    self.metrics.pull_issued();
                    outbox.push((ann.peer.mac, Packet::PullRequest(req)));
                }
                let remaining = handles.len();
                state.recvs.insert(
                    posted.request,
                    LargeRecv {
                        request: posted.request,
                        peer: ann.peer,
                        match_info: ann.match_info,
                        msg_length: ann.msg_length,
                        deliver_length: deliver as u32,
                        recv_region: region,
                        sender_region: ann.sender_region,
                        lib_seqnum: ann.lib_seqnum,
                        handles,
                        remaining,
                    },
                );
            }
            Err(e) => {
                warn!(target: "mx::pull", request = %posted.request, error = %e, "Could not start pulls");
                self.drop_region(posted.region);
                self.complete(posted.request, CompletionKind::Recv, Some(ann.peer), ann.match_info, 0, CompletionStatus::Abandoned);
            }
        }
    }

    /// One context of `owner` completed.
    fn context_done(&self, state: &mut EndpointState, owner: RequestId, outbox: &mut Outbox) {
        let Some(recv) = state.recvs.get_mut(&owner) else {
            return;
        };
        recv.remaining = recv.remaining.saturating_sub(1);
        if recv.remaining > 0 {
            return;
        }
        let Some(recv) = state.recvs.remove(&owner) else {
            return;
        };

        outbox.push((
            recv.peer.mac,
            self.notify_packet(state, recv.peer, recv.lib_seqnum, recv.deliver_length, recv.sender_region),
        ));
        self.drop_region(Some(recv.recv_region));
        let status = if recv.deliver_length < recv.msg_length {
            CompletionStatus::Truncated {
                msg_length: recv.msg_length,
            }
        } else {
            CompletionStatus::Success
        };
        self.metrics.message_received();
        debug!(target: "mx::pull", request = %owner, length = recv.deliver_length, "Large receive complete");
        self.complete(owner, CompletionKind::Recv, Some(recv.peer), recv.match_info, recv.deliver_length, status);
    }

    /// Abandon every context of `owner` and report the receive failed.
    fn fail_recv(&self, state: &mut EndpointState, owner: RequestId, status: CompletionStatus) {
        let Some(recv) = state.recvs.remove(&owner) else {
            return;
        };
        let abandoned = self.pulls.abandon(&recv.handles);
        for _ in 0..abandoned {
            self.metrics.pull_abandoned();
        }
        self.drop_region(Some(recv.recv_region));
        info!(target: "mx::pull", request = %owner, ?status, contexts = abandoned, "Large receive abandoned");
        self.complete(owner, CompletionKind::Recv, Some(recv.peer), recv.match_info, 0, status);
    }

    fn fail_send(&self, send: LargeSend, status: CompletionStatus) {
        let id = send.region.id();
        send.region.release();
        self.drop_region(Some(id));
        info!(target: "mx::endpoint", request = %send.request, ?status, "Large send abandoned");
        self.complete(send.request, CompletionKind::Send, Some(send.peer), send.match_info, 0, status);
    }

    // ---- receive path ----

    pub(crate) fn handle_packet(&self, src: MacAddr, packet: Packet) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut outbox = Vec::new();
        match packet {
            Packet::PullReply(reply) => self.on_pull_reply(reply, &mut outbox),
            Packet::PullRequest(req) => self.on_pull_request(src, req, &mut outbox),
            other => match self.state.lock() {
                Ok(mut state) => self.dispatch(&mut state, src, other, &mut outbox),
                Err(_) => warn!(target: "mx::endpoint", "Endpoint state poisoned; packet dropped"),
            },
        }
        self.flush(outbox);
    }

    fn dispatch(&self, state: &mut EndpointState, src: MacAddr, packet: Packet, outbox: &mut Outbox) {
        let Some(route) = packet.route().copied() else {
            return;
        };
        let peer = PeerAddr::new(src, route.src_endpoint);

        // Nacks may come from the NIC rather than an endpoint incarnation.
        if let Packet::NackLib(nack) = packet {
            return self.on_nack_lib(state, peer, nack);
        }
        if !self.admit(state, peer, route.src_generation) {
            return;
        }

        match packet {
            Packet::ConnectRequest(req) => self.on_connect_request(state, peer, req, outbox),
            Packet::ConnectReply(reply) => self.on_connect_reply(state, peer, reply),
            Packet::Tiny(msg) | Packet::Small(msg) => self.on_eager(state, peer, msg, outbox),
            Packet::MediumFrag(frag) => self.on_medium(state, peer, frag, outbox),
            Packet::Rndv(rndv) => self.on_rndv(state, peer, rndv, outbox),
            Packet::Notify(notify) => self.on_notify(state, peer, notify),
            Packet::NackMcp(nack) => self.on_nack_mcp(state, nack),
            _ => {}
        }
    }

    /// Generation guard: stale incarnations are dropped, a restarted peer has
    /// its in-flight state torn down first.
    fn admit(&self, state: &mut EndpointState, peer: PeerAddr, generation: u8) -> bool {
        match state.partners.entry(peer).or_default().observe_generation(generation) {
            GenerationCheck::Current => true,
            GenerationCheck::Stale => {
                self.metrics.misrouted();
                trace!(target: "mx::endpoint", peer = %peer, generation, "Stale generation dropped");
                false
            }
            GenerationCheck::Restarted => {
                info!(target: "mx::endpoint", peer = %peer, generation, "Peer restarted");
                self.reset_peer(state, peer);
                true
            }
        }
    }

    fn reset_peer(&self, state: &mut EndpointState, peer: PeerAddr) {
        let owners: Vec<RequestId> = state
            .recvs
            .values()
            .filter(|r| r.peer == peer)
            .map(|r| r.request)
            .collect();
        for owner in owners {
            self.fail_recv(state, owner, CompletionStatus::Abandoned);
        }
        let keys: Vec<_> = state.sends.keys().filter(|(p, _)| *p == peer).copied().collect();
        for key in keys {
            if let Some(send) = state.sends.remove(&key) {
                self.fail_send(send, CompletionStatus::Abandoned);
            }
        }
        state.medium.retain(|(p, _), _| *p != peer);
        state.queues.forget_announces(peer);
    }

    /// Session check for message bodies; a mismatch is nacked.
    fn check_session(&self, peer: PeerAddr, msg: &MsgHeader, outbox: &mut Outbox) -> bool {
        if msg.session == self.session {
            return true;
        }
        self.metrics.misrouted();
        debug!(target: "mx::endpoint", peer = %peer, session = msg.session, "Bad session");
        outbox.push((
            peer.mac,
            Packet::NackLib(NackLib {
                route: self.route_to(peer),
                session: msg.session,
                lib_seqnum: msg.lib_seqnum,
                reason: NackReason::BadSession,
            }),
        ));
        false
    }

    fn on_connect_request(&self, state: &mut EndpointState, peer: PeerAddr, req: ConnectRequest, outbox: &mut Outbox) {
        let status = if req.app_key == self.app_key {
            state.partners.entry(peer).or_default().session = Some(req.src_session);
            ConnectStatus::Accepted
        } else {
            warn!(target: "mx::endpoint", peer = %peer, "Connect with wrong application key");
            ConnectStatus::BadKey
        };
        outbox.push((
            peer.mac,
            Packet::ConnectReply(ConnectReply {
                route: self.route_to(peer),
                src_session: self.session,
                target_session: req.src_session,
                connect_seqnum: req.connect_seqnum,
                status,
            }),
        ));
    }

    fn on_connect_reply(&self, state: &mut EndpointState, peer: PeerAddr, reply: ConnectReply) {
        if reply.target_session != self.session {
            self.metrics.misrouted();
            return;
        }
        let Some(attempt) = state.connects.remove(&(peer, reply.connect_seqnum)) else {
            trace!(target: "mx::endpoint", peer = %peer, "Duplicate connect reply");
            return;
        };
        let status = match reply.status {
            ConnectStatus::Accepted => {
                state.partners.entry(peer).or_default().session = Some(reply.src_session);
                info!(target: "mx::endpoint", peer = %peer, "Connected");
                CompletionStatus::Success
            }
            ConnectStatus::BadKey => CompletionStatus::Rejected,
        };
        self.complete(attempt.request, CompletionKind::Connect, Some(peer), MatchInfo::default(), 0, status);
    }

    /// Sequence bookkeeping shared by message bodies; false for a duplicate.
    fn accept_message(&self, state: &mut EndpointState, peer: PeerAddr, msg: &MsgHeader) -> bool {
        let partner = state.partners.entry(peer).or_default();
        if !partner.mark_delivered(msg.lib_seqnum) {
            self.metrics.stale_reply();
            trace!(target: "mx::endpoint", peer = %peer, seq = msg.lib_seqnum, "Duplicate message dropped");
            return false;
        }
        true
    }

    fn arrive(&self, state: &mut EndpointState, peer: PeerAddr, msg: &MsgHeader, arrival: Arrival, outbox: &mut Outbox) {
        let unexpected = Unexpected {
            peer,
            match_info: msg.match_info,
            lib_seqnum: msg.lib_seqnum,
            arrival,
        };
        match state.queues.take_posted(msg.match_info) {
            Some(posted) => self.deliver(state, posted, unexpected, outbox),
            None => state.queues.push_unexpected(unexpected),
        }
    }

    fn on_eager(&self, state: &mut EndpointState, peer: PeerAddr, msg: EagerMsg, outbox: &mut Outbox) {
        if !self.check_session(peer, &msg.msg, outbox) || !self.accept_message(state, peer, &msg.msg) {
            return;
        }
        self.arrive(state, peer, &msg.msg, Arrival::Eager(msg.payload), outbox);
    }

    fn on_medium(&self, state: &mut EndpointState, peer: PeerAddr, frag: MediumFrag, outbox: &mut Outbox) {
        if !self.check_session(peer, &frag.msg, outbox) {
            return;
        }
        let seq = frag.msg.lib_seqnum;
        // Anything above medium_max travels by rendezvous.
        if frag.msg_length == 0 || frag.msg_length as usize > self.engine.medium_max {
            self.metrics.malformed();
            debug!(target: "mx::endpoint", peer = %peer, seq, length = frag.msg_length, "Medium length out of bounds");
            return;
        }
        if state.partners.get(&peer).is_some_and(|p| p.already_delivered(seq)) {
            self.metrics.stale_reply();
            return;
        }

        let key = (peer, seq);
        let deadline = Instant::now() + self.engine.pull_timeout;
        let entry = state
            .medium
            .entry(key)
            .or_insert_with(|| MediumReassembly::new(&frag, deadline));
        match entry.accept(&frag) {
            Ok(false) => {}
            Ok(true) => {
                let Some(done) = state.medium.remove(&key) else {
                    return;
                };
                let header = done.header();
                if self.accept_message(state, peer, &header) {
                    self.arrive(state, peer, &header, Arrival::Eager(done.into_payload()), outbox);
                }
            }
            Err(MxError::StaleReply) => self.metrics.stale_reply(),
            Err(e) => {
                self.metrics.malformed();
                debug!(target: "mx::endpoint", peer = %peer, seq, error = %e, "Inconsistent fragment");
            }
        }
    }

    fn on_rndv(&self, state: &mut EndpointState, peer: PeerAddr, rndv: Rndv, outbox: &mut Outbox) {
        if !self.check_session(peer, &rndv.msg, outbox) || !self.accept_message(state, peer, &rndv.msg) {
            return;
        }
        debug!(target: "mx::endpoint", peer = %peer, length = rndv.msg_length, region = %rndv.region, "Rendezvous received");
        let arrival = Arrival::Rendezvous {
            msg_length: rndv.msg_length,
            sender_region: rndv.region,
        };
        self.arrive(state, peer, &rndv.msg, arrival, outbox);
    }

    /// Stateless servicing: no endpoint state is read or written. A stale
    /// incarnation of the requester fails the session check.
    fn on_pull_request(&self, src: MacAddr, req: PullRequest, outbox: &mut Outbox) {
        let peer = PeerAddr::new(src, req.route.src_endpoint);
        if req.session != self.session {
            self.metrics.misrouted();
            return;
        }
        match service_pull_request(&self.regions, &req, self.route_to(peer), self.engine.max_reply_payload) {
            Ok(replies) => {
                self.metrics.pull_serviced();
                outbox.extend(replies.into_iter().map(|r| (src, Packet::PullReply(r))));
            }
            Err(e) => {
                self.metrics.pull_refused();
                debug!(target: "mx::pull", peer = %peer, region = %req.pulled_region, error = %e, "Pull request refused");
                if self.engine.send_pull_nacks {
                    outbox.push((
                        src,
                        Packet::NackMcp(NackMcp {
                            route: self.route_to(peer),
                            reason: refusal_reason(&e),
                            dst_pull_handle: req.src_pull_handle,
                            dst_magic: req.src_magic,
                        }),
                    ));
                }
            }
        }
    }

    fn on_pull_reply(&self, reply: PullReply, outbox: &mut Outbox) {
        let outcome = self.pulls.apply_reply(
            reply.dst_pull_handle,
            reply.dst_magic,
            reply.puller_region,
            reply.puller_offset as u64,
            &reply.payload,
        );
        match outcome {
            Ok(outcome) => {
                self.metrics.pull_bytes_accepted(outcome.accepted());
                if let ReplyOutcome::Completed { owner, .. } = outcome {
                    self.metrics.pull_completed();
                    match self.state.lock() {
                        Ok(mut state) => self.context_done(&mut state, owner, outbox),
                        Err(_) => warn!(target: "mx::pull", "Endpoint state poisoned"),
                    }
                }
            }
            Err(e) => {
                self.metrics.stale_reply();
                trace!(target: "mx::pull", handle = reply.dst_pull_handle, error = %e, "Reply discarded");
            }
        }
    }

    fn on_notify(&self, state: &mut EndpointState, peer: PeerAddr, notify: Notify) {
        if notify.session != self.session {
            self.metrics.misrouted();
            return;
        }
        let Some(send) = state.sends.remove(&(peer, notify.pulled_region)) else {
            trace!(target: "mx::endpoint", peer = %peer, "Notify for no pending send");
            return;
        };
        let id = send.region.id();
        send.region.release();
        self.drop_region(Some(id));
        debug!(target: "mx::endpoint", request = %send.request, length = notify.total_length, "Large send complete");
        let status = if notify.total_length < send.length {
            CompletionStatus::Truncated {
                msg_length: send.length,
            }
        } else {
            CompletionStatus::Success
        };
        self.complete(send.request, CompletionKind::Send, Some(peer), send.match_info, notify.total_length, status);
    }

    fn on_nack_lib(&self, state: &mut EndpointState, peer: PeerAddr, nack: NackLib) {
        info!(target: "mx::endpoint", peer = %peer, reason = ?nack.reason, seq = nack.lib_seqnum, "Peer refused message");
        let key = state
            .sends
            .iter()
            .find(|((p, _), s)| *p == peer && s.lib_seqnum == nack.lib_seqnum)
            .map(|(k, _)| *k);
        if let Some(send) = key.and_then(|k| state.sends.remove(&k)) {
            self.fail_send(send, CompletionStatus::Rejected);
        }
        if nack.reason == NackReason::BadSession {
            if let Some(partner) = state.partners.get_mut(&peer) {
                partner.session = None;
            }
        }
    }

    fn on_nack_mcp(&self, state: &mut EndpointState, nack: NackMcp) {
        let owner = self
            .pulls
            .lookup(nack.dst_pull_handle, nack.dst_magic)
            .and_then(|ctx| {
                let owner = ctx.lock()?.owner();
                Ok(owner)
            });
        match owner {
            Ok(owner) => self.fail_recv(state, owner, CompletionStatus::Abandoned),
            Err(_) => self.metrics.stale_reply(),
        }
    }

    // ---- timeouts and teardown ----

    pub(crate) fn poll_timeouts(&self, now: Instant) {
        let expired = self.pulls.expired(now);
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        for owner in expired {
            self.fail_recv(&mut state, owner, CompletionStatus::Timeout);
        }

        let sends: Vec<_> = state
            .sends
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in sends {
            if let Some(send) = state.sends.remove(&key) {
                self.fail_send(send, CompletionStatus::Timeout);
            }
        }

        let connects: Vec<_> = state
            .connects
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in connects {
            if let Some(attempt) = state.connects.remove(&key) {
                self.complete(attempt.request, CompletionKind::Connect, Some(key.0), MatchInfo::default(), 0, CompletionStatus::Timeout);
            }
        }

        let before = state.medium.len();
        state.medium.retain(|_, m| m.deadline() > now);
        if state.medium.len() < before {
            debug!(target: "mx::endpoint", dropped = before - state.medium.len(), "Incomplete medium messages expired");
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            let owners: Vec<RequestId> = state.recvs.keys().copied().collect();
            for owner in owners {
                self.fail_recv(&mut state, owner, CompletionStatus::Abandoned);
            }
            let sends: Vec<LargeSend> = state.sends.drain().map(|(_, s)| s).collect();
            for send in sends {
                self.fail_send(send, CompletionStatus::Abandoned);
            }
            for ((peer, _), attempt) in state.connects.drain() {
                self.complete(attempt.request, CompletionKind::Connect, Some(peer), MatchInfo::default(), 0, CompletionStatus::Abandoned);
            }
            for posted in state.queues.clear() {
                self.drop_region(posted.region);
                self.complete(posted.request, CompletionKind::Recv, None, posted.match_info, 0, CompletionStatus::Abandoned);
            }
            state.medium.clear();
        }
        self.pulls.drain();
        if let Err(e) = self.regions.deregister_all() {
            warn!(target: "mx::region", error = %e, "Region teardown incomplete");
        }
        info!(target: "mx::endpoint", index = self.index, "Endpoint closed");
    }
}

/// An open endpoint on a [`Nic`].
///
/// Dropping the endpoint closes it.
pub struct Endpoint {
    shared: Arc<EndpointShared>,
    nic: Arc<Nic>,
}

impl Endpoint {
    pub(crate) fn new(shared: Arc<EndpointShared>, nic: Arc<Nic>) -> Self {
        Self { shared, nic }
    }

    pub fn index(&self) -> u8 {
        self.shared.index
    }

    pub fn generation(&self) -> u8 {
        self.shared.generation
    }

    pub fn session(&self) -> u32 {
        self.shared.session
    }

    /// Address peers use to reach this endpoint.
    pub fn addr(&self) -> PeerAddr {
        self.shared.addr()
    }

    /// The endpoint's region table.
    pub fn regions(&self) -> &RegionManager {
        &self.shared.regions
    }

    /// Pull contexts currently outstanding.
    pub fn outstanding_pulls(&self) -> usize {
        self.shared.pulls.len()
    }

    /// Register `spans` as one region.
    pub fn register_region(&self, spans: &[Span]) -> Result<RegionId> {
        self.shared.ensure_open()?;
        self.shared.regions.register(spans)
    }

    pub fn deregister_region(&self, id: RegionId) -> Result<()> {
        self.shared.regions.deregister(id)
    }

    pub fn is_connected(&self, peer: PeerAddr) -> bool {
        self.shared
            .state
            .lock()
            .map(|s| s.session_of(peer).is_some())
            .unwrap_or(false)
    }

    /// Start a connection handshake with `peer`.
    #[instrument(level = "debug", skip(self), fields(ep = self.shared.index))]
    pub fn connect(&self, peer: PeerAddr, app_key: u32) -> Result<RequestId> {
        self.shared.connect(peer, app_key)
    }

    /// Post a send of the buffer described by `spans`.
    ///
    /// Local failures (not connected, pinning, link refusal) are returned
    /// here; everything else arrives as a completion.
    #[instrument(level = "debug", skip(self, spans), fields(ep = self.shared.index))]
    pub fn isend(&self, peer: PeerAddr, spans: &[Span], match_info: MatchInfo) -> Result<RequestId> {
        self.shared.isend(peer, spans, match_info)
    }

    /// Post a receive into the buffer described by `spans`.
    #[instrument(level = "debug", skip(self, spans), fields(ep = self.shared.index))]
    pub fn irecv(&self, spans: &[Span], match_info: MatchInfo, mask: u64) -> Result<RequestId> {
        self.shared.irecv(spans, match_info, mask)
    }

    /// Expire pulls, pending sends and connects whose deadline is at or
    /// before `now`.
    pub fn poll_timeouts(&self, now: Instant) {
        self.shared.poll_timeouts(now)
    }

    /// Abandon everything in flight, release every region and free the slot.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shared.shutdown();
        self.nic.detach(self.shared.index, self.shared.generation);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("index", &self.shared.index)
            .field("generation", &self.shared.generation)
            .field("mac", &self.shared.mac)
            .finish()
    }
}
