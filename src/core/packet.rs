//! # Packet Layouts
//!
//! One Ethernet II header followed by a body selected by the packet-type
//! byte. Bodies are a closed set of variants of [`Packet`], so dispatching on
//! type is checked for exhaustiveness at compile time.
//!
//! ## Wire Format
//! ```text
//! [dst MAC(6)] [src MAC(6)] [ethertype(2)=0x86DF]
//! data path: [ptype(1)] [dst_ep(1)] [src_ep(1)] [src_generation(1)] [body...]
//! message:   ... [length(2)] [lib_seqnum(2)] [piggyack(2)] [match_a(4)] [match_b(4)] [session(4)]
//! ```
//!
//! Every multi-byte field is written and read through
//! [`WireField`](crate::core::wire::WireField).

use crate::core::match_info::MatchInfo;
use crate::core::wire::{WireField, WireReader};
use crate::error::{MalformedKind, MxError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Link-layer type reserved for this protocol.
pub const ETHERTYPE_MX: u16 = 0x86DF;

/// Ethernet II header length.
pub const ETH_HEADER_LEN: usize = 14;

/// `ptype, dst_endpoint, src_endpoint, src_generation`.
pub const ROUTE_LEN: usize = 4;

/// Route plus the message header shared by tiny/small/medium/rndv.
pub const MSG_HEADER_LEN: usize = ROUTE_LEN + 18;

/// Fixed part of a medium fragment body.
pub const MEDIUM_HEADER_LEN: usize = MSG_HEADER_LEN + 8;

/// Fixed part of a pull reply body.
pub const PULL_REPLY_HEADER_LEN: usize = ROUTE_LEN + 16;

/// Fixed part of a pull request body.
pub const PULL_REQUEST_LEN: usize = ROUTE_LEN + 28;

/// Largest payload a single body can describe (16-bit length field).
pub const MAX_BODY_PAYLOAD: usize = u16::MAX as usize;

/// 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl std::str::FromStr for MacAddr {
    type Err = MxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| MxError::Config(format!("Invalid MAC address '{s}'")))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| MxError::Config(format!("Invalid MAC address '{s}'")))?;
        }
        if parts.next().is_some() {
            return Err(MxError::Config(format!("Invalid MAC address '{s}'")));
        }
        Ok(MacAddr(out))
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Endpoint-scoped region identifier: slot index plus slot reuse counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegionId {
    pub index: u8,
    pub seqnum: u8,
}

impl RegionId {
    pub const fn new(index: u8, seqnum: u8) -> Self {
        Self { index, seqnum }
    }

    fn put<B: BufMut>(self, dst: &mut B) {
        self.index.put(dst);
        self.seqnum.put(dst);
    }

    fn take(src: &mut WireReader) -> Result<Self> {
        Ok(Self {
            index: src.field()?,
            seqnum: src.field()?,
        })
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.seqnum)
    }
}

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Raw = 0,
    HostQuery = 2,
    HostReply = 3,
    EtherUnicast = 32,
    ConnectRequest = 36,
    ConnectReply = 37,
    Tiny = 38,
    Small = 39,
    MediumFrag = 40,
    Rndv = 41,
    PullRequest = 42,
    PullReply = 43,
    Notify = 44,
    NackLib = 45,
    NackMcp = 46,
}

impl TryFrom<u8> for PacketType {
    type Error = MxError;

    fn try_from(value: u8) -> Result<Self> {
        let ptype = match value {
            0 => PacketType::Raw,
            2 => PacketType::HostQuery,
            3 => PacketType::HostReply,
            32 => PacketType::EtherUnicast,
            36 => PacketType::ConnectRequest,
            37 => PacketType::ConnectReply,
            38 => PacketType::Tiny,
            39 => PacketType::Small,
            40 => PacketType::MediumFrag,
            41 => PacketType::Rndv,
            42 => PacketType::PullRequest,
            43 => PacketType::PullReply,
            44 => PacketType::Notify,
            45 => PacketType::NackLib,
            46 => PacketType::NackMcp,
            other => return Err(MxError::MalformedPacket(MalformedKind::UnknownType(other))),
        };
        Ok(ptype)
    }
}

/// Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthHeader {
    pub fn new(dst: MacAddr, src: MacAddr) -> Self {
        Self {
            dst,
            src,
            ethertype: ETHERTYPE_MX,
        }
    }
}

/// Endpoint addressing common to every data-path body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Route {
    pub dst_endpoint: u8,
    pub src_endpoint: u8,
    pub src_generation: u8,
}

/// Header shared by tiny, small, medium and rendezvous bodies.
///
/// The 16-bit `length` field is derived from the payload when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub lib_seqnum: u16,
    pub lib_piggyack: u16,
    pub match_info: MatchInfo,
    pub session: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub route: Route,
    pub src_session: u32,
    pub app_key: u32,
    pub connect_seqnum: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectStatus {
    Accepted = 0,
    BadKey = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub route: Route,
    pub src_session: u32,
    pub target_session: u32,
    pub connect_seqnum: u8,
    pub status: ConnectStatus,
}

/// Tiny and small messages: header plus the whole payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EagerMsg {
    pub route: Route,
    pub msg: MsgHeader,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumFrag {
    pub route: Route,
    pub msg: MsgHeader,
    pub msg_length: u32,
    pub frag_offset: u32,
    pub payload: Bytes,
}

/// Rendezvous announce: the payload stays in the sender's region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rndv {
    pub route: Route,
    pub msg: MsgHeader,
    pub msg_length: u32,
    pub region: RegionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub route: Route,
    pub session: u32,
    pub length: u32,
    pub puller_region: RegionId,
    pub pulled_region: RegionId,
    pub puller_offset: u32,
    pub pulled_offset: u32,
    pub src_pull_handle: u32,
    pub src_magic: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReply {
    pub route: Route,
    pub puller_region: RegionId,
    pub puller_offset: u32,
    pub dst_pull_handle: u32,
    pub dst_magic: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub route: Route,
    pub session: u32,
    pub total_length: u32,
    pub pulled_region: RegionId,
    pub lib_seqnum: u16,
    pub lib_piggyack: u16,
}

/// Why a peer refused a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    BadEndpoint,
    EndpointClosed,
    BadSession,
    BadRegion,
    BadRange,
    Other(u8),
}

impl From<u8> for NackReason {
    fn from(v: u8) -> Self {
        match v {
            1 => NackReason::BadEndpoint,
            2 => NackReason::EndpointClosed,
            3 => NackReason::BadSession,
            4 => NackReason::BadRegion,
            5 => NackReason::BadRange,
            other => NackReason::Other(other),
        }
    }
}

impl From<NackReason> for u8 {
    fn from(r: NackReason) -> u8 {
        match r {
            NackReason::BadEndpoint => 1,
            NackReason::EndpointClosed => 2,
            NackReason::BadSession => 3,
            NackReason::BadRegion => 4,
            NackReason::BadRange => 5,
            NackReason::Other(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackLib {
    pub route: Route,
    pub session: u32,
    pub lib_seqnum: u16,
    pub reason: NackReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackMcp {
    pub route: Route,
    pub reason: NackReason,
    pub dst_pull_handle: u32,
    pub dst_magic: u32,
}

/// Every body shape, keyed by packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Raw(Bytes),
    HostQuery { magic: u32 },
    HostReply { magic: u32, hostname: Bytes },
    EtherUnicast(Bytes),
    ConnectRequest(ConnectRequest),
    ConnectReply(ConnectReply),
    Tiny(EagerMsg),
    Small(EagerMsg),
    MediumFrag(MediumFrag),
    Rndv(Rndv),
    PullRequest(PullRequest),
    PullReply(PullReply),
    Notify(Notify),
    NackLib(NackLib),
    NackMcp(NackMcp),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Raw(_) => PacketType::Raw,
            Packet::HostQuery { .. } => PacketType::HostQuery,
            Packet::HostReply { .. } => PacketType::HostReply,
            Packet::EtherUnicast(_) => PacketType::EtherUnicast,
            Packet::ConnectRequest(_) => PacketType::ConnectRequest,
            Packet::ConnectReply(_) => PacketType::ConnectReply,
            Packet::Tiny(_) => PacketType::Tiny,
            Packet::Small(_) => PacketType::Small,
            Packet::MediumFrag(_) => PacketType::MediumFrag,
            Packet::Rndv(_) => PacketType::Rndv,
            Packet::PullRequest(_) => PacketType::PullRequest,
            Packet::PullReply(_) => PacketType::PullReply,
            Packet::Notify(_) => PacketType::Notify,
            Packet::NackLib(_) => PacketType::NackLib,
            Packet::NackMcp(_) => PacketType::NackMcp,
        }
    }

    /// Endpoint routing of data-path bodies.
    pub fn route(&self) -> Option<&Route> {
        match self {
            Packet::Raw(_)
            | Packet::HostQuery { .. }
            | Packet::HostReply { .. }
            | Packet::EtherUnicast(_) => None,
            Packet::ConnectRequest(p) => Some(&p.route),
            Packet::ConnectReply(p) => Some(&p.route),
            Packet::Tiny(p) | Packet::Small(p) => Some(&p.route),
            Packet::MediumFrag(p) => Some(&p.route),
            Packet::Rndv(p) => Some(&p.route),
            Packet::PullRequest(p) => Some(&p.route),
            Packet::PullReply(p) => Some(&p.route),
            Packet::Notify(p) => Some(&p.route),
            Packet::NackLib(p) => Some(&p.route),
            Packet::NackMcp(p) => Some(&p.route),
        }
    }

    /// Size of the encoded body.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Raw(p) | Packet::EtherUnicast(p) => 1 + p.len(),
            Packet::HostQuery { .. } => 8,
            Packet::HostReply { hostname, .. } => 8 + hostname.len(),
            Packet::ConnectRequest(_) | Packet::ConnectReply(_) => ROUTE_LEN + 12,
            Packet::Tiny(p) | Packet::Small(p) => MSG_HEADER_LEN + p.payload.len(),
            Packet::MediumFrag(p) => MEDIUM_HEADER_LEN + p.payload.len(),
            Packet::Rndv(_) => MSG_HEADER_LEN + 8,
            Packet::PullRequest(_) => PULL_REQUEST_LEN,
            Packet::PullReply(p) => PULL_REPLY_HEADER_LEN + p.payload.len(),
            Packet::Notify(_) => ROUTE_LEN + 16,
            Packet::NackLib(_) => ROUTE_LEN + 8,
            Packet::NackMcp(_) => ROUTE_LEN + 12,
        }
    }

    /// Append the body in wire format.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        (self.packet_type() as u8).put(dst);

        match self {
            Packet::Raw(payload) | Packet::EtherUnicast(payload) => dst.put_slice(payload),
            Packet::HostQuery { magic } => {
                0u8.put(dst);
                0u16.put(dst);
                magic.put(dst);
            }
            Packet::HostReply { magic, hostname } => {
                debug_assert!(hostname.len() <= MAX_BODY_PAYLOAD);
                0u8.put(dst);
                (hostname.len() as u16).put(dst);
                magic.put(dst);
                dst.put_slice(hostname);
            }
            Packet::ConnectRequest(p) => {
                put_route(&p.route, dst);
                p.src_session.put(dst);
                p.app_key.put(dst);
                p.connect_seqnum.put(dst);
                0u8.put(dst);
                0u16.put(dst);
            }
            Packet::ConnectReply(p) => {
                put_route(&p.route, dst);
                p.src_session.put(dst);
                p.target_session.put(dst);
                p.connect_seqnum.put(dst);
                (p.status as u8).put(dst);
                0u16.put(dst);
            }
            Packet::Tiny(p) | Packet::Small(p) => {
                put_route(&p.route, dst);
                put_msg(&p.msg, p.payload.len(), dst);
                dst.put_slice(&p.payload);
            }
            Packet::MediumFrag(p) => {
                put_route(&p.route, dst);
                put_msg(&p.msg, p.payload.len(), dst);
                p.msg_length.put(dst);
                p.frag_offset.put(dst);
                dst.put_slice(&p.payload);
            }
            Packet::Rndv(p) => {
                put_route(&p.route, dst);
                put_msg(&p.msg, 0, dst);
                p.msg_length.put(dst);
                p.region.put(dst);
                0u16.put(dst);
            }
            Packet::PullRequest(p) => {
                put_route(&p.route, dst);
                p.session.put(dst);
                p.length.put(dst);
                p.puller_region.put(dst);
                p.pulled_region.put(dst);
                p.puller_offset.put(dst);
                p.pulled_offset.put(dst);
                p.src_pull_handle.put(dst);
                p.src_magic.put(dst);
            }
            Packet::PullReply(p) => {
                debug_assert!(p.payload.len() <= MAX_BODY_PAYLOAD);
                put_route(&p.route, dst);
                (p.payload.len() as u16).put(dst);
                p.puller_region.put(dst);
                p.puller_offset.put(dst);
                p.dst_pull_handle.put(dst);
                p.dst_magic.put(dst);
                dst.put_slice(&p.payload);
            }
            Packet::Notify(p) => {
                put_route(&p.route, dst);
                p.session.put(dst);
                p.total_length.put(dst);
                p.pulled_region.put(dst);
                p.lib_seqnum.put(dst);
                p.lib_piggyack.put(dst);
                0u16.put(dst);
            }
            Packet::NackLib(p) => {
                put_route(&p.route, dst);
                p.session.put(dst);
                p.lib_seqnum.put(dst);
                u8::from(p.reason).put(dst);
                0u8.put(dst);
            }
            Packet::NackMcp(p) => {
                put_route(&p.route, dst);
                u8::from(p.reason).put(dst);
                0u8.put(dst);
                0u16.put(dst);
                p.dst_pull_handle.put(dst);
                p.dst_magic.put(dst);
            }
        }
    }

    /// Parse a body. Trailing bytes past the declared layout (Ethernet
    /// padding) are ignored.
    pub fn decode(body: Bytes) -> Result<Self> {
        let mut r = WireReader::new(body);
        let ptype = PacketType::try_from(r.field::<u8>()?)?;

        let packet = match ptype {
            PacketType::Raw => Packet::Raw(r.rest()),
            PacketType::EtherUnicast => Packet::EtherUnicast(r.rest()),
            PacketType::HostQuery => {
                r.skip(3)?;
                Packet::HostQuery { magic: r.field()? }
            }
            PacketType::HostReply => {
                r.skip(1)?;
                let len = r.field::<u16>()? as usize;
                let magic = r.field()?;
                Packet::HostReply {
                    magic,
                    hostname: r.payload(len)?,
                }
            }
            PacketType::ConnectRequest => {
                let route = take_route(&mut r)?;
                let src_session = r.field()?;
                let app_key = r.field()?;
                let connect_seqnum = r.field()?;
                r.skip(3)?;
                Packet::ConnectRequest(ConnectRequest {
                    route,
                    src_session,
                    app_key,
                    connect_seqnum,
                })
            }
            PacketType::ConnectReply => {
                let route = take_route(&mut r)?;
                let src_session = r.field()?;
                let target_session = r.field()?;
                let connect_seqnum = r.field()?;
                let status = match r.field::<u8>()? {
                    0 => ConnectStatus::Accepted,
                    _ => ConnectStatus::BadKey,
                };
                r.skip(2)?;
                Packet::ConnectReply(ConnectReply {
                    route,
                    src_session,
                    target_session,
                    connect_seqnum,
                    status,
                })
            }
            PacketType::Tiny | PacketType::Small => {
                let route = take_route(&mut r)?;
                let (msg, len) = take_msg(&mut r)?;
                let eager = EagerMsg {
                    route,
                    msg,
                    payload: r.payload(len)?,
                };
                if ptype == PacketType::Tiny {
                    Packet::Tiny(eager)
                } else {
                    Packet::Small(eager)
                }
            }
            PacketType::MediumFrag => {
                let route = take_route(&mut r)?;
                let (msg, len) = take_msg(&mut r)?;
                let msg_length = r.field::<u32>()?;
                let frag_offset = r.field::<u32>()?;
                let payload = r.payload(len)?;
                if frag_offset as u64 + len as u64 > msg_length as u64 {
                    return Err(MxError::MalformedPacket(MalformedKind::LengthMismatch));
                }
                Packet::MediumFrag(MediumFrag {
                    route,
                    msg,
                    msg_length,
                    frag_offset,
                    payload,
                })
            }
            PacketType::Rndv => {
                let route = take_route(&mut r)?;
                let (msg, _) = take_msg(&mut r)?;
                let msg_length = r.field()?;
                let region = RegionId::take(&mut r)?;
                r.skip(2)?;
                Packet::Rndv(Rndv {
                    route,
                    msg,
                    msg_length,
                    region,
                })
            }
            PacketType::PullRequest => Packet::PullRequest(PullRequest {
                route: take_route(&mut r)?,
                session: r.field()?,
                length: r.field()?,
                puller_region: RegionId::take(&mut r)?,
                pulled_region: RegionId::take(&mut r)?,
                puller_offset: r.field()?,
                pulled_offset: r.field()?,
                src_pull_handle: r.field()?,
                src_magic: r.field()?,
            }),
            PacketType::PullReply => {
                let route = take_route(&mut r)?;
                let len = r.field::<u16>()? as usize;
                let puller_region = RegionId::take(&mut r)?;
                let puller_offset = r.field()?;
                let dst_pull_handle = r.field()?;
                let dst_magic = r.field()?;
                Packet::PullReply(PullReply {
                    route,
                    puller_region,
                    puller_offset,
                    dst_pull_handle,
                    dst_magic,
                    payload: r.payload(len)?,
                })
            }
            PacketType::Notify => {
                let notify = Notify {
                    route: take_route(&mut r)?,
                    session: r.field()?,
                    total_length: r.field()?,
                    pulled_region: RegionId::take(&mut r)?,
                    lib_seqnum: r.field()?,
                    lib_piggyack: r.field()?,
                };
                r.skip(2)?;
                Packet::Notify(notify)
            }
            PacketType::NackLib => {
                let nack = NackLib {
                    route: take_route(&mut r)?,
                    session: r.field()?,
                    lib_seqnum: r.field()?,
                    reason: NackReason::from(r.field::<u8>()?),
                };
                r.skip(1)?;
                Packet::NackLib(nack)
            }
            PacketType::NackMcp => {
                let route = take_route(&mut r)?;
                let reason = NackReason::from(r.field::<u8>()?);
                r.skip(3)?;
                Packet::NackMcp(NackMcp {
                    route,
                    reason,
                    dst_pull_handle: r.field()?,
                    dst_magic: r.field()?,
                })
            }
        };

        Ok(packet)
    }
}

/// Route bytes following the type byte (which the caller already consumed).
fn take_route(r: &mut WireReader) -> Result<Route> {
    Ok(Route {
        dst_endpoint: r.field()?,
        src_endpoint: r.field()?,
        src_generation: r.field()?,
    })
}

fn put_route(route: &Route, dst: &mut BytesMut) {
    route.dst_endpoint.put(dst);
    route.src_endpoint.put(dst);
    route.src_generation.put(dst);
}

fn put_msg(msg: &MsgHeader, payload_len: usize, dst: &mut BytesMut) {
    debug_assert!(payload_len <= MAX_BODY_PAYLOAD);
    (payload_len as u16).put(dst);
    msg.lib_seqnum.put(dst);
    msg.lib_piggyack.put(dst);
    msg.match_info.encode(dst);
    msg.session.put(dst);
}

fn take_msg(r: &mut WireReader) -> Result<(MsgHeader, usize)> {
    let length = r.field::<u16>()? as usize;
    let lib_seqnum = r.field()?;
    let lib_piggyack = r.field()?;
    let match_info = MatchInfo::decode(r)?;
    let session = r.field()?;
    Ok((
        MsgHeader {
            lib_seqnum,
            lib_piggyack,
            match_info,
            session,
        },
        length,
    ))
}

/// A complete link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub eth: EthHeader,
    pub packet: Packet,
}

impl Frame {
    pub fn new(dst: MacAddr, src: MacAddr, packet: Packet) -> Self {
        Self {
            eth: EthHeader::new(dst, src),
            packet,
        }
    }

    pub fn encoded_len(&self) -> usize {
        ETH_HEADER_LEN + self.packet.encoded_len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_slice(&self.eth.dst.0);
        dst.put_slice(&self.eth.src.0);
        self.eth.ethertype.put(dst);
        self.packet.encode(dst);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse a received frame; the body's payload shares the frame's buffer.
    pub fn from_bytes(frame: Bytes) -> Result<Self> {
        if frame.len() < ETH_HEADER_LEN + 1 {
            return Err(MxError::MalformedPacket(MalformedKind::Truncated));
        }
        let mut r = WireReader::new(frame);
        let head = r.payload(12)?;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&head[..6]);
        src.copy_from_slice(&head[6..12]);
        let ethertype = r.field::<u16>()?;
        if ethertype != ETHERTYPE_MX {
            return Err(MxError::MalformedPacket(MalformedKind::ForeignEtherType(
                ethertype,
            )));
        }

        Ok(Self {
            eth: EthHeader {
                dst: MacAddr(dst),
                src: MacAddr(src),
                ethertype,
            },
            packet: Packet::decode(r.rest())?,
        })
    }
}
