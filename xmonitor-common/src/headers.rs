//! Probe header validation and reply addressing.
//!
//! Headers are loaded as copies, rewritten in place on the copy, and only
//! written back to the frame once the reply is committed.

use crate::buffer::{OutOfBounds, PacketBuf};

pub const ETH_HDR_LEN: usize = 14;
pub const ETH_ALEN: usize = 6;
pub const IPV4_MIN_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub const ETH_P_IP: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;

/// Header layer that failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    Link,
    Network,
    Transport,
}

/// Reasons a frame is dropped before any metric is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MalformedPacket {
    /// The frame ends before the header of this layer does.
    Truncated(Layer),
    /// IHL * 4 is below the 20-byte minimum.
    HeaderLength(usize),
    /// IPv4 protocol other than UDP.
    Protocol(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    Malformed(MalformedPacket),
    /// Well-formed traffic that is not addressed to the responder.
    NotProbe,
}

impl From<MalformedPacket> for Rejection {
    fn from(err: MalformedPacket) -> Self {
        Rejection::Malformed(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHeader(pub [u8; ETH_HDR_LEN]);

impl EthHeader {
    pub fn dst_addr(&self) -> [u8; ETH_ALEN] {
        let mut addr = [0; ETH_ALEN];
        addr.copy_from_slice(&self.0[..ETH_ALEN]);
        addr
    }

    pub fn src_addr(&self) -> [u8; ETH_ALEN] {
        let mut addr = [0; ETH_ALEN];
        addr.copy_from_slice(&self.0[ETH_ALEN..2 * ETH_ALEN]);
        addr
    }

    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes([self.0[12], self.0[13]])
    }

    pub fn swap_addrs(&mut self) {
        let (dst, rest) = self.0.split_at_mut(ETH_ALEN);
        dst.swap_with_slice(&mut rest[..ETH_ALEN]);
    }
}

/// Fixed part of the IPv4 header. Options, if any, stay in the frame untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header(pub [u8; IPV4_MIN_HDR_LEN]);

impl Ipv4Header {
    pub fn version(&self) -> u8 {
        self.0[0] >> 4
    }

    /// Declared header length in bytes (IHL * 4).
    pub fn header_len(&self) -> usize {
        (self.0[0] & 0x0f) as usize * 4
    }

    pub fn protocol(&self) -> u8 {
        self.0[9]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.0[10], self.0[11]])
    }

    pub fn src_addr(&self) -> [u8; 4] {
        [self.0[12], self.0[13], self.0[14], self.0[15]]
    }

    pub fn dst_addr(&self) -> [u8; 4] {
        [self.0[16], self.0[17], self.0[18], self.0[19]]
    }

    /// Exchanging the two address words leaves the one's complement sum,
    /// and therefore the header checksum, unchanged.
    pub fn swap_addrs(&mut self) {
        let (src, dst) = self.0[12..20].split_at_mut(4);
        src.swap_with_slice(dst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHeader(pub [u8; UDP_HDR_LEN]);

impl UdpHeader {
    pub fn source(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    pub fn dest(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }

    pub fn set_source(&mut self, port: u16) {
        self.0[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dest(&mut self, port: u16) {
        self.0[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_checksum(&mut self, check: u16) {
        self.0[6..8].copy_from_slice(&check.to_be_bytes());
    }
}

/// Validated link, network and transport headers of one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub eth: EthHeader,
    pub ip: Ipv4Header,
    pub udp: UdpHeader,
    /// Offset of the UDP header, after any IPv4 options.
    pub transport_offset: usize,
}

impl Envelope {
    /// Parse and validate the headers of a probe sent to `probe_port`.
    ///
    /// Each layer is checked before the next one is read; the first failure
    /// decides the result.
    pub fn parse<P: PacketBuf + ?Sized>(pkt: &P, probe_port: u16) -> Result<Self, Rejection> {
        let mut eth = EthHeader([0; ETH_HDR_LEN]);
        pkt.load(0, &mut eth.0)
            .map_err(|_| MalformedPacket::Truncated(Layer::Link))?;
        if eth.ether_type() != ETH_P_IP {
            return Err(Rejection::NotProbe);
        }

        let mut ip = Ipv4Header([0; IPV4_MIN_HDR_LEN]);
        pkt.load(ETH_HDR_LEN, &mut ip.0)
            .map_err(|_| MalformedPacket::Truncated(Layer::Network))?;
        let ip_len = ip.header_len();
        if ip_len < IPV4_MIN_HDR_LEN {
            return Err(MalformedPacket::HeaderLength(ip_len).into());
        }
        if ETH_HDR_LEN + ip_len > pkt.len() {
            return Err(MalformedPacket::Truncated(Layer::Network).into());
        }
        if ip.protocol() != IPPROTO_UDP {
            return Err(MalformedPacket::Protocol(ip.protocol()).into());
        }

        let transport_offset = ETH_HDR_LEN + ip_len;
        let mut udp = UdpHeader([0; UDP_HDR_LEN]);
        pkt.load(transport_offset, &mut udp.0)
            .map_err(|_| MalformedPacket::Truncated(Layer::Transport))?;
        if udp.dest() != probe_port {
            return Err(Rejection::NotProbe);
        }

        Ok(Self {
            eth,
            ip,
            udp,
            transport_offset,
        })
    }

    /// First byte after the UDP header.
    pub fn payload_offset(&self) -> usize {
        self.transport_offset + UDP_HDR_LEN
    }

    /// Turn a probe's headers into the reply's headers.
    ///
    /// Link and network addresses are exchanged. The reply leaves from the
    /// port the probe arrived on and goes to the fixed `reply_port`. The UDP
    /// checksum is zeroed rather than recomputed, which IPv4 reads as "no
    /// checksum"; receivers of probe traffic must not enforce it.
    pub fn swap_addressing(&mut self, reply_port: u16) {
        self.eth.swap_addrs();
        self.ip.swap_addrs();
        let arrived_on = self.udp.dest();
        self.udp.set_source(arrived_on);
        self.udp.set_dest(reply_port);
        self.udp.set_checksum(0);
    }

    /// Write the headers back to the frame. IPv4 options are not touched.
    pub fn write_to<P: PacketBuf + ?Sized>(&self, pkt: &mut P) -> Result<(), OutOfBounds> {
        pkt.store(0, &self.eth.0)?;
        pkt.store(ETH_HDR_LEN, &self.ip.0)?;
        pkt.store(self.transport_offset, &self.udp.0)
    }
}
