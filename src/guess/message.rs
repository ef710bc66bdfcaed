use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng as _;

use super::error::GuessError;
use crate::constants::{GTA_HEADER_SIZE, MUID_LEN, PACKED_IPV4_LEN, PACKED_IPV6_LEN};

/// GGEP extension overhead: flags byte, 2-byte id, 1-byte length.
const GGEP_EXT_OVERHEAD: usize = 4;
/// GGEP magic byte opening an extension block.
const GGEP_MAGIC_LEN: usize = 1;
/// Pong body: port(2) + ip(4) + files(4) + kbytes(4).
const PONG_BODY_LEN: usize = 14;
/// Query body prefix: speed/flags(2), terminated by the search text NUL.
const QUERY_PREFIX_LEN: usize = 2;

/// Message unique identifier correlating requests and replies.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Muid(pub [u8; MUID_LEN]);

impl Muid {
    pub fn generate() -> Self {
        let mut id = [0u8; MUID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GuessError> {
        if bytes.len() != MUID_LEN {
            return Err(GuessError::InvalidMuid);
        }
        let mut id = [0u8; MUID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; MUID_LEN] {
        &self.0
    }
}

impl fmt::Debug for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Muid({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A GUESS ping, used to request a query key and/or more hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuessPing {
    pub muid: Muid,
    /// Asks the host to return a query key for us.
    pub request_query_key: bool,
    /// Introduces us as a GUESS host listening on this port.
    pub introduction: Option<u16>,
    /// Asks the host for a packed list of other GUESS hosts.
    pub more_hosts: bool,
}

impl GuessPing {
    pub fn query_key_request(muid: Muid, introduction: Option<u16>) -> Self {
        Self {
            muid,
            request_query_key: true,
            introduction,
            more_hosts: false,
        }
    }

    pub fn more_hosts(muid: Muid) -> Self {
        Self {
            muid,
            request_query_key: false,
            introduction: None,
            more_hosts: true,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let mut ggep = 0;
        if self.request_query_key {
            ggep += GGEP_EXT_OVERHEAD;
        }
        if self.introduction.is_some() {
            ggep += GGEP_EXT_OVERHEAD + 2;
        }
        if self.more_hosts {
            ggep += GGEP_EXT_OVERHEAD;
        }
        if ggep > 0 {
            ggep += GGEP_MAGIC_LEN;
        }
        GTA_HEADER_SIZE + ggep
    }
}

/// A GUESS query carrying the query key of its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuessQuery {
    pub muid: Muid,
    pub text: Arc<str>,
    pub media_type: u32,
    pub query_key: Bytes,
    /// Address where out-of-band hits should be delivered, if any.
    pub reply_to: Option<SocketAddr>,
    pub oob: bool,
}

impl GuessQuery {
    pub fn encoded_len(&self) -> usize {
        let mut ggep = GGEP_MAGIC_LEN + GGEP_EXT_OVERHEAD + self.query_key.len();
        if self.media_type != 0 {
            ggep += GGEP_EXT_OVERHEAD + 4;
        }
        if let Some(addr) = self.reply_to {
            ggep += GGEP_EXT_OVERHEAD
                + match addr {
                    SocketAddr::V4(_) => PACKED_IPV4_LEN,
                    SocketAddr::V6(_) => PACKED_IPV6_LEN,
                };
        }
        GTA_HEADER_SIZE + QUERY_PREFIX_LEN + self.text.len() + 1 + ggep
    }
}

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Ping(GuessPing),
    Query(GuessQuery),
}

impl Outbound {
    pub fn muid(&self) -> Muid {
        match self {
            Outbound::Ping(p) => p.muid,
            Outbound::Query(q) => q.muid,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Outbound::Ping(p) => p.encoded_len(),
            Outbound::Query(q) => q.encoded_len(),
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Outbound::Query(_))
    }
}

/// An inbound pong, as decoded by the protocol layer.
///
/// GUESS replies to both query key requests and queries with a pong bearing
/// the MUID of the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub muid: Muid,
    /// Address the datagram came from.
    pub from: SocketAddr,
    /// Address advertised in the pong body.
    pub addr: Option<SocketAddr>,
    /// IPv6 address extension.
    pub ipv6: Option<Ipv6Addr>,
    pub query_key: Option<Bytes>,
    /// Packed IPv4 host list extension.
    pub packed_hosts: Option<Bytes>,
    /// Packed IPv6 host list extension.
    pub packed_hosts6: Option<Bytes>,
}

impl Pong {
    pub fn new(muid: Muid, from: SocketAddr) -> Self {
        Self {
            muid,
            from,
            addr: None,
            ipv6: None,
            query_key: None,
            packed_hosts: None,
            packed_hosts6: None,
        }
    }

    pub fn with_query_key(mut self, key: impl Into<Bytes>) -> Self {
        self.query_key = Some(key.into());
        self
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_ipv6(mut self, ip: Ipv6Addr) -> Self {
        self.ipv6 = Some(ip);
        self
    }

    pub fn with_packed_hosts(mut self, data: impl Into<Bytes>) -> Self {
        self.packed_hosts = Some(data.into());
        self
    }

    pub fn with_packed_hosts6(mut self, data: impl Into<Bytes>) -> Self {
        self.packed_hosts6 = Some(data.into());
        self
    }

    /// The host this pong advertises, preferring the IPv6 extension when the
    /// body carries no usable IPv4 address.
    pub fn advertised(&self) -> Option<SocketAddr> {
        let addr = self.addr?;
        match (addr.ip(), self.ipv6) {
            (IpAddr::V4(v4), Some(v6)) if v4.is_unspecified() => {
                Some(SocketAddr::new(IpAddr::V6(v6), addr.port()))
            }
            _ => Some(addr),
        }
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = GTA_HEADER_SIZE + PONG_BODY_LEN;
        let mut ggep = 0;
        if let Some(key) = &self.query_key {
            ggep += GGEP_EXT_OVERHEAD + key.len();
        }
        if self.ipv6.is_some() {
            ggep += GGEP_EXT_OVERHEAD + 16;
        }
        if let Some(ipp) = &self.packed_hosts {
            ggep += GGEP_EXT_OVERHEAD + ipp.len();
        }
        if let Some(ipp) = &self.packed_hosts6 {
            ggep += GGEP_EXT_OVERHEAD + ipp.len();
        }
        if ggep > 0 {
            len += GGEP_MAGIC_LEN + ggep;
        }
        len
    }
}

/// Decodes a packed IPv4 host list: 4-byte address, 2-byte little-endian port.
pub fn decode_packed_hosts(data: &[u8]) -> Result<Vec<SocketAddr>, GuessError> {
    if data.len() % PACKED_IPV4_LEN != 0 {
        return Err(GuessError::MalformedExtension {
            extension: "IPP",
            reason: format!("length {} is not a multiple of {}", data.len(), PACKED_IPV4_LEN),
        });
    }

    let mut buf = data;
    let mut hosts = Vec::with_capacity(data.len() / PACKED_IPV4_LEN);
    while buf.has_remaining() {
        let ip = Ipv4Addr::from(buf.get_u32());
        let port = buf.get_u16_le();
        hosts.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    Ok(hosts)
}

/// Decodes a packed IPv6 host list: 16-byte address, 2-byte little-endian port.
pub fn decode_packed_hosts6(data: &[u8]) -> Result<Vec<SocketAddr>, GuessError> {
    if data.len() % PACKED_IPV6_LEN != 0 {
        return Err(GuessError::MalformedExtension {
            extension: "IPP6",
            reason: format!("length {} is not a multiple of {}", data.len(), PACKED_IPV6_LEN),
        });
    }

    let mut buf = data;
    let mut hosts = Vec::with_capacity(data.len() / PACKED_IPV6_LEN);
    while buf.has_remaining() {
        let ip = Ipv6Addr::from(buf.get_u128());
        let port = buf.get_u16_le();
        hosts.push(SocketAddr::new(IpAddr::V6(ip), port));
    }
    Ok(hosts)
}

/// Packs hosts into IPv4 and IPv6 host lists.
pub fn encode_packed_hosts(hosts: &[SocketAddr]) -> (Bytes, Bytes) {
    let mut v4 = BytesMut::new();
    let mut v6 = BytesMut::new();
    for host in hosts {
        match host.ip() {
            IpAddr::V4(ip) => {
                v4.put_slice(&ip.octets());
                v4.put_u16_le(host.port());
            }
            IpAddr::V6(ip) => {
                v6.put_slice(&ip.octets());
                v6.put_u16_le(host.port());
            }
        }
    }
    (v4.freeze(), v6.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_muid_from_bytes() {
        let muid = Muid::from_bytes(&[7u8; 16]).unwrap();
        assert_eq!(muid.as_bytes(), &[7u8; 16]);
        assert!(Muid::from_bytes(&[7u8; 15]).is_err());
        assert_ne!(Muid::generate(), Muid::generate());
    }

    #[test]
    fn test_muid_display() {
        let muid = Muid([0xab; 16]);
        assert_eq!(muid.to_string(), "ab".repeat(16));
    }

    #[test]
    fn test_packed_hosts() {
        let data = [192, 168, 1, 1, 0x1a, 0x0b, 10, 0, 0, 1, 0xd2, 0x04];
        let hosts = decode_packed_hosts(&data).unwrap();
        assert_eq!(
            hosts,
            vec![
                "192.168.1.1:2842".parse::<SocketAddr>().unwrap(),
                "10.0.0.1:1234".parse::<SocketAddr>().unwrap(),
            ]
        );

        let (v4, v6) = encode_packed_hosts(&hosts);
        assert_eq!(&v4[..], &data[..]);
        assert!(v6.is_empty());
    }

    #[test]
    fn test_packed_hosts_bad_length() {
        assert!(matches!(
            decode_packed_hosts(&[0u8; 13]),
            Err(GuessError::MalformedExtension { extension: "IPP", .. })
        ));
        assert!(matches!(
            decode_packed_hosts6(&[0u8; 12]),
            Err(GuessError::MalformedExtension { extension: "IPP6", .. })
        ));
        assert!(decode_packed_hosts(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_packed_hosts6() {
        let host: SocketAddr = "[2001:db8::1]:6346".parse().unwrap();
        let (_, v6) = encode_packed_hosts(&[host]);
        assert_eq!(v6.len(), PACKED_IPV6_LEN);
        assert_eq!(decode_packed_hosts6(&v6).unwrap(), vec![host]);
    }

    #[test]
    fn test_pong_advertised_prefers_ipv6_when_unspecified() {
        let from: SocketAddr = "1.2.3.4:6346".parse().unwrap();
        let v6: Ipv6Addr = "2001:db8::2".parse().unwrap();

        let pong = Pong::new(Muid([0; 16]), from).with_addr("0.0.0.0:7000".parse().unwrap());
        assert_eq!(pong.advertised(), Some("0.0.0.0:7000".parse().unwrap()));

        let pong = pong.with_ipv6(v6);
        assert_eq!(pong.advertised(), Some(SocketAddr::new(IpAddr::V6(v6), 7000)));

        let pong = Pong::new(Muid([0; 16]), from).with_ipv6(v6);
        assert_eq!(pong.advertised(), None);
    }

    #[test]
    fn test_message_lengths() {
        let muid = Muid([1; 16]);
        let plain = GuessPing::query_key_request(muid, None);
        let intro = GuessPing::query_key_request(muid, Some(6346));
        assert!(intro.encoded_len() > plain.encoded_len());

        let query = GuessQuery {
            muid,
            text: Arc::from("free music"),
            media_type: 0,
            query_key: Bytes::from_static(b"12345678"),
            reply_to: None,
            oob: false,
        };
        assert_eq!(
            Outbound::Query(query.clone()).encoded_len(),
            GTA_HEADER_SIZE + 2 + 10 + 1 + 1 + 4 + 8
        );
        assert!(Outbound::Query(query).is_query());
    }
}
