//! Frame codec for the mesh wire protocol.
//!
//! Every connection starts with a one-shot connect record (preceded by a single `0x00` tag
//!  byte, which is how the accept path tells mesh traffic apart from application sockets).
//!  Every frame after that starts with a fixed 52-byte envelope whose `type` field selects the
//!  payload layout. All integers are big-endian.
//!
//! Hostname fields are 16 bytes on the wire for historical reasons. Names of up to 15 bytes are
//!  carried inline, NUL-padded. Longer names use the escape form: the field holds `'.'` followed
//!  by the ASCII decimal byte length, and the name itself follows the fixed record. This layout
//!  must be preserved bit-for-bit so mixed-version meshes keep talking to each other.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::util::convert::PrecheckedCast;

pub const HOSTNAME_LEN: usize = 16;
/// longest hostname the escape form will carry
pub const MAX_LONG_HOSTNAME: usize = 256;
/// connect record length, excluding the tag byte and any long-name tails
pub const CONNECT_RECORD_LEN: usize = HOSTNAME_LEN + 4 + 4 + HOSTNAME_LEN + 4 + 4;
/// envelope length, excluding long-name tails
pub const WIRE_HEADER_LEN: usize = 2 * (HOSTNAME_LEN + 4 + 4) + 4;

pub const CONNECT_FLAG_TLS: u32 = 0x8000_0000;

pub const MAX_ACK_PAYLOAD: usize = 1024;
pub const MAX_DECOM_HOSTLEN: usize = 256;
/// sanity cap on a user message body; the protocol itself has no limit
pub const MAX_USER_MSG_LEN: usize = 1 << 30;
/// sanity cap on a hello payload
pub const MAX_HELLO_PAYLOAD: usize = 1 << 20;

/// Frame type discriminant in the envelope. The numeric values are part of the wire protocol
///  and must never be reassigned.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum WireType {
    Heartbeat = 1,
    Hello = 2,
    /// decommission by node number; the number is meaningless nowadays, but the frame is still
    ///  consumed for compatibility with peers that send it
    Decom = 3,
    UserMsg = 4,
    Ack = 5,
    HelloReply = 6,
    DecomName = 7,
    AckPayload = 8,
}


fn put_host_field(buf: &mut impl BufMut, name: &str) {
    let mut field = [0u8; HOSTNAME_LEN];
    if name.len() < HOSTNAME_LEN {
        field[..name.len()].copy_from_slice(name.as_bytes());
    } else {
        let escape = format!(".{}", name.len());
        field[..escape.len()].copy_from_slice(escape.as_bytes());
    }
    buf.put_slice(&field);
}

fn put_long_name_tail(buf: &mut impl BufMut, name: &str) {
    if name.len() >= HOSTNAME_LEN {
        buf.put_slice(name.as_bytes());
    }
}

/// A parsed 16-byte hostname field: either the complete name, or the length of the real name
///  that follows the fixed record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HostField {
    Inline(String),
    Long(usize),
}

pub fn parse_host_field(raw: &[u8]) -> anyhow::Result<HostField> {
    assert_eq!(raw.len(), HOSTNAME_LEN);

    if raw[0] == b'.' {
        let digits = &raw[1..];
        let end = digits.iter().position(|&b| b == 0).unwrap_or(digits.len());
        let len: usize = std::str::from_utf8(&digits[..end])
            .map_err(|_| anyhow!("malformed hostname length escape"))?
            .parse()
            .map_err(|_| anyhow!("malformed hostname length escape"))?;
        if len < 1 || len > MAX_LONG_HOSTNAME {
            bail!("escaped hostname length {} out of range", len);
        }
        return Ok(HostField::Long(len));
    }

    let end = raw.iter().position(|&b| b == 0).unwrap_or(HOSTNAME_LEN - 1);
    let name = std::str::from_utf8(&raw[..end])
        .map_err(|_| anyhow!("hostname field is not valid utf-8"))?;
    Ok(HostField::Inline(name.to_string()))
}

async fn resolve_host_field<R: AsyncRead + Unpin>(field: HostField, r: &mut R) -> anyhow::Result<String> {
    match field {
        HostField::Inline(name) => Ok(name),
        HostField::Long(len) => {
            let mut tail = vec![0u8; len];
            r.read_exact(&mut tail).await?;
            String::from_utf8(tail).map_err(|_| anyhow!("hostname tail is not valid utf-8"))
        }
    }
}

/// full envelope footprint for a from/to pair, including long-name tails
pub fn envelope_wire_len(from: &str, to: &str) -> usize {
    let mut len = WIRE_HEADER_LEN;
    if from.len() >= HOSTNAME_LEN {
        len += from.len();
    }
    if to.len() >= HOSTNAME_LEN {
        len += to.len();
    }
    len
}

fn port_with_net_index(port: u16, net_index: u8) -> i32 {
    (port as i32) | ((net_index as i32 & 0xf) << 16)
}

fn split_port_field(raw: i32) -> (u16, u8) {
    ((raw & 0xffff) as u16, ((raw >> 16) & 0xf) as u8)
}


/// The one-shot handshake record each side sends right after TCP establishment. It names both
///  endpoints so the acceptor can verify the dialer reached the node it meant to reach.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectMsg {
    pub to_host: String,
    pub to_port: u16,
    pub to_net_index: u8,
    /// the dialer requires TLS on this connection
    pub tls: bool,
    pub from_host: String,
    pub from_port: u16,
    pub from_net_index: u8,
}

impl ConnectMsg {
    /// encodes the frame including the leading `0x00` tag byte
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(0);
        put_host_field(buf, &self.to_host);
        buf.put_i32(port_with_net_index(self.to_port, self.to_net_index));
        buf.put_u32(if self.tls { CONNECT_FLAG_TLS } else { 0 });
        put_host_field(buf, &self.from_host);
        buf.put_i32(port_with_net_index(self.from_port, self.from_net_index));
        buf.put_i32(0); // node number, retained for wire compatibility
        put_long_name_tail(buf, &self.from_host);
        put_long_name_tail(buf, &self.to_host);
    }

    /// reads the record from the stream; the tag byte must already have been consumed
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<ConnectMsg> {
        let mut record = [0u8; CONNECT_RECORD_LEN];
        r.read_exact(&mut record).await?;
        let mut buf = &record[..];

        let to_field = parse_host_field(&buf[..HOSTNAME_LEN])?;
        buf.advance(HOSTNAME_LEN);
        let to_port_raw = buf.try_get_i32()?;
        let flags = buf.try_get_u32()?;
        let from_field = parse_host_field(&buf[..HOSTNAME_LEN])?;
        buf.advance(HOSTNAME_LEN);
        let from_port_raw = buf.try_get_i32()?;
        let _node = buf.try_get_i32()?;

        // long-name tails follow in from, to order
        let from_host = resolve_host_field(from_field, r).await?;
        let to_host = resolve_host_field(to_field, r).await?;

        let (to_port, to_net_index) = split_port_field(to_port_raw);
        let (from_port, from_net_index) = split_port_field(from_port_raw);

        Ok(ConnectMsg {
            to_host,
            to_port,
            to_net_index,
            tls: flags & CONNECT_FLAG_TLS != 0,
            from_host,
            from_port,
            from_net_index,
        })
    }
}


/// The fixed header prepended to every frame after the connect exchange.
///
/// The `from` fields of queued frames are rewritten by the writer immediately before transmit,
///  so the encode side always takes the current local identity as arguments rather than storing
///  a possibly stale copy.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    pub from_host: String,
    pub from_port: u16,
    pub to_host: String,
    pub to_port: u16,
    pub wire_type: i32,
}

impl Envelope {
    pub fn encode(from_host: &str, from_port: u16, to_host: &str, to_port: u16, wire_type: WireType, buf: &mut impl BufMut) {
        put_host_field(buf, from_host);
        buf.put_i32(from_port as i32);
        buf.put_i32(0); // from node number
        put_host_field(buf, to_host);
        buf.put_i32(to_port as i32);
        buf.put_i32(0); // to node number
        buf.put_i32(wire_type.into());
        put_long_name_tail(buf, from_host);
        put_long_name_tail(buf, to_host);
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Envelope> {
        let mut header = [0u8; WIRE_HEADER_LEN];
        r.read_exact(&mut header).await?;
        let mut buf = &header[..];

        let from_field = parse_host_field(&buf[..HOSTNAME_LEN])?;
        buf.advance(HOSTNAME_LEN);
        let from_port = buf.try_get_i32()?;
        let _from_node = buf.try_get_i32()?;
        let to_field = parse_host_field(&buf[..HOSTNAME_LEN])?;
        buf.advance(HOSTNAME_LEN);
        let to_port = buf.try_get_i32()?;
        let _to_node = buf.try_get_i32()?;
        let wire_type = buf.try_get_i32()?;

        if !(0..=u16::MAX as i32).contains(&from_port) || !(0..=u16::MAX as i32).contains(&to_port) {
            bail!("envelope port out of range: from={} to={}", from_port, to_port);
        }

        let from_host = resolve_host_field(from_field, r).await?;
        let to_host = resolve_host_field(to_field, r).await?;

        Ok(Envelope {
            from_host,
            from_port: from_port as u16,
            to_host,
            to_port: to_port as u16,
            wire_type,
        })
    }
}


/// One entry in a hello / hello-reply peer list. Node numbers are always transmitted as zero.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HelloHost {
    pub name: String,
    pub port: u16,
}

/// The gossip payload: the sender's complete known peer list.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct HelloPayload {
    pub hosts: Vec<HelloHost>,
}

impl HelloPayload {
    pub fn encode(&self, buf: &mut impl BufMut) {
        let n = self.hosts.len();
        let long_tail_len: usize = self.hosts.iter()
            .filter(|h| h.name.len() >= HOSTNAME_LEN)
            .map(|h| h.name.len())
            .sum();
        let datasz = 4 + 4 + n * HOSTNAME_LEN + n * 4 + n * 4 + long_tail_len;

        buf.put_i32(datasz.prechecked_cast());
        buf.put_i32(n.prechecked_cast());
        for h in &self.hosts {
            put_host_field(buf, &h.name);
        }
        for h in &self.hosts {
            buf.put_i32(h.port as i32);
        }
        for _ in &self.hosts {
            buf.put_i32(0);
        }
        for h in &self.hosts {
            put_long_name_tail(buf, &h.name);
        }
    }

    /// Reads and parses one hello payload, consuming exactly `datasz` bytes from the stream.
    ///  Older senders pad the payload; whatever follows the parsed fields is discarded.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<HelloPayload> {
        let mut datasz_buf = [0u8; 4];
        r.read_exact(&mut datasz_buf).await?;
        let datasz = i32::from_be_bytes(datasz_buf);
        if datasz < 8 || datasz as usize > MAX_HELLO_PAYLOAD {
            bail!("hello payload size {} out of range", datasz);
        }

        let mut body = vec![0u8; datasz as usize - 4];
        r.read_exact(&mut body).await?;
        Self::parse_body(&body)
    }

    fn parse_body(body: &[u8]) -> anyhow::Result<HelloPayload> {
        let mut buf = body;
        let n = buf.try_get_i32()?;
        if n < 0 || n as usize > MAX_HELLO_PAYLOAD / HOSTNAME_LEN {
            bail!("hello host count {} out of range", n);
        }
        let n = n as usize;

        let mut fields = Vec::with_capacity(n);
        for _ in 0..n {
            if buf.remaining() < HOSTNAME_LEN {
                bail!("hello payload truncated in host list");
            }
            fields.push(parse_host_field(&buf[..HOSTNAME_LEN])?);
            buf.advance(HOSTNAME_LEN);
        }

        let mut ports = Vec::with_capacity(n);
        for _ in 0..n {
            let port = buf.try_get_i32()?;
            if !(0..=u16::MAX as i32).contains(&port) {
                bail!("hello port {} out of range", port);
            }
            ports.push(port as u16);
        }
        for _ in 0..n {
            let _node = buf.try_get_i32()?;
        }

        let mut hosts = Vec::with_capacity(n);
        for (field, port) in fields.into_iter().zip(ports) {
            let name = match field {
                HostField::Inline(name) => name,
                HostField::Long(len) => {
                    if buf.remaining() < len {
                        bail!("hello payload truncated in long-name tails");
                    }
                    let name = std::str::from_utf8(&buf[..len])
                        .map_err(|_| anyhow!("hello hostname is not valid utf-8"))?
                        .to_string();
                    buf.advance(len);
                    name
                }
            };
            hosts.push(HelloHost { name, port });
        }

        Ok(HelloPayload { hosts })
    }
}


/// Header of a user message frame; `datalen` opaque bytes follow.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct UserMsgHeader {
    pub usertype: i32,
    pub seqnum: i32,
    pub waitforack: bool,
    pub datalen: usize,
}

impl UserMsgHeader {
    pub const LEN: usize = 16;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.usertype);
        buf.put_i32(self.seqnum);
        buf.put_i32(if self.waitforack { 1 } else { 0 });
        buf.put_i32(self.datalen.prechecked_cast());
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<UserMsgHeader> {
        let mut header = [0u8; Self::LEN];
        r.read_exact(&mut header).await?;
        let mut buf = &header[..];

        let usertype = buf.try_get_i32()?;
        let seqnum = buf.try_get_i32()?;
        let waitforack = buf.try_get_i32()? != 0;
        let datalen = buf.try_get_i32()?;
        if datalen < 0 || datalen as usize > MAX_USER_MSG_LEN {
            bail!("user message length {} out of range", datalen);
        }

        Ok(UserMsgHeader {
            usertype,
            seqnum,
            waitforack,
            datalen: datalen as usize,
        })
    }
}


/// Ack frame: the remote handler's return code for one outstanding seqnum.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckMsg {
    pub seqnum: i32,
    pub outrc: i32,
}

impl AckMsg {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.seqnum);
        buf.put_i32(self.outrc);
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<AckMsg> {
        let mut raw = [0u8; 8];
        r.read_exact(&mut raw).await?;
        let mut buf = &raw[..];
        Ok(AckMsg {
            seqnum: buf.try_get_i32()?,
            outrc: buf.try_get_i32()?,
        })
    }
}

/// Ack frame variant carrying a small payload alongside the return code.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckPayloadMsg {
    pub seqnum: i32,
    pub outrc: i32,
    pub payload: Vec<u8>,
}

impl AckPayloadMsg {
    pub fn encode(&self, buf: &mut impl BufMut) {
        assert!(!self.payload.is_empty() && self.payload.len() <= MAX_ACK_PAYLOAD);
        buf.put_i32(self.seqnum);
        buf.put_i32(self.outrc);
        buf.put_i32(self.payload.len().prechecked_cast());
        buf.put_slice(&self.payload);
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<AckPayloadMsg> {
        let mut raw = [0u8; 12];
        r.read_exact(&mut raw).await?;
        let mut buf = &raw[..];
        let seqnum = buf.try_get_i32()?;
        let outrc = buf.try_get_i32()?;
        let paylen = buf.try_get_i32()?;
        if paylen <= 0 || paylen as usize > MAX_ACK_PAYLOAD {
            bail!("ack payload length {} out of range", paylen);
        }

        let mut payload = vec![0u8; paylen as usize];
        r.read_exact(&mut payload).await?;
        Ok(AckPayloadMsg { seqnum, outrc, payload })
    }
}


/// Decommission-by-name payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DecomNameMsg {
    pub host: String,
}

impl DecomNameMsg {
    pub fn encode(&self, buf: &mut impl BufMut) {
        assert!(!self.host.is_empty() && self.host.len() <= MAX_DECOM_HOSTLEN);
        buf.put_i32(self.host.len().prechecked_cast());
        buf.put_slice(self.host.as_bytes());
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<DecomNameMsg> {
        let mut raw = [0u8; 4];
        r.read_exact(&mut raw).await?;
        let hostlen = i32::from_be_bytes(raw);
        if hostlen <= 0 || hostlen as usize > MAX_DECOM_HOSTLEN {
            bail!("decom hostname length {} out of range", hostlen);
        }

        let mut name = vec![0u8; hostlen as usize];
        r.read_exact(&mut name).await?;
        let host = String::from_utf8(name).map_err(|_| anyhow!("decom hostname is not valid utf-8"))?;
        Ok(DecomNameMsg { host })
    }
}


#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::short("node1", b"node1\0\0\0\0\0\0\0\0\0\0\0")]
    #[case::fifteen("abcdefghijklmno", b"abcdefghijklmno\0")]
    #[case::long("db-node-17.some.very.long.domain", b".32\0\0\0\0\0\0\0\0\0\0\0\0\0")]
    fn test_put_host_field(#[case] name: &str, #[case] expected: &[u8; 16]) {
        let mut buf = BytesMut::new();
        put_host_field(&mut buf, name);
        assert_eq!(&buf[..], expected);
    }

    #[rstest]
    #[case::inline(b"node1\0\0\0\0\0\0\0\0\0\0\0", Some(HostField::Inline("node1".to_string())))]
    #[case::long(b".32\0\0\0\0\0\0\0\0\0\0\0\0\0", Some(HostField::Long(32)))]
    #[case::bad_escape(b".x2\0\0\0\0\0\0\0\0\0\0\0\0\0", None)]
    #[case::zero_len(b".0\0\0\0\0\0\0\0\0\0\0\0\0\0\0", None)]
    #[case::too_long(b".257\0\0\0\0\0\0\0\0\0\0\0\0", None)]
    fn test_parse_host_field(#[case] raw: &[u8; 16], #[case] expected: Option<HostField>) {
        match parse_host_field(raw) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(_) => assert!(expected.is_none()),
        }
    }

    #[rstest]
    #[case::plain("alpha", "beta", false, 0)]
    #[case::tls("alpha", "beta", true, 0)]
    #[case::child_net("alpha", "beta", false, 3)]
    #[case::long_names("db-node-17.some.very.long.domain", "db-node-18.some.very.long.domain", false, 0)]
    #[tokio::test]
    async fn test_connect_msg_roundtrip(#[case] from: &str, #[case] to: &str, #[case] tls: bool, #[case] net_index: u8) {
        let msg = ConnectMsg {
            to_host: to.to_string(),
            to_port: 19000,
            to_net_index: net_index,
            tls,
            from_host: from.to_string(),
            from_port: 19001,
            from_net_index: net_index,
        };

        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(buf[0], 0);

        let mut r = &buf[1..];
        let actual = ConnectMsg::read(&mut r).await.unwrap();
        assert_eq!(actual, msg);
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn test_connect_record_len() {
        let msg = ConnectMsg {
            to_host: "a".to_string(),
            to_port: 1,
            to_net_index: 0,
            tls: false,
            from_host: "b".to_string(),
            from_port: 2,
            from_net_index: 0,
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), 1 + CONNECT_RECORD_LEN);
    }

    #[rstest]
    #[case::short_names("alpha", "beta", WireType::Heartbeat)]
    #[case::long_from("db-node-17.some.very.long.domain", "beta", WireType::UserMsg)]
    #[case::long_both("db-node-17.some.very.long.domain", "db-node-18.some.very.long.domain", WireType::Hello)]
    #[tokio::test]
    async fn test_envelope_roundtrip(#[case] from: &str, #[case] to: &str, #[case] wire_type: WireType) {
        let mut buf = BytesMut::new();
        Envelope::encode(from, 7000, to, 7001, wire_type, &mut buf);

        let mut r = &buf[..];
        let actual = Envelope::read(&mut r).await.unwrap();
        assert!(r.is_empty());
        assert_eq!(actual.from_host, from);
        assert_eq!(actual.from_port, 7000);
        assert_eq!(actual.to_host, to);
        assert_eq!(actual.to_port, 7001);
        assert_eq!(WireType::try_from(actual.wire_type).unwrap(), wire_type);
    }

    #[test]
    fn test_envelope_header_len() {
        assert_eq!(WIRE_HEADER_LEN, 52);
        let mut buf = BytesMut::new();
        Envelope::encode("alpha", 1, "beta", 2, WireType::Heartbeat, &mut buf);
        assert_eq!(buf.len(), WIRE_HEADER_LEN);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::two_hosts(vec![("alpha", 7000), ("beta", 7001)])]
    #[case::with_long_name(vec![("alpha", 7000), ("db-node-17.some.very.long.domain", 7002)])]
    #[tokio::test]
    async fn test_hello_roundtrip(#[case] hosts: Vec<(&str, u16)>) {
        let payload = HelloPayload {
            hosts: hosts.iter().map(|(name, port)| HelloHost { name: name.to_string(), port: *port }).collect(),
        };

        let mut buf = BytesMut::new();
        payload.encode(&mut buf);

        let mut r = &buf[..];
        let actual = HelloPayload::read(&mut r).await.unwrap();
        assert_eq!(actual, payload);
        assert!(r.is_empty());
    }

    /// older senders pad the payload with fluff bytes; the receiver must consume exactly
    ///  `datasz` to stay in frame sync
    #[tokio::test]
    async fn test_hello_consumes_padding() {
        let payload = HelloPayload {
            hosts: vec![HelloHost { name: "alpha".to_string(), port: 7000 }],
        };
        let mut buf = BytesMut::new();
        payload.encode(&mut buf);

        // patch datasz up by 8 and append the padding, followed by trailing bytes of the
        // next frame that must not be consumed
        let datasz = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) + 8;
        buf[..4].copy_from_slice(&datasz.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(b"NEXT");

        let mut r = &buf[..];
        let actual = HelloPayload::read(&mut r).await.unwrap();
        assert_eq!(actual, payload);
        assert_eq!(r, b"NEXT");
    }

    #[tokio::test]
    async fn test_hello_rejects_bad_sizes() {
        let mut buf = BytesMut::new();
        buf.put_i32(4); // too small to hold the host count
        assert!(HelloPayload::read(&mut &buf[..]).await.is_err());

        let mut buf = BytesMut::new();
        buf.put_i32((MAX_HELLO_PAYLOAD + 1) as i32);
        assert!(HelloPayload::read(&mut &buf[..]).await.is_err());
    }

    #[rstest]
    #[case::plain(9, 42, false, 3)]
    #[case::with_ack(17, -1, true, 0)]
    #[tokio::test]
    async fn test_user_msg_header_roundtrip(#[case] usertype: i32, #[case] seqnum: i32, #[case] waitforack: bool, #[case] datalen: usize) {
        let header = UserMsgHeader { usertype, seqnum, waitforack, datalen };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), UserMsgHeader::LEN);

        let actual = UserMsgHeader::read(&mut &buf[..]).await.unwrap();
        assert_eq!(actual, header);
    }

    #[tokio::test]
    async fn test_user_msg_header_rejects_negative_len() {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_i32(2);
        buf.put_i32(0);
        buf.put_i32(-5);
        assert!(UserMsgHeader::read(&mut &buf[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_roundtrip() {
        let msg = AckMsg { seqnum: 77, outrc: 42 };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(AckMsg::read(&mut &buf[..]).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_ack_payload_roundtrip() {
        let msg = AckPayloadMsg { seqnum: 77, outrc: 0, payload: b"result row".to_vec() };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(AckPayloadMsg::read(&mut &buf[..]).await.unwrap(), msg);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-1)]
    #[case::too_big((MAX_ACK_PAYLOAD + 1) as i32)]
    #[tokio::test]
    async fn test_ack_payload_rejects_bad_len(#[case] paylen: i32) {
        let mut buf = BytesMut::new();
        buf.put_i32(1);
        buf.put_i32(0);
        buf.put_i32(paylen);
        buf.put_slice(&vec![0u8; MAX_ACK_PAYLOAD + 8]);
        assert!(AckPayloadMsg::read(&mut &buf[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_decom_name_roundtrip() {
        let msg = DecomNameMsg { host: "db-node-3".to_string() };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(DecomNameMsg::read(&mut &buf[..]).await.unwrap(), msg);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::too_long(257)]
    #[tokio::test]
    async fn test_decom_name_rejects_bad_len(#[case] hostlen: i32) {
        let mut buf = BytesMut::new();
        buf.put_i32(hostlen);
        buf.put_slice(&vec![b'x'; 300]);
        assert!(DecomNameMsg::read(&mut &buf[..]).await.is_err());
    }
}
