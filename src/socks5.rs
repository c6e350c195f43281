//! SOCKS5 framing for tunneling DNS payloads through an upstream proxy.
//!
//! Pure codec: nothing here touches a socket. TCP frames carry the greeting,
//! the CONNECT request and a DNS-over-TCP length prefix in one write; UDP
//! frames carry the UDP ASSOCIATE relay header.

use std::future::Future;
use std::io;
use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const REPLY_SUCCEEDED: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const MAX_DOMAIN_LEN: usize = 255;
const MAX_TCP_PAYLOAD: usize = u16::MAX as usize;

/// Largest fixed-size relay header: VER/REP/RSV (or RSV/FRAG) + ATYP, an IPv6
/// address and a port.
const WORST_CASE_HEADER: usize = 3 + 3 + 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Endpoint {
    /// ATYP + address + big-endian port, reused for every frame.
    dest: Vec<u8>,
    header_reserved: usize,
}

impl Socks5Endpoint {
    /// Classifies `host` as an IPv4 literal, IPv6 literal (brackets optional)
    /// or domain name.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let literal = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let mut dest = Vec::with_capacity(4 + host.len() + 2);
        match literal.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                dest.push(ATYP_IPV4);
                dest.extend_from_slice(&v4.octets());
            }
            Ok(IpAddr::V6(v6)) => {
                dest.push(ATYP_IPV6);
                dest.extend_from_slice(&v6.octets());
            }
            Err(_) => {
                let name = host.as_bytes();
                if name.len() > MAX_DOMAIN_LEN {
                    return Err(Error::HostnameTooLong(name.len()));
                }
                dest.push(ATYP_DOMAIN);
                dest.push(name.len() as u8);
                dest.extend_from_slice(name);
            }
        }
        dest.extend_from_slice(&port.to_be_bytes());

        let header_reserved = WORST_CASE_HEADER.max(3 + dest.len());
        Ok(Self {
            dest,
            header_reserved,
        })
    }

    /// Greeting + CONNECT + length-prefixed payload, ready for a single write.
    pub fn tcp_wrap(&self, message: &[u8]) -> Result<Bytes> {
        if message.len() > MAX_TCP_PAYLOAD {
            return Err(Error::MessageTooLarge(message.len()));
        }
        let mut out = BytesMut::with_capacity(3 + 3 + self.dest.len() + 2 + message.len());
        out.put_slice(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]);
        out.put_slice(&[SOCKS_VERSION, CMD_CONNECT, 0]);
        out.put_slice(&self.dest);
        out.put_u16(message.len() as u16);
        out.put_slice(message);
        Ok(out.freeze())
    }

    /// Zeroed buffer with room for the method reply, the CONNECT reply and a
    /// length prefix ahead of `size` payload bytes.
    pub fn tcp_receive_buffer(&self, size: usize) -> BytesMut {
        BytesMut::zeroed(2 + self.header_reserved + 2 + size)
    }

    /// Reads the proxy's replies into `buffer` and leaves it holding exactly
    /// the relayed DNS payload.
    ///
    /// `reader` follows non-blocking socket semantics: `Ok(0)` is end of
    /// stream, `WouldBlock` suspends on `wait_for_more` before retrying.
    pub async fn tcp_unwrap<R, W, Fut>(
        &self,
        buffer: &mut BytesMut,
        mut reader: R,
        mut wait_for_more: W,
    ) -> Result<()>
    where
        R: FnMut(&mut [u8]) -> io::Result<usize>,
        W: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let capacity = buffer.len();
        let mut filled = 0;

        // Method selection reply: VER METHOD.
        fill(&mut buffer[..], &mut filled, 2, &mut reader, &mut wait_for_more).await?;
        if buffer[0] != SOCKS_VERSION {
            return Err(Error::protocol(format!("unsupported version {}", buffer[0])));
        }
        if buffer[1] != METHOD_NO_AUTH {
            return Err(Error::protocol(format!(
                "proxy rejected no-auth (method {:#04x})",
                buffer[1]
            )));
        }

        // CONNECT reply: VER REP RSV ATYP, plus the domain length byte if any.
        fill(&mut buffer[..], &mut filled, 7, &mut reader, &mut wait_for_more).await?;
        if buffer[2] != SOCKS_VERSION {
            return Err(Error::protocol(format!("unsupported version {}", buffer[2])));
        }
        if buffer[3] != REPLY_SUCCEEDED {
            return Err(Error::protocol(format!("connect failed with reply {}", buffer[3])));
        }
        let addr_len = match buffer[5] {
            ATYP_IPV4 => 4,
            ATYP_DOMAIN => 1 + buffer[6] as usize,
            ATYP_IPV6 => 16,
            other => return Err(Error::protocol(format!("unknown address type {other}"))),
        };
        let data_offset = 2 + 4 + addr_len + 2;

        fill(&mut buffer[..], &mut filled, data_offset + 2, &mut reader, &mut wait_for_more)
            .await?;
        let len = u16::from_be_bytes([buffer[data_offset], buffer[data_offset + 1]]) as usize;
        if len > capacity - data_offset - 2 {
            return Err(Error::protocol(format!(
                "frame of {len} bytes exceeds receive buffer"
            )));
        }

        let end = data_offset + 2 + len;
        fill(&mut buffer[..], &mut filled, end, &mut reader, &mut wait_for_more).await?;
        buffer.truncate(end);
        buffer.advance(data_offset + 2);
        Ok(())
    }

    pub fn udp_wrap(&self, packet: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(3 + self.dest.len() + packet.len());
        out.put_slice(&[0, 0, 0]);
        out.put_slice(&self.dest);
        out.put_slice(packet);
        out.freeze()
    }

    pub fn udp_receive_buffer(&self, size: usize) -> BytesMut {
        BytesMut::zeroed(self.header_reserved + size)
    }

    /// Validates the UDP relay header and advances `packet` to the payload.
    pub fn udp_unwrap(&self, packet: &mut BytesMut) -> Result<()> {
        if packet.len() < 4 {
            return Err(Error::protocol("truncated udp relay header"));
        }
        if packet[2] != 0 {
            return Err(Error::protocol(format!("fragment {} not supported", packet[2])));
        }
        let addr_len = match packet[3] {
            ATYP_IPV4 => 4,
            ATYP_DOMAIN if packet.len() > 4 => 1 + packet[4] as usize,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => return Err(Error::protocol("truncated udp relay header")),
            other => return Err(Error::protocol(format!("unknown address type {other}"))),
        };
        let header = 4 + addr_len + 2;
        if packet.len() < header {
            return Err(Error::protocol("truncated udp relay header"));
        }
        packet.advance(header);
        Ok(())
    }
}

async fn fill<R, W, Fut>(
    buffer: &mut [u8],
    filled: &mut usize,
    need: usize,
    reader: &mut R,
    wait_for_more: &mut W,
) -> Result<()>
where
    R: FnMut(&mut [u8]) -> io::Result<usize>,
    W: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if need > buffer.len() {
        return Err(Error::protocol("reply exceeds receive buffer"));
    }
    while *filled < need {
        match reader(&mut buffer[*filled..]) {
            Ok(0) => return Err(Error::EndOfStream),
            Ok(n) => *filled += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => wait_for_more().await?,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
