use std::net::IpAddr;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

use crate::error::Result;

const HEADER_LEN: usize = 12;
const RCODE_SERVFAIL: u8 = 2;

/// Response skeleton echoing id, opcode, RD and the first question.
pub fn prepare_response(request: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(request.op_code());
    msg.set_recursion_desired(request.recursion_desired());
    if let Some(query) = request.queries().first() {
        msg.add_query(query.clone());
    }
    msg
}

/// Answer `request` with one A/AAAA record per address.
pub fn cook_response(request: &Message, addrs: &[IpAddr], ttl: u32) -> Result<Bytes> {
    let mut msg = prepare_response(request);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);

    if let Some(query) = request.queries().first() {
        for addr in addrs {
            let rdata = match addr {
                IpAddr::V4(v4) => RData::A(A(*v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
            };
            msg.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
        }
    }
    encode(&msg)
}

pub fn servfail_response(request: &Message) -> Result<Bytes> {
    let mut msg = prepare_response(request);
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::ServFail);
    encode(&msg)
}

/// Header-only SERVFAIL for a packet hickory could not parse.
///
/// Keeps id, opcode and RD from the raw header and zeroes every section count.
/// `None` when the packet is shorter than a DNS header.
pub fn servfail_from_raw(packet: &[u8]) -> Option<Bytes> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let mut out = packet[..HEADER_LEN].to_vec();
    // QR | opcode | RD
    out[2] = 0x80 | (packet[2] & 0x78) | (packet[2] & 0x01);
    // RA | rcode
    out[3] = 0x80 | RCODE_SERVFAIL;
    out[4..HEADER_LEN].fill(0);
    Some(Bytes::from(out))
}

/// Lowercased query name without the trailing root dot.
pub fn query_host(name: &Name) -> String {
    let mut host = name.to_ascii();
    host.make_ascii_lowercase();
    if host.len() > 1 && host.ends_with('.') {
        host.pop();
    }
    host
}

/// Keeps the addresses matching the queried family (A: IPv4, AAAA: IPv6).
pub fn filter_family(addrs: Vec<IpAddr>, qtype: RecordType) -> Vec<IpAddr> {
    addrs
        .into_iter()
        .filter(|addr| match qtype {
            RecordType::A => addr.is_ipv4(),
            RecordType::AAAA => addr.is_ipv6(),
            _ => false,
        })
        .collect()
}

pub fn encode(msg: &Message) -> Result<Bytes> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use std::str::FromStr;

    fn request(host: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(host).unwrap(), qtype));
        msg
    }

    #[test]
    fn cook_response_echoes_question_and_adds_records() {
        let req = request("a.test.", RecordType::A);
        let addrs: Vec<IpAddr> = vec!["1.2.3.4".parse().unwrap(), "::1".parse().unwrap()];
        let bytes = cook_response(&req, &addrs, 120).unwrap();
        let resp = Message::from_vec(&bytes).unwrap();

        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert!(resp.recursion_desired());
        assert!(resp.recursion_available());
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.queries().len(), 1);
        assert_eq!(resp.answers().len(), 2);
        assert_eq!(resp.answers()[0].ttl(), 120);
        assert_eq!(resp.answers()[0].record_type(), RecordType::A);
        assert_eq!(resp.answers()[1].record_type(), RecordType::AAAA);
    }

    #[test]
    fn servfail_response_has_no_records() {
        let req = request("a.test.", RecordType::AAAA);
        let resp = Message::from_vec(&servfail_response(&req).unwrap()).unwrap();
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert!(resp.answers().is_empty());
        assert_eq!(resp.queries().len(), 1);
    }

    #[test]
    fn servfail_from_raw_keeps_header_identity() {
        let mut packet = vec![0xbe, 0xef, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xff; 5]);
        let out = servfail_from_raw(&packet).unwrap();

        assert_eq!(out.len(), 12);
        let resp = Message::from_vec(&out).unwrap();
        assert_eq!(resp.id(), 0xbeef);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert!(resp.recursion_desired());
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert!(resp.queries().is_empty());

        assert!(servfail_from_raw(&[1, 2, 3]).is_none());
    }

    #[test]
    fn query_host_normalizes_case_and_root() {
        assert_eq!(query_host(&Name::from_str("WWW.Example.COM.").unwrap()), "www.example.com");
        assert_eq!(query_host(&Name::from_str("a.test").unwrap()), "a.test");
    }

    #[test]
    fn filter_family_follows_qtype() {
        let addrs: Vec<IpAddr> = vec!["1.2.3.4".parse().unwrap(), "::1".parse().unwrap()];
        assert_eq!(
            filter_family(addrs.clone(), RecordType::A),
            vec!["1.2.3.4".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(
            filter_family(addrs.clone(), RecordType::AAAA),
            vec!["::1".parse::<IpAddr>().unwrap()]
        );
        assert!(filter_family(addrs, RecordType::TXT).is_empty());
    }
}
