//! DNS hijacker: a UDP/53 server that answers `A` queries with fake
//! addresses from a [`crate::fakeip::Pool`], suppresses `AAAA` so traffic
//! stays on the IPv4 fake-IP path, and passes every other query type
//! through with an empty answer section.
//!
//! Grounded on `proxy/proxyPriv_proxy_dns.go`'s `proxyDNS`, which wraps
//! `miekg/dns`; this crate uses `hickory-proto` for the same wire-format
//! concern.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::{rdata::A, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::fakeip::Pool;

/// Builds the reply for one query message. For `A` questions, allocates a
/// fake address for the trimmed QNAME and answers with TTL 0. `AAAA`
/// questions get an authoritative empty answer (suppressing IPv6). Every
/// other type, and every non-`Query` opcode, gets a copy of the query with
/// `ANCOUNT=0`.
pub fn build_reply(query: &Message, pool: &Pool) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.set_authoritative(true);

    for query_record in query.queries() {
        response.add_query(query_record.clone());
    }

    if query.op_code() != OpCode::Query {
        return response;
    }

    for query_record in query.queries() {
        match query_record.query_type() {
            RecordType::A => {
                let name = query_record.name().to_utf8();
                let trimmed = name.trim_end_matches('.');
                if let IpAddr::V4(v4) = pool.get_ip(trimmed) {
                    let mut record = Record::with(query_record.name().clone(), RecordType::A, 0);
                    record.set_data(Some(RData::A(A(v4))));
                    response.add_answer(record);
                }
            }
            RecordType::AAAA => {
                // no answer: forces clients back onto the A/fake-IP path.
            }
            _ => {}
        }
    }

    response
}

/// Runs the DNS hijacker until the socket errors. `pool` is shared with the
/// TPROXY listener for reverse fake-IP lookup.
pub async fn serve(bind: SocketAddr, pool: Arc<Pool>) -> Result<()> {
    let socket = UdpSocket::bind(bind).await.map_err(Error::from)?;
    log::info!("dns hijacker listening on {bind}");
    let mut buf = [0u8; 512];
    loop {
        let (n, src) = socket.recv_from(&mut buf).await.map_err(Error::from)?;
        let query = match Message::from_bytes(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("dropping malformed dns query from {src}: {e}");
                continue;
            }
        };
        let reply = build_reply(&query, &pool);
        let bytes = match reply.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                log::warn!("failed to encode dns reply: {e}");
                continue;
            }
        };
        if let Err(e) = socket.send_to(&bytes, src).await {
            log::debug!("failed to send dns reply to {src}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use ipnet::IpNet;
    use std::str::FromStr;

    fn pool() -> Pool {
        Pool::new(IpNet::from_str("198.18.0.0/16").unwrap(), 0).unwrap()
    }

    fn a_query(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(42);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    #[test]
    fn a_query_answers_with_a_fake_address() {
        let pool = pool();
        let query = a_query("example.com.");
        let reply = build_reply(&query, &pool);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].record_type(), RecordType::A);
    }

    #[test]
    fn repeated_queries_for_the_same_name_return_the_same_address() {
        let pool = pool();
        let first = build_reply(&a_query("example.com."), &pool);
        let second = build_reply(&a_query("example.com."), &pool);
        assert_eq!(
            first.answers()[0].data().unwrap().to_string(),
            second.answers()[0].data().unwrap().to_string()
        );
    }

    #[test]
    fn aaaa_query_gets_no_answers() {
        let pool = pool();
        let mut query = Message::new();
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::AAAA));
        let reply = build_reply(&query, &pool);
        assert!(reply.answers().is_empty());
        assert!(reply.authoritative());
    }

    #[test]
    fn other_qtypes_pass_through_with_zero_answers() {
        let pool = pool();
        let mut query = Message::new();
        query.set_message_type(MessageType::Query);
        query.set_op_code(OpCode::Query);
        query.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::MX));
        let reply = build_reply(&query, &pool);
        assert!(reply.answers().is_empty());
    }
}
