// pws_exporter - Prometheus metrics exporter for personal weather stations
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! A small DNS responder that answers for vendor domains, forwards a few
//! domains required by the station, and blackholes everything else.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::ProtoError;
use std::collections::{HashMap, HashSet};
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// TTL of answers for names in the record table.
pub const RECORD_TTL: u32 = 3600;

/// Largest datagram we'll read, large enough for EDNS payloads.
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug)]
pub enum DnsError {
    Io(io::Error),
    Proto(ProtoError),
    Timeout(SocketAddr),
    IdMismatch(u16, u16),
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::Proto(e) => write!(f, "{}", e),
            Self::Timeout(addr) => write!(f, "timeout waiting for response from {}", addr),
            Self::IdMismatch(expected, actual) => {
                write!(f, "response id {} does not match query id {}", actual, expected)
            }
        }
    }
}

impl error::Error for DnsError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Proto(e) => Some(e),
            _ => None,
        }
    }
}

/// Client for the resolver that forwarded queries are relayed to.
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    addr: SocketAddr,
    timeout: Duration,
}

impl UpstreamResolver {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        UpstreamResolver { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send a raw query to the upstream resolver and return its raw response.
    ///
    /// The response is checked to be a DNS message with the same ID as the
    /// query but is otherwise returned untouched.
    pub async fn exchange(&self, query: &[u8], id: u16) -> Result<Vec<u8>, DnsError> {
        let local: SocketAddr = if self.addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await.map_err(DnsError::Io)?;
        socket.connect(self.addr).await.map_err(DnsError::Io)?;
        socket.send(query).await.map_err(DnsError::Io)?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout(self.addr))?
            .map_err(DnsError::Io)?;
        buf.truncate(len);

        let response = Message::from_vec(&buf).map_err(DnsError::Proto)?;
        if response.id() != id {
            return Err(DnsError::IdMismatch(id, response.id()));
        }

        Ok(buf)
    }
}

/// Static answer policy for the responder.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Resolver that queries for `forward_domains` are relayed to.
    pub upstream: UpstreamResolver,
    /// A records answered locally, keyed by fully-qualified name (with a trailing dot).
    pub records: HashMap<String, Ipv4Addr>,
    /// Fully-qualified names whose queries are relayed upstream.
    pub forward_domains: Vec<String>,
}

/// Answers, forwards, or blackholes individual DNS queries.
#[derive(Debug)]
pub struct DnsResponder {
    upstream: UpstreamResolver,
    records: HashMap<String, Ipv4Addr>,
    forward_domains: HashSet<String>,
}

impl DnsResponder {
    pub fn new(config: DnsConfig) -> Self {
        DnsResponder {
            upstream: config.upstream,
            records: config.records,
            forward_domains: config.forward_domains.into_iter().collect(),
        }
    }

    /// Produce the reply to a single raw query, or `None` if no reply should be sent.
    ///
    /// Responses are ignored and opcodes other than QUERY get NOTIMP. Otherwise
    /// only messages with exactly one question get a reply. A queries for names in
    /// the record table are answered locally, queries for forward domains are relayed
    /// upstream (and dropped if that fails), and anything else gets NXDOMAIN.
    pub async fn respond(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(message = "dropping unparsable DNS message", error = %e);
                return None;
            }
        };

        if request.message_type() == MessageType::Response {
            tracing::debug!(message = "dropping DNS message that is a response", id = request.id());
            return None;
        }

        if request.op_code() != OpCode::Query {
            tracing::debug!(message = "refusing unsupported DNS opcode", opcode = ?request.op_code());
            return encode(&reply_to(&request, ResponseCode::NotImp));
        }

        if request.queries().len() != 1 {
            tracing::debug!(
                message = "dropping DNS message without exactly one question",
                questions = request.queries().len()
            );
            return None;
        }

        let query = &request.queries()[0];
        let name = query.name().to_string();
        let qtype = query.query_type();
        tracing::debug!(message = "handling DNS query", name = %name, qtype = %qtype);

        if qtype == RecordType::A {
            if let Some(ip) = self.records.get(&name) {
                tracing::debug!(message = "answering with local record", name = %name, a = %ip);
                let mut response = reply_to(&request, ResponseCode::NoError);
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    RECORD_TTL,
                    RData::A(A(*ip)),
                ));
                return encode(&response);
            }
        }

        if self.forward_domains.contains(&name) {
            return match self.upstream.exchange(packet, request.id()).await {
                Ok(res) => {
                    tracing::debug!(
                        message = "resolved forwarded query",
                        name = %name,
                        upstream = %self.upstream.addr(),
                    );
                    Some(res)
                }
                Err(e) => {
                    tracing::error!(
                        message = "error forwarding DNS query",
                        name = %name,
                        upstream = %self.upstream.addr(),
                        error = %e,
                    );
                    None
                }
            };
        }

        tracing::debug!(message = "answering with NXDOMAIN", name = %name, qtype = %qtype);
        encode(&reply_to(&request, ResponseCode::NXDomain))
    }

    /// Answer queries arriving on `socket` until `signal` completes.
    ///
    /// Each query is handled in its own task so that slow upstream exchanges
    /// don't hold up local answers. Errors reading from the socket end the loop.
    pub async fn serve_with_shutdown<F>(self: Arc<Self>, socket: UdpSocket, signal: F) -> Result<(), DnsError>
    where
        F: Future<Output = ()>,
    {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::pin!(signal);

        loop {
            let (len, peer) = tokio::select! {
                _ = &mut signal => break,
                res = socket.recv_from(&mut buf) => res.map_err(DnsError::Io)?,
            };

            let packet = buf[..len].to_vec();
            let responder = Arc::clone(&self);
            let socket = Arc::clone(&socket);

            tokio::spawn(async move {
                if let Some(reply) = responder.respond(&packet).await {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        tracing::warn!(message = "failed to send DNS reply", peer = %peer, error = %e);
                    }
                }
            });
        }

        Ok(())
    }
}

/// Build an empty response to `request`, echoing its ID, opcode, flags and question.
fn reply_to(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_checking_disabled(request.checking_disabled());
    response.set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response
}

fn encode(response: &Message) -> Option<Vec<u8>> {
    match response.to_vec() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::error!(message = "failed to encode DNS response", error = %e);
            None
        }
    }
}
