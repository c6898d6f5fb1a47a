//! mDNS advertisement for the update service
//!
//! Describes the board to network uploaders as
//! `<hostname>._arduino._tcp.local.` using edge-mdns. The socket side lives
//! with the update server; this module only turns requests into packets.

use core::net::{Ipv4Addr, Ipv6Addr};

use edge_mdns::domain::base::Ttl;
use edge_mdns::host::{Host, Service, ServiceAnswers};
use edge_mdns::{HostAnswersMdnsHandler, MdnsHandler, MdnsRequest, MdnsResponse};

use crate::{BoardError, config};

/// mDNS UDP port
pub const MDNS_PORT: u16 = 5353;

/// mDNS IPv4 multicast group
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// Record TTL in seconds
pub const RECORD_TTL_SECS: u32 = 120;

/// Response buffer size
pub const MAX_PACKET_SIZE: usize = 1024;

const MAX_LABEL_LEN: usize = 63;

const SERVICE: &str = "_arduino";
const PROTOCOL: &str = "_tcp";
const DEFAULT_TXT: &[(&str, &str)] = &[
    ("board", "esp32c3"),
    ("tcp_check", "no"),
    ("ssh_upload", "no"),
    ("auth_upload", "no"),
];

/// Host and service records advertised for the update port
pub struct UpdateAdvertiser<'a> {
    host: Host<'a>,
    service: Service<'a>,
}

impl<'a> UpdateAdvertiser<'a> {
    pub fn new(hostname: &'a str, address: Ipv4Addr) -> Result<Self, BoardError> {
        if hostname.is_empty() || hostname.len() > MAX_LABEL_LEN || hostname.contains('.') {
            return Err(BoardError::MdnsError);
        }

        Ok(Self {
            host: Host {
                hostname,
                ipv4: address,
                ipv6: Ipv6Addr::UNSPECIFIED,
                ttl: Ttl::from_secs(RECORD_TTL_SECS),
            },
            service: Service {
                name: hostname,
                priority: 0,
                weight: 0,
                service: SERVICE,
                protocol: PROTOCOL,
                port: config::OTA_PORT,
                service_subtypes: &[],
                txt_kvs: DEFAULT_TXT,
            },
        })
    }

    pub fn hostname(&self) -> &str {
        self.host.hostname
    }

    /// Unsolicited announcement of every record
    pub fn announce<'b>(&self, buf: &'b mut [u8]) -> Result<&'b [u8], BoardError> {
        self.respond(MdnsRequest::None, buf)?.ok_or(BoardError::MdnsError)
    }

    /// Answer a datagram received on the mDNS port. `Ok(None)` when it asks
    /// for nothing this board owns.
    ///
    /// `legacy` marks one-shot queries sent from a port other than 5353,
    /// which must be answered by unicast.
    pub fn answer<'b>(&self, datagram: &[u8], legacy: bool, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, BoardError> {
        self.respond(
            MdnsRequest::Request {
                legacy,
                multicast: !legacy,
                data: datagram,
            },
            buf,
        )
    }

    fn respond<'b>(&self, request: MdnsRequest<'_>, buf: &'b mut [u8]) -> Result<Option<&'b [u8]>, BoardError> {
        let mut handler = HostAnswersMdnsHandler::new(ServiceAnswers::new(&self.host, &self.service));
        match handler.handle(request, buf) {
            Ok(MdnsResponse::Reply { data, .. }) => Ok(Some(data)),
            Ok(_) => Ok(None),
            Err(_) => Err(BoardError::MdnsError),
        }
    }
}
