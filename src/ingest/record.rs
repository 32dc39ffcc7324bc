// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! The structured packet record produced by the pipeline.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One decoded packet.
///
/// Within a chunk, `frame_number` is the chunk-local record ordinal (1-based);
/// the merger rewrites it into the global, contiguous frame number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketRecord {
    pub frame_number: u64,
    /// Frame number as the decoder numbers it in the original capture file.
    pub capture_frame: u64,
    pub timestamp: DateTime<Utc>,
    pub src_addr: Option<Arc<str>>,
    pub dst_addr: Option<Arc<str>>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub transport: Option<Arc<str>>,
    pub protocol: Option<Arc<str>>,
    pub length: u32,
    pub tcp_flags: Option<TcpFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Box<RawFields>>,
}

/// Fields only a few protocols carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_sni: Option<String>,
}

impl RawFields {
    pub fn is_empty(&self) -> bool {
        self.dns_query.is_none() && self.http_host.is_none() && self.tls_sni.is_none()
    }
}

/// TCP control bits as reported by the decoder's `tcp.flags` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: u16 = 0x001;
    pub const SYN: u16 = 0x002;
    pub const RST: u16 = 0x004;
    pub const PSH: u16 = 0x008;
    pub const ACK: u16 = 0x010;
    pub const URG: u16 = 0x020;

    pub fn contains(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    pub fn syn(self) -> bool {
        self.contains(Self::SYN)
    }

    pub fn ack(self) -> bool {
        self.contains(Self::ACK)
    }

    pub fn fin(self) -> bool {
        self.contains(Self::FIN)
    }

    pub fn rst(self) -> bool {
        self.contains(Self::RST)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 6] = [
            (TcpFlags::URG, "URG"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::FIN, "FIN"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(", "))
    }
}

impl fmt::Display for PacketRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = |addr: &Option<Arc<str>>, port: Option<u16>| match (addr, port) {
            (Some(a), Some(p)) => format!("{a}:{p}"),
            (Some(a), None) => a.to_string(),
            (None, _) => "-".to_string(),
        };
        write!(
            f,
            "{} {} {} -> {} {} {}",
            self.frame_number,
            self.timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            endpoint(&self.src_addr, self.src_port),
            endpoint(&self.dst_addr, self.dst_port),
            self.protocol.as_deref().unwrap_or("-"),
            self.length
        )
    }
}
