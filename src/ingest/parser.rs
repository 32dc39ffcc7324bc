// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Hot-path parser for one line of tab-separated decoder output.
//!
//! The column layout is fixed by [`DECODER_FIELDS`](crate::constants::DECODER_FIELDS).
//! Delimiter positions are computed once into a stack array and fields are
//! borrowed as slices of the line, so parsing a line allocates nothing beyond
//! the record itself and the rare-field payload when one is present.
use chrono::{DateTime, Utc};
use std::hash::{BuildHasher, RandomState};
use thiserror::Error;

use crate::constants::*;
use crate::ingest::pool::StringPool;
use crate::ingest::record::{PacketRecord, RawFields, TcpFlags};

/// Why a decoder line was skipped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("invalid frame number")]
    FrameNumber,
    #[error("invalid timestamp")]
    Timestamp,
    #[error("invalid frame length")]
    Length,
    #[error("line is not valid UTF-8")]
    Encoding,
}

/// Borrowed view of one line split at its delimiters.
struct Fields<'a> {
    line: &'a str,
    // bounds[i] is the start of field i; bounds[FIELD_COUNT] is one past the end.
    bounds: [usize; FIELD_COUNT + 1],
}

impl<'a> Fields<'a> {
    fn split(line: &'a str) -> Result<Self, Malformed> {
        let bytes = line.as_bytes();
        let mut bounds = [0usize; FIELD_COUNT + 1];
        let mut field = 1;
        for (i, &b) in bytes.iter().enumerate() {
            if b == FIELD_DELIMITER {
                if field == FIELD_COUNT {
                    let rest = bytes[i + 1..]
                        .iter()
                        .filter(|&&c| c == FIELD_DELIMITER)
                        .count();
                    return Err(Malformed::FieldCount {
                        expected: FIELD_COUNT,
                        found: field + 1 + rest,
                    });
                }
                bounds[field] = i + 1;
                field += 1;
            }
        }
        if field != FIELD_COUNT {
            return Err(Malformed::FieldCount {
                expected: FIELD_COUNT,
                found: field,
            });
        }
        bounds[FIELD_COUNT] = bytes.len() + 1;
        Ok(Self { line, bounds })
    }

    #[inline]
    fn get(&self, index: usize) -> &'a str {
        &self.line[self.bounds[index]..self.bounds[index + 1] - 1]
    }

    #[inline]
    fn non_empty(&self, index: usize) -> Option<&'a str> {
        let value = self.get(index);
        (!value.is_empty()).then_some(value)
    }
}

/// Parses decoder lines of one chunk, interning repeated values into a shared pool.
pub struct FieldParser<'p, S = RandomState> {
    pool: &'p StringPool<S>,
    capture_offset: u64,
}

impl<'p, S: BuildHasher> FieldParser<'p, S> {
    /// `capture_offset` is added to the decoder's frame number to obtain the
    /// frame number in the original capture.
    pub fn new(pool: &'p StringPool<S>, capture_offset: u64) -> Self {
        Self {
            pool,
            capture_offset,
        }
    }

    /// Parses raw bytes as read from the decoder pipe, line terminator included or not.
    pub fn parse_bytes(&self, raw: &[u8]) -> Result<PacketRecord, Malformed> {
        let line = std::str::from_utf8(raw).map_err(|_| Malformed::Encoding)?;
        self.parse_line(line)
    }

    pub fn parse_line(&self, raw: &str) -> Result<PacketRecord, Malformed> {
        let line = raw.trim_end_matches(['\n', '\r']);
        let fields = Fields::split(line)?;

        // Every line: identity, time and size.
        let local_frame: u64 = fields
            .get(FIELD_FRAME_NUMBER)
            .parse()
            .map_err(|_| Malformed::FrameNumber)?;
        let capture_frame = self
            .capture_offset
            .checked_add(local_frame)
            .ok_or(Malformed::FrameNumber)?;
        let timestamp = parse_epoch(fields.get(FIELD_TIME_EPOCH)).ok_or(Malformed::Timestamp)?;
        let length: u32 = fields
            .get(FIELD_FRAME_LEN)
            .parse()
            .map_err(|_| Malformed::Length)?;

        let src_addr = fields
            .non_empty(FIELD_IP_SRC)
            .or_else(|| fields.non_empty(FIELD_IPV6_SRC))
            .map(|a| self.pool.intern(a));
        let dst_addr = fields
            .non_empty(FIELD_IP_DST)
            .or_else(|| fields.non_empty(FIELD_IPV6_DST))
            .map(|a| self.pool.intern(a));

        let tcp = fields.non_empty(FIELD_TCP_SRCPORT).is_some();
        let (src_port, dst_port, transport) = if tcp {
            (
                parse_port(fields.get(FIELD_TCP_SRCPORT)),
                parse_port(fields.get(FIELD_TCP_DSTPORT)),
                Some(self.pool.intern("TCP")),
            )
        } else if fields.non_empty(FIELD_UDP_SRCPORT).is_some() {
            (
                parse_port(fields.get(FIELD_UDP_SRCPORT)),
                parse_port(fields.get(FIELD_UDP_DSTPORT)),
                Some(self.pool.intern("UDP")),
            )
        } else {
            let proto = fields
                .non_empty(FIELD_IP_PROTO)
                .or_else(|| fields.non_empty(FIELD_IPV6_NXT));
            (None, None, proto.map(|p| self.pool.intern(transport_label(p))))
        };

        let protocol = fields.non_empty(FIELD_PROTOCOL).map(|p| self.pool.intern(p));

        // Only TCP records carry flags.
        let tcp_flags = if tcp {
            fields.non_empty(FIELD_TCP_FLAGS).and_then(parse_hex_u16).map(TcpFlags)
        } else {
            None
        };

        Ok(PacketRecord {
            frame_number: local_frame,
            capture_frame,
            timestamp,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            transport,
            protocol,
            length,
            tcp_flags,
            raw: parse_raw_fields(&fields),
        })
    }
}

fn parse_raw_fields(fields: &Fields<'_>) -> Option<Box<RawFields>> {
    let dns_query = fields.non_empty(FIELD_DNS_QUERY);
    let http_host = fields.non_empty(FIELD_HTTP_HOST);
    let tls_sni = fields.non_empty(FIELD_TLS_SNI);
    if dns_query.is_none() && http_host.is_none() && tls_sni.is_none() {
        return None;
    }
    Some(Box::new(RawFields {
        dns_query: dns_query.map(str::to_string),
        http_host: http_host.map(str::to_string),
        tls_sni: tls_sni.map(str::to_string),
    }))
}

/// Parses `seconds[.fraction]` since the Unix epoch without going through floating point.
pub fn parse_epoch(s: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
    let secs: i64 = secs.parse().ok()?;
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut nanos: u32 = 0;
    let mut digits = 0;
    for b in frac.bytes().take(9) {
        nanos = nanos * 10 + u32::from(b - b'0');
        digits += 1;
    }
    for _ in digits..9 {
        nanos *= 10;
    }
    DateTime::from_timestamp(secs, nanos)
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse().ok()
}

fn parse_hex_u16(s: &str) -> Option<u16> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u16::from_str_radix(digits, 16).ok()
}

fn transport_label(proto: &str) -> &str {
    match proto {
        "1" => "ICMP",
        "2" => "IGMP",
        "6" => "TCP",
        "17" => "UDP",
        "47" => "GRE",
        "50" => "ESP",
        "51" => "AH",
        "58" => "ICMPv6",
        "132" => "SCTP",
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Builds a decoder line from `(column, value)` pairs; other columns stay empty.
    pub fn decoder_line(values: &[(usize, &str)]) -> String {
        let mut columns = vec![""; FIELD_COUNT];
        for (index, value) in values {
            columns[*index] = value;
        }
        columns.join("\t")
    }

    fn tcp_line(frame: u64) -> String {
        decoder_line(&[
            (FIELD_FRAME_NUMBER, &frame.to_string()),
            (FIELD_TIME_EPOCH, "1700000000.123456789"),
            (FIELD_FRAME_LEN, "74"),
            (FIELD_IP_SRC, "10.0.0.1"),
            (FIELD_IP_DST, "10.0.0.2"),
            (FIELD_IP_PROTO, "6"),
            (FIELD_TCP_SRCPORT, "51000"),
            (FIELD_TCP_DSTPORT, "443"),
            (FIELD_PROTOCOL, "TLSv1.3"),
            (FIELD_TCP_FLAGS, "0x0018"),
            (FIELD_TLS_SNI, "example.org"),
        ])
    }

    #[test]
    fn test_parse_tcp_line() {
        let pool = StringPool::new();
        let parser = FieldParser::new(&pool, 100);
        let record = parser.parse_line(&(tcp_line(3) + "\n")).unwrap();

        assert_eq!(record.frame_number, 3);
        assert_eq!(record.capture_frame, 103);
        assert_eq!(record.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(record.timestamp.timestamp_subsec_nanos(), 123_456_789);
        assert_eq!(record.src_addr.as_deref(), Some("10.0.0.1"));
        assert_eq!(record.dst_addr.as_deref(), Some("10.0.0.2"));
        assert_eq!(record.src_port, Some(51000));
        assert_eq!(record.dst_port, Some(443));
        assert_eq!(record.transport.as_deref(), Some("TCP"));
        assert_eq!(record.protocol.as_deref(), Some("TLSv1.3"));
        assert_eq!(record.length, 74);
        let flags = record.tcp_flags.unwrap();
        assert!(flags.ack());
        assert!(flags.contains(TcpFlags::PSH));
        let raw = record.raw.unwrap();
        assert_eq!(raw.tls_sni.as_deref(), Some("example.org"));
        assert!(raw.dns_query.is_none());
    }

    #[test]
    fn test_parse_udp_ipv6_line() {
        let pool = StringPool::new();
        let parser = FieldParser::new(&pool, 0);
        let line = decoder_line(&[
            (FIELD_FRAME_NUMBER, "1"),
            (FIELD_TIME_EPOCH, "1700000000.5"),
            (FIELD_FRAME_LEN, "110"),
            (FIELD_IPV6_SRC, "fe80::1"),
            (FIELD_IPV6_DST, "ff02::fb"),
            (FIELD_IPV6_NXT, "17"),
            (FIELD_UDP_SRCPORT, "5353"),
            (FIELD_UDP_DSTPORT, "5353"),
            (FIELD_PROTOCOL, "MDNS"),
            (FIELD_TCP_FLAGS, "0x0002"),
            (FIELD_DNS_QUERY, "_services._dns-sd._udp.local"),
        ]);
        let record = parser.parse_line(&line).unwrap();

        assert_eq!(record.timestamp.timestamp_subsec_nanos(), 500_000_000);
        assert_eq!(record.src_addr.as_deref(), Some("fe80::1"));
        assert_eq!(record.transport.as_deref(), Some("UDP"));
        assert_eq!(record.src_port, Some(5353));
        // Flags are ignored on non-TCP records.
        assert!(record.tcp_flags.is_none());
        assert_eq!(
            record.raw.unwrap().dns_query.as_deref(),
            Some("_services._dns-sd._udp.local")
        );
    }

    #[test]
    fn test_parse_portless_line() {
        let pool = StringPool::new();
        let parser = FieldParser::new(&pool, 0);
        let line = decoder_line(&[
            (FIELD_FRAME_NUMBER, "9"),
            (FIELD_TIME_EPOCH, "1700000001"),
            (FIELD_FRAME_LEN, "98"),
            (FIELD_IP_SRC, "10.0.0.1"),
            (FIELD_IP_DST, "10.0.0.9"),
            (FIELD_IP_PROTO, "1"),
            (FIELD_PROTOCOL, "ICMP"),
        ]);
        let record = parser.parse_line(&line).unwrap();
        assert_eq!(record.transport.as_deref(), Some("ICMP"));
        assert!(record.src_port.is_none());
        assert!(record.raw.is_none());

        let arp = decoder_line(&[
            (FIELD_FRAME_NUMBER, "10"),
            (FIELD_TIME_EPOCH, "1700000001"),
            (FIELD_FRAME_LEN, "42"),
            (FIELD_PROTOCOL, "ARP"),
        ]);
        let record = parser.parse_line(&arp).unwrap();
        assert!(record.src_addr.is_none());
        assert!(record.transport.is_none());
        assert_eq!(record.protocol.as_deref(), Some("ARP"));
    }

    #[test]
    fn test_repeated_values_are_interned() {
        let pool = StringPool::new();
        let parser = FieldParser::new(&pool, 0);
        let a = parser.parse_line(&tcp_line(1)).unwrap();
        let b = parser.parse_line(&tcp_line(2)).unwrap();
        assert!(Arc::ptr_eq(a.src_addr.as_ref().unwrap(), b.src_addr.as_ref().unwrap()));
        assert!(Arc::ptr_eq(a.protocol.as_ref().unwrap(), b.protocol.as_ref().unwrap()));
        // 2 addresses, the transport label and the protocol label.
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_malformed_lines() {
        let pool = StringPool::new();
        let parser = FieldParser::new(&pool, 0);

        let short = tcp_line(1).rsplit_once('\t').unwrap().0.to_string();
        assert_eq!(
            parser.parse_line(&short),
            Err(Malformed::FieldCount {
                expected: FIELD_COUNT,
                found: FIELD_COUNT - 1
            })
        );

        let long = tcp_line(1) + "\textra\tmore";
        assert_eq!(
            parser.parse_line(&long),
            Err(Malformed::FieldCount {
                expected: FIELD_COUNT,
                found: FIELD_COUNT + 2
            })
        );

        let bad_time = tcp_line(1).replace("1700000000.123456789", "yesterday");
        assert_eq!(parser.parse_line(&bad_time), Err(Malformed::Timestamp));

        let bad_frame = decoder_line(&[(FIELD_FRAME_NUMBER, "x"), (FIELD_TIME_EPOCH, "1")]);
        assert_eq!(parser.parse_line(&bad_frame), Err(Malformed::FrameNumber));

        let offset_parser = FieldParser::new(&pool, 10);
        let huge_frame = tcp_line(u64::MAX);
        assert_eq!(offset_parser.parse_line(&huge_frame), Err(Malformed::FrameNumber));
        assert_eq!(parser.parse_line(&huge_frame).unwrap().capture_frame, u64::MAX);

        let bad_len = decoder_line(&[(FIELD_FRAME_NUMBER, "1"), (FIELD_TIME_EPOCH, "1")]);
        assert_eq!(parser.parse_line(&bad_len), Err(Malformed::Length));

        assert_eq!(parser.parse_bytes(b"\xff\xfe\t"), Err(Malformed::Encoding));
        assert_eq!(
            parser.parse_line(""),
            Err(Malformed::FieldCount {
                expected: FIELD_COUNT,
                found: 1
            })
        );
    }

    #[test]
    fn test_parse_epoch() {
        let ts = parse_epoch("1700000000.000001").unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 1_000);
        let ts = parse_epoch("1700000000.1234567891234").unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_789);
        assert!(parse_epoch("").is_none());
        assert!(parse_epoch("1.2e3").is_none());
        assert!(parse_epoch("abc.5").is_none());
    }
}
