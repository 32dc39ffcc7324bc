//! Common constants used mostly by the `ingest` module

/// Fields requested from the decoder, in output column order. The parser
/// addresses columns by the `FIELD_*` indices below.
pub const DECODER_FIELDS: [&str; 18] = [
    "frame.number",
    "frame.time_epoch",
    "frame.len",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "ip.proto",
    "ipv6.nxt",
    "tcp.srcport",
    "tcp.dstport",
    "udp.srcport",
    "udp.dstport",
    "_ws.col.Protocol",
    "tcp.flags",
    "dns.qry.name",
    "http.host",
    "tls.handshake.extensions_server_name",
];
pub const FIELD_COUNT: usize = DECODER_FIELDS.len();

pub const FIELD_FRAME_NUMBER: usize = 0;
pub const FIELD_TIME_EPOCH: usize = 1;
pub const FIELD_FRAME_LEN: usize = 2;
pub const FIELD_IP_SRC: usize = 3;
pub const FIELD_IP_DST: usize = 4;
pub const FIELD_IPV6_SRC: usize = 5;
pub const FIELD_IPV6_DST: usize = 6;
pub const FIELD_IP_PROTO: usize = 7;
pub const FIELD_IPV6_NXT: usize = 8;
pub const FIELD_TCP_SRCPORT: usize = 9;
pub const FIELD_TCP_DSTPORT: usize = 10;
pub const FIELD_UDP_SRCPORT: usize = 11;
pub const FIELD_UDP_DSTPORT: usize = 12;
pub const FIELD_PROTOCOL: usize = 13;
pub const FIELD_TCP_FLAGS: usize = 14;
pub const FIELD_DNS_QUERY: usize = 15;
pub const FIELD_HTTP_HOST: usize = 16;
pub const FIELD_TLS_SNI: usize = 17;

pub const FIELD_DELIMITER: u8 = b'\t';

pub const DEFAULT_SINGLE_CHUNK_BELOW: u64 = 100 * 1024 * 1024;
pub const DEFAULT_TWO_CHUNKS_BELOW: u64 = 300 * 1024 * 1024;
pub const DEFAULT_FOUR_CHUNKS_BELOW: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS: usize = 16;

/// Bytes of decoder stderr kept for diagnostics.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Initial capacity of the reused decoder line buffer.
pub const LINE_BUFFER_CAPACITY: usize = 1024;

pub const PLACEHOLDER_INPUT: &str = "{input}";
pub const PLACEHOLDER_OUTPUT: &str = "{output}";
pub const PLACEHOLDER_RECORDS: &str = "{records}";
pub const PLACEHOLDER_FIELDS: &str = "{fields}";
