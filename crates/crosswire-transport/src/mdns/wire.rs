//! DNS packet layout for the mDNS transport.
//!
//! A message is base64url-encoded and cut into label-sized chunks. Chunk
//! `n` of message `id` becomes the service instance
//! `<id[..6]>-<n:03>-<chunk>._crosswire._udp.local.` with a PTR record from
//! the service name and a TXT record carrying `total=<N>` and `msg=<id>`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query};
use hickory_resolver::proto::rr::rdata::{PTR, TXT};
use hickory_resolver::proto::rr::{Name, RData, Record, RecordType};

use crosswire_shared::constants::PROTOCOL_VERSION;

use crate::error::{Result, TransportError};
use crate::transport::{ServiceInfo, TransportMessage};

pub const SERVICE_LABELS: [&str; 3] = ["_crosswire", "_udp", "local"];
/// Maximum base64 characters per instance label.
pub const MAX_CHUNK_CHARS: usize = 50;
/// TTL advertised on chunk records; matches the force-expiry timer.
pub const RECORD_TTL: u32 = 5;
/// TTL for the server's own discovery instance.
pub const SERVER_RECORD_TTL: u32 = 120;
pub const SERVER_INSTANCE_PREFIX: &str = "server-";
const ID_PREFIX_LEN: usize = 6;

pub fn service_name() -> Result<Name> {
    Ok(Name::from_ascii("_crosswire._udp.local.")?)
}

fn instance_name(label: &str) -> Result<Name> {
    let mut labels: Vec<&[u8]> = vec![label.as_bytes()];
    labels.extend(SERVICE_LABELS.iter().map(|l| l.as_bytes()));
    Ok(Name::from_labels(labels)?)
}

/// First label of `name` if it is a direct child of the service name.
pub fn instance_of(name: &Name) -> Option<String> {
    let labels: Vec<&[u8]> = name.iter().collect();
    if labels.len() != SERVICE_LABELS.len() + 1 {
        return None;
    }
    let matches = labels[1..]
        .iter()
        .zip(SERVICE_LABELS.iter())
        .all(|(got, want)| got.eq_ignore_ascii_case(want.as_bytes()));
    if !matches {
        return None;
    }
    String::from_utf8(labels[0].to_vec()).ok()
}

// ---------------------------------------------------------------------------
// Chunk naming
// ---------------------------------------------------------------------------

pub fn instance_label(msg_id: &str, seq: usize, chunk: &str) -> String {
    let prefix: String = msg_id.chars().take(ID_PREFIX_LEN).collect();
    format!("{prefix}-{seq:03}-{chunk}")
}

/// Split `<prefix>-<seq>-<chunk>`. The chunk itself may contain `-`.
pub fn parse_instance_label(label: &str) -> Option<(&str, usize, &str)> {
    let mut parts = label.splitn(3, '-');
    let prefix = parts.next()?;
    let seq = parts.next()?.parse().ok()?;
    let chunk = parts.next()?;
    if prefix.is_empty() || chunk.is_empty() {
        return None;
    }
    Some((prefix, seq, chunk))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub msg_id: String,
    pub seq: usize,
    pub total: usize,
    pub chunk: String,
}

impl ChunkRecord {
    pub fn label(&self) -> String {
        instance_label(&self.msg_id, self.seq, &self.chunk)
    }

    /// PTR (service → instance) and TXT (`total`, `msg`) records.
    pub fn to_records(&self) -> Result<Vec<Record>> {
        let instance = instance_name(&self.label())?;
        let txt = TXT::new(vec![
            format!("total={}", self.total),
            format!("msg={}", self.msg_id),
        ]);
        Ok(vec![
            Record::from_rdata(service_name()?, RECORD_TTL, RData::PTR(PTR(instance.clone()))),
            Record::from_rdata(instance, RECORD_TTL, RData::TXT(txt)),
        ])
    }
}

/// Serialize and cut a message into chunk records.
pub fn chunk_message(msg: &TransportMessage) -> Result<Vec<ChunkRecord>> {
    let encoded = URL_SAFE_NO_PAD.encode(msg.to_bytes()?);
    let chunks: Vec<&str> = if encoded.is_empty() {
        vec![""]
    } else {
        encoded
            .as_bytes()
            .chunks(MAX_CHUNK_CHARS)
            // base64url output is ASCII, so byte chunks are char chunks.
            .map(|c| std::str::from_utf8(c).unwrap_or_default())
            .collect()
    };

    let total = chunks.len();
    if total > 9_999 {
        return Err(TransportError::Codec(format!(
            "message too large for mDNS: {total} chunks"
        )));
    }

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(seq, chunk)| ChunkRecord {
            msg_id: msg.id.clone(),
            seq,
            total,
            chunk: chunk.to_string(),
        })
        .collect())
}

/// Inverse of the base64 step of [`chunk_message`].
pub fn decode_message(joined: &[u8]) -> Result<TransportMessage> {
    let raw = URL_SAFE_NO_PAD
        .decode(joined)
        .map_err(|e| TransportError::Codec(format!("bad base64 payload: {e}")))?;
    TransportMessage::from_bytes(&raw)
}

// ---------------------------------------------------------------------------
// Server discovery record
// ---------------------------------------------------------------------------

pub fn server_records(info: &ServiceInfo) -> Result<Vec<Record>> {
    let hash = info.channel_hash8();
    let instance = instance_name(&format!("{SERVER_INSTANCE_PREFIX}{hash}"))?;
    let txt = TXT::new(vec![
        format!("channel={hash}"),
        format!("version={PROTOCOL_VERSION}"),
        format!("port={}", info.port),
    ]);
    Ok(vec![
        Record::from_rdata(
            service_name()?,
            SERVER_RECORD_TTL,
            RData::PTR(PTR(instance.clone())),
        ),
        Record::from_rdata(instance, SERVER_RECORD_TTL, RData::TXT(txt)),
    ])
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

pub fn response_packet(records: Vec<Record>) -> Result<Vec<u8>> {
    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true);
    for record in records {
        message.add_answer(record);
    }
    Ok(message.to_vec()?)
}

pub fn query_packet() -> Result<Vec<u8>> {
    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query);
    message.add_query(Query::query(service_name()?, RecordType::PTR));
    Ok(message.to_vec()?)
}

/// Something of interest found in a received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Chunk(ChunkRecord),
    Server {
        instance: String,
        channel_hash: String,
        version: u8,
        port: u16,
    },
}

#[derive(Debug, Default)]
pub struct Parsed {
    /// The packet asks for our service.
    pub is_service_query: bool,
    pub observed: Vec<Observed>,
}

fn txt_pairs(txt: &TXT) -> Vec<(String, String)> {
    txt.txt_data()
        .iter()
        .filter_map(|entry| {
            let entry = std::str::from_utf8(entry).ok()?;
            let (k, v) = entry.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

pub fn parse_packet(bytes: &[u8]) -> Result<Parsed> {
    let message = Message::from_vec(bytes)?;
    let mut parsed = Parsed::default();

    if message.message_type() == MessageType::Query {
        parsed.is_service_query = message.queries().iter().any(|q| {
            matches!(q.query_type(), RecordType::PTR | RecordType::ANY)
                && instance_of_service(q.name())
        });
        return Ok(parsed);
    }

    for record in message.answers().iter().chain(message.additionals()) {
        let Some(RData::TXT(txt)) = record.data() else {
            continue;
        };
        let Some(label) = instance_of(record.name()) else {
            continue;
        };
        let pairs = txt_pairs(txt);

        if let Some(hash) = label.strip_prefix(SERVER_INSTANCE_PREFIX) {
            parsed.observed.push(Observed::Server {
                instance: label.clone(),
                channel_hash: lookup(&pairs, "channel").unwrap_or(hash).to_string(),
                version: lookup(&pairs, "version")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(PROTOCOL_VERSION),
                port: lookup(&pairs, "port")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            });
            continue;
        }

        let Some((prefix, seq, chunk)) = parse_instance_label(&label) else {
            continue;
        };
        let (Some(total), Some(msg_id)) = (
            lookup(&pairs, "total").and_then(|v| v.parse::<usize>().ok()),
            lookup(&pairs, "msg"),
        ) else {
            continue;
        };
        if !msg_id.starts_with(prefix) || seq >= total {
            continue;
        }

        parsed.observed.push(Observed::Chunk(ChunkRecord {
            msg_id: msg_id.to_string(),
            seq,
            total,
            chunk: chunk.to_string(),
        }));
    }

    Ok(parsed)
}

/// `true` if `name` is the bare service name.
fn instance_of_service(name: &Name) -> bool {
    let labels: Vec<&[u8]> = name.iter().collect();
    labels.len() == SERVICE_LABELS.len()
        && labels
            .iter()
            .zip(SERVICE_LABELS.iter())
            .all(|(got, want)| got.eq_ignore_ascii_case(want.as_bytes()))
}
