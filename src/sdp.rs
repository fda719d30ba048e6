//! Service Discovery Protocol: data elements, the ServiceSearchAttribute
//! transaction and extraction of RFCOMM channels from service records.
//!
//! Only the client side of a single transaction type is implemented. The
//! socket that carries the PDUs lives in `bluetooth.rs`; everything here is
//! pure byte handling.

use std::fmt;

use log::{debug, trace};
use serde::Serialize;

use crate::errors::{BluetoothError, Result};

// ============================================================================
// Constants
// ============================================================================

pub const PDU_ERROR_RESPONSE: u8 = 0x01;
pub const PDU_SERVICE_SEARCH_ATTR_REQUEST: u8 = 0x06;
pub const PDU_SERVICE_SEARCH_ATTR_RESPONSE: u8 = 0x07;

pub const ATTR_SERVICE_RECORD_HANDLE: u16 = 0x0000;
pub const ATTR_SERVICE_CLASS_ID_LIST: u16 = 0x0001;
pub const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
/// ServiceName at the primary language base (0x0100).
pub const ATTR_SERVICE_NAME: u16 = 0x0100;

pub const UUID_RFCOMM: u16 = 0x0003;
pub const UUID_L2CAP: u16 = 0x0100;
pub const UUID_SERIAL_PORT: u16 = 0x1101;

/// Largest attribute byte count we ask the server for per response.
pub const MAX_ATTRIBUTE_BYTES: u16 = 0xFFFF;
const MAX_CONTINUATION: usize = 16;
const MAX_ROUNDS: usize = 64;
const MAX_DEPTH: usize = 16;

const PDU_HEADER_LEN: usize = 5;

/// Bluetooth base UUID, 0000xxxx-0000-1000-8000-00805F9B34FB.
const BASE_UUID_TAIL: [u8; 12] = [
    0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

fn sdp_err(msg: impl Into<String>) -> crate::errors::TransportError {
    BluetoothError::Sdp(msg.into()).into()
}

// ============================================================================
// Data elements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Uuid {
    Short(u16),
    Medium(u32),
    Long([u8; 16]),
}

impl Uuid {
    /// The 16-bit alias, if this UUID lies on the Bluetooth base UUID.
    pub fn as_u16(&self) -> Option<u16> {
        match *self {
            Uuid::Short(v) => Some(v),
            Uuid::Medium(v) => u16::try_from(v).ok(),
            Uuid::Long(b) => {
                if b[..2] == [0, 0] && b[4..] == BASE_UUID_TAIL {
                    Some(u16::from_be_bytes([b[2], b[3]]))
                } else {
                    None
                }
            }
        }
    }

    pub fn is(&self, short: u16) -> bool {
        self.as_u16() == Some(short)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uuid::Short(v) => write!(f, "0x{v:04X}"),
            Uuid::Medium(v) => write!(f, "0x{v:08X}"),
            Uuid::Long(b) => {
                for (i, byte) in b.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        f.write_str("-")?;
                    }
                    write!(f, "{byte:02X}")?;
                }
                Ok(())
            }
        }
    }
}

/// A decoded SDP data element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataElement {
    Nil,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    U128(u128),
    Int(i64),
    Uuid(Uuid),
    Text(String),
    Bool(bool),
    Sequence(Vec<DataElement>),
    Alternative(Vec<DataElement>),
    Url(String),
}

impl DataElement {
    pub fn as_uint(&self) -> Option<u64> {
        match *self {
            DataElement::U8(v) => Some(v.into()),
            DataElement::U16(v) => Some(v.into()),
            DataElement::U32(v) => Some(v.into()),
            DataElement::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            DataElement::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataElement::Text(s) => Some(s.trim_end_matches('\0')),
            _ => None,
        }
    }

    /// Members of a sequence or alternative.
    pub fn items(&self) -> Option<&[DataElement]> {
        match self {
            DataElement::Sequence(v) | DataElement::Alternative(v) => Some(v),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            DataElement::Nil => out.push(0x00),
            DataElement::U8(v) => {
                out.push(type_byte(1, 0));
                out.push(*v);
            }
            DataElement::U16(v) => {
                out.push(type_byte(1, 1));
                out.extend_from_slice(&v.to_be_bytes());
            }
            DataElement::U32(v) => {
                out.push(type_byte(1, 2));
                out.extend_from_slice(&v.to_be_bytes());
            }
            DataElement::U64(v) => {
                out.push(type_byte(1, 3));
                out.extend_from_slice(&v.to_be_bytes());
            }
            DataElement::U128(v) => {
                out.push(type_byte(1, 4));
                out.extend_from_slice(&v.to_be_bytes());
            }
            DataElement::Int(v) => {
                out.push(type_byte(2, 3));
                out.extend_from_slice(&v.to_be_bytes());
            }
            DataElement::Uuid(Uuid::Short(v)) => {
                out.push(type_byte(3, 1));
                out.extend_from_slice(&v.to_be_bytes());
            }
            DataElement::Uuid(Uuid::Medium(v)) => {
                out.push(type_byte(3, 2));
                out.extend_from_slice(&v.to_be_bytes());
            }
            DataElement::Uuid(Uuid::Long(b)) => {
                out.push(type_byte(3, 4));
                out.extend_from_slice(b);
            }
            DataElement::Bool(v) => {
                out.push(type_byte(5, 0));
                out.push(u8::from(*v));
            }
            DataElement::Text(s) => encode_variable(4, s.as_bytes(), out),
            DataElement::Url(s) => encode_variable(8, s.as_bytes(), out),
            DataElement::Sequence(items) | DataElement::Alternative(items) => {
                let mut body = Vec::new();
                for item in items {
                    item.encode(&mut body);
                }
                let kind = if matches!(self, DataElement::Sequence(_)) { 6 } else { 7 };
                encode_variable(kind, &body, out);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Parse one element from the front of `bytes`, returning it and the
    /// number of bytes it occupied.
    pub fn parse(bytes: &[u8]) -> Result<(DataElement, usize)> {
        parse_element(bytes, 0)
    }
}

fn type_byte(kind: u8, size_index: u8) -> u8 {
    (kind << 3) | size_index
}

fn encode_variable(kind: u8, body: &[u8], out: &mut Vec<u8>) {
    if let Ok(len) = u8::try_from(body.len()) {
        out.push(type_byte(kind, 5));
        out.push(len);
    } else if let Ok(len) = u16::try_from(body.len()) {
        out.push(type_byte(kind, 6));
        out.extend_from_slice(&len.to_be_bytes());
    } else {
        out.push(type_byte(kind, 7));
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(body);
}

fn take(bytes: &[u8], at: usize, len: usize) -> Result<&[u8]> {
    bytes
        .get(at..at + len)
        .ok_or_else(|| sdp_err(format!("data element truncated at offset {at} (need {len})")))
}

fn parse_element(bytes: &[u8], depth: usize) -> Result<(DataElement, usize)> {
    if depth > MAX_DEPTH {
        return Err(sdp_err("data element nesting too deep"));
    }
    let descriptor = *bytes.first().ok_or_else(|| sdp_err("empty data element"))?;
    let kind = descriptor >> 3;
    let size_index = descriptor & 0x07;

    // Fixed sizes for indices 0..=4, length prefix for 5..=7.
    let (header_len, body_len) = match size_index {
        0 if kind == 0 => (1, 0),
        0..=4 => (1, 1usize << size_index),
        5 => (2, take(bytes, 1, 1)?[0] as usize),
        6 => {
            let b = take(bytes, 1, 2)?;
            (3, u16::from_be_bytes([b[0], b[1]]) as usize)
        }
        _ => {
            let b = take(bytes, 1, 4)?;
            (5, u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
        }
    };
    let body = take(bytes, header_len, body_len)?;
    let consumed = header_len + body_len;

    let element = match (kind, size_index) {
        (0, _) => DataElement::Nil,
        (1, 0) => DataElement::U8(body[0]),
        (1, 1) => DataElement::U16(u16::from_be_bytes([body[0], body[1]])),
        (1, 2) => DataElement::U32(u32::from_be_bytes([body[0], body[1], body[2], body[3]])),
        (1, 3) => DataElement::U64(u64::from_be_bytes(fixed(body))),
        (1, 4) => DataElement::U128(u128::from_be_bytes(fixed(body))),
        (2, 0) => DataElement::Int((body[0] as i8).into()),
        (2, 1) => DataElement::Int(i16::from_be_bytes([body[0], body[1]]).into()),
        (2, 2) => {
            DataElement::Int(i32::from_be_bytes([body[0], body[1], body[2], body[3]]).into())
        }
        (2, 3) => DataElement::Int(i64::from_be_bytes(fixed(body))),
        (3, 1) => DataElement::Uuid(Uuid::Short(u16::from_be_bytes([body[0], body[1]]))),
        (3, 2) => DataElement::Uuid(Uuid::Medium(u32::from_be_bytes([
            body[0], body[1], body[2], body[3],
        ]))),
        (3, 4) => DataElement::Uuid(Uuid::Long(fixed(body))),
        (4, 5..=7) => DataElement::Text(String::from_utf8_lossy(body).into_owned()),
        (5, 0) => DataElement::Bool(body[0] != 0),
        (6, 5..=7) | (7, 5..=7) => {
            let mut items = Vec::new();
            let mut at = 0;
            while at < body.len() {
                let (item, used) = parse_element(&body[at..], depth + 1)?;
                items.push(item);
                at += used;
            }
            if kind == 6 {
                DataElement::Sequence(items)
            } else {
                DataElement::Alternative(items)
            }
        }
        (8, 5..=7) => DataElement::Url(String::from_utf8_lossy(body).into_owned()),
        _ => {
            return Err(sdp_err(format!(
                "unsupported data element descriptor {descriptor:#04X}"
            )))
        }
    };
    Ok((element, consumed))
}

fn fixed<const N: usize>(body: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&body[..N]);
    out
}

// ============================================================================
// PDUs
// ============================================================================

/// Build a ServiceSearchAttributeRequest for every record mentioning `uuid`,
/// asking for the full attribute range.
pub fn search_attributes_request(transaction: u16, uuid: u16, continuation: &[u8]) -> Vec<u8> {
    let pattern = DataElement::Sequence(vec![DataElement::Uuid(Uuid::Short(uuid))]);
    let attributes = DataElement::Sequence(vec![DataElement::U32(0x0000_FFFF)]);

    let mut params = pattern.to_bytes();
    params.extend_from_slice(&MAX_ATTRIBUTE_BYTES.to_be_bytes());
    attributes.encode(&mut params);
    params.push(continuation.len() as u8);
    params.extend_from_slice(continuation);

    let mut pdu = Vec::with_capacity(PDU_HEADER_LEN + params.len());
    pdu.push(PDU_SERVICE_SEARCH_ATTR_REQUEST);
    pdu.extend_from_slice(&transaction.to_be_bytes());
    pdu.extend_from_slice(&(params.len() as u16).to_be_bytes());
    pdu.extend_from_slice(&params);
    pdu
}

/// One response PDU: a slice of the attribute lists plus the continuation
/// state to send back (empty when the transfer is complete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeChunk {
    pub bytes: Vec<u8>,
    pub continuation: Vec<u8>,
}

pub fn parse_search_attributes_response(pdu: &[u8], transaction: u16) -> Result<AttributeChunk> {
    let header = take(pdu, 0, PDU_HEADER_LEN)?;
    let pdu_id = header[0];
    let tid = u16::from_be_bytes([header[1], header[2]]);
    let param_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let params = take(pdu, PDU_HEADER_LEN, param_len)?;

    if tid != transaction {
        return Err(sdp_err(format!(
            "transaction id mismatch: sent {transaction:#06X}, got {tid:#06X}"
        )));
    }

    match pdu_id {
        PDU_SERVICE_SEARCH_ATTR_RESPONSE => {}
        PDU_ERROR_RESPONSE => {
            let code = take(params, 0, 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .unwrap_or(0);
            return Err(sdp_err(format!("server returned error code {code:#06X}")));
        }
        other => return Err(sdp_err(format!("unexpected PDU id {other:#04X}"))),
    }

    let count_bytes = take(params, 0, 2)?;
    let count = u16::from_be_bytes([count_bytes[0], count_bytes[1]]) as usize;
    let bytes = take(params, 2, count)?.to_vec();
    let cont_len = take(params, 2 + count, 1)?[0] as usize;
    if cont_len > MAX_CONTINUATION {
        return Err(sdp_err(format!("continuation state too long ({cont_len} bytes)")));
    }
    let continuation = take(params, 3 + count, cont_len)?.to_vec();
    Ok(AttributeChunk {
        bytes,
        continuation,
    })
}

/// Run a complete ServiceSearchAttribute transaction for `uuid`.
///
/// `exchange` sends one request PDU and returns the matching response PDU.
/// Continuation requests are issued until the server reports completion.
pub fn search_attributes<F>(uuid: u16, mut exchange: F) -> Result<Vec<ServiceRecord>>
where
    F: FnMut(&[u8]) -> Result<Vec<u8>>,
{
    let mut lists = Vec::new();
    let mut continuation = Vec::new();
    let mut transaction: u16 = 1;

    for round in 0..MAX_ROUNDS {
        let request = search_attributes_request(transaction, uuid, &continuation);
        trace!("SDP TX: {:02X?}", request);
        let response = exchange(&request)?;
        trace!("SDP RX: {:02X?}", response);
        let chunk = parse_search_attributes_response(&response, transaction)?;
        lists.extend_from_slice(&chunk.bytes);
        if chunk.continuation.is_empty() {
            debug!(
                "SDP transfer complete: {} bytes in {} round(s)",
                lists.len(),
                round + 1
            );
            return parse_attribute_lists(&lists);
        }
        continuation = chunk.continuation;
        transaction = transaction.wrapping_add(1);
    }
    Err(sdp_err(format!("no end of continuation after {MAX_ROUNDS} rounds")))
}

// ============================================================================
// Service records
// ============================================================================

/// The parts of a service record that channel selection cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub handle: Option<u32>,
    pub name: Option<String>,
    pub rfcomm_channel: Option<u8>,
    pub service_classes: Vec<Uuid>,
}

impl ServiceRecord {
    pub fn is_serial_port(&self) -> bool {
        self.service_classes.iter().any(|u| u.is(UUID_SERIAL_PORT))
    }

    /// Build from an attribute list: a sequence of (u16 id, value) pairs.
    pub fn from_attribute_list(list: &DataElement) -> Result<Self> {
        let items = list
            .items()
            .ok_or_else(|| sdp_err("attribute list is not a sequence"))?;
        if items.len() % 2 != 0 {
            return Err(sdp_err("attribute list has an odd number of elements"));
        }

        let mut record = ServiceRecord::default();
        for pair in items.chunks_exact(2) {
            let Some(id) = pair[0].as_uint() else {
                return Err(sdp_err("attribute id is not an unsigned integer"));
            };
            let value = &pair[1];
            match id as u16 {
                ATTR_SERVICE_RECORD_HANDLE => {
                    record.handle = value.as_uint().map(|h| h as u32);
                }
                ATTR_SERVICE_CLASS_ID_LIST => {
                    record.service_classes = value
                        .items()
                        .unwrap_or_default()
                        .iter()
                        .filter_map(DataElement::as_uuid)
                        .collect();
                }
                ATTR_PROTOCOL_DESCRIPTOR_LIST => {
                    record.rfcomm_channel = rfcomm_channel(value);
                }
                ATTR_SERVICE_NAME => {
                    record.name = value.as_text().map(str::to_string);
                }
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Find the RFCOMM entry in a ProtocolDescriptorList. Alternatives of
/// descriptor lists are searched in order.
fn rfcomm_channel(list: &DataElement) -> Option<u8> {
    let entries = list.items()?;
    if matches!(list, DataElement::Alternative(_)) {
        return entries.iter().find_map(rfcomm_channel);
    }
    entries.iter().find_map(|descriptor| {
        let parts = descriptor.items()?;
        if !parts.first()?.as_uuid()?.is(UUID_RFCOMM) {
            return None;
        }
        parts.get(1)?.as_uint().and_then(|c| u8::try_from(c).ok())
    })
}

/// Parse the reassembled AttributeLists: a sequence of attribute lists.
pub fn parse_attribute_lists(bytes: &[u8]) -> Result<Vec<ServiceRecord>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let (element, _) = DataElement::parse(bytes)?;
    let lists = element
        .items()
        .ok_or_else(|| sdp_err("attribute lists are not a sequence"))?;
    lists.iter().map(ServiceRecord::from_attribute_list).collect()
}
