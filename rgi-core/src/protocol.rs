//! FastCGI wire format: record framing and the name-value pair codec.
//!
//! Everything here is pure byte manipulation; connection handling lives in
//! [`crate::connection`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

// Record types.
pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_DATA: u8 = 8;
pub const FCGI_GET_VALUES: u8 = 9;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

// Roles.
pub const FCGI_RESPONDER: u16 = 1;
pub const FCGI_AUTHORIZER: u16 = 2;
pub const FCGI_FILTER: u16 = 3;

// Protocol status codes carried in END_REQUEST.
pub const FCGI_REQUEST_COMPLETE: u8 = 0;
pub const FCGI_CANT_MPX_CONN: u8 = 1;
pub const FCGI_OVERLOADED: u8 = 2;
pub const FCGI_UNKNOWN_ROLE: u8 = 3;

// Flags byte of BEGIN_REQUEST.
pub const FCGI_KEEP_CONN: u8 = 1;

// Variable names understood by GET_VALUES.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

// Protocol version.
const FCGI_VERSION_1: u8 = 1;

/// Largest content payload a single record can carry.
pub const MAX_CONTENT_LEN: usize = 65_535;

/// Fixed 8-byte FastCGI record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2] = (self.request_id >> 8) as u8;
        buf[3] = (self.request_id & 0xff) as u8;
        buf[4] = (self.content_length >> 8) as u8;
        buf[5] = (self.content_length & 0xff) as u8;
        buf[6] = self.padding_length;
        buf[7] = 0; // reserved
        buf
    }

    pub fn decode(buf: &[u8; 8]) -> Self {
        Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }
    }
}

/// A complete FastCGI record (header + content, padding stripped).
#[derive(Debug, Clone)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Bytes,
}

impl Record {
    pub fn record_type(&self) -> u8 {
        self.header.record_type
    }

    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }
}

/// Padding that brings `8 + content_len` to a multiple of 8 on the wire.
pub fn padding_for(content_len: usize) -> usize {
    (8 - (content_len % 8)) % 8
}

/// Try to extract one record from the head of the inbound buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full record
/// (header, content, and padding). Consumed bytes are removed from the
/// buffer head.
pub fn decode_record(buf: &mut BytesMut) -> Result<Option<Record>, ProtocolError> {
    if buf.len() < RecordHeader::SIZE {
        return Ok(None);
    }
    let mut hdr = [0u8; 8];
    hdr.copy_from_slice(&buf[..RecordHeader::SIZE]);
    let header = RecordHeader::decode(&hdr);

    if header.version != FCGI_VERSION_1 {
        return Err(ProtocolError::MalformedRecord(format!(
            "unsupported version {} (expected {})",
            header.version, FCGI_VERSION_1
        )));
    }

    let content_len = header.content_length as usize;
    let padding_len = header.padding_length as usize;
    if buf.len() < RecordHeader::SIZE + content_len + padding_len {
        return Ok(None);
    }

    buf.advance(RecordHeader::SIZE);
    let content = buf.split_to(content_len).freeze();
    buf.advance(padding_len);

    Ok(Some(Record { header, content }))
}

/// Encode one record (header + content + zero padding) into `buf`.
///
/// `content` must fit a single record; stream chunking is the caller's job.
pub fn encode_record(buf: &mut BytesMut, record_type: u8, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = padding_for(content.len());
    let header = RecordHeader {
        version: FCGI_VERSION_1,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: padding as u8,
    };
    buf.reserve(RecordHeader::SIZE + content.len() + padding);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(content);
    buf.put_bytes(0, padding);
}

/// Write one record to an async writer.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    record_type: u8,
    request_id: u16,
    content: &[u8],
) -> std::io::Result<()> {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = padding_for(content.len());
    let header = RecordHeader {
        version: FCGI_VERSION_1,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: padding as u8,
    };
    writer.write_all(&header.encode()).await?;
    if !content.is_empty() {
        writer.write_all(content).await?;
    }
    if padding > 0 {
        const PAD: [u8; 8] = [0u8; 8];
        writer.write_all(&PAD[..padding]).await?;
    }
    Ok(())
}

/// Write an END_REQUEST record.
pub async fn write_end_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: u16,
    app_status: u32,
    protocol_status: u8,
) -> std::io::Result<()> {
    let body = EndRequestBody {
        app_status,
        protocol_status,
    }
    .encode();
    write_record(writer, FCGI_END_REQUEST, request_id, &body).await
}

/// Body of a BEGIN_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequestBody {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequestBody {
    pub fn keep_conn(&self) -> bool {
        (self.flags & FCGI_KEEP_CONN) != 0
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[0] = (self.role >> 8) as u8;
        body[1] = (self.role & 0xff) as u8;
        body[2] = self.flags;
        body
    }

    pub fn decode(content: &[u8]) -> Result<Self, ProtocolError> {
        if content.len() < 3 {
            return Err(ProtocolError::MalformedRecord(
                "BEGIN_REQUEST body too short".into(),
            ));
        }
        Ok(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }
}

/// Body of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequestBody {
    pub app_status: u32,
    pub protocol_status: u8,
}

impl EndRequestBody {
    pub fn encode(&self) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        body[4] = self.protocol_status;
        body
    }

    pub fn decode(content: &[u8]) -> Result<Self, ProtocolError> {
        if content.len() < 5 {
            return Err(ProtocolError::MalformedRecord(
                "END_REQUEST body too short".into(),
            ));
        }
        Ok(Self {
            app_status: u32::from_be_bytes([content[0], content[1], content[2], content[3]]),
            protocol_status: content[4],
        })
    }
}

/// Encode a name-value pair into the buffer.
///
/// Lengths below 128 take one byte; longer ones take four bytes big-endian
/// with the top bit set.
pub fn encode_pair(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    fn write_len(buf: &mut BytesMut, len: usize) {
        if len < 128 {
            buf.put_u8(len as u8);
        } else {
            buf.put_u32((len as u32) | 0x8000_0000);
        }
    }
    write_len(buf, name.len());
    write_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

/// Decode all name-value pairs from a PARAMS content buffer, in order.
pub fn decode_pairs(mut data: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut pairs = Vec::new();
    while !data.is_empty() {
        let name_len = read_pair_len(&mut data)?;
        let value_len = read_pair_len(&mut data)?;
        if data.len() < name_len + value_len {
            return Err(ProtocolError::MalformedParams(
                "truncated name-value pair".into(),
            ));
        }
        let name = std::str::from_utf8(&data[..name_len])
            .map_err(|_| ProtocolError::MalformedParams("name is not UTF-8".into()))?;
        let value = std::str::from_utf8(&data[name_len..name_len + value_len])
            .map_err(|_| ProtocolError::MalformedParams("value is not UTF-8".into()))?;
        pairs.push((name.to_string(), value.to_string()));
        data = &data[name_len + value_len..];
    }
    Ok(pairs)
}

fn read_pair_len(data: &mut &[u8]) -> Result<usize, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::MalformedParams(
            "unexpected end of name-value data".into(),
        ));
    }
    let first = data[0];
    if first < 128 {
        *data = &data[1..];
        Ok(first as usize)
    } else {
        if data.len() < 4 {
            return Err(ProtocolError::MalformedParams(
                "truncated 4-byte length".into(),
            ));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        *data = &data[4..];
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record_type: u8, request_id: u16, content: &[u8]) -> Record {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, record_type, request_id, content);
        // Total on-wire length is header + content + padding to 8.
        assert_eq!(
            buf.len(),
            RecordHeader::SIZE + content.len() + padding_for(content.len())
        );
        let rec = decode_record(&mut buf).unwrap().expect("full record");
        assert!(buf.is_empty(), "decoder must consume padding");
        rec
    }

    #[test]
    fn record_roundtrip() {
        let rec = roundtrip(FCGI_STDOUT, 42, b"hello world");
        assert_eq!(rec.record_type(), FCGI_STDOUT);
        assert_eq!(rec.request_id(), 42);
        assert_eq!(&rec.content[..], b"hello world");
    }

    #[test]
    fn record_padding_boundaries() {
        // content length -> padding: 0 -> 0, 1 -> 7, 8 -> 0, 65535 -> 1
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 7);
        assert_eq!(padding_for(8), 0);
        assert_eq!(padding_for(65_535), 1);

        roundtrip(FCGI_STDOUT, 1, &[]);
        roundtrip(FCGI_STDOUT, 1, &[0x42]);
        roundtrip(FCGI_STDOUT, 1, &[0u8; 8]);
        let big = vec![0xabu8; MAX_CONTENT_LEN];
        let rec = roundtrip(FCGI_STDOUT, 1, &big);
        assert_eq!(rec.content.len(), MAX_CONTENT_LEN);
    }

    #[test]
    fn decode_needs_more_bytes() {
        let mut full = BytesMut::new();
        encode_record(&mut full, FCGI_PARAMS, 7, b"abcdef");
        let full = full.freeze();

        // Any strict prefix must yield None and leave the buffer untouched.
        for cut in [0, 3, 7, 8, 10, full.len() - 1] {
            let mut buf = BytesMut::from(&full[..cut]);
            assert!(decode_record(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, FCGI_STDIN, 1, b"x");
        buf[0] = 9;
        assert!(matches!(
            decode_record(&mut buf),
            Err(ProtocolError::MalformedRecord(_))
        ));
    }

    #[test]
    fn decode_two_records_from_one_buffer() {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, FCGI_PARAMS, 1, b"first");
        encode_record(&mut buf, FCGI_STDIN, 2, b"second!!");
        let a = decode_record(&mut buf).unwrap().unwrap();
        let b = decode_record(&mut buf).unwrap().unwrap();
        assert_eq!((a.record_type(), a.request_id()), (FCGI_PARAMS, 1));
        assert_eq!((b.record_type(), b.request_id()), (FCGI_STDIN, 2));
        assert!(decode_record(&mut buf).unwrap().is_none());
    }

    #[test]
    fn begin_request_body_roundtrip() {
        let body = BeginRequestBody {
            role: FCGI_RESPONDER,
            flags: FCGI_KEEP_CONN,
        };
        let decoded = BeginRequestBody::decode(&body.encode()).unwrap();
        assert_eq!(decoded, body);
        assert!(decoded.keep_conn());

        let no_keep = BeginRequestBody {
            role: FCGI_AUTHORIZER,
            flags: 0,
        };
        assert!(!BeginRequestBody::decode(&no_keep.encode()).unwrap().keep_conn());
        assert!(BeginRequestBody::decode(&[0, 1]).is_err());
    }

    #[test]
    fn end_request_body_roundtrip() {
        let body = EndRequestBody {
            app_status: 1,
            protocol_status: FCGI_UNKNOWN_ROLE,
        };
        assert_eq!(EndRequestBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn pair_roundtrip() {
        let mut buf = BytesMut::new();
        encode_pair(&mut buf, b"REQUEST_METHOD", b"GET");
        encode_pair(&mut buf, b"QUERY_STRING", b"");
        let pairs = decode_pairs(&buf).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("REQUEST_METHOD".to_string(), "GET".to_string()),
                ("QUERY_STRING".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn pair_length_encoding_boundary() {
        // 127 uses the short form, 128 the long form; both round-trip.
        for len in [127usize, 128, 300] {
            let value = "v".repeat(len);
            let mut buf = BytesMut::new();
            encode_pair(&mut buf, b"K", value.as_bytes());
            let expected_len_bytes = if len < 128 { 1 } else { 4 };
            assert_eq!(buf.len(), 1 + expected_len_bytes + 1 + len);
            let pairs = decode_pairs(&buf).unwrap();
            assert_eq!(pairs, vec![("K".to_string(), value)]);
        }
    }

    #[test]
    fn pair_decode_rejects_truncation() {
        let mut buf = BytesMut::new();
        encode_pair(&mut buf, b"NAME", b"VALUE");
        let cut = &buf[..buf.len() - 2];
        assert!(matches!(
            decode_pairs(cut),
            Err(ProtocolError::MalformedParams(_))
        ));

        // A long-form length with fewer than four bytes available.
        assert!(matches!(
            decode_pairs(&[0x80, 0x00]),
            Err(ProtocolError::MalformedParams(_))
        ));
    }
}
