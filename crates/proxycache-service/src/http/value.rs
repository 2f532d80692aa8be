use crate::caching::{CacheEntry, CacheError, SharedBuffer};

use super::ResponseHeaders;

/// Size of the marker byte plus the header length prefix.
const PREFIX_LEN: usize = 5;

/// A response as stored in a cache backend: headers and body in a single buffer.
///
/// The layout is the marker byte `h`, the length of the serialized headers as a big-endian
/// `u32`, the headers as JSON, and finally the raw body. The body is never copied out of the
/// buffer it was read into.
#[derive(Debug, Clone)]
pub struct HttpValue {
    buffer: SharedBuffer,
    headers: ResponseHeaders,
    body_offset: usize,
}

impl HttpValue {
    const MARKER: u8 = b'h';

    pub fn encode(headers: &ResponseHeaders, body: &[u8]) -> CacheEntry<Self> {
        let serialized = serde_json::to_vec(headers)?;
        let header_len = u32::try_from(serialized.len())
            .map_err(|_| CacheError::Malformed("headers too large".into()))?;

        let mut buffer = Vec::with_capacity(PREFIX_LEN + serialized.len() + body.len());
        buffer.push(Self::MARKER);
        buffer.extend_from_slice(&header_len.to_be_bytes());
        buffer.extend_from_slice(&serialized);
        buffer.extend_from_slice(body);

        Ok(Self {
            buffer: buffer.into(),
            headers: headers.clone(),
            body_offset: PREFIX_LEN + serialized.len(),
        })
    }

    pub fn decode(buffer: SharedBuffer) -> CacheEntry<Self> {
        let Some((&marker, rest)) = buffer.split_first() else {
            return Err(CacheError::Malformed("empty value".into()));
        };
        if marker != Self::MARKER {
            return Err(CacheError::Malformed(format!("unknown marker {marker:#x}")));
        }
        let len_bytes: [u8; 4] = rest
            .get(..4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| CacheError::Malformed("truncated header length".into()))?;
        let header_len = u32::from_be_bytes(len_bytes) as usize;

        let body_offset = PREFIX_LEN + header_len;
        let serialized = buffer
            .get(PREFIX_LEN..body_offset)
            .ok_or_else(|| CacheError::Malformed("truncated headers".into()))?;
        let headers = serde_json::from_slice(serialized)?;

        Ok(Self {
            buffer,
            headers,
            body_offset,
        })
    }

    pub fn headers(&self) -> &ResponseHeaders {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.buffer[self.body_offset..]
    }

    /// The encoded value, as handed to the backend.
    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    /// Size of the encoded value in bytes.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }
}
