//! Payload encodings implied by request codes.
//!
//! Three payload shapes exist beyond bare strings/blobs: a typed value
//! (`set`, `get` responses, validation traffic), a full variable
//! descriptor (`create`), and a query descriptor (`query-first`). All are
//! length-checked during decode; a malformed payload rejects the request,
//! never the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{MAX_FORMAT_LEN, MAX_GROUPS, MAX_NAME_LEN, MAX_TAGS, WireError};
use crate::value::{VarType, VarValue};

/// Encodes a length-prefixed (u16) UTF-8 string.
pub fn put_string(dst: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= usize::from(u16::MAX));
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}

/// Decodes a length-prefixed (u16) UTF-8 string, enforcing `max_len`.
///
/// # Errors
///
/// [`WireError::Malformed`] on truncation, oversize, or invalid UTF-8.
pub fn get_string(src: &mut Bytes, max_len: usize) -> Result<String, WireError> {
    if src.remaining() < 2 {
        return Err(WireError::malformed("truncated string length"));
    }
    let len = usize::from(src.get_u16());
    if len > max_len {
        return Err(WireError::malformed("string exceeds maximum length"));
    }
    if src.remaining() < len {
        return Err(WireError::malformed("truncated string body"));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::malformed("string is not UTF-8"))
}

/// Encodes a typed value: `[type: u8][reserved: u8][length: u32][bytes]`.
pub fn encode_value(dst: &mut BytesMut, value: &VarValue) {
    dst.put_u8(value.var_type().tag());
    dst.put_u8(0);
    match value {
        VarValue::Int16(v) => {
            dst.put_u32(2);
            dst.put_i16(*v);
        }
        VarValue::UInt16(v) => {
            dst.put_u32(2);
            dst.put_u16(*v);
        }
        VarValue::Int32(v) => {
            dst.put_u32(4);
            dst.put_i32(*v);
        }
        VarValue::UInt32(v) => {
            dst.put_u32(4);
            dst.put_u32(*v);
        }
        VarValue::Float(v) => {
            dst.put_u32(4);
            dst.put_f32(*v);
        }
        VarValue::Str(s) => {
            dst.put_u32(s.len() as u32);
            dst.put_slice(s.as_bytes());
        }
        VarValue::Blob(b) => {
            dst.put_u32(b.len() as u32);
            dst.put_slice(b);
        }
    }
}

/// Encodes a typed value into a fresh buffer.
#[must_use]
pub fn value_bytes(value: &VarValue) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + value.len());
    encode_value(&mut buf, value);
    buf.freeze()
}

/// Decodes a typed value.
///
/// # Errors
///
/// [`WireError::Malformed`] when the tag is unknown, the declared length
/// does not match the type, or the body is truncated.
pub fn decode_value(src: &mut Bytes) -> Result<VarValue, WireError> {
    if src.remaining() < 6 {
        return Err(WireError::malformed("truncated value header"));
    }
    let tag = src.get_u8();
    src.advance(1); // reserved
    let len = src.get_u32() as usize;
    let ty = VarType::from_tag(tag).ok_or(WireError::malformed("unknown value type tag"))?;
    if src.remaining() < len {
        return Err(WireError::malformed("truncated value body"));
    }
    let value = match ty {
        VarType::Int16 => {
            check_len(len, 2)?;
            VarValue::Int16(src.get_i16())
        }
        VarType::UInt16 => {
            check_len(len, 2)?;
            VarValue::UInt16(src.get_u16())
        }
        VarType::Int32 => {
            check_len(len, 4)?;
            VarValue::Int32(src.get_i32())
        }
        VarType::UInt32 => {
            check_len(len, 4)?;
            VarValue::UInt32(src.get_u32())
        }
        VarType::Float => {
            check_len(len, 4)?;
            VarValue::Float(src.get_f32())
        }
        VarType::Str => {
            let raw = src.split_to(len);
            VarValue::Str(
                String::from_utf8(raw.to_vec())
                    .map_err(|_| WireError::malformed("string value is not UTF-8"))?,
            )
        }
        VarType::Blob => VarValue::Blob(src.split_to(len).to_vec()),
    };
    Ok(value)
}

const fn check_len(got: usize, want: usize) -> Result<(), WireError> {
    if got == want {
        Ok(())
    } else {
        Err(WireError::malformed("value length does not match its type"))
    }
}

/// The `create` request payload: a full variable definition.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDescriptor {
    /// Variable name; unique together with `instance`.
    pub name: String,
    /// Instance identifier.
    pub instance: u32,
    /// Initial value; fixes the type and (for str/blob) the capacity.
    pub value: VarValue,
    /// Initial flag bits.
    pub flags: u16,
    /// Format specifier used by `print`.
    pub format: String,
    /// Tag names, registered against the tag registry at creation.
    pub tags: Vec<String>,
    /// Group ids permitted to read; empty means unrestricted.
    pub read_groups: Vec<u32>,
    /// Group ids permitted to write; empty means unrestricted.
    pub write_groups: Vec<u32>,
}

impl VarDescriptor {
    /// Creates a minimal descriptor with defaults for the optional fields.
    #[must_use]
    pub fn new(name: impl Into<String>, instance: u32, value: VarValue) -> Self {
        Self {
            name: name.into(),
            instance,
            value,
            flags: 0,
            format: String::new(),
            tags: Vec::new(),
            read_groups: Vec::new(),
            write_groups: Vec::new(),
        }
    }

    /// Encodes the descriptor as a `create` payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(64 + self.value.len());
        put_string(&mut dst, &self.name);
        dst.put_u32(self.instance);
        encode_value(&mut dst, &self.value);
        dst.put_u16(self.flags);
        put_string(&mut dst, &self.format);
        dst.put_u8(self.tags.len() as u8);
        for tag in &self.tags {
            put_string(&mut dst, tag);
        }
        dst.put_u8(self.read_groups.len() as u8);
        for gid in &self.read_groups {
            dst.put_u32(*gid);
        }
        dst.put_u8(self.write_groups.len() as u8);
        for gid in &self.write_groups {
            dst.put_u32(*gid);
        }
        dst.freeze()
    }

    /// Decodes a `create` payload.
    ///
    /// # Errors
    ///
    /// [`WireError::Malformed`] on truncation or exceeded limits
    /// (name/format length, tag and group counts).
    pub fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        let name = get_string(src, MAX_NAME_LEN)?;
        if name.is_empty() {
            return Err(WireError::malformed("empty variable name"));
        }
        if src.remaining() < 4 {
            return Err(WireError::malformed("truncated instance id"));
        }
        let instance = src.get_u32();
        let value = decode_value(src)?;
        if src.remaining() < 2 {
            return Err(WireError::malformed("truncated flags"));
        }
        let flags = src.get_u16();
        let format = get_string(src, MAX_FORMAT_LEN)?;
        let tags = decode_counted(src, MAX_TAGS, "tag", |src| get_string(src, MAX_NAME_LEN))?;
        let read_groups = decode_counted(src, MAX_GROUPS, "read group", get_u32_checked)?;
        let write_groups = decode_counted(src, MAX_GROUPS, "write group", get_u32_checked)?;
        Ok(Self {
            name,
            instance,
            value,
            flags,
            format,
            tags,
            read_groups,
            write_groups,
        })
    }
}

fn get_u32_checked(src: &mut Bytes) -> Result<u32, WireError> {
    if src.remaining() < 4 {
        return Err(WireError::malformed("truncated group id"));
    }
    Ok(src.get_u32())
}

fn decode_counted<T>(
    src: &mut Bytes,
    max: usize,
    what: &'static str,
    mut item: impl FnMut(&mut Bytes) -> Result<T, WireError>,
) -> Result<Vec<T>, WireError> {
    if src.remaining() < 1 {
        return Err(WireError::malformed("truncated list count"));
    }
    let count = usize::from(src.get_u8());
    if count > max {
        tracing::debug!(what, count, max, "list count exceeds limit");
        return Err(WireError::malformed("list count exceeds limit"));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(item(src)?);
    }
    Ok(out)
}

/// Predicate selector bits for [`QueryDescriptor`].
pub mod query {
    /// Case-insensitive substring match against the variable name.
    pub const MATCH: u8 = 1 << 0;
    /// Exact instance-id match.
    pub const INSTANCE: u8 = 1 << 1;
    /// Requested flags must be a subset of the variable's flags.
    pub const FLAGS: u8 = 1 << 2;
    /// Variable must carry all requested tags.
    pub const TAGS: u8 = 1 << 3;
}

/// The `query-first` request payload.
///
/// A variable matches only if every *selected* predicate holds; hidden
/// variables never match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDescriptor {
    /// Which predicates are active ([`query`] bits).
    pub predicates: u8,
    /// Substring for [`query::MATCH`].
    pub match_text: String,
    /// Instance id for [`query::INSTANCE`].
    pub instance: u32,
    /// Required flag bits for [`query::FLAGS`].
    pub flags: u16,
    /// Required tag names for [`query::TAGS`].
    pub tags: Vec<String>,
}

impl QueryDescriptor {
    /// Encodes the query as a `query-first` payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(16 + self.match_text.len());
        dst.put_u8(self.predicates);
        put_string(&mut dst, &self.match_text);
        dst.put_u32(self.instance);
        dst.put_u16(self.flags);
        dst.put_u8(self.tags.len() as u8);
        for tag in &self.tags {
            put_string(&mut dst, tag);
        }
        dst.freeze()
    }

    /// Decodes a `query-first` payload.
    ///
    /// # Errors
    ///
    /// [`WireError::Malformed`] on truncation or exceeded limits.
    pub fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        if src.remaining() < 1 {
            return Err(WireError::malformed("truncated predicate bits"));
        }
        let predicates = src.get_u8();
        let match_text = get_string(src, MAX_NAME_LEN)?;
        if src.remaining() < 6 {
            return Err(WireError::malformed("truncated query fields"));
        }
        let instance = src.get_u32();
        let flags = src.get_u16();
        let tags = decode_counted(src, MAX_TAGS, "tag", |src| get_string(src, MAX_NAME_LEN))?;
        Ok(Self {
            predicates,
            match_text,
            instance,
            flags,
            tags,
        })
    }
}

/// The `open` payload carried by TCP clients: claimed process identity.
///
/// The local transport ignores this and uses `SO_PEERCRED` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenPayload {
    /// Claimed process id.
    pub pid: u32,
    /// Claimed group id.
    pub gid: u32,
}

impl OpenPayload {
    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(8);
        dst.put_u32(self.pid);
        dst.put_u32(self.gid);
        dst.freeze()
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// [`WireError::Malformed`] on truncation.
    pub fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        if src.remaining() < 8 {
            return Err(WireError::malformed("truncated open payload"));
        }
        Ok(Self {
            pid: src.get_u32(),
            gid: src.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip_with_all_fields() {
        let desc = VarDescriptor {
            name: "sys.temp".into(),
            instance: 2,
            value: VarValue::Float(21.5),
            flags: 0x0041,
            format: "%.1f".into(),
            tags: vec!["hvac".into(), "sensor".into()],
            read_groups: vec![100],
            write_groups: vec![100, 101],
        };
        let mut encoded = desc.encode();
        let decoded = VarDescriptor::decode(&mut encoded).unwrap();
        assert_eq!(decoded, desc);
        assert!(encoded.is_empty());
    }

    #[test]
    fn descriptor_rejects_empty_name() {
        let desc = VarDescriptor::new("", 0, VarValue::Int32(0));
        let mut encoded = desc.encode();
        assert!(VarDescriptor::decode(&mut encoded).is_err());
    }

    #[test]
    fn descriptor_rejects_oversized_tag_count() {
        let mut desc = VarDescriptor::new("x", 0, VarValue::Int32(0));
        desc.tags = (0..9).map(|i| format!("t{i}")).collect();
        let mut encoded = desc.encode();
        assert!(VarDescriptor::decode(&mut encoded).is_err());
    }

    #[test]
    fn value_length_mismatch_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(VarType::Int32.tag());
        buf.put_u8(0);
        buf.put_u32(2); // wrong: int32 bodies are 4 bytes
        buf.put_u16(7);
        let mut bytes = buf.freeze();
        assert!(decode_value(&mut bytes).is_err());
    }

    #[test]
    fn query_roundtrip() {
        let query = QueryDescriptor {
            predicates: query::MATCH | query::FLAGS,
            match_text: "temp".into(),
            instance: 0,
            flags: 0x0010,
            tags: vec![],
        };
        let mut encoded = query.encode();
        let decoded = QueryDescriptor::decode(&mut encoded).unwrap();
        assert_eq!(decoded, query);
    }

    #[test]
    fn blob_value_roundtrip() {
        let value = VarValue::Blob(vec![0, 1, 2, 255]);
        let mut bytes = value_bytes(&value);
        assert_eq!(decode_value(&mut bytes).unwrap(), value);
    }
}
