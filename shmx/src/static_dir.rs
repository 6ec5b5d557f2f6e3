//! Static stream directory: the immutable-after-create schema of a region.
//!
//! The directory is a length-prefixed sequence of entries describing
//! every stream a frame may carry. It is encoded once by the server
//! into the static area; clients and inspectors decode it whenever
//! `static_gen` changes. All integers are little-endian and every
//! record starts on an 8-byte boundary, so the encoding is identical
//! across compilers and languages.

use serde::Serialize;

use crate::error::{ShmxError, ShmxResult};

/// Element type of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ElemType {
    /// Unsigned 8-bit integer.
    U8 = 1,
    /// Signed 8-bit integer.
    I8 = 2,
    /// Unsigned 16-bit integer.
    U16 = 3,
    /// Signed 16-bit integer.
    I16 = 4,
    /// Unsigned 32-bit integer.
    U32 = 5,
    /// Signed 32-bit integer.
    I32 = 6,
    /// Unsigned 64-bit integer.
    U64 = 7,
    /// Signed 64-bit integer.
    I64 = 8,
    /// IEEE 754 single precision float.
    F32 = 9,
    /// IEEE 754 double precision float.
    F64 = 10,
}

impl ElemType {
    /// Convert from the wire code. Returns `None` for unknown codes.
    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::U8),
            2 => Some(Self::I8),
            3 => Some(Self::U16),
            4 => Some(Self::I16),
            5 => Some(Self::U32),
            6 => Some(Self::I32),
            7 => Some(Self::U64),
            8 => Some(Self::I64),
            9 => Some(Self::F32),
            10 => Some(Self::F64),
            _ => None,
        }
    }
}

/// Memory layout of a stream's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum StreamLayout {
    /// Structure-of-arrays scalar layout. Code space is reserved for
    /// AOS and vector layouts.
    SoaScalar = 1,
}

impl StreamLayout {
    /// Convert from the wire code. Returns `None` for unknown codes.
    pub const fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::SoaScalar),
            _ => None,
        }
    }
}

/// One stream as registered at create time.
#[derive(Debug, Clone)]
pub struct StaticStream {
    /// Stream id, unique within the region.
    pub stream_id: u32,
    /// Element type.
    pub elem_type: ElemType,
    /// Components per element (1 for scalars).
    pub components: u32,
    /// Element layout.
    pub layout: StreamLayout,
    /// Bytes of one element.
    pub bytes_per_elem: u32,
    /// UTF-8 display name.
    pub name: String,
    /// Opaque application extension bytes, at most 255.
    pub extra: Vec<u8>,
}

impl StaticStream {
    /// Scalar stream with SOA layout, no extra bytes.
    pub fn scalar(stream_id: u32, elem_type: ElemType, bytes_per_elem: u32, name: &str) -> Self {
        Self {
            stream_id,
            elem_type,
            components: 1,
            layout: StreamLayout::SoaScalar,
            bytes_per_elem,
            name: name.to_string(),
            extra: Vec::new(),
        }
    }
}

/// One decoded directory entry. Raw wire codes are preserved so
/// diagnostic tools can show entries written by newer producers.
#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    /// Stream id.
    pub stream_id: u32,
    /// Raw element type code.
    pub elem_type: u32,
    /// Components per element.
    pub components: u32,
    /// Raw layout code.
    pub layout: u32,
    /// Bytes of one element.
    pub bytes_per_elem: u32,
    /// UTF-8 display name (lossy if the producer wrote invalid UTF-8).
    pub name: String,
    /// Opaque application extension bytes.
    pub extra: Vec<u8>,
}

impl DirEntry {
    /// Element type, if the code is known to this build.
    pub fn elem_type(&self) -> Option<ElemType> {
        ElemType::from_u32(self.elem_type)
    }
}

const ENTRY_FIXED_BYTES: usize = 20; // id, type, components, layout, bytes_per_elem

/// Encode the directory. Fails with `StaticOverflow` when the encoding
/// does not fit in `cap` bytes.
pub fn encode_dir(streams: &[StaticStream], cap: u32) -> ShmxResult<Vec<u8>> {
    let mut out = Vec::new();
    put_u32(&mut out, streams.len() as u32);
    pad_to(&mut out, 8);

    for s in streams {
        debug_assert!(s.name.len() <= u16::MAX as usize);
        debug_assert!(s.extra.len() <= u8::MAX as usize);

        put_u32(&mut out, s.stream_id);
        put_u32(&mut out, s.elem_type as u32);
        put_u32(&mut out, s.components);
        put_u32(&mut out, s.layout as u32);
        put_u32(&mut out, s.bytes_per_elem);

        out.extend_from_slice(&(s.name.len() as u16).to_le_bytes());
        out.extend_from_slice(s.name.as_bytes());
        pad_to(&mut out, 8);

        out.push(s.extra.len() as u8);
        out.extend_from_slice(&s.extra);
        pad_to(&mut out, 8);
    }

    if out.len() > cap as usize {
        return Err(ShmxError::StaticOverflow {
            needed: out.len(),
            cap,
        });
    }
    Ok(out)
}

/// Decode a directory from the static area bytes.
///
/// Every length field is bounds-checked before use; a truncated or
/// inconsistent directory yields `StaticCorrupt`, never a panic.
pub fn decode_dir(bytes: &[u8]) -> ShmxResult<Vec<DirEntry>> {
    let mut cur = Cursor { bytes, pos: 0 };
    let count = cur.take_u32()? as usize;
    cur.align(8)?;

    // A directory claiming more entries than the bytes could possibly
    // hold is rejected up front.
    if count > bytes.len() / ENTRY_FIXED_BYTES + 1 {
        return Err(corrupt(0));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let stream_id = cur.take_u32()?;
        let elem_type = cur.take_u32()?;
        let components = cur.take_u32()?;
        let layout = cur.take_u32()?;
        let bytes_per_elem = cur.take_u32()?;

        let name_len = cur.take_u16()? as usize;
        let name_bytes = cur.take(name_len)?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();
        cur.align(8)?;

        let extra_len = cur.take_u8()? as usize;
        let extra = cur.take(extra_len)?.to_vec();
        cur.align(8)?;

        entries.push(DirEntry {
            stream_id,
            elem_type,
            components,
            layout,
            bytes_per_elem,
            name,
            extra,
        });
    }
    Ok(entries)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad_to(out: &mut Vec<u8>, align: usize) {
    while out.len() % align != 0 {
        out.push(0);
    }
}

fn corrupt(offset: usize) -> ShmxError {
    ShmxError::StaticCorrupt { offset }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> ShmxResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| corrupt(self.pos))?;
        if end > self.bytes.len() {
            return Err(corrupt(self.pos));
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_u8(&mut self) -> ShmxResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> ShmxResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> ShmxResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn align(&mut self, align: usize) -> ShmxResult<()> {
        while self.pos % align != 0 {
            self.take(1)?;
        }
        Ok(())
    }
}
