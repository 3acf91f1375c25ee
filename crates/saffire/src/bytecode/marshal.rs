//! Binary container for compiled bytecode (`.sfc` files).
//!
//! All integers are little-endian. The file starts with a fixed header:
//!
//! | field              | type |
//! |--------------------|------|
//! | magic              | u32  |
//! | version            | u32  |
//! | source timestamp   | u32  |
//! | flags              | u32  |
//! | crc32 of body      | u32  |
//! | stored body length | u32  |
//! | uncompressed len   | u32  |
//! | body offset        | u32  |
//! | signature length   | u32  |
//! | signature offset   | u32  |
//!
//! The body holds the stack size, the code, the constant table (tag, length,
//! payload; nested frames recurse into the same body layout), the identifier
//! table, the line table and the source file name. Strings are stored without a
//! terminator. With [`FLAG_COMPRESSED`] the stored body is DEFLATE data; with
//! [`FLAG_SIGNED`] an HMAC-SHA256 of the stored body follows it.

use std::{
    io::{self, Read as _, Write as _},
    sync::Arc,
};

use flate2::{Compression, Crc, read::DeflateDecoder, write::DeflateEncoder};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{
    code::{Bytecode, Constant, LoadError},
    lineno::LineTable,
};

pub const MAGIC: u32 = 0x4342_4653;
pub const VERSION: u32 = 1;
pub const FLAG_SIGNED: u32 = 0x1;
pub const FLAG_COMPRESSED: u32 = 0x2;

const HEADER_LEN: usize = 40;
const MAX_NESTING: usize = 64;
/// Upper bound on the DEFLATE expansion used to size the output buffer up front.
const MAX_DEFLATE_RATIO: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Settings for writing a bytecode file.
#[derive(Debug, Clone, Default)]
pub struct MarshalOptions {
    /// DEFLATE the body.
    pub compress: bool,
    /// Append an HMAC-SHA256 signature made with this key.
    pub sign_key: Option<Vec<u8>>,
    /// Modification time of the source the bytecode was compiled from.
    pub timestamp: u32,
}

impl MarshalOptions {
    #[must_use]
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    #[must_use]
    pub fn signed(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.sign_key = Some(key.into());
        self
    }
}

/// The fixed header at the start of a bytecode file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub timestamp: u32,
    pub flags: u32,
    pub crc: u32,
    pub body_len: u32,
    pub uncompressed_len: u32,
    pub body_offset: u32,
    pub signature_len: u32,
    pub signature_offset: u32,
}

impl Header {
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.flags & FLAG_SIGNED != 0
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

// ============================================================================
// Writing
// ============================================================================

/// Serializes `bytecode` into a complete file image.
pub fn serialize(bytecode: &Bytecode, options: &MarshalOptions) -> io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    write_body(&mut raw, bytecode)?;
    let uncompressed_len = len_u32(raw.len())?;

    let mut flags = 0;
    let body = if options.compress {
        flags |= FLAG_COMPRESSED;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()?
    } else {
        raw
    };

    let signature = match &options.sign_key {
        Some(key) => {
            flags |= FLAG_SIGNED;
            sign(key, &body).map_err(io::Error::other)?
        }
        None => Vec::new(),
    };

    let mut crc = Crc::new();
    crc.update(&body);

    let body_len = len_u32(body.len())?;
    let body_offset = len_u32(HEADER_LEN)?;
    let signature_offset = if signature.is_empty() { 0 } else { body_offset + body_len };

    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + signature.len());
    for field in [
        MAGIC,
        VERSION,
        options.timestamp,
        flags,
        crc.sum(),
        body_len,
        uncompressed_len,
        body_offset,
        len_u32(signature.len())?,
        signature_offset,
    ] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    out.extend_from_slice(&body);
    out.extend_from_slice(&signature);
    tracing::debug!(
        stored = body.len(),
        uncompressed = uncompressed_len,
        signed = !signature.is_empty(),
        "serialized bytecode"
    );
    Ok(out)
}

fn write_body(out: &mut Vec<u8>, bytecode: &Bytecode) -> io::Result<()> {
    write_u32(out, bytecode.stack_size);
    write_bytes(out, &bytecode.code)?;

    write_u32(out, len_u32(bytecode.constants.len())?);
    for constant in &bytecode.constants {
        out.push(constant.tag());
        match constant {
            Constant::String(s) | Constant::Regex(s) => write_bytes(out, s.as_bytes())?,
            Constant::Number(n) => {
                write_u32(out, 8);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::Code(child) => {
                let mut nested = Vec::new();
                write_body(&mut nested, child)?;
                write_bytes(out, &nested)?;
            }
        }
    }

    write_u32(out, len_u32(bytecode.identifiers.len())?);
    for name in &bytecode.identifiers {
        write_bytes(out, name.as_bytes())?;
    }

    write_u32(out, bytecode.lines.start_line());
    write_bytes(out, bytecode.lines.deltas())?;

    write_bytes(out, bytecode.source_file.as_deref().unwrap_or_default().as_bytes())?;
    Ok(())
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    write_u32(out, len_u32(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(())
}

fn len_u32(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bytecode section exceeds 4 GiB"))
}

fn sign(key: &[u8], body: &[u8]) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

// ============================================================================
// Reading
// ============================================================================

/// Parses only the fixed header.
pub fn read_header(bytes: &[u8]) -> Result<Header, LoadError> {
    let mut reader = Reader::new(bytes);
    let magic = reader.u32()?;
    if magic != MAGIC {
        return Err(LoadError::BadMagic(magic));
    }
    let version = reader.u32()?;
    if version != VERSION {
        return Err(LoadError::Version(version));
    }
    Ok(Header {
        version,
        timestamp: reader.u32()?,
        flags: reader.u32()?,
        crc: reader.u32()?,
        body_len: reader.u32()?,
        uncompressed_len: reader.u32()?,
        body_offset: reader.u32()?,
        signature_len: reader.u32()?,
        signature_offset: reader.u32()?,
    })
}

/// Parses and validates a complete file image.
///
/// When `verify_key` is given the file must carry a signature made with that
/// key. A signed file read without a key loads with a warning.
pub fn deserialize(bytes: &[u8], verify_key: Option<&[u8]>) -> Result<Bytecode, LoadError> {
    let header = read_header(bytes)?;
    let unknown = header.flags & !(FLAG_SIGNED | FLAG_COMPRESSED);
    if unknown != 0 {
        tracing::warn!(flags = unknown, "ignoring unknown bytecode flag bits");
    }

    let body = slice(bytes, header.body_offset, header.body_len)?;

    let mut crc = Crc::new();
    crc.update(body);
    if crc.sum() != header.crc {
        return Err(LoadError::Crc {
            expected: header.crc,
            actual: crc.sum(),
        });
    }

    match (header.is_signed(), verify_key) {
        (true, Some(key)) => {
            let signature = slice(bytes, header.signature_offset, header.signature_len)?;
            let mut mac = HmacSha256::new_from_slice(key).map_err(|_| LoadError::BadSignature)?;
            mac.update(body);
            mac.verify_slice(signature).map_err(|_| LoadError::BadSignature)?;
        }
        (true, None) => tracing::warn!("bytecode is signed but no verification key was given"),
        (false, Some(_)) => return Err(LoadError::Unsigned),
        (false, None) => {}
    }

    let declared = header.uncompressed_len as usize;
    let raw = if header.is_compressed() {
        let mut out = Vec::with_capacity(declared.min(body.len().saturating_mul(MAX_DEFLATE_RATIO)));
        DeflateDecoder::new(body)
            .take(declared as u64 + 1)
            .read_to_end(&mut out)
            .map_err(LoadError::Decompress)?;
        out
    } else {
        body.to_vec()
    };
    if raw.len() != declared {
        return Err(LoadError::SizeMismatch {
            declared,
            actual: raw.len(),
        });
    }

    let mut reader = Reader::new(&raw);
    let bytecode = read_body(&mut reader, 0)?;
    if !reader.is_empty() {
        return Err(LoadError::SizeMismatch {
            declared,
            actual: reader.pos,
        });
    }
    bytecode.validate()?;
    Ok(bytecode)
}

fn slice(bytes: &[u8], offset: u32, len: u32) -> Result<&[u8], LoadError> {
    let start = offset as usize;
    let end = start.checked_add(len as usize).ok_or(LoadError::Truncated)?;
    bytes.get(start..end).ok_or(LoadError::Truncated)
}

fn read_body(reader: &mut Reader<'_>, depth: usize) -> Result<Bytecode, LoadError> {
    if depth > MAX_NESTING {
        return Err(LoadError::TooDeep);
    }
    let stack_size = reader.u32()?;
    let code = reader.bytes()?.to_vec();

    let constant_count = reader.u32()?;
    let mut constants = Vec::new();
    for _ in 0..constant_count {
        let tag = reader.u8()?;
        let payload = reader.bytes()?;
        let constant = match tag {
            0 => Constant::String(utf8(payload)?),
            1 => {
                let raw: [u8; 8] = payload.try_into().map_err(|_| LoadError::Truncated)?;
                Constant::Number(i64::from_le_bytes(raw))
            }
            2 => {
                let mut nested = Reader::new(payload);
                let child = read_body(&mut nested, depth + 1)?;
                Constant::Code(Arc::new(child))
            }
            3 => Constant::Regex(utf8(payload)?),
            other => return Err(LoadError::UnknownConstant(other)),
        };
        constants.push(constant);
    }

    let identifier_count = reader.u32()?;
    let mut identifiers = Vec::new();
    for _ in 0..identifier_count {
        identifiers.push(utf8(reader.bytes()?)?);
    }

    let start_line = reader.u32()?;
    let deltas = reader.bytes()?.to_vec();
    let source_file = utf8(reader.bytes()?)?;

    Ok(Bytecode::new(code, stack_size, constants, identifiers)
        .with_lines(LineTable::from_parts(start_line, deltas))
        .with_source_file((!source_file.is_empty()).then_some(source_file)))
}

fn utf8(bytes: &[u8]) -> Result<String, LoadError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Utf8)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        let end = self.pos.checked_add(len).ok_or(LoadError::Truncated)?;
        let out = self.bytes.get(self.pos..end).ok_or(LoadError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// A u32 length followed by that many bytes.
    fn bytes(&mut self) -> Result<&'a [u8], LoadError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
