use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    OutOfBounds { needed: usize, remaining: usize },

    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Length {0} does not fit in memory")]
    LengthOverflow(u64),

    #[error("Array of {count} elements cannot fit in {remaining} bytes")]
    ArrayTooLong { count: u64, remaining: usize },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// 变长整数的前缀字节
const PREFIX_U16: u8 = 0xfd;
const PREFIX_U32: u8 = 0xfe;
const PREFIX_U64: u8 = 0xff;

/// Append-only writer for the compact wire format.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    /// Writes a compact unsigned integer (1, 3, 5 or 9 bytes).
    pub fn uint(&mut self, n: u64) -> &mut Self {
        if n < PREFIX_U16 as u64 {
            self.buf.push(n as u8);
        } else if n <= u16::MAX as u64 {
            self.buf.push(PREFIX_U16);
            self.buf.extend_from_slice(&(n as u16).to_le_bytes());
        } else if n <= u32::MAX as u64 {
            self.buf.push(PREFIX_U32);
            self.buf.extend_from_slice(&(n as u32).to_le_bytes());
        } else {
            self.buf.push(PREFIX_U64);
            self.buf.extend_from_slice(&n.to_le_bytes());
        }
        self
    }

    pub fn fixed32(&mut self, bytes: &[u8; 32]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn fixed64(&mut self, bytes: &[u8; 64]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.uint(s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    /// Writes `count` followed by each string.
    pub fn string_array(&mut self, values: &[String]) -> &mut Self {
        self.uint(values.len() as u64);
        for value in values {
            self.string(value);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Returns the number of bytes `uint(n)` occupies.
pub fn uint_len(n: u64) -> usize {
    if n < PREFIX_U16 as u64 {
        1
    } else if n <= u16::MAX as u64 {
        3
    } else if n <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

/// Returns the encoded size of a string array.
pub fn string_array_len(values: &[String]) -> usize {
    values.iter().fold(uint_len(values.len() as u64), |acc, v| {
        acc + uint_len(v.len() as u64) + v.len()
    })
}

/// Cursor over untrusted input. Every read is bounds checked.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(CodecError::OutOfBounds { needed: n, remaining });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn uint(&mut self) -> Result<u64, CodecError> {
        let prefix = self.take(1)?[0];
        let n = match prefix {
            PREFIX_U16 => u16::from_le_bytes(self.array()?) as u64,
            PREFIX_U32 => u32::from_le_bytes(self.array()?) as u64,
            PREFIX_U64 => u64::from_le_bytes(self.array()?),
            small => small as u64,
        };
        Ok(n)
    }

    pub fn fixed32(&mut self) -> Result<[u8; 32], CodecError> {
        self.array()
    }

    pub fn fixed64(&mut self) -> Result<[u8; 64], CodecError> {
        self.array()
    }

    fn length(&mut self) -> Result<usize, CodecError> {
        let len = self.uint()?;
        usize::try_from(len).map_err(|_| CodecError::LengthOverflow(len))
    }

    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.length()?;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    pub fn string_array(&mut self) -> Result<Vec<String>, CodecError> {
        let count = self.uint()?;
        // 每个元素至少占一个字节，先检查再分配，避免恶意长度
        if count > self.remaining() as u64 {
            return Err(CodecError::ArrayTooLong { count, remaining: self.remaining() });
        }
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(self.string()?);
        }
        Ok(values)
    }

    /// Fails unless the whole input has been consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

/// Encodes a bare compact unsigned integer (the GET request payload).
pub fn encode_uint(n: u64) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(uint_len(n));
    enc.uint(n);
    enc.finish()
}

/// Decodes a bare compact unsigned integer, rejecting trailing bytes.
pub fn decode_uint(bytes: &[u8]) -> Result<u64, CodecError> {
    let mut dec = Decoder::new(bytes);
    let n = dec.uint()?;
    dec.finish()?;
    Ok(n)
}
