mod codec;

pub use codec::{decode_uint, encode_uint, CodecError, Decoder, Encoder};

use codec::{string_array_len, uint_len};
use std::fmt;

/// Length of an Ed25519 public key on the wire.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of a detached Ed25519 signature on the wire.
pub const SIGNATURE_LENGTH: usize = 64;

/*
 * Wire shapes for mutable records
 *
 * PutRequest  : fixed32 publicKey | uint seq | array<string> value | fixed64 signature
 * PutSignable : uint seq | array<string> value
 * GetResponse : uint seq | array<string> value | fixed64 signature
 *
 * A GetResponse is also what a node keeps on disk for each target, so
 * `Record` doubles as the stored form.
 */

/// A signed, versioned list of strings. Encodes as a GetResponse.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    pub seq: u64,
    pub value: Vec<String>,
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl Record {
    pub fn new(seq: u64, value: Vec<String>, signature: [u8; SIGNATURE_LENGTH]) -> Self {
        Self { seq, value, signature }
    }

    pub fn encoded_len(&self) -> usize {
        uint_len(self.seq) + string_array_len(&self.value) + SIGNATURE_LENGTH
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.encoded_len());
        enc.uint(self.seq)
            .string_array(&self.value)
            .fixed64(&self.signature);
        enc.finish()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(bytes);
        let record = Self {
            seq: dec.uint()?,
            value: dec.string_array()?,
            signature: dec.fixed64()?,
        };
        dec.finish()?;
        Ok(record)
    }

    /// Re-wraps this record with its owner's key so it can be committed again.
    pub fn into_put_request(self, public_key: [u8; PUBLIC_KEY_LENGTH]) -> PutRequest {
        PutRequest {
            public_key,
            seq: self.seq,
            value: self.value,
            signature: self.signature,
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("seq", &self.seq)
            .field("value", &self.value)
            .field("signature", &hex::encode(&self.signature[..8]))
            .finish()
    }
}

/// Reads only the leading seq of an encoded record.
pub fn peek_seq(bytes: &[u8]) -> Result<u64, CodecError> {
    Decoder::new(bytes).uint()
}

/// The write-path message: a record plus the key that signed it.
#[derive(Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    pub seq: u64,
    pub value: Vec<String>,
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl PutRequest {
    pub fn encoded_len(&self) -> usize {
        PUBLIC_KEY_LENGTH + uint_len(self.seq) + string_array_len(&self.value) + SIGNATURE_LENGTH
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.encoded_len());
        enc.fixed32(&self.public_key)
            .uint(self.seq)
            .string_array(&self.value)
            .fixed64(&self.signature);
        enc.finish()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(bytes);
        let request = Self {
            public_key: dec.fixed32()?,
            seq: dec.uint()?,
            value: dec.string_array()?,
            signature: dec.fixed64()?,
        };
        dec.finish()?;
        Ok(request)
    }

    /// Splits off the public key, leaving the stored form.
    pub fn into_record(self) -> ([u8; PUBLIC_KEY_LENGTH], Record) {
        (
            self.public_key,
            Record {
                seq: self.seq,
                value: self.value,
                signature: self.signature,
            },
        )
    }
}

impl fmt::Debug for PutRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutRequest")
            .field("public_key", &hex::encode(self.public_key))
            .field("seq", &self.seq)
            .field("value", &self.value)
            .field("signature", &format!("[{} bytes]", self.signature.len()))
            .finish()
    }
}

/// The signed payload. Never sent on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutSignable<'a> {
    pub seq: u64,
    pub value: &'a [String],
}

impl<'a> PutSignable<'a> {
    pub fn new(seq: u64, value: &'a [String]) -> Self {
        Self { seq, value }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(uint_len(self.seq) + string_array_len(self.value));
        enc.uint(self.seq).string_array(self.value);
        enc.finish()
    }

    /// Decodes into owned parts `(seq, value)`.
    pub fn decode(bytes: &[u8]) -> Result<(u64, Vec<String>), CodecError> {
        let mut dec = Decoder::new(bytes);
        let seq = dec.uint()?;
        let value = dec.string_array()?;
        dec.finish()?;
        Ok((seq, value))
    }
}
