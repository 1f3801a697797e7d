use serde::{Deserialize, Serialize};
use std::fmt;

/// Command id for writing a mutable record.
pub const PUT: u32 = 100;

/// Command id for reading a mutable record.
pub const GET: u32 = 101;

/// Commands layered on the routing engine's dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Put,
    Get,
}

impl Command {
    pub fn id(self) -> u32 {
        match self {
            Command::Put => PUT,
            Command::Get => GET,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            PUT => Some(Command::Put),
            GET => Some(Command::Get),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Put => write!(f, "PUT({})", PUT),
            Command::Get => write!(f, "GET({})", GET),
        }
    }
}

/// Explicit rejection codes for authenticated writes that were not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The write's seq does not exceed the stored seq
    SeqTooLow,
    /// The record could not be persisted
    StorageFailed,
    /// A code this build does not know
    Unknown(u16),
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::SeqTooLow => 1,
            ErrorCode::StorageFailed => 2,
            ErrorCode::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => ErrorCode::SeqTooLow,
            2 => ErrorCode::StorageFailed,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::SeqTooLow => write!(f, "seq too low"),
            ErrorCode::StorageFailed => write!(f, "storage failed"),
            ErrorCode::Unknown(code) => write!(f, "unknown error {}", code),
        }
    }
}
