//! Wire format: request lines, response lines and the request accumulator.

use std::fmt;

use crate::error::{AfeError, AfeResult};
use crate::memory::{AfeBuffer, MemTag, MemoryManager};

/// Bytes asked of the read callback per poll.
pub const REQUEST_CHUNK_SIZE: usize = 100;
pub const RESPONSE_MAX_SIZE: usize = 100;
/// Partial requests longer than this are dropped.
pub const COMMAND_BUFFER_SIZE: usize = 500;
pub const MAX_NUM_PARAMS: usize = 10;

const RESPONSE_HEADER: &str = "AFERSP";
const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerStatus {
    Ok,
    InvalidCmd,
    Error,
    InternalError,
    InvalidCmdParams,
    CompNotEnabled,
    NotSupported,
}

impl TunerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TunerStatus::Ok => "ok",
            TunerStatus::InvalidCmd => "invalid_cmd",
            TunerStatus::Error => "error",
            TunerStatus::InternalError => "internal_error",
            TunerStatus::InvalidCmdParams => "invalid_cmd_params",
            TunerStatus::CompNotEnabled => "comp_not_enabled",
            TunerStatus::NotSupported => "not_supported",
        }
    }
}

impl From<&AfeError> for TunerStatus {
    fn from(e: &AfeError) -> Self {
        match e {
            AfeError::TunerInvalidCmd => TunerStatus::InvalidCmd,
            AfeError::TunerGeneric(_) => TunerStatus::Error,
            AfeError::TunerInvalidCmdParams | AfeError::TunerHwInputGainOutOfRange(_) => {
                TunerStatus::InvalidCmdParams
            }
            AfeError::TunerComponentNotEnabled(_) => TunerStatus::CompNotEnabled,
            AfeError::TunerCmdNotSupported => TunerStatus::NotSupported,
            _ => TunerStatus::InternalError,
        }
    }
}

impl fmt::Display for TunerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerReply {
    pub status: TunerStatus,
    pub data: Option<String>,
}

impl TunerReply {
    pub fn ok() -> Self {
        Self::status(TunerStatus::Ok)
    }

    pub fn ok_with(data: impl Into<String>) -> Self {
        Self {
            status: TunerStatus::Ok,
            data: Some(data.into()),
        }
    }

    pub fn status(status: TunerStatus) -> Self {
        Self { status, data: None }
    }

    pub fn from_error(e: &AfeError) -> Self {
        Self::status(TunerStatus::from(e))
    }
}

impl<T: Into<String>> From<AfeResult<T>> for TunerReply {
    fn from(result: AfeResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok_with(data),
            Err(e) => Self::from_error(&e),
        }
    }
}

/// `AFERSP,<status>[,<data>]\r\n`, at most [`RESPONSE_MAX_SIZE`] bytes.
pub fn encode_response(reply: &TunerReply) -> AfeResult<Vec<u8>> {
    let line = match &reply.data {
        Some(data) => format!("{},{},{}\r\n", RESPONSE_HEADER, reply.status, data),
        None => format!("{},{}\r\n", RESPONSE_HEADER, reply.status),
    };
    if line.len() > RESPONSE_MAX_SIZE {
        return Err(AfeError::TunerInternal(format!(
            "response of {} bytes exceeds {}",
            line.len(),
            RESPONSE_MAX_SIZE
        )));
    }
    Ok(line.into_bytes())
}

/// A request line split into tokens. Empty tokens are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerRequest {
    pub verb: String,
    pub name: Option<String>,
    pub args: Vec<String>,
}

impl TunerRequest {
    pub fn parse(line: &str) -> AfeResult<Self> {
        let tokens: Vec<&str> = line.split(',').filter(|t| !t.is_empty()).collect();
        if tokens.len() > MAX_NUM_PARAMS {
            return Err(AfeError::TunerInvalidCmdParams);
        }
        let mut tokens = tokens.into_iter().map(str::to_owned);
        let verb = tokens.next().ok_or(AfeError::TunerInvalidCmd)?;
        Ok(Self {
            verb,
            name: tokens.next(),
            args: tokens.collect(),
        })
    }

    pub fn is_set(&self) -> bool {
        self.verb == "set"
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Numeric argument, as a C `atoi` would read it but strict about
    /// trailing garbage.
    pub fn int_arg(&self, index: usize) -> AfeResult<i32> {
        self.arg(index)
            .and_then(|a| a.trim().parse().ok())
            .ok_or(AfeError::TunerInvalidCmdParams)
    }

    /// Folds the name token into the arguments, for commands matched by
    /// verb alone.
    pub(crate) fn into_verb_only(mut self) -> Self {
        if let Some(name) = self.name.take() {
            self.args.insert(0, name);
        }
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Accumulated {
    NeedMoreData,
    Line(String),
    /// The partial request outgrew the buffer and was discarded.
    Overflow,
}

/// Collects chunks until a CRLF-terminated line is complete.
pub struct RequestAccumulator {
    buf: AfeBuffer,
    len: usize,
}

impl RequestAccumulator {
    pub fn new(memory: &MemoryManager) -> AfeResult<Self> {
        Ok(Self {
            buf: memory.alloc(MemTag::AfeTunerCmdBuffer, COMMAND_BUFFER_SIZE)?,
            len: 0,
        })
    }

    pub fn push(&mut self, chunk: &[u8]) -> Accumulated {
        if self.len + chunk.len() > COMMAND_BUFFER_SIZE {
            log::warn!(
                "Tuner request longer than {} bytes, discarded",
                COMMAND_BUFFER_SIZE
            );
            self.len = 0;
            return Accumulated::Overflow;
        }
        let bytes = self.buf.as_bytes_mut();
        bytes[self.len..self.len + chunk.len()].copy_from_slice(chunk);
        self.len += chunk.len();

        let pending = &self.buf.as_bytes()[..self.len];
        if pending == CRLF {
            // 空行直接丢掉
            self.len = 0;
            return Accumulated::NeedMoreData;
        }
        if self.len > CRLF.len() && pending.ends_with(CRLF) {
            let line = String::from_utf8_lossy(&pending[..self.len - CRLF.len()]).into_owned();
            self.len = 0;
            Accumulated::Line(line)
        } else {
            Accumulated::NeedMoreData
        }
    }

    pub fn pending(&self) -> usize {
        self.len
    }
}
