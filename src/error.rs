use crate::solarmax::field::QueryField;

pub type SolarMaxResult<T> = std::result::Result<T, SolarMaxError>;

/// Everything that can go wrong between a query leaving the bridge and a
/// reading reaching the publisher.
///
/// Frame and value errors abort only the query that produced them; link
/// errors are turned into recovery actions by the session before they are
/// surfaced.
#[derive(Debug, thiserror::Error)]
pub enum SolarMaxError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("checksum mismatch: frame carries {received}, content sums to {expected}")]
    Checksum { expected: String, received: String },

    #[error("length mismatch: header says {declared} bytes, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown query field {0:?}")]
    InvalidField(String),

    #[error("cannot decode {field} value {raw:?}: {reason}")]
    ValueDecode {
        field: String,
        raw: String,
        reason: String,
    },

    #[error("response from inverter {address} lacks field {field}")]
    MissingField { address: u8, field: QueryField },

    #[error("no answer from inverter {address} on {host}")]
    Timeout { host: String, address: u8 },

    #[error("found {found} of {expected} inverters on {host}")]
    PartialDetection {
        host: String,
        found: usize,
        expected: usize,
    },

    #[error("read {read} of {expected} inverters this cycle, possibly switched off")]
    CommunicationShortfall { read: usize, expected: usize },

    #[error("cannot connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// Only reachable through `FrameDecoder`, whose trait demands it.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SolarMaxError {
    pub(crate) fn value_decode(field: QueryField, raw: &str, reason: impl ToString) -> Self {
        Self::ValueDecode {
            field: field.to_string(),
            raw: raw.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// True for the failures that mean "the device did not talk to us", as
    /// opposed to "the device said something we could not understand".
    pub fn is_silence(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connect { .. })
    }
}
