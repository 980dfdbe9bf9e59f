//! Error and warning taxonomy shared by the source driver, the ICC
//! reassembler and the decompression engine.

use core::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Hard failures. Every variant aborts the current call; the session
/// stays resettable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Backing storage or an output buffer could not be obtained.
    #[error("jpeg: out of memory ({0})")]
    Alloc(&'static str),

    /// The stream buffer could not be pinned (storage released).
    #[error("jpeg: array pin failed")]
    Pin,

    /// Saved APP2 markers do not form a valid ICC profile.
    #[error("invalid icc profile: {0}")]
    InvalidProfile(#[from] ProfileError),

    /// The byte source reported a failure.
    #[error("jpeg: source error: {0}")]
    Source(&'static str),

    /// The decompression engine rejected the stream or was misused.
    #[error("jpeg: {0}")]
    Engine(&'static str),

    /// The abort flag was raised while the call was in progress.
    #[error("jpeg: decode aborted")]
    Aborted,
}

/// Reasons an ICC profile is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("inconsistent num_markers fields")]
    InconsistentCount,
    #[error("bad sequence number")]
    BadSequenceNumber,
    #[error("duplicate sequence numbers")]
    DuplicateSequence,
    #[error("invalid number of icc markers")]
    InvalidMarkerCount,
    #[error("missing sequence number")]
    MissingSequence,
    #[error("invalid data length")]
    InvalidDataLength,
    #[error("found only empty markers")]
    EmptyMarkers,
}

/// Recoverable conditions reported to the caller's listener. None of
/// these abort the decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    /// The stream ended without an EOI marker; one was synthesised.
    MissingEndOfImage,
    /// A restart marker was missing or out of order.
    RestartResync { found: u8, expected: u8 },
    /// Adobe APP14 carried a transform code the engine does not know.
    UnknownAdobeTransform(u8),
    /// Progressive image: only the first scan is decoded.
    FirstScanOnly,
    /// Entropy data ended before the last MCU.
    PrematureEnd,
    /// EOI came before every component had a scan; the missing ones
    /// read as mid-grey.
    MissingScan,
}

impl Warning {
    /// Numeric code handed to listeners that only understand codes.
    /// `MissingEndOfImage` keeps the loader's historical `READ_NO_EOI = 0`.
    pub const fn code(self) -> u32 {
        match self {
            Warning::MissingEndOfImage => 0,
            Warning::RestartResync { .. } => 1,
            Warning::UnknownAdobeTransform(_) => 2,
            Warning::FirstScanOnly => 3,
            Warning::PrematureEnd => 4,
            Warning::MissingScan => 5,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::MissingEndOfImage => f.write_str("premature end of stream, EOI marker missing"),
            Warning::RestartResync { found, expected } => write!(
                f,
                "corrupt data: found marker 0x{:02x} instead of RST{}",
                found, expected
            ),
            Warning::UnknownAdobeTransform(t) => {
                write!(f, "unknown Adobe color transform code {}", t)
            }
            Warning::FirstScanOnly => f.write_str("progressive image, decoding first scan only"),
            Warning::PrematureEnd => f.write_str("corrupt data: premature end of data segment"),
            Warning::MissingScan => f.write_str("corrupt data: image ended before every component was scanned"),
        }
    }
}
