//! Shared error taxonomy for qname parsing and message codec operations.

use core::fmt;

/// All failure modes exposed by this crate.
///
/// Every fallible operation in `tsdp-core` returns one of these instead of
/// setting a process-global error register, per the original C
/// implementation's `errno` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Input to [`crate::qname::Qname::parse`] was malformed: an invalid
    /// FSM transition, an empty-after-trim key, or null/absent input.
    QnameMalformed,
    /// Input string exceeded [`crate::qname::MAX_INPUT`] octets.
    QnameTooLong,
    /// Parse would have produced more than [`crate::qname::MAX_PAIRS`]
    /// pairs.
    QnameTooManyPairs,
    /// [`crate::qname::Qname::set`] would exceed [`crate::qname::MAX_PAIRS`]
    /// on a qname that is already full.
    QnameCapacityExceeded,
    /// Message version field was not 1.
    InvalidVersion,
    /// Message opcode was outside `{0..5}`.
    InvalidOpcode,
    /// Flags field out of range at construction time.
    InvalidFlag,
    /// Reserved payload bits set, or the payload mask had the wrong
    /// popcount for the opcode.
    InvalidPayload,
    /// Wrong frame count for the opcode/payload combination.
    InvalidArity,
    /// A frame had the wrong type or length for its position.
    InvalidFrame,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::QnameMalformed => "malformed qualified name",
            Error::QnameTooLong => "qualified name input exceeds maximum length",
            Error::QnameTooManyPairs => "qualified name exceeds maximum pair count",
            Error::QnameCapacityExceeded => "qualified name is full",
            Error::InvalidVersion => "invalid TSDP message version",
            Error::InvalidOpcode => "invalid TSDP message opcode",
            Error::InvalidFlag => "invalid TSDP message flag",
            Error::InvalidPayload => "invalid TSDP message payload",
            Error::InvalidArity => "invalid frame count for TSDP message",
            Error::InvalidFrame => "invalid frame type in TSDP message",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::InvalidVersion.to_string(), "invalid TSDP message version");
        assert_eq!(Error::QnameMalformed.to_string(), "malformed qualified name");
    }
}
