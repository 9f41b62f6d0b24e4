//! TSDP core: qualified metric name parsing/canonicalization/matching and
//! the binary message codec, with no transport or storage concerns of
//! their own. See `SPEC_FULL.md` for the full module-by-module contract.

pub mod error;
pub mod message;
pub mod qname;

pub use error::Error;
pub use message::{Frame, FrameType, FrameValue, Message, Opcode, PayloadMask};
pub use qname::{Qname, QnameValue};
