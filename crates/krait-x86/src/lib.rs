//! Guest x86-64 front-end: single-instruction decoding and multiblock region
//! discovery.
//!
//! The decoder covers the integer/control-flow subset the translation core
//! understands; anything else decodes to [`InstKind::Invalid`] so front-ends
//! can always make progress (the runtime turns that into a guest-visible
//! fault, not a crash). Region discovery walks direct branches to a fixed
//! point, bounded by [`RegionConfig`] ceilings, and records every guest page
//! the decoded bytes touch so the code cache can invalidate at page
//! granularity.

mod decoder;
mod region;

pub use decoder::{
    decode_one, try_decode_one, Address, AluOp, DecodeError, DecodedInst, InstKind, Operand, Reg,
    ShiftOp, VecOperand,
};
pub use region::{
    discover_region, BlockStatus, DecodedBlock, DecodedRegion, GuestBus, RegionConfig,
};

/// Architectural maximum x86 instruction length.
pub const MAX_INST_LEN: usize = 15;
