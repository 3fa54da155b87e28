//! Append-only code buffer with labels and forward patching.
//!
//! Backends bind one label per IR block and record fixups for branches whose
//! targets have not been emitted yet; `finalize` resolves everything once
//! the whole region is down, which is what lets conditional jumps between
//! sibling blocks be emitted in a single pass.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// How a recorded fixup rewrites the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// x86-64 rel32, relative to the end of the 4-byte field.
    Rel32,
    /// aarch64 B / BL: imm26 word offset in the low 26 bits.
    AArch64Branch26,
    /// aarch64 B.cond / CBZ class: imm19 word offset at bits 5..24.
    AArch64Branch19,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixupError {
    #[error("label bound to no offset")]
    UnboundLabel,
    #[error("branch displacement out of range at offset {offset:#x}")]
    OutOfRange { offset: usize },
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    offset: usize,
    label: Label,
    kind: FixupKind,
}

#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl CodeBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.emit(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.emit(&value.to_le_bytes());
    }

    #[must_use]
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind `label` to the current emission offset.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");
        self.labels[label.0 as usize] = Some(self.bytes.len());
    }

    #[must_use]
    pub fn offset_of(&self, label: Label) -> Option<usize> {
        self.labels[label.0 as usize]
    }

    /// Record a fixup for the field that starts at the current offset. The
    /// caller must still emit the placeholder field bytes.
    pub fn record_fixup(&mut self, label: Label, kind: FixupKind) {
        self.fixups.push(Fixup {
            offset: self.bytes.len(),
            label,
            kind,
        });
    }

    /// Resolve every recorded fixup and return the finished bytes.
    pub fn finalize(mut self) -> Result<Vec<u8>, FixupError> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.labels[fixup.label.0 as usize].ok_or(FixupError::UnboundLabel)?;
            match fixup.kind {
                FixupKind::Rel32 => {
                    let rel = target as i64 - (fixup.offset as i64 + 4);
                    let rel = i32::try_from(rel).map_err(|_| FixupError::OutOfRange {
                        offset: fixup.offset,
                    })?;
                    self.patch_u32(fixup.offset, rel as u32);
                }
                FixupKind::AArch64Branch26 => {
                    let words = (target as i64 - fixup.offset as i64) / 4;
                    if !(-(1 << 25)..1 << 25).contains(&words) {
                        return Err(FixupError::OutOfRange {
                            offset: fixup.offset,
                        });
                    }
                    let inst = self.read_u32(fixup.offset) | (words as u32 & 0x03ff_ffff);
                    self.patch_u32(fixup.offset, inst);
                }
                FixupKind::AArch64Branch19 => {
                    let words = (target as i64 - fixup.offset as i64) / 4;
                    if !(-(1 << 18)..1 << 18).contains(&words) {
                        return Err(FixupError::OutOfRange {
                            offset: fixup.offset,
                        });
                    }
                    let inst = self.read_u32(fixup.offset) | ((words as u32 & 0x7ffff) << 5);
                    self.patch_u32(fixup.offset, inst);
                }
            }
        }
        Ok(self.bytes)
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(
            self.bytes[offset..offset + 4]
                .try_into()
                .expect("fixup field in bounds"),
        )
    }

    fn patch_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
