//! Abstract facts about trace values
//!
//! Every operation of a trace being optimized has a [`Forwarding`] slot:
//! either nothing is known, the operation was proven equal to another
//! operand, or it carries an [`Info`] record. Pointer facts form a closed
//! set of kinds ([`PtrInfo`]), from a plain non-null marker up to virtual
//! objects whose contents live only in the optimizer.

use crate::intbound::IntBound;
use crate::ir::{DescrRef, Operand, StrMode};

/// Whether a pointer (or an integer seen as a truth value) can be null
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Nullness {
    Unknown,
    NonNull,
    Null,
}

/// State of one operation's forwarding slot
#[derive(Debug, Clone, Default)]
pub enum Forwarding {
    #[default]
    Unresolved,
    /// Proven equal to another operand; facts live there
    ReplacedBy(Operand),
    HasFacts(Info),
}

/// Facts about one value
#[derive(Debug, Clone)]
pub enum Info {
    Int(IntBound),
    Ptr(PtrInfo),
}

/// A struct or instance; virtual or with a known class
#[derive(Debug, Clone)]
pub struct StructInfo {
    /// Size descriptor, known for allocations
    pub descr: Option<DescrRef>,
    pub known_class: Option<i64>,
    /// Field values by slot index, virtual objects only
    pub fields: Vec<Option<Operand>>,
    pub is_virtual: bool,
    /// Output position of the last guard about this value
    pub last_guard: Option<usize>,
}

/// An array of primitives or references
#[derive(Debug, Clone)]
pub struct ArrayInfo {
    pub descr: DescrRef,
    /// Items of a virtual array; `None` means never written
    pub items: Vec<Option<Operand>>,
    /// Allocated with `new_array_clear`
    pub clear: bool,
    pub lenbound: Option<IntBound>,
    pub is_virtual: bool,
    pub last_guard: Option<usize>,
}

/// A virtual array of structs
#[derive(Debug, Clone)]
pub struct ArrayStructInfo {
    pub descr: DescrRef,
    pub length: usize,
    /// `length * fields_per_item` slots, item-major
    pub items: Vec<Option<Operand>>,
    pub fields_per_item: usize,
    pub is_virtual: bool,
}

impl ArrayStructInfo {
    pub fn slot(&self, index: usize, field: usize) -> usize {
        index * self.fields_per_item + field
    }
}

/// One store into a raw buffer
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub offset: i64,
    pub length: i64,
    /// Array descriptor used for the store
    pub descr: DescrRef,
    pub value: Operand,
}

/// A virtual raw (non-GC) buffer
#[derive(Debug, Clone)]
pub struct RawBufferInfo {
    /// Call descriptor of the allocator
    pub func: DescrRef,
    pub size: i64,
    /// Stores sorted by offset, never overlapping
    pub entries: Vec<RawEntry>,
    pub is_virtual: bool,
}

impl RawBufferInfo {
    /// Record a store; `false` when it partially overlaps an existing entry
    pub fn write(&mut self, offset: i64, length: i64, descr: DescrRef, value: Operand) -> bool {
        for entry in self.entries.iter_mut() {
            if entry.offset == offset && entry.length == length {
                entry.descr = descr;
                entry.value = value;
                return true;
            }
            if offset < entry.offset + entry.length && entry.offset < offset + length {
                return false;
            }
        }
        let pos = self
            .entries
            .iter()
            .position(|e| e.offset > offset)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            pos,
            RawEntry {
                offset,
                length,
                descr,
                value,
            },
        );
        true
    }

    /// Read a store back; `Err` if the read straddles entries
    pub fn read(&self, offset: i64, length: i64) -> std::result::Result<Option<&Operand>, ()> {
        for entry in &self.entries {
            if entry.offset == offset && entry.length == length {
                return Ok(Some(&entry.value));
            }
            if offset < entry.offset + entry.length && entry.offset < offset + length {
                return Err(());
            }
        }
        Ok(None)
    }
}

/// A pointer into the middle of a virtual raw buffer
#[derive(Debug, Clone)]
pub struct RawSliceInfo {
    pub parent: Operand,
    pub offset: i64,
}

/// Lazily built string
#[derive(Debug, Clone)]
pub enum VString {
    Plain(Vec<Option<Operand>>),
    Slice {
        s: Operand,
        start: Operand,
        length: Operand,
    },
    Concat {
        left: Operand,
        right: Operand,
    },
}

/// A string or unicode value
#[derive(Debug, Clone)]
pub struct StrInfo {
    pub mode: StrMode,
    pub lenbound: Option<IntBound>,
    /// Operand known to hold the length
    pub len_box: Option<Operand>,
    pub last_guard: Option<usize>,
    /// Set while the string is virtual
    pub virt: Option<VString>,
}

/// Facts about a pointer
#[derive(Debug, Clone)]
pub enum PtrInfo {
    NonNull { last_guard: Option<usize> },
    Struct(StructInfo),
    Array(ArrayInfo),
    ArrayStruct(ArrayStructInfo),
    RawBuffer(RawBufferInfo),
    RawSlice(RawSliceInfo),
    Str(StrInfo),
}

impl PtrInfo {
    pub fn nonnull() -> Self {
        PtrInfo::NonNull { last_guard: None }
    }

    pub fn is_virtual(&self) -> bool {
        match self {
            PtrInfo::NonNull { .. } => false,
            PtrInfo::Struct(s) => s.is_virtual,
            PtrInfo::Array(a) => a.is_virtual,
            PtrInfo::ArrayStruct(a) => a.is_virtual,
            PtrInfo::RawBuffer(r) => r.is_virtual,
            PtrInfo::RawSlice(_) => true,
            PtrInfo::Str(s) => s.virt.is_some(),
        }
    }

    /// Every kind of pointer info implies non-null
    pub fn nullness(&self) -> Nullness {
        Nullness::NonNull
    }

    pub fn known_class(&self) -> Option<i64> {
        match self {
            PtrInfo::Struct(s) => s.known_class,
            _ => None,
        }
    }

    pub fn last_guard(&self) -> Option<usize> {
        match self {
            PtrInfo::NonNull { last_guard } => *last_guard,
            PtrInfo::Struct(s) => s.last_guard,
            PtrInfo::Array(a) => a.last_guard,
            PtrInfo::Str(s) => s.last_guard,
            _ => None,
        }
    }

    pub fn set_last_guard(&mut self, pos: Option<usize>) {
        match self {
            PtrInfo::NonNull { last_guard } => *last_guard = pos,
            PtrInfo::Struct(s) => s.last_guard = pos,
            PtrInfo::Array(a) => a.last_guard = pos,
            PtrInfo::Str(s) => s.last_guard = pos,
            _ => {}
        }
    }

    /// Every operand stored inside a virtual
    pub fn virtual_children(&self) -> Vec<Operand> {
        match self {
            PtrInfo::Struct(s) if s.is_virtual => s.fields.iter().flatten().cloned().collect(),
            PtrInfo::Array(a) if a.is_virtual => a.items.iter().flatten().cloned().collect(),
            PtrInfo::ArrayStruct(a) if a.is_virtual => a.items.iter().flatten().cloned().collect(),
            PtrInfo::RawBuffer(r) if r.is_virtual => {
                r.entries.iter().map(|e| e.value.clone()).collect()
            }
            PtrInfo::RawSlice(s) => vec![s.parent.clone()],
            PtrInfo::Str(StrInfo {
                virt: Some(v), ..
            }) => match v {
                VString::Plain(chars) => chars.iter().flatten().cloned().collect(),
                VString::Slice { s, start, length } => {
                    vec![s.clone(), start.clone(), length.clone()]
                }
                VString::Concat { left, right } => vec![left.clone(), right.clone()],
            },
            _ => Vec::new(),
        }
    }

    /// Short description used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            PtrInfo::NonNull { .. } => "nonnull",
            PtrInfo::Struct(s) if s.known_class.is_some() => "instance",
            PtrInfo::Struct(_) => "struct",
            PtrInfo::Array(_) => "array",
            PtrInfo::ArrayStruct(_) => "arraystruct",
            PtrInfo::RawBuffer(_) => "rawbuffer",
            PtrInfo::RawSlice(_) => "rawslice",
            PtrInfo::Str(StrInfo { virt: Some(VString::Plain(_)), .. }) => "vstring-plain",
            PtrInfo::Str(StrInfo { virt: Some(VString::Slice { .. }), .. }) => "vstring-slice",
            PtrInfo::Str(StrInfo { virt: Some(VString::Concat { .. }), .. }) => "vstring-concat",
            PtrInfo::Str(_) => "string",
        }
    }
}

impl Info {
    pub fn is_virtual(&self) -> bool {
        match self {
            Info::Ptr(p) => p.is_virtual(),
            Info::Int(_) => false,
        }
    }

    pub fn as_ptr(&self) -> Option<&PtrInfo> {
        match self {
            Info::Ptr(p) => Some(p),
            Info::Int(_) => None,
        }
    }

    pub fn as_ptr_mut(&mut self) -> Option<&mut PtrInfo> {
        match self {
            Info::Ptr(p) => Some(p),
            Info::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<&IntBound> {
        match self {
            Info::Int(b) => Some(b),
            Info::Ptr(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpRef;

    #[test]
    fn test_raw_buffer_entries() {
        let mut raw = RawBufferInfo {
            func: DescrRef(0),
            size: 16,
            entries: Vec::new(),
            is_virtual: true,
        };
        assert!(raw.write(8, 8, DescrRef(1), Operand::int(2)));
        assert!(raw.write(0, 8, DescrRef(1), Operand::int(1)));
        assert_eq!(raw.entries[0].offset, 0);
        assert_eq!(raw.read(8, 8), Ok(Some(&Operand::int(2))));
        assert_eq!(raw.read(4, 8), Err(()));
        assert!(!raw.write(4, 4, DescrRef(1), Operand::int(3)));
        assert!(raw.write(0, 8, DescrRef(1), Operand::int(5)));
        assert_eq!(raw.read(0, 8), Ok(Some(&Operand::int(5))));
    }

    #[test]
    fn test_virtual_children() {
        let info = PtrInfo::Struct(StructInfo {
            descr: Some(DescrRef(0)),
            known_class: Some(3),
            fields: vec![Some(Operand::Op(OpRef(4))), None, Some(Operand::int(1))],
            is_virtual: true,
            last_guard: None,
        });
        assert_eq!(info.virtual_children().len(), 2);
        assert_eq!(info.kind_name(), "instance");
        assert!(info.is_virtual());
        assert_eq!(info.known_class(), Some(3));
    }
}
