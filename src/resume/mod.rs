//! Guard recovery descriptors
//!
//! When a guard fails, execution leaves the optimized trace and must rebuild
//! the state the unoptimized trace would have had at that point. Values that
//! the optimizer kept virtual have no runtime representation, so a
//! [`ResumeDescr`] describes how to rebuild them from the boxes that do
//! exist. Shared substructure is numbered once, so DAGs and cycles of
//! virtuals survive the round trip.

use crate::error::{Error, Result};
use crate::info::{PtrInfo, StrInfo, VString};
use crate::ir::{Const, DescrRef, DescrTable, OpRef, Operand, StrMode};
use rustc_hash::FxHashMap as HashMap;

/// One value needed on the failure path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailArg {
    /// A value computed by the optimized trace
    Box(OpRef),
    Const(Const),
    /// Index into [`ResumeDescr::virtuals`]
    Virtual(usize),
}

/// How to rebuild one virtual
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualDescr {
    Struct {
        descr: DescrRef,
        class: Option<i64>,
        fields: Vec<(DescrRef, FailArg)>,
    },
    Array {
        descr: DescrRef,
        clear: bool,
        items: Vec<Option<FailArg>>,
    },
    ArrayStruct {
        descr: DescrRef,
        length: usize,
        /// `(item index, interior field, value)`
        items: Vec<(usize, DescrRef, FailArg)>,
    },
    RawBuffer {
        func: DescrRef,
        size: i64,
        entries: Vec<(i64, DescrRef, FailArg)>,
    },
    RawSlice {
        parent: FailArg,
        offset: i64,
    },
    StrPlain {
        mode: StrMode,
        chars: Vec<Option<FailArg>>,
    },
    StrConcat {
        mode: StrMode,
        left: FailArg,
        right: FailArg,
    },
    StrSlice {
        mode: StrMode,
        s: FailArg,
        start: FailArg,
        length: FailArg,
    },
}

/// A write delayed by the heap cache past a guard.
///
/// Only writes of virtual values are delayed this way; if the guard fails,
/// the recovery path performs the write after rebuilding the value.
#[derive(Debug, Clone)]
pub struct PendingField {
    pub target: Operand,
    /// Field, array or interior field descriptor
    pub descr: DescrRef,
    /// Constant item index for array writes
    pub index: Option<i64>,
    pub value: Operand,
}

/// [`PendingField`] after encoding
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePendingField {
    pub target: FailArg,
    pub descr: DescrRef,
    pub index: Option<i64>,
    pub value: FailArg,
}

/// Recovery data attached to an optimized guard
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeDescr {
    /// Stable identity, unique within one optimizer
    pub id: u32,
    /// The recorded operation this guard stands for
    pub origin: OpRef,
    pub fail_args: Vec<FailArg>,
    pub virtuals: Vec<VirtualDescr>,
    pub pending_fields: Vec<ResumePendingField>,
}

impl ResumeDescr {
    /// Distinct boxes referenced anywhere in the descriptor, in first-use order
    pub fn boxes(&self) -> Vec<OpRef> {
        let mut seen = Vec::new();
        let mut note = |arg: &FailArg| {
            if let FailArg::Box(r) = arg {
                if !seen.contains(r) {
                    seen.push(*r);
                }
            }
        };
        for arg in &self.fail_args {
            note(arg);
        }
        for v in &self.virtuals {
            match v {
                VirtualDescr::Struct { fields, .. } => fields.iter().for_each(|(_, a)| note(a)),
                VirtualDescr::Array { items, .. } => items.iter().flatten().for_each(&mut note),
                VirtualDescr::ArrayStruct { items, .. } => {
                    items.iter().for_each(|(_, _, a)| note(a))
                }
                VirtualDescr::RawBuffer { entries, .. } => {
                    entries.iter().for_each(|(_, _, a)| note(a))
                }
                VirtualDescr::RawSlice { parent, .. } => note(parent),
                VirtualDescr::StrPlain { chars, .. } => chars.iter().flatten().for_each(&mut note),
                VirtualDescr::StrConcat { left, right, .. } => {
                    note(left);
                    note(right);
                }
                VirtualDescr::StrSlice {
                    s, start, length, ..
                } => {
                    note(s);
                    note(start);
                    note(length);
                }
            }
        }
        for p in &self.pending_fields {
            note(&p.target);
            note(&p.value);
        }
        seen
    }
}

/// What the encoder needs to know about the values it encodes
pub trait VirtualSource {
    /// Follow forwarding to the current representative
    fn resolve(&self, operand: &Operand) -> Operand;
    /// Facts of a value, if it is currently virtual
    fn virtual_info(&self, r: OpRef) -> Option<&PtrInfo>;
    fn descr_table(&self) -> &DescrTable;
}

/// Encodes fail args and pending fields into a [`ResumeDescr`]
pub struct ResumeBuilder<'a, S: VirtualSource> {
    source: &'a S,
    memo: HashMap<OpRef, usize>,
    virtuals: Vec<Option<VirtualDescr>>,
    entries: usize,
}

impl<'a, S: VirtualSource> ResumeBuilder<'a, S> {
    pub fn new(source: &'a S) -> Self {
        ResumeBuilder {
            source,
            memo: HashMap::default(),
            virtuals: Vec::new(),
            entries: 0,
        }
    }

    /// Number of entries encoded so far
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn encode(&mut self, operand: &Operand) -> Result<FailArg> {
        self.entries += 1;
        let source = self.source;
        match source.resolve(operand) {
            Operand::Const(c) => Ok(FailArg::Const(c)),
            Operand::Op(r) => {
                if let Some(&index) = self.memo.get(&r) {
                    return Ok(FailArg::Virtual(index));
                }
                match source.virtual_info(r) {
                    Some(info) => self.encode_virtual(r, info),
                    None => Ok(FailArg::Box(r)),
                }
            }
        }
    }

    fn encode_opt(&mut self, operand: &Option<Operand>) -> Result<Option<FailArg>> {
        match operand {
            Some(op) => self.encode(op).map(Some),
            None => Ok(None),
        }
    }

    fn encode_virtual(&mut self, r: OpRef, info: &'a PtrInfo) -> Result<FailArg> {
        let index = self.virtuals.len();
        self.virtuals.push(None);
        self.memo.insert(r, index);
        let source = self.source;
        let descrs = source.descr_table();
        let descr = match info {
            PtrInfo::Struct(s) => {
                let size = s
                    .descr
                    .ok_or_else(|| Error::internal("virtual struct without size descr"))?;
                let layout = descrs
                    .size(size)
                    .ok_or_else(|| Error::internal("virtual struct with a non-size descr"))?;
                let mut fields = Vec::new();
                for (slot, value) in s.fields.iter().enumerate() {
                    if let (Some(value), Some(&fdescr)) = (value, layout.fields.get(slot)) {
                        fields.push((fdescr, self.encode(value)?));
                    }
                }
                VirtualDescr::Struct {
                    descr: size,
                    class: s.known_class,
                    fields,
                }
            }
            PtrInfo::Array(a) => {
                let mut items = Vec::with_capacity(a.items.len());
                for item in &a.items {
                    items.push(self.encode_opt(item)?);
                }
                VirtualDescr::Array {
                    descr: a.descr,
                    clear: a.clear,
                    items,
                }
            }
            PtrInfo::ArrayStruct(a) => {
                let interior = descrs
                    .array(a.descr)
                    .map(|d| d.interior.clone())
                    .unwrap_or_default();
                let mut items = Vec::new();
                for index in 0..a.length {
                    for (field, &fdescr) in interior.iter().enumerate() {
                        if let Some(value) = &a.items[a.slot(index, field)] {
                            items.push((index, fdescr, self.encode(value)?));
                        }
                    }
                }
                VirtualDescr::ArrayStruct {
                    descr: a.descr,
                    length: a.length,
                    items,
                }
            }
            PtrInfo::RawBuffer(raw) => {
                let mut entries = Vec::with_capacity(raw.entries.len());
                for entry in &raw.entries {
                    entries.push((entry.offset, entry.descr, self.encode(&entry.value)?));
                }
                VirtualDescr::RawBuffer {
                    func: raw.func,
                    size: raw.size,
                    entries,
                }
            }
            PtrInfo::RawSlice(slice) => VirtualDescr::RawSlice {
                parent: self.encode(&slice.parent)?,
                offset: slice.offset,
            },
            PtrInfo::Str(StrInfo {
                mode,
                virt: Some(v),
                ..
            }) => match v {
                VString::Plain(chars) => {
                    let mut encoded = Vec::with_capacity(chars.len());
                    for c in chars {
                        encoded.push(self.encode_opt(c)?);
                    }
                    VirtualDescr::StrPlain {
                        mode: *mode,
                        chars: encoded,
                    }
                }
                VString::Concat { left, right } => VirtualDescr::StrConcat {
                    mode: *mode,
                    left: self.encode(left)?,
                    right: self.encode(right)?,
                },
                VString::Slice { s, start, length } => VirtualDescr::StrSlice {
                    mode: *mode,
                    s: self.encode(s)?,
                    start: self.encode(start)?,
                    length: self.encode(length)?,
                },
            },
            other => {
                return Err(Error::internal(format!(
                    "cannot encode {} as a virtual",
                    other.kind_name()
                )))
            }
        };
        self.virtuals[index] = Some(descr);
        Ok(FailArg::Virtual(index))
    }

    pub fn encode_pending(&mut self, field: &PendingField) -> Result<ResumePendingField> {
        Ok(ResumePendingField {
            target: self.encode(&field.target)?,
            descr: field.descr,
            index: field.index,
            value: self.encode(&field.value)?,
        })
    }

    /// Finish encoding
    pub fn build(
        self,
        id: u32,
        origin: OpRef,
        fail_args: Vec<FailArg>,
        pending_fields: Vec<ResumePendingField>,
    ) -> Result<ResumeDescr> {
        let virtuals = self
            .virtuals
            .into_iter()
            .map(|v| v.ok_or_else(|| Error::internal("unfinished virtual in resume data")))
            .collect::<Result<Vec<_>>>()?;
        Ok(ResumeDescr {
            id,
            origin,
            fail_args,
            virtuals,
            pending_fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::StructInfo;
    use crate::ir::Type;

    struct Fixture {
        table: DescrTable,
        infos: HashMap<OpRef, PtrInfo>,
    }

    impl VirtualSource for Fixture {
        fn resolve(&self, operand: &Operand) -> Operand {
            operand.clone()
        }

        fn virtual_info(&self, r: OpRef) -> Option<&PtrInfo> {
            self.infos.get(&r).filter(|i| i.is_virtual())
        }

        fn descr_table(&self) -> &DescrTable {
            &self.table
        }
    }

    fn node_fixture() -> (Fixture, DescrRef, DescrRef) {
        let mut table = DescrTable::new();
        let node = table.add_struct("Node", Some(1), false);
        table.add_field(node, "value", Type::Int, false);
        let next = table.add_field(node, "next", Type::Ref, false);
        (
            Fixture {
                table,
                infos: HashMap::default(),
            },
            node,
            next,
        )
    }

    #[test]
    fn test_encode_shared_cycle() {
        let (mut fixture, node, _) = node_fixture();
        // p1.next = p2, p2.next = p1, p2.value = i0
        fixture.infos.insert(
            OpRef(1),
            PtrInfo::Struct(StructInfo {
                descr: Some(node),
                known_class: Some(1),
                fields: vec![None, Some(Operand::Op(OpRef(2)))],
                is_virtual: true,
                last_guard: None,
            }),
        );
        fixture.infos.insert(
            OpRef(2),
            PtrInfo::Struct(StructInfo {
                descr: Some(node),
                known_class: Some(1),
                fields: vec![Some(Operand::Op(OpRef(0))), Some(Operand::Op(OpRef(1)))],
                is_virtual: true,
                last_guard: None,
            }),
        );

        let mut builder = ResumeBuilder::new(&fixture);
        let a = builder.encode(&Operand::Op(OpRef(1))).unwrap();
        let b = builder.encode(&Operand::Op(OpRef(2))).unwrap();
        let c = builder.encode(&Operand::int(7)).unwrap();
        let descr = builder.build(3, OpRef(9), vec![a, b, c], Vec::new()).unwrap();

        assert_eq!(descr.fail_args[0], FailArg::Virtual(0));
        assert_eq!(descr.fail_args[1], FailArg::Virtual(1));
        assert_eq!(descr.fail_args[2], FailArg::Const(Const::Int(7)));
        assert_eq!(descr.virtuals.len(), 2);
        assert_eq!(descr.boxes(), vec![OpRef(0)]);
    }

    #[test]
    fn test_encode_plain_box() {
        let (fixture, _, _) = node_fixture();
        let mut builder = ResumeBuilder::new(&fixture);
        let a = builder.encode(&Operand::Op(OpRef(5))).unwrap();
        assert_eq!(a, FailArg::Box(OpRef(5)));
        assert_eq!(builder.entries(), 1);
    }
}
