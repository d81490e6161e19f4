//! Virtual states at loop labels
//!
//! A [`VirtualState`] is the abstract shape of the values passed to a loop
//! label: which are virtual objects (and what they contain), and what is
//! known about the rest. Entries are numbered in depth-first pre-order from
//! the roots, so a value reachable along two paths gets a single entry.
//!
//! Comparing two states decides whether a jump can target a label; when it
//! cannot, a bridge may still get there by emitting guards for the facts it
//! lacks, as long as it knows the runtime values.

use crate::error::{Error, Result};
use crate::info::{ArrayInfo, ArrayStructInfo, Info, PtrInfo, StructInfo};
use crate::intbound::IntBound;
use crate::ir::{Const, DescrRef, Op, OpCode, OpRef, Operand, RefConst, StrMode, Type};
use crate::optimizer::Optimizer;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// How much is known about a non-virtual pointer, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Unknown,
    NonNull,
    KnownClass,
    Constant,
}

/// Known length of an array or string
#[derive(Debug, Clone, PartialEq)]
pub enum LenBound {
    Array(DescrRef, IntBound),
    Str(StrMode, IntBound),
}

impl LenBound {
    fn contains_bound(&self, other: &LenBound) -> bool {
        match (self, other) {
            (LenBound::Array(d1, b1), LenBound::Array(d2, b2)) => d1 == d2 && b1.contains_bound(b2),
            (LenBound::Str(m1, b1), LenBound::Str(m2, b2)) => m1 == m2 && b1.contains_bound(b2),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualKind {
    Struct,
    /// A struct allocated with a vtable
    Instance,
}

/// Facts about a value that stays a real box across the label
#[derive(Debug, Clone)]
pub struct NotVirtualInfo {
    pub ty: Type,
    pub level: Level,
    pub known_class: Option<i64>,
    /// Set exactly when `level` is [`Level::Constant`]
    pub constant: Option<Const>,
    pub intbound: Option<IntBound>,
    pub lenbound: Option<LenBound>,
    /// The value the entry was captured from
    pub value: Operand,
}

#[derive(Debug, Clone)]
pub enum StateEntry {
    Virtual {
        kind: VirtualKind,
        descr: DescrRef,
        class: Option<i64>,
        /// Set fields and the entry of their value
        fields: Vec<(DescrRef, usize)>,
    },
    VArray {
        descr: DescrRef,
        clear: bool,
        items: Vec<Option<usize>>,
    },
    VArrayStruct {
        descr: DescrRef,
        length: usize,
        fields_per_item: usize,
        items: Vec<Option<usize>>,
    },
    NotVirtual(NotVirtualInfo),
}

/// What the interpreter observed for a value, used when a bridge needs guards
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Int(i64),
    Float(f64),
    Null,
    Object { class: Option<i64> },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct VirtualState {
    pub entries: Vec<StateEntry>,
    /// Entry of each label argument
    pub roots: Vec<usize>,
}

fn mismatch(why: impl Into<String>) -> Error {
    Error::bad_virtual_state(why)
}

impl NotVirtualInfo {
    fn capture(opt: &Optimizer, value: &Operand) -> Self {
        let mut info = NotVirtualInfo {
            ty: Type::Void,
            level: Level::Unknown,
            known_class: None,
            constant: None,
            intbound: None,
            lenbound: None,
            value: value.clone(),
        };
        match value {
            Operand::Const(c) => {
                info.ty = c.ty();
                info.level = Level::Constant;
                info.constant = Some(c.clone());
                if let Const::Ref(RefConst::Obj { class, .. }) = c {
                    info.known_class = *class;
                }
            }
            Operand::Op(r) => {
                info.ty = opt.op(*r).ty;
                match info.ty {
                    Type::Int => {
                        let bound = opt.getintbound(value);
                        if let Some(c) = bound.get_constant() {
                            info.level = Level::Constant;
                            info.constant = Some(Const::Int(c));
                        } else if !bound.is_unbounded() {
                            info.intbound = Some(bound);
                        }
                    }
                    Type::Ref => {
                        if let Some(ptr) = opt.getptrinfo(value) {
                            info.known_class = ptr.known_class();
                            info.level = if info.known_class.is_some() {
                                Level::KnownClass
                            } else {
                                Level::NonNull
                            };
                            info.lenbound = match ptr {
                                PtrInfo::Array(a) => {
                                    a.lenbound.clone().map(|b| LenBound::Array(a.descr, b))
                                }
                                PtrInfo::Str(s) => s.lenbound.clone().map(|b| LenBound::Str(s.mode, b)),
                                _ => None,
                            };
                        }
                    }
                    _ => {}
                }
            }
        }
        info
    }

    /// Every value matching `other` also matches `self`
    fn generalizes(&self, other: &NotVirtualInfo) -> bool {
        if self.ty != other.ty {
            return false;
        }
        let level_ok = match self.level {
            Level::Constant => other.level == Level::Constant && other.constant == self.constant,
            Level::KnownClass => other.level >= Level::KnownClass && other.known_class == self.known_class,
            Level::NonNull => other.level >= Level::NonNull,
            Level::Unknown => true,
        };
        level_ok && self.intbound_holds(other) && self.lenbound_holds(other)
    }

    fn intbound_holds(&self, other: &NotVirtualInfo) -> bool {
        let Some(bound) = &self.intbound else {
            return true;
        };
        match (&other.constant, &other.intbound) {
            (Some(Const::Int(c)), _) => bound.contains(*c),
            (_, Some(b)) => bound.contains_bound(b),
            _ => false,
        }
    }

    fn lenbound_holds(&self, other: &NotVirtualInfo) -> bool {
        let Some(bound) = &self.lenbound else {
            return true;
        };
        match (&other.lenbound, &other.constant) {
            (Some(theirs), _) => bound.contains_bound(theirs),
            (None, Some(Const::Ref(RefConst::Str(s)))) => match bound {
                LenBound::Str(mode, b) => *mode == s.mode && b.contains(s.len() as i64),
                LenBound::Array(..) => false,
            },
            _ => false,
        }
    }

    /// Guards that make a value described by `other` match `self`
    fn generate_guards(
        &self,
        other: &NotVirtualInfo,
        runtime: Option<&RuntimeValue>,
        emit: &mut dyn FnMut(Op) -> OpRef,
    ) -> Result<()> {
        if self.ty != other.ty {
            return Err(mismatch("value types differ"));
        }
        let value = other.value.clone();
        match self.level {
            Level::Constant => {
                let Some(c) = &self.constant else {
                    return Err(Error::internal("constant entry without a value"));
                };
                if other.constant.as_ref() != Some(c) {
                    match (other.level, runtime, c) {
                        (Level::Constant, _, _) => return Err(mismatch("different constants")),
                        (_, Some(RuntimeValue::Int(v)), Const::Int(x)) if v == x => {
                            emit(Op::void(OpCode::GuardValue, vec![value.clone(), Operand::int(*x)]));
                        }
                        _ => return Err(mismatch(format!("value is not the constant {}", c))),
                    }
                }
            }
            Level::KnownClass => {
                let class = self.known_class;
                if other.level < Level::KnownClass || other.known_class != class {
                    if other.known_class.is_some() {
                        return Err(mismatch("different classes"));
                    }
                    let (Some(RuntimeValue::Object { class: seen }), Some(class)) = (runtime, class)
                    else {
                        return Err(mismatch("class not known"));
                    };
                    if *seen != Some(class) {
                        return Err(mismatch("runtime object has another class"));
                    }
                    let opcode = if other.level == Level::Unknown {
                        OpCode::GuardNonnullClass
                    } else {
                        OpCode::GuardClass
                    };
                    emit(Op::void(opcode, vec![value.clone(), Operand::int(class)]));
                }
            }
            Level::NonNull => {
                if other.level < Level::NonNull {
                    match runtime {
                        Some(RuntimeValue::Object { .. }) => {
                            emit(Op::void(OpCode::GuardNonnull, vec![value.clone()]));
                        }
                        _ => return Err(mismatch("value may be null")),
                    }
                }
            }
            Level::Unknown => {}
        }
        if !self.intbound_holds(other) {
            match (&self.intbound, runtime) {
                (Some(bound), Some(RuntimeValue::Int(v))) if bound.contains(*v) => {
                    bound.make_guards(&value, emit)
                }
                _ => return Err(mismatch("integer outside the expected bound")),
            }
        }
        if !self.lenbound_holds(other) {
            return Err(mismatch("length outside the expected bound"));
        }
        Ok(())
    }

    /// Restore the facts on a fresh label argument
    fn apply(&self, opt: &mut Optimizer, leaf: &Operand) -> Result<()> {
        match self.ty {
            Type::Int => {
                if let Some(bound) = &self.intbound {
                    opt.setintbound(leaf, bound)?;
                }
            }
            Type::Ref => {
                match (self.level, self.known_class) {
                    (Level::KnownClass, Some(class)) => opt.set_known_class(leaf, class),
                    (Level::NonNull | Level::KnownClass, _) => opt.make_nonnull(leaf),
                    _ => {}
                }
                match &self.lenbound {
                    Some(LenBound::Array(descr, b)) => opt.update_lenbound(leaf, Some(*descr), None, b)?,
                    Some(LenBound::Str(mode, b)) => opt.update_lenbound(leaf, None, Some(*mode), b)?,
                    None => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn is_leaf(&self) -> bool {
        self.level != Level::Constant
    }
}

impl VirtualState {
    /// Capture the state of `values` as seen by the optimizer
    ///
    /// Virtual strings and raw buffers have no label representation and
    /// must be forced beforehand.
    pub(crate) fn capture(opt: &Optimizer, values: &[Operand]) -> Result<Self> {
        let mut state = VirtualState {
            entries: Vec::new(),
            roots: Vec::new(),
        };
        let mut memo = HashMap::default();
        for value in values {
            let idx = state.visit(opt, value, &mut memo)?;
            state.roots.push(idx);
        }
        Ok(state)
    }

    fn visit(&mut self, opt: &Optimizer, value: &Operand, memo: &mut HashMap<OpRef, usize>) -> Result<usize> {
        let value = opt.resolve(value);
        let idx = self.entries.len();
        let Operand::Op(r) = value else {
            self.entries.push(StateEntry::NotVirtual(NotVirtualInfo::capture(opt, &value)));
            return Ok(idx);
        };
        if let Some(&known) = memo.get(&r) {
            return Ok(known);
        }
        memo.insert(r, idx);
        let ptr = match opt.info(r).and_then(Info::as_ptr) {
            Some(p) if p.is_virtual() => p.clone(),
            _ => {
                self.entries.push(StateEntry::NotVirtual(NotVirtualInfo::capture(opt, &value)));
                return Ok(idx);
            }
        };
        let entry = match ptr {
            PtrInfo::Struct(s) => {
                let descr = s
                    .descr
                    .ok_or_else(|| Error::internal("virtual struct without size descriptor"))?;
                let kind = if s.known_class.is_some() {
                    VirtualKind::Instance
                } else {
                    VirtualKind::Struct
                };
                self.entries.push(StateEntry::Virtual {
                    kind,
                    descr,
                    class: s.known_class,
                    fields: Vec::new(),
                });
                let layout = opt.descrs.size(descr).map(|l| l.fields.clone()).unwrap_or_default();
                let mut fields = Vec::new();
                for (slot, field) in s.fields.iter().enumerate() {
                    if let (Some(v), Some(&fd)) = (field, layout.get(slot)) {
                        fields.push((fd, self.visit(opt, v, memo)?));
                    }
                }
                StateEntry::Virtual {
                    kind,
                    descr,
                    class: s.known_class,
                    fields,
                }
            }
            PtrInfo::Array(a) => {
                self.entries.push(StateEntry::VArray {
                    descr: a.descr,
                    clear: a.clear,
                    items: Vec::new(),
                });
                let items = self.visit_all(opt, &a.items, memo)?;
                StateEntry::VArray {
                    descr: a.descr,
                    clear: a.clear,
                    items,
                }
            }
            PtrInfo::ArrayStruct(a) => {
                self.entries.push(StateEntry::VArrayStruct {
                    descr: a.descr,
                    length: a.length,
                    fields_per_item: a.fields_per_item,
                    items: Vec::new(),
                });
                let items = self.visit_all(opt, &a.items, memo)?;
                StateEntry::VArrayStruct {
                    descr: a.descr,
                    length: a.length,
                    fields_per_item: a.fields_per_item,
                    items,
                }
            }
            other => {
                return Err(Error::unsupported(format!(
                    "{} virtual at a loop label",
                    other.kind_name()
                )))
            }
        };
        self.entries[idx] = entry;
        Ok(idx)
    }

    fn visit_all(
        &mut self,
        opt: &Optimizer,
        values: &[Option<Operand>],
        memo: &mut HashMap<OpRef, usize>,
    ) -> Result<Vec<Option<usize>>> {
        values
            .iter()
            .map(|v| v.as_ref().map(|v| self.visit(opt, v, memo)).transpose())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of label arguments this state flattens to
    pub fn leaf_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, StateEntry::NotVirtual(info) if info.is_leaf()))
            .count()
    }

    /// Whether every state matching `other` also matches `self`
    pub fn generalization_of(&self, other: &VirtualState) -> bool {
        if self.roots.len() != other.roots.len() {
            return false;
        }
        let mut renum = HashMap::default();
        self.roots
            .iter()
            .zip(&other.roots)
            .all(|(&a, &b)| self.entry_generalizes(a, other, b, &mut renum))
    }

    fn entry_generalizes(
        &self,
        i: usize,
        other: &VirtualState,
        j: usize,
        renum: &mut HashMap<usize, usize>,
    ) -> bool {
        if let Some(&k) = renum.get(&i) {
            return k == j;
        }
        renum.insert(i, j);
        match (&self.entries[i], &other.entries[j]) {
            (StateEntry::NotVirtual(a), StateEntry::NotVirtual(b)) => a.generalizes(b),
            (
                StateEntry::Virtual { descr, class, fields, .. },
                StateEntry::Virtual {
                    descr: d2,
                    class: c2,
                    fields: f2,
                    ..
                },
            ) => {
                descr == d2
                    && class == c2
                    && fields.len() == f2.len()
                    && fields
                        .iter()
                        .zip(f2)
                        .all(|(&(fa, a), &(fb, b))| fa == fb && self.entry_generalizes(a, other, b, renum))
            }
            (
                StateEntry::VArray { descr, clear, items },
                StateEntry::VArray {
                    descr: d2,
                    clear: c2,
                    items: i2,
                },
            ) => descr == d2 && clear == c2 && self.items_generalize(items, other, i2, renum),
            (
                StateEntry::VArrayStruct { descr, length, items, .. },
                StateEntry::VArrayStruct {
                    descr: d2,
                    length: l2,
                    items: i2,
                    ..
                },
            ) => descr == d2 && length == l2 && self.items_generalize(items, other, i2, renum),
            _ => false,
        }
    }

    fn items_generalize(
        &self,
        mine: &[Option<usize>],
        other: &VirtualState,
        theirs: &[Option<usize>],
        renum: &mut HashMap<usize, usize>,
    ) -> bool {
        mine.len() == theirs.len()
            && mine.iter().zip(theirs).all(|(a, b)| match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => self.entry_generalizes(*a, other, *b, renum),
                _ => false,
            })
    }

    /// Emit the guards that make `other` match `self`
    ///
    /// `runtime` holds the observed value of each root; guards are only
    /// generated for facts the runtime values satisfy. Anything else is a
    /// [`Error::BadVirtualState`].
    pub fn generate_guards(
        &self,
        other: &VirtualState,
        runtime: Option<&[RuntimeValue]>,
        emit: &mut dyn FnMut(Op) -> OpRef,
    ) -> Result<()> {
        if self.roots.len() != other.roots.len() {
            return Err(mismatch("label arities differ"));
        }
        let mut renum = HashMap::default();
        for (k, (&a, &b)) in self.roots.iter().zip(&other.roots).enumerate() {
            let seen = runtime.and_then(|values| values.get(k));
            self.guards_for(a, other, b, seen, &mut renum, emit)?;
        }
        Ok(())
    }

    fn guards_for(
        &self,
        i: usize,
        other: &VirtualState,
        j: usize,
        runtime: Option<&RuntimeValue>,
        renum: &mut HashMap<usize, usize>,
        emit: &mut dyn FnMut(Op) -> OpRef,
    ) -> Result<()> {
        if let Some(&k) = renum.get(&i) {
            return if k == j {
                Ok(())
            } else {
                Err(mismatch("shared value split in two"))
            };
        }
        renum.insert(i, j);
        match (&self.entries[i], &other.entries[j]) {
            (StateEntry::NotVirtual(a), StateEntry::NotVirtual(b)) => a.generate_guards(b, runtime, emit),
            (
                StateEntry::Virtual { descr, class, fields, .. },
                StateEntry::Virtual {
                    descr: d2,
                    class: c2,
                    fields: f2,
                    ..
                },
            ) => {
                if descr != d2 || class != c2 || fields.len() != f2.len() {
                    return Err(mismatch("virtual structs differ"));
                }
                for (&(fa, a), &(fb, b)) in fields.iter().zip(f2) {
                    if fa != fb {
                        return Err(mismatch("virtual structs set different fields"));
                    }
                    self.guards_for(a, other, b, None, renum, emit)?;
                }
                Ok(())
            }
            (
                StateEntry::VArray { descr, clear, items },
                StateEntry::VArray {
                    descr: d2,
                    clear: c2,
                    items: i2,
                },
            ) if descr == d2 && clear == c2 => self.item_guards(items, other, i2, renum, emit),
            (
                StateEntry::VArrayStruct { descr, length, items, .. },
                StateEntry::VArrayStruct {
                    descr: d2,
                    length: l2,
                    items: i2,
                    ..
                },
            ) if descr == d2 && length == l2 => self.item_guards(items, other, i2, renum, emit),
            _ => Err(mismatch("virtual shapes differ")),
        }
    }

    fn item_guards(
        &self,
        mine: &[Option<usize>],
        other: &VirtualState,
        theirs: &[Option<usize>],
        renum: &mut HashMap<usize, usize>,
        emit: &mut dyn FnMut(Op) -> OpRef,
    ) -> Result<()> {
        if mine.len() != theirs.len() {
            return Err(mismatch("virtual arrays differ in length"));
        }
        for (a, b) in mine.iter().zip(theirs) {
            match (a, b) {
                (None, None) => {}
                (Some(a), Some(b)) => self.guards_for(*a, other, *b, None, renum, emit)?,
                _ => return Err(mismatch("virtual arrays set different items")),
            }
        }
        Ok(())
    }

    /// Flatten `values` into the label arguments this state expects
    ///
    /// With `force`, values that are virtual where the state expects a real
    /// box are materialized first.
    pub(crate) fn make_inputargs(&self, opt: &mut Optimizer, values: &[Operand], force: bool) -> Result<Vec<Operand>> {
        if values.len() != self.roots.len() {
            return Err(mismatch("wrong number of jump arguments"));
        }
        let mut assigned = vec![None; self.entries.len()];
        for (&root, value) in self.roots.iter().zip(values) {
            self.enum_forced_boxes(opt, root, value, &mut assigned, force)?;
        }
        Ok(self
            .entries
            .iter()
            .zip(assigned)
            .filter_map(|(entry, value)| match entry {
                StateEntry::NotVirtual(info) if info.is_leaf() => value,
                _ => None,
            })
            .collect())
    }

    fn enum_forced_boxes(
        &self,
        opt: &mut Optimizer,
        idx: usize,
        value: &Operand,
        assigned: &mut [Option<Operand>],
        force: bool,
    ) -> Result<()> {
        let value = opt.resolve(value);
        if let Some(existing) = &assigned[idx] {
            return if *existing == value {
                Ok(())
            } else {
                Err(mismatch("one entry receives two different values"))
            };
        }
        match &self.entries[idx] {
            StateEntry::NotVirtual(_) => {
                let value = if !opt.is_virtual(&value) {
                    value
                } else if force {
                    opt.force_box(&value)?
                } else {
                    return Err(mismatch("virtual where a real box is expected"));
                };
                assigned[idx] = Some(value);
            }
            StateEntry::Virtual { descr, fields, .. } => {
                let info = match opt.getptrinfo(&value) {
                    Some(PtrInfo::Struct(s)) if s.is_virtual && s.descr == Some(*descr) => s.clone(),
                    _ => return Err(mismatch("expected a virtual struct")),
                };
                assigned[idx] = Some(value);
                for &(fd, child) in fields {
                    let slot = opt
                        .descrs
                        .field(fd)
                        .map(|f| f.index)
                        .ok_or_else(|| Error::internal("field entry without field descriptor"))?;
                    let field = info
                        .fields
                        .get(slot)
                        .cloned()
                        .flatten()
                        .ok_or_else(|| mismatch("virtual struct misses a field"))?;
                    self.enum_forced_boxes(opt, child, &field, assigned, force)?;
                }
            }
            StateEntry::VArray { descr, items, .. } => {
                let info = match opt.getptrinfo(&value) {
                    Some(PtrInfo::Array(a)) if a.is_virtual && a.descr == *descr => a.items.clone(),
                    _ => return Err(mismatch("expected a virtual array")),
                };
                assigned[idx] = Some(value);
                self.enum_items(opt, items, &info, assigned, force)?;
            }
            StateEntry::VArrayStruct { descr, items, .. } => {
                let info = match opt.getptrinfo(&value) {
                    Some(PtrInfo::ArrayStruct(a)) if a.is_virtual && a.descr == *descr => a.items.clone(),
                    _ => return Err(mismatch("expected a virtual array of structs")),
                };
                assigned[idx] = Some(value);
                self.enum_items(opt, items, &info, assigned, force)?;
            }
        }
        Ok(())
    }

    fn enum_items(
        &self,
        opt: &mut Optimizer,
        entries: &[Option<usize>],
        values: &[Option<Operand>],
        assigned: &mut [Option<Operand>],
        force: bool,
    ) -> Result<()> {
        if entries.len() != values.len() {
            return Err(mismatch("virtual array length changed"));
        }
        for (entry, value) in entries.iter().zip(values) {
            match (entry, value) {
                (Some(e), Some(v)) => self.enum_forced_boxes(opt, *e, v, assigned, force)?,
                (None, None) => {}
                _ => return Err(mismatch("virtual array items changed")),
            }
        }
        Ok(())
    }

    /// Rebuild the label arguments inside a new loop body
    ///
    /// `leaves` are the fresh input arguments, one per leaf entry in entry
    /// order. Virtual entries become placeholder allocations carrying virtual
    /// infos. Returns the operand of each root.
    pub(crate) fn import(&self, opt: &mut Optimizer, leaves: &[Operand]) -> Result<Vec<Operand>> {
        let mut leaves = leaves.iter();
        let mut made = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let operand = match entry {
                StateEntry::NotVirtual(info) if !info.is_leaf() => match &info.constant {
                    Some(c) => Operand::Const(c.clone()),
                    None => return Err(Error::internal("constant entry without a value")),
                },
                StateEntry::NotVirtual(info) => {
                    let leaf = leaves
                        .next()
                        .cloned()
                        .ok_or_else(|| Error::internal("too few label arguments"))?;
                    info.apply(opt, &leaf)?;
                    leaf
                }
                StateEntry::Virtual { kind, descr, .. } => {
                    let opcode = match kind {
                        VirtualKind::Instance => OpCode::NewWithVtable,
                        VirtualKind::Struct => OpCode::New,
                    };
                    Operand::Op(opt.new_op(Op::new(opcode, Type::Ref, vec![]).with_descr(*descr)))
                }
                StateEntry::VArray { descr, clear, items } => {
                    let opcode = if *clear {
                        OpCode::NewArrayClear
                    } else {
                        OpCode::NewArray
                    };
                    let len = Operand::int(items.len() as i64);
                    Operand::Op(opt.new_op(Op::new(opcode, Type::Ref, vec![len]).with_descr(*descr)))
                }
                StateEntry::VArrayStruct { descr, length, .. } => {
                    let len = Operand::int(*length as i64);
                    Operand::Op(opt.new_op(Op::new(OpCode::NewArrayClear, Type::Ref, vec![len]).with_descr(*descr)))
                }
            };
            made.push(operand);
        }
        let pick = |items: &[Option<usize>]| -> Vec<Option<Operand>> {
            items.iter().map(|i| i.map(|i| made[i].clone())).collect()
        };
        let mut infos = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            let Operand::Op(r) = made[idx] else {
                continue;
            };
            let info = match entry {
                StateEntry::NotVirtual(_) => continue,
                StateEntry::Virtual { descr, class, fields, .. } => {
                    let width = opt.descrs.size(*descr).map_or(0, |l| l.fields.len());
                    let mut slots = vec![None; width];
                    for &(fd, child) in fields {
                        if let Some(slot) = opt.descrs.field(fd).map(|f| f.index) {
                            if slot < width {
                                slots[slot] = Some(made[child].clone());
                            }
                        }
                    }
                    PtrInfo::Struct(StructInfo {
                        descr: Some(*descr),
                        known_class: *class,
                        fields: slots,
                        is_virtual: true,
                        last_guard: None,
                    })
                }
                StateEntry::VArray { descr, clear, items } => PtrInfo::Array(ArrayInfo {
                    descr: *descr,
                    items: pick(items),
                    clear: *clear,
                    lenbound: None,
                    is_virtual: true,
                    last_guard: None,
                }),
                StateEntry::VArrayStruct {
                    descr,
                    length,
                    fields_per_item,
                    items,
                } => PtrInfo::ArrayStruct(ArrayStructInfo {
                    descr: *descr,
                    length: *length,
                    items: pick(items),
                    fields_per_item: *fields_per_item,
                    is_virtual: true,
                }),
            };
            infos.push((r, info));
        }
        for (r, info) in infos {
            opt.set_info(r, Info::Ptr(info));
        }
        Ok(self.roots.iter().map(|&i| made[i].clone()).collect())
    }
}

impl fmt::Display for VirtualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, entry) in self.entries.iter().enumerate() {
            write!(f, "{}{}: ", if idx == 0 { "" } else { ", " }, idx)?;
            match entry {
                StateEntry::Virtual { kind, fields, .. } => {
                    let kind = match kind {
                        VirtualKind::Instance => "instance",
                        VirtualKind::Struct => "struct",
                    };
                    write!(f, "virtual {}(", kind)?;
                    for (n, (_, child)) in fields.iter().enumerate() {
                        write!(f, "{}{}", if n == 0 { "" } else { " " }, child)?;
                    }
                    write!(f, ")")?;
                }
                StateEntry::VArray { items, .. } | StateEntry::VArrayStruct { items, .. } => {
                    write!(f, "virtual array[{}]", items.len())?;
                }
                StateEntry::NotVirtual(info) => {
                    write!(f, "{:?}", info.level)?;
                    if let Some(c) = &info.constant {
                        write!(f, " {}", c)?;
                    }
                    if let Some(b) = &info.intbound {
                        write!(f, " {}", b)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_trace;
    use pretty_assertions::assert_eq;

    const DECLS: &str = "struct Node class=1 { value: int, next: ref }\n\
                         struct Pair { a: int, b: int }\n\
                         array IntArr int\n";

    /// Run the body (without its final op) and capture the final op's args
    fn state_of(body: &str) -> (Optimizer, VirtualState, Vec<Operand>) {
        let source = format!("{}---\n{}", DECLS, body);
        let trace = parse_trace(&source).unwrap();
        let mut opt = Optimizer::new();
        opt.start(&trace);
        let (&last, ops) = trace.ops.split_last().unwrap();
        for &r in ops {
            opt.propagate_input(r).unwrap();
        }
        let args = trace.op(last).args.clone();
        let state = VirtualState::capture(&opt, &args).unwrap();
        (opt, state, args)
    }

    fn guards(target: &VirtualState, other: &VirtualState, runtime: &[RuntimeValue]) -> Result<Vec<OpCode>> {
        let mut ops = Vec::new();
        let mut emit = |op: Op| {
            ops.push(op.opcode);
            OpRef(1000 + ops.len() as u32)
        };
        target.generate_guards(other, Some(runtime), &mut emit)?;
        Ok(ops)
    }

    #[test]
    fn test_unknown_generalizes_nonnull() {
        let (_, unknown, _) = state_of("[p0]\njump(p0)\n");
        let (_, nonnull, _) = state_of("[p0]\nguard_nonnull(p0) []\njump(p0)\n");
        assert!(unknown.generalization_of(&nonnull));
        assert!(!nonnull.generalization_of(&unknown));
        assert!(unknown.generalization_of(&unknown));
    }

    #[test]
    fn test_known_class_levels() {
        let (_, class1, _) = state_of("[p0]\nguard_class(p0, 1) []\njump(p0)\n");
        let (_, class2, _) = state_of("[p0]\nguard_class(p0, 2) []\njump(p0)\n");
        let (_, nonnull, _) = state_of("[p0]\nguard_nonnull(p0) []\njump(p0)\n");
        assert!(nonnull.generalization_of(&class1));
        assert!(!class1.generalization_of(&class2));
        assert!(!class1.generalization_of(&nonnull));
    }

    #[test]
    fn test_intbound_containment() {
        let (_, wide, _) = state_of("[i0]\ni1 = int_lt(i0, 100)\nguard_true(i1) []\njump(i0)\n");
        let (_, narrow, _) = state_of("[i0]\ni1 = int_lt(i0, 10)\nguard_true(i1) []\njump(i0)\n");
        let (_, constant, _) = state_of("[i0]\njump(5)\n");
        assert!(wide.generalization_of(&narrow));
        assert!(wide.generalization_of(&constant));
        assert!(!narrow.generalization_of(&wide));
        assert!(!constant.generalization_of(&narrow));
    }

    #[test]
    fn test_virtual_struct_captured() {
        let (_, state, _) = state_of(
            "[i0]\np1 = new_with_vtable(descr=Node)\nsetfield_gc(p1, i0, descr=Node.value)\njump(p1)\n",
        );
        assert_eq!(state.roots, vec![0]);
        assert!(matches!(
            state.entries[0],
            StateEntry::Virtual {
                kind: VirtualKind::Instance,
                class: Some(1),
                ..
            }
        ));
        assert_eq!(state.leaf_count(), 1);
        assert_eq!(state.to_string(), "0: virtual instance(1), 1: Unknown");
    }

    #[test]
    fn test_virtual_does_not_match_real_box() {
        let (_, virt, _) = state_of("[i0]\np1 = new(descr=Pair)\nsetfield_gc(p1, i0, descr=Pair.a)\njump(p1)\n");
        let (_, real, _) = state_of("[p0]\njump(p0)\n");
        assert!(!virt.generalization_of(&real));
        assert!(!real.generalization_of(&virt));
    }

    #[test]
    fn test_shared_values_stay_shared() {
        let (_, shared, _) = state_of("[i0]\njump(i0, i0)\n");
        let (_, split, _) = state_of("[i0, i1]\njump(i0, i1)\n");
        assert_eq!(shared.leaf_count(), 1);
        assert!(split.generalization_of(&shared));
        assert!(!shared.generalization_of(&split));
    }

    #[test]
    fn test_guards_for_class() {
        let (_, class1, _) = state_of("[p0]\nguard_class(p0, 1) []\njump(p0)\n");
        let (_, unknown, _) = state_of("[p0]\njump(p0)\n");
        let (_, nonnull, _) = state_of("[p0]\nguard_nonnull(p0) []\njump(p0)\n");
        let object = [RuntimeValue::Object { class: Some(1) }];
        assert_eq!(guards(&class1, &unknown, &object).unwrap(), vec![OpCode::GuardNonnullClass]);
        assert_eq!(guards(&class1, &nonnull, &object).unwrap(), vec![OpCode::GuardClass]);
        assert!(guards(&class1, &unknown, &[RuntimeValue::Null]).is_err());
        assert!(guards(&class1, &unknown, &[RuntimeValue::Object { class: Some(2) }]).is_err());
    }

    #[test]
    fn test_guards_for_nonnull_and_bounds() {
        let (_, nonnull, _) = state_of("[p0]\nguard_nonnull(p0) []\njump(p0)\n");
        let (_, unknown, _) = state_of("[p0]\njump(p0)\n");
        assert_eq!(
            guards(&nonnull, &unknown, &[RuntimeValue::Object { class: None }]).unwrap(),
            vec![OpCode::GuardNonnull]
        );
        let (_, narrow, _) = state_of("[i0]\ni1 = int_lt(i0, 10)\nguard_true(i1) []\njump(i0)\n");
        let (_, free, _) = state_of("[i0]\njump(i0)\n");
        assert_eq!(
            guards(&narrow, &free, &[RuntimeValue::Int(3)]).unwrap(),
            vec![OpCode::IntLe, OpCode::GuardTrue]
        );
        let err = guards(&narrow, &free, &[RuntimeValue::Int(30)]).unwrap_err();
        assert!(matches!(err, Error::BadVirtualState(_)));
    }

    #[test]
    fn test_guard_for_constant() {
        let (_, constant, _) = state_of("[i0]\njump(5)\n");
        let (_, free, _) = state_of("[i0]\njump(i0)\n");
        assert_eq!(guards(&constant, &free, &[RuntimeValue::Int(5)]).unwrap(), vec![OpCode::GuardValue]);
        assert!(guards(&constant, &free, &[RuntimeValue::Int(6)]).is_err());
    }

    #[test]
    fn test_make_inputargs_flattens_virtuals() {
        let (mut opt, state, args) = state_of(
            "[i0, i1]\np2 = new(descr=Pair)\nsetfield_gc(p2, i0, descr=Pair.a)\n\
             setfield_gc(p2, i1, descr=Pair.b)\njump(p2, 7)\n",
        );
        let leaves = state.make_inputargs(&mut opt, &args, false).unwrap();
        assert_eq!(leaves, vec![Operand::Op(OpRef(0)), Operand::Op(OpRef(1))]);
    }

    #[test]
    fn test_make_inputargs_rejects_real_box_for_virtual() {
        let (_, virt, _) = state_of("[i0]\np1 = new(descr=Pair)\nsetfield_gc(p1, i0, descr=Pair.a)\njump(p1)\n");
        let (mut opt, _, args) = state_of("[p0]\njump(p0)\n");
        let err = virt.make_inputargs(&mut opt, &args, true).unwrap_err();
        assert!(matches!(err, Error::BadVirtualState(_)));
    }

    #[test]
    fn test_make_inputargs_forces_when_asked() {
        let (_, real, _) = state_of("[p0]\njump(p0)\n");
        let (mut opt, _, args) = state_of("[i0]\np1 = new(descr=Pair)\nsetfield_gc(p1, i0, descr=Pair.a)\njump(p1)\n");
        assert!(real.make_inputargs(&mut opt, &args, false).is_err());
        let leaves = real.make_inputargs(&mut opt, &args, true).unwrap();
        assert_eq!(leaves.len(), 1);
        assert!(!opt.is_virtual(&leaves[0]));
        let emitted: Vec<OpCode> = opt.out.iter().map(|&r| opt.op(r).opcode).collect();
        assert_eq!(emitted, vec![OpCode::New, OpCode::SetfieldGc]);
    }

    #[test]
    fn test_import_restores_facts_and_virtuals() {
        let (_, state, _) = state_of(
            "[i0, p1]\nguard_class(p1, 1) []\np2 = new(descr=Pair)\n\
             setfield_gc(p2, i0, descr=Pair.a)\njump(p2, p1)\n",
        );
        let trace = parse_trace(&format!("{}---\n[i0, p1]\nfinish()\n", DECLS)).unwrap();
        let mut opt = Optimizer::new();
        opt.start(&trace);
        let leaves = vec![Operand::Op(OpRef(0)), Operand::Op(OpRef(1))];
        let roots = state.import(&mut opt, &leaves).unwrap();
        assert!(opt.is_virtual(&roots[0]));
        assert_eq!(roots[1], leaves[1]);
        assert_eq!(opt.known_class(&leaves[1]), Some(1));
        let again = VirtualState::capture(&opt, &roots).unwrap();
        assert!(state.generalization_of(&again));
        assert!(again.generalization_of(&state));
    }
}
