//! Heap caching
//!
//! Known field and constant-index item values are cached per descriptor and
//! object. Stores are kept lazy: at most one pending write per slot, emitted
//! only when something may observe it. Guards do not flush writes of virtual
//! values; those are recorded as pending fields in the guard's recovery
//! data instead.

use super::{Flow, Optimizer, Pass};
use crate::error::Result;
use crate::intbound::IntBound;
use crate::ir::{DescrRef, EffectInfo, OpCode, OpRef, OopSpec, Operand};
use crate::resume::PendingField;
use rustc_hash::FxHashMap as HashMap;
use tracing::trace;

/// Flag argument of a dict lookup that deletes the entry
const DICT_FLAG_DELETE: i64 = 2;

/// A cached memory location: a field, or an item at a constant index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Slot {
    Field(DescrRef),
    /// Array or interior field descriptor and index
    Item(DescrRef, i64),
}

impl Slot {
    fn descr(self) -> DescrRef {
        match self {
            Slot::Field(d) | Slot::Item(d, _) => d,
        }
    }

    fn index(self) -> Option<i64> {
        match self {
            Slot::Field(_) => None,
            Slot::Item(_, i) => Some(i),
        }
    }
}

#[derive(Debug, Default)]
struct CachedField {
    /// Value in memory, by object
    cached: HashMap<Operand, Operand>,
    /// Store not emitted yet
    lazy: Option<OpRef>,
}

#[derive(Debug, Default)]
pub(crate) struct HeapState {
    slots: HashMap<Slot, CachedField>,
    /// Comparison, ovf operation or `call_may_force` waiting for the next operation
    postponed: Option<OpRef>,
    /// Dict lookup results by storage descriptor, dict and key
    dict_lookups: HashMap<(DescrRef, Operand, Operand), Operand>,
    seen_guard_not_invalidated: bool,
    remove_next_guard_not_invalidated: bool,
}

impl Optimizer {
    pub(crate) fn optimize_heap(&mut self, r: OpRef) -> Result<Flow> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        let lazy_store = matches!(opcode, SetfieldGc | SetarrayitemGc | SetinteriorfieldGc);
        if !opcode.is_guard() && !lazy_store {
            self.emit_postponed()?;
        }
        match opcode {
            GetfieldGc => return self.heap_getfield(r),
            SetfieldGc => return self.heap_setfield(r),
            GetarrayitemGc | GetinteriorfieldGc => return self.heap_getitem(r),
            SetarrayitemGc | SetinteriorfieldGc => return self.heap_setitem(r),
            QuasiimmutField => return self.heap_quasiimmut(r),
            GuardNotInvalidated => {
                let remove = std::mem::take(&mut self.heap.remove_next_guard_not_invalidated);
                if remove || self.heap.seen_guard_not_invalidated {
                    return Ok(Flow::Done);
                }
                self.heap.seen_guard_not_invalidated = true;
            }
            Call => {
                if let Some((key, flag)) = self.dict_lookup_key(r) {
                    if flag != DICT_FLAG_DELETE {
                        if let Some(found) = self.heap.dict_lookups.get(&key).cloned() {
                            self.stats_mut().heap_hits += 1;
                            return self.replace_with(r, &found);
                        }
                    }
                }
            }
            _ => {}
        }
        self.heap_emitting_operation(r)?;
        self.emit_postponed()?;
        if opcode.is_comparison() || opcode == CallMayForce || opcode.is_ovf() {
            self.heap.postponed = Some(r);
            return Ok(Flow::Done);
        }
        Ok(Flow::Emit(r))
    }

    pub(crate) fn postprocess_heap(&mut self, r: OpRef) -> Result<()> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        match opcode {
            GetfieldGc => {
                let obj = self.arg(r, 0);
                self.make_nonnull(&obj);
                if let Some(descr) = self.op(r).descr {
                    self.heap_cache_read(Slot::Field(descr), &obj, Operand::Op(r));
                }
            }
            GetarrayitemGc | GetinteriorfieldGc => {
                let arr = self.arg(r, 0);
                let (Some(descr), Some(index)) = (self.op(r).descr, self.get_constant_int(&self.arg(r, 1)))
                else {
                    return Ok(());
                };
                self.heap_cache_read(Slot::Item(descr, index), &arr, Operand::Op(r));
                if index >= 0 {
                    let array = self.array_descr_of(descr);
                    let bound = IntBound::new(index + 1, i64::MAX)?;
                    self.update_lenbound(&arr, Some(array), None, &bound)?;
                }
            }
            Call => {
                if let Some((key, flag)) = self.dict_lookup_key(r) {
                    if flag == DICT_FLAG_DELETE {
                        self.heap.dict_lookups.retain(|k, _| k.0 != key.0);
                    } else if flag == 0 {
                        self.heap.dict_lookups.insert(key, Operand::Op(r));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Emit the postponed operation and every lazy write
    pub(crate) fn heap_flush(&mut self) -> Result<()> {
        self.emit_postponed()?;
        self.force_all_lazy_writes()
    }

    /// Record a store emitted outside the heap pass
    pub(crate) fn heap_remember_store(
        &mut self,
        descr: DescrRef,
        target: &Operand,
        index: Option<i64>,
        value: &Operand,
    ) {
        let slot = match index {
            Some(i) => Slot::Item(descr, i),
            None => Slot::Field(descr),
        };
        self.heap_register_write(slot, target, value);
    }

    /// Cached memory contents as `(descr, constant index, object, value)`
    pub(crate) fn heap_entries(&self) -> Vec<(DescrRef, Option<i64>, Operand, Operand)> {
        let mut entries: Vec<(Slot, Operand, Operand)> = self
            .heap
            .slots
            .iter()
            .flat_map(|(slot, entry)| {
                entry
                    .cached
                    .iter()
                    .map(move |(obj, value)| (*slot, self.resolve(obj), self.resolve(value)))
            })
            .collect();
        entries.sort_by_key(|(slot, _, _)| *slot);
        entries
            .into_iter()
            .map(|(slot, obj, value)| (slot.descr(), slot.index(), obj, value))
            .collect()
    }

    /// Seed the cache with a value known to be in memory
    pub(crate) fn heap_import(
        &mut self,
        descr: DescrRef,
        index: Option<i64>,
        obj: &Operand,
        value: Operand,
    ) {
        let slot = match index {
            Some(i) => Slot::Item(descr, i),
            None => Slot::Field(descr),
        };
        self.heap_cache_read(slot, obj, value);
    }

    fn emit_postponed(&mut self) -> Result<()> {
        if let Some(p) = self.heap.postponed.take() {
            self.emit(p)?;
            self.postprocess_heap(p)?;
        }
        Ok(())
    }

    // ========== Aliasing ==========

    /// Whether two pointers may name the same object
    fn heap_may_alias(&self, a: &Operand, b: &Operand) -> bool {
        let (a, b) = (self.resolve(a), self.resolve(b));
        if a == b {
            return true;
        }
        if a.is_const() && b.is_const() {
            return false;
        }
        !matches!(
            (self.known_class(&a), self.known_class(&b)),
            (Some(x), Some(y)) if x != y
        )
    }

    /// Array descriptor an item slot belongs to, for effect checks
    fn array_descr_of(&self, descr: DescrRef) -> DescrRef {
        self.descrs.interior(descr).map_or(descr, |f| f.array)
    }

    fn slot_is_always_pure(&self, slot: Slot) -> bool {
        match slot {
            Slot::Field(d) => self.descrs.is_always_pure(d),
            Slot::Item(d, _) => self.descrs.is_always_pure(self.array_descr_of(d)),
        }
    }

    // ========== Cache entries ==========

    fn heap_cache_read(&mut self, slot: Slot, obj: &Operand, value: Operand) {
        let obj = self.resolve(obj);
        self.heap.slots.entry(slot).or_default().cached.insert(obj, value);
    }

    /// A store reached memory: forget what it may have overwritten
    fn heap_register_write(&mut self, slot: Slot, target: &Operand, value: &Operand) {
        let target = self.resolve(target);
        let stale: Vec<Operand> = match self.heap.slots.get(&slot) {
            Some(entry) => entry
                .cached
                .keys()
                .filter(|obj| self.heap_may_alias(obj, &target))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let entry = self.heap.slots.entry(slot).or_default();
        for obj in stale {
            entry.cached.remove(&obj);
        }
        entry.cached.insert(target, value.clone());
    }

    fn lazy_target(&self, store: OpRef) -> Operand {
        self.resolve(&self.op(store).args[0])
    }

    fn lazy_value(&self, store: OpRef) -> Operand {
        let args = &self.op(store).args;
        self.resolve(&args[args.len() - 1])
    }

    /// Lazy writes in the order they were recorded
    fn lazy_writes(&self) -> Vec<(Slot, OpRef)> {
        let mut lazy: Vec<(Slot, OpRef)> = self
            .heap
            .slots
            .iter()
            .filter_map(|(slot, entry)| entry.lazy.map(|store| (*slot, store)))
            .collect();
        lazy.sort_by_key(|(_, store)| *store);
        lazy
    }

    fn force_lazy_write(&mut self, slot: Slot) -> Result<()> {
        let Some(store) = self.heap.slots.get_mut(&slot).and_then(|e| e.lazy.take()) else {
            return Ok(());
        };
        if let Some(p) = self.heap.postponed {
            // a write recorded after a call must not move before it
            let must_follow = self.op(p).opcode == OpCode::CallMayForce
                || self
                    .op(store)
                    .args
                    .iter()
                    .any(|a| self.resolve(a) == Operand::Op(p));
            if must_follow {
                self.emit_postponed()?;
            }
        }
        trace!(op = %self.op(store).opcode, result = store.0, "flush lazy write");
        self.emit_extra(Pass::Heap, store)?;
        let (target, value) = (self.lazy_target(store), self.lazy_value(store));
        self.heap_register_write(slot, &target, &value);
        Ok(())
    }

    fn force_all_lazy_writes(&mut self) -> Result<()> {
        for (slot, _) in self.lazy_writes() {
            self.force_lazy_write(slot)?;
        }
        Ok(())
    }

    /// Drop every cache entry except those of immutable descriptors
    fn clean_caches(&mut self) {
        let keep: Vec<Slot> = self
            .heap
            .slots
            .keys()
            .copied()
            .filter(|slot| self.slot_is_always_pure(*slot))
            .collect();
        self.heap.slots.retain(|slot, _| keep.contains(slot));
        self.heap.dict_lookups.clear();
    }

    // ========== Side effects ==========

    fn heap_emitting_operation(&mut self, r: OpRef) -> Result<()> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        if opcode.has_no_side_effect() || opcode.is_ovf() {
            return Ok(());
        }
        if opcode.is_guard() {
            return self.lazy_writes_for_guard();
        }
        match opcode {
            SetfieldGc | SetarrayitemGc | SetinteriorfieldGc | Copystrcontent
            | Copyunicodecontent | Strsetitem | Unicodesetitem | SetarrayitemRaw | RawStore
            | DebugMergePoint => return Ok(()),
            Escape => return self.force_all_lazy_writes(),
            Call | CallLoopinvariant | CondCall | CallReleaseGil => {
                if let Some(effect) = self.effect_of(r).cloned() {
                    if effect.can_invalidate() {
                        self.heap.seen_guard_not_invalidated = false;
                    }
                    if !effect.has_random_effects() {
                        return self.force_from_effectinfo(&effect);
                    }
                }
            }
            _ => {}
        }
        self.force_all_lazy_writes()?;
        self.clean_caches();
        Ok(())
    }

    /// Lazy writes of virtual values ride on the guard; the rest are flushed
    fn lazy_writes_for_guard(&mut self) -> Result<()> {
        for (slot, store) in self.lazy_writes() {
            let value = self.lazy_value(store);
            if self.is_virtual(&value) {
                let field = PendingField {
                    target: self.lazy_target(store),
                    descr: slot.descr(),
                    index: slot.index(),
                    value,
                };
                self.pending_guard_fields.push(field);
            } else {
                self.force_lazy_write(slot)?;
            }
        }
        Ok(())
    }

    fn force_from_effectinfo(&mut self, effect: &EffectInfo) -> Result<()> {
        let slots: Vec<Slot> = self.heap.slots.keys().copied().collect();
        let mut written = Vec::new();
        for slot in slots {
            let (reads, writes) = match slot {
                Slot::Field(d) => (effect.reads_field(d), effect.writes_field(d)),
                Slot::Item(d, _) => {
                    let array = self.array_descr_of(d);
                    (effect.reads_array(array), effect.writes_array(array))
                }
            };
            if reads || writes {
                self.force_lazy_write(slot)?;
            }
            if writes {
                written.push(slot);
            }
        }
        for slot in written {
            if let Some(entry) = self.heap.slots.get_mut(&slot) {
                entry.cached.clear();
            }
        }
        self.heap
            .dict_lookups
            .retain(|(storage, _, _), _| !effect.writes_array(*storage));
        Ok(())
    }

    // ========== Fields ==========

    /// Cached value of `obj` in `slot`, flushing a lazy write that may alias
    fn heap_read(&mut self, slot: Slot, obj: &Operand) -> Result<Option<Operand>> {
        let obj = self.resolve(obj);
        if let Some(store) = self.heap.slots.get(&slot).and_then(|e| e.lazy) {
            let target = self.lazy_target(store);
            if target == obj {
                return Ok(Some(self.lazy_value(store)));
            }
            if self.heap_may_alias(&target, &obj) {
                self.force_lazy_write(slot)?;
            }
        }
        Ok(self
            .heap
            .slots
            .get(&slot)
            .and_then(|e| e.cached.get(&obj))
            .map(|v| self.resolve(v)))
    }

    fn heap_write(&mut self, slot: Slot, r: OpRef, obj: &Operand, value: &Operand) -> Result<Flow> {
        let obj = self.resolve(obj);
        if let Some(store) = self.heap.slots.get(&slot).and_then(|e| e.lazy) {
            if self.lazy_target(store) != obj {
                self.force_lazy_write(slot)?;
            }
        }
        let known = self
            .heap
            .slots
            .get(&slot)
            .and_then(|e| e.cached.get(&obj))
            .map(|v| self.resolve(v));
        let entry = self.heap.slots.entry(slot).or_default();
        // storing the value memory already holds cancels a pending write
        entry.lazy = if known.as_ref() == Some(value) {
            None
        } else {
            Some(r)
        };
        Ok(Flow::Done)
    }

    fn heap_getfield(&mut self, r: OpRef) -> Result<Flow> {
        let Some(descr) = self.op(r).descr else {
            return Ok(Flow::Emit(r));
        };
        if let Some(value) = self.heap_read(Slot::Field(descr), &self.arg(r, 0))? {
            self.stats_mut().heap_hits += 1;
            return self.replace_with(r, &value);
        }
        Ok(Flow::Emit(r))
    }

    fn heap_setfield(&mut self, r: OpRef) -> Result<Flow> {
        let Some(descr) = self.op(r).descr else {
            return Ok(Flow::Emit(r));
        };
        let (obj, value) = (self.arg(r, 0), self.arg(r, 1));
        self.heap_write(Slot::Field(descr), r, &obj, &value)
    }

    // ========== Arrays ==========

    /// Lazy item writes of `descr` whose index satisfies `hit`
    fn lazy_items(&self, descr: DescrRef, hit: impl Fn(i64) -> bool) -> Vec<Slot> {
        self.lazy_writes()
            .into_iter()
            .map(|(slot, _)| slot)
            .filter(|slot| matches!(*slot, Slot::Item(d, i) if d == descr && hit(i)))
            .collect()
    }

    fn heap_getitem(&mut self, r: OpRef) -> Result<Flow> {
        let Some(descr) = self.op(r).descr else {
            return Ok(Flow::Emit(r));
        };
        let (arr, index) = (self.arg(r, 0), self.arg(r, 1));
        match self.get_constant_int(&index) {
            Some(i) => {
                if let Some(value) = self.heap_read(Slot::Item(descr, i), &arr)? {
                    self.stats_mut().heap_hits += 1;
                    return self.replace_with(r, &value);
                }
            }
            None => {
                let bound = self.getintbound(&index);
                for slot in self.lazy_items(descr, |i| bound.contains(i)) {
                    self.force_lazy_write(slot)?;
                }
            }
        }
        Ok(Flow::Emit(r))
    }

    fn heap_setitem(&mut self, r: OpRef) -> Result<Flow> {
        let Some(descr) = self.op(r).descr else {
            return Ok(Flow::Emit(r));
        };
        let (arr, index, value) = (self.arg(r, 0), self.arg(r, 1), self.arg(r, 2));
        if let Some(i) = self.get_constant_int(&index) {
            return self.heap_write(Slot::Item(descr, i), r, &arr, &value);
        }
        for slot in self.lazy_items(descr, |_| true) {
            self.force_lazy_write(slot)?;
        }
        self.heap
            .slots
            .retain(|slot, _| !matches!(*slot, Slot::Item(d, _) if d == descr));
        Ok(Flow::Emit(r))
    }

    // ========== Quasi-immutable fields ==========

    fn heap_quasiimmut(&mut self, r: OpRef) -> Result<Flow> {
        match (self.arg(r, 0), self.op(r).descr) {
            (Operand::Const(obj), Some(descr)) => {
                let dep = (obj, descr);
                if !self.quasi_immutable_deps.contains(&dep) {
                    self.quasi_immutable_deps.push(dep);
                }
            }
            _ => self.heap.remove_next_guard_not_invalidated = true,
        }
        Ok(Flow::Done)
    }

    // ========== Dict lookups ==========

    /// Cache key and flag of a `dict_lookup(dict, key, flag)` helper call
    fn dict_lookup_key(&self, r: OpRef) -> Option<((DescrRef, Operand, Operand), i64)> {
        let effect = self.effect_of(r)?;
        if effect.oopspec() != OopSpec::DictLookup {
            return None;
        }
        let storage = effect.dict_storage?;
        let args = &self.op(r).args;
        if args.len() < 3 {
            return None;
        }
        let flag = self.get_constant_int(&args[2])?;
        Some(((storage, self.resolve(&args[0]), self.resolve(&args[1])), flag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_trace;
    use crate::ir::Trace;
    use pretty_assertions::assert_eq;

    const DECLS: &str = "struct Node class=1 { value: int, next: ref }\n\
                         struct Other class=2 { value: int }\n\
                         array A int\n\
                         call f(ref) -> int writes=Node.value\n\
                         call g(ref) -> int reads=Node.value\n\
                         call h(int) -> int\n";

    fn optimize(body: &str) -> (Trace, Optimizer) {
        let trace = parse_trace(&format!("{}---\n{}", DECLS, body)).unwrap();
        let mut opt = Optimizer::new();
        let out = opt.optimize(&trace).unwrap();
        (out, opt)
    }

    #[test]
    fn test_repeated_read() {
        let (out, opt) = optimize(
            "[p0]\ni1 = getfield_gc(p0, descr=Node.value)\ni2 = getfield_gc(p0, descr=Node.value)\nfinish(i1, i2)\n",
        );
        assert_eq!(out.opcodes(), vec![OpCode::GetfieldGc, OpCode::Finish]);
        assert_eq!(opt.stats().heap_hits, 1);
    }

    #[test]
    fn test_call_writing_field_invalidates() {
        let (out, _) = optimize(
            "[p0]\n\
             i1 = getfield_gc(p0, descr=Node.value)\n\
             i2 = call_i(p0, descr=f)\n\
             i3 = getfield_gc(p0, descr=Node.value)\n\
             finish(i1, i2, i3)\n",
        );
        assert_eq!(
            out.opcodes(),
            vec![OpCode::GetfieldGc, OpCode::Call, OpCode::GetfieldGc, OpCode::Finish]
        );
    }

    #[test]
    fn test_call_without_effect_keeps_cache() {
        let (out, _) = optimize(
            "[p0, i9]\n\
             i1 = getfield_gc(p0, descr=Node.value)\n\
             i2 = call_i(i9, descr=h)\n\
             i3 = getfield_gc(p0, descr=Node.value)\n\
             finish(i1, i2, i3)\n",
        );
        assert_eq!(out.count(OpCode::GetfieldGc), 1);
    }

    #[test]
    fn test_write_then_read_forwards_value() {
        let (out, _) = optimize(
            "[p0, i1]\n\
             setfield_gc(p0, i1, descr=Node.value)\n\
             i2 = getfield_gc(p0, descr=Node.value)\n\
             finish(i2)\n",
        );
        assert_eq!(out.opcodes(), vec![OpCode::SetfieldGc, OpCode::Finish]);
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::Op(OpRef(1)));
    }

    #[test]
    fn test_overwritten_lazy_write_dropped() {
        let (out, _) = optimize(
            "[p0, i1]\n\
             setfield_gc(p0, i1, descr=Node.value)\n\
             setfield_gc(p0, 7, descr=Node.value)\n\
             finish(i1)\n",
        );
        assert_eq!(out.count(OpCode::SetfieldGc), 1);
        let (_, set) = out.iter().find(|(_, op)| op.opcode == OpCode::SetfieldGc).unwrap();
        assert_eq!(set.args[1], Operand::int(7));
    }

    #[test]
    fn test_store_of_known_value_removed() {
        let (out, _) = optimize(
            "[p0]\n\
             i1 = getfield_gc(p0, descr=Node.value)\n\
             setfield_gc(p0, i1, descr=Node.value)\n\
             finish(i1)\n",
        );
        assert_eq!(out.opcodes(), vec![OpCode::GetfieldGc, OpCode::Finish]);
    }

    #[test]
    fn test_aliasing_write_invalidates() {
        let (out, _) = optimize(
            "[p0, p1, i2]\n\
             i3 = getfield_gc(p0, descr=Node.value)\n\
             setfield_gc(p1, i2, descr=Node.value)\n\
             i4 = getfield_gc(p0, descr=Node.value)\n\
             finish(i3, i4)\n",
        );
        assert_eq!(out.count(OpCode::GetfieldGc), 2);
    }

    #[test]
    fn test_distinct_classes_do_not_alias() {
        let (out, _) = optimize(
            "[p0, p1, i2]\n\
             guard_class(p0, ConstClass(Node)) []\n\
             guard_class(p1, ConstClass(Other)) []\n\
             i3 = getfield_gc(p0, descr=Node.value)\n\
             setfield_gc(p1, i2, descr=Node.value)\n\
             i4 = getfield_gc(p0, descr=Node.value)\n\
             finish(i3, i4)\n",
        );
        assert_eq!(out.count(OpCode::GetfieldGc), 1);
    }

    #[test]
    fn test_reading_call_flushes_lazy_write() {
        let (out, _) = optimize(
            "[p0, i1]\n\
             setfield_gc(p0, i1, descr=Node.value)\n\
             i2 = call_i(p0, descr=g)\n\
             i3 = getfield_gc(p0, descr=Node.value)\n\
             finish(i2, i3)\n",
        );
        assert_eq!(
            out.opcodes(),
            vec![OpCode::SetfieldGc, OpCode::Call, OpCode::Finish]
        );
    }

    #[test]
    fn test_comparison_stays_next_to_guard() {
        let (out, _) = optimize(
            "[p0, i1]\n\
             i2 = int_lt(i1, 10)\n\
             setfield_gc(p0, i1, descr=Node.value)\n\
             guard_true(i2) []\n\
             finish(i1)\n",
        );
        assert_eq!(
            out.opcodes(),
            vec![OpCode::SetfieldGc, OpCode::IntLt, OpCode::GuardTrue, OpCode::Finish]
        );
    }

    #[test]
    fn test_virtual_value_becomes_pending_field() {
        let (out, _) = optimize(
            "[p0, i1]\n\
             p2 = new(descr=Node)\n\
             setfield_gc(p0, p2, descr=Node.next)\n\
             guard_true(i1) []\n\
             finish(i1)\n",
        );
        let guard = out.ops[0];
        let resume = out.op(guard).resume.clone().unwrap();
        assert_eq!(resume.pending_fields.len(), 1);
        assert_eq!(
            out.opcodes(),
            vec![
                OpCode::GuardTrue,
                OpCode::New,
                OpCode::SetfieldGc,
                OpCode::Finish
            ]
        );
    }

    #[test]
    fn test_constant_index_items() {
        let (out, opt) = optimize(
            "[p0, i1]\n\
             setarrayitem_gc(p0, 2, i1, descr=A)\n\
             i2 = getarrayitem_gc(p0, 2, descr=A)\n\
             i3 = getarrayitem_gc(p0, 3, descr=A)\n\
             i4 = arraylen_gc(p0, descr=A)\n\
             i5 = int_ge(i4, 4)\n\
             finish(i2, i3, i5)\n",
        );
        assert_eq!(
            out.opcodes(),
            vec![
                OpCode::GetarrayitemGc,
                OpCode::ArraylenGc,
                OpCode::SetarrayitemGc,
                OpCode::Finish
            ]
        );
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[2], Operand::int(1));
        assert_eq!(opt.stats().heap_hits, 1);
    }

    #[test]
    fn test_variable_index_write_invalidates() {
        let (out, _) = optimize(
            "[p0, i1]\n\
             i2 = getarrayitem_gc(p0, 0, descr=A)\n\
             setarrayitem_gc(p0, i1, 5, descr=A)\n\
             i3 = getarrayitem_gc(p0, 0, descr=A)\n\
             finish(i2, i3)\n",
        );
        assert_eq!(out.count(OpCode::GetarrayitemGc), 2);
    }

    #[test]
    fn test_guard_not_invalidated_deduplicated() {
        let (out, _) = optimize(
            "[i0]\n\
             guard_not_invalidated() []\n\
             i1 = call_i(i0, descr=h)\n\
             guard_not_invalidated() []\n\
             finish(i1)\n",
        );
        assert_eq!(out.count(OpCode::GuardNotInvalidated), 1);
    }

    #[test]
    fn test_quasiimmut_on_constant_records_dependency() {
        let source = "struct Cell { quasi value: int }\nobject c: Cell\n---\n[]\n\
             quasiimmut_field(ConstPtr(c), descr=Cell.value)\n\
             guard_not_invalidated() []\n\
             i1 = getfield_gc(ConstPtr(c), descr=Cell.value)\n\
             finish(i1)\n";
        let trace = parse_trace(source).unwrap();
        let out = Optimizer::new().optimize(&trace).unwrap();
        assert_eq!(out.quasi_immutable_deps.len(), 1);
        assert_eq!(out.count(OpCode::QuasiimmutField), 0);
        assert_eq!(out.count(OpCode::GuardNotInvalidated), 1);
    }

    #[test]
    fn test_dict_lookup_cached() {
        let source = "array Storage int\n\
             call lookup(ref, int, int) -> int oopspec=dict_lookup storage=Storage reads=Storage\n\
             call delete(ref, int, int) -> int oopspec=dict_lookup storage=Storage writes=Storage\n\
             ---\n[p0, i1]\n\
             i2 = call_i(p0, i1, 0, descr=lookup)\n\
             i3 = call_i(p0, i1, 0, descr=lookup)\n\
             i4 = call_i(p0, i1, 2, descr=delete)\n\
             i5 = call_i(p0, i1, 0, descr=lookup)\n\
             finish(i2, i3, i4, i5)\n";
        let trace = parse_trace(source).unwrap();
        let out = Optimizer::new().optimize(&trace).unwrap();
        assert_eq!(out.count(OpCode::Call), 3);
    }
}
