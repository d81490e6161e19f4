//! Escape analysis
//!
//! Allocations become virtual: no operation is emitted and field or item
//! accesses are answered from the [`PtrInfo`] slots. A virtual is forced when
//! it escapes. Forcing emits the allocation under the virtual's own result
//! reference, followed by one store per populated slot.

use super::{Flow, Optimizer, Pass};
use crate::error::{Error, Result};
use crate::info::{ArrayInfo, ArrayStructInfo, Info, PtrInfo, RawBufferInfo, RawSliceInfo, StructInfo};
use crate::intbound::IntBound;
use crate::ir::{DescrRef, Op, OpCode, OpRef, OopSpec, Operand, Type};
use tracing::debug;

/// Longest array allocation kept virtual
const MAX_VIRTUAL_ARRAY_LEN: i64 = 1024;

#[derive(Debug, Default)]
pub(crate) struct VirtualizeState {
    /// `guard_not_forced_2` waiting for the following `finish`
    postponed_not_forced: Option<OpRef>,
    /// The previous call was a removed `jit_force_virtual`
    drop_guard_not_forced: bool,
}

impl Optimizer {
    pub(crate) fn optimize_virtualize(&mut self, r: OpRef) -> Result<Flow> {
        use OpCode::*;
        let drop_guard = std::mem::take(&mut self.virtualize.drop_guard_not_forced);
        match self.op(r).opcode {
            GuardNotForced if drop_guard => Ok(Flow::Done),
            New | NewWithVtable => self.virtualize_new(r),
            NewArray | NewArrayClear => self.virtualize_new_array(r),
            GetfieldGc => self.virtual_getfield(r),
            SetfieldGc => self.virtual_setfield(r),
            GetarrayitemGc => self.virtual_getarrayitem(r),
            SetarrayitemGc => self.virtual_setarrayitem(r),
            GetinteriorfieldGc => self.virtual_getinteriorfield(r),
            SetinteriorfieldGc => self.virtual_setinteriorfield(r),
            ArraylenGc => {
                let len = match self.getptrinfo(&self.arg(r, 0)) {
                    Some(PtrInfo::Array(a)) if a.is_virtual => a.items.len(),
                    Some(PtrInfo::ArrayStruct(a)) => a.length,
                    _ => return Ok(Flow::Emit(r)),
                };
                self.replace_with(r, &Operand::int(len as i64))
            }
            GetarrayitemRaw | RawLoad => self.virtual_raw_load(r),
            SetarrayitemRaw | RawStore => self.virtual_raw_store(r),
            IntAdd => self.virtual_raw_slice(r),
            Call | CallMayForce => self.virtualize_call(r),
            VirtualRef => self.virtualize_vref(r),
            VirtualRefFinish => self.finish_vref(r),
            QuasiimmutField if self.is_virtual(&self.arg(r, 0)) => Ok(Flow::Done),
            GuardNotForced2 => {
                self.virtualize.postponed_not_forced = Some(r);
                Ok(Flow::Done)
            }
            Finish => {
                if let Some(guard) = self.virtualize.postponed_not_forced.take() {
                    self.emit_extra(Pass::Virtualize, guard)?;
                }
                Ok(Flow::Emit(r))
            }
            _ => Ok(Flow::Emit(r)),
        }
    }

    // ========== Allocation ==========

    fn virtualize_new(&mut self, r: OpRef) -> Result<Flow> {
        let Some(size) = self.op(r).descr else {
            return Ok(Flow::Emit(r));
        };
        let Some(layout) = self.descrs.size(size) else {
            return Err(Error::unsupported(format!(
                "{} needs a struct descriptor",
                self.op(r).opcode
            )));
        };
        let class = match self.op(r).opcode {
            OpCode::NewWithVtable => layout.vtable,
            _ => None,
        };
        let nfields = layout.fields.len();
        self.set_info(
            r,
            Info::Ptr(PtrInfo::Struct(StructInfo {
                descr: Some(size),
                known_class: class,
                fields: vec![None; nfields],
                is_virtual: true,
                last_guard: None,
            })),
        );
        Ok(Flow::Done)
    }

    fn virtualize_new_array(&mut self, r: OpRef) -> Result<Flow> {
        let len = match self.get_constant_int(&self.arg(r, 0)) {
            Some(n) if (0..=MAX_VIRTUAL_ARRAY_LEN).contains(&n) => n as usize,
            _ => return Ok(Flow::Emit(r)),
        };
        let Some(descr) = self.op(r).descr else {
            return Ok(Flow::Emit(r));
        };
        let Some(array) = self.descrs.array(descr) else {
            return Ok(Flow::Emit(r));
        };
        let info = if array.is_array_of_structs() {
            let fields_per_item = array.interior.len();
            PtrInfo::ArrayStruct(ArrayStructInfo {
                descr,
                length: len,
                items: vec![None; len * fields_per_item],
                fields_per_item,
                is_virtual: true,
            })
        } else {
            PtrInfo::Array(ArrayInfo {
                descr,
                items: vec![None; len],
                clear: self.op(r).opcode == OpCode::NewArrayClear,
                lenbound: None,
                is_virtual: true,
                last_guard: None,
            })
        };
        self.set_info(r, Info::Ptr(info));
        Ok(Flow::Done)
    }

    // ========== Struct fields ==========

    fn field_slot(&self, r: OpRef) -> Option<(usize, Type)> {
        let field = self.descrs.field(self.op(r).descr?)?;
        Some((field.index, field.ty))
    }

    fn virtual_getfield(&mut self, r: OpRef) -> Result<Flow> {
        let Some((index, ty)) = self.field_slot(r) else {
            return Ok(Flow::Emit(r));
        };
        let value = match self.getptrinfo(&self.arg(r, 0)) {
            Some(PtrInfo::Struct(s)) if s.is_virtual => s.fields.get(index).cloned().flatten(),
            _ => return Ok(Flow::Emit(r)),
        };
        let value = value.unwrap_or_else(|| Operand::Const(ty.default_const()));
        self.replace_with(r, &value)
    }

    fn virtual_setfield(&mut self, r: OpRef) -> Result<Flow> {
        let Some((index, _)) = self.field_slot(r) else {
            return Ok(Flow::Emit(r));
        };
        let (obj, value) = (self.arg(r, 0), self.arg(r, 1));
        if let Some(PtrInfo::Struct(s)) = self.getptrinfo_mut(&obj) {
            if s.is_virtual {
                if let Some(slot) = s.fields.get_mut(index) {
                    *slot = Some(value);
                    return Ok(Flow::Done);
                }
            }
        }
        Ok(Flow::Emit(r))
    }

    // ========== Arrays ==========

    fn virtual_getarrayitem(&mut self, r: OpRef) -> Result<Flow> {
        let Some(index) = self.get_constant_int(&self.arg(r, 1)) else {
            return Ok(Flow::Emit(r));
        };
        let (item, clear, descr) = match self.getptrinfo(&self.arg(r, 0)) {
            Some(PtrInfo::Array(a)) if a.is_virtual => {
                match usize::try_from(index).ok().and_then(|i| a.items.get(i)) {
                    Some(item) => (item.clone(), a.clear, a.descr),
                    // out of bounds: let the allocation happen
                    None => return Ok(Flow::Emit(r)),
                }
            }
            _ => return Ok(Flow::Emit(r)),
        };
        match item {
            Some(value) => self.replace_with(r, &value),
            None if clear => {
                let ty = self.descrs.array(descr).map_or(Type::Int, |a| a.item_ty);
                self.replace_with(r, &Operand::Const(ty.default_const()))
            }
            None => Err(Error::invalid_loop(format!(
                "read of uninitialized item {} of a virtual array",
                index
            ))),
        }
    }

    fn virtual_setarrayitem(&mut self, r: OpRef) -> Result<Flow> {
        let Some(index) = self.get_constant_int(&self.arg(r, 1)) else {
            return Ok(Flow::Emit(r));
        };
        let (arr, value) = (self.arg(r, 0), self.arg(r, 2));
        if let Some(PtrInfo::Array(a)) = self.getptrinfo_mut(&arr) {
            if a.is_virtual {
                if let Some(slot) = usize::try_from(index).ok().and_then(|i| a.items.get_mut(i)) {
                    *slot = Some(value);
                    return Ok(Flow::Done);
                }
            }
        }
        Ok(Flow::Emit(r))
    }

    /// Slot of an interior field access on a virtual array of structs
    fn interior_slot(&self, r: OpRef) -> Option<(usize, Type)> {
        let index = usize::try_from(self.get_constant_int(&self.arg(r, 1))?).ok()?;
        let field = self.descrs.interior(self.op(r).descr?)?;
        match self.getptrinfo(&self.arg(r, 0))? {
            PtrInfo::ArrayStruct(a) if a.is_virtual && index < a.length => {
                Some((a.slot(index, field.index), field.ty))
            }
            _ => None,
        }
    }

    fn virtual_getinteriorfield(&mut self, r: OpRef) -> Result<Flow> {
        let Some((slot, ty)) = self.interior_slot(r) else {
            return Ok(Flow::Emit(r));
        };
        let value = match self.getptrinfo(&self.arg(r, 0)) {
            Some(PtrInfo::ArrayStruct(a)) => a.items.get(slot).cloned().flatten(),
            _ => None,
        };
        let value = value.unwrap_or_else(|| Operand::Const(ty.default_const()));
        self.replace_with(r, &value)
    }

    fn virtual_setinteriorfield(&mut self, r: OpRef) -> Result<Flow> {
        let Some((slot, _)) = self.interior_slot(r) else {
            return Ok(Flow::Emit(r));
        };
        let (arr, value) = (self.arg(r, 0), self.arg(r, 2));
        if let Some(PtrInfo::ArrayStruct(a)) = self.getptrinfo_mut(&arr) {
            if let Some(item) = a.items.get_mut(slot) {
                *item = Some(value);
                return Ok(Flow::Done);
            }
        }
        Ok(Flow::Emit(r))
    }

    // ========== Raw memory ==========

    /// Virtual raw buffer behind `ptr` and the offset `ptr` points at
    fn raw_target(&self, ptr: &Operand) -> Option<(OpRef, i64)> {
        let r = self.resolve(ptr).as_op()?;
        match self.info(r)?.as_ptr()? {
            PtrInfo::RawBuffer(raw) if raw.is_virtual => Some((r, 0)),
            PtrInfo::RawSlice(slice) => {
                let (buffer, base) = self.raw_target(&slice.parent)?;
                Some((buffer, base + slice.offset))
            }
            _ => None,
        }
    }

    /// Byte offset, length and descriptor of a raw access
    fn raw_access(&self, r: OpRef) -> Option<(i64, i64, DescrRef)> {
        let op = self.op(r);
        let descr = op.descr?;
        let item_size = self.descrs.array(descr)?.item_size;
        let pos = self.get_constant_int(&op.args[1])?;
        let offset = match op.opcode {
            OpCode::GetarrayitemRaw | OpCode::SetarrayitemRaw => pos.checked_mul(item_size)?,
            _ => pos,
        };
        Some((offset, item_size, descr))
    }

    fn virtual_raw_load(&mut self, r: OpRef) -> Result<Flow> {
        let Some((buffer, base)) = self.raw_target(&self.arg(r, 0)) else {
            return Ok(Flow::Emit(r));
        };
        let hit = self.raw_access(r).and_then(|(offset, length, descr)| {
            let offset = base + offset;
            match self.info(buffer).and_then(Info::as_ptr) {
                Some(PtrInfo::RawBuffer(raw)) => raw
                    .read(offset, length)
                    .ok()
                    .flatten()
                    .filter(|_| {
                        raw.entries
                            .iter()
                            .any(|e| e.offset == offset && e.descr == descr)
                    })
                    .cloned(),
                _ => None,
            }
        });
        match hit {
            Some(value) => self.replace_with(r, &value),
            None => {
                self.force_box(&Operand::Op(buffer))?;
                Ok(Flow::Emit(r))
            }
        }
    }

    fn virtual_raw_store(&mut self, r: OpRef) -> Result<Flow> {
        let Some((buffer, base)) = self.raw_target(&self.arg(r, 0)) else {
            return Ok(Flow::Emit(r));
        };
        let value = self.arg(r, 2);
        let stored = match (self.raw_access(r), self.getptrinfo_mut(&Operand::Op(buffer))) {
            (Some((offset, length, descr)), Some(PtrInfo::RawBuffer(raw))) => {
                let offset = base + offset;
                offset >= 0 && offset + length <= raw.size && raw.write(offset, length, descr, value)
            }
            _ => false,
        };
        if stored {
            return Ok(Flow::Done);
        }
        self.force_box(&Operand::Op(buffer))?;
        Ok(Flow::Emit(r))
    }

    /// `int_add(raw, c)` on a virtual raw buffer is a virtual slice
    fn virtual_raw_slice(&mut self, r: OpRef) -> Result<Flow> {
        let (a, b) = (self.arg(r, 0), self.arg(r, 1));
        for (ptr, delta) in [(&a, &b), (&b, &a)] {
            let Some(c) = self.get_constant_int(delta) else {
                continue;
            };
            if self.raw_target(ptr).is_none() {
                continue;
            }
            let (parent, offset) = match self.getptrinfo(ptr) {
                Some(PtrInfo::RawSlice(slice)) => (slice.parent.clone(), slice.offset + c),
                _ => (ptr.clone(), c),
            };
            self.set_info(r, Info::Ptr(PtrInfo::RawSlice(RawSliceInfo { parent, offset })));
            return Ok(Flow::Done);
        }
        Ok(Flow::Emit(r))
    }

    // ========== Calls ==========

    fn virtualize_call(&mut self, r: OpRef) -> Result<Flow> {
        let spec = match self.effect_of(r) {
            Some(effect) => effect.oopspec(),
            None => return Ok(Flow::Emit(r)),
        };
        let Some(arg) = self.op(r).args.first().map(|a| self.resolve(a)) else {
            return Ok(Flow::Emit(r));
        };
        match spec {
            OopSpec::RawMallocVarsizeChar => {
                let (Some(size), Some(func)) = (self.get_constant_int(&arg), self.op(r).descr) else {
                    return Ok(Flow::Emit(r));
                };
                self.set_info(
                    r,
                    Info::Ptr(PtrInfo::RawBuffer(RawBufferInfo {
                        func,
                        size,
                        entries: Vec::new(),
                        is_virtual: true,
                    })),
                );
                Ok(Flow::Done)
            }
            OopSpec::RawFree => match self.getptrinfo(&arg) {
                Some(PtrInfo::RawBuffer(raw)) if raw.is_virtual => Ok(Flow::Done),
                _ => Ok(Flow::Emit(r)),
            },
            OopSpec::JitForceVirtualizable if self.is_virtual(&arg) => Ok(Flow::Done),
            OopSpec::JitForceVirtual => self.force_vref_call(r, &arg),
            _ => Ok(Flow::Emit(r)),
        }
    }

    // ========== Virtual references ==========

    fn vref_slots(&self) -> (usize, usize) {
        let vref = self.descrs.vref();
        let slot = |d: DescrRef| self.descrs.field(d).map_or(0, |f| f.index);
        (slot(vref.virtual_token), slot(vref.forced))
    }

    /// `virtual_ref(obj, index)` becomes a virtual `jit_virtual_ref` holding a
    /// fresh force token; the referenced object is not touched
    fn virtualize_vref(&mut self, r: OpRef) -> Result<Flow> {
        let vref = self.descrs.vref();
        let nfields = self.descrs.size(vref.size).map_or(2, |s| s.fields.len());
        let token = self.emit_new(
            Some(Pass::Virtualize),
            Op::new(OpCode::ForceToken, Type::Int, Vec::new()),
        )?;
        let (token_slot, forced_slot) = self.vref_slots();
        let mut fields = vec![None; nfields];
        fields[token_slot] = Some(token);
        fields[forced_slot] = Some(Operand::null());
        self.set_info(
            r,
            Info::Ptr(PtrInfo::Struct(StructInfo {
                descr: Some(vref.size),
                known_class: Some(vref.class),
                fields,
                is_virtual: true,
                last_guard: None,
            })),
        );
        Ok(Flow::Done)
    }

    /// Leaving the frame: store the real object and clear the token
    fn finish_vref(&mut self, r: OpRef) -> Result<Flow> {
        let vref = self.descrs.vref();
        let (target, obj) = (self.arg(r, 0), self.arg(r, 1));
        if !matches!(&obj, Operand::Const(c) if c.is_null()) {
            let set = self.new_op(Op::void(OpCode::SetfieldGc, vec![target.clone(), obj]).with_descr(vref.forced));
            self.send_extra_operation(set)?;
        }
        let clear = self.new_op(
            Op::void(OpCode::SetfieldGc, vec![target, Operand::int(0)]).with_descr(vref.virtual_token),
        );
        self.send_extra_operation(clear)?;
        Ok(Flow::Done)
    }

    /// Forcing a finished virtual reference yields the object it recorded
    fn force_vref_call(&mut self, r: OpRef, vref: &Operand) -> Result<Flow> {
        let size = self.descrs.vref().size;
        let (token_slot, forced_slot) = self.vref_slots();
        let (token, forced) = match self.getptrinfo(vref) {
            Some(PtrInfo::Struct(s)) if s.is_virtual && s.descr == Some(size) => (
                s.fields.get(token_slot).cloned().flatten(),
                s.fields.get(forced_slot).cloned().flatten(),
            ),
            _ => return Ok(Flow::Emit(r)),
        };
        let finished = token.is_some_and(|t| self.get_constant_int(&t) == Some(0));
        match forced {
            Some(obj) if finished => {
                self.virtualize.drop_guard_not_forced = true;
                self.replace_with(r, &obj)
            }
            _ => Ok(Flow::Emit(r)),
        }
    }

    // ========== Forcing ==========

    /// Materialize `operand` if it is virtual; returns its representative
    pub(crate) fn force_box(&mut self, operand: &Operand) -> Result<Operand> {
        let operand = self.resolve(operand);
        let Operand::Op(r) = operand else {
            return Ok(operand);
        };
        let info = match self.info(r).and_then(Info::as_ptr) {
            Some(p) if p.is_virtual() => p.clone(),
            _ => return Ok(operand),
        };
        self.stats_mut().forced_virtuals += 1;
        debug!(kind = info.kind_name(), result = r.0, "forcing virtual");
        match info {
            PtrInfo::Struct(s) => self.force_struct(r, s)?,
            PtrInfo::Array(a) => self.force_array(r, a)?,
            PtrInfo::ArrayStruct(a) => self.force_array_struct(r, a)?,
            PtrInfo::RawBuffer(raw) => {
                self.set_info(r, Info::Int(IntBound::unbounded()));
                self.materialize(r, OpCode::Call, Type::Int, vec![Operand::int(raw.size)], Some(raw.func))?;
                for entry in raw.entries {
                    let store = self.new_op(
                        Op::void(
                            OpCode::RawStore,
                            vec![Operand::Op(r), Operand::int(entry.offset), entry.value],
                        )
                        .with_descr(entry.descr),
                    );
                    self.emit(store)?;
                }
            }
            PtrInfo::RawSlice(slice) => {
                self.set_info(r, Info::Int(IntBound::unbounded()));
                let parent = self.force_box(&slice.parent)?;
                self.materialize(
                    r,
                    OpCode::IntAdd,
                    Type::Int,
                    vec![parent, Operand::int(slice.offset)],
                    None,
                )?;
            }
            PtrInfo::Str(s) => self.force_vstring(r, s)?,
            PtrInfo::NonNull { .. } => {}
        }
        Ok(self.resolve(&Operand::Op(r)))
    }

    /// Turn `r` itself into the allocation so every use of it stays valid
    pub(crate) fn materialize(
        &mut self,
        r: OpRef,
        opcode: OpCode,
        ty: Type,
        args: Vec<Operand>,
        descr: Option<DescrRef>,
    ) -> Result<()> {
        let op = self.op_mut(r);
        op.opcode = opcode;
        op.ty = ty;
        op.args = args;
        op.descr = descr;
        op.fail_args = None;
        op.resume = None;
        self.emit(r)
    }

    /// Emit a store produced by forcing and let the heap cache learn it
    pub(crate) fn emit_store(&mut self, op: Op, index: Option<i64>) -> Result<()> {
        let descr = op.descr;
        let s = self.new_op(op);
        self.emit(s)?;
        if let Some(descr) = descr {
            let args = &self.op(s).args;
            let (target, value) = (args[0].clone(), args[args.len() - 1].clone());
            self.heap_remember_store(descr, &target, index, &value);
        }
        Ok(())
    }

    fn force_struct(&mut self, r: OpRef, s: StructInfo) -> Result<()> {
        let size = s
            .descr
            .ok_or_else(|| Error::internal("virtual struct without size descriptor"))?;
        let layout = self.descrs.size(size).map(|l| l.fields.clone()).unwrap_or_default();
        self.set_info(
            r,
            Info::Ptr(PtrInfo::Struct(StructInfo {
                descr: Some(size),
                known_class: s.known_class,
                fields: Vec::new(),
                is_virtual: false,
                last_guard: None,
            })),
        );
        let opcode = match s.known_class {
            Some(_) => OpCode::NewWithVtable,
            None => OpCode::New,
        };
        self.materialize(r, opcode, Type::Ref, Vec::new(), Some(size))?;
        for (value, field) in s.fields.into_iter().zip(layout) {
            if let Some(value) = value {
                self.emit_store(
                    Op::void(OpCode::SetfieldGc, vec![Operand::Op(r), value]).with_descr(field),
                    None,
                )?;
            }
        }
        Ok(())
    }

    fn force_array(&mut self, r: OpRef, a: ArrayInfo) -> Result<()> {
        let len = a.items.len() as i64;
        self.set_info(
            r,
            Info::Ptr(PtrInfo::Array(ArrayInfo {
                descr: a.descr,
                items: Vec::new(),
                clear: a.clear,
                lenbound: Some(IntBound::from_constant(len)),
                is_virtual: false,
                last_guard: None,
            })),
        );
        let opcode = if a.clear {
            OpCode::NewArrayClear
        } else {
            OpCode::NewArray
        };
        self.materialize(r, opcode, Type::Ref, vec![Operand::int(len)], Some(a.descr))?;
        let zero = self
            .descrs
            .array(a.descr)
            .map(|d| Operand::Const(d.item_ty.default_const()));
        for (i, item) in a.items.into_iter().enumerate() {
            let Some(value) = item else { continue };
            // a clear array already holds zeros
            if a.clear && Some(self.resolve(&value)) == zero {
                continue;
            }
            self.emit_store(
                Op::void(
                    OpCode::SetarrayitemGc,
                    vec![Operand::Op(r), Operand::int(i as i64), value],
                )
                .with_descr(a.descr),
                Some(i as i64),
            )?;
        }
        Ok(())
    }

    fn force_array_struct(&mut self, r: OpRef, a: ArrayStructInfo) -> Result<()> {
        let interior = self
            .descrs
            .array(a.descr)
            .map(|d| d.interior.clone())
            .unwrap_or_default();
        self.set_info(
            r,
            Info::Ptr(PtrInfo::Array(ArrayInfo {
                descr: a.descr,
                items: Vec::new(),
                clear: true,
                lenbound: Some(IntBound::from_constant(a.length as i64)),
                is_virtual: false,
                last_guard: None,
            })),
        );
        self.materialize(
            r,
            OpCode::NewArrayClear,
            Type::Ref,
            vec![Operand::int(a.length as i64)],
            Some(a.descr),
        )?;
        for index in 0..a.length {
            for (field, &descr) in interior.iter().enumerate() {
                if let Some(value) = a.items[a.slot(index, field)].clone() {
                    self.emit_store(
                        Op::void(
                            OpCode::SetinteriorfieldGc,
                            vec![Operand::Op(r), Operand::int(index as i64), value],
                        )
                        .with_descr(descr),
                        Some(index as i64),
                    )?;
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
    use crate::ir::Trace;

    const NODE: &str = "struct Node class=7 { value: int, next: ref }\n";

    fn optimize(source: &str) -> Result<Trace> {
        let trace = parse_trace(source).unwrap();
        Optimizer::new().optimize(&trace)
    }

    #[test]
    fn test_virtual_struct_removed() {
        let out = optimize(&format!(
            "{}---\n[i0]\n\
             p1 = new_with_vtable(descr=Node)\n\
             setfield_gc(p1, i0, descr=Node.value)\n\
             i2 = getfield_gc(p1, descr=Node.value)\n\
             guard_class(p1, ConstClass(Node)) []\n\
             guard_nonnull(p1) []\n\
             finish(i2)\n",
            NODE
        ))
        .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::Op(OpRef(0)));
    }

    #[test]
    fn test_escape_forces_allocation() {
        let out = optimize(&format!(
            "{}---\n[i0]\n\
             p1 = new(descr=Node)\n\
             setfield_gc(p1, 5, descr=Node.value)\n\
             i2 = getfield_gc(p1, descr=Node.value)\n\
             escape(p1)\n\
             finish(i2)\n",
            NODE
        ))
        .unwrap();
        assert_eq!(
            out.opcodes(),
            vec![OpCode::New, OpCode::SetfieldGc, OpCode::Escape, OpCode::Finish]
        );
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::int(5));
    }

    #[test]
    fn test_unset_field_reads_default() {
        let out = optimize(&format!(
            "{}---\n[]\np1 = new(descr=Node)\np2 = getfield_gc(p1, descr=Node.next)\nfinish(p2)\n",
            NODE
        ))
        .unwrap();
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::null());
    }

    #[test]
    fn test_nested_virtual_forced_depth_first() {
        let out = optimize(&format!(
            "{}---\n[i0]\n\
             p1 = new(descr=Node)\n\
             p2 = new(descr=Node)\n\
             setfield_gc(p2, i0, descr=Node.value)\n\
             setfield_gc(p1, p2, descr=Node.next)\n\
             escape(p1)\n\
             finish(i0)\n",
            NODE
        ))
        .unwrap();
        assert_eq!(out.count(OpCode::New), 2);
        assert_eq!(out.count(OpCode::SetfieldGc), 2);
        assert_eq!(out.opcodes()[0], OpCode::New);
    }

    #[test]
    fn test_virtual_array() {
        let source = "array A int\n---\n[i0]\n\
             p1 = new_array_clear(3, descr=A)\n\
             setarrayitem_gc(p1, 1, i0, descr=A)\n\
             i2 = getarrayitem_gc(p1, 1, descr=A)\n\
             i3 = getarrayitem_gc(p1, 2, descr=A)\n\
             i4 = arraylen_gc(p1, descr=A)\n\
             i5 = int_add(i3, i4)\n\
             finish(i2, i5)\n";
        let out = optimize(source).unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[1], Operand::int(3));
    }

    #[test]
    fn test_uninitialized_item_is_invalid() {
        let source = "array A int\n---\n[]\n\
             p1 = new_array(2, descr=A)\n\
             i2 = getarrayitem_gc(p1, 0, descr=A)\n\
             finish(i2)\n";
        assert!(optimize(source).unwrap_err().is_invalid_loop());
    }

    #[test]
    fn test_array_of_structs() {
        let source = "array P { x: int, y: int }\n---\n[i0]\n\
             p1 = new_array_clear(2, descr=P)\n\
             setinteriorfield_gc(p1, 1, i0, descr=P.y)\n\
             i2 = getinteriorfield_gc(p1, 1, descr=P.y)\n\
             i3 = getinteriorfield_gc(p1, 0, descr=P.x)\n\
             escape(p1)\n\
             finish(i2, i3)\n";
        let out = optimize(source).unwrap();
        assert_eq!(
            out.opcodes(),
            vec![
                OpCode::NewArrayClear,
                OpCode::SetinteriorfieldGc,
                OpCode::Escape,
                OpCode::Finish
            ]
        );
    }

    #[test]
    fn test_raw_buffer() {
        let source = "array R int size=8\n---\n[i0]\n\
             i1 = call_i(16, descr=raw_malloc_varsize_char)\n\
             guard_no_exception() []\n\
             raw_store(i1, 8, i0, descr=R)\n\
             i2 = int_add(i1, 8)\n\
             i3 = raw_load(i2, 0, descr=R)\n\
             call_n(i1, descr=raw_free)\n\
             finish(i3)\n";
        let out = optimize(source).unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::Op(OpRef(0)));
    }

    #[test]
    fn test_raw_overlap_forces() {
        let source = "array R int size=8\narray B int size=1\n---\n[i0]\n\
             i1 = call_i(16, descr=raw_malloc_varsize_char)\n\
             raw_store(i1, 0, i0, descr=R)\n\
             i2 = raw_load(i1, 4, descr=B)\n\
             finish(i2)\n";
        let out = optimize(source).unwrap();
        assert_eq!(
            out.opcodes(),
            vec![OpCode::Call, OpCode::RawStore, OpCode::RawLoad, OpCode::Finish]
        );
    }

    #[test]
    fn test_virtual_ref_round_trip() {
        let source = format!(
            "{}---\n[i0]\n\
             p1 = new(descr=Node)\n\
             p2 = virtual_ref(p1, 0)\n\
             virtual_ref_finish(p2, p1)\n\
             p3 = call_may_force_r(p2, descr=jit_force_virtual)\n\
             guard_not_forced() []\n\
             finish(p3)\n",
            NODE
        );
        let out = optimize(&source).unwrap();
        assert_eq!(out.count(OpCode::CallMayForce), 0);
        assert_eq!(out.count(OpCode::GuardNotForced), 0);
        assert_eq!(out.count(OpCode::ForceToken), 1);
    }

    #[test]
    fn test_guard_not_forced_2_moves_to_finish() {
        let out = optimize("[i0]\nguard_not_forced_2() []\ni1 = int_add(i0, 1)\nfinish(i1)\n").unwrap();
        assert_eq!(
            out.opcodes(),
            vec![OpCode::IntAdd, OpCode::GuardNotForced2, OpCode::Finish]
        );
    }
}
