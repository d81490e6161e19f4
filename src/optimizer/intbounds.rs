//! Integer bounds propagation
//!
//! Every integer result gets an [`IntBound`] computed from the bounds of its
//! arguments. Guards run the other way: once `guard_true(int_lt(x, 10))`
//! has passed, `x <= 9` is known and is pushed back through the operations
//! that produced `x`.

use super::{Flow, Optimizer};
use crate::error::{Error, Result};
use crate::info::{ArrayInfo, Info, Nullness, PtrInfo, StrInfo};
use crate::intbound::IntBound;
use crate::ir::{DescrRef, OpCode, OpRef, Operand, StrMode, Type};
use rustc_hash::FxHashSet as HashSet;

#[derive(Debug, Default)]
pub(crate) struct IntBoundsState {
    /// The previous ovf operation was proven not to overflow
    drop_next_no_overflow: bool,
    /// Bound of the last ovf result, valid once its guard_no_overflow passed
    pending_ovf: Option<(OpRef, IntBound)>,
    /// Ovf results checked by a guard_no_overflow
    checked_ovf: HashSet<OpRef>,
}

impl Optimizer {
    pub(crate) fn optimize_intbounds(&mut self, r: OpRef) -> Result<Flow> {
        use OpCode::*;
        let drop_overflow_guard = std::mem::take(&mut self.intbounds.drop_next_no_overflow);
        let opcode = self.op(r).opcode;
        match opcode {
            GuardNoOverflow if drop_overflow_guard => return Ok(Flow::Done),
            GuardOverflow if drop_overflow_guard => {
                return Err(Error::invalid_loop(
                    "guard_overflow after an operation that cannot overflow",
                ))
            }
            IntAddOvf | IntSubOvf | IntMulOvf => {
                let (b0, b1) = (self.getintbound(&self.op(r).args[0]), self.getintbound(&self.op(r).args[1]));
                let cannot_overflow = match opcode {
                    IntAddOvf => b0.add_bound_cannot_overflow(&b1),
                    IntSubOvf => b0.sub_bound_cannot_overflow(&b1),
                    _ => b0.mul_bound_cannot_overflow(&b1),
                };
                if !cannot_overflow {
                    return Ok(Flow::Emit(r));
                }
                self.op_mut(r).opcode = opcode.without_ovf();
                self.intbounds.drop_next_no_overflow = true;
            }
            IntAnd => {
                let (a, b) = (self.arg(r, 0), self.arg(r, 1));
                for (x, mask) in [(&a, &b), (&b, &a)] {
                    if let Some(c) = self.get_constant_int(mask) {
                        let bound = self.getintbound(x);
                        if (bound.tvalue | bound.tmask) & !(c as u64) == 0 {
                            let x = x.clone();
                            return self.replace_with(r, &x);
                        }
                    }
                }
            }
            IntForceGeZero => {
                let x = self.arg(r, 0);
                if self.getintbound(&x).known_nonnegative() {
                    return self.replace_with(r, &x);
                }
            }
            _ if opcode.is_comparison() => {
                if let Some(value) = self.fold_comparison(r) {
                    self.stats_mut().constant_folds += 1;
                    return self.replace_with(r, &Operand::int(value as i64));
                }
            }
            _ => {}
        }
        if self.op(r).opcode.is_always_pure() {
            if let Some(c) = self.forward_bound(r)?.and_then(|b| b.get_constant()) {
                self.stats_mut().constant_folds += 1;
                return self.replace_with(r, &Operand::int(c));
            }
        }
        Ok(Flow::Emit(r))
    }

    pub(crate) fn postprocess_intbounds(&mut self, r: OpRef) -> Result<()> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        match opcode {
            GuardTrue | GuardFalse | GuardValue => {
                let x = self.arg(r, 0);
                let Operand::Op(xr) = x else {
                    return Ok(());
                };
                if self.op(xr).ty != Type::Int {
                    return Ok(());
                }
                let mut bound = self.getintbound(&x);
                let changed = match opcode {
                    GuardTrue if bound.is_bool() => bound.make_eq_const(1)?,
                    GuardTrue => bound.make_ne_const(0)?,
                    GuardFalse => bound.make_eq_const(0)?,
                    _ => match self.get_constant_int(&self.arg(r, 1)) {
                        Some(c) => bound.make_eq_const(c)?,
                        None => false,
                    },
                };
                if changed {
                    self.setintbound(&x, &bound)?;
                    self.propagate_bounds_backward(&x)?;
                }
            }
            GuardNoOverflow => {
                if let Some((ovf, bound)) = self.intbounds.pending_ovf.take() {
                    self.intbounds.checked_ovf.insert(ovf);
                    self.setintbound(&Operand::Op(ovf), &bound)?;
                }
            }
            GuardOverflow => self.intbounds.pending_ovf = None,
            _ if opcode.is_ovf() => {
                self.intbounds.pending_ovf = self.forward_bound(r)?.map(|b| (r, b));
            }
            _ => {
                if let Some(bound) = self.forward_bound(r)? {
                    self.setintbound(&Operand::Op(r), &bound)?;
                }
            }
        }
        Ok(())
    }

    /// Bound of the result of `r` computed from its arguments
    fn forward_bound(&self, r: OpRef) -> Result<Option<IntBound>> {
        use OpCode::*;
        let op = self.op(r);
        if op.ty != Type::Int {
            return Ok(None);
        }
        let b = |i: usize| self.getintbound(&op.args[i]);
        let bound = match op.opcode {
            IntAdd => b(0).add_bound(&b(1)),
            IntSub => b(0).sub_bound(&b(1)),
            IntMul => b(0).mul_bound(&b(1)),
            IntAddOvf => b(0).add_bound_no_overflow(&b(1)),
            IntSubOvf => b(0).sub_bound_no_overflow(&b(1)),
            IntMulOvf => b(0).mul_bound_no_overflow(&b(1)),
            IntPyDiv => b(0).py_div_bound(&b(1)),
            IntPyMod => b(0).mod_bound(&b(1)),
            IntLshift => b(0).lshift_bound(&b(1)),
            IntRshift => b(0).rshift_bound(&b(1)),
            UintRshift => b(0).urshift_bound(&b(1)),
            IntAnd => b(0).and_bound(&b(1)),
            IntOr => b(0).or_bound(&b(1)),
            IntXor => b(0).xor_bound(&b(1)),
            IntNeg => b(0).neg_bound(),
            IntInvert => b(0).invert_bound(),
            IntForceGeZero => {
                let x = b(0);
                let mut result = IntBound::nonnegative();
                if x.has_upper() {
                    result.make_le_const(x.upper.max(0))?;
                }
                result
            }
            ArraylenGc | Strlen | Unicodelen => {
                let mut result = IntBound::nonnegative();
                if let Some(len) = self.lenbound_of(&op.args[0]) {
                    result.intersect(&len)?;
                }
                result
            }
            Strgetitem => IntBound::new(0, StrMode::Str.max_char())?,
            Unicodegetitem => IntBound::new(0, StrMode::Unicode.max_char())?,
            opcode if opcode.is_comparison() => IntBound::boolean(),
            _ => return Ok(None),
        };
        Ok(Some(bound))
    }

    fn fold_comparison(&self, r: OpRef) -> Option<bool> {
        use OpCode::*;
        let op = self.op(r);
        let b0 = self.getintbound(&op.args[0]);
        if matches!(op.opcode, IntIsTrue | IntIsZero) {
            return match b0.getnullness() {
                Nullness::NonNull => Some(op.opcode == IntIsTrue),
                Nullness::Null => Some(op.opcode == IntIsZero),
                Nullness::Unknown => None,
            };
        }
        let b1 = self.getintbound(op.args.get(1)?);
        let (yes, no) = match op.opcode {
            IntLt => (b0.known_lt(&b1), b0.known_ge(&b1)),
            IntLe => (b0.known_le(&b1), b0.known_gt(&b1)),
            IntGt => (b0.known_gt(&b1), b0.known_le(&b1)),
            IntGe => (b0.known_ge(&b1), b0.known_lt(&b1)),
            IntEq => (b0.known_eq(&b1), b0.known_ne(&b1)),
            IntNe => (b0.known_ne(&b1), b0.known_eq(&b1)),
            UintLt => (b0.known_uint_lt(&b1), b0.known_uint_ge(&b1)),
            UintLe => (b0.known_uint_le(&b1), b0.known_uint_gt(&b1)),
            UintGt => (b0.known_uint_gt(&b1), b0.known_uint_le(&b1)),
            UintGe => (b0.known_uint_ge(&b1), b0.known_uint_lt(&b1)),
            _ => return None,
        };
        if yes {
            Some(true)
        } else if no {
            Some(false)
        } else {
            None
        }
    }

    // ========== Backward propagation ==========

    /// Push a narrowed bound of `operand` back into the arguments of the
    /// operation that produced it
    fn propagate_bounds_backward(&mut self, operand: &Operand) -> Result<()> {
        use OpCode::*;
        let Operand::Op(r) = self.resolve(operand) else {
            return Ok(());
        };
        let (opcode, descr) = (self.op(r).opcode, self.op(r).descr);
        let args: Vec<Operand> = self.op(r).args.iter().map(|a| self.resolve(a)).collect();
        let result = self.getintbound(&Operand::Op(r));
        let bound = |i: usize| self.getintbound(&args[i]);
        match opcode {
            _ if opcode.is_comparison() => {
                if let Some(truth) = result.get_constant() {
                    self.narrow_comparison(opcode, truth != 0, &args)?;
                }
            }
            IntAdd | IntAddOvf | IntSub | IntSubOvf | IntMul | IntMulOvf => {
                let (b0, b1) = (bound(0), bound(1));
                let exact = if opcode.is_ovf() {
                    self.intbounds.checked_ovf.contains(&r)
                } else {
                    match opcode {
                        IntAdd => b0.add_bound_cannot_overflow(&b1),
                        IntSub => b0.sub_bound_cannot_overflow(&b1),
                        _ => b0.mul_bound_cannot_overflow(&b1),
                    }
                };
                if !exact {
                    return Ok(());
                }
                match opcode.without_ovf() {
                    IntAdd => {
                        self.narrow(&args[0], &result.sub_bound(&b1))?;
                        self.narrow(&args[1], &result.sub_bound(&b0))?;
                    }
                    IntSub => {
                        self.narrow(&args[0], &result.add_bound(&b1))?;
                        self.narrow(&args[1], &b0.sub_bound(&result))?;
                    }
                    _ => {
                        if let Some(c) = b1.get_constant().filter(|c| *c != 0) {
                            self.narrow(&args[0], &result.py_div_bound(&IntBound::from_constant(c)))?;
                        }
                        if let Some(c) = b0.get_constant().filter(|c| *c != 0) {
                            self.narrow(&args[1], &result.py_div_bound(&IntBound::from_constant(c)))?;
                        }
                    }
                }
            }
            IntAnd | IntOr => {
                let (b0, b1) = (bound(0), bound(1));
                let (n0, n1) = if opcode == IntAnd {
                    (b1.and_bound_backwards(&result)?, b0.and_bound_backwards(&result)?)
                } else {
                    (b1.or_bound_backwards(&result)?, b0.or_bound_backwards(&result)?)
                };
                self.narrow(&args[0], &n0)?;
                self.narrow(&args[1], &n1)?;
            }
            IntRshift | UintRshift | IntLshift => {
                if let Some(shift) = bound(1).get_constant() {
                    let narrowed = match opcode {
                        IntRshift => result.rshift_bound_backwards(shift),
                        UintRshift => result.urshift_bound_backwards(shift),
                        _ => result.lshift_bound_backwards(shift)?,
                    };
                    self.narrow(&args[0], &narrowed)?;
                }
            }
            ArraylenGc => self.update_lenbound(&args[0], descr, None, &result)?,
            Strlen => self.update_lenbound(&args[0], None, Some(StrMode::Str), &result)?,
            Unicodelen => self.update_lenbound(&args[0], None, Some(StrMode::Unicode), &result)?,
            _ => {}
        }
        Ok(())
    }

    fn narrow_comparison(&mut self, opcode: OpCode, truth: bool, args: &[Operand]) -> Result<()> {
        use OpCode::*;
        if matches!(opcode, IntIsTrue | IntIsZero) {
            let mut b = self.getintbound(&args[0]);
            if (opcode == IntIsTrue) == truth {
                b.make_ne_const(0)?;
            } else {
                b.make_eq_const(0)?;
            }
            return self.narrow(&args[0], &b);
        }
        let rel = if truth {
            opcode
        } else {
            match opcode.bool_inverse() {
                Some(inverse) => inverse,
                None => return Ok(()),
            }
        };
        let (ba, bb) = (self.getintbound(&args[0]), self.getintbound(&args[1]));
        let (mut na, mut nb) = (ba.clone(), bb.clone());
        match rel {
            IntLt => {
                na.make_lt(&bb)?;
                nb.make_gt(&ba)?;
            }
            IntLe => {
                na.make_le(&bb)?;
                nb.make_ge(&ba)?;
            }
            IntGt => {
                na.make_gt(&bb)?;
                nb.make_lt(&ba)?;
            }
            IntGe => {
                na.make_ge(&bb)?;
                nb.make_le(&ba)?;
            }
            IntEq => {
                na.intersect(&bb)?;
                nb.intersect(&ba)?;
            }
            IntNe => {
                if let Some(c) = bb.get_constant() {
                    na.make_ne_const(c)?;
                }
                if let Some(c) = ba.get_constant() {
                    nb.make_ne_const(c)?;
                }
            }
            UintLt => {
                na.make_unsigned_lt(&bb)?;
                nb.make_unsigned_gt(&ba)?;
            }
            UintLe => {
                na.make_unsigned_le(&bb)?;
                nb.make_unsigned_ge(&ba)?;
            }
            UintGt => {
                na.make_unsigned_gt(&bb)?;
                nb.make_unsigned_lt(&ba)?;
            }
            UintGe => {
                na.make_unsigned_ge(&bb)?;
                nb.make_unsigned_le(&ba)?;
            }
            // float and pointer comparisons say nothing about integers
            _ => return Ok(()),
        }
        self.narrow(&args[0], &na)?;
        self.narrow(&args[1], &nb)
    }

    /// Intersect the bound of `target` and keep propagating if it shrank
    fn narrow(&mut self, target: &Operand, bound: &IntBound) -> Result<()> {
        let target = self.resolve(target);
        if let Operand::Op(t) = target {
            if self.op(t).ty != Type::Int {
                return Ok(());
            }
        }
        let mut current = self.getintbound(&target);
        if current.intersect(bound)? && !target.is_const() {
            self.setintbound(&target, &current)?;
            self.propagate_bounds_backward(&target)?;
        }
        Ok(())
    }

    // ========== Length bounds ==========

    /// Known bound of the length of an array or string
    pub(crate) fn lenbound_of(&self, ptr: &Operand) -> Option<IntBound> {
        match self.getptrinfo(ptr)? {
            PtrInfo::Array(a) if a.is_virtual => Some(IntBound::from_constant(a.items.len() as i64)),
            PtrInfo::Array(a) => a.lenbound.clone(),
            PtrInfo::ArrayStruct(a) => Some(IntBound::from_constant(a.length as i64)),
            PtrInfo::Str(s) => s.lenbound.clone(),
            _ => None,
        }
    }

    /// Narrow the length bound of an array (`descr`) or string (`mode`)
    pub(crate) fn update_lenbound(
        &mut self,
        ptr: &Operand,
        descr: Option<DescrRef>,
        mode: Option<StrMode>,
        bound: &IntBound,
    ) -> Result<()> {
        let Operand::Op(r) = self.resolve(ptr) else {
            return Ok(());
        };
        if self.op(r).ty != Type::Ref {
            return Ok(());
        }
        if self.info(r).is_none() {
            self.set_info(r, Info::Ptr(PtrInfo::nonnull()));
        }
        let Some(info) = self.info_mut(r).and_then(Info::as_ptr_mut) else {
            return Ok(());
        };
        if let PtrInfo::NonNull { last_guard } = *info {
            *info = match (descr, mode) {
                (_, Some(mode)) => PtrInfo::Str(StrInfo {
                    mode,
                    lenbound: None,
                    len_box: None,
                    last_guard,
                    virt: None,
                }),
                (Some(descr), None) => PtrInfo::Array(ArrayInfo {
                    descr,
                    items: Vec::new(),
                    clear: false,
                    lenbound: None,
                    is_virtual: false,
                    last_guard,
                }),
                (None, None) => return Ok(()),
            };
        }
        let slot = match info {
            PtrInfo::Array(a) if !a.is_virtual => &mut a.lenbound,
            PtrInfo::Str(s) if s.virt.is_none() => &mut s.lenbound,
            _ => return Ok(()),
        };
        match slot {
            Some(existing) => {
                existing.intersect(bound)?;
            }
            None => {
                let mut len = IntBound::nonnegative();
                len.intersect(bound)?;
                *slot = Some(len);
            }
        }
        Ok(())
    }
}
