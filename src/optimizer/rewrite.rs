//! Algebraic rewrites and guard strength reduction
//!
//! This pass runs first. It replaces operations by cheaper equivalents,
//! removes guards that are implied by what is already known, merges a
//! guard into an earlier weaker guard about the same value, and rejects
//! traces whose guards can never pass.

use super::{Flow, Optimizer};
use crate::error::{Error, Result};
use crate::info::{Nullness, PtrInfo, StructInfo};
use crate::ir::{Const, DescrRef, OpCode, OpRef, Operand, RefConst};
use rustc_hash::FxHashMap as HashMap;

#[derive(Debug, Default)]
pub(crate) struct RewriteState {
    /// Results of `call_loopinvariant` by function and arguments
    loop_invariant: HashMap<(DescrRef, Vec<Operand>), Operand>,
}

fn power_of_two(value: i64) -> Option<u32> {
    if value > 0 && value & (value - 1) == 0 {
        Some(value.trailing_zeros())
    } else {
        None
    }
}

impl Optimizer {
    pub(crate) fn optimize_rewrite(&mut self, r: OpRef) -> Result<Flow> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        match opcode {
            IntAdd | IntSub | IntMul | IntAnd | IntOr | IntXor | IntLshift | IntRshift
            | UintRshift | IntPyDiv | IntPyMod => self.rewrite_int_binary(r),
            FloatMul => {
                let one = Const::float(1.0);
                let (a, b) = (self.arg(r, 0), self.arg(r, 1));
                if b.as_const() == Some(&one) {
                    return self.replace_with(r, &a);
                }
                if a.as_const() == Some(&one) {
                    return self.replace_with(r, &b);
                }
                Ok(Flow::Emit(r))
            }
            IntIsTrue | IntIsZero => {
                let x = self.arg(r, 0);
                let is_true = opcode == IntIsTrue;
                if is_true && self.getintbound(&x).is_bool() {
                    return self.replace_with(r, &x);
                }
                match self.nullness(&x) {
                    Nullness::NonNull => self.replace_with(r, &Operand::int(is_true as i64)),
                    Nullness::Null => self.replace_with(r, &Operand::int(!is_true as i64)),
                    Nullness::Unknown => Ok(Flow::Emit(r)),
                }
            }
            PtrEq | PtrNe | InstancePtrEq | InstancePtrNe => self.rewrite_ptr_compare(r),
            _ if opcode.is_comparison() => self.rewrite_comparison(r),
            GuardTrue | GuardFalse => {
                let x = self.arg(r, 0);
                let passes = match self.get_constant_int(&x) {
                    Some(v) => Some(v != 0),
                    None => match self.getintbound(&x).getnullness() {
                        Nullness::NonNull => Some(true),
                        _ => None,
                    },
                };
                match passes {
                    Some(nonzero) if nonzero == (opcode == GuardTrue) => Ok(Flow::Done),
                    Some(_) => Err(Error::invalid_loop(format!(
                        "{} on a value that never passes",
                        opcode
                    ))),
                    None => Ok(Flow::Emit(r)),
                }
            }
            GuardValue => self.rewrite_guard_value(r),
            GuardNonnull | GuardIsnull => {
                let want_null = opcode == GuardIsnull;
                match self.nullness(&self.arg(r, 0)) {
                    Nullness::Unknown => Ok(Flow::Emit(r)),
                    Nullness::Null if want_null => Ok(Flow::Done),
                    Nullness::NonNull if !want_null => Ok(Flow::Done),
                    _ => Err(Error::invalid_loop(format!("{} always fails", opcode))),
                }
            }
            GuardClass | GuardNonnullClass => self.rewrite_guard_class(r),
            GuardNoException => {
                if self.exception_might_have_happened {
                    Ok(Flow::Emit(r))
                } else {
                    Ok(Flow::Done)
                }
            }
            SameAs | MarkOpaquePtr => {
                let x = self.arg(r, 0);
                self.replace_with(r, &x)
            }
            CastPtrToInt | CastIntToPtr => {
                let inverse = if opcode == CastPtrToInt {
                    CastIntToPtr
                } else {
                    CastPtrToInt
                };
                if let Operand::Op(src) = self.arg(r, 0) {
                    if self.op(src).opcode == inverse {
                        let orig = self.op(src).args[0].clone();
                        return self.replace_with(r, &orig);
                    }
                }
                Ok(Flow::Emit(r))
            }
            RecordExactClass => {
                let x = self.arg(r, 0);
                if let Some(class) = self.get_constant_int(&self.arg(r, 1)) {
                    match self.known_class(&x) {
                        Some(known) if known != class => {
                            return Err(Error::invalid_loop("recorded class contradicts known class"))
                        }
                        Some(_) => {}
                        None => self.set_known_class(&x, class),
                    }
                }
                Ok(Flow::Done)
            }
            CallPure => {
                let Some(descr) = self.op(r).descr else {
                    return Ok(Flow::Emit(r));
                };
                let args = self.const_args(r);
                if let Some(args) = args {
                    if let Some(result) = self.lookup_call_pure(&(descr, args)).cloned() {
                        self.stats_mut().constant_folds += 1;
                        return self.replace_with(r, &Operand::Const(result));
                    }
                }
                Ok(Flow::Emit(r))
            }
            CallLoopinvariant => {
                let Some(descr) = self.op(r).descr else {
                    return Ok(Flow::Emit(r));
                };
                let key = (descr, self.op(r).args.clone());
                if let Some(previous) = self.rewrite.loop_invariant.get(&key).cloned() {
                    return self.replace_with(r, &previous);
                }
                self.rewrite.loop_invariant.insert(key, Operand::Op(r));
                self.op_mut(r).opcode = Call;
                Ok(Flow::Emit(r))
            }
            CondCall => match self.get_constant_int(&self.arg(r, 0)) {
                Some(0) => Ok(Flow::Done),
                Some(_) => {
                    let op = self.op_mut(r);
                    op.args.remove(0);
                    op.opcode = Call;
                    Ok(Flow::Emit(r))
                }
                None => Ok(Flow::Emit(r)),
            },
            _ => Ok(Flow::Emit(r)),
        }
    }

    pub(crate) fn postprocess_rewrite(&mut self, r: OpRef) -> Result<()> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        match opcode {
            GuardTrue => {
                let x = self.arg(r, 0);
                if self.getintbound(&x).is_bool() {
                    self.make_operand_constant(&x, Const::Int(1))?;
                }
            }
            GuardFalse => {
                let x = self.arg(r, 0);
                self.make_operand_constant(&x, Const::Int(0))?;
            }
            GuardValue => {
                let x = self.arg(r, 0);
                if let Operand::Const(c) = self.arg(r, 1) {
                    self.make_operand_constant(&x, c)?;
                }
            }
            GuardNonnull => self.make_nonnull(&self.arg(r, 0)),
            GuardIsnull => {
                let x = self.arg(r, 0);
                self.make_operand_constant(&x, Const::null())?;
            }
            GuardClass | GuardNonnullClass => {
                if let Some(class) = self.get_constant_int(&self.arg(r, 1)) {
                    self.set_known_class(&self.arg(r, 0), class);
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ========== Helpers ==========

    /// Resolved argument `i` of `r`
    pub(crate) fn arg(&self, r: OpRef, i: usize) -> Operand {
        self.resolve(&self.op(r).args[i])
    }

    /// All arguments as constants, if they are
    pub(crate) fn const_args(&self, r: OpRef) -> Option<Vec<Const>> {
        self.op(r)
            .args
            .iter()
            .map(|a| self.resolve(a).as_const().cloned())
            .collect()
    }

    /// Forward `r` to `target` and drop the operation
    pub(crate) fn replace_with(&mut self, r: OpRef, target: &Operand) -> Result<Flow> {
        self.make_equal_to(r, target)?;
        Ok(Flow::Done)
    }

    fn make_operand_constant(&mut self, operand: &Operand, c: Const) -> Result<()> {
        match self.resolve(operand) {
            Operand::Op(r) => self.make_constant(r, c),
            Operand::Const(existing) if existing != c => Err(Error::invalid_loop(format!(
                "value is both {} and {}",
                existing, c
            ))),
            Operand::Const(_) => Ok(()),
        }
    }

    pub(crate) fn set_known_class(&mut self, operand: &Operand, class: i64) {
        let descr = self.descrs.size_for_class(class);
        let Some(info) = self.ensure_ptr_info(operand) else {
            return;
        };
        if let PtrInfo::NonNull { last_guard } = *info {
            *info = PtrInfo::Struct(StructInfo {
                descr,
                known_class: Some(class),
                fields: Vec::new(),
                is_virtual: false,
                last_guard,
            });
        } else if let PtrInfo::Struct(s) = info {
            s.known_class = Some(class);
            if s.descr.is_none() {
                s.descr = descr;
            }
        }
    }

    // ========== Integer identities ==========

    fn rewrite_int_binary(&mut self, r: OpRef) -> Result<Flow> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        let (a, b) = (self.arg(r, 0), self.arg(r, 1));
        let (ca, cb) = (self.get_constant_int(&a), self.get_constant_int(&b));
        let same = a == b;
        match opcode {
            IntAdd => {
                if cb == Some(0) {
                    return self.replace_with(r, &a);
                }
                if ca == Some(0) {
                    return self.replace_with(r, &b);
                }
            }
            IntSub => {
                if cb == Some(0) {
                    return self.replace_with(r, &a);
                }
                if same {
                    return self.replace_with(r, &Operand::int(0));
                }
                if ca == Some(0) {
                    let op = self.op_mut(r);
                    op.opcode = IntNeg;
                    op.args = vec![b];
                }
            }
            IntMul => {
                for (x, c) in [(&a, cb), (&b, ca)] {
                    match c {
                        Some(1) => return self.replace_with(r, x),
                        Some(0) => return self.replace_with(r, &Operand::int(0)),
                        Some(c) => {
                            if let Some(shift) = power_of_two(c) {
                                let x = x.clone();
                                let op = self.op_mut(r);
                                op.opcode = IntLshift;
                                op.args = vec![x, Operand::int(shift as i64)];
                                return Ok(Flow::Emit(r));
                            }
                        }
                        None => {}
                    }
                }
            }
            IntAnd => {
                if ca == Some(0) || cb == Some(0) {
                    return self.replace_with(r, &Operand::int(0));
                }
                if cb == Some(-1) || same {
                    return self.replace_with(r, &a);
                }
                if ca == Some(-1) {
                    return self.replace_with(r, &b);
                }
            }
            IntOr => {
                if cb == Some(0) || same {
                    return self.replace_with(r, &a);
                }
                if ca == Some(0) {
                    return self.replace_with(r, &b);
                }
            }
            IntXor => {
                if same {
                    return self.replace_with(r, &Operand::int(0));
                }
                if cb == Some(0) {
                    return self.replace_with(r, &a);
                }
                if ca == Some(0) {
                    return self.replace_with(r, &b);
                }
            }
            IntLshift | IntRshift | UintRshift => {
                if cb == Some(0) {
                    return self.replace_with(r, &a);
                }
                if ca == Some(0) {
                    return self.replace_with(r, &Operand::int(0));
                }
            }
            IntPyDiv => {
                if cb == Some(1) {
                    return self.replace_with(r, &a);
                }
                if let Some(shift) = cb.and_then(power_of_two) {
                    let op = self.op_mut(r);
                    op.opcode = IntRshift;
                    op.args = vec![a, Operand::int(shift as i64)];
                }
            }
            IntPyMod => {
                if cb == Some(1) {
                    return self.replace_with(r, &Operand::int(0));
                }
                if let Some(c) = cb.filter(|c| power_of_two(*c).is_some()) {
                    let op = self.op_mut(r);
                    op.opcode = IntAnd;
                    op.args = vec![a, Operand::int(c - 1)];
                }
            }
            _ => {}
        }
        Ok(Flow::Emit(r))
    }

    // ========== Comparisons ==========

    fn rewrite_comparison(&mut self, r: OpRef) -> Result<Flow> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        if self.op(r).args.len() != 2 {
            return Ok(Flow::Emit(r));
        }
        let (a, b) = (self.arg(r, 0), self.arg(r, 1));
        if a == b {
            let result = match opcode {
                IntLt | IntGt | IntNe | UintLt | UintGt => Some(0),
                IntLe | IntGe | IntEq | UintLe | UintGe => Some(1),
                // float comparisons of a value with itself depend on NaN
                _ => None,
            };
            if let Some(v) = result {
                return self.replace_with(r, &Operand::int(v));
            }
        }
        self.find_rewritable_bool(r, opcode, a, b)
    }

    /// Reuse an earlier comparison of the same values: `b > a` answers
    /// `a < b`, and a known `a >= b` answers `a < b` by negation
    fn find_rewritable_bool(
        &mut self,
        r: OpRef,
        opcode: OpCode,
        a: Operand,
        b: Operand,
    ) -> Result<Flow> {
        if let Some(reflex) = opcode.bool_reflex() {
            if let Some(found) = self.pure_lookup(reflex, &[b.clone(), a.clone()], None) {
                return self.replace_with(r, &found);
            }
        }
        if let Some(inverse) = opcode.bool_inverse() {
            let candidates = [
                (inverse, [a.clone(), b.clone()]),
                (inverse.bool_reflex().unwrap_or(inverse), [b, a]),
            ];
            for (other, args) in candidates {
                let found = self.pure_lookup(other, &args, None);
                if let Some(v) = found.as_ref().and_then(|f| self.get_constant_int(f)) {
                    return self.replace_with(r, &Operand::int(1 - v));
                }
            }
        }
        Ok(Flow::Emit(r))
    }

    fn rewrite_ptr_compare(&mut self, r: OpRef) -> Result<Flow> {
        let is_eq = matches!(self.op(r).opcode, OpCode::PtrEq | OpCode::InstancePtrEq);
        let (a, b) = (self.arg(r, 0), self.arg(r, 1));
        let answer = |equal: bool| Operand::int((equal == is_eq) as i64);
        if a == b {
            return self.replace_with(r, &answer(true));
        }
        let (na, nb) = (self.nullness(&a), self.nullness(&b));
        match (na, nb) {
            (Nullness::Null, Nullness::Null) => return self.replace_with(r, &answer(true)),
            (Nullness::Null, Nullness::NonNull) | (Nullness::NonNull, Nullness::Null) => {
                return self.replace_with(r, &answer(false))
            }
            _ => {}
        }
        // a virtual is a fresh object, distinct from every other value
        if self.is_virtual(&a) || self.is_virtual(&b) {
            return self.replace_with(r, &answer(false));
        }
        let opcode = self.op(r).opcode;
        self.find_rewritable_bool(r, opcode, a, b)
    }

    // ========== Guards ==========

    fn rewrite_guard_value(&mut self, r: OpRef) -> Result<Flow> {
        let x = self.arg(r, 0);
        let Operand::Const(expected) = self.arg(r, 1) else {
            return Ok(Flow::Emit(r));
        };
        if let Operand::Const(actual) = &x {
            if *actual == expected {
                return Ok(Flow::Done);
            }
            return Err(Error::invalid_loop(format!(
                "guard_value({}, {}) always fails",
                actual, expected
            )));
        }
        if let Some(v) = expected.as_int() {
            if !self.getintbound(&x).contains(v) {
                return Err(Error::invalid_loop(format!(
                    "guard_value expects {} outside of {}",
                    v,
                    self.getintbound(&x)
                )));
            }
        }
        if expected.is_null() && self.nullness(&x) == Nullness::NonNull {
            return Err(Error::invalid_loop("guard_value expects NULL of a non-null value"));
        }
        let expected_class = match &expected {
            Const::Ref(RefConst::Obj { class, .. }) => *class,
            _ => None,
        };
        if let (Some(known), Some(class)) = (self.known_class(&x), expected_class) {
            if known != class {
                return Err(Error::invalid_loop("guard_value expects an object of another class"));
            }
        }
        if let Some(pos) = self.getptrinfo(&x).and_then(PtrInfo::last_guard) {
            self.replace_guard(r, pos);
        }
        Ok(Flow::Emit(r))
    }

    fn rewrite_guard_class(&mut self, r: OpRef) -> Result<Flow> {
        let x = self.arg(r, 0);
        let Some(class) = self.get_constant_int(&self.arg(r, 1)) else {
            return Ok(Flow::Emit(r));
        };
        if self.nullness(&x) == Nullness::Null {
            return Err(Error::invalid_loop("class guard on a null value"));
        }
        match self.known_class(&x) {
            Some(known) if known == class => return Ok(Flow::Done),
            Some(known) => {
                return Err(Error::invalid_loop(format!(
                    "class guard expects {} but the class is {}",
                    class, known
                )))
            }
            None => {}
        }
        if self.op(r).opcode == OpCode::GuardClass {
            if let Some(PtrInfo::NonNull {
                last_guard: Some(pos),
            }) = self.getptrinfo(&x)
            {
                // fold into the earlier guard_nonnull
                let pos = *pos;
                self.op_mut(r).opcode = OpCode::GuardNonnullClass;
                self.replace_guard(r, pos);
            }
        }
        Ok(Flow::Emit(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_trace;
    use crate::ir::Trace;

    fn optimize(source: &str) -> Result<Trace> {
        let trace = parse_trace(source).unwrap();
        Optimizer::new().optimize(&trace)
    }

    fn finish_args(trace: &Trace) -> Vec<Operand> {
        trace.final_op().unwrap().1.args.clone()
    }

    #[test]
    fn test_int_identities() {
        let out = optimize(
            "[i0, i1]\n\
             i2 = int_add(i0, 0)\n\
             i3 = int_mul(i1, 1)\n\
             i4 = int_sub(i0, i0)\n\
             i5 = int_and(i1, 0)\n\
             i6 = int_xor(i0, i0)\n\
             i7 = int_or(i1, i1)\n\
             finish(i2, i3, i4, i5, i6, i7)\n",
        )
        .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        assert_eq!(
            finish_args(&out),
            vec![
                Operand::Op(OpRef(0)),
                Operand::Op(OpRef(1)),
                Operand::int(0),
                Operand::int(0),
                Operand::int(0),
                Operand::Op(OpRef(1)),
            ]
        );
    }

    #[test]
    fn test_power_of_two_strength_reduction() {
        let out = optimize(
            "[i0]\ni1 = int_py_div(i0, 8)\ni2 = int_py_mod(i0, 8)\ni3 = int_mul(i0, 4)\nfinish(i1, i2, i3)\n",
        )
        .unwrap();
        assert_eq!(
            out.opcodes(),
            vec![OpCode::IntRshift, OpCode::IntAnd, OpCode::IntLshift, OpCode::Finish]
        );
        let (_, and) = out.iter().find(|(_, op)| op.opcode == OpCode::IntAnd).unwrap();
        assert_eq!(and.args[1], Operand::int(7));
    }

    #[test]
    fn test_zero_minus_becomes_neg() {
        let out = optimize("[i0]\ni1 = int_sub(0, i0)\nfinish(i1)\n").unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::IntNeg, OpCode::Finish]);
    }

    #[test]
    fn test_guard_on_constant_condition() {
        let out = optimize("[i0]\ni1 = int_le(i0, i0)\nguard_true(i1) []\nfinish(i0)\n").unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);

        let err = optimize("[i0]\ni1 = int_lt(i0, i0)\nguard_true(i1) []\nfinish(i0)\n")
            .unwrap_err();
        assert!(err.is_invalid_loop());
    }

    #[test]
    fn test_reflex_comparison_reused() {
        let out = optimize(
            "[i0, i1]\ni2 = int_lt(i0, i1)\ni3 = int_gt(i1, i0)\nfinish(i2, i3)\n",
        )
        .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::IntLt, OpCode::Finish]);
        let args = finish_args(&out);
        assert_eq!(args[0], args[1]);
    }

    #[test]
    fn test_guard_class_merges_into_nonnull() {
        let out = optimize(
            "struct Node class=1 { value: int }\n---\n\
             [p0]\n\
             guard_nonnull(p0) [p0]\n\
             guard_class(p0, ConstClass(Node)) [p0]\n\
             guard_class(p0, ConstClass(Node)) [p0]\n\
             finish(p0)\n",
        )
        .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::GuardNonnullClass, OpCode::Finish]);
    }

    #[test]
    fn test_guard_class_mismatch_is_invalid() {
        let err = optimize(
            "struct A class=1 { x: int }\nstruct B class=2 { x: int }\n---\n\
             [p0]\n\
             guard_class(p0, ConstClass(A)) []\n\
             guard_class(p0, ConstClass(B)) []\n\
             finish(p0)\n",
        )
        .unwrap_err();
        assert!(err.is_invalid_loop());
    }

    #[test]
    fn test_guard_value_makes_constant() {
        let out = optimize("[i0]\nguard_value(i0, 5) []\ni1 = int_add(i0, 1)\nfinish(i1)\n")
            .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::GuardValue, OpCode::Finish]);
        assert_eq!(finish_args(&out), vec![Operand::int(6)]);
    }

    #[test]
    fn test_nullness_guards() {
        let out = optimize(
            "[p0]\nguard_nonnull(p0) []\nguard_nonnull(p0) []\ni1 = ptr_eq(p0, NULL)\nfinish(i1)\n",
        )
        .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::GuardNonnull, OpCode::Finish]);
        assert_eq!(finish_args(&out), vec![Operand::int(0)]);

        let err = optimize("[p0]\nguard_isnull(p0) []\nguard_nonnull(p0) []\nfinish()\n")
            .unwrap_err();
        assert!(err.is_invalid_loop());
    }

    #[test]
    fn test_guard_no_exception_after_raising_call() {
        let out = optimize(
            "call f(int) -> int can_raise\n---\n\
             [i0]\n\
             guard_no_exception() []\n\
             i1 = call_i(i0, descr=f)\n\
             guard_no_exception() []\n\
             guard_no_exception() []\n\
             finish(i1)\n",
        )
        .unwrap();
        assert_eq!(
            out.opcodes(),
            vec![OpCode::Call, OpCode::GuardNoException, OpCode::Finish]
        );
    }

    #[test]
    fn test_loop_invariant_call_cached() {
        let out = optimize(
            "call g(int) -> int loopinvariant\n---\n\
             [i0]\n\
             i1 = call_loopinvariant_i(1, descr=g)\n\
             i2 = call_loopinvariant_i(1, descr=g)\n\
             finish(i1, i2)\n",
        )
        .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::Call, OpCode::Finish]);
        let args = finish_args(&out);
        assert_eq!(args[0], args[1]);
    }

    #[test]
    fn test_known_call_pure_result() {
        let out = optimize(
            "call f(int, int) -> int elidable\nknown f(1, 2) = 3\n---\n\
             [i0]\n\
             i1 = call_pure_i(1, 2, descr=f)\n\
             finish(i1)\n",
        )
        .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        assert_eq!(finish_args(&out), vec![Operand::int(3)]);
    }

    #[test]
    fn test_cast_round_trip() {
        let out = optimize("[p0]\ni1 = cast_ptr_to_int(p0)\np2 = cast_int_to_ptr(i1)\nfinish(p2)\n")
            .unwrap();
        assert_eq!(out.opcodes(), vec![OpCode::CastPtrToInt, OpCode::Finish]);
        assert_eq!(finish_args(&out), vec![Operand::Op(OpRef(0))]);
    }
}
