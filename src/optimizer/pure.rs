//! Constant folding and common subexpression elimination of pure operations

use super::{Flow, Optimizer};
use crate::error::Result;
use crate::ir::eval::eval_pure;
use crate::ir::{DescrRef, OpCode, OpRef, Operand};
use rustc_hash::FxHashMap as HashMap;

type PureKey = (OpCode, Vec<Operand>, Option<DescrRef>);

#[derive(Debug, Default)]
pub(crate) struct PureState {
    cache: HashMap<PureKey, Operand>,
    /// Opcode of the operation in flight, recorded once it is emitted
    pending: Option<(OpRef, OpCode)>,
    /// Overflow-checked operation, recorded once its guard passed
    ovf_pending: Option<(PureKey, OpRef)>,
    drop_next_no_overflow: bool,
}

impl Optimizer {
    pub(crate) fn optimize_pure(&mut self, r: OpRef) -> Result<Flow> {
        let opcode = self.op(r).opcode;
        let drop_guard = std::mem::take(&mut self.pure.drop_next_no_overflow);
        if opcode == OpCode::GuardNoOverflow && drop_guard {
            return Ok(Flow::Done);
        }
        if opcode.is_ovf() {
            let key = self.pure_key(opcode, r);
            if let Some(found) = self.pure.cache.get(&key).cloned() {
                self.stats_mut().pure_hits += 1;
                self.pure.drop_next_no_overflow = true;
                return self.replace_with(r, &found);
            }
            self.pure.pending = Some((r, opcode));
            return Ok(Flow::Emit(r));
        }
        if !opcode.is_always_pure() {
            return Ok(Flow::Emit(r));
        }
        if opcode != OpCode::CallPure {
            if let Some(value) = self.const_args(r).and_then(|args| eval_pure(opcode, &args)) {
                self.stats_mut().constant_folds += 1;
                return self.replace_with(r, &Operand::Const(value));
            }
        }
        let args: Vec<Operand> = (0..self.op(r).args.len()).map(|i| self.arg(r, i)).collect();
        if let Some(found) = self.pure_lookup(opcode, &args, self.op(r).descr) {
            self.stats_mut().pure_hits += 1;
            return self.replace_with(r, &found);
        }
        self.pure.pending = Some((r, opcode));
        Ok(Flow::Emit(r))
    }

    pub(crate) fn postprocess_pure(&mut self, r: OpRef) -> Result<()> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        if opcode == GuardNoOverflow {
            if let Some((key, ovf)) = self.pure.ovf_pending.take() {
                let value = self.resolve(&Operand::Op(ovf));
                self.pure.cache.insert(key, value);
            }
            return Ok(());
        }
        let Some((pending, opcode)) = self.pure.pending.take() else {
            return Ok(());
        };
        if pending != r {
            return Ok(());
        }
        let key = self.pure_key(opcode, r);
        if opcode.is_ovf() {
            self.pure.ovf_pending = Some((key, r));
            return Ok(());
        }
        let z = self.resolve(&Operand::Op(r));
        self.pure.cache.insert(key, z.clone());

        let (x, y) = (self.arg(r, 0), self.op(r).args.get(1).map(|_| self.arg(r, 1)));
        match (opcode, y) {
            (IntAdd, Some(y)) => {
                self.record_pure(IntSub, vec![z.clone(), y.clone()], x.clone());
                self.record_pure(IntSub, vec![z.clone(), x.clone()], y.clone());
                if let Some(c) = y.const_int().filter(|&c| c != i64::MIN) {
                    self.record_pure(IntAdd, vec![z, Operand::int(-c)], x);
                }
            }
            (IntSub, Some(y)) => {
                self.record_pure(IntAdd, vec![z.clone(), y.clone()], x.clone());
                self.record_pure(IntSub, vec![x.clone(), z.clone()], y.clone());
                if let Some(c) = y.const_int().filter(|&c| c != i64::MIN) {
                    self.record_pure(IntAdd, vec![x, Operand::int(-c)], z);
                }
            }
            (IntLshift, Some(y)) => {
                if self
                    .getintbound(&x)
                    .lshift_bound_cannot_overflow(&self.getintbound(&y))
                {
                    self.record_pure(IntRshift, vec![z, y], x);
                }
            }
            (IntNeg | IntInvert | FloatNeg, None) => self.record_pure(opcode, vec![z], x),
            (CastPtrToInt, None) => self.record_pure(CastIntToPtr, vec![z], x),
            (CastIntToPtr, None) => self.record_pure(CastPtrToInt, vec![z], x),
            _ => {}
        }
        Ok(())
    }

    fn pure_key(&self, opcode: OpCode, r: OpRef) -> PureKey {
        let args = self.op(r).args.iter().map(|a| self.resolve(a)).collect();
        (opcode, args, self.op(r).descr)
    }

    /// Remember that `opcode(args)` evaluates to `value`
    pub(crate) fn record_pure(&mut self, opcode: OpCode, args: Vec<Operand>, value: Operand) {
        self.pure.cache.entry((opcode, args, None)).or_insert(value);
    }

    /// Remember a result keyed by descriptor as well, for calls and reads
    pub(crate) fn record_pure_with_descr(
        &mut self,
        opcode: OpCode,
        args: Vec<Operand>,
        descr: Option<DescrRef>,
        value: Operand,
    ) {
        self.pure.cache.entry((opcode, args, descr)).or_insert(value);
    }

    /// Every cached result as `(opcode, args, descr, value)`
    pub(crate) fn pure_entries(&self) -> Vec<(OpCode, Vec<Operand>, Option<DescrRef>, Operand)> {
        self.pure
            .cache
            .iter()
            .map(|((opcode, args, descr), value)| {
                let args = args.iter().map(|a| self.resolve(a)).collect();
                (*opcode, args, *descr, self.resolve(value))
            })
            .collect()
    }

    /// Earlier result of `opcode(args)`, also trying swapped arguments of
    /// commutative operations
    pub(crate) fn pure_lookup(
        &self,
        opcode: OpCode,
        args: &[Operand],
        descr: Option<DescrRef>,
    ) -> Option<Operand> {
        let args: Vec<Operand> = args.iter().map(|a| self.resolve(a)).collect();
        let found = self.pure.cache.get(&(opcode, args.clone(), descr)).or_else(|| {
            if opcode.is_commutative() && args.len() == 2 {
                let swapped = vec![args[1].clone(), args[0].clone()];
                self.pure.cache.get(&(opcode, swapped, descr))
            } else {
                None
            }
        });
        found.map(|v| self.resolve(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_trace;
    use crate::ir::Trace;

    fn optimize(source: &str) -> (Trace, Optimizer) {
        let trace = parse_trace(source).unwrap();
        let mut opt = Optimizer::new();
        let out = opt.optimize(&trace).unwrap();
        (out, opt)
    }

    #[test]
    fn test_common_subexpression() {
        let (out, opt) = optimize(
            "[i0, i1]\ni2 = int_mul(i0, i1)\ni3 = int_mul(i1, i0)\ni4 = int_add(i2, i3)\nfinish(i4)\n",
        );
        assert_eq!(out.count(OpCode::IntMul), 1);
        assert_eq!(opt.stats().pure_hits, 1);
    }

    #[test]
    fn test_constant_folding() {
        let (out, opt) = optimize("[]\ni0 = int_mul(6, 7)\ni1 = int_sub(i0, 2)\nfinish(i1)\n");
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::int(40));
        assert!(opt.stats().constant_folds >= 1);
    }

    #[test]
    fn test_float_folding() {
        let (out, _) = optimize("[]\nf0 = float_add(1.5, 2.0)\nf1 = float_neg(f0)\nfinish(f1)\n");
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::Const(crate::ir::Const::float(-3.5)));
    }

    #[test]
    fn test_reverse_of_addition() {
        let (out, _) = optimize("[i0, i1]\ni2 = int_add(i0, i1)\ni3 = int_sub(i2, i1)\nfinish(i3)\n");
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        let (_, finish) = out.final_op().unwrap();
        assert_eq!(finish.args[0], Operand::Op(OpRef(0)));
    }

    #[test]
    fn test_double_negation() {
        let (out, _) = optimize("[i0]\ni1 = int_invert(i0)\ni2 = int_invert(i1)\nfinish(i2)\n");
        assert_eq!(out.opcodes(), vec![OpCode::Finish]);
        assert_eq!(out.final_op().unwrap().1.args, vec![Operand::Op(OpRef(0))]);
    }

    #[test]
    fn test_repeated_overflow_check() {
        let (out, _) = optimize(
            "[i0, i1]\n\
             i2 = int_add_ovf(i0, i1)\n\
             guard_no_overflow() []\n\
             i3 = int_add_ovf(i0, i1)\n\
             guard_no_overflow() []\n\
             finish(i2, i3)\n",
        );
        assert_eq!(
            out.opcodes(),
            vec![OpCode::IntAddOvf, OpCode::GuardNoOverflow, OpCode::Finish]
        );
    }

    #[test]
    fn test_pure_call_deduplicated() {
        let (out, _) = optimize(
            "call f(int) -> int elidable\n---\n[i0]\n\
             i1 = call_pure_i(i0, descr=f)\n\
             i2 = call_pure_i(i0, descr=f)\n\
             finish(i1, i2)\n",
        );
        assert_eq!(out.opcodes(), vec![OpCode::Call, OpCode::Finish]);
    }
}
