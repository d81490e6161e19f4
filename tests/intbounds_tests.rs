//! Integer bound soundness and guard-driven narrowing

mod common;
use common::{assert_same_behavior, optimize};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::rc::Rc;
use traceopt::interp::{Interpreter, Value};
use traceopt::intbound::IntBound;
use traceopt::ir::eval::eval_pure;
use traceopt::ir::{Const, DescrTable, Op, OpCode, Operand, Trace, Type};

fn random_bound(rng: &mut StdRng) -> IntBound {
    let (lo, hi) = match rng.gen_range(0..5) {
        0 => (rng.gen_range(-20..20), rng.gen_range(-20..20)),
        1 => (rng.gen_range(0..1000), rng.gen_range(0..1000)),
        2 => (i64::MIN, rng.gen_range(-100..100)),
        3 => (rng.gen_range(-100..100), i64::MAX),
        _ => (rng.gen_range(i64::MIN / 2..0), rng.gen_range(0..i64::MAX / 2)),
    };
    IntBound::new(lo.min(hi), lo.max(hi)).unwrap()
}

fn samples(rng: &mut StdRng, bound: &IntBound) -> Vec<i64> {
    let mut values = vec![bound.lower, bound.upper];
    for _ in 0..6 {
        values.push(rng.gen_range(bound.lower..=bound.upper));
    }
    values
}

fn shift_bound(rng: &mut StdRng) -> IntBound {
    let a = rng.gen_range(0..64);
    let b = rng.gen_range(0..64);
    IntBound::new(a.min(b), a.max(b)).unwrap()
}

mod soundness {
    use super::*;

    type BinaryBound = fn(&IntBound, &IntBound) -> IntBound;

    const BINARY: &[(OpCode, BinaryBound)] = &[
        (OpCode::IntAdd, IntBound::add_bound),
        (OpCode::IntSub, IntBound::sub_bound),
        (OpCode::IntMul, IntBound::mul_bound),
        (OpCode::IntAnd, IntBound::and_bound),
        (OpCode::IntOr, IntBound::or_bound),
        (OpCode::IntXor, IntBound::xor_bound),
        (OpCode::IntPyDiv, IntBound::py_div_bound),
        (OpCode::IntPyMod, IntBound::mod_bound),
    ];

    const SHIFTS: &[(OpCode, BinaryBound)] = &[
        (OpCode::IntLshift, IntBound::lshift_bound),
        (OpCode::IntRshift, IntBound::rshift_bound),
        (OpCode::UintRshift, IntBound::urshift_bound),
    ];

    fn check(opcode: OpCode, a: &IntBound, b: &IntBound, result: &IntBound, x: i64, y: i64) {
        // division and modulo by zero have no value
        if let Some(Const::Int(r)) = eval_pure(opcode, &[Const::Int(x), Const::Int(y)]) {
            assert!(
                result.contains(r),
                "{:?}({}, {}) = {} escapes {} from {} and {}",
                opcode,
                x,
                y,
                r,
                result,
                a,
                b
            );
        }
    }

    #[test]
    fn test_binary_results_stay_in_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..300 {
            let a = random_bound(&mut rng);
            let b = random_bound(&mut rng);
            let xs = samples(&mut rng, &a);
            let ys = samples(&mut rng, &b);
            for (opcode, bound_fn) in BINARY {
                let result = bound_fn(&a, &b);
                for &x in &xs {
                    for &y in &ys {
                        check(*opcode, &a, &b, &result, x, y);
                    }
                }
            }
        }
    }

    #[test]
    fn test_shift_results_stay_in_bound() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..300 {
            let a = random_bound(&mut rng);
            let b = shift_bound(&mut rng);
            let xs = samples(&mut rng, &a);
            let ys = samples(&mut rng, &b);
            for (opcode, bound_fn) in SHIFTS {
                let result = bound_fn(&a, &b);
                for &x in &xs {
                    for &y in &ys {
                        check(*opcode, &a, &b, &result, x, y);
                    }
                }
            }
        }
    }

    #[test]
    fn test_unary_results_stay_in_bound() {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..300 {
            let a = random_bound(&mut rng);
            let neg = a.neg_bound();
            let inv = a.invert_bound();
            for x in samples(&mut rng, &a) {
                assert!(neg.contains(x.wrapping_neg()), "-{} escapes {}", x, neg);
                assert!(inv.contains(!x), "~{} escapes {}", x, inv);
            }
        }
    }

    #[test]
    fn test_known_bits_survive_bitwise_ops() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..300 {
            let (ta, ma) = (rng.gen::<u64>(), rng.gen::<u64>());
            let (tb, mb) = (rng.gen::<u64>(), rng.gen::<u64>());
            let a = IntBound::from_knownbits(ta & !ma, ma);
            let b = IntBound::from_knownbits(tb & !mb, mb);
            for _ in 0..8 {
                let x = ((ta & !ma) | (rng.gen::<u64>() & ma)) as i64;
                let y = ((tb & !mb) | (rng.gen::<u64>() & mb)) as i64;
                assert!(a.contains(x) && b.contains(y));
                assert!(a.and_bound(&b).contains(x & y));
                assert!(a.or_bound(&b).contains(x | y));
                assert!(a.xor_bound(&b).contains(x ^ y));
                assert!(a.add_bound(&b).contains(x.wrapping_add(y)));
            }
        }
    }

    #[test]
    fn test_narrowing_keeps_every_satisfying_value() {
        let mut rng = StdRng::seed_from_u64(19);
        for _ in 0..300 {
            let a = random_bound(&mut rng);
            let c = rng.gen_range(-50..50);
            let mut narrowed = a.clone();
            if narrowed.make_lt_const(c).is_err() {
                assert!(a.lower >= c);
                continue;
            }
            for x in samples(&mut rng, &a) {
                if x < c {
                    assert!(narrowed.contains(x), "{} < {} lost from {}", x, c, narrowed);
                }
            }
            assert!(a.contains_bound(&narrowed));
        }
    }
}

/// Guards built from a bound accept exactly the values in the bound
mod guards {
    use super::*;
    use pretty_assertions::assert_eq;

    fn guarded_trace(bound: &IntBound) -> Trace {
        let mut trace = Trace::new(Rc::new(DescrTable::new()));
        let input = trace.add_inputarg(Type::Int);
        let value = Operand::from(input);
        bound.make_guards(&value, &mut |op: Op| trace.push(op.with_fail_args(vec![value.clone()])));
        trace.push(Op::void(OpCode::Finish, vec![value]));
        trace
    }

    fn passes(trace: &Trace, value: i64) -> bool {
        let mut interp = Interpreter::new(trace.descrs.clone());
        let outcome = interp.run(trace, &[Value::Int(value)]).unwrap();
        outcome.kind() == "finish"
    }

    #[test]
    fn test_guards_match_containment() {
        let mut rng = StdRng::seed_from_u64(23);
        for _ in 0..100 {
            let bound = match rng.gen_range(0..3) {
                0 => IntBound::from_constant(rng.gen_range(-9..9)),
                1 => random_bound(&mut rng),
                _ => {
                    let range = random_bound(&mut rng);
                    let mut b = range.clone();
                    match b.intersect(&IntBound::from_knownbits(0, !3)) {
                        Ok(_) => b,
                        Err(_) => range,
                    }
                }
            };
            let trace = guarded_trace(&bound);
            let mut inputs = vec![0, -1, 1, i64::MIN, i64::MAX];
            inputs.extend([bound.lower, bound.upper]);
            inputs.extend([bound.lower.wrapping_sub(1), bound.upper.wrapping_add(1)]);
            for _ in 0..6 {
                inputs.push(rng.gen_range(-2000..2000));
            }
            for value in inputs {
                assert_eq!(passes(&trace, value), bound.contains(value), "{} in {}", value, bound);
            }
        }
    }

    #[test]
    fn test_unbounded_needs_no_guard() {
        let trace = guarded_trace(&IntBound::unbounded());
        assert_eq!(trace.opcodes(), vec![OpCode::Finish]);
    }
}

/// The optimizer uses what a passed guard proves about later comparisons
mod narrowing {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source(first: &str, c: i64, second: &str, d: i64) -> String {
        format!(
            "[i0]\n\
             i1 = {}(i0, {})\n\
             guard_true(i1) []\n\
             i2 = {}(i0, {})\n\
             finish(i2)\n",
            first, c, second, d
        )
    }

    #[test]
    fn test_implied_comparison_folds() {
        let out = optimize(&source("int_lt", 10, "int_lt", 20));
        assert_eq!(out.final_op().unwrap().1.args, vec![Operand::int(1)]);
        let out = optimize(&source("int_ge", 0, "int_lt", 0));
        assert_eq!(out.final_op().unwrap().1.args, vec![Operand::int(0)]);
    }

    #[test]
    fn test_undecided_comparison_kept() {
        let out = optimize(&source("int_lt", 10, "int_lt", 5));
        assert_eq!(out.count(OpCode::IntLt), 2);
    }

    #[test]
    fn test_random_comparisons_agree_with_interpreter() {
        let names = ["int_lt", "int_le", "int_gt", "int_ge", "int_eq", "int_ne"];
        let mut rng = StdRng::seed_from_u64(29);
        for _ in 0..60 {
            let text = source(
                names[rng.gen_range(0..names.len())],
                rng.gen_range(-5..5),
                names[rng.gen_range(0..names.len())],
                rng.gen_range(-5..5),
            );
            for input in ["-6", "-1", "0", "3", "7"] {
                assert_same_behavior(&text, &[input], 1);
            }
        }
    }

    #[test]
    fn test_masked_index_is_nonnegative() {
        let out = optimize(
            "[i0]\n\
             i1 = int_and(i0, 7)\n\
             i2 = int_ge(i1, 0)\n\
             i3 = int_lt(i1, 8)\n\
             finish(i2, i3)\n",
        );
        assert_eq!(
            out.final_op().unwrap().1.args,
            vec![Operand::int(1), Operand::int(1)]
        );
    }
}
