//! Loop peeling, short preambles and bridges

mod common;
use common::{assert_same_behavior, parse, peel, with_decls, DECLS};
use traceopt::interp::{Interpreter, Value};
use traceopt::ir::{OpCode, Operand, Trace};
use traceopt::optimizer::OptimizerConfig;
use traceopt::unroll::{Compiled, JumpTarget, LoopToken, UnrollOptimizer};
use traceopt::virtualstate::RuntimeValue;

const COUNTER: &str = "[i0]\n\
                       i1 = int_add(i0, 1)\n\
                       i2 = int_lt(i1, 10)\n\
                       guard_true(i2) [i1]\n\
                       jump(i1)\n";

const SUM: &str = "[p0, i1]\n\
                   guard_nonnull_class(p0, ConstClass(Node)) [p0, i1]\n\
                   i2 = getfield_gc_i(p0, descr=Node.value)\n\
                   i3 = int_add(i1, i2)\n\
                   i4 = int_lt(i3, 100)\n\
                   guard_true(i4) [p0, i3]\n\
                   jump(p0, i3)\n";

mod peeling {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counter_body_starts_with_label() {
        let peeled = peel(COUNTER);
        assert_eq!(
            peeled.body.opcodes(),
            vec![OpCode::Label, OpCode::IntAdd, OpCode::IntLt, OpCode::GuardTrue, OpCode::Jump]
        );
        assert_eq!(peeled.jumps_to, JumpTarget::Label);
        assert_eq!(peeled.preamble.final_op().unwrap().1.opcode, OpCode::Jump);
    }

    #[test]
    fn test_class_guard_stays_in_preamble() {
        let peeled = peel(&with_decls(SUM));
        assert_eq!(peeled.preamble.count(OpCode::GuardNonnullClass), 1);
        assert_eq!(peeled.body.count(OpCode::GuardNonnullClass), 0);
        assert_eq!(peeled.body.count(OpCode::GetfieldGc), 0);
        assert_eq!(peeled.short_preamble.final_op().unwrap().1.opcode, OpCode::Jump);
    }

    #[test]
    fn test_linear_trace_is_not_peeled() {
        let trace = parse("[i0]\ni1 = int_add(i0, 1)\nfinish(i1)\n");
        let compiled = UnrollOptimizer::new(OptimizerConfig::default())
            .optimize(&trace)
            .unwrap();
        assert!(matches!(compiled, Compiled::Linear(_)));
        let names: Vec<&str> = compiled.traces().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["trace"]);
    }

    #[test]
    fn test_peeled_traces_are_named() {
        let trace = parse(COUNTER);
        let compiled = UnrollOptimizer::new(OptimizerConfig::default())
            .optimize(&trace)
            .unwrap();
        let names: Vec<&str> = compiled.traces().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["preamble", "body", "short preamble"]);
    }
}

/// Peeled loops run for several iterations against the original loop
mod behavior {
    use super::*;

    #[test]
    fn test_counter_loop() {
        for start in ["0", "5", "9", "42"] {
            assert_same_behavior(COUNTER, &[start], 20);
        }
    }

    #[test]
    fn test_sum_over_field() {
        let source = with_decls(SUM);
        assert_same_behavior(&source, &["Node", "3"], 200);
        assert_same_behavior(&source, &["NULL", "3"], 5);
        assert_same_behavior(&source, &["Other", "3"], 5);
    }

    #[test]
    fn test_accumulator_in_virtual() {
        let source = with_decls(
            "[p0]\n\
             i1 = getfield_gc_i(p0, descr=Node.value)\n\
             i2 = int_add(i1, 3)\n\
             p3 = new_with_vtable(descr=Node)\n\
             setfield_gc(p3, i2, descr=Node.value)\n\
             i4 = int_lt(i2, 30)\n\
             guard_true(i4) [p3]\n\
             jump(p3)\n",
        );
        assert_same_behavior(&source, &["Node"], 50);
    }

    #[test]
    fn test_linked_list_walk() {
        let source = with_decls(
            "[p0, i1]\n\
             guard_nonnull_class(p0, ConstClass(Node)) [p0, i1]\n\
             i2 = getfield_gc_i(p0, descr=Node.value)\n\
             i3 = int_add(i1, i2)\n\
             p4 = getfield_gc_r(p0, descr=Node.next)\n\
             jump(p4, i3)\n",
        );
        assert_same_behavior(&source, &["Node", "1"], 10);
    }

    #[test]
    fn test_write_and_call_each_iteration() {
        let source = with_decls(
            "[p0, i1]\n\
             setfield_gc(p0, i1, descr=Node.value)\n\
             i2 = call_i(p0, descr=writer)\n\
             i3 = getfield_gc_i(p0, descr=Node.value)\n\
             i4 = int_add(i3, i2)\n\
             i5 = int_lt(i4, 1000)\n\
             guard_true(i5) [p0, i4]\n\
             jump(p0, i4)\n",
        );
        assert_same_behavior(&source, &["Node", "1"], 30);
    }

    #[test]
    fn test_array_loop() {
        let source = with_decls(
            "[p0, i1]\n\
             i2 = int_and(i1, 3)\n\
             i3 = getarrayitem_gc_i(p0, i2, descr=IntArr)\n\
             i4 = int_add(i3, i1)\n\
             setarrayitem_gc(p0, i2, i4, descr=IntArr)\n\
             i5 = int_add(i1, 1)\n\
             i6 = int_lt(i5, 12)\n\
             guard_true(i6) [p0, i5]\n\
             jump(p0, i5)\n",
        );
        assert_same_behavior(&source, &["IntArr[4]", "0"], 20);
    }
}

/// Values the peeled body reads through the label
mod label_arguments {
    use super::*;
    use pretty_assertions::assert_eq;

    const CACHED_ACROSS_CALL: &str = "[p0, i1]\n\
                                      p2 = getfield_gc_r(p0, descr=Node.next)\n\
                                      guard_isnull(p2) [p0, i1]\n\
                                      i3 = call_i(p0, descr=poke)\n\
                                      i4 = getfield_gc_i(p0, descr=Node.value)\n\
                                      i5 = int_mul(i4, i1)\n\
                                      p6 = getfield_gc_r(p0, descr=Node.next)\n\
                                      escape(i5)\n\
                                      jump(p0, i1)\n";

    fn source() -> String {
        format!("{}call poke(ref) -> int random\n---\n{}", DECLS, CACHED_ACROSS_CALL)
    }

    /// Every input the trace reads is one of its declared inputs
    fn assert_reads_only_inputs(trace: &Trace) {
        for (r, op) in trace.iter() {
            let operands = op.args.iter().chain(op.fail_args.iter().flatten());
            for operand in operands {
                if let Operand::Op(a) = operand {
                    if trace.op(*a).opcode == OpCode::InputArg {
                        assert!(
                            trace.inputargs.contains(a),
                            "{:?} reads {:?}, not an input of\n{}",
                            r,
                            a,
                            trace
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_field_cached_across_call_is_carried() {
        let source = source();
        let compiled = UnrollOptimizer::new(OptimizerConfig::default())
            .optimize(&parse(&source))
            .unwrap();
        for (_, trace) in compiled.traces() {
            assert_reads_only_inputs(trace);
        }
        assert_same_behavior(&source, &["Node", "3"], 10);
    }

    #[test]
    fn test_unfinished_run_ends_with_loop_arguments() {
        let source = with_decls(SUM);
        let trace = parse(&source);
        let peeled = peel(&source);
        for iterations in [1, 2, 5] {
            let mut plain = Interpreter::new(trace.descrs.clone());
            let args = vec![plain.parse_value("Node").unwrap(), Value::Int(5)];
            let expected = plain.run_iterations(&trace, &args, iterations).unwrap();

            let mut interp = Interpreter::new(trace.descrs.clone());
            let args = vec![interp.parse_value("Node").unwrap(), Value::Int(5)];
            let got = peeled.execute(&mut interp, &args, iterations).unwrap();
            assert_eq!(got.kind(), "jump");
            assert_eq!(got.values().len(), trace.inputargs.len());
            assert_eq!(
                interp.render_values(got.values()),
                plain.render_values(expected.values())
            );
        }
    }

    #[test]
    fn test_counter_label_carries_loop_value() {
        let peeled = peel(COUNTER);
        assert_reads_only_inputs(&peeled.body);
        assert_reads_only_inputs(&peeled.short_preamble);
    }
}

/// Bridges enter a compiled loop from a side exit
mod bridges {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bridge() -> Trace {
        parse(&with_decls("[p0, i1]\njump(p0, i1)\n"))
    }

    fn runtime(interp: &Interpreter, values: &[Value]) -> Vec<RuntimeValue> {
        values.iter().map(|v| interp.runtime_value(v)).collect()
    }

    #[test]
    fn test_bridge_reaches_the_loop_when_values_fit() {
        let source = with_decls(SUM);
        let peeled = peel(&source);
        let mut token = LoopToken::new(&peeled);

        let mut interp = Interpreter::new(peeled.preamble.descrs.clone());
        let args = vec![interp.parse_value("Node").unwrap(), Value::Int(5)];
        let observed = runtime(&interp, &args);
        assert_eq!(observed[0], RuntimeValue::Object { class: Some(1) });

        let mut unroll = UnrollOptimizer::new(OptimizerConfig::default());
        let result = unroll
            .optimize_bridge(&bridge(), &mut token, Some(&observed))
            .unwrap();
        assert_eq!(result.target, Some(0));
        assert_eq!(result.trace.final_op().unwrap().1.opcode, OpCode::Jump);

        let trace = parse(&source);
        let mut plain = Interpreter::new(trace.descrs.clone());
        let plain_args = vec![plain.parse_value("Node").unwrap(), Value::Int(5)];
        let expected = plain.run_iterations(&trace, &plain_args, 100).unwrap();
        let got = peeled.execute_bridge(&mut interp, &result, &args, 100).unwrap();
        assert_eq!(got.kind(), expected.kind());
        assert_eq!(
            interp.render_values(got.values()),
            plain.render_values(expected.values())
        );
    }

    #[test]
    fn test_retrace_limit_is_respected() {
        let peeled = peel(&with_decls(SUM));
        let observed = [RuntimeValue::Object { class: Some(1) }, RuntimeValue::Int(500)];
        let config = OptimizerConfig {
            retrace_limit: 0,
            ..OptimizerConfig::default()
        };
        let mut token = LoopToken::new(&peeled);
        let result = UnrollOptimizer::new(config)
            .optimize_bridge(&bridge(), &mut token, Some(&observed))
            .unwrap();
        assert_eq!(result.target, None);
        assert!(!result.retrace_requested);
        assert_eq!(token.retraces, 0);
    }

    #[test]
    fn test_same_failing_state_retraces_once() {
        let peeled = peel(&with_decls(SUM));
        let observed = [RuntimeValue::Object { class: Some(1) }, RuntimeValue::Int(500)];
        let mut token = LoopToken::new(&peeled);
        let mut unroll = UnrollOptimizer::new(OptimizerConfig::default());
        let requests: Vec<bool> = (0..3)
            .map(|_| {
                unroll
                    .optimize_bridge(&bridge(), &mut token, Some(&observed))
                    .unwrap()
                    .retrace_requested
            })
            .collect();
        assert_eq!(requests, vec![true, false, false]);
        assert_eq!(token.failed_states.len(), 1);
    }

    #[test]
    fn test_null_cannot_enter_class_guarded_loop() {
        let peeled = peel(&with_decls(SUM));
        let observed = [RuntimeValue::Null, RuntimeValue::Int(5)];
        let mut token = LoopToken::new(&peeled);
        let result = UnrollOptimizer::new(OptimizerConfig::default())
            .optimize_bridge(&bridge(), &mut token, Some(&observed))
            .unwrap();
        assert_eq!(result.target, None);
    }
}
