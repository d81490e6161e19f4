//! Heap cache behavior and random read/write/call differential checks

mod common;
use common::{assert_same_behavior, opcodes, optimize, with_decls};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use traceopt::ir::OpCode;

mod caching {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_write_flushed_before_reading_call() {
        let out = optimize(&with_decls(
            "[p0, i1]\n\
             setfield_gc(p0, i1, descr=Node.value)\n\
             i2 = call_i(p0, descr=reader)\n\
             finish(i2)\n",
        ));
        assert_eq!(opcodes(&out), vec![OpCode::SetfieldGc, OpCode::Call, OpCode::Finish]);
    }

    #[test]
    fn test_unrelated_call_keeps_cached_read() {
        let out = optimize(&with_decls(
            "[p0, i1]\n\
             i2 = getfield_gc_i(p0, descr=Node.value)\n\
             i3 = call_i(i1, descr=opaque)\n\
             i4 = getfield_gc_i(p0, descr=Node.value)\n\
             finish(i2, i3, i4)\n",
        ));
        assert_eq!(out.count(OpCode::GetfieldGc), 1);
    }

    #[test]
    fn test_possible_alias_write_invalidates() {
        let out = optimize(&with_decls(
            "[p0, p1, i2]\n\
             i3 = getfield_gc_i(p0, descr=Node.value)\n\
             setfield_gc(p1, i2, descr=Node.value)\n\
             i4 = getfield_gc_i(p0, descr=Node.value)\n\
             finish(i3, i4)\n",
        ));
        assert_eq!(out.count(OpCode::GetfieldGc), 2);
    }

    #[test]
    fn test_constant_index_items_cached() {
        let out = optimize(&with_decls(
            "[p0]\n\
             i1 = getarrayitem_gc_i(p0, 1, descr=IntArr)\n\
             i2 = getarrayitem_gc_i(p0, 1, descr=IntArr)\n\
             finish(i1, i2)\n",
        ));
        assert_eq!(out.count(OpCode::GetarrayitemGc), 1);
    }

    #[test]
    fn test_variable_index_write_invalidates_items() {
        let out = optimize(&with_decls(
            "[p0, i1]\n\
             i2 = getarrayitem_gc_i(p0, 1, descr=IntArr)\n\
             setarrayitem_gc(p0, i1, 7, descr=IntArr)\n\
             i3 = getarrayitem_gc_i(p0, 1, descr=IntArr)\n\
             finish(i2, i3)\n",
        ));
        assert_eq!(out.count(OpCode::GetarrayitemGc), 2);
    }
}

mod aliasing {
    use super::*;

    const SOURCE: &str = "[p0, p1]\n\
                          setfield_gc(p0, 1, descr=Node.value)\n\
                          setfield_gc(p1, 2, descr=Node.value)\n\
                          i2 = getfield_gc_i(p0, descr=Node.value)\n\
                          finish(i2)\n";

    #[test]
    fn test_same_object_twice() {
        let source = format!("{}object shared: Node\n---\n{}", common::DECLS, SOURCE);
        assert_same_behavior(&source, &["shared", "shared"], 1);
    }

    #[test]
    fn test_distinct_objects() {
        let source = format!("{}object shared: Node\n---\n{}", common::DECLS, SOURCE);
        assert_same_behavior(&source, &["Node", "Node"], 1);
    }
}

/// Random interleavings of reads, writes and calls over two objects,
/// which may or may not be the same object
mod random_sequences {
    use super::*;

    fn record(rng: &mut StdRng) -> String {
        let mut lines = Vec::new();
        let mut ints = vec!["i2".to_string()];
        let objects = ["p0", "p1"];
        let mut next = 3;
        for _ in 0..rng.gen_range(4..20) {
            let obj = objects[rng.gen_range(0..2)];
            match rng.gen_range(0..7) {
                0 | 1 => {
                    let name = format!("i{}", next);
                    lines.push(format!("{} = getfield_gc_i({}, descr=Node.value)", name, obj));
                    ints.push(name);
                }
                2 | 3 => {
                    let value = if rng.gen_bool(0.5) {
                        rng.gen_range(-3..10).to_string()
                    } else {
                        ints.choose(rng).cloned().unwrap()
                    };
                    lines.push(format!("setfield_gc({}, {}, descr=Node.value)", obj, value));
                }
                4 => {
                    let index = rng.gen_range(0..3);
                    let name = format!("i{}", next);
                    lines.push(format!(
                        "{} = getarrayitem_gc_i(p3, {}, descr=IntArr)",
                        name, index
                    ));
                    ints.push(name);
                }
                5 => {
                    let index = rng.gen_range(0..3);
                    let value = ints.choose(rng).cloned().unwrap();
                    lines.push(format!("setarrayitem_gc(p3, {}, {}, descr=IntArr)", index, value));
                }
                _ => {
                    let name = format!("i{}", next);
                    let call = ["writer", "reader", "arrays"][rng.gen_range(0..3)];
                    let arg = if call == "arrays" { "p3" } else { obj };
                    lines.push(format!("{} = call_i({}, descr={})", name, arg, call));
                    ints.push(name);
                }
            }
            next += 1;
        }
        let finish: Vec<String> = ints.iter().rev().take(4).cloned().collect();
        format!(
            "{}object shared: Node\ncall arrays(ref) -> int writes=IntArr reads=IntArr\n---\n\
             [p0, p1, i2, p3]\n{}\nfinish({})\n",
            common::DECLS,
            lines.join("\n"),
            finish.join(", ")
        )
    }

    #[test]
    fn test_reads_match_unoptimized_run() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..60 {
            let source = record(&mut rng);
            let aliased = rng.gen_bool(0.5);
            let objects = if aliased { ["shared", "shared"] } else { ["Node", "Node"] };
            assert_same_behavior(&source, &[objects[0], objects[1], "5", "IntArr[3]"], 1);
        }
    }
}
