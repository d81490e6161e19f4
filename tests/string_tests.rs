//! Virtual strings: concatenation, slicing, equality and copies

mod common;
use common::{assert_same_behavior, opcodes, optimize};
use traceopt::ir::{Const, OpCode, Operand};

mod folding {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_built_string_compared_with_constant() {
        let out = optimize(
            "[]\n\
             p0 = newstr(2)\n\
             strsetitem(p0, 0, 104)\n\
             strsetitem(p0, 1, 105)\n\
             i1 = call_i(p0, \"hi\", descr=str_equal)\n\
             finish(i1)\n",
        );
        assert_eq!(opcodes(&out), vec![OpCode::Finish]);
        assert_eq!(out.final_op().unwrap().1.args, vec![Operand::int(1)]);
    }

    #[test]
    fn test_built_string_differs_from_constant() {
        let out = optimize(
            "[]\n\
             p0 = newstr(2)\n\
             strsetitem(p0, 0, 104)\n\
             strsetitem(p0, 1, 105)\n\
             i1 = call_i(p0, \"ho\", descr=str_equal)\n\
             finish(i1)\n",
        );
        assert_eq!(opcodes(&out), vec![OpCode::Finish]);
        assert_eq!(out.final_op().unwrap().1.args, vec![Operand::int(0)]);
    }

    #[test]
    fn test_slice_of_constant_folds() {
        let out = optimize(
            "[]\n\
             p0 = call_r(\"traceopt\", 5, 8, descr=str_slice)\n\
             guard_no_exception() []\n\
             finish(p0)\n",
        );
        assert_eq!(opcodes(&out), vec![OpCode::Finish]);
        assert_eq!(
            out.final_op().unwrap().1.args,
            vec![Operand::Const(Const::str("opt"))]
        );
    }

    #[test]
    fn test_length_of_concat_needs_no_string() {
        let out = optimize(
            "[p0]\n\
             p1 = call_r(p0, \"!\", descr=str_concat)\n\
             guard_no_exception() []\n\
             i2 = strlen(p1)\n\
             finish(i2)\n",
        );
        assert_eq!(out.count(OpCode::Newstr), 0);
        assert_eq!(out.count(OpCode::Call), 0);
    }
}

mod behavior {
    use super::*;

    #[test]
    fn test_concat_then_slice() {
        let source = "[p0, p1, i2]\n\
                      p3 = call_r(p0, p1, descr=str_concat)\n\
                      guard_no_exception() []\n\
                      i4 = strlen(p3)\n\
                      p5 = call_r(p3, i2, i4, descr=str_slice)\n\
                      guard_no_exception() []\n\
                      i6 = strgetitem(p5, 0)\n\
                      escape(p5)\n\
                      finish(p5, i6)\n";
        assert_same_behavior(source, &["\"hello\"", "\"world\"", "3"], 1);
        assert_same_behavior(source, &["\"a\"", "\"bc\"", "0"], 1);
    }

    #[test]
    fn test_forced_string_contents() {
        let source = "[i0, i1]\n\
                      p2 = newstr(3)\n\
                      strsetitem(p2, 0, i0)\n\
                      strsetitem(p2, 1, i1)\n\
                      strsetitem(p2, 2, 33)\n\
                      escape(p2)\n\
                      finish(p2)\n";
        assert_same_behavior(source, &["104", "105"], 1);
    }

    #[test]
    fn test_equality_with_null_and_empty() {
        let source = "[p0, p1]\n\
                      i2 = call_i(p0, p1, descr=str_equal)\n\
                      i3 = call_i(p0, \"\", descr=str_equal)\n\
                      finish(i2, i3)\n";
        assert_same_behavior(source, &["NULL", "\"\""], 1);
        assert_same_behavior(source, &["\"\"", "\"\""], 1);
        assert_same_behavior(source, &["\"x\"", "NULL"], 1);
    }

    #[test]
    fn test_single_char_equality() {
        let source = "[p0, i1]\n\
                      p2 = newstr(1)\n\
                      strsetitem(p2, 0, i1)\n\
                      i3 = call_i(p0, p2, descr=str_equal)\n\
                      finish(i3)\n";
        assert_same_behavior(source, &["\"q\"", "113"], 1);
        assert_same_behavior(source, &["\"qq\"", "113"], 1);
    }

    #[test]
    fn test_copy_into_new_string() {
        let source = "[p0]\n\
                      p1 = newstr(5)\n\
                      copystrcontent(p0, p1, 1, 0, 3)\n\
                      strsetitem(p1, 3, 46)\n\
                      strsetitem(p1, 4, 46)\n\
                      finish(p1)\n";
        assert_same_behavior(source, &["\"abcdef\""], 1);
    }

    #[test]
    fn test_unicode_concat() {
        let source = "[p0]\n\
                      p1 = call_r(p0, u\"\u{e9}t\u{e9}\", descr=uni_concat)\n\
                      guard_no_exception() []\n\
                      i2 = unicodelen(p1)\n\
                      i3 = unicodegetitem(p1, 1)\n\
                      finish(p1, i2, i3)\n";
        assert_same_behavior(source, &["u\"l\""], 1);
    }
}
