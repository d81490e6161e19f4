//! Concrete evaluation of pure operations
//!
//! Shared by constant folding in the optimizer and by the reference
//! interpreter, so both agree on every corner case (wrapping arithmetic,
//! floor division, shift ranges).

use super::{Const, OopSpec, OpCode, RefConst, StrConst, StrMode};

/// Floor division; `None` on division by zero
pub fn py_div(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let q = a.wrapping_div(b);
    if (a.wrapping_rem(b) != 0) && ((a < 0) != (b < 0)) {
        Some(q.wrapping_sub(1))
    } else {
        Some(q)
    }
}

/// Floor modulo, the result has the sign of the divisor; `None` on division by zero
pub fn py_mod(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn bool_const(value: bool) -> Const {
    Const::Int(value as i64)
}

fn eval_int_binary(opcode: OpCode, a: i64, b: i64) -> Option<i64> {
    use OpCode::*;
    Some(match opcode {
        IntAdd => a.wrapping_add(b),
        IntSub => a.wrapping_sub(b),
        IntMul => a.wrapping_mul(b),
        IntAddOvf => a.checked_add(b)?,
        IntSubOvf => a.checked_sub(b)?,
        IntMulOvf => a.checked_mul(b)?,
        IntPyDiv => py_div(a, b)?,
        IntPyMod => py_mod(a, b)?,
        IntAnd => a & b,
        IntOr => a | b,
        IntXor => a ^ b,
        IntLshift if (0..64).contains(&b) => a << b,
        IntRshift if (0..64).contains(&b) => a >> b,
        UintRshift if (0..64).contains(&b) => ((a as u64) >> b) as i64,
        IntLt => (a < b) as i64,
        IntLe => (a <= b) as i64,
        IntEq => (a == b) as i64,
        IntNe => (a != b) as i64,
        IntGt => (a > b) as i64,
        IntGe => (a >= b) as i64,
        UintLt => ((a as u64) < (b as u64)) as i64,
        UintLe => ((a as u64) <= (b as u64)) as i64,
        UintGt => ((a as u64) > (b as u64)) as i64,
        UintGe => ((a as u64) >= (b as u64)) as i64,
        _ => return None,
    })
}

fn eval_float(opcode: OpCode, args: &[Const]) -> Option<Const> {
    use OpCode::*;
    let a = args.first()?.as_float()?;
    match opcode {
        FloatNeg => return Some(Const::float(-a)),
        FloatAbs => return Some(Const::float(a.abs())),
        CastFloatToInt => {
            if a.is_nan() {
                return None;
            }
            return Some(Const::Int(a as i64));
        }
        _ => {}
    }
    let b = args.get(1)?.as_float()?;
    Some(match opcode {
        FloatAdd => Const::float(a + b),
        FloatSub => Const::float(a - b),
        FloatMul => Const::float(a * b),
        FloatTrueDiv => Const::float(a / b),
        FloatLt => bool_const(a < b),
        FloatLe => bool_const(a <= b),
        FloatEq => bool_const(a == b),
        FloatNe => bool_const(a != b),
        FloatGt => bool_const(a > b),
        FloatGe => bool_const(a >= b),
        _ => return None,
    })
}

/// Evaluate a pure operation on constant arguments.
///
/// Returns `None` when the operation is not foldable or would fault
/// (division by zero, overflow of an `_ovf` operation, out-of-range shift
/// or string index).
pub fn eval_pure(opcode: OpCode, args: &[Const]) -> Option<Const> {
    use OpCode::*;
    match opcode {
        SameAs | MarkOpaquePtr => args.first().cloned(),
        IntNeg => Some(Const::Int(args.first()?.as_int()?.wrapping_neg())),
        IntInvert => Some(Const::Int(!args.first()?.as_int()?)),
        IntIsZero => Some(bool_const(args.first()?.as_int()? == 0)),
        IntIsTrue => Some(bool_const(args.first()?.as_int()? != 0)),
        IntForceGeZero => Some(Const::Int(args.first()?.as_int()?.max(0))),
        CastIntToFloat => Some(Const::float(args.first()?.as_int()? as f64)),
        FloatAdd | FloatSub | FloatMul | FloatTrueDiv | FloatNeg | FloatAbs | FloatLt
        | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe | CastFloatToInt => {
            eval_float(opcode, args)
        }
        PtrEq | InstancePtrEq => Some(bool_const(args.first()? == args.get(1)?)),
        PtrNe | InstancePtrNe => Some(bool_const(args.first()? != args.get(1)?)),
        Strlen | Unicodelen => {
            let s = args.first()?.as_str()?;
            Some(Const::Int(s.len() as i64))
        }
        Strgetitem | Unicodegetitem => {
            let s = args.first()?.as_str()?;
            let index = args.get(1)?.as_int()?;
            let c = s.chars.get(usize::try_from(index).ok()?)?;
            Some(Const::Int(*c as i64))
        }
        CastPtrToInt => match args.first()? {
            Const::Ref(RefConst::Null) => Some(Const::Int(0)),
            _ => None,
        },
        CastIntToPtr => match args.first()?.as_int()? {
            0 => Some(Const::null()),
            _ => None,
        },
        _ => {
            let a = args.first()?.as_int()?;
            let b = args.get(1)?.as_int()?;
            eval_int_binary(opcode, a, b).map(Const::Int)
        }
    }
}

/// Three-way comparison of two strings: the difference of the first
/// differing characters, else the difference of the lengths
pub fn str_cmp(a: &[u32], b: &[u32]) -> i64 {
    for (x, y) in a.iter().zip(b) {
        let diff = *x as i64 - *y as i64;
        if diff != 0 {
            return diff;
        }
    }
    a.len() as i64 - b.len() as i64
}

/// Characters of a string constant; `Some(None)` for the null reference
fn str_arg(c: &Const) -> Option<Option<&StrConst>> {
    match c {
        Const::Ref(RefConst::Null) => Some(None),
        Const::Ref(RefConst::Str(s)) => Some(Some(s)),
        _ => None,
    }
}

fn nonnull_str(c: &Const) -> Option<&StrConst> {
    str_arg(c)?
}

fn char_range(s: &StrConst, start: i64, length: i64) -> Option<&[u32]> {
    let start = usize::try_from(start).ok()?;
    let end = start.checked_add(usize::try_from(length).ok()?)?;
    s.chars.get(start..end)
}

/// Evaluate a string helper call on constant arguments.
///
/// Returns `None` for helpers that are not string functions and for
/// arguments the helper would reject (null where a string is required,
/// out-of-range slices).
pub fn eval_str_helper(spec: OopSpec, args: &[Const]) -> Option<Const> {
    use OopSpec::*;
    let string = |mode, chars: Vec<u32>| Const::Ref(RefConst::Str(StrConst::from_chars(mode, chars)));
    Some(match spec {
        StrConcat(mode) => {
            let (a, b) = (nonnull_str(args.first()?)?, nonnull_str(args.get(1)?)?);
            string(mode, a.chars.iter().chain(b.chars.iter()).copied().collect())
        }
        StrSlice(mode) => {
            let s = nonnull_str(args.first()?)?;
            let (start, stop) = (args.get(1)?.as_int()?, args.get(2)?.as_int()?);
            string(mode, char_range(s, start, stop.checked_sub(start)?)?.to_vec())
        }
        ShrinkArray(mode) => {
            let s = nonnull_str(args.first()?)?;
            string(mode, char_range(s, 0, args.get(1)?.as_int()?)?.to_vec())
        }
        Str2Unicode => string(StrMode::Unicode, nonnull_str(args.first()?)?.chars.to_vec()),
        StrEqual(_) => match (str_arg(args.first()?)?, str_arg(args.get(1)?)?) {
            (Option::None, Option::None) => bool_const(true),
            (Some(a), Some(b)) => bool_const(a.chars == b.chars),
            _ => bool_const(false),
        },
        StrEqualNonnull(_) | StrEqualLengthok(_) => {
            let (a, b) = (nonnull_str(args.first()?)?, nonnull_str(args.get(1)?)?);
            bool_const(a.chars == b.chars)
        }
        StrEqualSliceChecknull(_) | StrEqualSliceNonnull(_) => {
            let s = nonnull_str(args.first()?)?;
            let part = char_range(s, args.get(1)?.as_int()?, args.get(2)?.as_int()?)?;
            match str_arg(args.get(3)?)? {
                Some(other) => bool_const(part == &other.chars[..]),
                Option::None => bool_const(false),
            }
        }
        StrEqualSliceChar(_) => {
            let s = nonnull_str(args.first()?)?;
            let part = char_range(s, args.get(1)?.as_int()?, args.get(2)?.as_int()?)?;
            let c = args.get(3)?.as_int()?;
            bool_const(part.len() == 1 && part[0] as i64 == c)
        }
        StrEqualChecknullChar(_) | StrEqualNonnullChar(_) => {
            let c = args.get(1)?.as_int()?;
            match str_arg(args.first()?)? {
                Some(s) => bool_const(s.len() == 1 && s.chars[0] as i64 == c),
                Option::None => bool_const(false),
            }
        }
        StrCmp(_) => {
            let (a, b) = (nonnull_str(args.first()?)?, nonnull_str(args.get(1)?)?);
            Const::Int(str_cmp(&a.chars, &b.chars))
        }
        _ => return Option::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_division() {
        assert_eq!(py_div(7, 2), Some(3));
        assert_eq!(py_div(-7, 2), Some(-4));
        assert_eq!(py_div(7, -2), Some(-4));
        assert_eq!(py_div(-7, -2), Some(3));
        assert_eq!(py_div(1, 0), None);
        assert_eq!(py_mod(-7, 2), Some(1));
        assert_eq!(py_mod(7, -2), Some(-1));
        assert_eq!(py_mod(-8, 4), Some(0));
        assert_eq!(py_div(i64::MIN, -1), Some(i64::MIN));
    }

    #[test]
    fn test_eval_int() {
        let c = |v| Const::Int(v);
        assert_eq!(eval_pure(OpCode::IntAdd, &[c(2), c(3)]), Some(c(5)));
        assert_eq!(eval_pure(OpCode::IntAdd, &[c(i64::MAX), c(1)]), Some(c(i64::MIN)));
        assert_eq!(eval_pure(OpCode::IntAddOvf, &[c(i64::MAX), c(1)]), None);
        assert_eq!(eval_pure(OpCode::IntLt, &[c(2), c(3)]), Some(c(1)));
        assert_eq!(eval_pure(OpCode::UintLt, &[c(-1), c(3)]), Some(c(0)));
        assert_eq!(eval_pure(OpCode::IntLshift, &[c(1), c(64)]), None);
        assert_eq!(eval_pure(OpCode::UintRshift, &[c(-1), c(60)]), Some(c(15)));
    }

    #[test]
    fn test_eval_strings_and_floats() {
        let s = Const::str("abc");
        assert_eq!(eval_pure(OpCode::Strlen, &[s.clone()]), Some(Const::Int(3)));
        assert_eq!(
            eval_pure(OpCode::Strgetitem, &[s.clone(), Const::Int(1)]),
            Some(Const::Int('b' as i64))
        );
        assert_eq!(eval_pure(OpCode::Strgetitem, &[s, Const::Int(3)]), None);
        assert_eq!(
            eval_pure(OpCode::FloatMul, &[Const::float(1.5), Const::float(2.0)]),
            Some(Const::float(3.0))
        );
        let nan = Const::float(f64::NAN);
        assert_eq!(eval_pure(OpCode::FloatEq, &[nan.clone(), nan]), Some(Const::Int(0)));
    }

    #[test]
    fn test_string_helpers() {
        let (a, b) = (Const::str("ab"), Const::str("abc"));
        assert_eq!(
            eval_str_helper(OopSpec::StrConcat(StrMode::Str), &[a.clone(), Const::str("cd")]),
            Some(Const::str("abcd"))
        );
        assert_eq!(
            eval_str_helper(OopSpec::StrSlice(StrMode::Str), &[b.clone(), Const::Int(1), Const::Int(3)]),
            Some(Const::str("bc"))
        );
        assert_eq!(
            eval_str_helper(OopSpec::StrSlice(StrMode::Str), &[b.clone(), Const::Int(2), Const::Int(5)]),
            None
        );
        assert_eq!(
            eval_str_helper(OopSpec::StrEqual(StrMode::Str), &[Const::null(), Const::null()]),
            Some(Const::Int(1))
        );
        assert_eq!(
            eval_str_helper(OopSpec::StrEqual(StrMode::Str), &[a.clone(), Const::null()]),
            Some(Const::Int(0))
        );
        assert_eq!(
            eval_str_helper(OopSpec::StrCmp(StrMode::Str), &[a.clone(), b.clone()]),
            Some(Const::Int(-1))
        );
        assert_eq!(str_cmp(&[98], &[97, 99]), 1);
        assert_eq!(
            eval_str_helper(OopSpec::Str2Unicode, &[a]),
            Some(Const::unicode("ab"))
        );
        assert_eq!(eval_str_helper(OopSpec::DictLookup, &[b]), None);
    }
}
