//! Trace operation codes
//!
//! This module defines the abstract instruction set the optimizer reasons
//! about. Opcodes are untyped: the result type of an operation is carried by
//! the operation itself (see [`super::Op::ty`]).

use std::fmt;

/// Trace opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpCode {
    // ========== Control ==========
    /// Trace input value (never emitted)
    InputArg,
    /// Loop header carrying the loop-carried values
    Label,
    /// Back edge to a label
    Jump,
    /// Leave the trace with the given values
    Finish,

    // ========== Guards ==========
    GuardTrue,
    GuardFalse,
    /// Guard that the first argument equals the constant second argument
    GuardValue,
    /// Guard that a non-null object has the given class
    GuardClass,
    GuardNonnull,
    GuardIsnull,
    /// Combined non-null and class check
    GuardNonnullClass,
    GuardNoException,
    GuardException,
    GuardNoOverflow,
    GuardOverflow,
    /// Guard that no quasi-immutable field has been mutated
    GuardNotInvalidated,
    /// Guard after a call that may force virtuals
    GuardNotForced,
    /// Like `GuardNotForced`, but placed before a `finish`
    GuardNotForced2,

    // ========== Integer Arithmetic ==========
    IntAdd,
    IntSub,
    IntMul,
    /// Floor division (rounds toward negative infinity)
    IntPyDiv,
    /// Floor modulo (result has the sign of the divisor)
    IntPyMod,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    UintRshift,
    IntNeg,
    IntInvert,
    IntForceGeZero,
    IntAddOvf,
    IntSubOvf,
    IntMulOvf,

    // ========== Integer Comparisons ==========
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    UintLt,
    UintLe,
    UintGt,
    UintGe,
    IntIsZero,
    IntIsTrue,

    // ========== Floats ==========
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatTrueDiv,
    FloatNeg,
    FloatAbs,
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,
    CastFloatToInt,
    CastIntToFloat,

    // ========== Pointers ==========
    PtrEq,
    PtrNe,
    InstancePtrEq,
    InstancePtrNe,
    CastPtrToInt,
    CastIntToPtr,
    SameAs,
    /// Marks a pointer whose contents must not be reasoned about
    MarkOpaquePtr,
    /// Records the exact class of an object without emitting a check
    RecordExactClass,

    // ========== Heap Access ==========
    GetfieldGc,
    SetfieldGc,
    GetarrayitemGc,
    SetarrayitemGc,
    GetarrayitemRaw,
    SetarrayitemRaw,
    GetinteriorfieldGc,
    SetinteriorfieldGc,
    RawLoad,
    RawStore,
    ArraylenGc,
    /// Marks a read of a quasi-immutable field
    QuasiimmutField,

    // ========== Strings ==========
    Newstr,
    Strlen,
    Strgetitem,
    Strsetitem,
    Copystrcontent,
    Newunicode,
    Unicodelen,
    Unicodegetitem,
    Unicodesetitem,
    Copyunicodecontent,

    // ========== Allocation ==========
    New,
    NewWithVtable,
    NewArray,
    NewArrayClear,

    // ========== Calls ==========
    Call,
    CallPure,
    CallMayForce,
    CallLoopinvariant,
    CallReleaseGil,
    /// Call the descriptor's function only if the first argument is nonzero
    CondCall,

    // ========== Virtual References ==========
    VirtualRef,
    VirtualRefFinish,
    ForceToken,

    // ========== Misc ==========
    /// Opaque use of its arguments (forces virtuals, observable)
    Escape,
    DebugMergePoint,
}

impl OpCode {
    /// Every opcode, in declaration order
    pub const ALL: &'static [OpCode] = &[
        OpCode::InputArg,
        OpCode::Label,
        OpCode::Jump,
        OpCode::Finish,
        OpCode::GuardTrue,
        OpCode::GuardFalse,
        OpCode::GuardValue,
        OpCode::GuardClass,
        OpCode::GuardNonnull,
        OpCode::GuardIsnull,
        OpCode::GuardNonnullClass,
        OpCode::GuardNoException,
        OpCode::GuardException,
        OpCode::GuardNoOverflow,
        OpCode::GuardOverflow,
        OpCode::GuardNotInvalidated,
        OpCode::GuardNotForced,
        OpCode::GuardNotForced2,
        OpCode::IntAdd,
        OpCode::IntSub,
        OpCode::IntMul,
        OpCode::IntPyDiv,
        OpCode::IntPyMod,
        OpCode::IntAnd,
        OpCode::IntOr,
        OpCode::IntXor,
        OpCode::IntLshift,
        OpCode::IntRshift,
        OpCode::UintRshift,
        OpCode::IntNeg,
        OpCode::IntInvert,
        OpCode::IntForceGeZero,
        OpCode::IntAddOvf,
        OpCode::IntSubOvf,
        OpCode::IntMulOvf,
        OpCode::IntLt,
        OpCode::IntLe,
        OpCode::IntEq,
        OpCode::IntNe,
        OpCode::IntGt,
        OpCode::IntGe,
        OpCode::UintLt,
        OpCode::UintLe,
        OpCode::UintGt,
        OpCode::UintGe,
        OpCode::IntIsZero,
        OpCode::IntIsTrue,
        OpCode::FloatAdd,
        OpCode::FloatSub,
        OpCode::FloatMul,
        OpCode::FloatTrueDiv,
        OpCode::FloatNeg,
        OpCode::FloatAbs,
        OpCode::FloatLt,
        OpCode::FloatLe,
        OpCode::FloatEq,
        OpCode::FloatNe,
        OpCode::FloatGt,
        OpCode::FloatGe,
        OpCode::CastFloatToInt,
        OpCode::CastIntToFloat,
        OpCode::PtrEq,
        OpCode::PtrNe,
        OpCode::InstancePtrEq,
        OpCode::InstancePtrNe,
        OpCode::CastPtrToInt,
        OpCode::CastIntToPtr,
        OpCode::SameAs,
        OpCode::MarkOpaquePtr,
        OpCode::RecordExactClass,
        OpCode::GetfieldGc,
        OpCode::SetfieldGc,
        OpCode::GetarrayitemGc,
        OpCode::SetarrayitemGc,
        OpCode::GetarrayitemRaw,
        OpCode::SetarrayitemRaw,
        OpCode::GetinteriorfieldGc,
        OpCode::SetinteriorfieldGc,
        OpCode::RawLoad,
        OpCode::RawStore,
        OpCode::ArraylenGc,
        OpCode::QuasiimmutField,
        OpCode::Newstr,
        OpCode::Strlen,
        OpCode::Strgetitem,
        OpCode::Strsetitem,
        OpCode::Copystrcontent,
        OpCode::Newunicode,
        OpCode::Unicodelen,
        OpCode::Unicodegetitem,
        OpCode::Unicodesetitem,
        OpCode::Copyunicodecontent,
        OpCode::New,
        OpCode::NewWithVtable,
        OpCode::NewArray,
        OpCode::NewArrayClear,
        OpCode::Call,
        OpCode::CallPure,
        OpCode::CallMayForce,
        OpCode::CallLoopinvariant,
        OpCode::CallReleaseGil,
        OpCode::CondCall,
        OpCode::VirtualRef,
        OpCode::VirtualRefFinish,
        OpCode::ForceToken,
        OpCode::Escape,
        OpCode::DebugMergePoint,
    ];

    /// Name used in the trace text format
    pub fn name(self) -> &'static str {
        match self {
            OpCode::InputArg => "inputarg",
            OpCode::Label => "label",
            OpCode::Jump => "jump",
            OpCode::Finish => "finish",
            OpCode::GuardTrue => "guard_true",
            OpCode::GuardFalse => "guard_false",
            OpCode::GuardValue => "guard_value",
            OpCode::GuardClass => "guard_class",
            OpCode::GuardNonnull => "guard_nonnull",
            OpCode::GuardIsnull => "guard_isnull",
            OpCode::GuardNonnullClass => "guard_nonnull_class",
            OpCode::GuardNoException => "guard_no_exception",
            OpCode::GuardException => "guard_exception",
            OpCode::GuardNoOverflow => "guard_no_overflow",
            OpCode::GuardOverflow => "guard_overflow",
            OpCode::GuardNotInvalidated => "guard_not_invalidated",
            OpCode::GuardNotForced => "guard_not_forced",
            OpCode::GuardNotForced2 => "guard_not_forced_2",
            OpCode::IntAdd => "int_add",
            OpCode::IntSub => "int_sub",
            OpCode::IntMul => "int_mul",
            OpCode::IntPyDiv => "int_py_div",
            OpCode::IntPyMod => "int_py_mod",
            OpCode::IntAnd => "int_and",
            OpCode::IntOr => "int_or",
            OpCode::IntXor => "int_xor",
            OpCode::IntLshift => "int_lshift",
            OpCode::IntRshift => "int_rshift",
            OpCode::UintRshift => "uint_rshift",
            OpCode::IntNeg => "int_neg",
            OpCode::IntInvert => "int_invert",
            OpCode::IntForceGeZero => "int_force_ge_zero",
            OpCode::IntAddOvf => "int_add_ovf",
            OpCode::IntSubOvf => "int_sub_ovf",
            OpCode::IntMulOvf => "int_mul_ovf",
            OpCode::IntLt => "int_lt",
            OpCode::IntLe => "int_le",
            OpCode::IntEq => "int_eq",
            OpCode::IntNe => "int_ne",
            OpCode::IntGt => "int_gt",
            OpCode::IntGe => "int_ge",
            OpCode::UintLt => "uint_lt",
            OpCode::UintLe => "uint_le",
            OpCode::UintGt => "uint_gt",
            OpCode::UintGe => "uint_ge",
            OpCode::IntIsZero => "int_is_zero",
            OpCode::IntIsTrue => "int_is_true",
            OpCode::FloatAdd => "float_add",
            OpCode::FloatSub => "float_sub",
            OpCode::FloatMul => "float_mul",
            OpCode::FloatTrueDiv => "float_truediv",
            OpCode::FloatNeg => "float_neg",
            OpCode::FloatAbs => "float_abs",
            OpCode::FloatLt => "float_lt",
            OpCode::FloatLe => "float_le",
            OpCode::FloatEq => "float_eq",
            OpCode::FloatNe => "float_ne",
            OpCode::FloatGt => "float_gt",
            OpCode::FloatGe => "float_ge",
            OpCode::CastFloatToInt => "cast_float_to_int",
            OpCode::CastIntToFloat => "cast_int_to_float",
            OpCode::PtrEq => "ptr_eq",
            OpCode::PtrNe => "ptr_ne",
            OpCode::InstancePtrEq => "instance_ptr_eq",
            OpCode::InstancePtrNe => "instance_ptr_ne",
            OpCode::CastPtrToInt => "cast_ptr_to_int",
            OpCode::CastIntToPtr => "cast_int_to_ptr",
            OpCode::SameAs => "same_as",
            OpCode::MarkOpaquePtr => "mark_opaque_ptr",
            OpCode::RecordExactClass => "record_exact_class",
            OpCode::GetfieldGc => "getfield_gc",
            OpCode::SetfieldGc => "setfield_gc",
            OpCode::GetarrayitemGc => "getarrayitem_gc",
            OpCode::SetarrayitemGc => "setarrayitem_gc",
            OpCode::GetarrayitemRaw => "getarrayitem_raw",
            OpCode::SetarrayitemRaw => "setarrayitem_raw",
            OpCode::GetinteriorfieldGc => "getinteriorfield_gc",
            OpCode::SetinteriorfieldGc => "setinteriorfield_gc",
            OpCode::RawLoad => "raw_load",
            OpCode::RawStore => "raw_store",
            OpCode::ArraylenGc => "arraylen_gc",
            OpCode::QuasiimmutField => "quasiimmut_field",
            OpCode::Newstr => "newstr",
            OpCode::Strlen => "strlen",
            OpCode::Strgetitem => "strgetitem",
            OpCode::Strsetitem => "strsetitem",
            OpCode::Copystrcontent => "copystrcontent",
            OpCode::Newunicode => "newunicode",
            OpCode::Unicodelen => "unicodelen",
            OpCode::Unicodegetitem => "unicodegetitem",
            OpCode::Unicodesetitem => "unicodesetitem",
            OpCode::Copyunicodecontent => "copyunicodecontent",
            OpCode::New => "new",
            OpCode::NewWithVtable => "new_with_vtable",
            OpCode::NewArray => "new_array",
            OpCode::NewArrayClear => "new_array_clear",
            OpCode::Call => "call",
            OpCode::CallPure => "call_pure",
            OpCode::CallMayForce => "call_may_force",
            OpCode::CallLoopinvariant => "call_loopinvariant",
            OpCode::CallReleaseGil => "call_release_gil",
            OpCode::CondCall => "cond_call",
            OpCode::VirtualRef => "virtual_ref",
            OpCode::VirtualRefFinish => "virtual_ref_finish",
            OpCode::ForceToken => "force_token",
            OpCode::Escape => "escape",
            OpCode::DebugMergePoint => "debug_merge_point",
        }
    }

    /// Look up an opcode by name. Typed suffixes (`_i`, `_r`, `_f`, `_n`)
    /// are accepted and ignored, so `getfield_gc_i` reads as `getfield_gc`.
    pub fn from_name(name: &str) -> Option<OpCode> {
        if let Some(op) = Self::ALL.iter().copied().find(|op| op.name() == name) {
            return Some(op);
        }
        for suffix in ["_i", "_r", "_f", "_n"] {
            if let Some(base) = name.strip_suffix(suffix) {
                if let Some(op) = Self::ALL.iter().copied().find(|op| op.name() == base) {
                    return Some(op);
                }
            }
        }
        None
    }

    /// Number of arguments, when fixed
    pub fn arity(self) -> Option<usize> {
        use OpCode::*;
        match self {
            Label | Jump | Finish | Call | CallPure | CallMayForce | CallLoopinvariant
            | CallReleaseGil | CondCall | Escape | DebugMergePoint => None,
            GuardNoException | GuardNoOverflow | GuardOverflow | GuardNotInvalidated
            | GuardNotForced | GuardNotForced2 | New | NewWithVtable | ForceToken | InputArg => {
                Some(0)
            }
            GuardTrue | GuardFalse | GuardNonnull | GuardIsnull | GuardException => Some(1),
            GuardValue | GuardClass | GuardNonnullClass => Some(2),
            IntNeg | IntInvert | IntForceGeZero | IntIsZero | IntIsTrue | FloatNeg | FloatAbs
            | CastFloatToInt | CastIntToFloat | CastPtrToInt | CastIntToPtr | SameAs
            | MarkOpaquePtr | GetfieldGc | ArraylenGc | QuasiimmutField | Newstr | Strlen
            | Newunicode | Unicodelen | NewArray | NewArrayClear => Some(1),
            RecordExactClass | SetfieldGc | GetarrayitemGc | GetarrayitemRaw | Strgetitem
            | Unicodegetitem | GetinteriorfieldGc | RawLoad | VirtualRef | VirtualRefFinish => {
                Some(2)
            }
            SetarrayitemGc | SetarrayitemRaw | SetinteriorfieldGc | RawStore | Strsetitem
            | Unicodesetitem => Some(3),
            Copystrcontent | Copyunicodecontent => Some(5),
            _ => Some(2),
        }
    }

    /// Whether this is a guard
    pub fn is_guard(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            GuardTrue
                | GuardFalse
                | GuardValue
                | GuardClass
                | GuardNonnull
                | GuardIsnull
                | GuardNonnullClass
                | GuardNoException
                | GuardException
                | GuardNoOverflow
                | GuardOverflow
                | GuardNotInvalidated
                | GuardNotForced
                | GuardNotForced2
        )
    }

    /// Guards that must immediately follow the operation they check
    pub fn is_guard_overflow(self) -> bool {
        matches!(self, OpCode::GuardNoOverflow | OpCode::GuardOverflow)
    }

    /// Operations that end the trace
    pub fn is_final(self) -> bool {
        matches!(self, OpCode::Jump | OpCode::Finish)
    }

    /// Overflow-checking arithmetic
    pub fn is_ovf(self) -> bool {
        matches!(self, OpCode::IntAddOvf | OpCode::IntSubOvf | OpCode::IntMulOvf)
    }

    /// The non-checking variant of an overflow-checking operation
    pub fn without_ovf(self) -> OpCode {
        match self {
            OpCode::IntAddOvf => OpCode::IntAdd,
            OpCode::IntSubOvf => OpCode::IntSub,
            OpCode::IntMulOvf => OpCode::IntMul,
            other => other,
        }
    }

    /// Side-effect free and deterministic given its arguments
    pub fn is_always_pure(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            IntAdd
                | IntSub
                | IntMul
                | IntPyDiv
                | IntPyMod
                | IntAnd
                | IntOr
                | IntXor
                | IntLshift
                | IntRshift
                | UintRshift
                | IntNeg
                | IntInvert
                | IntForceGeZero
                | FloatAdd
                | FloatSub
                | FloatMul
                | FloatTrueDiv
                | FloatNeg
                | FloatAbs
                | CastFloatToInt
                | CastIntToFloat
                | CastPtrToInt
                | CastIntToPtr
                | PtrEq
                | PtrNe
                | InstancePtrEq
                | InstancePtrNe
                | Strlen
                | Strgetitem
                | Unicodelen
                | Unicodegetitem
                | ArraylenGc
                | CallPure
        ) || self.is_comparison()
    }

    /// Operations that never write memory
    pub fn has_no_side_effect(self) -> bool {
        use OpCode::*;
        self.is_always_pure()
            || matches!(
                self,
                GetfieldGc
                    | GetarrayitemGc
                    | GetarrayitemRaw
                    | GetinteriorfieldGc
                    | RawLoad
                    | New
                    | NewWithVtable
                    | NewArray
                    | NewArrayClear
                    | Newstr
                    | Newunicode
                    | ForceToken
                    | SameAs
                    | MarkOpaquePtr
                    | RecordExactClass
                    | VirtualRef
            )
    }

    /// Comparisons producing a boolean
    pub fn is_comparison(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            IntLt
                | IntLe
                | IntEq
                | IntNe
                | IntGt
                | IntGe
                | UintLt
                | UintLe
                | UintGt
                | UintGe
                | IntIsZero
                | IntIsTrue
                | FloatLt
                | FloatLe
                | FloatEq
                | FloatNe
                | FloatGt
                | FloatGe
                | PtrEq
                | PtrNe
                | InstancePtrEq
                | InstancePtrNe
        )
    }

    /// All call variants
    pub fn is_call(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Call | CallPure | CallMayForce | CallLoopinvariant | CallReleaseGil | CondCall
        )
    }

    /// Allocation of a GC object
    pub fn is_malloc(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            New | NewWithVtable | NewArray | NewArrayClear | Newstr | Newunicode
        )
    }

    /// Whether the operation is the string (not unicode) flavor
    pub fn is_str_mode(self) -> Option<bool> {
        use OpCode::*;
        match self {
            Newstr | Strlen | Strgetitem | Strsetitem | Copystrcontent => Some(true),
            Newunicode | Unicodelen | Unicodegetitem | Unicodesetitem | Copyunicodecontent => {
                Some(false)
            }
            _ => None,
        }
    }

    /// `a op b` is equivalent to `not (a inverse b)`
    pub fn bool_inverse(self) -> Option<OpCode> {
        use OpCode::*;
        Some(match self {
            IntEq => IntNe,
            IntNe => IntEq,
            IntLt => IntGe,
            IntGe => IntLt,
            IntGt => IntLe,
            IntLe => IntGt,
            UintLt => UintGe,
            UintGe => UintLt,
            UintGt => UintLe,
            UintLe => UintGt,
            FloatEq => FloatNe,
            FloatNe => FloatEq,
            PtrEq => PtrNe,
            PtrNe => PtrEq,
            InstancePtrEq => InstancePtrNe,
            InstancePtrNe => InstancePtrEq,
            _ => return None,
        })
    }

    /// `a op b` is equivalent to `b reflex a`
    pub fn bool_reflex(self) -> Option<OpCode> {
        use OpCode::*;
        Some(match self {
            IntEq => IntEq,
            IntNe => IntNe,
            IntLt => IntGt,
            IntGe => IntLe,
            IntGt => IntLt,
            IntLe => IntGe,
            UintLt => UintGt,
            UintGe => UintLe,
            UintGt => UintLt,
            UintLe => UintGe,
            FloatEq => FloatEq,
            FloatNe => FloatNe,
            FloatLt => FloatGt,
            FloatGe => FloatLe,
            FloatGt => FloatLt,
            FloatLe => FloatGe,
            PtrEq => PtrEq,
            PtrNe => PtrNe,
            InstancePtrEq => InstancePtrEq,
            InstancePtrNe => InstancePtrNe,
            _ => return None,
        })
    }

    /// Commutative binary operations
    pub fn is_commutative(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            IntAdd | IntMul | IntAnd | IntOr | IntXor | FloatAdd | FloatMul | IntEq | IntNe
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for &op in OpCode::ALL {
            assert_eq!(OpCode::from_name(op.name()), Some(op), "{}", op.name());
        }
    }

    #[test]
    fn test_typed_suffix() {
        assert_eq!(OpCode::from_name("getfield_gc_i"), Some(OpCode::GetfieldGc));
        assert_eq!(OpCode::from_name("call_n"), Some(OpCode::Call));
        assert_eq!(OpCode::from_name("same_as_r"), Some(OpCode::SameAs));
        assert_eq!(OpCode::from_name("no_such_op"), None);
    }

    #[test]
    fn test_bool_tables() {
        for &op in OpCode::ALL {
            if let Some(inv) = op.bool_inverse() {
                assert_eq!(inv.bool_inverse(), Some(op));
            }
            if let Some(refl) = op.bool_reflex() {
                assert_eq!(refl.bool_reflex(), Some(op));
            }
        }
        // NaN makes float ordering inverses unsound
        assert_eq!(OpCode::FloatLt.bool_inverse(), None);
    }

    #[test]
    fn test_classification() {
        assert!(OpCode::GuardNonnullClass.is_guard());
        assert!(!OpCode::IntAdd.is_guard());
        assert!(OpCode::IntLt.is_always_pure());
        assert!(!OpCode::IntAddOvf.is_always_pure());
        assert!(OpCode::GetfieldGc.has_no_side_effect());
        assert!(!OpCode::SetfieldGc.has_no_side_effect());
        assert_eq!(OpCode::IntMulOvf.without_ovf(), OpCode::IntMul);
        assert_eq!(OpCode::Copystrcontent.arity(), Some(5));
        assert_eq!(OpCode::Unicodelen.is_str_mode(), Some(false));
    }
}
