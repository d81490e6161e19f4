//! Trace intermediate representation
//!
//! A [`Trace`] is an arena of [`Op`]s plus the order in which they execute.
//! Operands refer to earlier results by [`OpRef`] (an arena index) or carry a
//! [`Const`] inline. Operations form a DAG through their arguments.

pub mod descr;
pub mod eval;
pub mod opcode;
pub mod parser;

pub use descr::{
    ArrayDescr, CallDescr, Descr, DescrRef, DescrTable, EffectFlags, EffectInfo, FieldDescr,
    InteriorFieldDescr, OopSpec, SizeDescr, StrMode, VrefDescrs,
};
pub use opcode::OpCode;

use crate::resume::ResumeDescr;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;
use std::rc::Rc;

/// Result type of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Ref,
    Float,
    Void,
}

impl Type {
    /// Prefix used for value names in the text format
    pub fn prefix(self) -> &'static str {
        match self {
            Type::Int => "i",
            Type::Ref => "p",
            Type::Float => "f",
            Type::Void => "v",
        }
    }

    /// The zero constant of this type (what fresh memory holds)
    pub fn default_const(self) -> Const {
        match self {
            Type::Int | Type::Void => Const::Int(0),
            Type::Ref => Const::Ref(RefConst::Null),
            Type::Float => Const::float(0.0),
        }
    }
}

/// Index of an operation in a trace arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpRef(pub u32);

impl OpRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A constant string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrConst {
    pub mode: StrMode,
    pub chars: Rc<[u32]>,
}

impl StrConst {
    pub fn new(mode: StrMode, text: &str) -> Self {
        StrConst {
            mode,
            chars: text.chars().map(|c| c as u32).collect(),
        }
    }

    pub fn from_chars(mode: StrMode, chars: Vec<u32>) -> Self {
        StrConst {
            mode,
            chars: chars.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn to_text(&self) -> String {
        self.chars
            .iter()
            .map(|&c| char::from_u32(c).unwrap_or('\u{fffd}'))
            .collect()
    }
}

/// A constant reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefConst {
    Null,
    Str(StrConst),
    /// A prebuilt object declared in the descriptor table
    Obj { id: u32, class: Option<i64> },
}

/// A compile-time constant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Const {
    Int(i64),
    /// Bit pattern of an f64, so constants can be hashed
    Float(u64),
    Ref(RefConst),
}

impl Const {
    pub fn float(value: f64) -> Self {
        Const::Float(value.to_bits())
    }

    pub fn str(text: &str) -> Self {
        Const::Ref(RefConst::Str(StrConst::new(StrMode::Str, text)))
    }

    pub fn unicode(text: &str) -> Self {
        Const::Ref(RefConst::Str(StrConst::new(StrMode::Unicode, text)))
    }

    pub fn null() -> Self {
        Const::Ref(RefConst::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Const::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Const::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<&RefConst> {
        match self {
            Const::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&StrConst> {
        match self {
            Const::Ref(RefConst::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            Const::Int(_) => Type::Int,
            Const::Float(_) => Type::Float,
            Const::Ref(_) => Type::Ref,
        }
    }

    /// Zero, null or 0.0
    pub fn is_null(&self) -> bool {
        match self {
            Const::Int(v) => *v == 0,
            Const::Float(bits) => f64::from_bits(*bits) == 0.0,
            Const::Ref(r) => matches!(r, RefConst::Null),
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(v) => write!(f, "{}", v),
            Const::Float(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
            Const::Ref(RefConst::Null) => write!(f, "NULL"),
            Const::Ref(RefConst::Str(s)) => {
                if s.mode == StrMode::Unicode {
                    write!(f, "u")?;
                }
                write!(f, "{:?}", s.to_text())
            }
            Const::Ref(RefConst::Obj { id, .. }) => write!(f, "ConstPtr(#{})", id),
        }
    }
}

/// An argument: a previous result or a constant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Op(OpRef),
    Const(Const),
}

impl Operand {
    pub fn int(value: i64) -> Self {
        Operand::Const(Const::Int(value))
    }

    pub fn null() -> Self {
        Operand::Const(Const::null())
    }

    pub fn as_op(&self) -> Option<OpRef> {
        match self {
            Operand::Op(r) => Some(*r),
            Operand::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<&Const> {
        match self {
            Operand::Const(c) => Some(c),
            Operand::Op(_) => None,
        }
    }

    pub fn const_int(&self) -> Option<i64> {
        self.as_const().and_then(Const::as_int)
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }
}

impl From<OpRef> for Operand {
    fn from(r: OpRef) -> Self {
        Operand::Op(r)
    }
}

impl From<Const> for Operand {
    fn from(c: Const) -> Self {
        Operand::Const(c)
    }
}

/// One operation
#[derive(Debug, Clone)]
pub struct Op {
    pub opcode: OpCode,
    pub ty: Type,
    pub args: Vec<Operand>,
    pub descr: Option<DescrRef>,
    /// Values live if this guard fails, as recorded
    pub fail_args: Option<Vec<Operand>>,
    /// Recovery data of an optimized guard
    pub resume: Option<Rc<ResumeDescr>>,
}

impl Op {
    pub fn new(opcode: OpCode, ty: Type, args: Vec<Operand>) -> Self {
        Op {
            opcode,
            ty,
            args,
            descr: None,
            fail_args: None,
            resume: None,
        }
    }

    /// Operation without a result
    pub fn void(opcode: OpCode, args: Vec<Operand>) -> Self {
        Op::new(opcode, Type::Void, args)
    }

    pub fn with_descr(mut self, descr: DescrRef) -> Self {
        self.descr = Some(descr);
        self
    }

    pub fn with_fail_args(mut self, fail_args: Vec<Operand>) -> Self {
        self.fail_args = Some(fail_args);
        self
    }

    pub fn arg(&self, i: usize) -> &Operand {
        &self.args[i]
    }

    pub fn is_guard(&self) -> bool {
        self.opcode.is_guard()
    }

    pub fn has_result(&self) -> bool {
        self.ty != Type::Void
    }
}

/// Key for results of elidable calls observed while recording
pub type CallPureKey = (DescrRef, Vec<Const>);

/// A recorded or optimized trace
#[derive(Debug, Clone)]
pub struct Trace {
    pub descrs: Rc<DescrTable>,
    /// All operations, indexed by [`OpRef`]
    pub arena: Vec<Op>,
    pub inputargs: Vec<OpRef>,
    /// Execution order
    pub ops: Vec<OpRef>,
    /// Results of elidable calls with constant arguments
    pub call_pure_results: HashMap<CallPureKey, Const>,
    /// Quasi-immutable fields of constant objects this trace relies on
    pub quasi_immutable_deps: Vec<(Const, DescrRef)>,
}

impl Trace {
    pub fn new(descrs: Rc<DescrTable>) -> Self {
        Trace {
            descrs,
            arena: Vec::new(),
            inputargs: Vec::new(),
            ops: Vec::new(),
            call_pure_results: HashMap::default(),
            quasi_immutable_deps: Vec::new(),
        }
    }

    /// Append an input argument
    pub fn add_inputarg(&mut self, ty: Type) -> OpRef {
        let r = self.alloc(Op::new(OpCode::InputArg, ty, Vec::new()));
        self.inputargs.push(r);
        r
    }

    /// Store an operation in the arena without scheduling it
    pub fn alloc(&mut self, op: Op) -> OpRef {
        let r = OpRef(self.arena.len() as u32);
        self.arena.push(op);
        r
    }

    /// Append an operation to the trace
    pub fn push(&mut self, op: Op) -> OpRef {
        let r = self.alloc(op);
        self.ops.push(r);
        r
    }

    pub fn op(&self, r: OpRef) -> &Op {
        &self.arena[r.index()]
    }

    /// Operations in execution order
    pub fn iter(&self) -> impl Iterator<Item = (OpRef, &Op)> {
        self.ops.iter().map(move |&r| (r, &self.arena[r.index()]))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Opcodes in execution order
    pub fn opcodes(&self) -> Vec<OpCode> {
        self.iter().map(|(_, op)| op.opcode).collect()
    }

    /// Number of operations with the given opcode
    pub fn count(&self, opcode: OpCode) -> usize {
        self.iter().filter(|(_, op)| op.opcode == opcode).count()
    }

    /// The final operation, if it is a jump or finish
    pub fn final_op(&self) -> Option<(OpRef, &Op)> {
        self.iter().last().filter(|(_, op)| op.opcode.is_final())
    }

    /// Types of the input arguments
    pub fn inputarg_types(&self) -> Vec<Type> {
        self.inputargs.iter().map(|&r| self.op(r).ty).collect()
    }

    /// Name of a value in the text format
    pub fn value_name(&self, r: OpRef) -> String {
        let ty = self.arena.get(r.index()).map(|op| op.ty).unwrap_or(Type::Void);
        format!("{}{}", ty.prefix(), r.0)
    }

    fn fmt_operand(&self, operand: &Operand) -> String {
        match operand {
            Operand::Op(r) => self.value_name(*r),
            Operand::Const(Const::Ref(RefConst::Obj { id, .. })) => {
                match self.descrs.objects().get(*id as usize) {
                    Some((name, _)) => format!("ConstPtr({})", name),
                    None => format!("ConstPtr(#{})", id),
                }
            }
            Operand::Const(c) => c.to_string(),
        }
    }

    /// Render one operation in the text format
    pub fn fmt_op(&self, r: OpRef) -> String {
        let op = self.op(r);
        let mut out = String::new();
        if op.has_result() {
            out.push_str(&self.value_name(r));
            out.push_str(" = ");
        }
        out.push_str(op.opcode.name());
        out.push('(');
        let mut parts: Vec<String> = op.args.iter().map(|a| self.fmt_operand(a)).collect();
        if let Some(descr) = op.descr {
            parts.push(format!("descr={}", self.descrs.name(descr)));
        }
        if let Some(resume) = &op.resume {
            parts.push(format!("descr=<Guard{}>", resume.id));
        }
        out.push_str(&parts.join(", "));
        out.push(')');
        if let Some(fail_args) = &op.fail_args {
            let names: Vec<String> = fail_args.iter().map(|a| self.fmt_operand(a)).collect();
            out.push_str(&format!(" [{}]", names.join(", ")));
        }
        out
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.inputargs.iter().map(|&r| self.value_name(r)).collect();
        writeln!(f, "[{}]", names.join(", "))?;
        for &r in &self.ops {
            writeln!(f, "{}", self.fmt_op(r))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_display() {
        let mut trace = Trace::new(Rc::new(DescrTable::new()));
        let i0 = trace.add_inputarg(Type::Int);
        let i1 = trace.push(Op::new(
            OpCode::IntAdd,
            Type::Int,
            vec![i0.into(), Operand::int(1)],
        ));
        trace.push(Op::void(OpCode::Finish, vec![i1.into()]));

        assert_eq!(trace.to_string(), "[i0]\ni1 = int_add(i0, 1)\nfinish(i1)\n");
        assert_eq!(trace.opcodes(), vec![OpCode::IntAdd, OpCode::Finish]);
        assert!(trace.final_op().is_some());
    }

    #[test]
    fn test_const_display() {
        assert_eq!(Const::str("ab").to_string(), "\"ab\"");
        assert_eq!(Const::unicode("x").to_string(), "u\"x\"");
        assert_eq!(Const::float(1.0).to_string(), "1.0");
        assert_eq!(Const::null().to_string(), "NULL");
    }

    #[test]
    fn test_const_nullness() {
        assert!(Const::Int(0).is_null());
        assert!(!Const::Int(3).is_null());
        assert!(Const::null().is_null());
        assert!(!Const::str("").is_null());
        assert_eq!(Type::Ref.default_const(), Const::null());
    }
}
