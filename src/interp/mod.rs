//! Reference interpreter
//!
//! Executes traces, optimized or not, on a small heap model: structs,
//! arrays, arrays of structs, strings and raw (non-GC) memory. It is the
//! oracle for differential testing: an optimized trace must produce the
//! same rendered results and the same call log as the trace it came from.
//!
//! Calls dispatch first on the helper the call descriptor names, then on
//! closures registered by name, and finally on a default that logs the
//! call and applies its declared write effects to every escaped object.

use crate::error::{Error, Result};
use crate::ir::eval::{eval_pure, eval_str_helper};
use crate::ir::{
    Const, Descr, DescrRef, DescrTable, EffectFlags, EffectInfo, Op, OpCode, OpRef, OopSpec,
    Operand, RefConst, StrConst, StrMode, Trace, Type,
};
use crate::resume::{FailArg, ResumeDescr, VirtualDescr};
use crate::virtualstate::RuntimeValue;
use rustc_hash::{FxHashMap as HashMap, FxHasher};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use tracing::{debug, trace};

/// Integer value of an object pointer is `PTR_BASE + id * PTR_ALIGN`
const PTR_BASE: i64 = 0x1000;
const PTR_ALIGN: i64 = 16;
/// First address handed out by the raw allocator
const RAW_BASE: i64 = 0x4000_0000;

/// Identity of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub u32);

/// A runtime value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    /// `None` is the null pointer
    Ref(Option<ObjId>),
}

impl Value {
    pub const NULL: Value = Value::Ref(None);

    pub fn as_int(self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(v),
            other => Err(Error::execution(format!("expected an int, got {:?}", other))),
        }
    }

    pub fn as_float(self) -> Result<f64> {
        match self {
            Value::Float(v) => Ok(v),
            other => Err(Error::execution(format!("expected a float, got {:?}", other))),
        }
    }

    pub fn as_ref(self) -> Result<Option<ObjId>> {
        match self {
            Value::Ref(r) => Ok(r),
            other => Err(Error::execution(format!("expected a reference, got {:?}", other))),
        }
    }

    /// Non-null object, or an error naming the operation
    fn object(self, what: &str) -> Result<ObjId> {
        self.as_ref()?
            .ok_or_else(|| Error::execution(format!("{} on a null pointer", what)))
    }

    fn is_true(self) -> bool {
        match self {
            Value::Int(v) => v != 0,
            Value::Float(v) => v != 0.0,
            Value::Ref(r) => r.is_some(),
        }
    }

    fn default_of(ty: Type) -> Value {
        match ty {
            Type::Float => Value::Float(0.0),
            Type::Ref => Value::NULL,
            Type::Int | Type::Void => Value::Int(0),
        }
    }
}

/// How a trace run ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished(Vec<Value>),
    Jumped(Vec<Value>),
    /// `origin` is the recorded guard the failing guard stands for
    GuardFailed { origin: OpRef, values: Vec<Value> },
}

impl Outcome {
    pub fn values(&self) -> &[Value] {
        match self {
            Outcome::Finished(v) | Outcome::Jumped(v) => v,
            Outcome::GuardFailed { values, .. } => values,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Finished(_) => "finish",
            Outcome::Jumped(_) => "jump",
            Outcome::GuardFailed { .. } => "guard failure",
        }
    }
}

/// Contents of one heap object
#[derive(Debug, Clone)]
pub enum Object {
    Struct {
        descr: DescrRef,
        class: Option<i64>,
        fields: HashMap<DescrRef, Value>,
    },
    Array {
        descr: DescrRef,
        items: Vec<Value>,
    },
    ArrayStruct {
        descr: DescrRef,
        items: Vec<HashMap<DescrRef, Value>>,
    },
    Str {
        mode: StrMode,
        chars: Vec<u32>,
    },
}

#[derive(Debug, Clone)]
struct Cell {
    object: Object,
    /// Reachable by called code
    escaped: bool,
}

/// The interpreter's memory
#[derive(Debug, Default)]
pub struct Heap {
    cells: Vec<Cell>,
    /// Raw stores by address: length and value
    raw: BTreeMap<i64, (i64, Value)>,
    /// Raw blocks by base address
    blocks: BTreeMap<i64, i64>,
    next_raw: i64,
    /// Constant strings, one object per distinct constant
    interned: HashMap<StrConst, ObjId>,
}

impl Heap {
    fn new() -> Self {
        Heap {
            next_raw: RAW_BASE,
            ..Default::default()
        }
    }

    pub fn alloc(&mut self, object: Object) -> ObjId {
        let id = ObjId(self.cells.len() as u32);
        self.cells.push(Cell {
            object,
            escaped: false,
        });
        id
    }

    pub fn get(&self, id: ObjId) -> Result<&Object> {
        self.cells
            .get(id.0 as usize)
            .map(|c| &c.object)
            .ok_or_else(|| Error::execution(format!("dangling object #{}", id.0)))
    }

    pub fn get_mut(&mut self, id: ObjId) -> Result<&mut Object> {
        self.cells
            .get_mut(id.0 as usize)
            .map(|c| &mut c.object)
            .ok_or_else(|| Error::execution(format!("dangling object #{}", id.0)))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Allocate a string object
    pub fn alloc_str(&mut self, mode: StrMode, chars: Vec<u32>) -> Value {
        Value::Ref(Some(self.alloc(Object::Str { mode, chars })))
    }

    /// Characters of a string value; `None` for null
    pub fn str_of(&self, value: Value) -> Result<Option<StrConst>> {
        let Some(id) = value.as_ref()? else {
            return Ok(None);
        };
        match self.get(id)? {
            Object::Str { mode, chars } => Ok(Some(StrConst::from_chars(*mode, chars.clone()))),
            _ => Err(Error::execution("expected a string object")),
        }
    }

    fn intern(&mut self, s: &StrConst) -> ObjId {
        if let Some(&id) = self.interned.get(s) {
            return id;
        }
        let id = self.alloc(Object::Str {
            mode: s.mode,
            chars: s.chars.to_vec(),
        });
        self.interned.insert(s.clone(), id);
        id
    }

    fn str_chars_mut(&mut self, value: Value) -> Result<&mut Vec<u32>> {
        let id = value.object("string write")?;
        match self.get_mut(id)? {
            Object::Str { chars, .. } => Ok(chars),
            _ => Err(Error::execution("expected a string object")),
        }
    }

    /// Mark an object and everything reachable from it as escaped
    fn escape(&mut self, value: Value) {
        let mut stack = vec![value];
        while let Some(v) = stack.pop() {
            let Value::Ref(Some(id)) = v else { continue };
            let Some(cell) = self.cells.get_mut(id.0 as usize) else {
                continue;
            };
            if cell.escaped {
                continue;
            }
            cell.escaped = true;
            match &cell.object {
                Object::Struct { fields, .. } => stack.extend(fields.values().copied()),
                Object::Array { items, .. } => stack.extend(items.iter().copied()),
                Object::ArrayStruct { items, .. } => {
                    stack.extend(items.iter().flat_map(|m| m.values().copied()))
                }
                Object::Str { .. } => {}
            }
        }
    }

    fn is_escaped(&self, value: Value) -> bool {
        match value {
            Value::Ref(Some(id)) => self.cells.get(id.0 as usize).is_some_and(|c| c.escaped),
            _ => false,
        }
    }

    // ========== Raw memory ==========

    fn raw_malloc(&mut self, size: i64) -> Result<i64> {
        if size < 0 {
            return Err(Error::execution(format!("raw_malloc of {} bytes", size)));
        }
        let base = self.next_raw;
        self.blocks.insert(base, size);
        self.next_raw += (size + PTR_ALIGN - 1) / PTR_ALIGN * PTR_ALIGN + PTR_ALIGN;
        Ok(base)
    }

    fn raw_free(&mut self, base: i64) -> Result<()> {
        let size = self
            .blocks
            .remove(&base)
            .ok_or_else(|| Error::execution(format!("raw_free of unknown block {:#x}", base)))?;
        let keys: Vec<i64> = self.raw.range(base..base + size).map(|(&k, _)| k).collect();
        for k in keys {
            self.raw.remove(&k);
        }
        Ok(())
    }

    fn raw_store(&mut self, addr: i64, length: i64, value: Value) {
        let overlapping: Vec<i64> = self
            .raw
            .range(addr - PTR_ALIGN + 1..addr + length)
            .filter(|(&k, &(len, _))| k < addr + length && addr < k + len)
            .map(|(&k, _)| k)
            .collect();
        for k in overlapping {
            self.raw.remove(&k);
        }
        self.raw.insert(addr, (length, value));
    }

    fn raw_load(&self, addr: i64, length: i64, ty: Type) -> Value {
        match self.raw.get(&addr) {
            Some(&(len, value)) if len == length => value,
            _ => Value::default_of(ty),
        }
    }
}

/// A callable registered with [`Interpreter::register`]
pub type NativeFn = Box<dyn FnMut(&mut Heap, &[Value]) -> Result<Value>>;

/// The reference interpreter
pub struct Interpreter {
    descrs: Rc<DescrTable>,
    heap: Heap,
    natives: HashMap<String, NativeFn>,
    /// Prebuilt objects by id
    prebuilt: Vec<ObjId>,
    log: Vec<String>,
    /// Calls with effects executed so far
    effect_calls: u64,
    overflowed: bool,
    dicts: HashMap<(String, String), i64>,
}

impl Interpreter {
    /// Create an interpreter whose heap holds the table's prebuilt objects
    pub fn new(descrs: Rc<DescrTable>) -> Self {
        let mut heap = Heap::new();
        let mut prebuilt = Vec::new();
        for (_, size) in descrs.objects() {
            let class = descrs.size(*size).and_then(|s| s.vtable);
            let id = heap.alloc(Object::Struct {
                descr: *size,
                class,
                fields: HashMap::default(),
            });
            heap.escape(Value::Ref(Some(id)));
            prebuilt.push(id);
        }
        Interpreter {
            descrs,
            heap,
            natives: HashMap::default(),
            prebuilt,
            log: Vec::new(),
            effect_calls: 0,
            overflowed: false,
            dicts: HashMap::default(),
        }
    }

    /// Register the implementation of a called function by name
    pub fn register(
        &mut self,
        name: &str,
        f: impl FnMut(&mut Heap, &[Value]) -> Result<Value> + 'static,
    ) {
        self.natives.insert(name.to_string(), Box::new(f));
    }

    /// Observable events: effectful calls and `escape` operations
    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Parse an input value: an integer, a float, `NULL`, a quoted string,
    /// a prebuilt object name, a struct name (fresh zeroed object) or
    /// `Array[n]` (fresh array)
    pub fn parse_value(&mut self, text: &str) -> Result<Value> {
        let text = text.trim();
        if let Ok(v) = text.parse::<i64>() {
            return Ok(Value::Int(v));
        }
        if let Ok(v) = text.parse::<f64>() {
            return Ok(Value::Float(v));
        }
        if text == "NULL" {
            return Ok(Value::NULL);
        }
        let value = if let Some(body) = text.strip_prefix("u\"").and_then(|t| t.strip_suffix('"')) {
            self.heap.alloc_str(StrMode::Unicode, body.chars().map(|c| c as u32).collect())
        } else if let Some(body) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            self.heap.alloc_str(StrMode::Str, body.chars().map(|c| c as u32).collect())
        } else if let Some(id) = self.descrs.object_by_name(text) {
            return Ok(Value::Ref(self.prebuilt.get(id as usize).copied()));
        } else if let Some((name, len)) = text.strip_suffix(']').and_then(|t| t.split_once('[')) {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| Error::execution(format!("bad array length in '{}'", text)))?;
            let descr = self
                .descrs
                .lookup(name.trim())
                .ok_or_else(|| Error::execution(format!("unknown array '{}'", name)))?;
            self.alloc_array(descr, len)?
        } else {
            let descr = self
                .descrs
                .lookup(text)
                .ok_or_else(|| Error::execution(format!("cannot parse value '{}'", text)))?;
            let class = self.descrs.size(descr).and_then(|s| s.vtable);
            Value::Ref(Some(self.heap.alloc(Object::Struct {
                descr,
                class,
                fields: HashMap::default(),
            })))
        };
        self.heap.escape(value);
        Ok(value)
    }

    // ========== Running ==========

    /// Execute a trace once, from its input arguments to its final
    /// operation or a failing guard
    pub fn run(&mut self, trace: &Trace, args: &[Value]) -> Result<Outcome> {
        if args.len() != trace.inputargs.len() {
            return Err(Error::execution(format!(
                "trace takes {} arguments, got {}",
                trace.inputargs.len(),
                args.len()
            )));
        }
        let mut env: Vec<Option<Value>> = vec![None; trace.arena.len()];
        // inputs from `parse_value` are already escaped; values a loop
        // carries through its jump keep whatever status they had
        for (&r, &value) in trace.inputargs.iter().zip(args) {
            env[r.index()] = Some(value);
        }
        for &r in &trace.ops {
            let op = trace.op(r);
            trace!(op = %op.opcode, result = r.0, "execute");
            if op.is_guard() {
                if !self.guard_passes(op, &env)? {
                    let (origin, values) = self.guard_failure(r, op, &env)?;
                    debug!(origin = origin.0, "guard failed");
                    return Ok(Outcome::GuardFailed { origin, values });
                }
                continue;
            }
            match op.opcode {
                OpCode::Finish => return Ok(Outcome::Finished(self.values(&op.args, &env)?)),
                OpCode::Jump => return Ok(Outcome::Jumped(self.values(&op.args, &env)?)),
                _ => {}
            }
            if let Some(value) = self.execute(trace, op, &env)? {
                env[r.index()] = Some(value);
            }
        }
        Err(Error::execution("trace ended without finish or jump"))
    }

    /// Run a loop trace `iterations` times, feeding each jump's values
    /// back as the next inputs
    pub fn run_iterations(
        &mut self,
        trace: &Trace,
        args: &[Value],
        iterations: usize,
    ) -> Result<Outcome> {
        let mut args = args.to_vec();
        for _ in 1..iterations {
            match self.run(trace, &args)? {
                Outcome::Jumped(values) => args = values,
                other => return Ok(other),
            }
        }
        self.run(trace, &args)
    }

    fn value(&mut self, operand: &Operand, env: &[Option<Value>]) -> Result<Value> {
        match operand {
            Operand::Op(r) => env
                .get(r.index())
                .copied()
                .flatten()
                .ok_or_else(|| Error::execution(format!("use of undefined value v{}", r.0))),
            Operand::Const(c) => Ok(self.const_value(c)),
        }
    }

    fn values(&mut self, operands: &[Operand], env: &[Option<Value>]) -> Result<Vec<Value>> {
        operands.iter().map(|a| self.value(a, env)).collect()
    }

    fn const_value(&mut self, c: &Const) -> Value {
        match c {
            Const::Int(v) => Value::Int(*v),
            Const::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Const::Ref(RefConst::Null) => Value::NULL,
            Const::Ref(RefConst::Str(s)) => Value::Ref(Some(self.heap.intern(s))),
            Const::Ref(RefConst::Obj { id, .. }) => {
                Value::Ref(self.prebuilt.get(*id as usize).copied())
            }
        }
    }

    fn guard_passes(&mut self, op: &Op, env: &[Option<Value>]) -> Result<bool> {
        use OpCode::*;
        let arg = |this: &mut Self, i: usize| -> Result<Value> {
            let operand = op
                .args
                .get(i)
                .ok_or_else(|| Error::execution(format!("{} is missing an argument", op.opcode)))?;
            this.value(operand, env)
        };
        Ok(match op.opcode {
            GuardTrue => arg(self, 0)?.is_true(),
            GuardFalse => !arg(self, 0)?.is_true(),
            GuardValue => arg(self, 0)? == arg(self, 1)?,
            GuardNonnull => arg(self, 0)?.is_true(),
            GuardIsnull => !arg(self, 0)?.is_true(),
            GuardClass | GuardNonnullClass => {
                let expected = arg(self, 1)?.as_int()?;
                match arg(self, 0)?.as_ref()? {
                    Some(id) => self.class_of(id)? == Some(expected),
                    None => false,
                }
            }
            GuardNoOverflow => !self.overflowed,
            GuardOverflow => self.overflowed,
            // called code never raises here
            GuardNoException => true,
            GuardException => false,
            GuardNotInvalidated | GuardNotForced | GuardNotForced2 => true,
            other => return Err(Error::execution(format!("{} is not a guard", other))),
        })
    }

    fn guard_failure(
        &mut self,
        r: OpRef,
        op: &Op,
        env: &[Option<Value>],
    ) -> Result<(OpRef, Vec<Value>)> {
        match &op.resume {
            Some(resume) => Ok((resume.origin, self.decode(resume, env)?)),
            None => {
                let fail_args = op.fail_args.clone().unwrap_or_default();
                Ok((r, self.values(&fail_args, env)?))
            }
        }
    }

    fn class_of(&self, id: ObjId) -> Result<Option<i64>> {
        Ok(match self.heap.get(id)? {
            Object::Struct { class, .. } => *class,
            _ => None,
        })
    }

    // ========== Operations ==========

    fn execute(&mut self, trace: &Trace, op: &Op, env: &[Option<Value>]) -> Result<Option<Value>> {
        use OpCode::*;
        let args = self.values(&op.args, env)?;
        let arg = |i: usize| -> Result<Value> {
            args.get(i)
                .copied()
                .ok_or_else(|| Error::execution(format!("{} is missing argument {}", op.opcode, i)))
        };
        let descr = || -> Result<DescrRef> {
            op.descr
                .ok_or_else(|| Error::execution(format!("{} needs a descriptor", op.opcode)))
        };
        let value = match op.opcode {
            InputArg | Label | DebugMergePoint | QuasiimmutField | RecordExactClass => {
                return Ok(None)
            }
            SameAs | MarkOpaquePtr => arg(0)?,
            IntAddOvf | IntSubOvf | IntMulOvf => {
                let (a, b) = (arg(0)?.as_int()?, arg(1)?.as_int()?);
                let checked = eval_pure(op.opcode, &[Const::Int(a), Const::Int(b)]);
                self.overflowed = checked.is_none();
                let wrapped = eval_pure(op.opcode.without_ovf(), &[Const::Int(a), Const::Int(b)]);
                self.const_value(&wrapped.unwrap_or(Const::Int(0)))
            }
            PtrEq | InstancePtrEq => Value::Int((arg(0)? == arg(1)?) as i64),
            PtrNe | InstancePtrNe => Value::Int((arg(0)? != arg(1)?) as i64),
            CastPtrToInt => Value::Int(match arg(0)?.as_ref()? {
                Some(id) => PTR_BASE + id.0 as i64 * PTR_ALIGN,
                None => 0,
            }),
            CastIntToPtr => {
                let v = arg(0)?.as_int()?;
                if v == 0 {
                    Value::NULL
                } else if v >= PTR_BASE && (v - PTR_BASE) % PTR_ALIGN == 0 {
                    let id = ObjId(((v - PTR_BASE) / PTR_ALIGN) as u32);
                    self.heap.get(id)?;
                    Value::Ref(Some(id))
                } else {
                    return Err(Error::execution(format!("{:#x} is not an object address", v)));
                }
            }
            opcode if opcode.is_always_pure() && !opcode.is_call() && !is_heap_read(opcode) => {
                let consts: Vec<Const> = args.iter().map(pure_const).collect::<Result<_>>()?;
                let result = eval_pure(opcode, &consts).ok_or_else(|| {
                    Error::execution(format!("{} faults on {:?}", opcode, args))
                })?;
                self.const_value(&result)
            }

            // ========== Heap ==========
            New | NewWithVtable => {
                let size = descr()?;
                let class = match op.opcode {
                    NewWithVtable => self.descrs.size(size).and_then(|s| s.vtable),
                    _ => None,
                };
                Value::Ref(Some(self.heap.alloc(Object::Struct {
                    descr: size,
                    class,
                    fields: HashMap::default(),
                })))
            }
            NewArray | NewArrayClear => {
                let len = usize::try_from(arg(0)?.as_int()?)
                    .map_err(|_| Error::execution("negative array length"))?;
                self.alloc_array(descr()?, len)?
            }
            GetfieldGc => {
                let id = arg(0)?.object("getfield_gc")?;
                let field = descr()?;
                match self.heap.get(id)? {
                    Object::Struct { fields, .. } => match fields.get(&field) {
                        Some(v) => *v,
                        None => self.default_for(field),
                    },
                    _ => return Err(Error::execution("getfield_gc on a non-struct")),
                }
            }
            SetfieldGc => {
                let (target, value) = (arg(0)?, arg(1)?);
                self.set_field(target.object("setfield_gc")?, descr()?, value)?;
                if self.heap.is_escaped(target) {
                    self.heap.escape(value);
                }
                return Ok(None);
            }
            ArraylenGc => {
                let id = arg(0)?.object("arraylen_gc")?;
                Value::Int(match self.heap.get(id)? {
                    Object::Array { items, .. } => items.len() as i64,
                    Object::ArrayStruct { items, .. } => items.len() as i64,
                    _ => return Err(Error::execution("arraylen_gc on a non-array")),
                })
            }
            GetarrayitemGc => {
                let (id, index) = (arg(0)?.object("getarrayitem_gc")?, arg(1)?.as_int()?);
                match self.heap.get(id)? {
                    Object::Array { items, .. } => *array_slot(items, index)?,
                    _ => return Err(Error::execution("getarrayitem_gc on a non-array")),
                }
            }
            SetarrayitemGc => {
                let (target, index, value) = (arg(0)?, arg(1)?.as_int()?, arg(2)?);
                match self.heap.get_mut(target.object("setarrayitem_gc")?)? {
                    Object::Array { items, .. } => *array_slot_mut(items, index)? = value,
                    _ => return Err(Error::execution("setarrayitem_gc on a non-array")),
                }
                if self.heap.is_escaped(target) {
                    self.heap.escape(value);
                }
                return Ok(None);
            }
            GetinteriorfieldGc => {
                let (id, index) = (arg(0)?.object("getinteriorfield_gc")?, arg(1)?.as_int()?);
                let field = descr()?;
                let found = match self.heap.get(id)? {
                    Object::ArrayStruct { items, .. } => array_slot(items, index)?.get(&field).copied(),
                    _ => return Err(Error::execution("getinteriorfield_gc on a non-struct array")),
                };
                match found {
                    Some(v) => v,
                    None => self.default_for(field),
                }
            }
            SetinteriorfieldGc => {
                let (target, index, value) = (arg(0)?, arg(1)?.as_int()?, arg(2)?);
                let field = descr()?;
                match self.heap.get_mut(target.object("setinteriorfield_gc")?)? {
                    Object::ArrayStruct { items, .. } => {
                        array_slot_mut(items, index)?.insert(field, value);
                    }
                    _ => return Err(Error::execution("setinteriorfield_gc on a non-struct array")),
                }
                if self.heap.is_escaped(target) {
                    self.heap.escape(value);
                }
                return Ok(None);
            }

            // ========== Raw memory ==========
            GetarrayitemRaw | RawLoad => {
                let (addr, length, ty) = self.raw_address(op, &args)?;
                self.heap.raw_load(addr, length, ty)
            }
            SetarrayitemRaw | RawStore => {
                let (addr, length, _) = self.raw_address(op, &args)?;
                self.heap.raw_store(addr, length, arg(2)?);
                return Ok(None);
            }

            // ========== Strings ==========
            Newstr | Newunicode => {
                let len = usize::try_from(arg(0)?.as_int()?)
                    .map_err(|_| Error::execution("negative string length"))?;
                let mode = str_mode_of(op.opcode);
                self.heap.alloc_str(mode, vec![0; len])
            }
            Strlen | Unicodelen => {
                let s = self.string(arg(0)?)?;
                Value::Int(s.len() as i64)
            }
            Strgetitem | Unicodegetitem => {
                let s = self.string(arg(0)?)?;
                let index = arg(1)?.as_int()?;
                let c = usize::try_from(index)
                    .ok()
                    .and_then(|i| s.chars.get(i))
                    .ok_or_else(|| Error::execution(format!("string index {} out of range", index)))?;
                Value::Int(*c as i64)
            }
            Strsetitem | Unicodesetitem => {
                let (index, c) = (arg(1)?.as_int()?, arg(2)?.as_int()?);
                let chars = self.heap.str_chars_mut(arg(0)?)?;
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| chars.get_mut(i))
                    .ok_or_else(|| Error::execution(format!("string index {} out of range", index)))?;
                *slot = c as u32;
                return Ok(None);
            }
            Copystrcontent | Copyunicodecontent => {
                let src = self.string(arg(0)?)?;
                let (srcstart, dststart, length) =
                    (arg(2)?.as_int()?, arg(3)?.as_int()?, arg(4)?.as_int()?);
                let part = char_range(&src.chars, srcstart, length)?.to_vec();
                let chars = self.heap.str_chars_mut(arg(1)?)?;
                let start = usize::try_from(dststart)
                    .ok()
                    .filter(|&s| s + part.len() <= chars.len())
                    .ok_or_else(|| Error::execution("copy past the end of the target string"))?;
                chars[start..start + part.len()].copy_from_slice(&part);
                return Ok(None);
            }

            // ========== Calls ==========
            Call | CallPure | CallMayForce | CallLoopinvariant | CallReleaseGil => {
                return self.call(trace, op, descr()?, &args).map(Some)
            }
            CondCall => {
                if !arg(0)?.is_true() {
                    return Ok(None);
                }
                self.call(trace, op, descr()?, &args[1..])?;
                return Ok(None);
            }

            // ========== Virtual references ==========
            ForceToken => Value::Int(1),
            VirtualRef => {
                let vref = self.descrs.vref();
                let mut fields = HashMap::default();
                fields.insert(vref.virtual_token, Value::Int(1));
                Value::Ref(Some(self.heap.alloc(Object::Struct {
                    descr: vref.size,
                    class: Some(vref.class),
                    fields,
                })))
            }
            VirtualRefFinish => {
                let vref = self.descrs.vref();
                let (target, obj) = (arg(0)?.object("virtual_ref_finish")?, arg(1)?);
                if obj.is_true() {
                    self.set_field(target, vref.forced, obj)?;
                }
                self.set_field(target, vref.virtual_token, Value::Int(0))?;
                return Ok(None);
            }

            Escape => {
                let rendered = self.render_values(&args);
                self.log.push(format!("escape({})", rendered));
                for &v in &args {
                    self.heap.escape(v);
                }
                if op.ty == Type::Void {
                    return Ok(None);
                }
                Value::default_of(op.ty)
            }
            other => return Err(Error::execution(format!("cannot execute {}", other))),
        };
        Ok(Some(value))
    }

    fn string(&self, value: Value) -> Result<StrConst> {
        self.heap
            .str_of(value)?
            .ok_or_else(|| Error::execution("string operation on a null pointer"))
    }

    fn default_for(&self, field: DescrRef) -> Value {
        let ty = match self.descrs.get(field) {
            Some(Descr::Field(f)) => f.ty,
            Some(Descr::InteriorField(f)) => f.ty,
            _ => Type::Int,
        };
        Value::default_of(ty)
    }

    fn set_field(&mut self, id: ObjId, field: DescrRef, value: Value) -> Result<()> {
        match self.heap.get_mut(id)? {
            Object::Struct { fields, .. } => {
                fields.insert(field, value);
                Ok(())
            }
            _ => Err(Error::execution("setfield_gc on a non-struct")),
        }
    }

    fn alloc_array(&mut self, descr: DescrRef, len: usize) -> Result<Value> {
        let array = self
            .descrs
            .array(descr)
            .ok_or_else(|| Error::execution(format!("{} is not an array", self.descrs.name(descr))))?;
        let object = if array.is_array_of_structs() {
            Object::ArrayStruct {
                descr,
                items: vec![HashMap::default(); len],
            }
        } else {
            Object::Array {
                descr,
                items: vec![Value::default_of(array.item_ty); len],
            }
        };
        Ok(Value::Ref(Some(self.heap.alloc(object))))
    }

    /// Address, access width and item type of a raw access
    fn raw_address(&self, op: &Op, args: &[Value]) -> Result<(i64, i64, Type)> {
        let descr = op
            .descr
            .and_then(|d| self.descrs.array(d))
            .ok_or_else(|| Error::execution(format!("{} needs an array descriptor", op.opcode)))?;
        let base = args.first().copied().unwrap_or(Value::Int(0)).as_int()?;
        let pos = args.get(1).copied().unwrap_or(Value::Int(0)).as_int()?;
        let offset = match op.opcode {
            OpCode::GetarrayitemRaw | OpCode::SetarrayitemRaw => pos * descr.item_size,
            _ => pos,
        };
        Ok((base + offset, descr.item_size, descr.item_ty))
    }

    // ========== Calls ==========

    fn call(&mut self, trace: &Trace, op: &Op, descr: DescrRef, args: &[Value]) -> Result<Value> {
        let call = self
            .descrs
            .call(descr)
            .cloned()
            .ok_or_else(|| Error::execution(format!("{} is not a call", self.descrs.name(descr))))?;
        let effect = &call.effect;
        if let Some(key) = self.const_key(args) {
            if let Some(known) = trace.call_pure_results.get(&(descr, key)) {
                return Ok(self.const_value(known));
            }
        }
        let spec = effect.oopspec();
        if spec.str_mode().is_some() || spec == OopSpec::Str2Unicode {
            return self.call_str_helper(spec, args);
        }
        match spec {
            OopSpec::DictLookup => return self.dict_lookup(args),
            OopSpec::JitForceVirtual => {
                let vref = self.descrs.vref();
                let id = args.first().copied().unwrap_or(Value::NULL).object("jit_force_virtual")?;
                return Ok(match self.heap.get(id)? {
                    Object::Struct { fields, .. } => {
                        fields.get(&vref.forced).copied().unwrap_or(Value::NULL)
                    }
                    _ => Value::NULL,
                });
            }
            OopSpec::JitForceVirtualizable => return Ok(Value::Int(0)),
            OopSpec::RawMallocVarsizeChar => {
                let size = args.first().copied().unwrap_or(Value::Int(0)).as_int()?;
                return Ok(Value::Int(self.heap.raw_malloc(size)?));
            }
            OopSpec::RawFree => {
                let base = args.first().copied().unwrap_or(Value::Int(0)).as_int()?;
                self.heap.raw_free(base)?;
                return Ok(Value::Int(0));
            }
            _ => {}
        }
        if let Some(native) = self.natives.get_mut(&call.name) {
            let result = native(&mut self.heap, args)?;
            self.heap.escape(result);
            return Ok(result);
        }
        self.default_call(&call.name, effect, op.ty, args)
    }

    fn const_key(&self, args: &[Value]) -> Option<Vec<Const>> {
        args.iter()
            .map(|v| match v {
                Value::Int(i) => Some(Const::Int(*i)),
                Value::Float(f) => Some(Const::float(*f)),
                Value::Ref(None) => Some(Const::null()),
                Value::Ref(Some(_)) => None,
            })
            .collect()
    }

    fn call_str_helper(&mut self, spec: OopSpec, args: &[Value]) -> Result<Value> {
        let mut consts = Vec::with_capacity(args.len());
        for &v in args {
            consts.push(match v {
                Value::Ref(_) => match self.heap.str_of(v)? {
                    Some(s) => Const::Ref(RefConst::Str(s)),
                    None => Const::null(),
                },
                other => pure_const(&other)?,
            });
        }
        let result = eval_str_helper(spec, &consts)
            .ok_or_else(|| Error::execution(format!("{} failed on {:?}", spec.name(), args)))?;
        Ok(match result {
            Const::Ref(RefConst::Str(s)) => self.heap.alloc_str(s.mode, s.chars.to_vec()),
            other => self.const_value(&other),
        })
    }

    /// `dict_lookup(dict, key, flag)`: index of the key, inserting it when
    /// the flag is 1 and deleting it when the flag is 2; -1 if absent
    fn dict_lookup(&mut self, args: &[Value]) -> Result<Value> {
        let [dict, key, flag] = args else {
            return Err(Error::execution("dict lookup takes three arguments"));
        };
        let k = (self.render(dict), self.render(key));
        let index = match flag.as_int()? {
            1 => {
                let next = self.dicts.len() as i64;
                *self.dicts.entry(k).or_insert(next)
            }
            2 => self.dicts.remove(&k).unwrap_or(-1),
            _ => self.dicts.get(&k).copied().unwrap_or(-1),
        };
        Ok(Value::Int(index))
    }

    /// Calls without an implementation: log them, apply their declared
    /// writes and return a value derived from the arguments
    fn default_call(&mut self, name: &str, effect: &EffectInfo, ty: Type, args: &[Value]) -> Result<Value> {
        let pure = effect.is_elidable() || effect.flags.contains(EffectFlags::LOOP_INVARIANT);
        let mut hasher = FxHasher::default();
        name.hash(&mut hasher);
        if pure {
            for &v in args {
                self.shallow_key(v).hash(&mut hasher);
            }
        } else {
            self.effect_calls += 1;
            let rendered = self.render_values(args);
            rendered.hash(&mut hasher);
            self.effect_calls.hash(&mut hasher);
            self.log.push(format!("{}({})", name, rendered));
            for &v in args {
                self.heap.escape(v);
            }
            self.apply_writes(effect);
        }
        let h = hasher.finish();
        Ok(match ty {
            Type::Int | Type::Void => Value::Int((h % 1000) as i64),
            Type::Float => Value::Float((h % 1000) as f64 / 8.0),
            Type::Ref => Value::NULL,
        })
    }

    /// Identity-free description of an argument of an elidable call
    fn shallow_key(&self, value: Value) -> String {
        match value {
            Value::Ref(Some(_)) => match self.heap.str_of(value) {
                Ok(Some(s)) => format!("{:?}", s.to_text()),
                _ => "object".to_string(),
            },
            other => self.render(&other),
        }
    }

    /// Overwrite every field and array the call may write, in every object
    /// called code can reach
    fn apply_writes(&mut self, effect: &EffectInfo) {
        let seq = self.effect_calls as i64;
        let fresh = |descr: DescrRef, ty: Type| match ty {
            Type::Float => Value::Float((seq * 31 + descr.0 as i64) as f64 / 4.0),
            Type::Ref => Value::NULL,
            Type::Int | Type::Void => Value::Int(seq * 1000 + descr.0 as i64),
        };
        let descrs = self.descrs.clone();
        let writable_field = |d: DescrRef| match descrs.field(d) {
            Some(f) if !f.immutable && !f.quasi_immutable => effect.writes_field(d).then_some(f.ty),
            _ => None,
        };
        let writable_array = |d: DescrRef| match descrs.array(d) {
            Some(a) if !a.immutable => effect.writes_array(d),
            _ => false,
        };
        for cell in self.heap.cells.iter_mut().filter(|c| c.escaped) {
            match &mut cell.object {
                Object::Struct { descr, fields, .. } => {
                    let layout = descrs.size(*descr).map(|s| s.fields.clone()).unwrap_or_default();
                    for field in layout {
                        if let Some(ty) = writable_field(field) {
                            fields.insert(field, fresh(field, ty));
                        }
                    }
                }
                Object::Array { descr, items } => {
                    if writable_array(*descr) {
                        let ty = descrs.array(*descr).map_or(Type::Int, |a| a.item_ty);
                        for item in items.iter_mut() {
                            *item = fresh(*descr, ty);
                        }
                    }
                }
                Object::ArrayStruct { descr, items } => {
                    if writable_array(*descr) {
                        let interior = descrs.array(*descr).map(|a| a.interior.clone()).unwrap_or_default();
                        for item in items.iter_mut() {
                            for &field in &interior {
                                let ty = descrs.interior(field).map_or(Type::Int, |f| f.ty);
                                item.insert(field, fresh(field, ty));
                            }
                        }
                    }
                }
                Object::Str { .. } => {}
            }
        }
    }

    // ========== Recovery ==========

    /// Rebuild the values a failing optimized guard stands for
    fn decode(&mut self, resume: &ResumeDescr, env: &[Option<Value>]) -> Result<Vec<Value>> {
        let mut built: Vec<Option<Value>> = vec![None; resume.virtuals.len()];
        // containers first, so cycles can be closed
        for (i, v) in resume.virtuals.iter().enumerate() {
            built[i] = match v {
                VirtualDescr::Struct { descr, class, .. } => Some(Value::Ref(Some(self.heap.alloc(
                    Object::Struct {
                        descr: *descr,
                        class: *class,
                        fields: HashMap::default(),
                    },
                )))),
                VirtualDescr::Array { descr, items, .. } => Some(self.alloc_array(*descr, items.len())?),
                VirtualDescr::ArrayStruct { descr, length, .. } => {
                    Some(self.alloc_array(*descr, *length)?)
                }
                VirtualDescr::RawBuffer { size, .. } => Some(Value::Int(self.heap.raw_malloc(*size)?)),
                _ => None,
            };
        }
        for i in 0..resume.virtuals.len() {
            self.build_leaf(resume, i, env, &mut built)?;
        }
        for (i, v) in resume.virtuals.iter().enumerate() {
            let target = built[i].unwrap_or(Value::NULL);
            match v {
                VirtualDescr::Struct { fields, .. } => {
                    let id = target.object("resume")?;
                    for (field, arg) in fields {
                        let value = self.fail_value(arg, env, &built)?;
                        self.set_field(id, *field, value)?;
                    }
                }
                VirtualDescr::Array { items, .. } => {
                    let id = target.object("resume")?;
                    for (index, item) in items.iter().enumerate() {
                        let Some(arg) = item else { continue };
                        let value = self.fail_value(arg, env, &built)?;
                        if let Object::Array { items, .. } = self.heap.get_mut(id)? {
                            items[index] = value;
                        }
                    }
                }
                VirtualDescr::ArrayStruct { items, .. } => {
                    let id = target.object("resume")?;
                    for (index, field, arg) in items {
                        let value = self.fail_value(arg, env, &built)?;
                        if let Object::ArrayStruct { items, .. } = self.heap.get_mut(id)? {
                            array_slot_mut(items, *index as i64)?.insert(*field, value);
                        }
                    }
                }
                VirtualDescr::RawBuffer { entries, .. } => {
                    let base = target.as_int()?;
                    for (offset, descr, arg) in entries {
                        let value = self.fail_value(arg, env, &built)?;
                        let width = self.descrs.array(*descr).map_or(8, |a| a.item_size);
                        self.heap.raw_store(base + offset, width, value);
                    }
                }
                _ => {}
            }
        }
        for pending in &resume.pending_fields {
            let target = self.fail_value(&pending.target, env, &built)?;
            let value = self.fail_value(&pending.value, env, &built)?;
            let id = target.object("pending field")?;
            match (self.descrs.get(pending.descr), pending.index) {
                (Some(Descr::Field(_)), _) => self.set_field(id, pending.descr, value)?,
                (Some(Descr::Array(_)), Some(index)) => {
                    if let Object::Array { items, .. } = self.heap.get_mut(id)? {
                        *array_slot_mut(items, index)? = value;
                    }
                }
                (Some(Descr::InteriorField(_)), Some(index)) => {
                    if let Object::ArrayStruct { items, .. } = self.heap.get_mut(id)? {
                        array_slot_mut(items, index)?.insert(pending.descr, value);
                    }
                }
                _ => return Err(Error::execution("malformed pending field")),
            }
        }
        resume
            .fail_args
            .iter()
            .map(|a| self.fail_value(a, env, &built))
            .collect()
    }

    /// Build a string or raw slice virtual; their parts come first
    fn build_leaf(
        &mut self,
        resume: &ResumeDescr,
        i: usize,
        env: &[Option<Value>],
        built: &mut Vec<Option<Value>>,
    ) -> Result<()> {
        if built[i].is_some() {
            return Ok(());
        }
        for part in leaf_parts(&resume.virtuals[i]) {
            if let FailArg::Virtual(j) = part {
                if *j == i {
                    return Err(Error::execution("string virtual contains itself"));
                }
                self.build_leaf(resume, *j, env, built)?;
            }
        }
        let value = match &resume.virtuals[i] {
            VirtualDescr::StrPlain { mode, chars } => {
                let mut out = Vec::with_capacity(chars.len());
                for c in chars {
                    out.push(match c {
                        Some(arg) => self.fail_value(arg, env, built)?.as_int()? as u32,
                        None => 0,
                    });
                }
                self.heap.alloc_str(*mode, out)
            }
            VirtualDescr::StrConcat { mode, left, right } => {
                let l = self.fail_value(left, env, built)?;
                let r = self.fail_value(right, env, built)?;
                let mut chars = self.string(l)?.chars.to_vec();
                chars.extend_from_slice(&self.string(r)?.chars);
                self.heap.alloc_str(*mode, chars)
            }
            VirtualDescr::StrSlice {
                mode,
                s,
                start,
                length,
            } => {
                let s = self.fail_value(s, env, built)?;
                let start = self.fail_value(start, env, built)?.as_int()?;
                let length = self.fail_value(length, env, built)?.as_int()?;
                let chars = char_range(&self.string(s)?.chars, start, length)?.to_vec();
                self.heap.alloc_str(*mode, chars)
            }
            VirtualDescr::RawSlice { parent, offset } => {
                Value::Int(self.fail_value(parent, env, built)?.as_int()? + offset)
            }
            _ => return Ok(()),
        };
        built[i] = Some(value);
        Ok(())
    }

    fn fail_value(&mut self, arg: &FailArg, env: &[Option<Value>], built: &[Option<Value>]) -> Result<Value> {
        match arg {
            FailArg::Box(r) => self.value(&Operand::Op(*r), env),
            FailArg::Const(c) => Ok(self.const_value(c)),
            FailArg::Virtual(i) => built
                .get(*i)
                .copied()
                .flatten()
                .ok_or_else(|| Error::execution(format!("virtual {} was not rebuilt", i))),
        }
    }

    /// What the optimizer may assume about a value it saw at runtime
    pub fn runtime_value(&self, value: &Value) -> RuntimeValue {
        match *value {
            Value::Int(v) => RuntimeValue::Int(v),
            Value::Float(v) => RuntimeValue::Float(v),
            Value::Ref(None) => RuntimeValue::Null,
            Value::Ref(Some(id)) => match self.heap.get(id) {
                Ok(Object::Struct { class, .. }) => RuntimeValue::Object { class: *class },
                Ok(_) => RuntimeValue::Object { class: None },
                Err(_) => RuntimeValue::Unknown,
            },
        }
    }

    // ========== Rendering ==========

    /// Deep rendering of a value; objects are numbered in visiting order so
    /// shared and cyclic structure shows up the same way in every run
    pub fn render(&self, value: &Value) -> String {
        let mut seen = HashMap::default();
        let mut out = String::new();
        self.render_into(*value, &mut seen, &mut out);
        out
    }

    /// Render several values with one numbering
    pub fn render_values(&self, values: &[Value]) -> String {
        let mut seen = HashMap::default();
        let mut parts = Vec::with_capacity(values.len());
        for &v in values {
            let mut out = String::new();
            self.render_into(v, &mut seen, &mut out);
            parts.push(out);
        }
        parts.join(", ")
    }

    fn render_into(&self, value: Value, seen: &mut HashMap<ObjId, usize>, out: &mut String) {
        let id = match value {
            Value::Int(v) => {
                let _ = write!(out, "{}", v);
                return;
            }
            Value::Float(v) => {
                let _ = write!(out, "{:?}", v);
                return;
            }
            Value::Ref(None) => {
                out.push_str("NULL");
                return;
            }
            Value::Ref(Some(id)) => id,
        };
        let Ok(object) = self.heap.get(id) else {
            out.push_str("<dangling>");
            return;
        };
        if let Object::Str { mode, chars } = object {
            let s = StrConst::from_chars(*mode, chars.clone());
            if *mode == StrMode::Unicode {
                out.push('u');
            }
            let _ = write!(out, "{:?}", s.to_text());
            return;
        }
        if let Some(n) = seen.get(&id) {
            let _ = write!(out, "@{}", n);
            return;
        }
        let n = seen.len();
        seen.insert(id, n);
        let _ = write!(out, "@{} ", n);
        match object {
            Object::Struct { descr, fields, .. } => {
                let layout = self.descrs.size(*descr).map(|s| s.fields.clone()).unwrap_or_default();
                let _ = write!(out, "{}{{", self.descrs.name(*descr));
                for (k, field) in layout.iter().enumerate() {
                    if k > 0 {
                        out.push_str(", ");
                    }
                    let name = self
                        .descrs
                        .field(*field)
                        .and_then(|f| f.name.rsplit('.').next())
                        .unwrap_or("?");
                    let _ = write!(out, "{}=", name);
                    let v = fields.get(field).copied().unwrap_or_else(|| self.default_for(*field));
                    self.render_into(v, seen, out);
                }
                out.push('}');
            }
            Object::Array { descr, items } => {
                let _ = write!(out, "{}[", self.descrs.name(*descr));
                for (k, &v) in items.iter().enumerate() {
                    if k > 0 {
                        out.push_str(", ");
                    }
                    self.render_into(v, seen, out);
                }
                out.push(']');
            }
            Object::ArrayStruct { descr, items } => {
                let interior = self.descrs.array(*descr).map(|a| a.interior.clone()).unwrap_or_default();
                let _ = write!(out, "{}[", self.descrs.name(*descr));
                for (k, item) in items.iter().enumerate() {
                    if k > 0 {
                        out.push_str(", ");
                    }
                    out.push('{');
                    for (j, field) in interior.iter().enumerate() {
                        if j > 0 {
                            out.push_str(", ");
                        }
                        let v = item.get(field).copied().unwrap_or_else(|| self.default_for(*field));
                        self.render_into(v, seen, out);
                    }
                    out.push('}');
                }
                out.push(']');
            }
            Object::Str { .. } => {}
        }
    }
}

fn is_heap_read(opcode: OpCode) -> bool {
    use OpCode::*;
    matches!(
        opcode,
        GetfieldGc
            | GetarrayitemGc
            | GetinteriorfieldGc
            | ArraylenGc
            | Strlen
            | Strgetitem
            | Unicodelen
            | Unicodegetitem
            | GetarrayitemRaw
            | RawLoad
    )
}

fn str_mode_of(opcode: OpCode) -> StrMode {
    match opcode.is_str_mode() {
        Some(false) => StrMode::Unicode,
        _ => StrMode::Str,
    }
}

/// A primitive value as a constant, for the shared evaluator
fn pure_const(value: &Value) -> Result<Const> {
    match value {
        Value::Int(v) => Ok(Const::Int(*v)),
        Value::Float(v) => Ok(Const::float(*v)),
        Value::Ref(None) => Ok(Const::null()),
        Value::Ref(Some(_)) => Err(Error::execution("object passed to an integer operation")),
    }
}

fn array_slot<T>(items: &[T], index: i64) -> Result<&T> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .ok_or_else(|| Error::execution(format!("array index {} out of range", index)))
}

fn array_slot_mut<T>(items: &mut [T], index: i64) -> Result<&mut T> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get_mut(i))
        .ok_or_else(|| Error::execution(format!("array index {} out of range", index)))
}

fn char_range(chars: &[u32], start: i64, length: i64) -> Result<&[u32]> {
    let start = usize::try_from(start).map_err(|_| Error::execution("negative string offset"))?;
    let length = usize::try_from(length).map_err(|_| Error::execution("negative string length"))?;
    chars
        .get(start..start + length)
        .ok_or_else(|| Error::execution("string range out of bounds"))
}

fn leaf_parts(v: &VirtualDescr) -> Vec<&FailArg> {
    match v {
        VirtualDescr::StrConcat { left, right, .. } => vec![left, right],
        VirtualDescr::StrSlice { s, start, length, .. } => vec![s, start, length],
        VirtualDescr::RawSlice { parent, .. } => vec![parent],
        _ => Vec::new(),
    }
}
