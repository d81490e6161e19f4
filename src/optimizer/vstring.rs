//! Virtual strings
//!
//! Strings built inside the trace (`newstr` plus `strsetitem`, and the
//! results of the concat and slice helpers) stay virtual until something
//! needs the real object. Reads of their length or characters are answered
//! from the virtual description. Calls to the string comparison helpers are
//! lowered to cheaper specialized helpers or plain integer operations when
//! the shape of the arguments allows it.
//!
//! Forcing a virtual string allocates it with `newstr` and fills it with
//! `strsetitem` or `copystrcontent`; short copies are unrolled into single
//! character operations. A virtual whose every leaf is a constant becomes a
//! constant string instead.

use super::{Flow, Optimizer, Pass};
use crate::error::{Error, Result};
use crate::info::{Info, PtrInfo, StrInfo, VString};
use crate::intbound::IntBound;
use crate::ir::eval::eval_str_helper;
use crate::ir::{Const, Op, OopSpec, OpCode, OpRef, Operand, RefConst, StrConst, StrMode, Type};
use tracing::debug;

/// Opcodes of one string mode
struct StrOps {
    newstr: OpCode,
    strlen: OpCode,
    getitem: OpCode,
    setitem: OpCode,
    copy: OpCode,
}

impl StrOps {
    fn of(mode: StrMode) -> Self {
        use OpCode::*;
        match mode {
            StrMode::Str => StrOps {
                newstr: Newstr,
                strlen: Strlen,
                getitem: Strgetitem,
                setitem: Strsetitem,
                copy: Copystrcontent,
            },
            StrMode::Unicode => StrOps {
                newstr: Newunicode,
                strlen: Unicodelen,
                getitem: Unicodegetitem,
                setitem: Unicodesetitem,
                copy: Copyunicodecontent,
            },
        }
    }
}

/// Where helper operations created by this pass go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NewOps {
    /// Answer from known facts only
    Forbid,
    /// Through the passes after this one
    Chain,
    /// Straight to the output, used while forcing
    Direct,
}

impl NewOps {
    fn after(self) -> Option<Pass> {
        match self {
            NewOps::Chain => Some(Pass::String),
            NewOps::Forbid | NewOps::Direct => None,
        }
    }
}

impl Optimizer {
    pub(crate) fn optimize_string(&mut self, r: OpRef) -> Result<Flow> {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        let Some(is_str) = opcode.is_str_mode() else {
            return match opcode {
                Call | CallPure => self.optimize_string_call(r),
                _ => Ok(Flow::Emit(r)),
            };
        };
        let mode = if is_str { StrMode::Str } else { StrMode::Unicode };
        match opcode {
            Newstr | Newunicode => self.optimize_newstr(r, mode),
            Strlen | Unicodelen => {
                let s = self.arg(r, 0);
                let sink = if self.is_virtual(&s) {
                    NewOps::Chain
                } else {
                    NewOps::Forbid
                };
                match self.string_length(&s, mode, sink)? {
                    Some(len) => self.replace_with(r, &len),
                    None => Ok(Flow::Emit(r)),
                }
            }
            Strgetitem | Unicodegetitem => {
                let (s, index) = (self.arg(r, 0), self.arg(r, 1));
                if !self.is_virtual(&s) {
                    return Ok(Flow::Emit(r));
                }
                match self.strgetitem(&s, &index, mode, NewOps::Chain)? {
                    Some(c) => self.replace_with(r, &c),
                    None => Ok(Flow::Emit(r)),
                }
            }
            Strsetitem | Unicodesetitem => {
                let (s, index, value) = (self.arg(r, 0), self.arg(r, 1), self.arg(r, 2));
                match self.get_constant_int(&index) {
                    Some(i) if self.set_plain_char(&s, i, value)? => Ok(Flow::Done),
                    _ => Ok(Flow::Emit(r)),
                }
            }
            _ => self.optimize_copystrcontent(r, mode),
        }
    }

    fn optimize_newstr(&mut self, r: OpRef, mode: StrMode) -> Result<Flow> {
        let len = self.arg(r, 0);
        match self.get_constant_int(&len) {
            Some(n) if n >= 0 && n as usize <= self.config().max_const_string_len => {
                self.new_vstring(r, mode, VString::Plain(vec![None; n as usize]));
                Ok(Flow::Done)
            }
            _ => {
                let mut lenbound = IntBound::nonnegative();
                lenbound.intersect(&self.getintbound(&len))?;
                self.set_info(
                    r,
                    Info::Ptr(PtrInfo::Str(StrInfo {
                        mode,
                        lenbound: Some(lenbound),
                        len_box: Some(len.clone()),
                        last_guard: None,
                        virt: None,
                    })),
                );
                self.record_pure(StrOps::of(mode).strlen, vec![Operand::Op(r)], len);
                Ok(Flow::Emit(r))
            }
        }
    }

    fn optimize_copystrcontent(&mut self, r: OpRef, mode: StrMode) -> Result<Flow> {
        let args: Vec<Operand> = (0..5).map(|i| self.arg(r, i)).collect();
        let [src, dst, srcstart, dststart, length] = <[Operand; 5]>::try_from(args)
            .map_err(|_| Error::internal("copystrcontent needs five arguments"))?;
        let n = self.get_constant_int(&length);
        if n == Some(0) {
            return Ok(Flow::Done);
        }
        let src_known = src.is_const() || self.is_virtual(&src);
        let dst_plain = matches!(self.virtual_string(&dst), Some(VString::Plain(_)));
        let consts = (
            self.get_constant_int(&srcstart),
            self.get_constant_int(&dststart),
            n,
        );
        if let (true, (Some(ss), Some(ds), Some(n))) = (src_known, consts) {
            if (n as usize) < self.config().copy_unroll_limit || dst_plain {
                for i in 0..n {
                    let c = self.strgetitem_or_emit(&src, &Operand::int(ss + i), mode, NewOps::Chain)?;
                    if !(dst_plain && self.set_plain_char(&dst, ds + i, c.clone())?) {
                        let set = Op::void(
                            StrOps::of(mode).setitem,
                            vec![dst.clone(), Operand::int(ds + i), c],
                        );
                        self.emit_new(Some(Pass::String), set)?;
                    }
                }
                return Ok(Flow::Done);
            }
        }
        self.copy_str_content(&src, &dst, &srcstart, &dststart, &length, mode, NewOps::Chain, false)?;
        Ok(Flow::Done)
    }

    // ========== Helper calls ==========

    fn optimize_string_call(&mut self, r: OpRef) -> Result<Flow> {
        use OopSpec::*;
        let Some(spec) = self.effect_of(r).and_then(|e| e.oopspec) else {
            return Ok(Flow::Emit(r));
        };
        if spec.str_mode().is_some() || spec == Str2Unicode {
            if let Some(value) = self.const_args(r).and_then(|args| eval_str_helper(spec, &args)) {
                self.stats_mut().constant_folds += 1;
                return self.replace_with(r, &Operand::Const(value));
            }
        }
        let args: Vec<Operand> = (0..self.op(r).args.len()).map(|i| self.arg(r, i)).collect();
        match (spec, args.as_slice()) {
            (StrConcat(mode), [left, right]) => {
                let virt = VString::Concat {
                    left: left.clone(),
                    right: right.clone(),
                };
                self.new_vstring(r, mode, virt);
                Ok(Flow::Done)
            }
            (StrSlice(mode), [s, start, stop]) => self.optimize_slice(r, mode, s, start, stop),
            (StrEqual(mode), [a, b]) => self.optimize_str_equal(r, mode, a, b),
            (StrCmp(mode), [a, b]) => {
                let one = |len: Option<Operand>| len.and_then(|l| l.const_int()) == Some(1);
                let la = self.string_length(a, mode, NewOps::Forbid)?;
                let lb = self.string_length(b, mode, NewOps::Forbid)?;
                if one(la) && one(lb) {
                    let ca = self.strgetitem_or_emit(a, &Operand::int(0), mode, NewOps::Chain)?;
                    let cb = self.strgetitem_or_emit(b, &Operand::int(0), mode, NewOps::Chain)?;
                    let diff = self.send_new(Op::new(OpCode::IntSub, Type::Int, vec![ca, cb]))?;
                    return self.replace_with(r, &diff);
                }
                Ok(Flow::Emit(r))
            }
            (ShrinkArray(mode), [s, newlen]) => {
                let n = self.get_constant_int(newlen);
                if let (Some(VString::Plain(chars)), Some(n)) = (self.virtual_string(s), n) {
                    if n >= 0 && n as usize <= chars.len() {
                        let chars = chars[..n as usize].to_vec();
                        self.new_vstring(r, mode, VString::Plain(chars));
                        return Ok(Flow::Done);
                    }
                }
                Ok(Flow::Emit(r))
            }
            _ => Ok(Flow::Emit(r)),
        }
    }

    fn optimize_slice(
        &mut self,
        r: OpRef,
        mode: StrMode,
        s: &Operand,
        start: &Operand,
        stop: &Operand,
    ) -> Result<Flow> {
        let bounds = (self.get_constant_int(start), self.get_constant_int(stop));
        if let (Some(VString::Plain(chars)), (Some(i), Some(j))) = (self.virtual_string(s), bounds)
        {
            if 0 <= i && i <= j && j as usize <= chars.len() {
                let chars = chars[i as usize..j as usize].to_vec();
                self.new_vstring(r, mode, VString::Plain(chars));
                return Ok(Flow::Done);
            }
        }
        let length = self.int_sub_operand(stop, start, NewOps::Chain)?;
        let (mut parent, mut start) = (s.clone(), start.clone());
        // slice of a slice reads straight from the outer string
        if let Some(VString::Slice { s: outer, start: first, .. }) = self.virtual_string(&parent) {
            start = self.int_add_operand(&first, &start, NewOps::Chain)?;
            parent = outer;
        }
        self.new_vstring(
            r,
            mode,
            VString::Slice {
                s: parent,
                start,
                length,
            },
        );
        Ok(Flow::Done)
    }

    fn optimize_str_equal(
        &mut self,
        r: OpRef,
        mode: StrMode,
        a: &Operand,
        b: &Operand,
    ) -> Result<Flow> {
        if let (Some(x), Some(y)) = (self.constant_chars(a), self.constant_chars(b)) {
            return self.replace_with(r, &Operand::int(i64::from(x == y)));
        }
        let la = self.string_length(a, mode, NewOps::Forbid)?;
        let lb = self.string_length(b, mode, NewOps::Forbid)?;
        if let (Some(x), Some(y)) = (
            la.as_ref().and_then(Operand::const_int),
            lb.as_ref().and_then(Operand::const_int),
        ) {
            if x != y {
                return self.replace_with(r, &Operand::int(0));
            }
        }
        for (x, y) in [(a, b), (b, a)] {
            if let Some(flow) = self.str_equal_against_known(r, mode, x, y)? {
                return Ok(flow);
            }
        }
        for (x, y) in [(a, b), (b, a)] {
            if let Some(flow) = self.str_equal_against_char(r, mode, x, y)? {
                return Ok(flow);
            }
        }
        if self.is_nonnull(a) && self.is_nonnull(b) {
            let spec = match (la, lb) {
                (Some(x), Some(y)) if x == y => OopSpec::StrEqualLengthok(mode),
                _ => OopSpec::StrEqualNonnull(mode),
            };
            return self.modified_call(r, spec, vec![a.clone(), b.clone()]);
        }
        Ok(Flow::Emit(r))
    }

    /// `x == y` where `y` is empty, one character long or null
    fn str_equal_against_known(
        &mut self,
        r: OpRef,
        mode: StrMode,
        x: &Operand,
        y: &Operand,
    ) -> Result<Option<Flow>> {
        let ly = self.string_length(y, mode, NewOps::Forbid)?;
        match ly.as_ref().and_then(Operand::const_int) {
            Some(0) if self.is_nonnull(x) => {
                let lx = self.string_length_or_emit(x, mode, NewOps::Chain)?;
                let eq = self.send_new(Op::new(OpCode::IntEq, Type::Int, vec![lx, Operand::int(0)]))?;
                return self.replace_with(r, &eq).map(Some);
            }
            Some(1) => {
                let lx = self.string_length(x, mode, NewOps::Forbid)?;
                if lx.and_then(|l| l.const_int()) == Some(1) {
                    let cx = self.strgetitem_or_emit(x, &Operand::int(0), mode, NewOps::Chain)?;
                    let cy = self.strgetitem_or_emit(y, &Operand::int(0), mode, NewOps::Chain)?;
                    let eq = self.send_new(Op::new(OpCode::IntEq, Type::Int, vec![cx, cy]))?;
                    return self.replace_with(r, &eq).map(Some);
                }
                if let Some(VString::Slice { s, start, length }) = self.virtual_string(x) {
                    let cy = self.strgetitem_or_emit(y, &Operand::int(0), mode, NewOps::Chain)?;
                    let args = vec![s, start, length, cy];
                    return self
                        .modified_call(r, OopSpec::StrEqualSliceChar(mode), args)
                        .map(Some);
                }
            }
            _ => {}
        }
        if self.nullness(y) == crate::info::Nullness::Null {
            if self.is_nonnull(x) {
                return self.replace_with(r, &Operand::int(0)).map(Some);
            }
            if self.nullness(x) == crate::info::Nullness::Null {
                return self.replace_with(r, &Operand::int(1)).map(Some);
            }
            let op = self.op_mut(r);
            op.opcode = OpCode::PtrEq;
            op.ty = Type::Int;
            op.args = vec![x.clone(), Operand::null()];
            op.descr = None;
            return Ok(Some(Flow::Emit(r)));
        }
        Ok(None)
    }

    /// `x == y` where `y` is a single character or `x` a virtual slice
    fn str_equal_against_char(
        &mut self,
        r: OpRef,
        mode: StrMode,
        x: &Operand,
        y: &Operand,
    ) -> Result<Option<Flow>> {
        let ly = self.string_length(y, mode, NewOps::Forbid)?;
        if ly.and_then(|l| self.get_constant_int(&l)) == Some(1) {
            let cy = self.strgetitem_or_emit(y, &Operand::int(0), mode, NewOps::Chain)?;
            let spec = if self.is_nonnull(x) {
                OopSpec::StrEqualNonnullChar(mode)
            } else {
                OopSpec::StrEqualChecknullChar(mode)
            };
            return self.modified_call(r, spec, vec![x.clone(), cy]).map(Some);
        }
        if let Some(VString::Slice { s, start, length }) = self.virtual_string(x) {
            let spec = if self.is_nonnull(y) {
                OopSpec::StrEqualSliceNonnull(mode)
            } else {
                OopSpec::StrEqualSliceChecknull(mode)
            };
            return self
                .modified_call(r, spec, vec![s, start, length, y.clone()])
                .map(Some);
        }
        Ok(None)
    }

    /// Redirect the call `r` to a specialized helper
    fn modified_call(&mut self, r: OpRef, spec: OopSpec, args: Vec<Operand>) -> Result<Flow> {
        let Some(descr) = self.descrs.helper(spec) else {
            return Ok(Flow::Emit(r));
        };
        debug!(helper = %spec.name(), result = r.0, "lowered string comparison");
        let op = self.op_mut(r);
        op.args = args;
        op.descr = Some(descr);
        Ok(Flow::Emit(r))
    }

    // ========== Queries ==========

    fn virtual_string(&self, s: &Operand) -> Option<VString> {
        match self.getptrinfo(s)? {
            PtrInfo::Str(StrInfo { virt: Some(v), .. }) => Some(v.clone()),
            _ => None,
        }
    }

    fn is_nonnull(&self, s: &Operand) -> bool {
        self.nullness(s) == crate::info::Nullness::NonNull
    }

    fn new_vstring(&mut self, r: OpRef, mode: StrMode, virt: VString) {
        let len_box = match &virt {
            VString::Plain(chars) => Some(Operand::int(chars.len() as i64)),
            VString::Slice { length, .. } => Some(length.clone()),
            VString::Concat { .. } => None,
        };
        let lenbound = len_box
            .as_ref()
            .and_then(Operand::const_int)
            .map(IntBound::from_constant);
        self.set_info(
            r,
            Info::Ptr(PtrInfo::Str(StrInfo {
                mode,
                lenbound,
                len_box,
                last_guard: None,
                virt: Some(virt),
            })),
        );
    }

    fn set_plain_char(&mut self, s: &Operand, index: i64, value: Operand) -> Result<bool> {
        let Some(PtrInfo::Str(StrInfo {
            virt: Some(VString::Plain(chars)),
            ..
        })) = self.getptrinfo_mut(s)
        else {
            return Ok(false);
        };
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| chars.get_mut(i))
            .ok_or_else(|| Error::invalid_loop(format!("string index {} out of range", index)))?;
        *slot = Some(value);
        Ok(true)
    }

    /// Length of a string, from its description when it is virtual
    fn string_length(&mut self, s: &Operand, mode: StrMode, sink: NewOps) -> Result<Option<Operand>> {
        let s = self.resolve(s);
        if let Operand::Const(c) = &s {
            return Ok(c.as_str().map(|c| Operand::int(c.len() as i64)));
        }
        let info = match self.getptrinfo(&s) {
            Some(PtrInfo::Str(info)) => Some(info.clone()),
            _ => None,
        };
        match info.as_ref().and_then(|i| i.virt.as_ref()) {
            Some(VString::Plain(chars)) => return Ok(Some(Operand::int(chars.len() as i64))),
            Some(VString::Slice { length, .. }) => return Ok(Some(self.resolve(length))),
            Some(VString::Concat { left, right }) => {
                let l = self.string_length(left, mode, sink)?;
                let rl = self.string_length(right, mode, sink)?;
                return match (l, rl) {
                    (Some(l), Some(rl)) if sink != NewOps::Forbid || (l.is_const() && rl.is_const()) => {
                        self.int_add_operand(&l, &rl, sink).map(Some)
                    }
                    _ => Ok(None),
                };
            }
            None => {}
        }
        if let Some(len_box) = info.and_then(|i| i.len_box) {
            return Ok(Some(self.resolve(&len_box)));
        }
        if sink == NewOps::Forbid {
            return Ok(None);
        }
        let len = Op::new(StrOps::of(mode).strlen, Type::Int, vec![s]);
        self.emit_new(sink.after(), len).map(Some)
    }

    fn string_length_or_emit(&mut self, s: &Operand, mode: StrMode, sink: NewOps) -> Result<Operand> {
        self.string_length(s, mode, sink)?
            .ok_or_else(|| Error::internal("string length not available"))
    }

    /// Character `index` of a string, looking through virtual slices and
    /// concatenations
    fn strgetitem(
        &mut self,
        s: &Operand,
        index: &Operand,
        mode: StrMode,
        sink: NewOps,
    ) -> Result<Option<Operand>> {
        let s = self.resolve(s);
        let index = self.resolve(index);
        let at = self.get_constant_int(&index);
        if let (Some(c), Some(i)) = (s.as_const().and_then(Const::as_str), at) {
            if let Some(&ch) = usize::try_from(i).ok().and_then(|i| c.chars.get(i)) {
                return Ok(Some(Operand::int(ch as i64)));
            }
        }
        match self.virtual_string(&s) {
            Some(VString::Plain(chars)) => {
                let known = at
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| chars.get(i).cloned().flatten());
                if known.is_some() {
                    return Ok(known);
                }
            }
            Some(VString::Slice { s: parent, start, .. }) => {
                let foldable = at.is_some() && self.get_constant_int(&start).is_some();
                if foldable || sink != NewOps::Forbid {
                    let full = self.int_add_operand(&start, &index, sink)?;
                    return self.strgetitem(&parent, &full, mode, sink);
                }
            }
            Some(VString::Concat { left, right }) => {
                let left_len = self
                    .string_length(&left, mode, NewOps::Forbid)?
                    .and_then(|l| l.const_int());
                if let (Some(i), Some(l)) = (at, left_len) {
                    return if i < l {
                        self.strgetitem(&left, &Operand::int(i), mode, sink)
                    } else {
                        self.strgetitem(&right, &Operand::int(i - l), mode, sink)
                    };
                }
            }
            None => {}
        }
        if sink == NewOps::Forbid {
            return Ok(None);
        }
        let get = Op::new(StrOps::of(mode).getitem, Type::Int, vec![s, index]);
        self.emit_new(sink.after(), get).map(Some)
    }

    fn strgetitem_or_emit(
        &mut self,
        s: &Operand,
        index: &Operand,
        mode: StrMode,
        sink: NewOps,
    ) -> Result<Operand> {
        self.strgetitem(s, index, mode, sink)?
            .ok_or_else(|| Error::internal("string character not available"))
    }

    /// Characters of a string whose every leaf is a constant
    fn constant_chars(&self, s: &Operand) -> Option<Vec<u32>> {
        if let Operand::Const(c) = self.resolve(s) {
            return c.as_str().map(|c| c.chars.to_vec());
        }
        match self.virtual_string(s)? {
            VString::Plain(chars) => chars
                .iter()
                .map(|c| {
                    let v = self.get_constant_int(c.as_ref()?)?;
                    u32::try_from(v).ok()
                })
                .collect(),
            VString::Slice { s, start, length } => {
                let all = self.constant_chars(&s)?;
                let start = usize::try_from(self.get_constant_int(&start)?).ok()?;
                let length = usize::try_from(self.get_constant_int(&length)?).ok()?;
                Some(all.get(start..start.checked_add(length)?)?.to_vec())
            }
            VString::Concat { left, right } => {
                let mut chars = self.constant_chars(&left)?;
                chars.extend(self.constant_chars(&right)?);
                Some(chars)
            }
        }
    }

    // ========== Integer helpers ==========

    fn int_add_operand(&mut self, a: &Operand, b: &Operand, sink: NewOps) -> Result<Operand> {
        match (self.get_constant_int(a), self.get_constant_int(b)) {
            (Some(x), Some(y)) => Ok(Operand::int(x.wrapping_add(y))),
            (_, Some(0)) => Ok(self.resolve(a)),
            (Some(0), _) => Ok(self.resolve(b)),
            _ => {
                let add = Op::new(OpCode::IntAdd, Type::Int, vec![a.clone(), b.clone()]);
                self.emit_new(sink.after(), add)
            }
        }
    }

    fn int_sub_operand(&mut self, a: &Operand, b: &Operand, sink: NewOps) -> Result<Operand> {
        match (self.get_constant_int(a), self.get_constant_int(b)) {
            (Some(x), Some(y)) => Ok(Operand::int(x.wrapping_sub(y))),
            (_, Some(0)) => Ok(self.resolve(a)),
            _ => {
                let sub = Op::new(OpCode::IntSub, Type::Int, vec![a.clone(), b.clone()]);
                self.emit_new(sink.after(), sub)
            }
        }
    }

    /// Allocate `op` and run it through the whole chain
    fn send_new(&mut self, op: Op) -> Result<Operand> {
        let r = self.new_op(op);
        self.send_extra_operation(r)?;
        Ok(self.resolve(&Operand::Op(r)))
    }

    // ========== Forcing ==========

    /// Materialize the virtual string `r`
    pub(crate) fn force_vstring(&mut self, r: OpRef, s: StrInfo) -> Result<()> {
        let Some(virt) = s.virt.clone() else {
            return Ok(());
        };
        let mode = s.mode;
        if let Some(chars) = self.constant_chars(&Operand::Op(r)) {
            if chars.len() <= self.config().max_const_string_len {
                debug!(result = r.0, len = chars.len(), "virtual string is a constant");
                self.set_info(r, Info::Ptr(PtrInfo::nonnull()));
                let c = Const::Ref(RefConst::Str(StrConst::from_chars(mode, chars)));
                return self.make_constant(r, c);
            }
        }
        let ops = StrOps::of(mode);
        let target = Operand::Op(r);
        let mut part_lengths = None;
        let length = match &virt {
            VString::Plain(chars) => Operand::int(chars.len() as i64),
            VString::Slice { length, .. } => self.resolve(length),
            VString::Concat { left, right } => {
                let l = self.string_length_or_emit(left, mode, NewOps::Direct)?;
                let rl = self.string_length_or_emit(right, mode, NewOps::Direct)?;
                let total = self.int_add_operand(&l, &rl, NewOps::Direct)?;
                part_lengths = Some((l, rl));
                total
            }
        };
        let mut lenbound = IntBound::nonnegative();
        lenbound.intersect(&self.getintbound(&length))?;
        self.set_info(
            r,
            Info::Ptr(PtrInfo::Str(StrInfo {
                mode,
                lenbound: Some(lenbound),
                len_box: Some(length.clone()),
                last_guard: None,
                virt: None,
            })),
        );
        self.materialize(r, ops.newstr, Type::Ref, vec![length], None)?;
        match (virt, part_lengths) {
            (VString::Concat { left, right }, Some((l, rl))) => {
                let offset = self.copy_part(&left, &target, Operand::int(0), Some(l), mode, true)?;
                self.copy_part(&right, &target, offset, Some(rl), mode, false)?;
            }
            (VString::Slice { s, start, length }, _) => {
                let zero = Operand::int(0);
                self.copy_str_content(&s, &target, &start, &zero, &length, mode, NewOps::Direct, false)?;
            }
            (virt, _) => {
                self.copy_string_parts(&virt, &target, Operand::int(0), mode, false)?;
            }
        }
        Ok(())
    }

    /// Copy one operand of a concatenation into `target` at `offset`
    fn copy_part(
        &mut self,
        src: &Operand,
        target: &Operand,
        offset: Operand,
        length: Option<Operand>,
        mode: StrMode,
        need_next: bool,
    ) -> Result<Operand> {
        if let Some(virt) = self.virtual_string(src) {
            return self.copy_string_parts(&virt, target, offset, mode, need_next);
        }
        let zero = Operand::int(0);
        let length = match length {
            Some(length) => length,
            None => self.string_length_or_emit(src, mode, NewOps::Direct)?,
        };
        self.copy_str_content(src, target, &zero, &offset, &length, mode, NewOps::Direct, need_next)
    }

    /// Write the contents of a virtual string into `target` at `offset`;
    /// returns the offset after it
    fn copy_string_parts(
        &mut self,
        virt: &VString,
        target: &Operand,
        mut offset: Operand,
        mode: StrMode,
        need_next: bool,
    ) -> Result<Operand> {
        match virt {
            VString::Plain(chars) => {
                for c in chars {
                    if let Some(c) = c {
                        let set = Op::void(
                            StrOps::of(mode).setitem,
                            vec![target.clone(), offset.clone(), c.clone()],
                        );
                        self.emit_new(None, set)?;
                    }
                    offset = self.int_add_operand(&offset, &Operand::int(1), NewOps::Direct)?;
                }
                Ok(offset)
            }
            VString::Concat { left, right } => {
                let offset = self.copy_part(left, target, offset, None, mode, true)?;
                self.copy_part(right, target, offset, None, mode, need_next)
            }
            VString::Slice { s, start, length } => self.copy_str_content(
                s,
                target,
                start,
                &offset,
                length,
                mode,
                NewOps::Direct,
                need_next,
            ),
        }
    }

    /// Copy `length` characters; short copies become single character
    /// operations. Returns the offset after the copied range when
    /// `need_next` is set.
    #[allow(clippy::too_many_arguments)]
    fn copy_str_content(
        &mut self,
        src: &Operand,
        target: &Operand,
        srcoffset: &Operand,
        offset: &Operand,
        length: &Operand,
        mode: StrMode,
        sink: NewOps,
        need_next: bool,
    ) -> Result<Operand> {
        let ops = StrOps::of(mode);
        let src = self.resolve(src);
        let inline_limit = if src.is_const() && self.get_constant_int(srcoffset).is_some() {
            5
        } else {
            2
        };
        let (mut srcoffset, mut offset) = (self.resolve(srcoffset), self.resolve(offset));
        if let Some(n) = self.get_constant_int(length).filter(|&n| n <= inline_limit) {
            for _ in 0..n {
                let c = self.strgetitem_or_emit(&src, &srcoffset, mode, sink)?;
                let set = Op::void(ops.setitem, vec![target.clone(), offset.clone(), c]);
                self.emit_new(sink.after(), set)?;
                srcoffset = self.int_add_operand(&srcoffset, &Operand::int(1), sink)?;
                offset = self.int_add_operand(&offset, &Operand::int(1), sink)?;
            }
            return Ok(offset);
        }
        let next = if need_next {
            self.int_add_operand(&offset, length, sink)?
        } else {
            offset.clone()
        };
        let copy = Op::void(
            ops.copy,
            vec![src, target.clone(), srcoffset, offset, self.resolve(length)],
        );
        self.emit_new(sink.after(), copy)?;
        Ok(next)
    }
}
