//! Trace optimizer
//!
//! The optimizer makes a single forward sweep over a recorded trace. Every
//! operation is fed through a fixed chain of passes:
//!
//! | Pass | Module | Job |
//! |------|--------|-----|
//! | rewrite | [`rewrite`] | algebraic identities, guard strength reduction |
//! | intbounds | [`intbounds`] | integer ranges and known bits |
//! | virtualize | [`virtualize`] | escape analysis, virtual objects |
//! | string | [`vstring`] | virtual strings, string helper calls |
//! | earlyforce | [`earlyforce`] | materialize virtuals before opaque uses |
//! | pure | [`pure`] | hash-consing of side-effect-free operations |
//! | heap | [`heap`] | field and array caches, lazy writes |
//!
//! A pass either passes the operation on (possibly rewritten) or consumes
//! it. After the rest of the chain has handled an operation, every pass that
//! passed it on gets a postprocess call, used to record facts about the
//! emitted result. The last stage appends operations to the output and
//! attaches recovery data to guards.

pub mod earlyforce;
pub mod heap;
pub mod intbounds;
pub mod pure;
pub mod rewrite;
pub mod virtualize;
pub mod vstring;

use crate::error::{Error, Result};
use crate::info::{Forwarding, Info, Nullness, PtrInfo};
use crate::intbound::IntBound;
use crate::ir::{
    CallPureKey, Const, DescrRef, DescrTable, EffectInfo, Op, OpCode, OpRef, Operand, RefConst,
    Trace, Type,
};
use crate::resume::{PendingField, ResumeBuilder, ResumeDescr, VirtualSource};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, info, trace};

/// One optimization pass, in chain order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pass {
    Rewrite,
    IntBounds,
    Virtualize,
    String,
    EarlyForce,
    Pure,
    Heap,
}

impl Pass {
    pub const ALL: [Pass; 7] = [
        Pass::Rewrite,
        Pass::IntBounds,
        Pass::Virtualize,
        Pass::String,
        Pass::EarlyForce,
        Pass::Pure,
        Pass::Heap,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pass::Rewrite => "rewrite",
            Pass::IntBounds => "intbounds",
            Pass::Virtualize => "virtualize",
            Pass::String => "string",
            Pass::EarlyForce => "earlyforce",
            Pass::Pure => "pure",
            Pass::Heap => "heap",
        }
    }
}

impl FromStr for Pass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Pass::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s.trim())
            .ok_or_else(|| Error::unsupported(format!("unknown optimization pass '{}'", s)))
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for the trace optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Enabled passes; the chain always runs them in canonical order
    pub passes: Vec<Pass>,
    /// Peel loops that end in a jump
    pub unroll: bool,
    /// Capacity of one guard's recovery data
    pub max_resume_entries: usize,
    /// Longest string kept as a plain virtual
    pub max_const_string_len: usize,
    /// Copies shorter than this are unrolled into per-character operations
    pub copy_unroll_limit: usize,
    /// Retraces allowed per loop before bridges fall back to the preamble
    pub retrace_limit: u32,
    /// Most guards a bridge may add to match a loop's virtual state
    pub max_retrace_guards: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            passes: Pass::ALL.to_vec(),
            unroll: true,
            max_resume_entries: 8192,
            max_const_string_len: 100,
            copy_unroll_limit: 20,
            retrace_limit: 5,
            max_retrace_guards: 15,
        }
    }
}

impl OptimizerConfig {
    pub fn has_pass(&self, pass: Pass) -> bool {
        self.passes.contains(&pass)
    }

    /// Enabled passes in canonical order
    pub fn chain(&self) -> Vec<Pass> {
        Pass::ALL
            .iter()
            .copied()
            .filter(|p| self.has_pass(*p))
            .collect()
    }
}

/// Counters collected while optimizing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptStats {
    pub input_ops: usize,
    pub emitted_ops: usize,
    pub emitted_guards: usize,
    pub removed_guards: usize,
    pub replaced_guards: usize,
    pub constant_folds: usize,
    pub pure_hits: usize,
    pub heap_hits: usize,
    pub forced_virtuals: usize,
    pub short_preamble_ops: usize,
}

impl OptStats {
    /// Add the counters of another run
    pub fn merge(&mut self, other: &OptStats) {
        self.input_ops += other.input_ops;
        self.emitted_ops += other.emitted_ops;
        self.emitted_guards += other.emitted_guards;
        self.removed_guards += other.removed_guards;
        self.replaced_guards += other.replaced_guards;
        self.constant_folds += other.constant_folds;
        self.pure_hits += other.pure_hits;
        self.heap_hits += other.heap_hits;
        self.forced_virtuals += other.forced_virtuals;
        self.short_preamble_ops += other.short_preamble_ops;
    }
}

impl fmt::Display for OptStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops {} -> {}, guards {} kept / {} removed / {} merged, folds {}, pure hits {}, \
             heap hits {}, forced {}, short preamble {}",
            self.input_ops,
            self.emitted_ops,
            self.emitted_guards,
            self.removed_guards,
            self.replaced_guards,
            self.constant_folds,
            self.pure_hits,
            self.heap_hits,
            self.forced_virtuals,
            self.short_preamble_ops
        )
    }
}

/// What a pass decided about an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Pass this operation (possibly a replacement) down the chain
    Emit(OpRef),
    /// The operation was consumed
    Done,
}

/// The trace optimizer
pub struct Optimizer {
    config: OptimizerConfig,
    chain: Vec<Pass>,
    pub(crate) descrs: Rc<DescrTable>,
    pub(crate) arena: Vec<Op>,
    forwarding: Vec<Forwarding>,
    pub(crate) out: Vec<OpRef>,
    pub(crate) inputargs: Vec<OpRef>,
    call_pure_results: HashMap<CallPureKey, Const>,
    pub(crate) quasi_immutable_deps: Vec<(Const, DescrRef)>,
    stats: OptStats,

    /// Fields a heap pass wants recorded on the next guard
    pub(crate) pending_guard_fields: Vec<PendingField>,
    /// New guard -> output position of the weaker guard it replaces
    replaces_guard: HashMap<OpRef, usize>,
    pub(crate) exception_might_have_happened: bool,
    default_fail_args: Vec<Operand>,
    current_origin: OpRef,
    next_guard_id: u32,

    pub(crate) rewrite: rewrite::RewriteState,
    pub(crate) intbounds: intbounds::IntBoundsState,
    pub(crate) virtualize: virtualize::VirtualizeState,
    pub(crate) pure: pure::PureState,
    pub(crate) heap: heap::HeapState,
}

impl Optimizer {
    /// Create a new optimizer with default configuration
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    /// Create an optimizer with custom configuration
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            chain: config.chain(),
            config,
            descrs: Rc::new(DescrTable::new()),
            arena: Vec::new(),
            forwarding: Vec::new(),
            out: Vec::new(),
            inputargs: Vec::new(),
            call_pure_results: HashMap::default(),
            quasi_immutable_deps: Vec::new(),
            stats: OptStats::default(),
            pending_guard_fields: Vec::new(),
            replaces_guard: HashMap::default(),
            exception_might_have_happened: false,
            default_fail_args: Vec::new(),
            current_origin: OpRef(0),
            next_guard_id: 0,
            rewrite: Default::default(),
            intbounds: Default::default(),
            virtualize: Default::default(),
            pure: Default::default(),
            heap: Default::default(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Statistics of the last optimization
    pub fn stats(&self) -> &OptStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut OptStats {
        &mut self.stats
    }

    pub(crate) fn reset_stats(&mut self) {
        self.stats = OptStats::default();
    }

    /// Optimize a trace in one forward sweep, without loop peeling
    pub fn optimize(&mut self, trace: &Trace) -> Result<Trace> {
        self.reset_stats();
        self.start(trace);
        for &r in &trace.ops {
            self.propagate_input(r)?;
        }
        self.flush()?;
        let result = self.finish_trace();
        info!(stats = %self.stats, "optimized trace");
        Ok(result)
    }

    // ========== Run state ==========

    /// Reset all per-run state and load a trace's arena
    pub(crate) fn start(&mut self, trace: &Trace) {
        self.descrs = trace.descrs.clone();
        self.arena = trace.arena.clone();
        self.forwarding = vec![Forwarding::Unresolved; self.arena.len()];
        self.out.clear();
        self.inputargs = trace.inputargs.clone();
        self.call_pure_results = trace.call_pure_results.clone();
        self.quasi_immutable_deps = trace.quasi_immutable_deps.clone();
        self.pending_guard_fields.clear();
        self.replaces_guard.clear();
        self.exception_might_have_happened = false;
        self.default_fail_args = self.inputargs.iter().map(|&r| Operand::Op(r)).collect();
        self.current_origin = OpRef(0);
        self.rewrite = Default::default();
        self.intbounds = Default::default();
        self.virtualize = Default::default();
        self.pure = Default::default();
        self.heap = Default::default();
    }

    /// Feed one recorded operation through the chain
    pub(crate) fn propagate_input(&mut self, r: OpRef) -> Result<()> {
        self.current_origin = r;
        self.stats.input_ops += 1;
        let (is_guard, fail_args) = {
            let op = self.op(r);
            (op.is_guard(), op.fail_args.clone())
        };
        if let Some(fail_args) = fail_args {
            self.default_fail_args = fail_args;
        }
        let kept = self.stats.emitted_guards;
        self.send_extra_operation(r)?;
        if is_guard && self.stats.emitted_guards == kept {
            self.stats.removed_guards += 1;
        }
        Ok(())
    }

    /// Flush everything the passes still hold back
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.chain.contains(&Pass::Heap) {
            self.heap_flush()?;
        }
        Ok(())
    }

    /// Package the emitted operations as a trace
    pub(crate) fn finish_trace(&mut self) -> Trace {
        let mut trace = Trace::new(self.descrs.clone());
        trace.arena = self.arena.clone();
        trace.inputargs = self.inputargs.clone();
        let ops = std::mem::take(&mut self.out);
        let emitted = ops.len();
        trace.ops = remove_unused_ops(&self.arena, ops);
        let removed = emitted - trace.ops.len();
        if removed > 0 {
            debug!(removed, "dropped unused pure operations");
            self.stats.emitted_ops = self.stats.emitted_ops.saturating_sub(removed);
        }
        trace.call_pure_results = self.call_pure_results.clone();
        trace.quasi_immutable_deps = self.quasi_immutable_deps.clone();
        trace
    }

    // ========== Arena ==========

    pub(crate) fn op(&self, r: OpRef) -> &Op {
        &self.arena[r.index()]
    }

    pub(crate) fn op_mut(&mut self, r: OpRef) -> &mut Op {
        &mut self.arena[r.index()]
    }

    /// Allocate a new operation; it is not emitted
    pub(crate) fn new_op(&mut self, op: Op) -> OpRef {
        let r = OpRef(self.arena.len() as u32);
        self.arena.push(op);
        self.forwarding.push(Forwarding::Unresolved);
        r
    }

    pub(crate) fn lookup_call_pure(&self, key: &CallPureKey) -> Option<&Const> {
        self.call_pure_results.get(key)
    }

    pub(crate) fn effect_of(&self, r: OpRef) -> Option<&EffectInfo> {
        self.op(r).descr.and_then(|d| self.descrs.effect(d))
    }

    // ========== Forwarding ==========

    /// Follow forwarding links to the current representative
    pub fn resolve(&self, operand: &Operand) -> Operand {
        let mut current = operand.clone();
        while let Operand::Op(r) = current {
            match self.forwarding.get(r.index()) {
                Some(Forwarding::ReplacedBy(next)) => current = next.clone(),
                _ => break,
            }
        }
        current
    }

    /// [`Self::resolve`] with path compression
    pub(crate) fn get_box_replacement(&mut self, operand: &Operand) -> Operand {
        let target = self.resolve(operand);
        let mut current = operand.clone();
        while let Operand::Op(r) = current {
            match &self.forwarding[r.index()] {
                Forwarding::ReplacedBy(next) => {
                    let next = next.clone();
                    if next != target {
                        self.forwarding[r.index()] = Forwarding::ReplacedBy(target.clone());
                    }
                    current = next;
                }
                _ => break,
            }
        }
        target
    }

    fn resolve_args(&mut self, r: OpRef) {
        let args = std::mem::take(&mut self.op_mut(r).args);
        let args = args.iter().map(|a| self.get_box_replacement(a)).collect();
        self.op_mut(r).args = args;
        if let Some(fail_args) = self.op_mut(r).fail_args.take() {
            let fail_args = fail_args
                .iter()
                .map(|a| self.get_box_replacement(a))
                .collect();
            self.op_mut(r).fail_args = Some(fail_args);
        }
    }

    /// Record that `r` always equals `target`
    pub(crate) fn make_equal_to(&mut self, r: OpRef, target: &Operand) -> Result<()> {
        let r = match self.get_box_replacement(&Operand::Op(r)) {
            Operand::Op(r) => r,
            Operand::Const(_) => return Ok(()),
        };
        let target = self.get_box_replacement(target);
        match target {
            Operand::Const(c) => self.make_constant(r, c),
            Operand::Op(t) if t == r => Ok(()),
            Operand::Op(t) => {
                let old = std::mem::take(&mut self.forwarding[r.index()]);
                if let Forwarding::HasFacts(facts) = old {
                    match (&mut self.forwarding[t.index()], facts) {
                        (slot @ Forwarding::Unresolved, facts) => {
                            *slot = Forwarding::HasFacts(facts);
                        }
                        (Forwarding::HasFacts(Info::Int(b)), Info::Int(other)) => {
                            b.intersect(&other)?;
                        }
                        _ => {}
                    }
                }
                self.forwarding[r.index()] = Forwarding::ReplacedBy(Operand::Op(t));
                Ok(())
            }
        }
    }

    /// Record that `r` always equals the constant `c`
    pub(crate) fn make_constant(&mut self, r: OpRef, c: Const) -> Result<()> {
        let r = match self.get_box_replacement(&Operand::Op(r)) {
            Operand::Op(r) => r,
            Operand::Const(existing) => {
                if existing != c {
                    return Err(Error::invalid_loop(format!(
                        "value is both {} and {}",
                        existing, c
                    )));
                }
                return Ok(());
            }
        };
        match self.info(r) {
            Some(Info::Int(b)) => {
                if let Some(v) = c.as_int() {
                    if !b.contains(v) {
                        return Err(Error::invalid_loop(format!(
                            "constant {} outside of {}",
                            v, b
                        )));
                    }
                }
            }
            Some(Info::Ptr(p)) => {
                if c.is_null() {
                    return Err(Error::invalid_loop("non-null value proven null"));
                }
                if p.is_virtual() {
                    return Err(Error::invalid_loop("virtual proven equal to a constant"));
                }
                if let (Some(k), Const::Ref(RefConst::Obj { class: Some(c2), .. })) =
                    (p.known_class(), &c)
                {
                    if k != *c2 {
                        return Err(Error::invalid_loop("constant has the wrong class"));
                    }
                }
            }
            None => {}
        }
        trace!(result = r.0, value = %c, "constant");
        self.forwarding[r.index()] = Forwarding::ReplacedBy(Operand::Const(c));
        Ok(())
    }

    // ========== Facts ==========

    pub(crate) fn info(&self, r: OpRef) -> Option<&Info> {
        match self.forwarding.get(r.index()) {
            Some(Forwarding::HasFacts(info)) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn info_mut(&mut self, r: OpRef) -> Option<&mut Info> {
        match self.forwarding.get_mut(r.index()) {
            Some(Forwarding::HasFacts(info)) => Some(info),
            _ => None,
        }
    }

    pub(crate) fn set_info(&mut self, r: OpRef, info: Info) {
        self.forwarding[r.index()] = Forwarding::HasFacts(info);
    }

    pub(crate) fn getptrinfo(&self, operand: &Operand) -> Option<&PtrInfo> {
        match self.resolve(operand) {
            Operand::Op(r) => self.info(r).and_then(Info::as_ptr),
            Operand::Const(_) => None,
        }
    }

    pub(crate) fn getptrinfo_mut(&mut self, operand: &Operand) -> Option<&mut PtrInfo> {
        match self.resolve(operand) {
            Operand::Op(r) => self.info_mut(r).and_then(Info::as_ptr_mut),
            Operand::Const(_) => None,
        }
    }

    /// Pointer facts of `operand`, created as non-null if absent
    pub(crate) fn ensure_ptr_info(&mut self, operand: &Operand) -> Option<&mut PtrInfo> {
        let r = self.resolve(operand).as_op()?;
        if self.info(r).is_none() {
            self.set_info(r, Info::Ptr(PtrInfo::nonnull()));
        }
        self.info_mut(r).and_then(Info::as_ptr_mut)
    }

    pub(crate) fn getintbound(&self, operand: &Operand) -> IntBound {
        match self.resolve(operand) {
            Operand::Const(Const::Int(v)) => IntBound::from_constant(v),
            Operand::Const(_) => IntBound::unbounded(),
            Operand::Op(r) => match self.info(r) {
                Some(Info::Int(b)) => b.clone(),
                _ => IntBound::unbounded(),
            },
        }
    }

    /// Narrow the bound of an integer value
    pub(crate) fn setintbound(&mut self, operand: &Operand, bound: &IntBound) -> Result<()> {
        match self.resolve(operand) {
            Operand::Const(Const::Int(v)) => {
                if !bound.contains(v) {
                    return Err(Error::invalid_loop(format!(
                        "constant {} outside of {}",
                        v, bound
                    )));
                }
                Ok(())
            }
            Operand::Const(_) => Ok(()),
            Operand::Op(r) => {
                if self.op(r).ty != Type::Int {
                    return Ok(());
                }
                match &mut self.forwarding[r.index()] {
                    Forwarding::HasFacts(Info::Int(b)) => {
                        b.intersect(bound)?;
                    }
                    Forwarding::HasFacts(Info::Ptr(_)) => {}
                    slot => *slot = Forwarding::HasFacts(Info::Int(bound.clone())),
                }
                Ok(())
            }
        }
    }

    /// Integer value of an operand when it is a constant or its bound is one
    pub(crate) fn get_constant_int(&self, operand: &Operand) -> Option<i64> {
        match self.resolve(operand) {
            Operand::Const(c) => c.as_int(),
            Operand::Op(r) => match self.info(r) {
                Some(Info::Int(b)) => b.get_constant(),
                _ => None,
            },
        }
    }

    pub(crate) fn nullness(&self, operand: &Operand) -> Nullness {
        match self.resolve(operand) {
            Operand::Const(c) => {
                if c.is_null() {
                    Nullness::Null
                } else {
                    Nullness::NonNull
                }
            }
            Operand::Op(r) => match self.info(r) {
                Some(Info::Ptr(p)) => p.nullness(),
                Some(Info::Int(b)) => b.getnullness(),
                None => Nullness::Unknown,
            },
        }
    }

    pub(crate) fn is_virtual(&self, operand: &Operand) -> bool {
        self.getptrinfo(operand).is_some_and(PtrInfo::is_virtual)
    }

    pub(crate) fn known_class(&self, operand: &Operand) -> Option<i64> {
        match self.resolve(operand) {
            Operand::Const(Const::Ref(RefConst::Obj { class, .. })) => class,
            Operand::Const(_) => None,
            Operand::Op(r) => self.info(r).and_then(Info::as_ptr)?.known_class(),
        }
    }

    /// Record that a pointer is non-null
    pub(crate) fn make_nonnull(&mut self, operand: &Operand) {
        if let Operand::Op(r) = self.resolve(operand) {
            if self.info(r).is_none() && self.op(r).ty == Type::Ref {
                self.set_info(r, Info::Ptr(PtrInfo::nonnull()));
            }
        }
    }

    // ========== Chain ==========

    /// Index of the first enabled pass after `pass`
    fn next_stage(&self, pass: Pass) -> usize {
        self.chain
            .iter()
            .position(|p| *p > pass)
            .unwrap_or(self.chain.len())
    }

    /// Run an operation through the whole chain
    pub(crate) fn send_extra_operation(&mut self, r: OpRef) -> Result<()> {
        self.propagate_from(0, r)
    }

    /// Run an operation through the passes after `pass`
    pub(crate) fn emit_extra(&mut self, pass: Pass, r: OpRef) -> Result<()> {
        let stage = self.next_stage(pass);
        self.propagate_from(stage, r)
    }

    /// Run an operation through the passes after `pass`, or only the final
    /// emission when `pass` is `None`
    pub(crate) fn emit_after(&mut self, pass: Option<Pass>, r: OpRef) -> Result<()> {
        match pass {
            Some(pass) => self.emit_extra(pass, r),
            None => self.emit(r),
        }
    }

    /// Run an operation through the chain starting at `pass` itself
    pub(crate) fn send_from(&mut self, pass: Pass, r: OpRef) -> Result<()> {
        let stage = self
            .chain
            .iter()
            .position(|p| *p >= pass)
            .unwrap_or(self.chain.len());
        self.propagate_from(stage, r)
    }

    /// Allocate `op` and send it to the stages after `after`; returns the
    /// representative of its result
    pub(crate) fn emit_new(&mut self, after: Option<Pass>, op: Op) -> Result<Operand> {
        let r = self.new_op(op);
        self.emit_after(after, r)?;
        Ok(self.resolve(&Operand::Op(r)))
    }

    fn propagate_from(&mut self, stage: usize, r: OpRef) -> Result<()> {
        self.resolve_args(r);
        let Some(&pass) = self.chain.get(stage) else {
            return self.emit(r);
        };
        match self.transform(pass, r)? {
            Flow::Emit(next) => {
                self.propagate_from(stage + 1, next)?;
                self.postprocess(pass, next)
            }
            Flow::Done => {
                trace!(pass = %pass, op = %self.op(r).opcode, result = r.0, "consumed");
                Ok(())
            }
        }
    }

    fn transform(&mut self, pass: Pass, r: OpRef) -> Result<Flow> {
        match pass {
            Pass::Rewrite => self.optimize_rewrite(r),
            Pass::IntBounds => self.optimize_intbounds(r),
            Pass::Virtualize => self.optimize_virtualize(r),
            Pass::String => self.optimize_string(r),
            Pass::EarlyForce => self.optimize_earlyforce(r),
            Pass::Pure => self.optimize_pure(r),
            Pass::Heap => self.optimize_heap(r),
        }
    }

    fn postprocess(&mut self, pass: Pass, r: OpRef) -> Result<()> {
        match pass {
            Pass::Rewrite => self.postprocess_rewrite(r),
            Pass::IntBounds => self.postprocess_intbounds(r),
            Pass::Pure => self.postprocess_pure(r),
            Pass::Heap => self.postprocess_heap(r),
            Pass::Virtualize | Pass::String | Pass::EarlyForce => Ok(()),
        }
    }

    /// Ask the final stage to replace the guard at output position `pos`
    /// with `guard` once it gets there
    pub(crate) fn replace_guard(&mut self, guard: OpRef, pos: usize) {
        self.replaces_guard.insert(guard, pos);
    }

    pub(crate) fn op_can_raise(&self, r: OpRef) -> bool {
        let op = self.op(r);
        if !op.opcode.is_call() {
            return false;
        }
        self.effect_of(r)
            .map_or(true, |e| e.can_raise() || e.has_random_effects())
    }

    // ========== Emission ==========

    /// Append an operation to the output
    pub(crate) fn emit(&mut self, r: OpRef) -> Result<()> {
        self.resolve_args(r);
        let nargs = self.op(r).args.len();
        for i in 0..nargs {
            let arg = self.op(r).args[i].clone();
            if self.is_virtual(&arg) {
                let forced = self.force_box(&arg)?;
                self.op_mut(r).args[i] = forced;
            }
        }
        if self.op(r).is_guard() {
            return self.emit_guard(r);
        }
        if self.op(r).opcode == OpCode::CallPure {
            self.op_mut(r).opcode = OpCode::Call;
        }
        if self.op_can_raise(r) {
            self.exception_might_have_happened = true;
        }
        trace!(op = %self.op(r).opcode, result = r.0, "emit");
        self.out.push(r);
        self.stats.emitted_ops += 1;
        Ok(())
    }

    fn emit_guard(&mut self, r: OpRef) -> Result<()> {
        // guard_value on a boolean is a plain truth test
        if self.op(r).opcode == OpCode::GuardValue {
            let (value, expected) = (self.op(r).args[0].clone(), self.op(r).args[1].const_int());
            if let Some(c @ (0 | 1)) = expected {
                if self.getintbound(&value).is_bool() {
                    let op = self.op_mut(r);
                    op.opcode = if c == 1 {
                        OpCode::GuardTrue
                    } else {
                        OpCode::GuardFalse
                    };
                    op.args.truncate(1);
                }
            }
        }

        let pending = std::mem::take(&mut self.pending_guard_fields);
        // delayed writes belong to this point of the trace, not the earlier one
        let replaced = self.replaces_guard.remove(&r).filter(|_| pending.is_empty());
        let pos = match replaced {
            Some(pos) => {
                // the stronger guard runs at the old position with its recovery data
                let old = self.out[pos];
                let (resume, fail_args) = {
                    let old_op = self.op(old);
                    (old_op.resume.clone(), old_op.fail_args.clone())
                };
                let op = self.op_mut(r);
                op.resume = resume;
                op.fail_args = fail_args;
                debug!(
                    old = %self.op(old).opcode,
                    new = %self.op(r).opcode,
                    position = pos,
                    "replaced guard"
                );
                self.out[pos] = r;
                self.stats.replaced_guards += 1;
                pos
            }
            None => {
                let descr = self.build_resume(r, &pending)?;
                let boxes = descr.boxes().into_iter().map(Operand::Op).collect();
                let op = self.op_mut(r);
                op.fail_args = Some(boxes);
                op.resume = Some(Rc::new(descr));
                trace!(op = %self.op(r).opcode, result = r.0, "emit guard");
                self.out.push(r);
                self.stats.emitted_ops += 1;
                self.stats.emitted_guards += 1;
                self.out.len() - 1
            }
        };

        let opcode = self.op(r).opcode;
        match opcode {
            OpCode::GuardNoException | OpCode::GuardException => {
                self.exception_might_have_happened = false;
            }
            OpCode::GuardNonnull | OpCode::GuardClass | OpCode::GuardNonnullClass => {
                let value = self.op(r).args[0].clone();
                if let Some(info) = self.ensure_ptr_info(&value) {
                    info.set_last_guard(Some(pos));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Build the recovery data of a guard, forcing its virtuals once if the
    /// encoding does not fit
    fn build_resume(&mut self, r: OpRef, pending: &[PendingField]) -> Result<ResumeDescr> {
        let fail_args = self
            .op(r)
            .fail_args
            .clone()
            .unwrap_or_else(|| self.default_fail_args.clone());
        let id = self.next_guard_id;
        self.next_guard_id += 1;
        let origin = self.current_origin;
        match self.encode_resume(id, origin, &fail_args, pending)? {
            Ok(descr) => Ok(descr),
            Err(entries) => {
                debug!(
                    guard = id,
                    entries,
                    limit = self.config.max_resume_entries,
                    "resume data too large, forcing virtuals"
                );
                for arg in fail_args.iter().chain(pending.iter().map(|p| &p.value)) {
                    if self.is_virtual(arg) {
                        self.force_box(arg)?;
                    }
                }
                match self.encode_resume(id, origin, &fail_args, pending)? {
                    Ok(descr) => Ok(descr),
                    Err(entries) => Err(Error::TagOverflow {
                        guard: id,
                        entries,
                        limit: self.config.max_resume_entries,
                    }),
                }
            }
        }
    }

    /// Encode recovery data; `Err(entries)` when it exceeds the capacity
    fn encode_resume(
        &self,
        id: u32,
        origin: OpRef,
        fail_args: &[Operand],
        pending: &[PendingField],
    ) -> Result<std::result::Result<ResumeDescr, usize>> {
        let mut builder = ResumeBuilder::new(self);
        let mut encoded = Vec::with_capacity(fail_args.len());
        for arg in fail_args {
            encoded.push(builder.encode(arg)?);
        }
        let mut fields = Vec::with_capacity(pending.len());
        for field in pending {
            fields.push(builder.encode_pending(field)?);
        }
        if builder.entries() > self.config.max_resume_entries {
            return Ok(Err(builder.entries()));
        }
        Ok(Ok(builder.build(id, origin, encoded, fields)?))
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualSource for Optimizer {
    fn resolve(&self, operand: &Operand) -> Operand {
        Optimizer::resolve(self, operand)
    }

    fn virtual_info(&self, r: OpRef) -> Option<&PtrInfo> {
        self.info(r)
            .and_then(Info::as_ptr)
            .filter(|p| p.is_virtual())
    }

    fn descr_table(&self) -> &DescrTable {
        &self.descrs
    }
}

/// Operations that can go once nothing reads them: pure and unable to fail
fn removable_when_unused(opcode: OpCode) -> bool {
    use OpCode::*;
    opcode.is_always_pure()
        && !matches!(
            opcode,
            IntPyDiv
                | IntPyMod
                | Strlen
                | Strgetitem
                | Unicodelen
                | Unicodegetitem
                | ArraylenGc
                | CastIntToPtr
                | CallPure
        )
}

/// Drop removable operations whose results nothing reads
fn remove_unused_ops(arena: &[Op], ops: Vec<OpRef>) -> Vec<OpRef> {
    let mut live: HashSet<OpRef> = HashSet::default();
    let mut kept = Vec::with_capacity(ops.len());
    for &r in ops.iter().rev() {
        let op = &arena[r.index()];
        if removable_when_unused(op.opcode) && !live.contains(&r) {
            continue;
        }
        for operand in op.args.iter().chain(op.fail_args.iter().flatten()) {
            if let Operand::Op(a) = operand {
                live.insert(*a);
            }
        }
        if let Some(resume) = &op.resume {
            live.extend(resume.boxes());
        }
        kept.push(r);
    }
    kept.reverse();
    kept
}
