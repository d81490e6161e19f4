//! Loop peeling
//!
//! A loop trace is optimized twice. The first copy, the *preamble*, runs
//! once on unconstrained inputs. Whatever it learns by the back-edge is
//! exported: the [`VirtualState`] of the jump arguments and the
//! [`ShortBoxes`] its caches still hold. The second copy, the *body*, starts
//! from that state behind a `label` and jumps back to itself, so virtuals
//! stay virtual across iterations and loop-invariant reads happen once.
//!
//! Bridges (traces leaving a guard of the loop) are matched against the
//! loop's label with [`UnrollOptimizer::optimize_bridge`].

pub mod shortboxes;

use self::shortboxes::ShortBoxes;
use crate::error::{Error, Result};
use crate::info::PtrInfo;
use crate::interp::{Interpreter, Outcome, Value};
use crate::ir::{Op, OpCode, OpRef, Operand, Trace, Type};
use crate::optimizer::{OptStats, Optimizer, OptimizerConfig};
use crate::virtualstate::{RuntimeValue, VirtualState};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Where the body's closing jump goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    /// Back to the body's own label
    Label,
    /// To the preamble, because the body ended in an incompatible state
    Preamble,
}

/// A label other traces can jump to
#[derive(Debug, Clone)]
pub struct TargetToken {
    pub state: VirtualState,
    /// Recomputes the label's short arguments from its plain ones
    pub short_preamble: Rc<Trace>,
}

/// Result of peeling one loop
#[derive(Debug, Clone)]
pub struct PeeledLoop {
    pub preamble: Trace,
    /// Starts with a `label`; its input arguments are the label arguments
    pub body: Trace,
    pub short_preamble: Rc<Trace>,
    pub target: TargetToken,
    pub jumps_to: JumpTarget,
    /// Rebuilds the loop's own arguments from label arguments, for runs that
    /// stop at the label
    pub exit: Trace,
}

/// Everything compiled for one loop
#[derive(Debug, Clone)]
pub struct LoopToken {
    pub targets: Vec<TargetToken>,
    pub retraces: u32,
    /// States that already asked for a retrace
    pub failed_states: Vec<VirtualState>,
}

impl LoopToken {
    pub fn new(peeled: &PeeledLoop) -> Self {
        LoopToken {
            targets: vec![peeled.target.clone()],
            retraces: 0,
            failed_states: Vec::new(),
        }
    }
}

/// An optimized bridge
#[derive(Debug, Clone)]
pub struct BridgeResult {
    pub trace: Trace,
    /// Index of the target token it jumps to; `None` means the preamble
    pub target: Option<usize>,
    pub retrace_requested: bool,
}

/// An optimized trace, peeled or not
#[derive(Debug, Clone)]
pub enum Compiled {
    Linear(Trace),
    Peeled(PeeledLoop),
}

impl Compiled {
    /// Named traces, in execution order
    pub fn traces(&self) -> Vec<(&'static str, &Trace)> {
        match self {
            Compiled::Linear(trace) => vec![("trace", trace)],
            Compiled::Peeled(peeled) => vec![
                ("preamble", &peeled.preamble),
                ("body", &peeled.body),
                ("short preamble", &*peeled.short_preamble),
            ],
        }
    }

    /// Run for at most `iterations` passes of the original loop
    pub fn execute(&self, interp: &mut Interpreter, args: &[Value], iterations: usize) -> Result<Outcome> {
        match self {
            Compiled::Linear(trace) => interp.run_iterations(trace, args, iterations),
            Compiled::Peeled(peeled) => peeled.execute(interp, args, iterations),
        }
    }
}

impl PeeledLoop {
    /// Run the preamble, then the body, for at most `iterations` passes
    pub fn execute(&self, interp: &mut Interpreter, args: &[Value], iterations: usize) -> Result<Outcome> {
        let outcome = interp.run(&self.preamble, args)?;
        self.continue_loop(interp, outcome, true, iterations.saturating_sub(1))
    }

    /// Run a compiled bridge, then wherever it jumps to
    pub fn execute_bridge(
        &self,
        interp: &mut Interpreter,
        bridge: &BridgeResult,
        args: &[Value],
        iterations: usize,
    ) -> Result<Outcome> {
        let outcome = interp.run(&bridge.trace, args)?;
        self.continue_loop(interp, outcome, bridge.target.is_some(), iterations)
    }

    fn continue_loop(
        &self,
        interp: &mut Interpreter,
        mut outcome: Outcome,
        mut at_label: bool,
        iterations: usize,
    ) -> Result<Outcome> {
        for _ in 0..iterations {
            let Outcome::Jumped(values) = outcome else {
                return Ok(outcome);
            };
            let (trace, next) = if at_label {
                (&self.body, self.jumps_to == JumpTarget::Label)
            } else {
                (&self.preamble, true)
            };
            outcome = interp.run(trace, &values)?;
            at_label = next;
        }
        match outcome {
            Outcome::Jumped(values) if at_label => interp.run(&self.exit, &values),
            other => Ok(other),
        }
    }
}

/// Errors meaning "this state does not fit", as opposed to real failures
fn is_mismatch(err: &Error) -> bool {
    matches!(err, Error::BadVirtualState(_) | Error::Unsupported(_))
}

fn type_of(opt: &Optimizer, operand: &Operand) -> Type {
    match operand {
        Operand::Op(r) => opt.op(*r).ty,
        Operand::Const(c) => c.ty(),
    }
}

/// The closing jump and the operations before it
fn split_loop(trace: &Trace) -> Result<(OpRef, &[OpRef])> {
    match trace.ops.split_last() {
        Some((&jump, ops)) if trace.op(jump).opcode == OpCode::Jump => Ok((jump, ops)),
        _ => Err(Error::unsupported("only traces ending in a jump can be peeled")),
    }
}

/// Force the virtuals a label cannot describe (strings, raw memory)
fn force_unrepresentable(opt: &mut Optimizer, values: &[Operand]) -> Result<()> {
    let mut stack: Vec<Operand> = values.to_vec();
    let mut seen = HashSet::default();
    while let Some(value) = stack.pop() {
        let value = opt.resolve(&value);
        let Operand::Op(r) = value else {
            continue;
        };
        if !seen.insert(r) {
            continue;
        }
        let children = match opt.getptrinfo(&value) {
            Some(p @ (PtrInfo::Struct(_) | PtrInfo::Array(_) | PtrInfo::ArrayStruct(_))) if p.is_virtual() => {
                Some(p.virtual_children())
            }
            Some(p) if p.is_virtual() => None,
            _ => continue,
        };
        match children {
            Some(children) => stack.extend(children),
            None => {
                opt.force_box(&value)?;
            }
        }
    }
    Ok(())
}

/// Label arguments read by any of `ops`
///
/// An emitted operation keeps the operands it had when it was emitted, and a
/// value may be forwarded later (a guard makes it constant), so both the
/// stored and the resolved operand count as reads.
fn used_shorts(opt: &Optimizer, ops: &[OpRef], index: &HashMap<OpRef, usize>) -> Vec<usize> {
    let mut used = Vec::new();
    let mut note = |r: OpRef| {
        if let Some(&j) = index.get(&r) {
            used.push(j);
        }
    };
    for &r in ops {
        let op = opt.op(r);
        let operands = op.args.iter().chain(op.fail_args.iter().flatten());
        for operand in operands {
            if let Operand::Op(a) = operand {
                note(*a);
            }
            if let Operand::Op(a) = opt.resolve(operand) {
                note(a);
            }
        }
        if let Some(resume) = &op.resume {
            resume.boxes().into_iter().for_each(&mut note);
        }
    }
    used
}

/// Peels loops and matches bridges against their labels
pub struct UnrollOptimizer {
    config: OptimizerConfig,
    stats: OptStats,
}

impl UnrollOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        UnrollOptimizer {
            config,
            stats: OptStats::default(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Statistics of the last call, summed over every trace it produced
    pub fn stats(&self) -> &OptStats {
        &self.stats
    }

    /// Peel a loop when possible, otherwise optimize it as a straight line
    pub fn optimize(&mut self, trace: &Trace) -> Result<Compiled> {
        let is_loop = trace.final_op().is_some_and(|(_, op)| op.opcode == OpCode::Jump);
        if self.config.unroll && is_loop {
            match self.optimize_peeled_loop(trace) {
                Ok(peeled) => return Ok(Compiled::Peeled(peeled)),
                Err(e) if e.is_invalid_loop() || is_mismatch(&e) => {
                    warn!(error = %e, "peeling failed, optimizing without unrolling");
                }
                Err(e) => return Err(e),
            }
        }
        let mut opt = Optimizer::with_config(self.config.clone());
        let out = opt.optimize(trace)?;
        self.stats = opt.stats().clone();
        Ok(Compiled::Linear(out))
    }

    /// Optimize a loop as a preamble followed by a self-jumping body
    pub fn optimize_peeled_loop(&mut self, trace: &Trace) -> Result<PeeledLoop> {
        let (jump, ops) = split_loop(trace)?;
        if trace.op(jump).args.len() != trace.inputargs.len() {
            return Err(Error::unsupported("loop jump and inputs differ in arity"));
        }

        // preamble
        let mut pre = Optimizer::with_config(self.config.clone());
        pre.start(trace);
        for &r in ops {
            pre.propagate_input(r)?;
        }
        let end: Vec<Operand> = trace.op(jump).args.iter().map(|a| pre.resolve(a)).collect();
        force_unrepresentable(&mut pre, &end)?;
        pre.flush()?;
        let end: Vec<Operand> = end.iter().map(|a| pre.resolve(a)).collect();
        let state = VirtualState::capture(&pre, &end)?;
        let leaves = state.make_inputargs(&mut pre, &end, false)?;
        let shorts = ShortBoxes::collect(&pre, &leaves);
        debug!(state = %state, leaves = leaves.len(), shorts = shorts.len(), "exported preamble state");

        // body
        let mut body = Optimizer::with_config(self.config.clone());
        body.start(trace);
        let leaf_args: Vec<Operand> = leaves
            .iter()
            .map(|l| Operand::Op(body.new_op(Op::new(OpCode::InputArg, type_of(&pre, l), Vec::new()))))
            .collect();
        let short_args: Vec<Operand> = shorts
            .boxes
            .iter()
            .map(|b| Operand::Op(body.new_op(Op::new(OpCode::InputArg, b.ty, Vec::new()))))
            .collect();
        let roots = state.import(&mut body, &leaf_args)?;
        for (&input, root) in trace.inputargs.iter().zip(&roots) {
            body.make_equal_to(input, root)?;
        }
        shorts.register(&mut body, &leaf_args, &short_args);
        for &r in ops {
            body.propagate_input(r)?;
        }
        let end: Vec<Operand> = trace.op(jump).args.iter().map(|a| body.resolve(a)).collect();
        force_unrepresentable(&mut body, &end)?;
        body.flush()?;
        let end: Vec<Operand> = end.iter().map(|a| body.resolve(a)).collect();

        let short_index: HashMap<OpRef, usize> = short_args
            .iter()
            .enumerate()
            .filter_map(|(j, a)| a.as_op().map(|r| (r, j)))
            .collect();
        let mut used: BTreeSet<usize> = BTreeSet::new();

        let (jump_args, jumps_to) = match self.close_loop(&mut body, &state, &end)? {
            Some(body_leaves) => {
                // closing the loop may have forced virtuals, so scan the body now
                used.extend(used_shorts(&body, &body.out, &short_index));
                let recomputed = self.recompute_shorts(&mut body, &shorts, &body_leaves, &short_index, &mut used)?;
                let mut args = body_leaves;
                for &j in &used {
                    let value = recomputed[j]
                        .clone()
                        .ok_or_else(|| Error::internal("label argument was not recomputed"))?;
                    args.push(value);
                }
                (args, JumpTarget::Label)
            }
            None => {
                warn!(state = %state, "loop end does not match its label, jumping to the preamble");
                let mut args = Vec::with_capacity(end.len());
                for value in &end {
                    args.push(body.force_box(value)?);
                }
                body.flush()?;
                used.extend(used_shorts(&body, &body.out, &short_index));
                for arg in &args {
                    if let Some(&j) = arg.as_op().and_then(|r| short_index.get(&r)) {
                        used.insert(j);
                    }
                }
                (args, JumpTarget::Preamble)
            }
        };
        let used: Vec<usize> = used.into_iter().collect();

        let closing = body.new_op(Op::void(OpCode::Jump, jump_args));
        body.emit(closing)?;
        let unexported: Vec<usize> = used_shorts(&body, &body.out, &short_index)
            .into_iter()
            .filter(|j| !used.contains(j))
            .collect();
        if !unexported.is_empty() {
            return Err(Error::unsupported(format!(
                "loop body reads short values {:?} its label does not carry",
                unexported
            )));
        }
        let mut label_args = leaf_args.clone();
        label_args.extend(used.iter().map(|&j| short_args[j].clone()));
        body.inputargs = label_args.iter().filter_map(Operand::as_op).collect();
        let label = body.new_op(Op::void(OpCode::Label, label_args));
        body.out.insert(0, label);

        let mut pre_jump = leaves.clone();
        pre_jump.extend(used.iter().map(|&j| Operand::Op(shorts.boxes[j].value)));
        let pre_closing = pre.new_op(Op::void(OpCode::Jump, pre_jump));
        pre.emit(pre_closing)?;

        let short_preamble = Rc::new(self.build_short_preamble(&pre, &shorts, &leaves, &used)?);
        let exit = self.build_exit(trace, &pre, &state, &leaves, &shorts, &used)?;
        let mut stats = pre.stats().clone();
        stats.merge(body.stats());
        stats.short_preamble_ops = short_preamble.len().saturating_sub(1);
        self.stats = stats;

        let peeled = PeeledLoop {
            preamble: pre.finish_trace(),
            body: body.finish_trace(),
            short_preamble: short_preamble.clone(),
            target: TargetToken {
                state,
                short_preamble,
            },
            jumps_to,
            exit,
        };
        info!(
            preamble = peeled.preamble.len(),
            body = peeled.body.len(),
            label_args = peeled.body.inputargs.len(),
            stats = %self.stats,
            "peeled loop"
        );
        Ok(peeled)
    }

    /// Flatten the loop end against the label; `None` when it does not fit
    fn close_loop(&self, body: &mut Optimizer, state: &VirtualState, end: &[Operand]) -> Result<Option<Vec<Operand>>> {
        let leaves = match state.make_inputargs(body, end, true) {
            Ok(leaves) => leaves,
            Err(e) if is_mismatch(&e) => {
                debug!(error = %e, "loop end cannot be flattened");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let end: Vec<Operand> = end.iter().map(|a| body.resolve(a)).collect();
        let end_state = match VirtualState::capture(body, &end) {
            Ok(s) => s,
            Err(e) if is_mismatch(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !state.generalization_of(&end_state) {
            debug!(label = %state, end = %end_state, "loop end is not covered by the label");
            return Ok(None);
        }
        Ok(Some(leaves))
    }

    /// Recompute every used short value at the end of the body
    ///
    /// Recomputing may itself read other label arguments; those join
    /// `used` and are recomputed too.
    fn recompute_shorts(
        &self,
        body: &mut Optimizer,
        shorts: &ShortBoxes,
        leaves: &[Operand],
        short_index: &HashMap<OpRef, usize>,
        used: &mut BTreeSet<usize>,
    ) -> Result<Vec<Option<Operand>>> {
        let mut done: Vec<Option<Operand>> = vec![None; shorts.len()];
        for leaf in leaves {
            if let Some(&j) = leaf.as_op().and_then(|r| short_index.get(&r)) {
                used.insert(j);
            }
        }
        let mut queue: Vec<usize> = used.iter().copied().collect();
        while let Some(idx) = queue.pop() {
            if done[idx].is_some() {
                continue;
            }
            let missing: Vec<usize> = shorts
                .dependencies(idx)
                .into_iter()
                .filter(|&d| done[d].is_none())
                .collect();
            if !missing.is_empty() {
                queue.push(idx);
                queue.extend(missing);
                continue;
            }
            let template = &shorts.boxes[idx].op;
            let args = template
                .args
                .iter()
                .map(|a| shorts.map_operand(a, leaves, &done))
                .collect::<Option<Vec<Operand>>>()
                .ok_or_else(|| Error::internal("short operation over unknown values"))?;
            let mut op = Op::new(template.opcode, template.ty, args);
            op.descr = template.descr;
            let mark = body.out.len();
            let r = body.new_op(op);
            body.send_extra_operation(r)?;
            body.flush()?;
            let mut value = body.resolve(&Operand::Op(r));
            if body.is_virtual(&value) {
                value = body.force_box(&value)?;
            }
            let tail: Vec<OpRef> = body.out[mark..].to_vec();
            let mut reads = used_shorts(body, &tail, short_index);
            if let Some(&j) = value.as_op().and_then(|v| short_index.get(&v)) {
                reads.push(j);
            }
            for j in reads {
                if used.insert(j) {
                    queue.push(j);
                }
            }
            done[idx] = Some(value);
        }
        Ok(done)
    }

    /// Trace from the label arguments back to the loop's own arguments:
    /// virtual label entries are allocated again, constants filled in
    fn build_exit(
        &self,
        trace: &Trace,
        pre: &Optimizer,
        state: &VirtualState,
        leaves: &[Operand],
        shorts: &ShortBoxes,
        used: &[usize],
    ) -> Result<Trace> {
        let mut exit = Optimizer::with_config(self.config.clone());
        exit.start(trace);
        let leaf_args: Vec<Operand> = leaves
            .iter()
            .map(|l| Operand::Op(exit.new_op(Op::new(OpCode::InputArg, type_of(pre, l), Vec::new()))))
            .collect();
        let extra: Vec<OpRef> = used
            .iter()
            .map(|&j| exit.new_op(Op::new(OpCode::InputArg, shorts.boxes[j].ty, Vec::new())))
            .collect();
        let roots = state.import(&mut exit, &leaf_args)?;
        let mut args = Vec::with_capacity(roots.len());
        for root in &roots {
            args.push(exit.force_box(root)?);
        }
        exit.flush()?;
        let closing = exit.new_op(Op::void(OpCode::Jump, args));
        exit.emit(closing)?;
        exit.inputargs = leaf_args.iter().filter_map(Operand::as_op).chain(extra).collect();
        Ok(exit.finish_trace())
    }

    fn build_short_preamble(
        &self,
        pre: &Optimizer,
        shorts: &ShortBoxes,
        leaves: &[Operand],
        used: &[usize],
    ) -> Result<Trace> {
        let mut trace = Trace::new(pre.descrs.clone());
        let inputs: Vec<Operand> = leaves
            .iter()
            .map(|l| Operand::Op(trace.add_inputarg(type_of(pre, l))))
            .collect();
        let mut values: Vec<Option<Operand>> = vec![None; shorts.len()];
        for idx in shorts.closure(used) {
            let template = &shorts.boxes[idx].op;
            let args = template
                .args
                .iter()
                .map(|a| shorts.map_operand(a, &inputs, &values))
                .collect::<Option<Vec<Operand>>>()
                .ok_or_else(|| Error::internal("short operation over unknown values"))?;
            let mut op = Op::new(template.opcode, template.ty, args);
            op.descr = template.descr;
            values[idx] = Some(Operand::Op(trace.push(op)));
        }
        let mut jump = inputs;
        for &j in used {
            jump.push(values[j].clone().ok_or_else(|| Error::internal("short value missing"))?);
        }
        trace.push(Op::void(OpCode::Jump, jump));
        Ok(trace)
    }

    /// Optimize a bridge that ends by jumping into the loop of `token`
    ///
    /// `runtime` holds the observed values of the bridge's jump arguments;
    /// without it no narrowing guards can be generated.
    pub fn optimize_bridge(
        &mut self,
        trace: &Trace,
        token: &mut LoopToken,
        runtime: Option<&[RuntimeValue]>,
    ) -> Result<BridgeResult> {
        let (jump, ops) = split_loop(trace)?;
        let mut opt = Optimizer::with_config(self.config.clone());
        opt.start(trace);
        for &r in ops {
            opt.propagate_input(r)?;
        }
        let end: Vec<Operand> = trace.op(jump).args.iter().map(|a| opt.resolve(a)).collect();
        force_unrepresentable(&mut opt, &end)?;
        opt.flush()?;
        let end: Vec<Operand> = end.iter().map(|a| opt.resolve(a)).collect();
        let incoming = VirtualState::capture(&opt, &end)?;

        for (index, target) in token.targets.iter().enumerate() {
            if !target.state.generalization_of(&incoming) {
                let mut pending = Vec::new();
                let narrowed = {
                    let mut emit = |op: Op| {
                        let r = opt.new_op(op);
                        pending.push(r);
                        r
                    };
                    target.state.generate_guards(&incoming, runtime, &mut emit)
                };
                match narrowed {
                    Ok(()) => {}
                    Err(e) if is_mismatch(&e) => {
                        debug!(target = index, error = %e, "bridge cannot reach target");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                let guards = pending.iter().filter(|&&r| opt.op(r).is_guard()).count();
                if guards > self.config.max_retrace_guards {
                    debug!(target = index, guards, "too many guards to reach target");
                    continue;
                }
                for r in pending {
                    opt.send_extra_operation(r)?;
                }
                opt.flush()?;
            }
            let leaves = match target.state.make_inputargs(&mut opt, &end, true) {
                Ok(leaves) => leaves,
                Err(e) if is_mismatch(&e) => continue,
                Err(e) => return Err(e),
            };
            let args = inline_short_preamble(&mut opt, &target.short_preamble, &leaves)?;
            let closing = opt.new_op(Op::void(OpCode::Jump, args));
            opt.emit(closing)?;
            self.stats = opt.stats().clone();
            info!(target = index, stats = %self.stats, "bridge jumps into the loop");
            return Ok(BridgeResult {
                trace: opt.finish_trace(),
                target: Some(index),
                retrace_requested: false,
            });
        }

        let known_failure = token
            .failed_states
            .iter()
            .any(|s| s.generalization_of(&incoming) && incoming.generalization_of(s));
        let retrace_requested = token.retraces < self.config.retrace_limit && !known_failure;
        if retrace_requested {
            token.retraces += 1;
            warn!(state = %incoming, retraces = token.retraces, "bridge matches no target, requesting a retrace");
            token.failed_states.push(incoming);
        } else {
            warn!(state = %incoming, "bridge matches no target, jumping to the preamble");
        }
        let mut args = Vec::with_capacity(end.len());
        for value in &end {
            args.push(opt.force_box(value)?);
        }
        opt.flush()?;
        let closing = opt.new_op(Op::void(OpCode::Jump, args));
        opt.emit(closing)?;
        self.stats = opt.stats().clone();
        Ok(BridgeResult {
            trace: opt.finish_trace(),
            target: None,
            retrace_requested,
        })
    }
}

/// Replay a short preamble on `leaves`; returns the label arguments
fn inline_short_preamble(opt: &mut Optimizer, short: &Trace, leaves: &[Operand]) -> Result<Vec<Operand>> {
    let mut env: HashMap<OpRef, Operand> = short.inputargs.iter().copied().zip(leaves.iter().cloned()).collect();
    let lookup = |env: &HashMap<OpRef, Operand>, operand: &Operand| match operand {
        Operand::Op(r) => env
            .get(r)
            .cloned()
            .ok_or_else(|| Error::internal("short preamble reads an unknown value")),
        Operand::Const(_) => Ok(operand.clone()),
    };
    for (r, op) in short.iter() {
        let args = op.args.iter().map(|a| lookup(&env, a)).collect::<Result<Vec<_>>>()?;
        if op.opcode == OpCode::Jump {
            return Ok(args);
        }
        let mut copy = Op::new(op.opcode, op.ty, args);
        copy.descr = op.descr;
        let nr = opt.new_op(copy);
        opt.send_extra_operation(nr)?;
        opt.flush()?;
        let mut value = opt.resolve(&Operand::Op(nr));
        if opt.is_virtual(&value) {
            value = opt.force_box(&value)?;
        }
        env.insert(r, value);
    }
    Err(Error::internal("short preamble without a jump"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_trace;
    use crate::ir::DescrRef;
    use crate::interp::Object;
    use pretty_assertions::assert_eq;

    const LOOP: &str = "struct Node class=1 { value: int }\n---\n\
                        [p0, i1]\n\
                        guard_class(p0, 1) [p0, i1]\n\
                        i2 = getfield_gc_i(p0, descr=Node.value)\n\
                        i3 = int_add(i1, i2)\n\
                        i4 = int_lt(i3, 100)\n\
                        guard_true(i4) [p0, i3]\n\
                        jump(p0, i3)\n";

    fn peel(source: &str) -> (Trace, PeeledLoop) {
        let trace = parse_trace(source).unwrap();
        let mut unroll = UnrollOptimizer::new(OptimizerConfig::default());
        let peeled = unroll.optimize_peeled_loop(&trace).unwrap();
        (trace, peeled)
    }

    fn node(interp: &mut Interpreter, trace: &Trace, value: i64) -> Value {
        let obj = interp.parse_value("Node").unwrap();
        let field: DescrRef = trace.descrs.lookup("Node.value").unwrap();
        let id = obj.as_ref().unwrap().unwrap();
        if let Object::Struct { fields, .. } = interp.heap_mut().get_mut(id).unwrap() {
            fields.insert(field, Value::Int(value));
        }
        obj
    }

    #[test]
    fn test_invariant_read_moves_to_preamble() {
        let (_, peeled) = peel(LOOP);
        assert_eq!(peeled.preamble.count(OpCode::GetfieldGc), 1);
        assert_eq!(
            peeled.body.opcodes(),
            vec![OpCode::Label, OpCode::IntAdd, OpCode::IntLt, OpCode::GuardTrue, OpCode::Jump]
        );
        assert_eq!(peeled.body.inputargs.len(), 3);
        assert_eq!(peeled.jumps_to, JumpTarget::Label);
        assert_eq!(peeled.short_preamble.opcodes(), vec![OpCode::GetfieldGc, OpCode::Jump]);
        let (_, jump) = peeled.preamble.final_op().unwrap();
        assert_eq!(jump.args.len(), 3);
    }

    #[test]
    fn test_peeled_loop_behaves_like_original() {
        let (trace, peeled) = peel(LOOP);
        let mut plain = Interpreter::new(trace.descrs.clone());
        let p = node(&mut plain, &trace, 3);
        let expected = plain.run_iterations(&trace, &[p, Value::Int(5)], 1000).unwrap();

        let mut fast = Interpreter::new(trace.descrs.clone());
        let p = node(&mut fast, &trace, 3);
        let got = peeled.execute(&mut fast, &[p, Value::Int(5)], 1000).unwrap();

        assert_eq!(got.kind(), "guard failure");
        assert_eq!(fast.render_values(got.values()), plain.render_values(expected.values()));
        assert_eq!(fast.render_values(got.values()), "@0 Node{value=3}, 101");
    }

    #[test]
    fn test_virtual_stays_virtual_across_label() {
        let source = "struct Box { v: int }\n---\n\
                      [p0]\n\
                      i1 = getfield_gc_i(p0, descr=Box.v)\n\
                      i2 = int_add(i1, 1)\n\
                      p3 = new(descr=Box)\n\
                      setfield_gc(p3, i2, descr=Box.v)\n\
                      i4 = int_lt(i2, 5)\n\
                      guard_true(i4) [p3]\n\
                      jump(p3)\n";
        let (trace, peeled) = peel(source);
        assert_eq!(peeled.body.count(OpCode::New), 0);
        assert_eq!(peeled.body.count(OpCode::GetfieldGc), 0);
        assert_eq!(peeled.body.inputargs.len(), 1);

        let mut plain = Interpreter::new(trace.descrs.clone());
        let start = plain.parse_value("Box").unwrap();
        let expected = plain.run_iterations(&trace, &[start], 100).unwrap();
        let mut fast = Interpreter::new(trace.descrs.clone());
        let start = fast.parse_value("Box").unwrap();
        let got = peeled.execute(&mut fast, &[start], 100).unwrap();
        assert_eq!(fast.render_values(got.values()), "@0 Box{v=5}");
        assert_eq!(fast.render_values(got.values()), plain.render_values(expected.values()));
    }

    #[test]
    fn test_contradiction_falls_back_to_linear() {
        let trace = parse_trace("[i0]\nguard_value(i0, 3) []\ni1 = int_add(i0, 1)\njump(i1)\n").unwrap();
        let mut unroll = UnrollOptimizer::new(OptimizerConfig::default());
        let err = unroll.optimize_peeled_loop(&trace).unwrap_err();
        assert!(err.is_invalid_loop());
        assert!(matches!(unroll.optimize(&trace).unwrap(), Compiled::Linear(_)));
    }

    #[test]
    fn test_unroll_disabled() {
        let trace = parse_trace(LOOP).unwrap();
        let config = OptimizerConfig {
            unroll: false,
            ..OptimizerConfig::default()
        };
        let compiled = UnrollOptimizer::new(config).optimize(&trace).unwrap();
        assert_eq!(compiled.traces().len(), 1);
    }

    fn bridge() -> Trace {
        parse_trace("struct Node class=1 { value: int }\n---\n[p0, i1]\njump(p0, i1)\n").unwrap()
    }

    #[test]
    fn test_bridge_guards_into_loop() {
        let (trace, peeled) = peel(LOOP);
        let mut token = LoopToken::new(&peeled);
        let runtime = [RuntimeValue::Object { class: Some(1) }, RuntimeValue::Int(5)];
        let mut unroll = UnrollOptimizer::new(OptimizerConfig::default());
        let result = unroll.optimize_bridge(&bridge(), &mut token, Some(&runtime)).unwrap();
        assert_eq!(result.target, Some(0));
        assert!(!result.retrace_requested);
        assert_eq!(
            result.trace.opcodes(),
            vec![
                OpCode::GuardNonnullClass,
                OpCode::IntLe,
                OpCode::GuardTrue,
                OpCode::GetfieldGc,
                OpCode::Jump
            ]
        );

        let mut plain = Interpreter::new(trace.descrs.clone());
        let p = node(&mut plain, &trace, 3);
        let expected = plain.run_iterations(&trace, &[p, Value::Int(5)], 1000).unwrap();
        let mut fast = Interpreter::new(trace.descrs.clone());
        let p = node(&mut fast, &trace, 3);
        let got = peeled.execute_bridge(&mut fast, &result, &[p, Value::Int(5)], 1000).unwrap();
        assert_eq!(fast.render_values(got.values()), plain.render_values(expected.values()));
    }

    #[test]
    fn test_bridge_requests_retrace_once() {
        let (_, peeled) = peel(LOOP);
        let mut token = LoopToken::new(&peeled);
        let runtime = [RuntimeValue::Object { class: Some(1) }, RuntimeValue::Int(500)];
        let mut unroll = UnrollOptimizer::new(OptimizerConfig::default());

        let first = unroll.optimize_bridge(&bridge(), &mut token, Some(&runtime)).unwrap();
        assert_eq!(first.target, None);
        assert!(first.retrace_requested);
        assert_eq!(first.trace.opcodes(), vec![OpCode::Jump]);
        assert_eq!(token.retraces, 1);

        let second = unroll.optimize_bridge(&bridge(), &mut token, Some(&runtime)).unwrap();
        assert!(!second.retrace_requested);
        assert_eq!(token.failed_states.len(), 1);
    }

    #[test]
    fn test_bridge_without_runtime_values_falls_back() {
        let (_, peeled) = peel(LOOP);
        let mut token = LoopToken::new(&peeled);
        let config = OptimizerConfig {
            retrace_limit: 0,
            ..OptimizerConfig::default()
        };
        let result = UnrollOptimizer::new(config)
            .optimize_bridge(&bridge(), &mut token, None)
            .unwrap();
        assert_eq!(result.target, None);
        assert!(!result.retrace_requested);
    }
}
