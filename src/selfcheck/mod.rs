//! Random differential testing of the optimizer
//!
//! A recorder builds a trace by choosing random operations over a small heap
//! of `Node` structs and integer arrays. Every guard it records is checked
//! against the value the reference interpreter computes for the trace so far,
//! so the recorded trace passes for its recorded inputs. Each trace is then
//! optimized and both versions are run side by side.

use crate::error::{Error, Result};
use crate::interp::{Interpreter, Outcome, Value};
use crate::ir::parser::parse_trace;
use crate::ir::OpRef;
use crate::optimizer::OptimizerConfig;
use crate::unroll::UnrollOptimizer;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Items in every recorded array
const ARRAY_LEN: i64 = 4;
/// Original loop iterations executed per check
const ITERATIONS: usize = 3;

const STRUCTS: &str = "struct Node class=1 { value: int, next: ref }\narray IntArr int\n";
const READS_ALL: &str = "reads=Node.value reads=Node.next reads=IntArr";

/// A recorded trace together with the inputs it was recorded for
#[derive(Debug, Clone)]
pub struct Recorded {
    pub source: String,
    /// Input values in the interpreter's value syntax
    pub inputs: Vec<String>,
    pub is_loop: bool,
}

/// One trace whose optimized version behaved differently
#[derive(Debug, Clone, Serialize)]
pub struct SelfcheckFailure {
    pub index: usize,
    /// Seed that records this trace again
    pub seed: u64,
    pub reason: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SelfcheckReport {
    pub checked: usize,
    pub loops: usize,
    /// Runs that left through a guard on later iterations
    pub guard_failures: usize,
    pub failures: Vec<SelfcheckFailure>,
}

impl SelfcheckReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for SelfcheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "checked {} traces ({} loops, {} guard failures): {} mismatches",
            self.checked,
            self.loops,
            self.guard_failures,
            self.failures.len()
        )?;
        for failure in &self.failures {
            writeln!(f, "--- trace {} (seed {}): {}", failure.index, failure.seed, failure.reason)?;
            write!(f, "{}", failure.source)?;
        }
        Ok(())
    }
}

/// Record `count` random traces from `seed` and check each one
pub fn run_selfcheck(seed: u64, count: usize) -> Result<SelfcheckReport> {
    run_selfcheck_with(seed, count, &OptimizerConfig::default())
}

pub fn run_selfcheck_with(seed: u64, count: usize, config: &OptimizerConfig) -> Result<SelfcheckReport> {
    let mut report = SelfcheckReport::default();
    for index in 0..count {
        let trace_seed = seed.wrapping_mul(1_000_003).wrapping_add(index as u64);
        let recorded = record(trace_seed)?;
        report.checked += 1;
        if recorded.is_loop {
            report.loops += 1;
        }
        match check_recorded(&recorded, config)? {
            Check::Same { guard_failed } => {
                if guard_failed {
                    report.guard_failures += 1;
                }
                debug!(index, seed = trace_seed, "trace agrees");
            }
            Check::Differs(reason) => {
                warn!(index, seed = trace_seed, %reason, "optimized trace disagrees");
                report.failures.push(SelfcheckFailure {
                    index,
                    seed: trace_seed,
                    reason,
                    source: recorded.source,
                });
            }
        }
    }
    info!(
        checked = report.checked,
        loops = report.loops,
        failures = report.failures.len(),
        "selfcheck finished"
    );
    Ok(report)
}

/// Result of comparing one trace against its optimized version
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Same { guard_failed: bool },
    Differs(String),
}

/// What a run shows to the outside
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub kind: &'static str,
    /// Guard the run left through
    pub origin: Option<OpRef>,
    /// Rendered result or recovered values
    pub values: String,
    pub log: Vec<String>,
}

impl Observed {
    fn new(interp: &Interpreter, outcome: &Outcome) -> Self {
        let origin = match outcome {
            Outcome::GuardFailed { origin, .. } => Some(*origin),
            _ => None,
        };
        Observed {
            kind: outcome.kind(),
            origin,
            values: interp.render_values(outcome.values()),
            log: interp.log().to_vec(),
        }
    }
}

impl fmt::Display for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(origin) = self.origin {
            write!(f, " at #{}", origin.0)?;
        }
        write!(f, ": [{}]", self.values)?;
        for event in &self.log {
            write!(f, "\n  {}", event)?;
        }
        Ok(())
    }
}

/// Both runs of one trace and the verdict
#[derive(Debug, Clone)]
pub struct Comparison {
    pub expected: Observed,
    /// `None` when the optimized version could not be built or run
    pub actual: Option<Observed>,
    pub check: Check,
}

fn inputs_for(interp: &mut Interpreter, inputs: &[String]) -> Result<Vec<Value>> {
    inputs.iter().map(|text| interp.parse_value(text)).collect()
}

/// Run a recorded trace unoptimized and optimized and compare what both show
pub fn check_recorded(recorded: &Recorded, config: &OptimizerConfig) -> Result<Check> {
    Ok(compare_source(&recorded.source, &recorded.inputs, config, ITERATIONS)?.check)
}

/// Run a trace text for at most `iterations` loop passes, before and after
/// optimizing, on inputs in the interpreter's value syntax
pub fn compare_source(
    source: &str,
    inputs: &[String],
    config: &OptimizerConfig,
    iterations: usize,
) -> Result<Comparison> {
    let trace = parse_trace(source)?;

    let mut reference = Interpreter::new(trace.descrs.clone());
    let args = inputs_for(&mut reference, inputs)?;
    let outcome = reference.run_iterations(&trace, &args, iterations)?;
    let expected = Observed::new(&reference, &outcome);

    let failed = |expected: Observed, reason: String| Comparison {
        expected,
        actual: None,
        check: Check::Differs(reason),
    };
    let compiled = match UnrollOptimizer::new(config.clone()).optimize(&trace) {
        Ok(compiled) => compiled,
        Err(e) => return Ok(failed(expected, format!("optimizer failed: {}", e))),
    };
    let mut interp = Interpreter::new(trace.descrs.clone());
    let args = inputs_for(&mut interp, inputs)?;
    let outcome = match compiled.execute(&mut interp, &args, iterations) {
        Ok(outcome) => outcome,
        Err(e) => return Ok(failed(expected, format!("optimized trace failed to run: {}", e))),
    };
    let actual = Observed::new(&interp, &outcome);

    let check = match compare(&expected, &actual) {
        Some(reason) => Check::Differs(reason),
        None => Check::Same {
            guard_failed: expected.kind == "guard failure",
        },
    };
    Ok(Comparison {
        expected,
        actual: Some(actual),
        check,
    })
}

fn compare(expected: &Observed, actual: &Observed) -> Option<String> {
    if expected.kind != actual.kind {
        return Some(format!("expected a {}, got a {}", expected.kind, actual.kind));
    }
    match expected.kind {
        "guard failure" => {
            if !expected.log.starts_with(&actual.log) {
                return Some(format!(
                    "log {:?} is not a prefix of {:?}",
                    actual.log, expected.log
                ));
            }
            if expected.origin == actual.origin && expected.values != actual.values {
                return Some(format!(
                    "guard failure restored [{}] instead of [{}]",
                    actual.values, expected.values
                ));
            }
        }
        "finish" if expected.values != actual.values => {
            return Some(format!("finished with [{}] instead of [{}]", actual.values, expected.values));
        }
        _ => {}
    }
    if expected.kind != "guard failure" && expected.log != actual.log {
        return Some(format!("log {:?} instead of {:?}", actual.log, expected.log));
    }
    None
}

// ========== Recording ==========

/// Record one random trace
pub fn record(seed: u64) -> Result<Recorded> {
    let mut recorder = Recorder::new(StdRng::seed_from_u64(seed));
    recorder.record()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Int,
    Node,
    Array,
}

struct Recorder {
    rng: StdRng,
    decls: String,
    /// Calls with effects, with their argument slots and whether they return an int
    calls: Vec<(String, Vec<Slot>, bool)>,
    params: Vec<(String, Slot)>,
    inputs: Vec<String>,
    lines: Vec<String>,
    counter: usize,
    ints: Vec<String>,
    /// Refs known to hold a `Node`
    nodes: Vec<String>,
    /// Refs read from `next` fields, possibly NULL
    maybe: Vec<String>,
    arrays: Vec<String>,
}

impl Recorder {
    fn new(rng: StdRng) -> Self {
        Recorder {
            rng,
            decls: String::from(STRUCTS),
            calls: Vec::new(),
            params: Vec::new(),
            inputs: Vec::new(),
            lines: Vec::new(),
            counter: 0,
            ints: Vec::new(),
            nodes: Vec::new(),
            maybe: Vec::new(),
            arrays: Vec::new(),
        }
    }

    fn fresh(&mut self, prefix: char) -> String {
        let name = format!("{}{}", prefix, self.counter);
        self.counter += 1;
        name
    }

    fn declare_calls(&mut self) {
        self.decls.push_str("call mix(int, int) -> int elidable\n");
        let shapes = [
            (vec![Slot::Int], false),
            (vec![Slot::Node], false),
            (vec![Slot::Int, Slot::Node], true),
            (vec![Slot::Array], false),
        ];
        let writable = ["Node.value", "Node.next", "IntArr"];
        for k in 0..3 {
            let (args, returns) = shapes[self.rng.gen_range(0..shapes.len())].clone();
            let name = format!("f{}", k);
            let mut flags = Vec::new();
            if self.rng.gen_bool(0.15) {
                flags.push("random".to_string());
            } else {
                for descr in writable {
                    if self.rng.gen_bool(0.4) {
                        flags.push(format!("writes={}", descr));
                    }
                }
            }
            // called code prints its reference arguments, so it reads them
            if args.iter().any(|s| *s != Slot::Int) {
                flags.push(READS_ALL.to_string());
            }
            let types: Vec<&str> = args
                .iter()
                .map(|s| if *s == Slot::Int { "int" } else { "ref" })
                .collect();
            self.decls.push_str(&format!(
                "call {}({}) -> {} {}\n",
                name,
                types.join(", "),
                if returns { "int" } else { "void" },
                flags.join(" ")
            ));
            self.calls.push((name, args, returns));
        }
    }

    fn add_params(&mut self) {
        let node_count = self.rng.gen_range(1..=2);
        let int_count = self.rng.gen_range(1..=3);
        for _ in 0..node_count {
            let name = self.fresh('p');
            self.params.push((name.clone(), Slot::Node));
            self.inputs.push("Node".to_string());
            self.nodes.push(name);
        }
        if self.rng.gen_bool(0.6) {
            let name = self.fresh('p');
            self.params.push((name.clone(), Slot::Array));
            self.inputs.push(format!("IntArr[{}]", ARRAY_LEN));
            self.arrays.push(name);
        }
        for _ in 0..int_count {
            let name = self.fresh('i');
            self.params.push((name.clone(), Slot::Int));
            self.inputs.push(self.rng.gen_range(-5..=20i64).to_string());
            self.ints.push(name);
        }
    }

    fn source_with(&self, last: &str) -> String {
        let names: Vec<&str> = self.params.iter().map(|(n, _)| n.as_str()).collect();
        let mut source = format!("{}---\n[{}]\n", self.decls, names.join(", "));
        for line in &self.lines {
            source.push_str(line);
            source.push('\n');
        }
        source.push_str(last);
        source.push('\n');
        source
    }

    /// The value `name` holds when the trace so far runs on the inputs
    fn observe(&self, name: &str) -> Result<Value> {
        let trace = parse_trace(&self.source_with(&format!("finish({})", name)))?;
        let mut interp = Interpreter::new(trace.descrs.clone());
        let args = inputs_for(&mut interp, &self.inputs)?;
        match interp.run(&trace, &args)? {
            Outcome::Finished(values) => values
                .first()
                .copied()
                .ok_or_else(|| Error::internal("recorded prefix finished without a value")),
            other => Err(Error::internal(format!(
                "recorded prefix ended with a {}",
                other.kind()
            ))),
        }
    }

    fn pick(&mut self, pool: &[String]) -> Option<String> {
        pool.choose(&mut self.rng).cloned()
    }

    fn int_operand(&mut self) -> String {
        if self.ints.is_empty() || self.rng.gen_bool(0.3) {
            self.rng.gen_range(-5..=20i64).to_string()
        } else {
            let ints = self.ints.clone();
            self.pick(&ints).unwrap_or_else(|| "0".to_string())
        }
    }

    fn fail_args(&mut self) -> String {
        let mut live: Vec<String> = Vec::new();
        live.extend(self.ints.iter().cloned());
        live.extend(self.nodes.iter().cloned());
        live.extend(self.maybe.iter().cloned());
        live.extend(self.arrays.iter().cloned());
        let count = self.rng.gen_range(0..=3).min(live.len());
        let chosen: Vec<String> = live.choose_multiple(&mut self.rng, count).cloned().collect();
        format!("[{}]", chosen.join(", "))
    }

    fn record(&mut self) -> Result<Recorded> {
        self.declare_calls();
        self.add_params();
        let steps = self.rng.gen_range(5..25);
        for _ in 0..steps {
            self.step()?;
        }
        let is_loop = self.rng.gen_bool(0.5);
        let last = if is_loop {
            let mut args = Vec::new();
            for (_, slot) in self.params.clone() {
                let pool = match slot {
                    Slot::Int => self.ints.clone(),
                    Slot::Node => self.nodes.clone(),
                    Slot::Array => self.arrays.clone(),
                };
                args.push(self.pick(&pool).unwrap_or_default());
            }
            format!("jump({})", args.join(", "))
        } else {
            let mut live: Vec<String> = self.ints.clone();
            live.extend(self.nodes.iter().cloned());
            live.extend(self.maybe.iter().cloned());
            let count = self.rng.gen_range(0..=4).min(live.len());
            let chosen: Vec<String> = live.choose_multiple(&mut self.rng, count).cloned().collect();
            format!("finish({})", chosen.join(", "))
        };
        Ok(Recorded {
            source: self.source_with(&last),
            inputs: self.inputs.clone(),
            is_loop,
        })
    }

    fn step(&mut self) -> Result<()> {
        match self.rng.gen_range(0..14) {
            0 | 1 => self.binop(),
            2 | 3 => self.compare_and_guard()?,
            4 => self.read_value(),
            5 => self.write_value(),
            6 => self.link(),
            7 => self.follow()?,
            8 => self.array_access(),
            9 => self.allocate(),
            10 => self.call(),
            11 => self.pure_call(),
            12 => self.escape(),
            _ => self.guard_value()?,
        }
        Ok(())
    }

    fn binop(&mut self) {
        let ops = ["int_add", "int_sub", "int_mul", "int_and", "int_or", "int_xor"];
        let op = ops[self.rng.gen_range(0..ops.len())];
        let a = self.int_operand();
        let b = self.int_operand();
        let r = self.fresh('i');
        self.lines.push(format!("{} = {}({}, {})", r, op, a, b));
        self.ints.push(r);
    }

    fn compare_and_guard(&mut self) -> Result<()> {
        let ops = ["int_lt", "int_le", "int_gt", "int_ge", "int_eq", "int_ne"];
        let op = ops[self.rng.gen_range(0..ops.len())];
        let a = self.int_operand();
        let b = self.int_operand();
        let r = self.fresh('i');
        self.lines.push(format!("{} = {}({}, {})", r, op, a, b));
        let taken = self.observe(&r)?.as_int()? != 0;
        let guard = if taken { "guard_true" } else { "guard_false" };
        let fail_args = self.fail_args();
        self.lines.push(format!("{}({}) {}", guard, r, fail_args));
        Ok(())
    }

    fn guard_value(&mut self) -> Result<()> {
        let Some(a) = self.pick(&self.ints.clone()) else {
            return Ok(());
        };
        let value = self.observe(&a)?.as_int()?;
        let fail_args = self.fail_args();
        self.lines.push(format!("guard_value({}, {}) {}", a, value, fail_args));
        Ok(())
    }

    fn read_value(&mut self) {
        let Some(node) = self.pick(&self.nodes.clone()) else {
            return;
        };
        let r = self.fresh('i');
        self.lines.push(format!("{} = getfield_gc_i({}, descr=Node.value)", r, node));
        self.ints.push(r);
    }

    fn write_value(&mut self) {
        let Some(node) = self.pick(&self.nodes.clone()) else {
            return;
        };
        let value = self.int_operand();
        self.lines.push(format!("setfield_gc({}, {}, descr=Node.value)", node, value));
    }

    fn link(&mut self) {
        let Some(node) = self.pick(&self.nodes.clone()) else {
            return;
        };
        let mut targets = self.nodes.clone();
        targets.extend(self.maybe.iter().cloned());
        targets.push("NULL".to_string());
        let Some(target) = self.pick(&targets) else {
            return;
        };
        self.lines.push(format!("setfield_gc({}, {}, descr=Node.next)", node, target));
    }

    /// Read a `next` field and guard on what it holds
    fn follow(&mut self) -> Result<()> {
        let Some(node) = self.pick(&self.nodes.clone()) else {
            return Ok(());
        };
        let r = self.fresh('p');
        self.lines.push(format!("{} = getfield_gc_r({}, descr=Node.next)", r, node));
        if self.rng.gen_bool(0.5) {
            self.maybe.push(r);
            return Ok(());
        }
        let fail_args = self.fail_args();
        if self.observe(&r)?.as_ref()?.is_some() {
            self.lines
                .push(format!("guard_nonnull_class({}, ConstClass(Node)) {}", r, fail_args));
            self.nodes.push(r);
        } else {
            self.lines.push(format!("guard_isnull({}) {}", r, fail_args));
        }
        Ok(())
    }

    fn array_access(&mut self) {
        let Some(array) = self.pick(&self.arrays.clone()) else {
            return;
        };
        let index = if self.ints.is_empty() || self.rng.gen_bool(0.6) {
            self.rng.gen_range(0..ARRAY_LEN).to_string()
        } else {
            let source = self.int_operand();
            let r = self.fresh('i');
            self.lines.push(format!("{} = int_and({}, {})", r, source, ARRAY_LEN - 1));
            r
        };
        match self.rng.gen_range(0..3) {
            0 => {
                let value = self.int_operand();
                self.lines
                    .push(format!("setarrayitem_gc({}, {}, {}, descr=IntArr)", array, index, value));
            }
            1 => {
                let r = self.fresh('i');
                self.lines.push(format!("{} = arraylen_gc({}, descr=IntArr)", r, array));
                self.ints.push(r);
            }
            _ => {
                let r = self.fresh('i');
                self.lines
                    .push(format!("{} = getarrayitem_gc_i({}, {}, descr=IntArr)", r, array, index));
                self.ints.push(r);
            }
        }
    }

    fn allocate(&mut self) {
        if self.rng.gen_bool(0.25) {
            let r = self.fresh('p');
            self.lines
                .push(format!("{} = new_array_clear({}, descr=IntArr)", r, ARRAY_LEN));
            self.arrays.push(r);
            return;
        }
        let r = self.fresh('p');
        self.lines.push(format!("{} = new_with_vtable(descr=Node)", r));
        let value = self.int_operand();
        self.lines.push(format!("setfield_gc({}, {}, descr=Node.value)", r, value));
        self.nodes.push(r);
    }

    fn call(&mut self) {
        let Some((name, slots, returns)) = self.calls.choose(&mut self.rng).cloned() else {
            return;
        };
        let mut args = Vec::new();
        for slot in slots {
            let arg = match slot {
                Slot::Int => Some(self.int_operand()),
                Slot::Node => self.pick(&self.nodes.clone()),
                Slot::Array => self.pick(&self.arrays.clone()),
            };
            let Some(arg) = arg else {
                return;
            };
            args.push(arg);
        }
        if returns {
            let r = self.fresh('i');
            self.lines
                .push(format!("{} = call_i({}, descr={})", r, args.join(", "), name));
            self.ints.push(r);
        } else {
            self.lines.push(format!("call_n({}, descr={})", args.join(", "), name));
        }
    }

    fn pure_call(&mut self) {
        let a = self.int_operand();
        let b = self.int_operand();
        let r = self.fresh('i');
        self.lines.push(format!("{} = call_i({}, {}, descr=mix)", r, a, b));
        self.ints.push(r);
    }

    fn escape(&mut self) {
        let mut live: Vec<String> = self.ints.clone();
        live.extend(self.nodes.iter().cloned());
        if let Some(value) = self.pick(&live) {
            self.lines.push(format!("escape({})", value));
        }
    }
}
