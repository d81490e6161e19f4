//! Shared test helpers for integration tests

use traceopt::interp::{Interpreter, Outcome, Value};
use traceopt::ir::parser::parse_trace;
use traceopt::ir::{OpCode, Trace};
use traceopt::optimizer::{OptStats, Optimizer, OptimizerConfig};
use traceopt::selfcheck::{compare_source, Check};
use traceopt::unroll::{PeeledLoop, UnrollOptimizer};

/// Declarations most tests share
#[allow(dead_code)]
pub const DECLS: &str = "struct Node class=1 { value: int, next: ref }\n\
                         struct Other class=2 { value: int }\n\
                         array IntArr int\n\
                         call writer(ref) -> int writes=Node.value reads=Node.value\n\
                         call reader(ref) -> int reads=Node.value reads=Node.next\n\
                         call opaque(int) -> int\n\
                         call mix(int, int) -> int elidable\n";

/// Parse a trace body that uses [`DECLS`]
#[allow(dead_code)]
pub fn with_decls(body: &str) -> String {
    format!("{}---\n{}", DECLS, body)
}

/// Parse a trace in the text format
#[allow(dead_code)]
pub fn parse(source: &str) -> Trace {
    parse_trace(source).unwrap_or_else(|e| panic!("could not parse:\n{}\n{}", source, e))
}

/// Optimize a trace as a straight line
#[allow(dead_code)]
pub fn optimize(source: &str) -> Trace {
    optimize_with_stats(source).0
}

#[allow(dead_code)]
pub fn optimize_with_stats(source: &str) -> (Trace, OptStats) {
    let trace = parse(source);
    let mut opt = Optimizer::new();
    let out = opt
        .optimize(&trace)
        .unwrap_or_else(|e| panic!("could not optimize:\n{}\n{}", source, e));
    (out, opt.stats().clone())
}

/// Peel a loop with the default configuration
#[allow(dead_code)]
pub fn peel(source: &str) -> PeeledLoop {
    let trace = parse(source);
    UnrollOptimizer::new(OptimizerConfig::default())
        .optimize_peeled_loop(&trace)
        .unwrap_or_else(|e| panic!("could not peel:\n{}\n{}", source, e))
}

/// Opcodes of a trace, in order
#[allow(dead_code)]
pub fn opcodes(trace: &Trace) -> Vec<OpCode> {
    trace.opcodes()
}

/// Run a trace in the reference interpreter on inputs in value syntax
#[allow(dead_code)]
pub fn run(trace: &Trace, inputs: &[&str]) -> (Outcome, String, Vec<String>) {
    let mut interp = Interpreter::new(trace.descrs.clone());
    let args: Vec<Value> = inputs
        .iter()
        .map(|text| interp.parse_value(text).unwrap())
        .collect();
    let outcome = interp.run(trace, &args).unwrap();
    let rendered = interp.render_values(outcome.values());
    let log = interp.log().to_vec();
    (outcome, rendered, log)
}

/// Assert that optimizing does not change what the trace shows
#[allow(dead_code)]
pub fn assert_same_behavior(source: &str, inputs: &[&str], iterations: usize) {
    let inputs: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
    let comparison = compare_source(source, &inputs, &OptimizerConfig::default(), iterations)
        .unwrap_or_else(|e| panic!("could not run:\n{}\n{}", source, e));
    if let Check::Differs(reason) = comparison.check {
        panic!(
            "optimized trace differs: {}\nexpected {}\n{}",
            reason, comparison.expected, source
        );
    }
}
