//! Values a loop body can reuse from the end of its preamble
//!
//! At the end of the preamble the pure and heap caches still know results
//! computed from the label arguments. Each such result becomes a short box:
//! the body imports it as an extra input, and whoever jumps to the body
//! recomputes it through the short preamble.

use crate::ir::{Op, OpCode, OpRef, Operand, Type};
use crate::optimizer::Optimizer;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

/// How a cached value was produced
#[derive(Debug, Clone)]
pub enum ShortProducer {
    /// A pure operation (or elidable call)
    Pure(Op),
    /// A field or constant-index item read
    Heap {
        descr: crate::ir::DescrRef,
        index: Option<i64>,
        obj: Operand,
    },
}

/// One reusable value
#[derive(Debug, Clone)]
pub struct ShortBox {
    /// The value in the preamble
    pub value: OpRef,
    pub ty: Type,
    /// The operation recomputing it, over preamble operands
    pub op: Op,
    /// Every cache entry that produces the value, the first one builds `op`
    pub producers: Vec<ShortProducer>,
}

/// Where an operand of a short operation comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    Leaf(usize),
    Short(usize),
}

#[derive(Debug, Default)]
pub struct ShortBoxes {
    pub boxes: Vec<ShortBox>,
    sources: HashMap<OpRef, Source>,
}

struct Candidate {
    producer: ShortProducer,
    op: Op,
    value: OpRef,
}

impl ShortBoxes {
    /// Collect short boxes over the label arguments `leaves`
    pub(crate) fn collect(opt: &Optimizer, leaves: &[Operand]) -> Self {
        let mut shorts = ShortBoxes::default();
        for (k, leaf) in leaves.iter().enumerate() {
            if let Operand::Op(r) = opt.resolve(leaf) {
                shorts.sources.entry(r).or_insert(Source::Leaf(k));
            }
        }
        let emitted: HashSet<OpRef> = opt.out.iter().chain(&opt.inputargs).copied().collect();

        // pure producers first, so they win over heap reads of the same value
        let mut candidates: Vec<Option<Candidate>> = Vec::new();
        for (opcode, args, descr, value) in opt.pure_entries() {
            if !short_opcode(opt, opcode, descr) {
                continue;
            }
            let Operand::Op(value) = value else {
                continue;
            };
            let mut op = Op::new(opcode, opt.op(value).ty, args);
            op.descr = descr;
            candidates.push(Some(Candidate {
                producer: ShortProducer::Pure(op.clone()),
                op,
                value,
            }));
        }
        for (descr, index, obj, value) in opt.heap_entries() {
            let Operand::Op(value) = value else {
                continue;
            };
            let op = match (index, opt.descrs.interior(descr)) {
                (None, _) => Op::new(OpCode::GetfieldGc, opt.op(value).ty, vec![obj.clone()]),
                (Some(i), Some(_)) => Op::new(
                    OpCode::GetinteriorfieldGc,
                    opt.op(value).ty,
                    vec![obj.clone(), Operand::int(i)],
                ),
                (Some(i), None) => Op::new(
                    OpCode::GetarrayitemGc,
                    opt.op(value).ty,
                    vec![obj.clone(), Operand::int(i)],
                ),
            }
            .with_descr(descr);
            candidates.push(Some(Candidate {
                producer: ShortProducer::Heap { descr, index, obj },
                op,
                value,
            }));
        }

        loop {
            let mut progress = false;
            for slot in candidates.iter_mut() {
                let ready = slot.as_ref().is_some_and(|c| {
                    emitted.contains(&c.value)
                        && !opt.is_virtual(&Operand::Op(c.value))
                        && c.op.args.iter().all(|a| shorts.available(opt, a))
                });
                if !ready {
                    continue;
                }
                let Some(candidate) = slot.take() else {
                    continue;
                };
                progress = true;
                match shorts.sources.get(&candidate.value) {
                    Some(Source::Leaf(_)) => {}
                    Some(&Source::Short(idx)) => shorts.boxes[idx].producers.push(candidate.producer),
                    None => {
                        shorts.sources.insert(candidate.value, Source::Short(shorts.boxes.len()));
                        shorts.boxes.push(ShortBox {
                            value: candidate.value,
                            ty: candidate.op.ty,
                            op: candidate.op,
                            producers: vec![candidate.producer],
                        });
                    }
                }
            }
            if !progress {
                break;
            }
        }
        shorts
    }

    fn available(&self, opt: &Optimizer, arg: &Operand) -> bool {
        match arg {
            Operand::Const(_) => true,
            Operand::Op(r) => !opt.is_virtual(arg) && self.sources.contains_key(r),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Rewrite a preamble operand in terms of new leaves and short values
    pub(crate) fn map_operand(
        &self,
        arg: &Operand,
        leaves: &[Operand],
        shorts: &[Option<Operand>],
    ) -> Option<Operand> {
        match arg {
            Operand::Const(_) => Some(arg.clone()),
            Operand::Op(r) => match self.sources.get(r)? {
                Source::Leaf(k) => leaves.get(*k).cloned(),
                Source::Short(j) => shorts.get(*j).cloned().flatten(),
            },
        }
    }

    /// Short boxes the operation of `idx` reads
    pub(crate) fn dependencies(&self, idx: usize) -> Vec<usize> {
        self.boxes[idx]
            .op
            .args
            .iter()
            .filter_map(|a| match a {
                Operand::Op(r) => match self.sources.get(r) {
                    Some(Source::Short(j)) => Some(*j),
                    _ => None,
                },
                Operand::Const(_) => None,
            })
            .collect()
    }

    /// `wanted` plus everything it depends on, in dependency order
    pub(crate) fn closure(&self, wanted: &[usize]) -> Vec<usize> {
        let mut keep = vec![false; self.boxes.len()];
        let mut stack: Vec<usize> = wanted.to_vec();
        while let Some(idx) = stack.pop() {
            if !std::mem::replace(&mut keep[idx], true) {
                stack.extend(self.dependencies(idx));
            }
        }
        (0..self.boxes.len()).filter(|&i| keep[i]).collect()
    }

    /// Teach a fresh body's caches that each short value is already known
    pub(crate) fn register(&self, opt: &mut Optimizer, leaves: &[Operand], shorts: &[Operand]) {
        let shorts: Vec<Option<Operand>> = shorts.iter().cloned().map(Some).collect();
        for (idx, shortbox) in self.boxes.iter().enumerate() {
            let value = shorts[idx].clone();
            let Some(value) = value else {
                continue;
            };
            for producer in &shortbox.producers {
                match producer {
                    ShortProducer::Pure(op) => {
                        let args: Option<Vec<Operand>> =
                            op.args.iter().map(|a| self.map_operand(a, leaves, &shorts)).collect();
                        if let Some(args) = args {
                            opt.record_pure_with_descr(op.opcode, args, op.descr, value.clone());
                        }
                    }
                    ShortProducer::Heap { descr, index, obj } => {
                        if let Some(obj) = self.map_operand(obj, leaves, &shorts) {
                            opt.heap_import(*descr, *index, &obj, value.clone());
                        }
                    }
                }
            }
        }
    }
}

/// Operations worth carrying across the label: pure, guard-free, and calls
/// only when elidable and unable to raise
fn short_opcode(opt: &Optimizer, opcode: OpCode, descr: Option<crate::ir::DescrRef>) -> bool {
    if opcode.is_ovf() || opcode.is_guard() {
        return false;
    }
    if opcode.is_call() {
        return descr
            .and_then(|d| opt.descrs.effect(d))
            .is_some_and(|e| e.is_elidable() && !e.can_raise());
    }
    opcode.is_always_pure()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_trace;

    fn shorts_of(source: &str) -> (Optimizer, ShortBoxes) {
        let trace = parse_trace(source).unwrap();
        let mut opt = Optimizer::new();
        opt.start(&trace);
        let (&last, ops) = trace.ops.split_last().unwrap();
        for &r in ops {
            opt.propagate_input(r).unwrap();
        }
        opt.flush().unwrap();
        let leaves: Vec<Operand> = trace.op(last).args.iter().map(|a| opt.resolve(a)).collect();
        let shorts = ShortBoxes::collect(&opt, &leaves);
        (opt, shorts)
    }

    #[test]
    fn test_pure_and_heap_values_collected() {
        let (_, shorts) = shorts_of(
            "struct Node { value: int }\n---\n\
             [i0, p1]\n\
             i2 = int_add(i0, 1)\n\
             i3 = getfield_gc_i(p1, descr=Node.value)\n\
             escape(i2, i3)\n\
             jump(i0, p1)\n",
        );
        let opcodes: Vec<OpCode> = shorts.boxes.iter().map(|b| b.op.opcode).collect();
        assert_eq!(opcodes, vec![OpCode::IntAdd, OpCode::GetfieldGc]);
    }

    #[test]
    fn test_values_over_dead_inputs_skipped() {
        let (_, shorts) = shorts_of("[i0, i1]\ni2 = int_mul(i0, i1)\nescape(i2)\njump(i0)\n");
        assert!(shorts.is_empty());
    }

    #[test]
    fn test_dependent_boxes_ordered() {
        let (_, shorts) = shorts_of(
            "struct Node { next: ref, value: int }\n---\n\
             [p0]\n\
             p1 = getfield_gc_r(p0, descr=Node.next)\n\
             i2 = getfield_gc_i(p1, descr=Node.value)\n\
             escape(i2)\n\
             jump(p0)\n",
        );
        assert_eq!(shorts.len(), 2);
        assert_eq!(shorts.dependencies(1), vec![0]);
        assert_eq!(shorts.closure(&[1]), vec![0, 1]);
    }

    #[test]
    fn test_reverse_entries_onto_leaves_ignored() {
        let (_, shorts) = shorts_of("[i0, i1]\ni2 = int_add(i0, i1)\nescape(i2)\njump(i0, i1, i2)\n");
        assert!(shorts.is_empty());
    }
}
