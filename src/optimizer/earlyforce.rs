//! Force virtual arguments before the pure and heap caches see them

use super::{Flow, Optimizer};
use crate::error::Result;
use crate::ir::{OpCode, OpRef, OopSpec};

impl Optimizer {
    /// Operations that may keep a virtual argument virtual
    fn keeps_virtual_args(&self, r: OpRef) -> bool {
        use OpCode::*;
        let opcode = self.op(r).opcode;
        match opcode {
            SetfieldGc | SetarrayitemGc | SetinteriorfieldGc | SetarrayitemRaw | RawStore
            | QuasiimmutField | SameAs | MarkOpaquePtr | Jump | Finish | Label
            | VirtualRefFinish => true,
            Call => self
                .effect_of(r)
                .is_some_and(|e| e.oopspec() == OopSpec::RawFree),
            _ => opcode.is_guard(),
        }
    }

    pub(crate) fn optimize_earlyforce(&mut self, r: OpRef) -> Result<Flow> {
        if self.keeps_virtual_args(r) {
            return Ok(Flow::Emit(r));
        }
        let nargs = self.op(r).args.len();
        for i in 0..nargs {
            let arg = self.arg(r, i);
            if self.is_virtual(&arg) {
                let forced = self.force_box(&arg)?;
                self.op_mut(r).args[i] = forced;
            }
        }
        Ok(Flow::Emit(r))
    }
}
