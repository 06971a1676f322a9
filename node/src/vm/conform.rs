// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::eval::Eval;
use super::fault::{Fault, VmError};
use super::hook::Hook;
use super::Vm;
use async_trait::async_trait;
use hsvm_kernel::{Conforms, Event};

/// Rejects PDUs failing the conformity check, less the tolerated failures.
pub struct ConformHook;

#[async_trait]
impl Hook for ConformHook {
    fn name(&self) -> &str {
        "conform"
    }

    fn matches(&self, event: &Event) -> bool {
        !event.is_edu()
    }

    async fn handle(&self, _vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        if !eval.opts.conforming || eval.opts.edu {
            return Ok(());
        }
        let report = Conforms::check(event).without(eval.opts.non_conform);
        eval.report = report;
        if report.clean() {
            return Ok(());
        }
        Err(VmError::new(Fault::Invalid, format!("Non-conforming event: {report}")))
    }
}
