// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Extension points.
//!
//! Handlers attach to a `Stage` and run in registration order each time an
//! evaluation reaches the corresponding phase. A handler that returns an
//! error aborts its stage and, for every stage but the notify and effect
//! stages, the evaluation.

use super::eval::Eval;
use super::fault::VmError;
use super::Vm;
use async_trait::async_trait;
use hsvm_kernel::Event;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Issue,
    Conform,
    Access,
    Fetch,
    Eval,
    Post,
    Notify,
    Effect,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Issue,
        Stage::Conform,
        Stage::Access,
        Stage::Fetch,
        Stage::Eval,
        Stage::Post,
        Stage::Notify,
        Stage::Effect,
    ];

    /// Whether handler failures fault the evaluation.
    pub fn propagates(self) -> bool {
        !matches!(self, Stage::Notify | Stage::Effect)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Issue => "vm.issue",
            Stage::Conform => "vm.conform",
            Stage::Access => "vm.access",
            Stage::Fetch => "vm.fetch",
            Stage::Eval => "vm.eval",
            Stage::Post => "vm.post",
            Stage::Notify => "vm.notify",
            Stage::Effect => "vm.effect",
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Event filter; every event by default.
    fn matches(&self, _event: &Event) -> bool {
        true
    }

    async fn handle(&self, vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError>;
}

type Handlers = RwLock<Vec<Arc<dyn Hook>>>;

#[derive(Default)]
pub struct Pipeline {
    stages: [Handlers; 8],
}

impl Pipeline {
    pub fn register(&self, stage: Stage, hook: Arc<dyn Hook>) {
        self.stages[stage as usize].write().push(hook);
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.stages[stage as usize].read().len()
    }

    /// Run the handlers of `stage` for `event`.
    pub async fn call(&self, stage: Stage, vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        let handlers: Vec<Arc<dyn Hook>> = self.stages[stage as usize].read().clone();
        for hook in handlers.iter().filter(|h| h.matches(event)) {
            if let Err(e) = hook.handle(vm, eval, event).await {
                if stage.propagates() {
                    return Err(e);
                }
                warn!("{} {} handler {} :{}", eval.loghead(), stage.name(), hook.name(), e);
            }
        }
        Ok(())
    }
}
