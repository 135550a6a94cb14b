//! First-match transition resolution.

use crate::definition::{DefinitionSet, StateDefinition, Transition};
use crate::guard::{GuardContext, GuardEvaluator};
use crate::input::OTHER;

/// Outcome of resolving a state's transitions against one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Next state; the current state when nothing matched.
    pub next_state: String,
    /// Action ids to run, reserved scratch actions included.
    pub actions: Vec<String>,
    pub matched: bool,
}

/// Returns the first transition of `state` whose inputs all pass, in declaration order.
pub fn resolve(
    defs: &DefinitionSet,
    state: &StateDefinition,
    ctx: &GuardContext<'_>,
) -> Resolution {
    for transition in &state.transitions {
        if inputs_pass(defs, transition, ctx) {
            tracing::debug!(
                "Scenario {} matched {} -> {} on '{}'",
                ctx.scenario,
                state.name,
                transition.target,
                ctx.event.name
            );
            return Resolution {
                next_state: transition.target.clone(),
                actions: transition.action_ids(),
                matched: true,
            };
        }
    }

    Resolution {
        next_state: state.name.clone(),
        actions: Vec::new(),
        matched: false,
    }
}

fn inputs_pass(defs: &DefinitionSet, transition: &Transition, ctx: &GuardContext<'_>) -> bool {
    transition.inputs.iter().all(|id| {
        if id == OTHER {
            return true;
        }
        match defs.test(id) {
            Ok(input) => GuardEvaluator::accept(input.try_evaluate(ctx), ctx),
            Err(e) => {
                tracing::error!("Transition input lookup failed: {}", e);
                false
            }
        }
    })
}
