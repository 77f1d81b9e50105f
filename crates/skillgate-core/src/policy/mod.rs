//! Policy gate and operator access rules.

mod gate;
mod rules;

pub use gate::{Authorization, PolicyGate};
pub use rules::{AccessRule, AccessRules, RuleAction};
