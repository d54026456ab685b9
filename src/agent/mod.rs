//! The agent loop.
//!
//! An [`AgentRunner`] takes one user message through up to [`MAX_STEPS`]
//! rounds of tool selection and execution, then streams a cited answer.
//! Everything a run mutates lives in its own [`RunState`].

mod runner;
mod state;

pub use runner::{AgentRunner, RunOutcome, MAX_STEPS};
pub use state::RunState;
