//! Budget and deadline accounting.
//!
//! The tracker owns the hard-stop predicates; any of them tripping forces
//! the orchestrator into the `force_verdict` branch at its next decision
//! point. Budgets derive from the audit tier and never change mid-audit.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Per-tier limits, fixed at audit creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudgets {
    pub max_iterations: u32,
    pub max_pages: u32,
    pub max_vlm_credits: u32,
    pub wall_clock: Duration,
}

impl TierBudgets {
    pub const fn new(
        max_iterations: u32,
        max_pages: u32,
        max_vlm_credits: u32,
        wall_clock_secs: u64,
    ) -> Self {
        Self {
            max_iterations,
            max_pages,
            max_vlm_credits,
            wall_clock: Duration::from_secs(wall_clock_secs),
        }
    }
}

/// Which hard stop tripped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStop {
    Iterations,
    Pages,
    VlmCredits,
    Deadline,
}

impl BudgetStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iterations => "iterations_exhausted",
            Self::Pages => "pages_exhausted",
            Self::VlmCredits => "vlm_credits_exhausted",
            Self::Deadline => "deadline_reached",
        }
    }
}

/// Accounts iterations, pages, VLM credits, and wall clock for one audit.
#[derive(Debug)]
pub struct BudgetTracker {
    limits: TierBudgets,
    iteration: u32,
    pages_visited: u32,
    vlm_credits_used: u32,
    started: Instant,
    deadline: Instant,
}

impl BudgetTracker {
    pub fn new(limits: TierBudgets) -> Self {
        let started = Instant::now();
        Self {
            limits,
            iteration: 0,
            pages_visited: 0,
            vlm_credits_used: 0,
            started,
            deadline: started + limits.wall_clock,
        }
    }

    pub fn limits(&self) -> &TierBudgets {
        &self.limits
    }

    pub fn record_iteration(&mut self) {
        self.iteration += 1;
    }

    pub fn record_page(&mut self) {
        self.pages_visited += 1;
    }

    pub fn record_vlm_credits(&mut self, credits: u32) {
        self.vlm_credits_used += credits;
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn pages_visited(&self) -> u32 {
        self.pages_visited
    }

    pub fn vlm_credits_used(&self) -> u32 {
        self.vlm_credits_used
    }

    pub fn iteration_exhausted(&self) -> bool {
        self.iteration >= self.limits.max_iterations
    }

    pub fn pages_exhausted(&self) -> bool {
        self.pages_visited >= self.limits.max_pages
    }

    pub fn vlm_exhausted(&self) -> bool {
        self.vlm_credits_used >= self.limits.max_vlm_credits
    }

    pub fn deadline_reached(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// First tripped hard stop, if any. Checked in a fixed order so the
    /// reported reason is deterministic when several trip at once.
    pub fn exhausted(&self) -> Option<BudgetStop> {
        if self.deadline_reached() {
            Some(BudgetStop::Deadline)
        } else if self.iteration_exhausted() {
            Some(BudgetStop::Iterations)
        } else if self.pages_exhausted() {
            Some(BudgetStop::Pages)
        } else if self.vlm_exhausted() {
            Some(BudgetStop::VlmCredits)
        } else {
            None
        }
    }

    /// Wall-clock budget still available; stage deadlines are clamped to it.
    pub fn remaining_wall_clock(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
