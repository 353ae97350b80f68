//! Behaviour-analyst run state
//!
//! Nodes never mutate `AnalystState`. They read it and return a
//! `StateDelta` holding only the fields they own; the engine folds the
//! delta into a fresh state value.

use crate::models::{CorrectionFeedback, DbResult, NextStep, ValidationTask};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct AnalystState {
    pub request: String,
    pub user_id: i64,
    pub current_date: String,

    /// Current plan, replaced wholesale by every planning pass.
    pub steps: Vec<String>,
    pub completed_steps: Vec<String>,

    /// Results waiting for the explainer. Cleared once explained.
    pub db_results: Vec<DbResult>,
    /// Index-aligned with `db_results` when they are corrections.
    pub validation_results: Vec<CorrectionFeedback>,
    pub validation_tasks: Vec<ValidationTask>,

    /// Accumulated explanations, insertion ordered, no duplicates.
    pub data_acquired: Vec<String>,
    data_revision: u64,
    analysed_revision: u64,

    pub analysis: String,
    pub next_step: NextStep,
    pub plan_failed: bool,

    pub sender: String,
    pub message: String,
}

impl AnalystState {
    pub fn new(request: impl Into<String>, user_id: i64, current_date: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            user_id,
            current_date: current_date.into(),
            steps: Vec::new(),
            completed_steps: Vec::new(),
            db_results: Vec::new(),
            validation_results: Vec::new(),
            validation_tasks: Vec::new(),
            data_acquired: Vec::new(),
            data_revision: 0,
            analysed_revision: 0,
            analysis: String::new(),
            next_step: NextStep::QueryPlanner,
            plan_failed: false,
            sender: String::new(),
            message: String::new(),
        }
    }

    /// Validated data changed since the analyser last ran.
    pub fn has_unanalysed_data(&self) -> bool {
        self.data_revision != self.analysed_revision
    }

    pub fn apply(mut self, delta: StateDelta) -> Self {
        if let Some(steps) = delta.steps {
            self.steps = steps;
        }
        if let Some(completed) = delta.completed_steps {
            self.completed_steps = completed;
        }
        if let Some(results) = delta.db_results {
            self.db_results = results;
        }
        if let Some(feedback) = delta.validation_results {
            self.validation_results = feedback;
        }
        if let Some(tasks) = delta.validation_tasks {
            self.validation_tasks = tasks;
        }
        if let Some(data) = delta.data_acquired {
            let mut seen = HashSet::new();
            let data: Vec<String> = data.into_iter().filter(|d| seen.insert(d.clone())).collect();
            if data != self.data_acquired {
                self.data_acquired = data;
                self.data_revision += 1;
            }
        }
        if let Some(analysis) = delta.analysis {
            self.analysis = analysis;
        }
        if delta.analysed {
            self.analysed_revision = self.data_revision;
        }
        if let Some(next) = delta.next_step {
            self.next_step = next;
        }
        if let Some(failed) = delta.plan_failed {
            self.plan_failed = failed;
        }
        if let Some(sender) = delta.sender {
            self.sender = sender.to_string();
        }
        if let Some(message) = delta.message {
            self.message = message;
        }
        self
    }
}

#[derive(Debug, Default)]
pub struct StateDelta {
    pub steps: Option<Vec<String>>,
    pub completed_steps: Option<Vec<String>>,
    pub db_results: Option<Vec<DbResult>>,
    pub validation_results: Option<Vec<CorrectionFeedback>>,
    pub validation_tasks: Option<Vec<ValidationTask>>,
    pub data_acquired: Option<Vec<String>>,
    pub analysis: Option<String>,
    pub analysed: bool,
    pub next_step: Option<NextStep>,
    pub plan_failed: Option<bool>,
    pub sender: Option<&'static str>,
    pub message: Option<String>,
}

impl StateDelta {
    pub fn from_sender(sender: &'static str) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
