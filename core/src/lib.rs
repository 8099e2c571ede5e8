//! collections-core: the delinquency & collections engine.
//!
//! Given a portfolio of installment credits, the engine recomputes every
//! day which installments are overdue, accrues tiered and capped penalty
//! interest (mora), adjusts client risk scores, raises and throttles
//! collections alerts, and supports payment agreements that refinance
//! overdue debt with partial penalty forgiveness.
//!
//! Component ownership:
//!   - `ledger`        credits, installments, payments
//!   - `calculator`    pure penalty / priority evaluation
//!   - `scoring`       client risk score and auto-block
//!   - `alerts`        collections alerts and notification throttling
//!   - `workflow`      agent contacts, promises, assignment
//!   - `restructuring` payment agreements
//!   - `orchestrator`  the daily batch run
//!   - `store`         the only code that executes SQL

pub mod alerts;
pub mod calculator;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod ledger;
pub mod notifier;
pub mod orchestrator;
pub mod restructuring;
pub mod scoring;
pub mod store;
pub mod types;
pub mod workflow;
