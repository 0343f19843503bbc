//! Automated end-to-end test orchestration for an interactive application.
//!
//! A run launches the application, drives it with synthetic keys into the
//! state where its in-app test suite can be triggered, watches its log for the
//! suite's outcome and persists a PASS/FAIL verdict.

pub mod config;
pub mod controller;
pub mod input;
pub mod log;
pub mod options;
pub mod status;
pub mod supervisor;
pub mod tail;
pub mod verdict;
