//! Integration test suite for agentflow.
//!
//! These tests run the router, dispatcher, consumers, scheduler and board
//! together over the in-memory broker. Handlers and step runners are test
//! doubles, so no model or network access is needed.
//!
//! # Test Categories
//!
//! - `routing`: events published on input topics reach the right agent
//! - `consumer_ordering`: per-agent FIFO, no overlap, redelivery idempotence
//! - `parallel_layers`: layered plan execution, barriers and conflicts
//! - `admission`: WIP limits and policies on the board, story dispatch

mod fixtures;

mod admission;
mod consumer_ordering;
mod parallel_layers;
mod routing;
