//! Test Helper Utilities
//!
//! Shared utilities for testing critique-ai
#![allow(dead_code)]

pub mod db_utils;
pub mod pipeline;
pub mod providers;

pub use db_utils::create_test_db;
pub use pipeline::{bind, drive, fast_gateway, test_orchestrator, CollectingDispatcher, TestPipeline};
pub use providers::{ai_reply, group_ai_reply, vision_reply, ScriptedProvider};
