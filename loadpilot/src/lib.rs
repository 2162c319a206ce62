//! Multi-agent decision workflows for freight dispatch

pub mod agents;
pub mod config;
pub mod db;
pub mod events;
pub mod gate;
pub mod llm;
pub mod orchestrator;
pub mod stream;
pub mod web;
