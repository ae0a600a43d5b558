//! Interfaces to agent execution.
//!
//! The gateway drives runs through [`AgentRunner`], lists models through
//! [`ModelCatalog`], and executes single tool calls from a [`ToolRegistry`].
//! Real implementations live outside this workspace; the no-op defaults here
//! let the gateway boot without them.

pub mod model;
pub mod runner;
pub mod tool_registry;

pub use {
    model::{ModelCatalog, ModelInfo, StaticModelCatalog},
    runner::{AgentRunResult, AgentRunner, EchoRunner, OnEvent, RunRequest, RunnerEvent},
    tool_registry::{AgentTool, ToolRegistry},
};
