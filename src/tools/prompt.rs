//! Prompt tool engine: renders the templated body; the rendered text is
//! the whole result. Nested `@tool`/`@prompt` invocations inside the body
//! run under the caller's recursion bound.

use serde_json::Value;

use crate::{
    error::GatewayResult,
    protocols::mcp::CallToolResult,
    template::{render, TargetResolver},
    tools::PromptTool,
    vmcp::context::InvocationContext,
};

pub struct PromptEngine;

impl PromptEngine {
    /// Render the body to a single text content part.
    pub async fn execute(
        tool: &PromptTool,
        args: &Value,
        resolver: &dyn TargetResolver,
        ctx: &InvocationContext,
    ) -> GatewayResult<CallToolResult> {
        let text = Self::render_text(tool, args, resolver, ctx).await?;
        Ok(CallToolResult::text(text))
    }

    /// Render the body to a plain string (used by `prompts/get` and by
    /// nested `@prompt(...)` expressions).
    pub async fn render_text(
        tool: &PromptTool,
        args: &Value,
        resolver: &dyn TargetResolver,
        ctx: &InvocationContext,
    ) -> GatewayResult<String> {
        render(&tool.template, args, resolver, ctx).await
    }
}
