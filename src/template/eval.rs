//! Expression evaluation.
//!
//! Substituted values are spliced in *after* the text-template pass so a
//! value is never re-parsed as template syntax: an argument round-trips
//! verbatim even when it looks like an expression.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::{
    error::GatewayError,
    protocols::mcp::{CallToolResult, ContentBlock, ReadResourceResult, ResourceContents},
    template::{canonical_json, parse, text::render_text, Segment, Spanned, TemplateError},
    vmcp::context::InvocationContext,
};

/// The seam through which nested `@tool`/`@resource`/`@prompt` expressions
/// re-enter the owning vMCP.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn invoke_tool(
        &self,
        name: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<CallToolResult, GatewayError>;

    /// `target` is either a full URI or a custom-resource alias.
    async fn fetch_resource(
        &self,
        target: &str,
        ctx: &InvocationContext,
    ) -> Result<ReadResourceResult, GatewayError>;

    /// Returns the fully rendered prompt text.
    async fn render_prompt(
        &self,
        name: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<String, GatewayError>;
}

/// Render a template: expression layer, then the text-template layer, then
/// placeholder splicing.
pub fn render<'a>(
    input: &'a str,
    params: &'a Value,
    resolver: &'a dyn TargetResolver,
    ctx: &'a InvocationContext,
) -> BoxFuture<'a, Result<String, GatewayError>> {
    Box::pin(async move {
        let segments = parse(input).map_err(GatewayError::from)?;

        // Evaluate expressions left to right (deterministic ordering),
        // leaving sentinels in the text handed to the mustache pass.
        let mut template = String::with_capacity(input.len());
        let mut values: Vec<String> = Vec::new();
        for spanned in &segments {
            match &spanned.segment {
                Segment::Literal(text) => template.push_str(text),
                _ => {
                    let value = eval_segment(spanned, params, resolver, ctx).await?;
                    template.push_str(&sentinel(values.len()));
                    values.push(value);
                }
            }
        }

        let rendered = render_text(&template, params).map_err(GatewayError::from)?;
        Ok(splice(&rendered, &values))
    })
}

fn sentinel(index: usize) -> String {
    format!("\u{0}{}\u{0}", index)
}

fn splice(rendered: &str, values: &[String]) -> String {
    if values.is_empty() {
        return rendered.to_string();
    }
    let mut out = String::with_capacity(rendered.len());
    let mut rest = rendered;
    while let Some(start) = rest.find('\u{0}') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        if let Some(end) = tail.find('\u{0}') {
            if let Ok(index) = tail[..end].parse::<usize>() {
                if let Some(value) = values.get(index) {
                    out.push_str(value);
                }
                rest = &tail[end + 1..];
                continue;
            }
        }
        out.push('\u{0}');
        rest = tail;
    }
    out.push_str(rest);
    out
}

async fn eval_segment(
    spanned: &Spanned,
    params: &Value,
    resolver: &dyn TargetResolver,
    ctx: &InvocationContext,
) -> Result<String, GatewayError> {
    match &spanned.segment {
        Segment::Literal(_) => unreachable!("literals are handled by the caller"),
        Segment::Param(name) => Ok(params
            .get(name)
            .map(value_to_string)
            .unwrap_or_default()),
        Segment::Config(name) => ctx
            .env_value(name)
            .map(|v| v.to_string())
            .ok_or_else(|| TemplateError::MissingConfig(name.clone()).into()),
        Segment::Tool { name, args } => {
            let _depth = enter(ctx)?;
            let args = render_args(args, params, resolver, ctx).await?;
            let key = ("tool", name.clone(), canonical_json(&args));
            if let Some(memoized) = ctx.memo_get(&key) {
                return Ok(memoized);
            }
            let result = resolver
                .invoke_tool(name, args, ctx)
                .await
                .map_err(|e| nested(spanned.offset, e))?;
            let rendered = render_tool_result(&result);
            ctx.memo_put(key, rendered.clone());
            Ok(rendered)
        }
        Segment::Resource { target } => {
            let _depth = enter(ctx)?;
            let key = ("resource", target.clone(), String::new());
            if let Some(memoized) = ctx.memo_get(&key) {
                return Ok(memoized);
            }
            let result = resolver
                .fetch_resource(target, ctx)
                .await
                .map_err(|e| nested(spanned.offset, e))?;
            let rendered = render_resource_result(&result);
            ctx.memo_put(key, rendered.clone());
            Ok(rendered)
        }
        Segment::Prompt { name, args } => {
            let _depth = enter(ctx)?;
            let args = render_args(args, params, resolver, ctx).await?;
            let key = ("prompt", name.clone(), canonical_json(&args));
            if let Some(memoized) = ctx.memo_get(&key) {
                return Ok(memoized);
            }
            let rendered = resolver
                .render_prompt(name, args, ctx)
                .await
                .map_err(|e| nested(spanned.offset, e))?;
            ctx.memo_put(key, rendered.clone());
            Ok(rendered)
        }
    }
}

fn enter(ctx: &InvocationContext) -> Result<crate::vmcp::context::DepthGuard<'_>, GatewayError> {
    ctx.enter_nested().ok_or_else(|| {
        TemplateError::Recursion {
            max_depth: ctx.max_depth(),
        }
        .into()
    })
}

fn nested(offset: usize, source: GatewayError) -> GatewayError {
    TemplateError::Nested {
        offset,
        source: Box::new(source),
    }
    .into()
}

/// Recursively render the string leaves of an argument object, so nested
/// expressions like `{"q": "@param.topic"}` resolve before the call.
fn render_args<'a>(
    args: &'a Value,
    params: &'a Value,
    resolver: &'a dyn TargetResolver,
    ctx: &'a InvocationContext,
) -> BoxFuture<'a, Result<Value, GatewayError>> {
    Box::pin(async move {
        match args {
            Value::String(s) if s.contains('@') || s.contains("{{") => {
                Ok(Value::String(render(s, params, resolver, ctx).await?))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(render_args(item, params, resolver, ctx).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), render_args(value, params, resolver, ctx).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    })
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Rendering rules for nested tool results: text parts joined by newlines,
/// non-text parts as a binary sentinel, structured JSON compact.
pub fn render_tool_result(result: &CallToolResult) -> String {
    if result.content.is_empty() {
        if let Some(structured) = &result.structured_content {
            return value_to_string(structured);
        }
        return String::new();
    }

    let parts: Vec<String> = result
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Image { data, mime_type } => {
                binary_sentinel(mime_type, decoded_len(data))
            }
            ContentBlock::Resource { resource } => render_resource_contents(resource),
        })
        .collect();
    parts.join("\n")
}

pub fn render_resource_result(result: &ReadResourceResult) -> String {
    let parts: Vec<String> = result
        .contents
        .iter()
        .map(render_resource_contents)
        .collect();
    parts.join("\n")
}

fn render_resource_contents(contents: &ResourceContents) -> String {
    match contents {
        ResourceContents::Text { text, .. } => text.clone(),
        // Binary resource bytes substitute as their base64 form.
        ResourceContents::Blob { blob, .. } => blob.clone(),
    }
}

fn binary_sentinel(mime: &str, len: usize) -> String {
    format!("[binary:{}:{} bytes]", mime, len)
}

fn decoded_len(data: &str) -> usize {
    BASE64
        .decode(data)
        .map(|bytes| bytes.len())
        .unwrap_or(data.len())
}
