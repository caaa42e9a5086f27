//! Text-template layer: a small mustache dialect evaluated after
//! expression substitution.
//!
//! Supported forms: `{{var}}`, `{{#if x}}...{{else}}...{{/if}}`, and
//! `{{#each items}}...{{this}}...{{/each}}` over the parameter namespace.
//! Unknown variables render as empty text and never raise; malformed
//! section nesting is a syntax error with its byte offset.

use serde_json::Value;

use crate::template::TemplateError;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var(String),
    If {
        path: String,
        then: Vec<Node>,
        els: Vec<Node>,
    },
    Each {
        path: String,
        body: Vec<Node>,
    },
}

#[derive(Debug, PartialEq)]
enum Terminator {
    Else,
    EndIf,
    EndEach,
    Eof,
}

pub fn render_text(template: &str, params: &Value) -> Result<String, TemplateError> {
    let mut pos = 0usize;
    let (nodes, terminator, end) = parse_block(template, &mut pos)?;
    if terminator != Terminator::Eof {
        return Err(TemplateError::Syntax {
            offset: end,
            detail: "unexpected closing tag".to_string(),
        });
    }

    let mut out = String::new();
    let mut stack: Vec<&Value> = vec![params];
    render_nodes(&nodes, &mut stack, &mut out);
    Ok(out)
}

/// Parse nodes until a terminator tag or end of input. Returns the nodes,
/// the terminator encountered, and the byte offset of that terminator.
fn parse_block(
    template: &str,
    pos: &mut usize,
) -> Result<(Vec<Node>, Terminator, usize), TemplateError> {
    let mut nodes = Vec::new();

    loop {
        let rest = &template[*pos..];
        let Some(open) = rest.find("{{") else {
            if !rest.is_empty() {
                nodes.push(Node::Text(rest.to_string()));
            }
            let at = template.len();
            *pos = at;
            return Ok((nodes, Terminator::Eof, at));
        };

        if open > 0 {
            nodes.push(Node::Text(rest[..open].to_string()));
        }
        let tag_start = *pos + open;
        let after_open = tag_start + 2;
        let Some(close) = template[after_open..].find("}}") else {
            return Err(TemplateError::Syntax {
                offset: tag_start,
                detail: "unterminated '{{' tag".to_string(),
            });
        };
        let content = template[after_open..after_open + close].trim();
        *pos = after_open + close + 2;

        if let Some(path) = content.strip_prefix("#if ") {
            let path = path.trim().to_string();
            let (then, term, term_at) = parse_block(template, pos)?;
            let (els, end_term, end_at) = match term {
                Terminator::Else => parse_block(template, pos)?,
                other => (Vec::new(), other, term_at),
            };
            if end_term != Terminator::EndIf {
                return Err(TemplateError::Syntax {
                    offset: end_at,
                    detail: "expected {{/if}}".to_string(),
                });
            }
            nodes.push(Node::If { path, then, els });
        } else if let Some(path) = content.strip_prefix("#each ") {
            let path = path.trim().to_string();
            let (body, term, term_at) = parse_block(template, pos)?;
            if term != Terminator::EndEach {
                return Err(TemplateError::Syntax {
                    offset: term_at,
                    detail: "expected {{/each}}".to_string(),
                });
            }
            nodes.push(Node::Each { path, body });
        } else if content == "else" {
            return Ok((nodes, Terminator::Else, tag_start));
        } else if content == "/if" {
            return Ok((nodes, Terminator::EndIf, tag_start));
        } else if content == "/each" {
            return Ok((nodes, Terminator::EndEach, tag_start));
        } else if content.is_empty() {
            return Err(TemplateError::Syntax {
                offset: tag_start,
                detail: "empty '{{}}' tag".to_string(),
            });
        } else {
            nodes.push(Node::Var(content.to_string()));
        }
    }
}

fn render_nodes<'a>(nodes: &'a [Node], stack: &mut Vec<&'a Value>, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(path) => {
                if let Some(value) = resolve(stack, path) {
                    out.push_str(&render_value(value));
                }
            }
            Node::If { path, then, els } => {
                let truthy = resolve(stack, path).map(is_truthy).unwrap_or(false);
                render_nodes(if truthy { then } else { els }, stack, out);
            }
            Node::Each { path, body } => {
                let Some(Value::Array(items)) = resolve(stack, path) else {
                    continue;
                };
                for item in items {
                    stack.push(item);
                    render_nodes(body, stack, out);
                    stack.pop();
                }
            }
        }
    }
}

/// Walk the context stack top-down; `this` names the innermost frame.
fn resolve<'a>(stack: &[&'a Value], path: &str) -> Option<&'a Value> {
    if path == "this" {
        return stack.last().copied();
    }
    for frame in stack.iter().rev() {
        if let Some(found) = resolve_in(frame, path) {
            return Some(found);
        }
    }
    None
}

fn resolve_in<'a>(frame: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = frame;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_passes_through() {
        let out = render_text("no tags here", &json!({})).expect("render");
        assert_eq!(out, "no tags here");
    }

    #[test]
    fn variable_substitution() {
        let out = render_text("hi {{name}}!", &json!({"name": "Alice"})).expect("render");
        assert_eq!(out, "hi Alice!");
    }

    #[test]
    fn unknown_variables_render_empty() {
        let out = render_text("[{{missing}}]", &json!({})).expect("render");
        assert_eq!(out, "[]");
    }

    #[test]
    fn dotted_paths() {
        let out = render_text(
            "{{user.name}} / {{user.id}}",
            &json!({"user": {"name": "bob", "id": 7}}),
        )
        .expect("render");
        assert_eq!(out, "bob / 7");
    }

    #[test]
    fn if_true_branch() {
        let out = render_text(
            "{{#if flag}}yes{{else}}no{{/if}}",
            &json!({"flag": true}),
        )
        .expect("render");
        assert_eq!(out, "yes");
    }

    #[test]
    fn if_false_and_missing_take_else() {
        let params = json!({"flag": false});
        assert_eq!(
            render_text("{{#if flag}}yes{{else}}no{{/if}}", &params).expect("render"),
            "no"
        );
        assert_eq!(
            render_text("{{#if nothing}}yes{{else}}no{{/if}}", &json!({})).expect("render"),
            "no"
        );
    }

    #[test]
    fn if_without_else() {
        let out = render_text("a{{#if x}}b{{/if}}c", &json!({})).expect("render");
        assert_eq!(out, "ac");
    }

    #[test]
    fn empty_string_is_falsy() {
        let out = render_text("{{#if s}}set{{/if}}", &json!({"s": ""})).expect("render");
        assert_eq!(out, "");
    }

    #[test]
    fn each_iterates_with_this() {
        let out = render_text(
            "{{#each items}}[{{this}}]{{/each}}",
            &json!({"items": ["a", "b", "c"]}),
        )
        .expect("render");
        assert_eq!(out, "[a][b][c]");
    }

    #[test]
    fn each_over_objects_exposes_fields() {
        let out = render_text(
            "{{#each users}}{{name}};{{/each}}",
            &json!({"users": [{"name": "x"}, {"name": "y"}]}),
        )
        .expect("render");
        assert_eq!(out, "x;y;");
    }

    #[test]
    fn each_over_missing_renders_nothing() {
        let out = render_text("{{#each nope}}x{{/each}}", &json!({})).expect("render");
        assert_eq!(out, "");
    }

    #[test]
    fn nested_sections() {
        let out = render_text(
            "{{#each xs}}{{#if this}}1{{else}}0{{/if}}{{/each}}",
            &json!({"xs": [true, false, true]}),
        )
        .expect("render");
        assert_eq!(out, "101");
    }

    #[test]
    fn unterminated_tag_is_syntax_error() {
        let err = render_text("abc {{oops", &json!({})).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { offset: 4, .. }));
    }

    #[test]
    fn unbalanced_close_is_syntax_error() {
        let err = render_text("x {{/if}}", &json!({})).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
    }

    #[test]
    fn unclosed_if_is_syntax_error() {
        let err = render_text("{{#if x}}body", &json!({})).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
    }
}
