//! Expression-layer parser.
//!
//! Scans a template string into a flat segment list. Recognized forms:
//!
//! ```text
//! @param.NAME      @param["NAME"]
//! @config.NAME
//! @tool("NAME")    @tool("NAME", {json args})
//! @resource("URI") @resource.alias
//! @prompt("NAME")  @prompt("NAME", {json args})
//! @@               literal '@'
//! ```
//!
//! An `@` that does not introduce a recognized form stays literal text, so
//! plain e-mail addresses survive untouched. A recognized form that is
//! malformed is a syntax error carrying its byte offset.

use serde_json::Value;

use crate::template::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Param(String),
    Config(String),
    Tool { name: String, args: Value },
    Resource { target: String },
    Prompt { name: String, args: Value },
}

/// A segment plus the byte offset where it starts in the source template.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub offset: usize,
    pub segment: Segment,
}

pub fn parse(input: &str) -> Result<Vec<Spanned>, TemplateError> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut literal_start = 0usize;
    let mut pos = 0usize;

    let flush = |literal: &mut String, literal_start: usize, segments: &mut Vec<Spanned>| {
        if !literal.is_empty() {
            segments.push(Spanned {
                offset: literal_start,
                segment: Segment::Literal(std::mem::take(literal)),
            });
        }
    };

    while pos < bytes.len() {
        if bytes[pos] != b'@' {
            // Extend the literal run by one UTF-8 character.
            let ch_len = utf8_len(bytes[pos]);
            if literal.is_empty() {
                literal_start = pos;
            }
            literal.push_str(&input[pos..pos + ch_len]);
            pos += ch_len;
            continue;
        }

        // Escape: `@@` is a literal '@'.
        if bytes.get(pos + 1) == Some(&b'@') {
            if literal.is_empty() {
                literal_start = pos;
            }
            literal.push('@');
            pos += 2;
            continue;
        }

        let rest = &input[pos..];
        let parsed = if rest.starts_with("@param.") || rest.starts_with("@param[") {
            Some(parse_param(input, pos)?)
        } else if rest.starts_with("@config.") {
            Some(parse_ident_form(input, pos, "@config.", Segment::Config)?)
        } else if rest.starts_with("@tool(") {
            Some(parse_call(input, pos, "@tool(", |name, args| Segment::Tool {
                name,
                args,
            })?)
        } else if rest.starts_with("@prompt(") {
            Some(parse_call(input, pos, "@prompt(", |name, args| {
                Segment::Prompt { name, args }
            })?)
        } else if rest.starts_with("@resource(") {
            Some(parse_resource_call(input, pos)?)
        } else if rest.starts_with("@resource.") {
            Some(parse_ident_form(input, pos, "@resource.", |t| {
                Segment::Resource { target: t }
            })?)
        } else {
            None
        };

        match parsed {
            Some((segment, next)) => {
                flush(&mut literal, literal_start, &mut segments);
                segments.push(Spanned {
                    offset: pos,
                    segment,
                });
                pos = next;
            }
            None => {
                // Bare '@' with no recognized form: literal.
                if literal.is_empty() {
                    literal_start = pos;
                }
                literal.push('@');
                pos += 1;
            }
        }
    }

    flush(&mut literal, literal_start, &mut segments);
    Ok(segments)
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >> 5 == 0b110 => 2,
        b if b >> 4 == 0b1110 => 3,
        _ => 4,
    }
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

/// `@param.NAME` and `@param["NAME"]`.
fn parse_param(input: &str, start: usize) -> Result<(Segment, usize), TemplateError> {
    let after = start + "@param".len();
    let bytes = input.as_bytes();

    match bytes.get(after) {
        Some(b'.') => {
            let (name, next) = read_ident(input, after + 1)?;
            Ok((Segment::Param(name), next))
        }
        Some(b'[') => {
            let mut pos = after + 1;
            if bytes.get(pos) != Some(&b'"') {
                return Err(syntax(pos, "expected '\"' in @param[...]"));
            }
            let (name, next) = read_string_literal(input, pos)?;
            pos = next;
            if bytes.get(pos) != Some(&b']') {
                return Err(syntax(pos, "expected ']' after @param[\"...\"]"));
            }
            Ok((Segment::Param(name), pos + 1))
        }
        _ => Err(syntax(after, "expected '.' or '[' after @param")),
    }
}

fn parse_ident_form<F>(
    input: &str,
    start: usize,
    prefix: &str,
    build: F,
) -> Result<(Segment, usize), TemplateError>
where
    F: FnOnce(String) -> Segment,
{
    let (name, next) = read_ident(input, start + prefix.len())?;
    Ok((build(name), next))
}

fn read_ident(input: &str, start: usize) -> Result<(String, usize), TemplateError> {
    let bytes = input.as_bytes();
    let mut end = start;
    while end < bytes.len() && is_ident_char(bytes[end]) {
        end += 1;
    }
    if end == start {
        return Err(syntax(start, "expected an identifier"));
    }
    Ok((input[start..end].to_string(), end))
}

/// Read a double-quoted string literal starting at `start` (which must
/// point at the opening quote). Supports `\"` and `\\` escapes.
fn read_string_literal(input: &str, start: usize) -> Result<(String, usize), TemplateError> {
    let bytes = input.as_bytes();
    debug_assert_eq!(bytes.get(start), Some(&b'"'));

    let mut out = String::new();
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' => return Ok((out, pos + 1)),
            b'\\' => {
                let escaped = bytes
                    .get(pos + 1)
                    .ok_or_else(|| syntax(pos, "unterminated escape"))?;
                match escaped {
                    b'"' => out.push('"'),
                    b'\\' => out.push('\\'),
                    other => {
                        out.push('\\');
                        out.push(*other as char);
                    }
                }
                pos += 2;
            }
            _ => {
                let ch_len = utf8_len(bytes[pos]);
                out.push_str(&input[pos..pos + ch_len]);
                pos += ch_len;
            }
        }
    }
    Err(syntax(start, "unterminated string literal"))
}

/// `@tool("NAME")` / `@tool("NAME", {args})` and the @prompt twin.
fn parse_call<F>(
    input: &str,
    start: usize,
    prefix: &str,
    build: F,
) -> Result<(Segment, usize), TemplateError>
where
    F: FnOnce(String, Value) -> Segment,
{
    let bytes = input.as_bytes();
    let mut pos = start + prefix.len();
    pos = skip_ws(bytes, pos);

    if bytes.get(pos) != Some(&b'"') {
        return Err(syntax(pos, "expected a quoted name"));
    }
    let (name, next) = read_string_literal(input, pos)?;
    pos = skip_ws(bytes, next);

    match bytes.get(pos) {
        Some(b')') => Ok((build(name, Value::Object(Default::default())), pos + 1)),
        Some(b',') => {
            pos = skip_ws(bytes, pos + 1);
            let (args, next) = read_json_value(input, pos)?;
            let end = skip_ws(bytes, next);
            if bytes.get(end) != Some(&b')') {
                return Err(syntax(end, "expected ')' to close the call"));
            }
            Ok((build(name, args), end + 1))
        }
        _ => Err(syntax(pos, "expected ',' or ')' after the name")),
    }
}

/// `@resource("URI")` — a single quoted target, no argument object.
fn parse_resource_call(input: &str, start: usize) -> Result<(Segment, usize), TemplateError> {
    let bytes = input.as_bytes();
    let mut pos = start + "@resource(".len();
    pos = skip_ws(bytes, pos);

    if bytes.get(pos) != Some(&b'"') {
        return Err(syntax(pos, "expected a quoted resource URI"));
    }
    let (target, next) = read_string_literal(input, pos)?;
    let end = skip_ws(bytes, next);
    if bytes.get(end) != Some(&b')') {
        return Err(syntax(end, "expected ')' after the resource URI"));
    }
    Ok((Segment::Resource { target }, end + 1))
}

fn skip_ws(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && (bytes[pos] as char).is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Scan one balanced JSON value and parse it. Braces, brackets, and string
/// escapes are tracked so `)` inside strings never terminates the call.
fn read_json_value(input: &str, start: usize) -> Result<(Value, usize), TemplateError> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut pos = start;

    while pos < bytes.len() {
        let b = bytes[pos];
        if in_string {
            match b {
                b'\\' => pos += 1,
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        let raw = &input[start..=pos];
                        let value = serde_json::from_str(raw)
                            .map_err(|e| syntax(start, &format!("invalid json args: {}", e)))?;
                        return Ok((value, pos + 1));
                    }
                }
                b')' if depth == 0 => {
                    // Scalar argument (string/number/bool) without braces.
                    let raw = input[start..pos].trim();
                    let value = serde_json::from_str(raw)
                        .map_err(|e| syntax(start, &format!("invalid json args: {}", e)))?;
                    return Ok((value, pos));
                }
                _ => {}
            }
        }
        pos += 1;
    }

    Err(syntax(start, "unterminated json arguments"))
}

fn syntax(offset: usize, detail: &str) -> TemplateError {
    TemplateError::Syntax {
        offset,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(input: &str) -> Vec<Segment> {
        parse(input)
            .expect("parse")
            .into_iter()
            .map(|s| s.segment)
            .collect()
    }

    #[test]
    fn plain_text_is_one_literal() {
        assert_eq!(
            segments("hello world"),
            vec![Segment::Literal("hello world".to_string())]
        );
    }

    #[test]
    fn param_dot_form() {
        assert_eq!(
            segments("value: @param.x!"),
            vec![
                Segment::Literal("value: ".to_string()),
                Segment::Param("x".to_string()),
                Segment::Literal("!".to_string()),
            ]
        );
    }

    #[test]
    fn param_bracket_form() {
        assert_eq!(
            segments(r#"@param["user name"]"#),
            vec![Segment::Param("user name".to_string())]
        );
    }

    #[test]
    fn config_form() {
        assert_eq!(
            segments("@config.API_BASE/v1"),
            vec![
                Segment::Config("API_BASE".to_string()),
                Segment::Literal("/v1".to_string()),
            ]
        );
    }

    #[test]
    fn tool_call_without_args() {
        assert_eq!(
            segments(r#"@tool("list_files")"#),
            vec![Segment::Tool {
                name: "list_files".to_string(),
                args: serde_json::json!({}),
            }]
        );
    }

    #[test]
    fn tool_call_with_args() {
        assert_eq!(
            segments(r#"@tool("search", {"q": "rafts", "limit": 3})"#),
            vec![Segment::Tool {
                name: "search".to_string(),
                args: serde_json::json!({"q": "rafts", "limit": 3}),
            }]
        );
    }

    #[test]
    fn nested_expression_text_inside_args_is_preserved() {
        // The inner `@param.topic` stays inside the string; substitution
        // happens at evaluation time.
        assert_eq!(
            segments(r#"@tool("search",{"q":"@param.topic"})"#),
            vec![Segment::Tool {
                name: "search".to_string(),
                args: serde_json::json!({"q": "@param.topic"}),
            }]
        );
    }

    #[test]
    fn args_with_parens_inside_strings() {
        assert_eq!(
            segments(r#"@tool("f", {"s": "a)b"})"#),
            vec![Segment::Tool {
                name: "f".to_string(),
                args: serde_json::json!({"s": "a)b"}),
            }]
        );
    }

    #[test]
    fn resource_forms() {
        assert_eq!(
            segments(r#"@resource("file:///tmp/x.txt") and @resource.notes"#),
            vec![
                Segment::Resource {
                    target: "file:///tmp/x.txt".to_string()
                },
                Segment::Literal(" and ".to_string()),
                Segment::Resource {
                    target: "notes".to_string()
                },
            ]
        );
    }

    #[test]
    fn prompt_call() {
        assert_eq!(
            segments(r#"@prompt("brief", {"topic": "x"})"#),
            vec![Segment::Prompt {
                name: "brief".to_string(),
                args: serde_json::json!({"topic": "x"}),
            }]
        );
    }

    #[test]
    fn double_at_escapes() {
        assert_eq!(
            segments("user@@example.com"),
            vec![Segment::Literal("user@example.com".to_string())]
        );
    }

    #[test]
    fn lone_at_in_email_stays_literal() {
        assert_eq!(
            segments("mail me at a@b.com"),
            vec![Segment::Literal("mail me at a@b.com".to_string())]
        );
    }

    #[test]
    fn words_starting_with_keywords_stay_literal() {
        assert_eq!(
            segments("see @parameters and @configs"),
            vec![Segment::Literal("see @parameters and @configs".to_string())]
        );
    }

    #[test]
    fn escaped_param_syntax_is_literal() {
        assert_eq!(
            segments("@@param.x"),
            vec![Segment::Literal("@param.x".to_string())]
        );
    }

    #[test]
    fn unterminated_call_is_a_syntax_error_with_offset() {
        let err = parse(r#"pre @tool("x""#).unwrap_err();
        match err {
            TemplateError::Syntax { offset, .. } => assert!(offset >= 4),
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn bad_json_args_error() {
        let err = parse(r#"@tool("x", {bad json})"#).unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
    }

    #[test]
    fn offsets_point_into_the_source() {
        let spanned = parse("ab @param.x").expect("parse");
        assert_eq!(spanned[0].offset, 0);
        assert_eq!(spanned[1].offset, 3);
    }

    #[test]
    fn unicode_literals_survive() {
        assert_eq!(
            segments("héllo @param.x ✓"),
            vec![
                Segment::Literal("héllo ".to_string()),
                Segment::Param("x".to_string()),
                Segment::Literal(" ✓".to_string()),
            ]
        );
    }
}
