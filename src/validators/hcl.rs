//! Line-oriented HCL reader.
//!
//! Understands the subset of HCL the validators inspect: nested blocks with
//! labels, `key = value` attributes (values may span lines while brackets are
//! open, or use heredocs), and `#`, `//`, `/* */` comments. Values are kept
//! as source text; expressions are not evaluated.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct HclAttribute {
    pub key: String,
    pub value: String,
    pub line: usize,
}

impl HclAttribute {
    /// Content of a plain string literal value, or `None` for expressions.
    pub fn literal(&self) -> Option<&str> {
        let v = self.value.trim();
        if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') && !v.contains("${") {
            Some(&v[1..v.len() - 1])
        } else {
            None
        }
    }

    /// Every quoted string inside the value.
    pub fn strings(&self) -> Vec<String> {
        string_literals(&self.value)
    }

    pub fn is_true(&self) -> bool {
        self.value.trim() == "true"
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.trim().parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HclBlock {
    pub keyword: String,
    pub labels: Vec<String>,
    pub line: usize,
    pub attributes: Vec<HclAttribute>,
    pub blocks: Vec<HclBlock>,
}

impl HclBlock {
    fn new(keyword: String, labels: Vec<String>, line: usize) -> Self {
        Self {
            keyword,
            labels,
            line,
            attributes: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&HclAttribute> {
        self.attributes.iter().find(|a| a.key == key)
    }

    pub fn children<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a HclBlock> + 'a {
        self.blocks.iter().filter(move |b| b.keyword == keyword)
    }

    /// `type.name` for resource and data blocks, else the keyword.
    pub fn address(&self) -> String {
        match self.labels.as_slice() {
            [t, n] => format!("{}.{}", t, n),
            [one] => format!("{}.{}", self.keyword, one),
            _ => self.keyword.clone(),
        }
    }

    /// Resource type for `resource`/`data` blocks.
    pub fn resource_type(&self) -> Option<&str> {
        self.labels.first().map(String::as_str)
    }

    /// This block and every nested block, depth first.
    pub fn walk(&self) -> Vec<&HclBlock> {
        let mut out = vec![self];
        for b in &self.blocks {
            out.extend(b.walk());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HclSyntaxError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for HclSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Top-level `resource` blocks.
pub fn resources(blocks: &[HclBlock]) -> impl Iterator<Item = &HclBlock> {
    blocks.iter().filter(|b| b.keyword == "resource")
}

/// Resources of one type.
pub fn resources_of<'a>(
    blocks: &'a [HclBlock],
    resource_type: &'a str,
) -> impl Iterator<Item = &'a HclBlock> + 'a {
    resources(blocks).filter(move |b| b.resource_type() == Some(resource_type))
}

/// Extract the quoted strings in a value, honouring backslash escapes.
pub fn string_literals(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    let mut escaped = false;
    for c in value.chars() {
        match current.as_mut() {
            Some(s) => {
                if escaped {
                    s.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    out.extend(current.take());
                } else {
                    s.push(c);
                }
            }
            None if c == '"' => current = Some(String::new()),
            None => {}
        }
    }
    out
}

/// Strip comments from one line. `in_block` tracks `/* */` across lines.
fn strip_comment(line: &str, in_block: &mut bool) -> Result<String, String> {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if *in_block {
            if c == '*' && next == Some('/') {
                *in_block = false;
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match (c, next) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('#', _) | ('/', Some('/')) => break,
            ('/', Some('*')) => {
                *in_block = true;
                i += 2;
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }
    if in_string {
        return Err("unterminated string literal".to_string());
    }
    Ok(out)
}

/// Net bracket depth of a comment-free line, ignoring string contents.
fn bracket_depth(line: &str) -> i64 {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in line.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' | '(' => depth += 1,
            '}' | ']' | ')' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Byte offset of the first `c` outside string literals.
fn find_unquoted(line: &str, target: char) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_header(header: &str, line: usize) -> Result<(String, Vec<String>), HclSyntaxError> {
    let err = |message: String| HclSyntaxError { line, message };
    let mut tokens = Vec::new();
    let mut rest = header.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped
                .find('"')
                .ok_or_else(|| err("unterminated block label".to_string()))?;
            tokens.push(stripped[..end].to_string());
            rest = stripped[end + 1..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let token = &rest[..end];
            if !is_identifier(token) {
                return Err(err(format!("unexpected token '{}' in block header", token)));
            }
            tokens.push(token.to_string());
            rest = rest[end..].trim_start();
        }
    }
    let mut tokens = tokens.into_iter();
    let keyword = tokens
        .next()
        .ok_or_else(|| err("block without a keyword".to_string()))?;
    Ok((keyword, tokens.collect()))
}

fn parse_attribute(text: &str, line: usize) -> Result<HclAttribute, HclSyntaxError> {
    let eq = find_unquoted(text, '=').ok_or_else(|| HclSyntaxError {
        line,
        message: format!("expected 'key = value', found '{}'", text.trim()),
    })?;
    let key = text[..eq].trim().trim_matches('"');
    if !is_identifier(key) {
        return Err(HclSyntaxError {
            line,
            message: format!("invalid attribute name '{}'", key),
        });
    }
    let value = text[eq + 1..].trim();
    if value.is_empty() {
        return Err(HclSyntaxError {
            line,
            message: format!("attribute '{}' has no value", key),
        });
    }
    Ok(HclAttribute {
        key: key.to_string(),
        value: value.to_string(),
        line,
    })
}

fn attach(stack: &mut [HclBlock], attribute: HclAttribute) -> Result<(), HclSyntaxError> {
    match stack.last_mut() {
        Some(block) => {
            block.attributes.push(attribute);
            Ok(())
        }
        None => Err(HclSyntaxError {
            line: attribute.line,
            message: format!("attribute '{}' outside of any block", attribute.key),
        }),
    }
}

fn close(stack: &mut Vec<HclBlock>, top: &mut Vec<HclBlock>) {
    if let Some(block) = stack.pop() {
        match stack.last_mut() {
            Some(parent) => parent.blocks.push(block),
            None => top.push(block),
        }
    }
}

/// Parse HCL source into its top-level blocks.
pub fn parse(source: &str) -> Result<Vec<HclBlock>, HclSyntaxError> {
    let mut in_comment = false;
    let mut lines = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let clean = strip_comment(raw, &mut in_comment).map_err(|message| HclSyntaxError {
            line: idx + 1,
            message,
        })?;
        lines.push((idx + 1, clean));
    }
    if in_comment {
        return Err(HclSyntaxError {
            line: lines.len(),
            message: "unterminated block comment".to_string(),
        });
    }

    let mut top = Vec::new();
    let mut stack: Vec<HclBlock> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let (line_no, text) = (&lines[i].0, lines[i].1.trim());
        let line_no = *line_no;
        i += 1;
        if text.is_empty() {
            continue;
        }
        if text == "}" {
            if stack.is_empty() {
                return Err(HclSyntaxError {
                    line: line_no,
                    message: "unexpected '}'".to_string(),
                });
            }
            close(&mut stack, &mut top);
            continue;
        }

        let eq = find_unquoted(text, '=');
        let brace = find_unquoted(text, '{');
        let is_block = match (eq, brace) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(e), Some(b)) => b < e,
        };

        if is_block {
            let b = brace.unwrap_or(text.len());
            let (keyword, labels) = parse_header(&text[..b], line_no)?;
            let rest = text[b + 1..].trim();
            let mut block = HclBlock::new(keyword, labels, line_no);
            if rest.is_empty() {
                stack.push(block);
            } else if let Some(inner) = rest.strip_suffix('}') {
                let inner = inner.trim();
                if !inner.is_empty() {
                    block.attributes.push(parse_attribute(inner, line_no)?);
                }
                match stack.last_mut() {
                    Some(parent) => parent.blocks.push(block),
                    None => top.push(block),
                }
            } else {
                return Err(HclSyntaxError {
                    line: line_no,
                    message: format!("unexpected content after '{{': '{}'", rest),
                });
            }
            continue;
        }

        let mut attribute = parse_attribute(text, line_no)?;
        if let Some(marker) = attribute.value.strip_prefix("<<") {
            let marker = marker.trim_start_matches('-').trim().to_string();
            let mut body = vec![attribute.value.clone()];
            loop {
                let Some((_, l)) = lines.get(i) else {
                    return Err(HclSyntaxError {
                        line: line_no,
                        message: format!("unterminated heredoc '{}'", marker),
                    });
                };
                i += 1;
                body.push(l.clone());
                if l.trim() == marker {
                    break;
                }
            }
            attribute.value = body.join("\n");
        } else {
            let mut depth = bracket_depth(&attribute.value);
            while depth > 0 {
                let Some((_, l)) = lines.get(i) else {
                    return Err(HclSyntaxError {
                        line: line_no,
                        message: format!("unclosed bracket in value of '{}'", attribute.key),
                    });
                };
                i += 1;
                depth += bracket_depth(l);
                attribute.value.push('\n');
                attribute.value.push_str(l.trim());
            }
            if depth < 0 {
                return Err(HclSyntaxError {
                    line: line_no,
                    message: format!("unbalanced closing bracket in value of '{}'", attribute.key),
                });
            }
        }
        attach(&mut stack, attribute)?;
    }

    if let Some(open) = stack.last() {
        return Err(HclSyntaxError {
            line: open.line,
            message: format!("block '{}' is never closed", open.keyword),
        });
    }
    Ok(top)
}
