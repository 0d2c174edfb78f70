use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde_json::{Map, Value};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{\{\s*(.*?)\s*\}\}|\{%\s*(.*?)\s*%\}|\{#.*?#\}").expect("valid tag regex")
});
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][\w]*(\.[\w]+)*$").expect("valid path regex"));

pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Resolves `{% include %}` targets.
pub trait TemplateLoader {
    fn load(&self, name: &str) -> Result<Template>;
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var { path: String, safe: bool },
    If {
        path: String,
        negate: bool,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    For {
        item: String,
        path: String,
        body: Vec<Node>,
    },
    Include(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Text(&'a str),
    Var(&'a str),
    Block(&'a str),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    name: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(name: &str, source: &str) -> Result<Self> {
        let tokens = tokenize(source);
        let mut cursor = 0;
        let (nodes, terminator) = parse_nodes(name, &tokens, &mut cursor)?;
        if let Some(tag) = terminator {
            bail!("{name}: unexpected {{% {tag} %}}");
        }
        Ok(Self {
            name: name.to_string(),
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, data: &Map<String, Value>, loader: &dyn TemplateLoader) -> Result<String> {
        let mut scope = data.clone();
        let mut out = String::new();
        render_nodes(&self.nodes, &mut scope, loader, 0, &mut out)?;
        Ok(out)
    }
}

fn tokenize(source: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for captures in TAG_RE.captures_iter(source) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if whole.start() > last {
            tokens.push(Token::Text(&source[last..whole.start()]));
        }
        if let Some(var) = captures.get(1) {
            tokens.push(Token::Var(var.as_str()));
        } else if let Some(block) = captures.get(2) {
            tokens.push(Token::Block(block.as_str()));
        }
        last = whole.end();
    }
    if last < source.len() {
        tokens.push(Token::Text(&source[last..]));
    }
    tokens
}

/// Parse until end of input or an `else`/`end*` tag, which is returned.
fn parse_nodes<'a>(
    name: &str,
    tokens: &[Token<'a>],
    cursor: &mut usize,
) -> Result<(Vec<Node>, Option<&'a str>)> {
    let mut nodes = Vec::new();
    while let Some(token) = tokens.get(*cursor) {
        *cursor += 1;
        match *token {
            Token::Text(text) => nodes.push(Node::Text(text.to_string())),
            Token::Var(expr) => nodes.push(parse_var(name, expr)?),
            Token::Block(tag) => {
                let mut words = tag.split_whitespace();
                match words.next() {
                    Some("if") => {
                        let rest: Vec<&str> = words.collect();
                        let (negate, path) = match rest.as_slice() {
                            ["not", path] => (true, *path),
                            [path] => (false, *path),
                            _ => bail!("{name}: malformed {{% {tag} %}}"),
                        };
                        let path = checked_path(name, path)?;
                        let (then, end) = parse_nodes(name, tokens, cursor)?;
                        let otherwise = match end {
                            Some("else") => {
                                let (otherwise, end) = parse_nodes(name, tokens, cursor)?;
                                expect_end(name, end, "endif")?;
                                otherwise
                            }
                            end => {
                                expect_end(name, end, "endif")?;
                                Vec::new()
                            }
                        };
                        nodes.push(Node::If {
                            path,
                            negate,
                            then,
                            otherwise,
                        });
                    }
                    Some("for") => {
                        let rest: Vec<&str> = words.collect();
                        let ["in", path] = rest.get(1..).unwrap_or_default() else {
                            bail!("{name}: malformed {{% {tag} %}}");
                        };
                        let item = checked_path(name, rest[0])?;
                        if item.contains('.') {
                            bail!("{name}: loop variable must be a plain name in {{% {tag} %}}");
                        }
                        let path = checked_path(name, path)?;
                        let (body, end) = parse_nodes(name, tokens, cursor)?;
                        expect_end(name, end, "endfor")?;
                        nodes.push(Node::For { item, path, body });
                    }
                    Some("include") => {
                        let target = words.next().unwrap_or_default();
                        let target = target
                            .strip_prefix('"')
                            .and_then(|rest| rest.strip_suffix('"'))
                            .filter(|target| !target.is_empty());
                        let Some(target) = target else {
                            bail!("{name}: include needs a quoted template name");
                        };
                        nodes.push(Node::Include(target.to_string()));
                    }
                    Some(end @ ("else" | "endif" | "endfor")) => return Ok((nodes, Some(end))),
                    _ => bail!("{name}: unknown tag {{% {tag} %}}"),
                }
            }
        }
    }
    Ok((nodes, None))
}

fn parse_var(name: &str, expr: &str) -> Result<Node> {
    let mut parts = expr.split('|').map(str::trim);
    let path = checked_path(name, parts.next().unwrap_or_default())?;
    let mut safe = false;
    for filter in parts {
        match filter {
            "safe" => safe = true,
            other => bail!("{name}: unknown filter {other:?} in {{{{ {expr} }}}}"),
        }
    }
    Ok(Node::Var { path, safe })
}

fn checked_path(name: &str, path: &str) -> Result<String> {
    if !PATH_RE.is_match(path) {
        bail!("{name}: invalid variable {path:?}");
    }
    Ok(path.to_string())
}

fn expect_end(name: &str, end: Option<&str>, expected: &str) -> Result<()> {
    match end {
        Some(found) if found == expected => Ok(()),
        Some(found) => bail!("{name}: expected {{% {expected} %}}, found {{% {found} %}}"),
        None => bail!("{name}: unclosed block, missing {{% {expected} %}}"),
    }
}

fn render_nodes(
    nodes: &[Node],
    scope: &mut Map<String, Value>,
    loader: &dyn TemplateLoader,
    depth: usize,
    out: &mut String,
) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { path, safe } => {
                if let Some(value) = resolve(path, scope) {
                    let text = stringify(value);
                    if *safe {
                        out.push_str(&text);
                    } else {
                        out.push_str(&escape_html(&text));
                    }
                }
            }
            Node::If {
                path,
                negate,
                then,
                otherwise,
            } => {
                let truthy = resolve(path, scope).is_some_and(is_truthy);
                let branch = if truthy != *negate { then } else { otherwise };
                render_nodes(branch, scope, loader, depth, out)?;
            }
            Node::For { item, path, body } => {
                let items = match resolve(path, scope) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                let shadowed = scope.remove(item);
                let outer_loop = scope.remove("forloop");
                let total = items.len();
                for (index, value) in items.into_iter().enumerate() {
                    scope.insert(item.clone(), value);
                    scope.insert(
                        "forloop".to_string(),
                        serde_json::json!({
                            "counter": index + 1,
                            "first": index == 0,
                            "last": index + 1 == total,
                        }),
                    );
                    render_nodes(body, scope, loader, depth, out)?;
                }
                scope.remove("forloop");
                scope.remove(item);
                if let Some(previous) = outer_loop {
                    scope.insert("forloop".to_string(), previous);
                }
                if let Some(previous) = shadowed {
                    scope.insert(item.clone(), previous);
                }
            }
            Node::Include(target) => {
                if depth >= MAX_INCLUDE_DEPTH {
                    bail!("include depth exceeded at {target:?}");
                }
                let template = loader.load(target)?;
                render_nodes(&template.nodes, scope, loader, depth + 1, out)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn resolve<'a>(path: &str, data: &'a Map<String, Value>) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;
    for key in segments {
        current = match current {
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            other => other.get(key)?,
        };
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
