use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// Point limit used for chart views unless the device says otherwise.
pub const DEFAULT_CHART_LIMIT: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "pfodDrawing", default, skip_serializing_if = "Option::is_none")]
    pub pfod_drawing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    /// Refresh interval in milliseconds; zero disables polling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Value>,
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `{+...}` or `pfodDrawing: "start"`.
    Snapshot,
    /// `pfodDrawing: "update"`.
    Update,
    /// `{,` / `{;`.
    Menu,
    /// `{=`.
    RawData,
    /// `{}`.
    Empty,
    /// `pfodDrawing: "error"`.
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub raw: RawResponse,
    pub shape: ResponseShape,
}

impl ParsedResponse {
    pub fn from_raw(raw: RawResponse) -> Self {
        let shape = classify(&raw);
        Self { raw, shape }
    }

    /// Whether the response carries drawing content. An empty `{}` only counts
    /// while a drawing is on screen.
    pub fn is_drawing(&self, displaying: bool) -> bool {
        match self.shape {
            ResponseShape::Snapshot | ResponseShape::Update => true,
            ResponseShape::Empty => displaying,
            _ => false,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.shape == ResponseShape::Snapshot
    }

    fn first_token(&self) -> Option<&str> {
        self.raw
            .cmd
            .as_ref()
            .and_then(|cmd| cmd.first())
            .map(String::as_str)
    }

    pub fn menu(&self) -> Option<MenuResponse> {
        if self.shape != ResponseShape::Menu {
            return None;
        }
        let cmd = self.raw.cmd.as_ref()?;
        let selector = cmd.iter().find_map(|elem| elem.strip_prefix("|+"))?;
        let (identifier, drawing) = match selector.split_once('~') {
            Some((identifier, drawing)) => (identifier, drawing.trim()),
            None => (selector, ""),
        };
        Some(MenuResponse {
            identifier: identifier.trim().to_string(),
            drawing_name: (!drawing.is_empty()).then(|| drawing.to_string()),
            version: self.raw.version.clone(),
        })
    }

    pub fn diagnostic(&self) -> Option<DiagnosticView> {
        if self.shape != ResponseShape::RawData {
            return None;
        }
        let cmd = self.raw.cmd.as_ref()?;
        let first = self.first_token()?;
        let body = first.split_once('=').map(|(_, rest)| rest).unwrap_or("");

        let labels: Vec<String> = cmd
            .iter()
            .skip(1)
            .filter_map(|elem| elem.strip_prefix('|'))
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .collect();
        if !labels.is_empty() {
            return Some(DiagnosticView::Chart {
                title: body.trim().to_string(),
                labels,
                limit: DEFAULT_CHART_LIMIT,
            });
        }

        let title = body.split('|').next().unwrap_or("").trim().to_string();
        let text = cmd
            .iter()
            .skip(1)
            .filter(|elem| elem.as_str() != "}")
            .map(|elem| elem.trim_start_matches('|'))
            .collect::<Vec<_>>()
            .join("\n");
        Some(DiagnosticView::RawText { title, text })
    }
}

/// Menu selection `|+identifier~drawingName`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuResponse {
    pub identifier: String,
    /// `None` means "the drawing already shown".
    pub drawing_name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticView {
    Chart {
        title: String,
        labels: Vec<String>,
        limit: usize,
    },
    RawText {
        title: String,
        text: String,
    },
}

fn classify(raw: &RawResponse) -> ResponseShape {
    let drawing = raw.pfod_drawing.as_deref();
    if drawing == Some("error") {
        return ResponseShape::Error;
    }
    let first = raw
        .cmd
        .as_ref()
        .and_then(|cmd| cmd.first())
        .map(|token| token.trim());
    if drawing == Some("start") || first.is_some_and(|token| token.starts_with("{+")) {
        return ResponseShape::Snapshot;
    }
    if drawing == Some("update") {
        return ResponseShape::Update;
    }
    match first {
        Some(token) if token.starts_with("{,") || token.starts_with("{;") => ResponseShape::Menu,
        Some(token) if token.starts_with("{=") => ResponseShape::RawData,
        Some(_) if is_empty_cmd(raw.cmd.as_deref().unwrap_or_default()) => ResponseShape::Empty,
        _ => ResponseShape::Unknown,
    }
}

fn is_empty_cmd(cmd: &[String]) -> bool {
    match cmd {
        [only] => only.trim() == "{}",
        [open, close, ..] => open.trim() == "{" && close.trim() == "}",
        [] => false,
    }
}

/// Parses response text. JSON objects are decoded directly; bare pfod
/// messages such as `{,|+A~gauge}` are split into a `cmd` token array at
/// every `|` and `}`.
pub fn parse(text: &str) -> Result<ParsedResponse, CodecError> {
    let trimmed = text.trim();
    if looks_like_json(trimmed) {
        let raw: RawResponse = serde_json::from_str(trimmed)
            .map_err(|err| CodecError::Malformed(err.to_string()))?;
        return Ok(ParsedResponse::from_raw(raw));
    }
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        let raw = RawResponse {
            cmd: Some(split_pfod(trimmed)),
            ..RawResponse::default()
        };
        return Ok(ParsedResponse::from_raw(raw));
    }
    Err(CodecError::Malformed(format!(
        "unrecognised response text ({} bytes)",
        text.len()
    )))
}

fn looks_like_json(text: &str) -> bool {
    let mut chars = text.chars().filter(|c| !c.is_whitespace());
    matches!((chars.next(), chars.next()), (Some('{'), Some('"')))
}

fn split_pfod(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '|' | '}' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                if ch == '}' {
                    tokens.push("}".to_string());
                } else {
                    current.push(ch);
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
