//! Response Renderer
//!
//! Projects the canonical cached upstream JSON into the formats readers ask
//! for. The cache always holds the upstream body as received; rendering
//! happens per request.
//!
//! ## Input shape
//!
//! ```json
//! {
//!   "columnHeaders": [{"name": "ga:country", "dataType": "STRING"},
//!                     {"name": "ga:sessions", "dataType": "INTEGER"}],
//!   "rows": [["Canada", "12"], ["Chile", "3"]]
//! }
//! ```
//!
//! ## Formats
//!
//! - `json`: the body unchanged
//! - `csv` / `tsv`: header row of column names, then one line per row
//! - `data-table`: `{cols: [{id, label, type}], rows: [{c: [{v}]}]}`
//! - `data-table-response`: the data table wrapped as a query response

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResponseFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "csv")]
    Csv,
    #[serde(rename = "data-table")]
    DataTable,
    #[serde(rename = "data-table-response")]
    DataTableResponse,
    #[serde(rename = "tsv")]
    Tsv,
}

impl ResponseFormat {
    pub const ALL: [ResponseFormat; 5] = [
        ResponseFormat::Json,
        ResponseFormat::Csv,
        ResponseFormat::DataTable,
        ResponseFormat::DataTableResponse,
        ResponseFormat::Tsv,
    ];

    /// Value of the `format` query parameter
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseFormat::Json => "json",
            ResponseFormat::Csv => "csv",
            ResponseFormat::DataTable => "data-table",
            ResponseFormat::DataTableResponse => "data-table-response",
            ResponseFormat::Tsv => "tsv",
        }
    }

    /// Human-readable name
    pub fn label(self) -> &'static str {
        match self {
            ResponseFormat::Json => "JSON",
            ResponseFormat::Csv => "CSV",
            ResponseFormat::DataTable => "DataTable (JSON String)",
            ResponseFormat::DataTableResponse => "DataTable (JSON Response)",
            ResponseFormat::Tsv => "TSV for Excel",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ResponseFormat::Json | ResponseFormat::DataTable | ResponseFormat::DataTableResponse => {
                "application/json; charset=utf-8"
            }
            ResponseFormat::Csv => "text/csv; charset=utf-8",
            ResponseFormat::Tsv => "text/tab-separated-values; charset=utf-8",
        }
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ResponseFormat::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("Unsupported format '{wanted}'"))
    }
}

/// A rendered body with its content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub content_type: &'static str,
    pub body: String,
}

/// Options for delimited output
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Field delimiter (default: ',')
    pub delimiter: char,
    /// Quote character (default: '"')
    pub quote_char: char,
    /// Whether to write the header row (default: true)
    pub has_header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        CsvOptions {
            delimiter: ',',
            quote_char: '"',
            has_header: true,
        }
    }
}

impl CsvOptions {
    pub fn tsv() -> Self {
        CsvOptions {
            delimiter: '\t',
            ..CsvOptions::default()
        }
    }
}

/// Render `content` in `format`
pub fn render(content: &Value, format: ResponseFormat) -> Result<Rendered, serde_json::Error> {
    let body = match format {
        ResponseFormat::Json => serde_json::to_string(content)?,
        ResponseFormat::Csv => to_delimited(content, &CsvOptions::default()),
        ResponseFormat::Tsv => to_delimited(content, &CsvOptions::tsv()),
        ResponseFormat::DataTable => serde_json::to_string(&to_data_table(content))?,
        ResponseFormat::DataTableResponse => serde_json::to_string(&json!({
            "version": "0.6",
            "status": "ok",
            "reqId": "0",
            "table": to_data_table(content),
        }))?,
    };
    Ok(Rendered {
        content_type: format.content_type(),
        body,
    })
}

/// Copy of `content` without account identifiers
pub fn anonymize(content: &Value) -> Value {
    let mut content = content.clone();
    if let Some(obj) = content.as_object_mut() {
        obj.remove("id");
        obj.remove("selfLink");
        obj.remove("profileInfo");
        if let Some(query) = obj.get_mut("query").and_then(Value::as_object_mut) {
            query.remove("ids");
        }
    }
    content
}

fn column_headers(content: &Value) -> Vec<(&str, &str)> {
    content
        .get("columnHeaders")
        .and_then(Value::as_array)
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    (
                        h.get("name").and_then(Value::as_str).unwrap_or_default(),
                        h.get("dataType").and_then(Value::as_str).unwrap_or("STRING"),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn rows(content: &Value) -> &[Value] {
    content
        .get("rows")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_field(field: &str, options: &CsvOptions) -> String {
    let needs_quotes = field.contains(options.delimiter)
        || field.contains(options.quote_char)
        || field.contains('\n')
        || field.contains('\r');
    if !needs_quotes {
        return field.to_string();
    }
    let quote = options.quote_char.to_string();
    let doubled = format!("{quote}{quote}");
    format!("{quote}{}{quote}", field.replace(&quote, &doubled))
}

/// Delimited text: header of column names, then one line per row
pub fn to_delimited(content: &Value, options: &CsvOptions) -> String {
    let delimiter = options.delimiter.to_string();
    let mut out = String::new();

    if options.has_header {
        let header = column_headers(content)
            .iter()
            .map(|(name, _)| escape_field(name, options))
            .collect::<Vec<_>>()
            .join(&delimiter);
        out.push_str(&header);
        out.push('\n');
    }

    for row in rows(content) {
        let Some(cells) = row.as_array() else { continue };
        let line = cells
            .iter()
            .map(|c| escape_field(&cell_text(c), options))
            .collect::<Vec<_>>()
            .join(&delimiter);
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn is_numeric_type(data_type: &str) -> bool {
    matches!(
        data_type.to_ascii_uppercase().as_str(),
        "INTEGER" | "FLOAT" | "PERCENT" | "TIME" | "CURRENCY"
    )
}

fn numeric_cell(cell: &Value) -> Value {
    match cell {
        Value::Number(_) => cell.clone(),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number),
        _ => Value::Null,
    }
}

/// Google Visualization DataTable literal
pub fn to_data_table(content: &Value) -> Value {
    let headers = column_headers(content);
    let cols: Vec<Value> = headers
        .iter()
        .map(|(name, data_type)| {
            let kind = if is_numeric_type(data_type) { "number" } else { "string" };
            json!({"id": name, "label": name, "type": kind})
        })
        .collect();

    let table_rows: Vec<Value> = rows(content)
        .iter()
        .filter_map(Value::as_array)
        .map(|cells| {
            let c: Vec<Value> = cells
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let numeric = headers.get(i).is_some_and(|(_, t)| is_numeric_type(t));
                    let v = if numeric { numeric_cell(cell) } else { Value::String(cell_text(cell)) };
                    let mut entry = Map::new();
                    entry.insert("v".to_string(), v);
                    Value::Object(entry)
                })
                .collect();
            json!({ "c": c })
        })
        .collect();

    json!({ "cols": cols, "rows": table_rows })
}
