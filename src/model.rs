use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
}

impl Alignment {
    fn parse(val: &str) -> Self {
        match val {
            "center" => Alignment::Center,
            "right" | "end" => Alignment::Right,
            _ => Alignment::Left,
        }
    }

    pub fn as_css(self) -> &'static str {
        match self {
            Alignment::Left => "left",
            Alignment::Center => "center",
            Alignment::Right => "right",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Text,
    Image,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const BLACK: Rgb = Rgb([0, 0, 0]);

    /// Parses `#rgb` or `#rrggbb` (leading `#` optional).
    pub fn parse_hex(val: &str) -> Option<Rgb> {
        let hex = val.trim().trim_start_matches('#');
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let expanded: String = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect(),
            6 => hex.to_string(),
            _ => return None,
        };
        let r = u8::from_str_radix(&expanded[0..2], 16).ok()?;
        let g = u8::from_str_radix(&expanded[2..4], 16).ok()?;
        let b = u8::from_str_radix(&expanded[4..6], 16).ok()?;
        Some(Rgb([r, g, b]))
    }

    pub fn to_hex(self) -> String {
        let [r, g, b] = self.0;
        format!("#{r:02x}{g:02x}{b:02x}")
    }

    pub(crate) fn unit(self) -> (f32, f32, f32) {
        let [r, g, b] = self.0;
        (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldStyle {
    pub font_size_pt: f32,
    pub font_family: String,
    pub color: Rgb,
    pub align: Alignment,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl Default for FieldStyle {
    fn default() -> Self {
        Self {
            font_size_pt: 12.0,
            font_family: "Arial".to_string(),
            color: Rgb::BLACK,
            align: Alignment::Left,
            bold: false,
            italic: false,
            underline: false,
        }
    }
}

/// A positioned placeholder on a template page. Geometry is in millimeters
/// from the top-left corner of the page.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(from = "RawField")]
pub struct Field {
    pub kind: FieldKind,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub column: String,
    pub style: FieldStyle,
}

/// Field as the canvas editor stores it.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    #[serde(default, rename = "type")]
    kind: FieldKind,
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
    #[serde(default = "default_width")]
    width: f32,
    #[serde(default = "default_height")]
    height: f32,
    #[serde(default)]
    column: Option<String>,
    #[serde(default = "default_font_size")]
    font_size: f32,
    #[serde(default)]
    font_family: Option<String>,
    #[serde(default)]
    font_color: Option<String>,
    #[serde(default)]
    font_weight: Option<String>,
    #[serde(default)]
    font_style: Option<String>,
    #[serde(default)]
    text_decoration: Option<String>,
    #[serde(default)]
    text_align: Option<String>,
}

fn default_width() -> f32 {
    100.0
}

fn default_height() -> f32 {
    20.0
}

fn default_font_size() -> f32 {
    12.0
}

impl From<RawField> for Field {
    fn from(raw: RawField) -> Self {
        let defaults = FieldStyle::default();
        let color = match raw.font_color.as_deref() {
            Some(hex) => Rgb::parse_hex(hex).unwrap_or_else(|| {
                log::warn!("Unrecognized font color {hex:?}, using black");
                Rgb::BLACK
            }),
            None => Rgb::BLACK,
        };
        Field {
            kind: raw.kind,
            x: raw.x,
            y: raw.y,
            width: raw.width,
            height: raw.height,
            column: raw.column.unwrap_or_default(),
            style: FieldStyle {
                font_size_pt: raw.font_size,
                font_family: raw
                    .font_family
                    .filter(|f| !f.trim().is_empty())
                    .unwrap_or(defaults.font_family),
                color,
                align: raw
                    .text_align
                    .as_deref()
                    .map(Alignment::parse)
                    .unwrap_or_default(),
                bold: raw.font_weight.as_deref().is_some_and(is_bold_weight),
                italic: matches!(raw.font_style.as_deref(), Some("italic" | "oblique")),
                underline: raw.text_decoration.as_deref() == Some("underline"),
            },
        }
    }
}

fn is_bold_weight(weight: &str) -> bool {
    match weight {
        "bold" | "bolder" => true,
        numeric => numeric.parse::<u16>().is_ok_and(|w| w >= 600),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Template {
    #[serde(default = "default_template_name")]
    pub name: String,
    // Canvas size from the editor; generation always uses the configured page.
    #[serde(default)]
    pub width: Option<f32>,
    #[serde(default)]
    pub height: Option<f32>,
    #[serde(default)]
    pub pages: Vec<Page>,
}

fn default_template_name() -> String {
    "template".to_string()
}

/// Binding from a field's logical column to a spreadsheet header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HashMap<String, Value>")]
pub struct ColumnMapping(HashMap<String, String>);

impl From<HashMap<String, Value>> for ColumnMapping {
    fn from(raw: HashMap<String, Value>) -> Self {
        ColumnMapping(
            raw.into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    _ => None,
                })
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ColumnMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ColumnMapping(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl ColumnMapping {
    pub fn header_for(&self, column: &str) -> Option<&str> {
        if column.is_empty() {
            return None;
        }
        self.0.get(column).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Scalar {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Scalar {
    pub fn display(&self) -> String {
        match self {
            Scalar::Empty => String::new(),
            Scalar::Text(s) => s.clone(),
            Scalar::Number(n) => format_number(*n),
            Scalar::Bool(true) => "TRUE".to_string(),
            Scalar::Bool(false) => "FALSE".to_string(),
        }
    }

    /// Spreadsheet falsiness: empty, `"0"`, zero and `false`.
    pub fn is_falsy(&self) -> bool {
        match self {
            Scalar::Empty => true,
            Scalar::Text(s) => s.is_empty() || s == "0",
            Scalar::Number(n) => *n == 0.0,
            Scalar::Bool(b) => !b,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Scalar::Empty => Value::Null,
            Scalar::Text(s) => Value::String(s.clone()),
            Scalar::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Bool(b) => Value::Bool(*b),
        }
    }
}

/// Integral values print without a fraction, like a spreadsheet cell would.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// A cell of an imported or posted row.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
    Map(serde_json::Map<String, Value>),
}

impl CellValue {
    pub fn empty() -> Self {
        CellValue::Scalar(Scalar::Empty)
    }

    pub fn text(s: impl Into<String>) -> Self {
        CellValue::Scalar(Scalar::Text(s.into()))
    }

    pub fn number(n: f64) -> Self {
        CellValue::Scalar(Scalar::Number(n))
    }

    /// The display string used for every field value.
    pub fn display(&self) -> String {
        match self {
            CellValue::Scalar(s) => s.display(),
            CellValue::List(items) => items
                .iter()
                .map(Scalar::display)
                .collect::<Vec<_>>()
                .join(", "),
            CellValue::Map(map) => serde_json::to_string(map).unwrap_or_default(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.display().is_empty()
    }

    /// Lists and maps are falsy only when they hold nothing.
    pub fn is_falsy(&self) -> bool {
        match self {
            CellValue::Scalar(s) => s.is_falsy(),
            CellValue::List(items) => items.is_empty(),
            CellValue::Map(map) => map.is_empty(),
        }
    }
}

fn scalar_from_json(v: Value) -> Option<Scalar> {
    match v {
        Value::Null => Some(Scalar::Empty),
        Value::Bool(b) => Some(Scalar::Bool(b)),
        Value::Number(n) => Some(n.as_f64().map_or(Scalar::Text(n.to_string()), Scalar::Number)),
        Value::String(s) if s.is_empty() => Some(Scalar::Empty),
        Value::String(s) => Some(Scalar::Text(s)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

impl From<Value> for CellValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Array(items) => {
                CellValue::List(items.into_iter().filter_map(scalar_from_json).collect())
            }
            Value::Object(map) => CellValue::Map(map),
            other => CellValue::Scalar(scalar_from_json(other).unwrap_or(Scalar::Empty)),
        }
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(CellValue::from)
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Scalar(s) => s.to_json().serialize(serializer),
            CellValue::List(items) => items
                .iter()
                .map(Scalar::to_json)
                .collect::<Vec<_>>()
                .serialize(serializer),
            CellValue::Map(map) => map.serialize(serializer),
        }
    }
}

/// One record of the data source, keyed by spreadsheet header in column order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(IndexMap<String, CellValue>);

impl Row {
    pub fn new() -> Self {
        Row(IndexMap::new())
    }

    /// Later inserts under an existing header replace the value but keep the position.
    pub fn insert(&mut self, header: impl Into<String>, value: CellValue) {
        self.0.insert(header.into(), value);
    }

    pub fn get(&self, header: &str) -> Option<&CellValue> {
        self.0.get(header)
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_blank(&self) -> bool {
        self.0.values().all(CellValue::is_blank)
    }

    /// True when no cell carries a truthy value. Importers drop such rows.
    pub fn is_falsy(&self) -> bool {
        self.0.values().all(CellValue::is_falsy)
    }
}

impl<K: Into<String>> FromIterator<(K, CellValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, CellValue)>>(iter: I) -> Self {
        Row(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Image placed beneath all fields, shared by every row of a batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum BackgroundSource {
    #[default]
    None,
    EmbeddedImage(String), // data URI or raw base64
    RasterizedFile(PathBuf),
}

impl BackgroundSource {
    pub fn is_none(&self) -> bool {
        matches!(self, BackgroundSource::None)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub filename: String,
    pub index: usize, // 1-based row position
    pub base64: String,
}
