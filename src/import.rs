//! Spreadsheet ingestion: xlsx through zip and roxmltree, CSV, and JSON rows.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use serde::Serialize;

use crate::error::Error;
use crate::model::{CellValue, Row, Scalar};

const REL_TYPE_SUFFIX: &str = "/worksheet";

/// Largest row and column a worksheet may address (Excel 2007+ limits).
pub const MAX_ROWS: u32 = 1_048_576;
pub const MAX_COLUMNS: u32 = 16_384;

/// Cells keyed by 1-based (row, column).
type Grid = BTreeMap<(u32, u32), Scalar>;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ImportedSheet {
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceFormat {
    Ooxml,
    Csv,
    Json,
}

fn detect_format(path: &Path) -> Result<SourceFormat, Error> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("xlsx" | "xlsm") => return Ok(SourceFormat::Ooxml),
        Some("csv" | "txt") => return Ok(SourceFormat::Csv),
        Some("json") => return Ok(SourceFormat::Json),
        Some(other @ ("xls" | "ods" | "numbers")) => {
            return Err(Error::Import(format!("unsupported spreadsheet format: .{other}")));
        }
        _ => {}
    }
    let mut magic = [0u8; 2];
    let mut file = std::fs::File::open(path)?;
    let n = file.read(&mut magic)?;
    if n == 2 && &magic == b"PK" {
        Ok(SourceFormat::Ooxml)
    } else {
        Ok(SourceFormat::Csv)
    }
}

/// Reads the first header row and every data row of a spreadsheet.
pub fn import_rows(path: &Path) -> Result<ImportedSheet, Error> {
    let sheet = match detect_format(path)? {
        SourceFormat::Ooxml => build_sheet(read_xlsx(path)?),
        SourceFormat::Csv => build_sheet(read_csv(path)?),
        SourceFormat::Json => read_json_rows(path)?,
    };
    log::debug!(
        "Imported {} rows, {} columns from {}",
        sheet.rows.len(),
        sheet.columns.len(),
        path.display()
    );
    Ok(sheet)
}

fn build_sheet(grid: Grid) -> ImportedSheet {
    let max_col = grid.keys().map(|&(_, c)| c).max().unwrap_or(0);

    let headers: Vec<String> = (1..=max_col)
        .map(|col| {
            let name = grid.get(&(1, col)).map(Scalar::display).unwrap_or_default();
            if name.is_empty() {
                format!("Column{col}")
            } else {
                name
            }
        })
        .collect();

    let mut rows = Vec::new();
    // Rows without any stored cell are all empty and would be dropped anyway.
    let data_rows: BTreeSet<u32> = grid.keys().map(|&(r, _)| r).filter(|&r| r > 1).collect();
    for r in data_rows {
        let mut row = Row::new();
        for (i, header) in headers.iter().enumerate() {
            let cell = grid
                .get(&(r, i as u32 + 1))
                .cloned()
                .unwrap_or(Scalar::Empty);
            row.insert(header.clone(), CellValue::Scalar(cell));
        }
        if !row.is_falsy() {
            rows.push(row);
        }
    }

    let mut columns: Vec<String> = Vec::with_capacity(headers.len());
    for header in headers {
        if !columns.contains(&header) {
            columns.push(header);
        }
    }

    ImportedSheet { rows, columns }
}

fn read_json_rows(path: &Path) -> Result<ImportedSheet, Error> {
    let file = std::fs::File::open(path)?;
    let mut rows: Vec<Row> = serde_json::from_reader(std::io::BufReader::new(file))?;
    rows.retain(|row| !row.is_falsy());
    let mut columns: Vec<String> = Vec::new();
    for header in rows.iter().flat_map(Row::headers) {
        if !columns.iter().any(|c| c == header) {
            columns.push(header.to_string());
        }
    }
    Ok(ImportedSheet { rows, columns })
}

/// 1-based coordinate from a 0-based position, bounded by `max`.
fn checked_coord(pos: usize, max: u32, what: &str) -> Result<u32, Error> {
    u32::try_from(pos)
        .ok()
        .and_then(|p| p.checked_add(1))
        .filter(|&p| p <= max)
        .ok_or_else(|| Error::Import(format!("{what} {} exceeds the limit of {max}", pos + 1)))
}

fn check_bound(value: u32, max: u32, what: &str) -> Result<u32, Error> {
    if (1..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Error::Import(format!("{what} {value} outside 1..={max}")))
    }
}

fn read_csv(path: &Path) -> Result<Grid, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut grid = Grid::new();
    for (r, record) in reader.records().enumerate() {
        let record = record?;
        let row = checked_coord(r, MAX_ROWS, "row")?;
        for (c, raw) in record.iter().enumerate() {
            let col = checked_coord(c, MAX_COLUMNS, "column")?;
            let text = if r == 0 && c == 0 {
                raw.trim_start_matches('\u{feff}')
            } else {
                raw
            };
            if !text.is_empty() {
                grid.insert((row, col), Scalar::Text(text.to_string()));
            }
        }
    }
    Ok(grid)
}

// Transitional and Strict workbooks use different namespaces; match on local name.
fn sml<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Option<roxmltree::Node<'a, 'a>> {
    node.children().find(|n| n.tag_name().name() == name)
}

fn sml_children<'a>(
    node: roxmltree::Node<'a, 'a>,
    name: &'a str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'a>> + 'a {
    node.children().filter(move |n| n.tag_name().name() == name)
}

fn relationship_id<'a>(node: roxmltree::Node<'a, 'a>) -> Option<&'a str> {
    node.attributes()
        .find(|a| a.name() == "id" && a.namespace().is_some())
        .map(|a| a.value())
}

fn read_part(zip: &mut zip::ZipArchive<std::fs::File>, name: &str) -> Result<Option<String>, Error> {
    let mut file = match zip.by_name(name) {
        Ok(f) => f,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut xml_content = String::new();
    file.read_to_string(&mut xml_content)?;
    Ok(Some(xml_content))
}

/// Text of an `<si>` or `<is>` element: plain `<t>` or rich-text runs,
/// without phonetic hints.
fn rich_text(node: roxmltree::Node) -> String {
    node.descendants()
        .filter(|n| n.tag_name().name() == "t")
        .filter(|n| {
            n.ancestors()
                .all(|a| a.tag_name().name() != "rPh")
        })
        .filter_map(|n| n.text())
        .collect()
}

fn parse_shared_strings(zip: &mut zip::ZipArchive<std::fs::File>) -> Result<Vec<String>, Error> {
    let Some(xml_content) = read_part(zip, "xl/sharedStrings.xml")? else {
        return Ok(Vec::new());
    };
    let xml = roxmltree::Document::parse(&xml_content)?;
    Ok(sml_children(xml.root_element(), "si").map(rich_text).collect())
}

fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    }
}

/// Path of the worksheet the workbook opens on.
fn active_sheet_path(zip: &mut zip::ZipArchive<std::fs::File>) -> Result<String, Error> {
    let workbook_xml = read_part(zip, "xl/workbook.xml")?
        .ok_or_else(|| Error::Import("missing xl/workbook.xml".into()))?;
    let workbook = roxmltree::Document::parse(&workbook_xml)?;
    let root = workbook.root_element();

    let active_tab = sml(root, "bookViews")
        .and_then(|n| sml(n, "workbookView"))
        .and_then(|n| n.attribute("activeTab"))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    let sheets: Vec<roxmltree::Node> = sml(root, "sheets")
        .map(|n| sml_children(n, "sheet").collect())
        .unwrap_or_default();
    let sheet = sheets
        .get(active_tab)
        .or_else(|| sheets.first())
        .ok_or_else(|| Error::Import("workbook has no sheets".into()))?;
    let rel_id = relationship_id(*sheet)
        .ok_or_else(|| Error::Import("sheet without relationship id".into()))?;

    let rels_xml = read_part(zip, "xl/_rels/workbook.xml.rels")?;
    let target = rels_xml
        .as_deref()
        .map(roxmltree::Document::parse)
        .transpose()?
        .and_then(|rels| {
            let target = sml_children(rels.root_element(), "Relationship")
                .find(|r| {
                    r.attribute("Id") == Some(rel_id)
                        && r.attribute("Type").is_some_and(|t| t.ends_with(REL_TYPE_SUFFIX))
                })
                .and_then(|r| r.attribute("Target"))
                .map(resolve_target);
            target
        });

    Ok(target.unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", active_tab + 1)))
}

/// 1-based index of a column label: `A` is 1, `AB` is 28.
pub(crate) fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0u32, |acc, c| {
        let c = c.to_ascii_uppercase();
        if !c.is_ascii_uppercase() {
            return None;
        }
        acc.checked_mul(26)?.checked_add(c as u32 - 'A' as u32 + 1)
    })
}

/// Splits `B7` into (column 2, row 7).
pub(crate) fn split_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let digits_at = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(digits_at);
    Some((column_index(letters)?, digits.parse().ok()?))
}

fn parse_number(raw: &str) -> Scalar {
    match raw.trim().parse::<f64>() {
        Ok(n) => Scalar::Number(n),
        Err(_) => Scalar::Text(raw.to_string()),
    }
}

fn cell_value(cell: roxmltree::Node, shared: &[String]) -> Scalar {
    let raw = sml(cell, "v").and_then(|n| n.text());
    match cell.attribute("t") {
        Some("inlineStr") => {
            let text = sml(cell, "is").map(rich_text).unwrap_or_default();
            if text.is_empty() {
                Scalar::Empty
            } else {
                Scalar::Text(text)
            }
        }
        _ if raw.is_none() => Scalar::Empty,
        Some("s") => raw
            .and_then(|v| v.trim().parse::<usize>().ok())
            .and_then(|i| shared.get(i))
            .filter(|s| !s.is_empty())
            .map_or(Scalar::Empty, |s| Scalar::Text(s.clone())),
        Some("b") => Scalar::Bool(raw.is_some_and(|v| v.trim() == "1")),
        Some("str" | "e" | "d") => raw
            .filter(|v| !v.is_empty())
            .map_or(Scalar::Empty, |v| Scalar::Text(v.to_string())),
        _ => raw.map_or(Scalar::Empty, parse_number),
    }
}

fn parse_sheet(xml_content: &str, shared: &[String]) -> Result<Grid, Error> {
    let xml = roxmltree::Document::parse(xml_content)?;
    let sheet_data = sml(xml.root_element(), "sheetData")
        .ok_or_else(|| Error::Import("worksheet without sheetData".into()))?;

    let mut grid = Grid::new();
    let mut next_row = 1u32;
    for row_node in sml_children(sheet_data, "row") {
        let row_num = match row_node.attribute("r") {
            Some(r) => r
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::Import(format!("invalid row reference {r:?}")))?,
            None => next_row,
        };
        let row_num = check_bound(row_num, MAX_ROWS, "row")?;
        next_row = row_num.saturating_add(1);

        let mut next_col = 1u32;
        for cell in sml_children(row_node, "c") {
            let col = match cell.attribute("r") {
                Some(r) => split_cell_ref(r)
                    .map(|(col, _)| col)
                    .ok_or_else(|| Error::Import(format!("invalid cell reference {r:?}")))?,
                None => next_col,
            };
            let col = check_bound(col, MAX_COLUMNS, "column")?;
            next_col = col.saturating_add(1);

            let value = cell_value(cell, shared);
            if value != Scalar::Empty {
                grid.insert((row_num, col), value);
            }
        }
    }
    Ok(grid)
}

fn read_xlsx(path: &Path) -> Result<Grid, Error> {
    let file = std::fs::File::open(path)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::Import(format!("not a spreadsheet archive: {e}")))?;

    let shared = parse_shared_strings(&mut zip)?;
    let sheet_path = active_sheet_path(&mut zip)?;
    let sheet_xml = read_part(&mut zip, &sheet_path)?
        .ok_or_else(|| Error::Import(format!("missing worksheet {sheet_path}")))?;
    parse_sheet(&sheet_xml, &shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters() {
        assert_eq!(column_index("A"), Some(1));
        assert_eq!(column_index("z"), Some(26));
        assert_eq!(column_index("AB"), Some(28));
        assert_eq!(column_index("A1"), None);
        assert_eq!(split_cell_ref("AA10"), Some((27, 10)));
        assert_eq!(split_cell_ref("10"), None);
    }
}
