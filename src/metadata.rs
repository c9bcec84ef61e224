//! The `.metadata.json` record accumulated across post-processing.
//!
//! Shape: `{"analysis": {"info": {<step name>: {<field>: <value>}}}}`. Each
//! step contributes its sub-map explicitly; there is no process-wide
//! accumulator.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// One table cell: numbers stay numbers so platform-side queries work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    Number(f64),
    Text(String),
}

impl MetaValue {
    /// Parse a table cell, preferring a numeric reading.
    pub fn parse(cell: &str) -> MetaValue {
        match cell.parse::<f64>() {
            Ok(number) => MetaValue::Number(number),
            Err(_) => MetaValue::Text(cell.to_string()),
        }
    }
}

/// Nested mapping under the fixed `analysis.info` root.
#[derive(Debug, Default, Clone)]
pub struct MetadataRecord {
    info: BTreeMap<String, BTreeMap<String, MetaValue>>,
}

#[derive(Serialize)]
struct Analysis<'a> {
    info: &'a BTreeMap<String, BTreeMap<String, MetaValue>>,
}

#[derive(Serialize)]
struct Root<'a> {
    analysis: Analysis<'a>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    pub fn insert(&mut self, step: &str, field: &str, value: impl Into<String>) {
        self.info
            .entry(step.to_string())
            .or_default()
            .insert(field.to_string(), MetaValue::Text(value.into()));
    }

    pub fn insert_table(&mut self, step: &str, table: BTreeMap<String, MetaValue>) {
        self.info.insert(step.to_string(), table);
    }

    pub fn get(&self, step: &str) -> Option<&BTreeMap<String, MetaValue>> {
        self.info.get(step)
    }

    /// Write `.metadata.json` at the output root. Nothing is written when
    /// the record is empty.
    pub fn write_if_not_empty(&self, output_dir: &Path) -> Result<()> {
        if self.is_empty() {
            tracing::debug!("metadata is empty, not writing .metadata.json");
            return Ok(());
        }
        let path = output_dir.join(".metadata.json");
        let root = Root {
            analysis: Analysis { info: &self.info },
        };
        let json = serde_json::to_string_pretty(&root).context("serialize metadata")?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        tracing::info!("Wrote {}", path.display());
        Ok(())
    }
}

/// Reformat a whitespace-delimited text table as comma-delimited.
pub fn whitespace_to_csv(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        let cells: Vec<&str> = line.split_whitespace().collect();
        if cells.is_empty() {
            continue;
        }
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

/// Parse a two-row comma-delimited stats table (header row, value row) into
/// a field map. Extra rows are ignored; a missing value row yields an empty
/// map.
pub fn parse_two_row_table(text: &str) -> BTreeMap<String, MetaValue> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let (Some(header), Some(values)) = (lines.next(), lines.next()) else {
        return BTreeMap::new();
    };
    header
        .split(',')
        .zip(values.split(','))
        .map(|(name, cell)| (name.trim().to_string(), MetaValue::parse(cell.trim())))
        .collect()
}

/// Parse a `name value` pair table (one pair per line, whitespace
/// delimited), the shape the segmentation quantification scripts emit.
pub fn parse_pair_table(text: &str) -> BTreeMap<String, MetaValue> {
    let mut table = BTreeMap::new();
    for line in text.lines() {
        let mut cells = line.split_whitespace();
        let (Some(name), Some(value)) = (cells.next(), cells.next()) else {
            continue;
        };
        table.insert(name.to_string(), MetaValue::parse(value));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_under_analysis_info() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = MetadataRecord::new();
        metadata.insert("dry_run", "note", "no command was run");
        metadata.write_if_not_empty(dir.path()).unwrap();

        let text = fs::read_to_string(dir.path().join(".metadata.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value["analysis"]["info"]["dry_run"]["note"],
            "no command was run"
        );
    }

    #[test]
    fn empty_record_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        MetadataRecord::new().write_if_not_empty(dir.path()).unwrap();
        assert!(!dir.path().join(".metadata.json").exists());
    }

    #[test]
    fn whitespace_table_becomes_csv() {
        let text = "Left-Lateral-Ventricle   7476.3\nRight-Whole_thalamus 6000.1\n";
        let csv = whitespace_to_csv(text);
        assert_eq!(
            csv,
            "Left-Lateral-Ventricle,7476.3\nRight-Whole_thalamus,6000.1\n"
        );
    }

    #[test]
    fn two_row_table_parses_numbers() {
        let table =
            parse_two_row_table("Measure:volume,Left-Lateral-Ventricle\nsub-01,7476.3\n");
        assert_eq!(
            table.get("Left-Lateral-Ventricle"),
            Some(&MetaValue::Number(7476.3))
        );
        assert_eq!(
            table.get("Measure:volume"),
            Some(&MetaValue::Text("sub-01".to_string()))
        );
    }

    #[test]
    fn pair_table_parses_names_and_values() {
        let table = parse_pair_table("Right-Whole_thalamus 7476.300538\nLeft-AV 120.5\n");
        assert_eq!(
            table.get("Right-Whole_thalamus"),
            Some(&MetaValue::Number(7476.300538))
        );
        assert_eq!(table.len(), 2);
    }
}
