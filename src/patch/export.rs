//! CSV export of the patch list
//!
//! One row per connection, ordered by destination:
//! `source_unit,source_jack,dest_unit,dest_jack,scale`. The file is meant for
//! people and spreadsheets; the sled snapshot stays the source of truth.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::registry::PatchConnection;
use crate::protocol::JackAddr;

#[derive(Debug, Serialize, Deserialize)]
struct ConnectionRow {
    source_unit: u16,
    source_jack: u8,
    dest_unit: u16,
    dest_jack: u8,
    scale: f32,
}

impl From<&PatchConnection> for ConnectionRow {
    fn from(c: &PatchConnection) -> Self {
        Self {
            source_unit: c.source.unit,
            source_jack: c.source.jack,
            dest_unit: c.dest.unit,
            dest_jack: c.dest.jack,
            scale: c.scale,
        }
    }
}

impl From<ConnectionRow> for PatchConnection {
    fn from(row: ConnectionRow) -> Self {
        Self {
            source: JackAddr { unit: row.source_unit, jack: row.source_jack },
            dest: JackAddr { unit: row.dest_unit, jack: row.dest_jack },
            scale: row.scale,
        }
    }
}

/// Render connections as CSV text
pub fn to_csv_string(connections: &[PatchConnection]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for connection in connections {
        writer
            .serialize(ConnectionRow::from(connection))
            .context("Failed to write CSV row")?;
    }
    let bytes = writer.into_inner().context("Failed to finish CSV output")?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

/// Parse CSV text produced by [`to_csv_string`]
pub fn parse_csv(csv_content: &str) -> Result<Vec<PatchConnection>> {
    let mut reader = csv::Reader::from_reader(csv_content.as_bytes());
    let mut connections = Vec::new();

    for (line, result) in reader.deserialize::<ConnectionRow>().enumerate() {
        let row = result.with_context(|| format!("Failed to parse CSV row {}", line + 1))?;
        if !row.scale.is_finite() {
            anyhow::bail!("Row {} has a non-finite scale", line + 1);
        }
        connections.push(row.into());
    }
    Ok(connections)
}

pub async fn export_csv(path: impl AsRef<Path>, connections: &[PatchConnection]) -> Result<()> {
    let path = path.as_ref();
    let csv = to_csv_string(connections)?;
    tokio::fs::write(path, csv)
        .await
        .with_context(|| format!("Failed to write CSV file: {}", path.display()))?;
    info!("Exported {} connections to {}", connections.len(), path.display());
    Ok(())
}

pub async fn import_csv(path: impl AsRef<Path>) -> Result<Vec<PatchConnection>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;
    parse_csv(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_layout() {
        let connections = vec![PatchConnection {
            source: JackAddr { unit: 1, jack: 0 },
            dest: JackAddr { unit: 2, jack: 3 },
            scale: 0.5,
        }];
        let csv = to_csv_string(&connections).unwrap();
        assert_eq!(csv, "source_unit,source_jack,dest_unit,dest_jack,scale\n1,0,2,3,0.5\n");
        assert_eq!(parse_csv(&csv).unwrap(), connections);
    }

    #[test]
    fn test_bad_row_is_reported() {
        let csv = "source_unit,source_jack,dest_unit,dest_jack,scale\n1,0,2,x,1.0\n";
        let err = parse_csv(csv).unwrap_err();
        assert!(format!("{:#}", err).contains("row 1"));
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patches.csv");
        let connections = vec![
            PatchConnection {
                source: JackAddr { unit: 3, jack: 1 },
                dest: JackAddr { unit: 1, jack: 2 },
                scale: -1.0,
            },
            PatchConnection {
                source: JackAddr { unit: 3, jack: 1 },
                dest: JackAddr { unit: 2, jack: 0 },
                scale: 1.0,
            },
        ];
        export_csv(&path, &connections).await.unwrap();
        assert_eq!(import_csv(&path).await.unwrap(), connections);
    }
}
