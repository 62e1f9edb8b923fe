//! Relation prediction tables.
//!
//! One row per predicted relation; written as CSV with a header line.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, VrdError};

pub const COLUMNS: [&str; 14] = [
    "image_id_1",
    "entity_1",
    "xmin_1",
    "xmax_1",
    "ymin_1",
    "ymax_1",
    "image_id_2",
    "entity_2",
    "xmin_2",
    "xmax_2",
    "ymin_2",
    "ymax_2",
    "occlusion",
    "distance",
];

/// A single predicted relation between two entities.
///
/// Field order is the column order of the CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub image_id_1: String,
    pub entity_1: String,
    pub xmin_1: f32,
    pub xmax_1: f32,
    pub ymin_1: f32,
    pub ymax_1: f32,
    pub image_id_2: String,
    pub entity_2: String,
    pub xmin_2: f32,
    pub xmax_2: f32,
    pub ymin_2: f32,
    pub ymax_2: f32,
    pub occlusion: i64,
    pub distance: i64,
}

impl PredictionRow {
    /// Subject box in [x1, y1, x2, y2] format.
    pub fn box_1(&self) -> [f32; 4] {
        [self.xmin_1, self.ymin_1, self.xmax_1, self.ymax_1]
    }

    /// Object box in [x1, y1, x2, y2] format.
    pub fn box_2(&self) -> [f32; 4] {
        [self.xmin_2, self.ymin_2, self.xmax_2, self.ymax_2]
    }
}

/// Accumulates prediction rows across batches before writing them out.
#[derive(Debug, Default, Clone)]
pub struct PredictionTable {
    pub rows: Vec<PredictionRow>,
}

impl PredictionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: PredictionRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the table with a header line, no index column.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut w = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
        if self.rows.is_empty() {
            w.write_record(COLUMNS).map_err(|e| csv_error(path, e))?;
        }
        for row in &self.rows {
            w.serialize(row).map_err(|e| csv_error(path, e))?;
        }
        w.flush().map_err(|source| VrdError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

fn csv_error(path: &Path, err: csv::Error) -> VrdError {
    let line = err.position().map_or(0, |p| p.line() as usize);
    let message = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => VrdError::Io {
            path: path.display().to_string(),
            source,
        },
        _ => VrdError::Csv {
            path: path.display().to_string(),
            line,
            message,
        },
    }
}

/// Read a prediction table written by [`PredictionTable::write_csv`].
pub fn read_predictions(path: &Path) -> Result<PredictionTable> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| csv_error(path, e))?;
    let mut table = PredictionTable::new();
    for row in reader.deserialize() {
        table.push(row.map_err(|e| csv_error(path, e))?);
    }
    Ok(table)
}
