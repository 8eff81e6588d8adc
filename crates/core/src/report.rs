//! Tabular summaries written next to the payloads of a task.

use geocore_registry::LogEntry;

use crate::model::{IntersectionResult, ParcelGeometry};

pub const LOG_FILE: &str = "log.txt";
pub const PARCELS_FILE: &str = "DATOS_CATASTRALES.csv";
pub const AFFECTIONS_FILE: &str = "afecciones_resultados.csv";

#[derive(Debug, Clone, PartialEq)]
pub struct ParcelRow {
    pub reference: String,
    pub crs: String,
    pub area: f64,
    pub local_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AffectionRow {
    pub reference: String,
    pub layer: String,
    pub matched: usize,
}

/// Accumulates what a task found while it runs.
#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    pub parcels: Vec<ParcelRow>,
    pub affections: Vec<AffectionRow>,
}

impl TaskReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_parcel(&mut self, parcel: &ParcelGeometry) {
        self.parcels.push(ParcelRow {
            reference: parcel.reference.clone(),
            crs: parcel.crs.to_string(),
            area: parcel.area,
            local_id: parcel.local_id().map(str::to_string),
        });
    }

    pub fn record_affection(&mut self, reference: &str, result: &IntersectionResult) {
        self.affections.push(AffectionRow {
            reference: reference.to_string(),
            layer: result.layer.clone(),
            matched: result.matched,
        });
    }

    pub fn parcels_csv(&self) -> String {
        let mut out = String::from("referencia,crs,area,id_local\n");
        for row in &self.parcels {
            out.push_str(&csv_line(&[
                &row.reference,
                &row.crs,
                &format!("{:.2}", row.area),
                row.local_id.as_deref().unwrap_or(""),
            ]));
        }
        out
    }

    pub fn affections_csv(&self) -> String {
        let mut out = String::from("referencia,capa,elementos\n");
        for row in &self.affections {
            out.push_str(&csv_line(&[
                &row.reference,
                &row.layer,
                &row.matched.to_string(),
            ]));
        }
        out
    }
}

/// One line per entry, `HH:MM:SS [TYPE] message`.
pub fn render_log(entries: &[LogEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!(
            "{} [{}] {}\n",
            entry.timestamp,
            entry.severity.to_string().to_uppercase(),
            entry.message
        ));
    }
    out
}

fn csv_line(fields: &[&str]) -> String {
    let escaped: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
    format!("{}\n", escaped.join(","))
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use geocore_registry::Severity;

    use super::*;

    #[test]
    fn csv_quotes_only_when_needed() {
        assert_eq!(csv_field("capa.gpkg"), "capa.gpkg");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("di \"x\""), "\"di \"\"x\"\"\"");
    }

    #[test]
    fn renders_both_tables() {
        let mut report = TaskReport::new();
        report.parcels.push(ParcelRow {
            reference: "R1".to_string(),
            crs: "EPSG:25830".to_string(),
            area: 10000.0,
            local_id: Some("R1".to_string()),
        });
        report.record_affection(
            "R1",
            &IntersectionResult {
                layer: "espacios/red natura.gpkg".to_string(),
                matched: 2,
                sample: None,
            },
        );
        assert_eq!(
            report.parcels_csv(),
            "referencia,crs,area,id_local\nR1,EPSG:25830,10000.00,R1\n"
        );
        assert_eq!(
            report.affections_csv(),
            "referencia,capa,elementos\nR1,espacios/red natura.gpkg,2\n"
        );
    }

    #[test]
    fn log_lines_carry_time_and_type() {
        let entries = vec![LogEntry {
            id: "e".to_string(),
            index: 0,
            timestamp: "10:00:00".to_string(),
            message: "[p] hola".to_string(),
            severity: Severity::Warning,
        }];
        assert_eq!(render_log(&entries), "10:00:00 [WARNING] [p] hola\n");
    }
}
