//! JSON exporter for session traces.
//!
//! Exports one frame per round so a run can be inspected or plotted offline.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// State of one slave at the end of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveFrame {
    pub id: String,
    pub value: i64,

    /// The master's entry for this slave, if it has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported: Option<i64>,
}

/// A single round of session data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundFrame {
    pub round: u64,

    /// Exact sum of the slaves' values
    pub true_sum: i64,

    /// The master's estimate
    pub global_sum: i64,

    pub relative_error: f64,

    pub store_available: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slaves: Vec<SlaveFrame>,
}

/// Complete session export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// All rounds
    pub rounds: Vec<RoundFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_relative_error: Option<f64>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            rounds: Vec::new(),
            passed: false,
            final_relative_error: None,
        }
    }

    pub fn add_round(&mut self, frame: RoundFrame) {
        self.rounds.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, relative_error: Option<f64>) {
        self.passed = passed;
        self.final_relative_error = relative_error;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(round: u64) -> RoundFrame {
        RoundFrame {
            round,
            true_sum: 10,
            global_sum: 9,
            relative_error: 0.1,
            store_available: true,
            slaves: vec![SlaveFrame {
                id: "1".to_string(),
                value: 10,
                reported: Some(9),
            }],
        }
    }

    #[test]
    fn test_export_written_as_json() {
        let mut export = SimExport::new("baseline", 7);
        export.add_round(frame(0));
        export.add_round(frame(1));
        export.finalize(true, Some(0.0));

        let dir = std::env::temp_dir().join(format!("distsum-export-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("baseline.json");
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: SimExport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.rounds, export.rounds);
        assert!(parsed.passed);
        assert_eq!(parsed.final_relative_error, Some(0.0));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_empty_fields_skipped() {
        let mut round = frame(3);
        round.slaves.clear();
        let json = serde_json::to_value(&round).unwrap();
        assert!(json.get("slaves").is_none());

        let export = SimExport::new("outage", 1);
        let json = serde_json::to_value(&export).unwrap();
        assert!(json.get("final_relative_error").is_none());
    }
}
