//! Final report export: writes a completed `TestResult` to disk as JSON,
//! and reads it back for tooling that wants to inspect a past run without
//! re-running it.
//!
//! Narrowed to a single file write; report/dashboard rendering lives
//! elsewhere.

use std::fs;
use std::io;
use std::path::Path;

use crate::metrics_model::TestResult;

/// Writes `result` to `path` as pretty-printed JSON.
pub fn write_json(result: &TestResult, path: &Path) -> io::Result<()> {
    let body = serde_json::to_string_pretty(result)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, body)
}

/// Reads a previously written report back into a `TestResult`.
pub fn read_json(path: &Path) -> io::Result<TestResult> {
    let body = fs::read_to_string(path)?;
    serde_json::from_str(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn write_then_read_json_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let result = TestResult::new("checkout".to_string(), "constant(10)".to_string(), SystemTime::now());
        write_json(&result, &path).unwrap();

        let read_back = read_json(&path).unwrap();
        assert_eq!(read_back.scenario_name, "checkout");
        assert_eq!(read_back.pattern_description, "constant(10)");
    }

    #[test]
    fn read_json_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_json(&dir.path().join("missing.json"));
        assert!(result.is_err());
    }
}
