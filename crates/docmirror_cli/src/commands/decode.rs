//! Decode command implementation.

use docmirror_codec::{pickle_to_json, JsonOptions, RecordTransform, Transformed};
use serde::Serialize;
use std::path::Path;

/// A decoded record for output.
#[derive(Debug, Serialize)]
pub struct DecodeResult {
    /// Dotted class name, absent for a bare pickle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Size of the class pickle in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_size: Option<usize>,
    /// The decoded state.
    pub state: serde_json::Value,
}

/// Runs the decode command.
pub fn run(path: &Path, bare_pickle: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;
    let result = decode(&data, bare_pickle)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result)?;
        }
    }

    Ok(())
}

fn decode(data: &[u8], bare_pickle: bool) -> Result<DecodeResult, Box<dyn std::error::Error>> {
    if bare_pickle {
        let json = pickle_to_json(data, JsonOptions::pretty())?;
        return Ok(DecodeResult {
            class_name: None,
            header_size: None,
            state: serde_json::from_str(&json)?,
        });
    }

    let transform = RecordTransform::new()
        .with_options(JsonOptions::pretty())
        .with_skip(|_| false);
    match transform.try_transform(data)? {
        Transformed::Record(record) => Ok(DecodeResult {
            class_name: Some(record.class_name),
            header_size: Some(record.header_bytes.len()),
            state: serde_json::from_str(&record.state_json)?,
        }),
        Transformed::Skip(reason) => Err(format!("record not decoded: {reason}").into()),
    }
}

fn print_text_output(result: &DecodeResult) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(class_name) = &result.class_name {
        println!("Class: {class_name}");
    }
    if let Some(size) = result.header_size {
        println!("Header: {size} bytes");
    }
    println!("{}", serde_json::to_string_pretty(&result.state)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_pickle_decodes() {
        // {'a': 1} at protocol 2
        let result = decode(b"\x80\x02}q\x00X\x01\x00\x00\x00aK\x01s.", true).unwrap();
        assert!(result.class_name.is_none());
        assert_eq!(result.state, serde_json::json!({"a": 1}));
    }

    #[test]
    fn full_record_keeps_skipped_classes() {
        let raw = docmirror_testkit::dict_record("BTrees.OOBTree", "OOBucket", &[("n", 2)]);
        let result = decode(&raw, false).unwrap();
        assert_eq!(result.class_name.as_deref(), Some("BTrees.OOBTree.OOBucket"));
        assert_eq!(result.state, serde_json::json!({"n": 2}));
    }

    #[test]
    fn empty_record_is_an_error() {
        assert!(decode(b"", false).is_err());
    }

    #[test]
    fn reads_records_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.bin");
        std::fs::write(&path, docmirror_testkit::dict_record("app", "Doc", &[])).unwrap();
        run(&path, false, "json").unwrap();
        run(&path, false, "text").unwrap();
        assert!(run(&dir.path().join("missing.bin"), false, "text").is_err());
    }
}
