//! Tests for error types

use std::path::PathBuf;

use protos_db::Error;

#[test]
fn test_inverted_dependency_error() {
    let error = Error::InvertedDependency {
        step: "fit".to_string(),
        token: 3,
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Inverted dependency"));
    assert!(error_str.contains("'fit'"));
    assert!(error_str.contains("token 3"));
    assert!(error.is_usage_error());
}

#[test]
fn test_step_failed_error() {
    let error = Error::StepFailed {
        step: "calibrate".to_string(),
        token: 0,
        source: anyhow::anyhow!("detector saturated").into(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("Step 'calibrate' (token 0) failed"));
    assert!(error_str.contains("detector saturated"));
    assert!(!error.is_usage_error());
    assert!(std::error::Error::source(&error).is_some());
}

#[test]
fn test_unknown_adapter_error() {
    let error = Error::UnknownAdapter {
        name: "cassandra".to_string(),
        available: "disk, document".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("'cassandra'"));
    assert!(error_str.contains("available: disk, document"));
    assert!(error.is_usage_error());
}

#[test]
fn test_protocol_errors() {
    assert!(format!("{}", Error::UnknownProtocol("a.b".to_string())).contains("Unknown protocol 'a.b'"));
    assert!(format!("{}", Error::DuplicateProtocol("a.b".to_string())).contains("already registered"));
}

#[test]
fn test_missing_file_error() {
    let error = Error::MissingFile(PathBuf::from("/nope/result.txt"));
    assert!(format!("{error}").contains("/nope/result.txt"));
    assert!(error.is_usage_error());
}

#[test]
fn test_connection_lost_error() {
    let error = Error::ConnectionLost("socket closed".to_string());
    assert!(error.is_connection_lost());
    assert!(!error.is_usage_error());
    assert!(format!("{error}").contains("Storage connection lost"));
}

#[test]
fn test_storage_fatal_error() {
    let error = Error::StorageFatal("find_bundles: refused".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("failed after reconnect"));
    assert!(error_str.contains("storage_server"));
    assert!(!error.is_connection_lost());
}

#[test]
fn test_non_unique_id_error() {
    let error = Error::NonUniqueId("x1".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Non-unique id detected: 'x1'"));
    assert!(error_str.contains("Please report this issue"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    assert!(format!("{error}").contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[cfg(feature = "relational")]
#[test]
fn test_sqlite_error_conversion() {
    let error: Error = rusqlite::Error::QueryReturnedNoRows.into();
    assert!(matches!(error, Error::Sqlite(_)));
    assert!(!error.is_connection_lost());
}

#[test]
fn test_error_debug() {
    let error = Error::NotFound("experiment 'x9'".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("NotFound"));
}
