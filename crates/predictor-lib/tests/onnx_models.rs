//! ONNX artifact loading and inference against a committed fixture graph
//!
//! `fixtures/linear_2out.onnx` computes `Y = X @ W + B` for a `[1, 3]` input
//! with W = [[1, 0.5], [2, -1], [0.5, 0.25]] and B = [10, 0.1].

use predictor_lib::models::FeatureVector;
use predictor_lib::predictor::{ModelArtifact, ModelSlot};
use predictor_lib::{LoadError, PredictError};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/linear_2out.onnx")
}

fn model_dir(slot: ModelSlot, extra: serde_json::Value) -> TempDir {
    let dir = TempDir::new().unwrap();
    let mut meta = serde_json::json!({
        "feature_names": ["soc", "soh", "battery_temperature"],
        "trained_at": "2024-06-01T00:00:00Z",
    });
    if let (Some(obj), Some(extra)) = (meta.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    std::fs::write(dir.path().join(slot.metadata_file()), meta.to_string()).unwrap();
    std::fs::copy(fixture(), dir.path().join(slot.onnx_file())).unwrap();
    dir
}

fn features() -> FeatureVector {
    FeatureVector {
        values: vec![1.0, 2.0, 3.0],
        substituted: Vec::new(),
    }
}

#[test]
fn test_onnx_first_column() {
    let dir = model_dir(ModelSlot::Rul, serde_json::json!({}));
    let artifact = ModelArtifact::load(dir.path(), ModelSlot::Rul).unwrap();

    assert_eq!(artifact.kind(), "onnx");
    assert_eq!(artifact.feature_count(), 3);
    // 1*1 + 2*2 + 3*0.5 + 10
    let rul = artifact.predict(&features()).unwrap();
    assert!((rul - 16.5).abs() < 1e-5, "rul was {}", rul);
}

#[test]
fn test_onnx_output_column_selection() {
    let dir = model_dir(ModelSlot::Rul, serde_json::json!({ "output_column": 1 }));
    let artifact = ModelArtifact::load(dir.path(), ModelSlot::Rul).unwrap();

    // 1*0.5 - 2*1 + 3*0.25 + 0.1
    let value = artifact.predict(&features()).unwrap();
    assert!((value + 0.65).abs() < 1e-5, "value was {}", value);
}

#[test]
fn test_onnx_failure_output_is_clamped() {
    let dir = model_dir(ModelSlot::Failure, serde_json::json!({}));
    let artifact = ModelArtifact::load(dir.path(), ModelSlot::Failure).unwrap();
    assert_eq!(artifact.predict(&features()).unwrap(), 1.0);

    let dir = model_dir(ModelSlot::Failure, serde_json::json!({ "output_column": 1 }));
    let artifact = ModelArtifact::load(dir.path(), ModelSlot::Failure).unwrap();
    assert_eq!(artifact.predict(&features()).unwrap(), 0.0);
}

#[test]
fn test_onnx_missing_column_is_inference_error() {
    let dir = model_dir(ModelSlot::Rul, serde_json::json!({ "output_column": 5 }));
    let artifact = ModelArtifact::load(dir.path(), ModelSlot::Rul).unwrap();

    let err = artifact.predict(&features()).unwrap_err();
    match err {
        PredictError::Inference(reason) => assert!(reason.contains("no column 5"), "{}", reason),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_onnx_missing_output_is_inference_error() {
    let dir = model_dir(ModelSlot::Rul, serde_json::json!({ "output_index": 1 }));
    let artifact = ModelArtifact::load(dir.path(), ModelSlot::Rul).unwrap();

    let err = artifact.predict(&features()).unwrap_err();
    match err {
        PredictError::Inference(reason) => assert!(reason.contains("no output 1"), "{}", reason),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_onnx_preferred_over_linear() {
    let dir = model_dir(ModelSlot::Rul, serde_json::json!({}));
    std::fs::write(
        dir.path().join(ModelSlot::Rul.linear_file()),
        r#"{"intercept": 999.0, "coefficients": [0.0, 0.0, 0.0]}"#,
    )
    .unwrap();

    let artifact = ModelArtifact::load(dir.path(), ModelSlot::Rul).unwrap();
    assert_eq!(artifact.kind(), "onnx");
    let rul = artifact.predict(&features()).unwrap();
    assert!((rul - 16.5).abs() < 1e-5);
}

#[test]
fn test_onnx_checksum_must_match() {
    let dir = model_dir(
        ModelSlot::Rul,
        serde_json::json!({ "sha256": "00".repeat(32) }),
    );
    let err = ModelArtifact::load(dir.path(), ModelSlot::Rul).unwrap_err();
    assert!(matches!(err, LoadError::ChecksumMismatch { .. }));
}
