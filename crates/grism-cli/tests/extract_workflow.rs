//! Simulate-then-extract workflow through the CLI layer.

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_grism-rs"))
}

#[test]
fn simulate_writes_a_parseable_scene() {
    let temp = TempDir::new().expect("tempdir should be created");
    let scene_path = temp.path().join("scene.json");

    let status = binary()
        .args([
            "simulate",
            "--output",
            scene_path.to_str().expect("utf-8 path"),
            "--rows",
            "120",
            "--columns",
            "400",
        ])
        .status()
        .expect("simulate should launch");
    assert!(status.success());

    let source = fs::read_to_string(&scene_path).expect("scene should exist");
    let scene: serde_json::Value = serde_json::from_str(&source).expect("scene should parse");
    assert_eq!(scene["rows"], 120);
    assert_eq!(scene["columns"], 400);
    assert!(scene["traces"].as_array().map(|t| !t.is_empty()).unwrap_or(false));
}

#[test]
fn extract_reduces_a_simulated_scene_into_spectra() {
    let temp = TempDir::new().expect("tempdir should be created");
    let scene_path = temp.path().join("scene.json");
    let result_path = temp.path().join("result.json");

    let status = binary()
        .args([
            "simulate",
            "--output",
            scene_path.to_str().expect("utf-8 path"),
            "--rows",
            "160",
            "--columns",
            "500",
            "--amplitude",
            "800",
        ])
        .status()
        .expect("simulate should launch");
    assert!(status.success());

    let status = binary()
        .args([
            "extract",
            "--scene",
            scene_path.to_str().expect("utf-8 path"),
            "--output",
            result_path.to_str().expect("utf-8 path"),
        ])
        .status()
        .expect("extract should launch");
    assert!(status.success());

    let source = fs::read_to_string(&result_path).expect("result should exist");
    let result: serde_json::Value = serde_json::from_str(&source).expect("result should parse");
    let orders = result["orders"].as_array().expect("orders present");
    assert_eq!(orders.len(), 4);

    let first = orders
        .iter()
        .find(|o| o["order"] == "First")
        .expect("first order record");
    assert_eq!(first["present"], true);
    let flux = first["flux_simple"].as_array().expect("flux array");
    assert_eq!(flux.len(), 500);
    // The trace sits mid-image; the central column carries real flux.
    let mid = flux[250].as_f64().expect("finite flux");
    assert!(mid > 0.0);
}

#[test]
fn missing_scene_file_exits_nonzero() {
    let temp = TempDir::new().expect("tempdir should be created");
    let status = binary()
        .args([
            "extract",
            "--scene",
            temp.path().join("absent.json").to_str().expect("utf-8"),
            "--output",
            temp.path().join("out.json").to_str().expect("utf-8"),
        ])
        .status()
        .expect("extract should launch");
    assert!(!status.success());
}
