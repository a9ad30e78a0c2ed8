mod common;

use std::fs;
use std::process::Command;
use tempfile::tempdir;

fn trendwise() -> Command {
    Command::new(env!("CARGO_BIN_EXE_trendwise"))
}

#[test]
fn assess_prints_label_and_reasons() {
    let tmp = tempdir().expect("temporary directory");
    common::write_sample_data(tmp.path());

    let output = trendwise()
        .args(["assess", "--user", "U2", "--trend", "Glow Serum", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run trendwise");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Medium"));
    assert!(stdout.contains("allergen match: fragrance"));
}

#[test]
fn unknown_user_exits_with_error() {
    let tmp = tempdir().expect("temporary directory");
    common::write_sample_data(tmp.path());

    let output = trendwise()
        .args(["assess", "--user", "U99", "--trend", "Glow Serum", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run trendwise");
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("U99"));
}

#[test]
fn train_then_predict_with_saved_model() {
    let tmp = tempdir().expect("temporary directory");
    common::write_sample_data(tmp.path());
    let model = tmp.path().join("model.toml");
    let predictions = tmp.path().join("predictions.csv");

    let status = trendwise()
        .arg("train")
        .arg("--data-dir")
        .arg(tmp.path())
        .arg("--model")
        .arg(&model)
        .status()
        .expect("run trendwise train");
    assert!(status.success());
    assert!(model.exists());

    let status = trendwise()
        .arg("predict")
        .arg("--data-dir")
        .arg(tmp.path())
        .arg("--model")
        .arg(&model)
        .arg("--out")
        .arg(&predictions)
        .status()
        .expect("run trendwise predict");
    assert!(status.success());

    let csv = fs::read_to_string(&predictions).unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("user_id,trend_id,rule_label"));
    assert_eq!(lines.count(), 120);
}

#[test]
fn matrix_writes_tsv() {
    let tmp = tempdir().expect("temporary directory");
    common::write_sample_data(tmp.path());
    let out = tmp.path().join("matrix.tsv");

    let status = trendwise()
        .arg("matrix")
        .arg("--data-dir")
        .arg(tmp.path())
        .arg("--out")
        .arg(&out)
        .status()
        .expect("run trendwise matrix");
    assert!(status.success());

    let tsv = fs::read_to_string(&out).unwrap();
    assert_eq!(tsv.lines().count(), 121);
    assert!(tsv.lines().next().unwrap().contains("\trule_label\t"));
}

#[test]
fn report_rejects_unknown_label_filter() {
    let tmp = tempdir().expect("temporary directory");
    common::write_sample_data(tmp.path());

    let output = trendwise()
        .args(["report", "--user", "U1", "--label", "catastrophic", "--data-dir"])
        .arg(tmp.path())
        .output()
        .expect("run trendwise");
    assert!(!output.status.success());
}

#[test]
fn config_file_overrides_threshold() {
    let tmp = tempdir().expect("temporary directory");
    common::write_sample_data(tmp.path());
    let config = tmp.path().join("trendwise.toml");
    fs::write(&config, "[rules]\nmedium_threshold = 2.0\n").unwrap();

    let output = trendwise()
        .args(["assess", "--user", "U2", "--trend", "Glow Serum", "--data-dir"])
        .arg(tmp.path())
        .arg("--config")
        .arg(&config)
        .output()
        .expect("run trendwise");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("High"));
}
