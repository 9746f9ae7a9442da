use assert_cmd::Command;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn temp_workspace() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn dephy() -> Command {
    let mut cmd = Command::cargo_bin("dephy-ift").expect("binary exists");
    cmd.env_remove("MODEL_PATH")
        .env_remove("METRICS_PATH")
        .env_remove("DATABASE_URL")
        .env_remove("RUST_LOG");
    cmd
}

fn write_corpus(dir: &Path) {
    let mut lines = Vec::new();
    for i in 0..30 {
        let (soil, sequence, base) = match i % 3 {
            0 => ("Labour", "Blé tendre > Colza > Orge", 4.5),
            1 => ("Semis direct", "Maïs grain > Soja", 1.5),
            _ => ("TCS", "Blé tendre > Tournesol", 3.0),
        };
        lines.push(
            json!({
                "ift_histo_chimique_tot": base + f64::from(i % 4) * 0.1,
                "nb_cultures_rotation": 2 + i % 3,
                "recours_macroorganismes": if i % 2 == 0 { "Oui" } else { "Non" },
                "nbre_de_passages_desherbage_meca": i % 4,
                "type_de_travail_du_sol": soil,
                "sequence_cultures": sequence,
            })
            .to_string(),
        );
    }
    lines.push(json!({"ift_histo_chimique_tot": null, "nb_cultures_rotation": 2}).to_string());
    fs::write(dir.join("corpus.jsonl"), lines.join("\n")).expect("write corpus");
}

fn train(workspace: &Path) {
    dephy()
        .current_dir(workspace)
        .args([
            "--quiet",
            "train",
            "corpus.jsonl",
            "--schema",
            "rotation",
            "--n-trees",
            "25",
            "--no-progress",
            "--model-path",
            "out/model.json",
            "--metrics-path",
            "out/metrics.json",
        ])
        .assert()
        .success();
}

#[test]
fn train_info_predict_round_trip() {
    let workspace = temp_workspace();
    write_corpus(workspace.path());
    train(workspace.path());
    assert!(workspace.path().join("out/model.json").exists());
    assert!(workspace.path().join("out/metrics.json").exists());

    let info = dephy()
        .current_dir(workspace.path())
        .args([
            "--quiet",
            "info",
            "--json",
            "--model-path",
            "out/model.json",
            "--metrics-path",
            "out/metrics.json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let info: Value = serde_json::from_slice(&info).expect("info is JSON");
    assert_eq!(info["rows"], 30);
    assert_eq!(info["test_rows"], 6);
    assert_eq!(info["known_crops"], 6);
    assert_eq!(info["fingerprint"].as_str().map(str::len), Some(64));

    let request = json!({
        "nb_cultures_rotation": 3,
        "recours_macroorganismes": "Oui",
        "nbre_de_passages_desherbage_meca": 1,
        "type_de_travail_du_sol": "Labour",
        "sequence_cultures": "Blé tendre > Colza > Chanvre",
    });
    let predicted = dephy()
        .current_dir(workspace.path())
        .env("MODEL_PATH", "out/model.json")
        .env("METRICS_PATH", "out/metrics.json")
        .args(["--quiet", "predict", "--json", &request.to_string()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let predicted: Value = serde_json::from_slice(&predicted).expect("prediction is JSON");
    let value = predicted["ift_histo_chimique_tot"]
        .as_f64()
        .expect("numeric prediction");
    assert!(value.is_finite());
}

#[test]
fn predict_rejects_incomplete_request() {
    let workspace = temp_workspace();
    write_corpus(workspace.path());
    train(workspace.path());

    dephy()
        .current_dir(workspace.path())
        .env("MODEL_PATH", "out/model.json")
        .env("METRICS_PATH", "out/metrics.json")
        .args([
            "--quiet",
            "predict",
            "--json",
            r#"{"nb_cultures_rotation": 3, "sequence_cultures": "Blé tendre"}"#,
        ])
        .assert()
        .failure();
}

#[test]
fn predict_refuses_missing_artifacts() {
    let workspace = temp_workspace();
    dephy()
        .current_dir(workspace.path())
        .args([
            "--quiet",
            "predict",
            "--json",
            "{}",
            "--model-path",
            "missing.json",
            "--metrics-path",
            "missing.metrics.json",
        ])
        .assert()
        .failure();
}

#[test]
fn vocab_lists_sorted_tokens() {
    let workspace = temp_workspace();
    write_corpus(workspace.path());
    let output = dephy()
        .current_dir(workspace.path())
        .args(["--quiet", "vocab", "corpus.jsonl", "--schema", "rotation"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf-8");
    let tokens: Vec<&str> = text.lines().collect();
    assert_eq!(
        tokens,
        vec!["Blé tendre", "Colza", "Maïs grain", "Orge", "Soja", "Tournesol"]
    );
}

#[test]
fn training_on_null_targets_writes_nothing() {
    let workspace = temp_workspace();
    let lines = (0..5)
        .map(|i| {
            json!({
                "ift_histo_chimique_tot": null,
                "nb_cultures_rotation": i,
                "recours_macroorganismes": "Non",
                "nbre_de_passages_desherbage_meca": 0,
                "type_de_travail_du_sol": "Labour",
                "sequence_cultures": "Blé",
            })
            .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(workspace.path().join("corpus.jsonl"), lines).expect("write corpus");

    dephy()
        .current_dir(workspace.path())
        .args([
            "--quiet",
            "train",
            "corpus.jsonl",
            "--schema",
            "rotation",
            "--no-progress",
            "--model-path",
            "out/model.json",
            "--metrics-path",
            "out/metrics.json",
        ])
        .assert()
        .failure();
    assert!(!workspace.path().join("out").exists());
}
