use std::fs;
use std::path::Path;

use probe::{DeterminismCheck, ProbeConfig, ProbeError};
use tempfile::TempDir;

const CORPUS: &str = "\
the quick brown fox jumps over the lazy dog
gradients should not depend on what ran before
a completely different sentence about tensors and tokens
short line
";

fn write_workspace(extra_runtime: &str) -> Result<(TempDir, ProbeConfig), ProbeError> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("corpus.txt"), CORPUS)?;
    let config = format!(
        r#"
[model]
block_size = 32
n_embd = 16
n_head = 2
n_layer = 1

[tokenizer]
train_vocab_size = 300
min_frequency = 1
save_to = "tokenizer.json"

[data]
shards = ["corpus.txt"]
batch_size = 1
max_length = 32

[runtime]
seed = 11
{extra_runtime}

[logging]
enable_stdout = false
tensorboard_dir = "tb"
report_path = "out/report.json"
"#
    );
    let path = dir.path().join("probe.toml");
    fs::write(&path, config)?;
    let config = ProbeConfig::load(&path)?;
    Ok((dir, config))
}

fn has_event_file(dir: &Path) -> Result<bool, ProbeError> {
    Ok(fs::read_dir(dir)?.any(|entry| {
        entry
            .map(|entry| entry.file_name().to_string_lossy().starts_with("events.out.tfevents"))
            .unwrap_or(false)
    }))
}

#[test]
fn full_check_passes_and_writes_artifacts() -> Result<(), ProbeError> {
    let (dir, config) = write_workspace("")?;
    let mut check = DeterminismCheck::new(config)?;
    assert_eq!(check.batches().len(), 4);
    assert_eq!(
        check.model().config().vocab_size,
        check.tokenizer().get_vocab_size(true)
    );

    let report = check.run()?;

    assert!(report.passed);
    assert!(report.inputs_differ);
    assert!(report.frozen.is_empty());
    assert_eq!(report.device, "cpu");
    assert_eq!(report.snapshots.len(), 3);
    let parameters = check.model().parameter_names().len();
    assert!(report.snapshots.iter().all(|s| s.parameters == parameters));
    assert_eq!(report.snapshots[0].l2_norm, report.snapshots[2].l2_norm);
    assert_ne!(report.snapshots[0].l2_norm, report.snapshots[1].l2_norm);
    assert_eq!(report.comparisons[0].equal.len(), parameters);
    assert_eq!(report.comparisons[1].different.len(), parameters);
    let accumulation = report.accumulation.as_ref().expect("accumulation enabled");
    assert!(accumulation.reset_restores_baseline);

    assert!(dir.path().join("tokenizer.json").exists());
    assert!(has_event_file(&dir.path().join("tb"))?);
    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("out/report.json"))?)?;
    assert_eq!(written["passed"], serde_json::Value::Bool(true));
    Ok(())
}

#[test]
fn frozen_parameters_are_left_out_of_snapshots() -> Result<(), ProbeError> {
    let (_dir, config) = write_workspace(r#"freeze = ["wpe"]"#)?;
    let mut check = DeterminismCheck::new(config)?;

    let report = check.run()?;

    assert_eq!(report.frozen, vec!["wpe.weight".to_string()]);
    let parameters = check.model().parameter_names().len();
    assert!(report
        .snapshots
        .iter()
        .all(|s| s.parameters == parameters - 1));
    assert!(report.comparisons[0]
        .equal
        .iter()
        .all(|name| name != "wpe.weight"));
    Ok(())
}

#[test]
fn saved_tokenizer_can_be_reloaded() -> Result<(), ProbeError> {
    let (dir, config) = write_workspace("check_accumulation = false")?;
    let first = DeterminismCheck::new(config.clone())?;
    let vocab = first.tokenizer().get_vocab_size(true);

    let mut reloaded = config;
    reloaded.tokenizer.train_vocab_size = None;
    reloaded.tokenizer.save_to = None;
    reloaded.tokenizer.tokenizer_json = Some(dir.path().join("tokenizer.json"));
    let mut second = DeterminismCheck::new(reloaded)?;

    assert_eq!(second.tokenizer().get_vocab_size(true), vocab);
    let report = second.run()?;
    assert!(report.accumulation.is_none());
    Ok(())
}

#[test]
fn sample_indices_beyond_the_corpus_are_rejected() -> Result<(), ProbeError> {
    let (_dir, config) = write_workspace("sample_indices = [0, 9]")?;
    match DeterminismCheck::new(config) {
        Err(ProbeError::Initialization(message)) => {
            assert!(message.contains("sample_indices"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("check should not initialize"),
    }
    Ok(())
}

#[test]
fn unknown_freeze_prefix_is_rejected() -> Result<(), ProbeError> {
    let (_dir, config) = write_workspace(r#"freeze = ["decoder"]"#)?;
    assert!(matches!(
        DeterminismCheck::new(config),
        Err(ProbeError::Initialization(_))
    ));
    Ok(())
}

#[test]
fn identical_samples_fail_validation() -> Result<(), ProbeError> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("corpus.txt"), CORPUS)?;
    let path = dir.path().join("probe.toml");
    fs::write(
        &path,
        r#"
[tokenizer]
train_vocab_size = 300

[data]
shards = ["corpus.txt"]

[runtime]
sample_indices = [1, 1]
"#,
    )?;
    assert!(matches!(
        ProbeConfig::load(&path),
        Err(ProbeError::Validation(_))
    ));
    Ok(())
}
