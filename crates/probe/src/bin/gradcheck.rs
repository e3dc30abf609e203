use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Parser;
use probe::{DeterminismCheck, ProbeConfig, ProbeError};
use serde_json::{Number, Value};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("gradient check failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Gradient determinism and sensitivity check", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to probe config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, value_name = "DEVICE", help = "Device to run on (cpu, cuda, cuda:N, metal)")]
    device: Option<String>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), ProbeError> {
    let args = Args::parse();

    let mut config = ProbeConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        let base_dir = args.config.parent().unwrap_or_else(|| Path::new("."));
        config = apply_overrides(config, &args.overrides, base_dir)?;
    }
    if let Some(device) = args.device {
        config.runtime.device = device;
    }

    config.validate()?;

    let mut check = DeterminismCheck::new(config)?;
    let report = check.run()?;
    println!(
        "gradient check passed: {} parameters, {} snapshots on {}",
        report.parameter_count,
        report.snapshots.len(),
        report.device
    );
    Ok(())
}

/// Applies `overrides` and resolves relative paths they introduce against
/// `base_dir`, like the paths read from the config file itself.
fn apply_overrides(
    config: ProbeConfig,
    overrides: &[OverrideArg],
    base_dir: &Path,
) -> Result<ProbeConfig, ProbeError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        ProbeError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        let segments = parse_path(&override_arg.path)?;
        assign_at_path(&mut value, &segments, new_value)?;
    }

    let mut config: ProbeConfig = serde_json::from_value(value).map_err(|err| {
        ProbeError::ConfigFormat(format!("invalid config after overrides: {err}"))
    })?;
    config.apply_base_path(base_dir);
    Ok(config)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, ProbeError> {
    path.split('.')
        .map(|segment| {
            let (key, index) = match segment.split_once('[') {
                Some((base, idx_part)) => {
                    let index = idx_part
                        .trim_end_matches(']')
                        .parse::<usize>()
                        .map_err(|err| {
                            ProbeError::ConfigFormat(format!(
                                "invalid index in override path '{}': {}",
                                segment, err
                            ))
                        })?;
                    (base, Some(index))
                }
                None => (segment, None),
            };
            if key.is_empty() {
                return Err(ProbeError::ConfigFormat(format!(
                    "empty segment in override path '{}'",
                    path
                )));
            }
            Ok(PathSegment {
                key: key.to_string(),
                index,
            })
        })
        .collect()
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), ProbeError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(serde_json::Map::new());
    }
    let map = target.as_object_mut().ok_or_else(|| {
        ProbeError::ConfigFormat(format!(
            "override path segment '{}' points into a non-object value",
            segment.key
        ))
    })?;
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    let Some(array_index) = segment.index else {
        return assign_at_path(entry, rest, new_value);
    };

    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    let array = entry.as_array_mut().ok_or_else(|| {
        ProbeError::ConfigFormat(format!(
            "override path segment '{}' expects an array value",
            segment.key
        ))
    })?;
    while array.len() <= array_index {
        array.push(Value::Null);
    }
    assign_at_path(&mut array[array_index], rest, new_value)
}
