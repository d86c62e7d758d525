use anyhow::Context;
use boost_dispatch::{Config, Dispatcher, Value};
use serde_json::{json, Value as Json};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_owned());
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    // stdout carries the replies
    tracing_subscriber::fmt()
        .with_max_level(config.level()?)
        .with_writer(io::stderr)
        .init();
    info!("Starting boost dispatch runner");
    debug!(?config, "Config loaded");

    let mut dispatcher = Dispatcher::with_defaults(config.defaults.clone())?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut failures = 0;
    if config.scripts.is_empty() {
        debug!("Reading requests from stdin");
        failures += run_lines(&mut dispatcher, io::stdin().lock(), &mut out)?;
    } else {
        for path in script_paths(&config.scripts)? {
            info!(path = %path.display(), "Running script");
            let file = File::open(&path)
                .with_context(|| format!("failed to open script {}", path.display()))?;
            failures += run_lines(&mut dispatcher, BufReader::new(file), &mut out)?;
        }
    }

    info!(
        failures,
        live_models = dispatcher.registry().len(),
        "Runner finished"
    );
    Ok(())
}

fn script_paths(patterns: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let entries =
            glob::glob(pattern).with_context(|| format!("bad script pattern {pattern:?}"))?;
        for entry in entries {
            paths.push(entry?);
        }
    }
    Ok(paths)
}

/// A plain array is a call with no requested outputs; the object form
/// `{"call": [...], "nargout": n}` sets the output count explicitly.
fn parse_request(line: &str) -> anyhow::Result<(Vec<Value>, usize)> {
    let json: Json = serde_json::from_str(line).context("request is not valid JSON")?;
    let (call, nargout) = match &json {
        Json::Array(_) => (&json, 0),
        Json::Object(map) => {
            let call = map
                .get("call")
                .context("request object needs a \"call\" array")?;
            let nargout = match map.get("nargout") {
                Some(n) => n.as_u64().context("nargout must be a non-negative integer")?,
                None => 0,
            };
            (call, usize::try_from(nargout)?)
        }
        _ => anyhow::bail!("request must be an array or an object"),
    };
    let args = call
        .as_array()
        .context("\"call\" must be an array")?
        .iter()
        .map(Value::from_json)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((args, nargout))
}

/// Dispatches every request line of `input` and writes one reply line per
/// request. Blank lines and `#` comments are skipped. Returns the number of
/// failed requests.
#[instrument(skip_all)]
fn run_lines<R: BufRead, W: Write>(
    dispatcher: &mut Dispatcher,
    input: R,
    out: &mut W,
) -> anyhow::Result<usize> {
    let mut failures = 0;
    for (lineno, line) in input.lines().enumerate() {
        let line = line.context("failed to read request line")?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let result = parse_request(line)
            .and_then(|(args, nargout)| Ok(dispatcher.call(&args, nargout)?));
        let reply = match result {
            Ok(values) => json!({ "ok": values.iter().map(Value::to_json).collect::<Vec<_>>() }),
            Err(e) => {
                failures += 1;
                warn!(line = lineno + 1, error = %e, "Request failed");
                json!({ "error": format!("{e:#}") })
            }
        };
        writeln!(out, "{reply}")?;
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(script: &str) -> (Vec<Json>, usize) {
        let mut dispatcher = Dispatcher::new();
        let mut out = Vec::new();
        let failures = run_lines(&mut dispatcher, script.as_bytes(), &mut out).unwrap();
        let replies = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (replies, failures)
    }

    #[test]
    fn test_script_round() {
        let script = r#"
# build and query a model
[0, "new"]
[1, "set", "WeakCount", 5]
{"call": [1, "get", "WeakCount"], "nargout": 1}
{"call": [1, "train", [[0], [1], [2], [3], [4], [5]], {"int32": [[0], [0], [0], [1], [1], [1]]}, "Data", ["MinSampleCount", 1]], "nargout": 1}
"#;
        // MinSampleCount is not a data option
        let (replies, failures) = run(script);
        assert_eq!(replies.len(), 4);
        assert_eq!(failures, 1);
        assert_eq!(replies[0], json!({"ok": [1]}));
        assert_eq!(replies[1], json!({"ok": []}));
        assert_eq!(replies[2], json!({"ok": [5]}));
        assert!(replies[3]["error"].as_str().unwrap().contains("MinSampleCount"));
    }

    #[test]
    fn test_train_and_predict_script() {
        let script = r#"
[0, "new"]
[1, "set", "MinSampleCount", 1]
{"call": [1, "train", [[0], [1], [2], [3], [4], [5]], {"int32": [[0], [0], [0], [1], [1], [1]]}], "nargout": 1}
{"call": [1, "predict", [[0.5], [4.5]]], "nargout": 1}
"#;
        let (replies, failures) = run(script);
        assert_eq!(failures, 0);
        assert_eq!(replies[2], json!({"ok": [true]}));
        assert_eq!(replies[3], json!({"ok": [[[0.0], [1.0]]]}));
    }

    #[test]
    fn test_malformed_lines_are_reported() {
        let (replies, failures) = run("not json\n{\"nargout\": 1}\n\"new\"\n");
        assert_eq!(failures, 3);
        assert!(replies.iter().all(|r| r.get("error").is_some()));
    }
}
