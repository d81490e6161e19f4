//! Command-line behavior of the traceopt binary

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const LOOP: &str = "[i0]\n\
                    i1 = int_add(i0, 1)\n\
                    i2 = int_lt(i1, 10)\n\
                    guard_true(i2) [i1]\n\
                    jump(i1)\n";

fn traceopt(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_traceopt"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn write(dir: &TempDir, name: &str, text: &str) -> String {
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path_str(&path)
}

fn path_str(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

mod optimize {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prints_each_trace() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "loop.trace", LOOP);
        let output = traceopt(&["optimize", &file]);
        assert_eq!(output.status.code(), Some(0));
        let text = stdout(&output);
        let headers: Vec<&str> = text.lines().filter(|l| l.starts_with("# ")).collect();
        assert_eq!(headers, vec!["# preamble", "# body", "# short preamble"]);
        assert!(text.contains("label("));
    }

    #[test]
    fn test_no_unroll_gives_one_trace() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "loop.trace", LOOP);
        let text = stdout(&traceopt(&["optimize", &file, "--no-unroll"]));
        let headers: Vec<&str> = text.lines().filter(|l| l.starts_with("# ")).collect();
        assert_eq!(headers, vec!["# trace"]);
    }

    #[test]
    fn test_json_output() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "add.trace", "[i0]\ni1 = int_add(i0, 0)\nfinish(i1)\n");
        let output = traceopt(&["optimize", &file, "--json"]);
        assert_eq!(output.status.code(), Some(0));
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(json["version"], traceopt::VERSION);
        assert_eq!(json["traces"][0]["name"], "trace");
        assert_eq!(json["stats"]["input_ops"], 2);
        assert_eq!(json["stats"]["emitted_ops"], 1);
    }

    #[test]
    fn test_config_file_applies() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "loop.trace", LOOP);
        let config = write(&dir, "config.json", r#"{"unroll": false, "passes": ["rewrite"]}"#);
        let text = stdout(&traceopt(&["optimize", &file, "--config", &config]));
        assert!(text.starts_with("# trace\n"));
    }

    #[test]
    fn test_parse_error_exits_with_two() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "bad.trace", "[i0]\ni1 = int_nonsense(i0)\nfinish(i1)\n");
        let output = traceopt(&["optimize", &file]);
        assert_eq!(output.status.code(), Some(2));
        let err = String::from_utf8_lossy(&output.stderr);
        assert!(err.contains("could not parse"), "{}", err);
    }

    #[test]
    fn test_missing_file_exits_with_two() {
        let dir = TempDir::new().unwrap();
        let missing = path_str(&dir.path().join("nope.trace"));
        assert_eq!(traceopt(&["optimize", &missing]).status.code(), Some(2));
    }

    #[test]
    fn test_unknown_pass_rejected() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "loop.trace", LOOP);
        let output = traceopt(&["optimize", &file, "--passes", "rewrite,frobnicate"]);
        assert_eq!(output.status.code(), Some(2));
    }
}

mod run {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_reports_match() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "loop.trace", LOOP);
        let output = traceopt(&["run", &file, "--args", "3", "--iterations", "20"]);
        assert_eq!(output.status.code(), Some(0));
        let text = stdout(&output);
        assert!(text.lines().any(|l| l == "match"), "{}", text);
        assert!(text.starts_with("unoptimized: "));
    }

    #[test]
    fn test_wrong_arity_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = write(&dir, "loop.trace", LOOP);
        let output = traceopt(&["run", &file, "--args", "3,4"]);
        assert_eq!(output.status.code(), Some(2));
    }
}

mod selfcheck {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_small_selfcheck_is_clean() {
        let output = traceopt(&["selfcheck", "--seed", "4", "--count", "10"]);
        assert_eq!(output.status.code(), Some(0));
        assert!(stdout(&output).starts_with("checked 10 traces"));
    }

    #[test]
    fn test_zero_count_rejected() {
        let output = traceopt(&["selfcheck", "--count", "0"]);
        assert_eq!(output.status.code(), Some(2));
    }
}
