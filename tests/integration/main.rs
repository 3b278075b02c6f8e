//! Integration tests for blobmemo

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use serde_json::Value;
    use std::path::Path;
    use tempfile::TempDir;

    /// Command isolated from the user's config, state and cache directories
    fn blobmemo(home: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("blobmemo");
        cmd.env("HOME", home)
            .env("XDG_CONFIG_HOME", home.join("config"))
            .env("XDG_STATE_HOME", home.join("state"))
            .env("XDG_CACHE_HOME", home.join("cache"))
            .env("XDG_DATA_HOME", home.join("data"))
            .env_remove("RUST_LOG")
            .env_remove("BLOBMEMO_CONFIG")
            .env_remove("BLOBMEMO_STORE_ROOT");
        cmd
    }

    fn with_store(home: &Path) -> Command {
        let mut cmd = blobmemo(home);
        cmd.arg("--store-root").arg(home.join("store"));
        cmd
    }

    fn call_json(home: &Path, args: &[&str]) -> Value {
        let output = with_store(home)
            .arg("call")
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "call failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        blobmemo(home.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("memoization"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        blobmemo(home.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("blobmemo"));
    }

    #[test]
    fn config_path_follows_flag() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("custom.toml");
        blobmemo(home.path())
            .arg("--config")
            .arg(&path)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom.toml"));
    }

    #[test]
    fn config_init_then_show() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("config.toml");

        blobmemo(home.path())
            .arg("--config")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success();
        assert!(path.exists());

        blobmemo(home.path())
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[memo]"))
            .stdout(predicate::str::contains("[lock]"));
    }

    #[test]
    fn config_set_persists_and_rejects_bad_lease() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("config.toml");

        blobmemo(home.path())
            .arg("--config")
            .arg(&path)
            .args(["config", "set", "memo.pipeline_id", "nightly"])
            .assert()
            .success();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("nightly"));

        blobmemo(home.path())
            .arg("--config")
            .arg(&path)
            .args(["config", "set", "lock.acquire_margin_secs", "20"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid lock configuration"));
    }

    #[test]
    fn separate_processes_share_results() {
        let home = TempDir::new().unwrap();

        let first = call_json(home.path(), &["demo::square", "4"]);
        assert_eq!(first["source"], "computed");
        assert_eq!(first["value"], 16);

        let second = call_json(home.path(), &["demo::square", "4"]);
        assert_eq!(second["source"], "cached");
        assert_eq!(second["value"], 16);
        assert_eq!(second["address"], first["address"]);

        let other = call_json(home.path(), &["demo::square", "5"]);
        assert_eq!(other["source"], "computed");
        assert_eq!(other["value"], 25);
        assert_ne!(other["address"], first["address"]);
    }

    #[test]
    fn pipelines_do_not_share_results() {
        let home = TempDir::new().unwrap();

        let default = call_json(home.path(), &["demo::square", "3"]);
        let nightly = call_json(home.path(), &["demo::square", "3", "--pipeline", "nightly"]);
        assert_eq!(nightly["source"], "computed");
        assert_ne!(nightly["address"], default["address"]);
    }

    #[test]
    fn failures_are_replayed() {
        let home = TempDir::new().unwrap();

        for _ in 0..2 {
            with_store(home.path())
                .args(["call", "demo::divide", "1", "0"])
                .assert()
                .failure()
                .stdout(predicate::str::contains("ZeroDivision"))
                .stderr(predicate::str::contains("ZeroDivision"));
        }
    }

    #[test]
    fn unknown_function_fails() {
        let home = TempDir::new().unwrap();
        with_store(home.path())
            .args(["call", "demo::missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("demo::missing"));
    }

    #[test]
    fn subprocess_shim_computes() {
        let home = TempDir::new().unwrap();

        let first = call_json(home.path(), &["demo::square", "6", "--shim", "subprocess"]);
        assert_eq!(first["source"], "computed");
        assert_eq!(first["value"], 36);

        let second = call_json(home.path(), &["demo::square", "6"]);
        assert_eq!(second["source"], "cached");
    }

    #[test]
    fn subprocess_worker_uses_parent_config() {
        let home = TempDir::new().unwrap();
        let config = home.path().join("custom.toml");
        std::fs::write(&config, "[memo]\nroot = \"custom\"\n").unwrap();

        let output = with_store(home.path())
            .arg("--config")
            .arg(&config)
            .args(["call", "demo::sum_of_squares", "[1,2]", "--shim", "subprocess"])
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "call failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let called: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(called["value"], 5);
        assert!(called["address"].as_str().unwrap().starts_with("custom/"));

        // Nested squares were computed by the worker under the same root
        with_store(home.path())
            .arg("--config")
            .arg(&config)
            .args(["memo", "list", "custom/default"])
            .assert()
            .success()
            .stdout(predicate::str::contains("demo.square@v1"));

        let output = with_store(home.path())
            .arg("--config")
            .arg(&config)
            .args(["call", "demo::square", "2"])
            .output()
            .unwrap();
        let square: Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(square["source"], "cached");
    }

    #[test]
    fn locked_call_computes() {
        let home = TempDir::new().unwrap();
        let called = call_json(home.path(), &["demo::sum_of_squares", "[1,2,3]", "--lock"]);
        assert_eq!(called["value"], 14);
    }

    #[test]
    fn memo_inspect_invalidate_list() {
        let home = TempDir::new().unwrap();
        let called = call_json(home.path(), &["demo::square", "7"]);
        let address = called["address"].as_str().unwrap().to_string();

        with_store(home.path())
            .args(["memo", "inspect", &address, "--payload"])
            .assert()
            .success()
            .stdout(predicate::str::contains("invoked_at"))
            .stdout(predicate::str::contains("49"));

        with_store(home.path())
            .args(["memo", "list", "memo/default"])
            .assert()
            .success()
            .stdout(predicate::str::contains("demo.square@v1"));

        with_store(home.path())
            .args(["memo", "invalidate", &address])
            .assert()
            .success()
            .stdout(predicate::str::contains("Invalidated"));

        let again = call_json(home.path(), &["demo::square", "7"]);
        assert_eq!(again["source"], "computed");
    }

    #[test]
    fn memo_clear_negative_runs() {
        let home = TempDir::new().unwrap();
        with_store(home.path())
            .args(["memo", "clear-negative"])
            .assert()
            .success();
    }

    #[test]
    fn lock_stress_finds_no_overlap() {
        let home = TempDir::new().unwrap();
        let out = home.path().join("windows");

        with_store(home.path())
            .args([
                "lock",
                "stress",
                "-n",
                "3",
                "--duration-secs",
                "2",
                "--hold-ms",
                "20",
                "--expire-secs",
                "3",
                "--margin-secs",
                "0.2",
            ])
            .arg("--out")
            .arg(&out)
            .assert()
            .success();

        with_store(home.path())
            .arg("lock")
            .arg("verify")
            .arg(&out)
            .assert()
            .success()
            .stdout(predicate::str::contains("none overlapping"));

        with_store(home.path())
            .args(["lock", "show", "locks/stress"])
            .assert()
            .success()
            .stdout(predicate::str::contains("released at"));
    }

    #[test]
    fn lock_verify_reports_overlap() {
        let home = TempDir::new().unwrap();
        let dir = home.path().join("windows");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("worker-0.jsonl"),
            "{\"worker\":\"a\",\"acquired_at\":10.0,\"released_at\":12.0}\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("worker-1.jsonl"),
            "{\"worker\":\"b\",\"acquired_at\":11.0,\"released_at\":13.0}\n",
        )
        .unwrap();

        blobmemo(home.path())
            .arg("lock")
            .arg("verify")
            .arg(&dir)
            .assert()
            .failure()
            .stderr(predicate::str::contains("overlap"));
    }

    #[test]
    fn lock_show_missing() {
        let home = TempDir::new().unwrap();
        with_store(home.path())
            .args(["lock", "show", "locks/nothing"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No lock"));
    }
}
