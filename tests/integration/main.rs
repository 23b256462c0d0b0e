//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use serial_test::serial;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// A kiln invocation isolated from the user's state and config
    struct Sandbox {
        dir: TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn config_path(&self) -> PathBuf {
            self.path().join("config.toml")
        }

        fn kiln(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("kiln");
            cmd.current_dir(self.path())
                .env("KILN_STATE_DIR", self.path().join("state"))
                .env("KILN_CONFIG", self.config_path())
                .env("CI", "true")
                .env_remove("RUST_LOG");
            cmd
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path
        }
    }

    const VALID_GRAPH: &str = r#"{
        "roots": ["test"],
        "operations": [
            {"id": "base", "kind": "image", "reference": "docker.io/library/alpine:3.19"},
            {"id": "src", "kind": "literal", "contents": "echo ok"},
            {"id": "tree", "kind": "with_directory", "base": "base", "path": "/src/run.sh", "source": "src"},
            {"id": "test", "kind": "exec", "rootfs": "tree", "args": ["sh", "/src/run.sh"]}
        ]
    }"#;

    const CYCLIC_GRAPH: &str = r#"{
        "roots": ["a"],
        "operations": [
            {"id": "a", "kind": "exec", "rootfs": "b", "args": ["true"]},
            {"id": "b", "kind": "exec", "rootfs": "a", "args": ["true"]}
        ]
    }"#;

    #[test]
    fn help_displays() {
        Sandbox::new()
            .kiln()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("content-addressed"));
    }

    #[test]
    fn version_displays() {
        Sandbox::new()
            .kiln()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn validate_accepts_valid_graph() {
        let sandbox = Sandbox::new();
        let graph = sandbox.write("graph.json", VALID_GRAPH);
        sandbox
            .kiln()
            .arg("validate")
            .arg(&graph)
            .assert()
            .success()
            .stdout(predicate::str::contains("is valid"))
            .stdout(predicate::str::contains("4 operations"));
    }

    #[test]
    fn validate_rejects_cycle() {
        let sandbox = Sandbox::new();
        let graph = sandbox.write("graph.json", CYCLIC_GRAPH);
        sandbox
            .kiln()
            .arg("validate")
            .arg(&graph)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Dependency cycle detected"));
    }

    #[test]
    fn validate_rejects_unknown_format() {
        let sandbox = Sandbox::new();
        let graph = sandbox.write("graph.yaml", "roots: []");
        sandbox
            .kiln()
            .arg("validate")
            .arg(&graph)
            .assert()
            .failure()
            .stderr(predicate::str::contains(".json or .toml"));
    }

    #[test]
    fn run_rejects_unknown_root_before_runtime() {
        let sandbox = Sandbox::new();
        let graph = sandbox.write("graph.json", VALID_GRAPH);
        sandbox
            .kiln()
            .arg("run")
            .arg(&graph)
            .args(["--root", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown operation: missing"));
        assert!(!sandbox.path().join("state").exists());
    }

    #[test]
    #[serial]
    fn cache_stats_json_on_empty_state() {
        let sandbox = Sandbox::new();
        let output = sandbox
            .kiln()
            .args(["cache", "stats", "--format", "json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let stats: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(stats["entries"], 0);
        assert_eq!(stats["store_objects"], 0);
    }

    #[test]
    #[serial]
    fn cache_clear_empty() {
        Sandbox::new()
            .kiln()
            .args(["cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already empty"));
    }

    #[test]
    fn config_path() {
        let sandbox = Sandbox::new();
        sandbox
            .kiln()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        Sandbox::new()
            .kiln()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[cache]"));
    }

    #[test]
    fn config_init_then_set() {
        let sandbox = Sandbox::new();
        sandbox.kiln().args(["config", "init"]).assert().success();
        assert!(sandbox.config_path().exists());

        sandbox
            .kiln()
            .args(["config", "set", "cache.gc_days", "7"])
            .assert()
            .success();
        let written = std::fs::read_to_string(sandbox.config_path()).unwrap();
        assert!(written.contains("gc_days = 7"));
    }

    #[test]
    fn config_set_unknown_key() {
        Sandbox::new()
            .kiln()
            .args(["config", "set", "engine.colour", "blue"])
            .assert()
            .failure();
    }

    #[test]
    fn local_config_overrides_global() {
        let sandbox = Sandbox::new();
        sandbox.write(".kiln.toml", "[cache]\ngc_days = 2\n");
        sandbox
            .kiln()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gc_days = 2"));
        sandbox
            .kiln()
            .args(["--no-local", "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gc_days = 2").not());
    }

    #[test]
    #[serial]
    fn status_runs() {
        // The runtime may be missing on the test machine; status still reports
        Sandbox::new().kiln().arg("status").assert().success();
    }
}
