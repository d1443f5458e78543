//! Integration tests for cacheprog

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn cacheprog(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("cacheprog");
        cmd.env_remove("RUST_LOG")
            .env_remove("CACHEPROG_DIR")
            .arg("--config")
            .arg(temp.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        cacheprog(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Tiered build-cache daemon"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        cacheprog(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("cacheprog"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        cacheprog(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_includes_overrides() {
        let temp = TempDir::new().unwrap();
        cacheprog(&temp)
            .args(["config", "show", "--dir", "/srv/build-cache", "--no-metrics"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("/srv/build-cache"))
            .stdout(predicate::str::contains("enabled = false"));
    }

    #[test]
    fn config_set_then_show() {
        let temp = TempDir::new().unwrap();
        cacheprog(&temp)
            .args(["config", "set", "remote.kind", "memory"])
            .assert()
            .success();
        cacheprog(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("kind = \"memory\""));
    }

    #[test]
    fn config_set_unknown_key_fails() {
        let temp = TempDir::new().unwrap();
        cacheprog(&temp)
            .args(["config", "set", "remote.colour", "blue"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown config key"));
    }

    #[test]
    fn invalid_config_file_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[remote]\nkind = \"redis\"\n").unwrap();
        cacheprog(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }
}

mod protocol_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use cacheprog::protocol::{encoding, Command as Verb, Request, Response};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn daemon(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("cacheprog");
        cmd.env_remove("RUST_LOG")
            .arg("--config")
            .arg(temp.path().join("config.toml"))
            .arg("--dir")
            .arg(temp.path().join("cache"));
        cmd
    }

    fn line(request: &Request) -> String {
        serde_json::to_string(request).unwrap() + "\n"
    }

    fn get(id: i64, action_id: &[u8]) -> String {
        line(&Request {
            id,
            command: Verb::Get,
            action_id: action_id.to_vec(),
            output_id: Vec::new(),
            body_size: 0,
        })
    }

    fn put(id: i64, action_id: &[u8], output_id: &[u8], body: &[u8]) -> String {
        let mut lines = line(&Request {
            id,
            command: Verb::Put,
            action_id: action_id.to_vec(),
            output_id: output_id.to_vec(),
            body_size: body.len() as i64,
        });
        if !body.is_empty() {
            lines.push_str(&encoding::encode_body_frame(body));
            lines.push('\n');
        }
        lines
    }

    fn close(id: i64) -> String {
        line(&Request {
            id,
            command: Verb::Close,
            action_id: Vec::new(),
            output_id: Vec::new(),
            body_size: 0,
        })
    }

    fn responses(stdout: &[u8]) -> Vec<Response> {
        String::from_utf8_lossy(stdout)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn serve(temp: &TempDir, input: String) -> Vec<Response> {
        let output = daemon(temp).write_stdin(input).assert().success();
        responses(&output.get_output().stdout)
    }

    fn by_id(responses: &[Response], id: i64) -> &Response {
        responses
            .iter()
            .find(|response| response.id == Some(id))
            .unwrap_or_else(|| panic!("no response for {}", id))
    }

    #[test]
    fn handshake_comes_first() {
        let temp = TempDir::new().unwrap();
        let responses = serve(&temp, close(1));

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], Response::handshake());
        assert_eq!(responses[1].id, Some(1));
    }

    #[test]
    fn entries_survive_restart() {
        let temp = TempDir::new().unwrap();
        let stored = serve(&temp, put(1, b"\x01\x02", b"out-1", b"compiled object") + &close(2));
        let disk_path = by_id(&stored, 1).disk_path.clone().unwrap();

        let fetched = serve(&temp, get(3, b"\x01\x02") + &get(4, b"\x09") + &close(5));
        let hit = by_id(&fetched, 3);
        assert!(!hit.miss);
        assert_eq!(hit.output_id, b"out-1");
        assert_eq!(hit.size, 15);
        assert_eq!(hit.disk_path.as_deref(), Some(disk_path.as_str()));
        assert_eq!(std::fs::read(&disk_path).unwrap(), b"compiled object");
        assert!(by_id(&fetched, 4).miss);
    }

    #[test]
    fn close_drains_all_puts() {
        let temp = TempDir::new().unwrap();
        let mut input = String::new();
        for i in 0..500i64 {
            let action = format!("action-{}", i);
            input.push_str(&put(i, action.as_bytes(), b"o", action.as_bytes()));
        }
        input.push_str(&close(1000));

        let stored = serve(&temp, input);
        assert_eq!(stored.len(), 502);
        assert_eq!(stored.last().unwrap().id, Some(1000));

        let mut input = String::new();
        for i in 0..500i64 {
            input.push_str(&get(i, format!("action-{}", i).as_bytes()));
        }
        input.push_str(&close(1000));

        let fetched = serve(&temp, input);
        let mut answered = HashSet::new();
        for response in &fetched[1..fetched.len() - 1] {
            assert!(!response.miss, "entry {:?} missing after restart", response.id);
            assert!(answered.insert(response.id.unwrap()));
        }
        assert_eq!(answered.len(), 500);
    }

    #[test]
    fn unknown_command_is_answered_with_error() {
        let temp = TempDir::new().unwrap();
        let input = "{\"ID\":1,\"Command\":\"stat\"}\n".to_string() + &close(2);
        let responses = serve(&temp, input);

        assert!(by_id(&responses, 1).err.is_some());
        assert!(by_id(&responses, 2).err.is_none());
    }

    #[test]
    fn end_of_input_without_close_exits_cleanly() {
        let temp = TempDir::new().unwrap();
        let responses = serve(&temp, put(1, b"a", b"o", b"body"));

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].id, Some(1));
    }

    #[test]
    fn malformed_input_exits_with_fatal_status() {
        let temp = TempDir::new().unwrap();
        daemon(&temp)
            .write_stdin("not json\n".to_string() + &close(1))
            .assert()
            .code(2)
            .stderr(predicates::str::contains("malformed request"));
    }

    #[test]
    fn truncated_body_exits_with_fatal_status() {
        let temp = TempDir::new().unwrap();
        let mut input = put(1, b"a", b"o", b"body");
        input.truncate(input.find('\n').unwrap() + 1);

        daemon(&temp).write_stdin(input).assert().code(2);
    }

    #[test]
    fn logs_never_reach_stdout() {
        let temp = TempDir::new().unwrap();
        let output = daemon(&temp)
            .arg("-vvv")
            .write_stdin(put(1, b"a", b"o", b"body") + &get(2, b"a") + &close(3))
            .assert()
            .success();

        let responses = responses(&output.get_output().stdout);
        assert_eq!(responses.len(), 4);
        assert!(!output.get_output().stderr.is_empty());
    }
}
