//! Binary-level behavior that needs no cluster: argument parsing, config
//! validation, and failures reported before or during claim creation.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

fn sbx_binary() -> PathBuf {
	let mut path = std::env::current_exe().expect("current_exe should resolve");
	path.pop();
	path.pop();
	path.push("sbx");
	path
}

fn run_sbx(args: &[&str]) -> (Option<i32>, String, String) {
	let output = Command::new(sbx_binary())
		.args(args)
		.env_remove("RUST_LOG")
		.env_remove("KUBECONFIG")
		.output()
		.expect("Failed to execute sbx");
	(
		output.status.code(),
		String::from_utf8_lossy(&output.stdout).to_string(),
		String::from_utf8_lossy(&output.stderr).to_string(),
	)
}

#[test]
fn help_lists_every_command() {
	let (code, stdout, _) = run_sbx(&["--help"]);
	assert_eq!(code, Some(0));
	for command in ["run", "write", "read", "ls", "exists"] {
		assert!(stdout.contains(command), "missing {command} in help:\n{stdout}");
	}
}

#[test]
fn missing_template_fails_before_contacting_cluster() {
	let (code, stdout, stderr) = run_sbx(&["exists", "/tmp"]);
	assert_eq!(code, Some(1));
	assert!(stdout.is_empty(), "unexpected stdout: {stdout}");
	assert!(stderr.contains("template must not be empty"), "stderr: {stderr}");
}

#[test]
fn unreadable_config_file_is_reported() {
	let dir = tempfile::tempdir().unwrap();
	let missing = dir.path().join("absent.json");
	let (code, _, stderr) = run_sbx(&["--config", &missing.to_string_lossy(), "ls", "/"]);
	assert_eq!(code, Some(1));
	assert!(stderr.contains("invalid session config"), "stderr: {stderr}");
}

#[test]
fn malformed_config_file_is_reported() {
	let mut file = tempfile::NamedTempFile::new().unwrap();
	write!(file, "{{ not json").unwrap();
	let (code, _, stderr) = run_sbx(&["--config", &file.path().to_string_lossy(), "ls", "/"]);
	assert_eq!(code, Some(1));
	assert!(stderr.contains("invalid session config"), "stderr: {stderr}");
}

#[test]
fn usage_errors_exit_with_clap_status() {
	let (code, _, stderr) = run_sbx(&["-t", "tpl", "--context", "kind", "ls", "/"]);
	assert_eq!(code, Some(2));
	assert!(stderr.contains("--kubeconfig"), "stderr: {stderr}");
}

#[test]
fn unreachable_api_server_fails_the_command() {
	let closed = {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		listener.local_addr().unwrap().port()
	};
	let dir = tempfile::tempdir().unwrap();
	let kubeconfig = dir.path().join("config");
	std::fs::write(
		&kubeconfig,
		format!(
			"apiVersion: v1\nkind: Config\ncurrent-context: local\nclusters:\n- name: local\n  cluster:\n    server: http://127.0.0.1:{closed}\ncontexts:\n- name: local\n  context:\n    cluster: local\n    user: dev\nusers:\n- name: dev\n  user:\n    token: abc\n"
		),
	)
	.unwrap();

	let (code, stdout, stderr) = run_sbx(&[
		"--kubeconfig",
		&kubeconfig.to_string_lossy(),
		"-t",
		"python-runtime",
		"--api-url",
		"http://127.0.0.1:9",
		"run",
		"echo",
		"hi",
	]);
	assert_eq!(code, Some(1));
	assert!(stdout.is_empty(), "unexpected stdout: {stdout}");
	assert!(stderr.contains("command failed"), "stderr: {stderr}");
}
