//! API server endpoint and credential discovery.
//!
//! Resolution order used by [`ClusterEndpoint::infer`]: in-cluster service
//! account, then kubeconfig (`$KUBECONFIG`, else `~/.kube/config`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Result, SandboxError};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to reach the API server.
#[derive(Clone, Default)]
pub struct ClusterEndpoint {
	pub server: Option<Url>,
	pub token: Option<String>,
	/// PEM bundle of extra trust roots.
	pub ca_pem: Option<Vec<u8>>,
	/// PEM client certificate followed by its private key.
	pub identity_pem: Option<Vec<u8>>,
	pub insecure: bool,
	/// Namespace of the selected context, if any.
	pub namespace: Option<String>,
}

impl std::fmt::Debug for ClusterEndpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterEndpoint")
			.field("server", &self.server.as_ref().map(Url::as_str))
			.field("token", &self.token.as_ref().map(|_| "<redacted>"))
			.field("ca_pem", &self.ca_pem.is_some())
			.field("identity_pem", &self.identity_pem.is_some())
			.field("insecure", &self.insecure)
			.field("namespace", &self.namespace)
			.finish()
	}
}

impl ClusterEndpoint {
	/// Endpoint for an explicit server URL, without credentials.
	pub fn new(server: &str) -> Result<Self> {
		let server = Url::parse(server).map_err(|err| SandboxError::Config(format!("invalid API server url '{server}': {err}")))?;
		Ok(Self {
			server: Some(server),
			..Self::default()
		})
	}

	pub fn with_token(mut self, token: impl Into<String>) -> Self {
		self.token = Some(token.into());
		self
	}

	pub fn with_ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
		self.ca_pem = Some(pem.into());
		self
	}

	pub fn with_insecure(mut self, insecure: bool) -> Self {
		self.insecure = insecure;
		self
	}

	pub fn server(&self) -> Result<&Url> {
		self.server.as_ref().ok_or_else(|| SandboxError::Config("no API server configured".into()))
	}

	/// Tries in-cluster credentials, then the kubeconfig file.
	pub async fn infer() -> Result<Self> {
		if let Some(endpoint) = Self::in_cluster()? {
			debug!(target = "sbx.claim", "using in-cluster service account");
			return Ok(endpoint);
		}
		let path = kubeconfig_path().ok_or_else(|| SandboxError::Config("no kubeconfig found and not running in a cluster".into()))?;
		Self::from_kubeconfig(&path, None).await
	}

	/// Service-account credentials, or `None` outside a pod.
	pub fn in_cluster() -> Result<Option<Self>> {
		let (Ok(host), Ok(port)) = (std::env::var("KUBERNETES_SERVICE_HOST"), std::env::var("KUBERNETES_SERVICE_PORT")) else {
			return Ok(None);
		};
		in_cluster_from(&host, &port, Path::new(SERVICE_ACCOUNT_DIR)).map(Some)
	}

	/// Loads `context` (or the current context) from the kubeconfig at `path`.
	pub async fn from_kubeconfig(path: &Path, context: Option<&str>) -> Result<Self> {
		let raw = tokio::fs::read_to_string(path)
			.await
			.map_err(|err| SandboxError::Config(format!("cannot read kubeconfig {}: {err}", path.display())))?;
		let config: Kubeconfig =
			serde_yaml::from_str(&raw).map_err(|err| SandboxError::Config(format!("invalid kubeconfig {}: {err}", path.display())))?;
		let base = path.parent().unwrap_or_else(|| Path::new("."));
		config.resolve(context, base).await
	}

	pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
		let mut builder = reqwest::Client::builder().use_rustls_tls().connect_timeout(API_CONNECT_TIMEOUT);
		if let Some(pem) = &self.ca_pem {
			for cert in reqwest::Certificate::from_pem_bundle(pem)? {
				builder = builder.add_root_certificate(cert);
			}
		}
		if let Some(pem) = &self.identity_pem {
			builder = builder.identity(reqwest::Identity::from_pem(pem)?);
		}
		if self.insecure {
			builder = builder.danger_accept_invalid_certs(true);
		}
		Ok(builder.build()?)
	}
}

/// First existing path in `$KUBECONFIG`, else `~/.kube/config` if present.
pub fn kubeconfig_path() -> Option<PathBuf> {
	if let Some(paths) = std::env::var_os("KUBECONFIG") {
		if let Some(found) = std::env::split_paths(&paths).find(|p| p.is_file()) {
			return Some(found);
		}
	}
	let default = dirs::home_dir()?.join(".kube").join("config");
	default.is_file().then_some(default)
}

fn in_cluster_from(host: &str, port: &str, dir: &Path) -> Result<ClusterEndpoint> {
	let host = if host.contains(':') { format!("[{host}]") } else { host.to_string() };
	let mut endpoint = ClusterEndpoint::new(&format!("https://{host}:{port}"))?;
	let token = std::fs::read_to_string(dir.join("token"))?;
	endpoint.token = Some(token.trim().to_string());
	endpoint.ca_pem = std::fs::read(dir.join("ca.crt")).ok();
	endpoint.namespace = std::fs::read_to_string(dir.join("namespace")).ok().map(|ns| ns.trim().to_string());
	Ok(endpoint)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
	#[serde(default)]
	clusters: Vec<Named<ClusterEntry>>,
	#[serde(default)]
	contexts: Vec<Named<ContextEntry>>,
	#[serde(default)]
	users: Vec<Named<UserEntry>>,
	#[serde(default)]
	current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
	name: String,
	#[serde(alias = "cluster", alias = "context", alias = "user")]
	value: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
	server: String,
	#[serde(default)]
	certificate_authority: Option<String>,
	#[serde(default)]
	certificate_authority_data: Option<String>,
	#[serde(default)]
	insecure_skip_tls_verify: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ContextEntry {
	cluster: String,
	#[serde(default)]
	user: Option<String>,
	#[serde(default)]
	namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
	#[serde(default)]
	token: Option<String>,
	#[serde(default, rename = "tokenFile")]
	token_file: Option<String>,
	#[serde(default)]
	client_certificate: Option<String>,
	#[serde(default)]
	client_certificate_data: Option<String>,
	#[serde(default)]
	client_key: Option<String>,
	#[serde(default)]
	client_key_data: Option<String>,
	#[serde(default)]
	exec: Option<ExecConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecConfig {
	command: String,
	#[serde(default)]
	args: Vec<String>,
	#[serde(default)]
	env: Option<Vec<ExecEnv>>,
}

#[derive(Debug, Deserialize)]
struct ExecEnv {
	name: String,
	value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredential {
	#[serde(default)]
	status: ExecCredentialStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
	#[serde(default)]
	token: Option<String>,
	#[serde(default)]
	client_certificate_data: Option<String>,
	#[serde(default)]
	client_key_data: Option<String>,
}

impl Kubeconfig {
	async fn resolve(&self, context: Option<&str>, base: &Path) -> Result<ClusterEndpoint> {
		let context_name = context
			.map(str::to_string)
			.or_else(|| self.current_context.clone())
			.or_else(|| self.contexts.first().map(|c| c.name.clone()))
			.ok_or_else(|| SandboxError::Config("kubeconfig has no contexts".into()))?;
		let context = find(&self.contexts, &context_name, "context")?;
		let cluster = find(&self.clusters, &context.cluster, "cluster")?;

		let mut endpoint = ClusterEndpoint::new(&cluster.server)?;
		endpoint.insecure = cluster.insecure_skip_tls_verify;
		endpoint.namespace = context.namespace.clone();
		endpoint.ca_pem = load_material(cluster.certificate_authority_data.as_deref(), cluster.certificate_authority.as_deref(), base)?;

		let Some(user_name) = context.user.as_deref() else {
			return Ok(endpoint);
		};
		let user = find(&self.users, user_name, "user")?;
		endpoint.token = match (&user.token, &user.token_file) {
			(Some(token), _) => Some(token.clone()),
			(None, Some(file)) => Some(std::fs::read_to_string(resolve_path(base, file))?.trim().to_string()),
			(None, None) => None,
		};

		let cert = load_material(user.client_certificate_data.as_deref(), user.client_certificate.as_deref(), base)?;
		let key = load_material(user.client_key_data.as_deref(), user.client_key.as_deref(), base)?;
		endpoint.identity_pem = join_identity(cert, key);

		if let Some(exec) = &user.exec {
			let credential = run_exec_plugin(exec).await?;
			if let Some(token) = credential.status.token {
				endpoint.token = Some(token);
			}
			let cert = credential.status.client_certificate_data.map(String::into_bytes);
			let key = credential.status.client_key_data.map(String::into_bytes);
			if let Some(identity) = join_identity(cert, key) {
				endpoint.identity_pem = Some(identity);
			}
		}
		Ok(endpoint)
	}
}

fn find<'a, T>(entries: &'a [Named<T>], name: &str, kind: &str) -> Result<&'a T> {
	entries
		.iter()
		.find(|entry| entry.name == name)
		.map(|entry| &entry.value)
		.ok_or_else(|| SandboxError::Config(format!("kubeconfig {kind} '{name}' not found")))
}

fn resolve_path(base: &Path, path: &str) -> PathBuf {
	let path = Path::new(path);
	if path.is_absolute() { path.to_path_buf() } else { base.join(path) }
}

/// Inline base64 data wins over a file reference.
fn load_material(data: Option<&str>, file: Option<&str>, base: &Path) -> Result<Option<Vec<u8>>> {
	if let Some(data) = data {
		let decoded = STANDARD
			.decode(data.trim())
			.map_err(|err| SandboxError::Config(format!("invalid base64 in kubeconfig: {err}")))?;
		return Ok(Some(decoded));
	}
	match file {
		Some(file) => Ok(Some(std::fs::read(resolve_path(base, file))?)),
		None => Ok(None),
	}
}

fn join_identity(cert: Option<Vec<u8>>, key: Option<Vec<u8>>) -> Option<Vec<u8>> {
	let (mut cert, key) = (cert?, key?);
	if !cert.ends_with(b"\n") {
		cert.push(b'\n');
	}
	cert.extend_from_slice(&key);
	Some(cert)
}

async fn run_exec_plugin(exec: &ExecConfig) -> Result<ExecCredential> {
	let env: BTreeMap<&str, &str> = exec.env.iter().flatten().map(|e| (e.name.as_str(), e.value.as_str())).collect();
	let output = tokio::process::Command::new(&exec.command)
		.args(&exec.args)
		.envs(env)
		.stdin(std::process::Stdio::null())
		.output()
		.await
		.map_err(|source| SandboxError::Spawn {
			program: exec.command.clone(),
			source,
		})?;
	if !output.status.success() {
		return Err(SandboxError::Config(format!(
			"credential plugin '{}' failed ({}): {}",
			exec.command,
			output.status,
			String::from_utf8_lossy(&output.stderr).trim()
		)));
	}
	serde_json::from_slice(&output.stdout)
		.map_err(|err| SandboxError::Config(format!("credential plugin '{}' returned invalid output: {err}", exec.command)))
}
