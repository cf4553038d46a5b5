//! Injectable span recording for session operations.
//!
//! Sessions never touch a global tracing provider; they report spans to the
//! [`Recorder`] they were built with. [`NoopRecorder`] is the default.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;

/// Opaque handle to a started span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
	Str(String),
	Int(i64),
	Bool(bool),
}

impl fmt::Display for AttributeValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AttributeValue::Str(v) => f.write_str(v),
			AttributeValue::Int(v) => write!(f, "{v}"),
			AttributeValue::Bool(v) => write!(f, "{v}"),
		}
	}
}

impl From<&str> for AttributeValue {
	fn from(value: &str) -> Self {
		AttributeValue::Str(value.to_string())
	}
}

impl From<String> for AttributeValue {
	fn from(value: String) -> Self {
		AttributeValue::Str(value)
	}
}

impl From<i64> for AttributeValue {
	fn from(value: i64) -> Self {
		AttributeValue::Int(value)
	}
}

impl From<i32> for AttributeValue {
	fn from(value: i32) -> Self {
		AttributeValue::Int(value.into())
	}
}

impl From<usize> for AttributeValue {
	fn from(value: usize) -> Self {
		AttributeValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
	}
}

impl From<bool> for AttributeValue {
	fn from(value: bool) -> Self {
		AttributeValue::Bool(value)
	}
}

/// Span sink used by sessions.
pub trait Recorder: Send + Sync {
	fn start(&self, name: &str, parent: Option<SpanId>) -> SpanId;

	fn attribute(&self, span: SpanId, key: &str, value: AttributeValue);

	fn end(&self, span: SpanId);

	/// Serialized context to hand to the control plane so server-side work
	/// joins this trace. `None` when the recorder does not propagate.
	fn propagation_context(&self, _span: SpanId) -> Option<String> {
		None
	}

	/// Flushes anything buffered.
	fn shutdown(&self) {}
}

/// Scope guard that ends its span when dropped.
pub struct ActiveSpan<'a> {
	recorder: &'a dyn Recorder,
	id: SpanId,
}

impl<'a> ActiveSpan<'a> {
	pub fn start(recorder: &'a dyn Recorder, name: &str, parent: Option<SpanId>) -> Self {
		let id = recorder.start(name, parent);
		Self { recorder, id }
	}

	pub fn id(&self) -> SpanId {
		self.id
	}

	pub fn set(&self, key: &str, value: impl Into<AttributeValue>) {
		self.recorder.attribute(self.id, key, value.into());
	}
}

impl Drop for ActiveSpan<'_> {
	fn drop(&mut self) {
		self.recorder.end(self.id);
	}
}

fn next_span_id() -> SpanId {
	static NEXT: AtomicU64 = AtomicU64::new(1);
	SpanId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
	fn start(&self, _name: &str, _parent: Option<SpanId>) -> SpanId {
		SpanId(0)
	}

	fn attribute(&self, _span: SpanId, _key: &str, _value: AttributeValue) {}

	fn end(&self, _span: SpanId) {}
}

struct LiveSpan {
	name: String,
	trace_id: String,
	span_hex: String,
	started: Instant,
	attributes: Vec<(String, AttributeValue)>,
}

/// Emits span boundaries as `tracing` events and propagates a W3C
/// `traceparent` so claims can be correlated with client logs.
#[derive(Default)]
pub struct TracingRecorder {
	live: Mutex<HashMap<SpanId, LiveSpan>>,
}

impl TracingRecorder {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Recorder for TracingRecorder {
	fn start(&self, name: &str, parent: Option<SpanId>) -> SpanId {
		let id = next_span_id();
		let mut live = self.live.lock();
		let trace_id = parent
			.and_then(|p| live.get(&p))
			.map(|p| p.trace_id.clone())
			.unwrap_or_else(|| random_hex(16));
		debug!(target = "sbx.session", span = name, span_id = id.0, trace_id = %trace_id, "span started");
		live.insert(
			id,
			LiveSpan {
				name: name.to_string(),
				trace_id,
				span_hex: random_hex(8),
				started: Instant::now(),
				attributes: Vec::new(),
			},
		);
		id
	}

	fn attribute(&self, span: SpanId, key: &str, value: AttributeValue) {
		if let Some(live) = self.live.lock().get_mut(&span) {
			live.attributes.push((key.to_string(), value));
		}
	}

	fn end(&self, span: SpanId) {
		let Some(live) = self.live.lock().remove(&span) else {
			return;
		};
		let attributes = live
			.attributes
			.iter()
			.map(|(k, v)| format!("{k}={v}"))
			.collect::<Vec<_>>()
			.join(" ");
		debug!(
			target = "sbx.session",
			span = %live.name,
			span_id = span.0,
			trace_id = %live.trace_id,
			elapsed_ms = live.started.elapsed().as_millis() as u64,
			attributes = %attributes,
			"span ended"
		);
	}

	fn propagation_context(&self, span: SpanId) -> Option<String> {
		let live = self.live.lock();
		let live = live.get(&span)?;
		let traceparent = format!("00-{}-{}-01", live.trace_id, live.span_hex);
		Some(serde_json::json!({ "traceparent": traceparent }).to_string())
	}
}

fn random_hex(len: usize) -> String {
	let mut bytes = vec![0u8; len];
	if getrandom::fill(&mut bytes).is_err() {
		let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or_default();
		for (i, byte) in bytes.iter_mut().enumerate() {
			*byte = (nanos >> ((i % 16) * 8)) as u8;
		}
	}
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A span captured by [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpan {
	pub id: SpanId,
	pub name: String,
	pub parent: Option<SpanId>,
	pub attributes: Vec<(String, AttributeValue)>,
	pub ended: bool,
}

impl RecordedSpan {
	pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
		self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v)
	}
}

/// Keeps every span in memory for assertions.
#[derive(Default)]
pub struct MemoryRecorder {
	spans: Mutex<Vec<RecordedSpan>>,
	propagation: Option<String>,
	shutdowns: AtomicUsize,
}

impl MemoryRecorder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes [`Recorder::propagation_context`] return `context` for every span.
	pub fn with_propagation(mut self, context: impl Into<String>) -> Self {
		self.propagation = Some(context.into());
		self
	}

	pub fn spans(&self) -> Vec<RecordedSpan> {
		self.spans.lock().clone()
	}

	/// Most recent span named `name`.
	pub fn span(&self, name: &str) -> Option<RecordedSpan> {
		self.spans.lock().iter().rev().find(|s| s.name == name).cloned()
	}

	/// Number of [`Recorder::shutdown`] calls seen.
	pub fn shutdowns(&self) -> usize {
		self.shutdowns.load(Ordering::SeqCst)
	}
}

impl Recorder for MemoryRecorder {
	fn start(&self, name: &str, parent: Option<SpanId>) -> SpanId {
		let id = next_span_id();
		self.spans.lock().push(RecordedSpan {
			id,
			name: name.to_string(),
			parent,
			attributes: Vec::new(),
			ended: false,
		});
		id
	}

	fn attribute(&self, span: SpanId, key: &str, value: AttributeValue) {
		if let Some(recorded) = self.spans.lock().iter_mut().find(|s| s.id == span) {
			recorded.attributes.push((key.to_string(), value));
		}
	}

	fn end(&self, span: SpanId) {
		if let Some(recorded) = self.spans.lock().iter_mut().find(|s| s.id == span) {
			recorded.ended = true;
		}
	}

	fn propagation_context(&self, _span: SpanId) -> Option<String> {
		self.propagation.clone()
	}

	fn shutdown(&self) {
		self.shutdowns.fetch_add(1, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn active_span_ends_on_drop() {
		let recorder = MemoryRecorder::new();
		{
			let span = ActiveSpan::start(&recorder, "sandbox-client.run", None);
			span.set("sandbox.command", "echo hi");
			span.set("sandbox.exit_code", 0);
		}
		let span = recorder.span("sandbox-client.run").unwrap();
		assert!(span.ended);
		assert_eq!(span.attribute("sandbox.command"), Some(&AttributeValue::Str("echo hi".into())));
		assert_eq!(span.attribute("sandbox.exit_code"), Some(&AttributeValue::Int(0)));
	}

	#[test]
	fn tracing_recorder_children_share_trace_id() {
		let recorder = TracingRecorder::new();
		let root = recorder.start("sandbox-client.lifecycle", None);
		let child = recorder.start("sandbox-client.create_claim", Some(root));

		let parse = |span| {
			let raw = recorder.propagation_context(span).unwrap();
			let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
			value["traceparent"].as_str().unwrap().to_string()
		};
		let root_parent = parse(root);
		let child_parent = parse(child);
		let parts: Vec<&str> = root_parent.split('-').collect();
		assert_eq!(parts.len(), 4);
		assert_eq!(parts[1].len(), 32);
		assert_eq!(parts[2].len(), 16);
		assert_eq!(root_parent.split('-').nth(1), child_parent.split('-').nth(1));

		recorder.end(child);
		recorder.end(root);
		assert!(recorder.propagation_context(root).is_none());
	}

	#[test]
	fn noop_recorder_propagates_nothing() {
		let recorder = NoopRecorder;
		let span = recorder.start("x", None);
		assert!(recorder.propagation_context(span).is_none());
	}
}
