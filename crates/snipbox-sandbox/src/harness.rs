//! Worker protocol and the Python subprocess backend
//!
//! The executor hands a worker one JSON job on stdin and reads everything
//! back from stdout. Snippet output streams through unchanged; the worker
//! appends a single envelope line prefixed with a per-run marker (random
//! UUID, passed via the environment and dropped from it before the
//! snippet runs) carrying success/failure, surviving bindings and the
//! trailing-expression summary. The marker keeps snippet output from
//! forging an envelope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snipbox_core::Bindings;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Bootstrap program run by the Python backend (`python3 -c ...`)
///
/// Evaluates a trailing expression statement separately so its repr can be
/// reported, and exports the JSON-serializable top-level bindings. The
/// snippet runs under restricted builtins: `eval`/`exec`/`compile`/`open`
/// are removed and `__import__` is replaced by a guard that re-checks the
/// module name against the job's allow/forbid lists, so a module name
/// hidden in a string literal (`__import__('os')`) cannot sidestep static
/// validation. The envelope marker is scrubbed from the environment before
/// the snippet sees it. When the job denies network access the socket
/// constructors are replaced as well; OS-level isolation can be layered on
/// top via a wrapper command.
pub(crate) const PY_BOOTSTRAP: &str = r#"
import ast, json, os, sys, traceback

job = json.load(sys.stdin)
marker = os.environ.pop("SNIPBOX_MARKER")

if not job.get("network_allowed", False):
    import socket

    def _denied(*_args, **_kwargs):
        raise PermissionError("network access disabled by policy")

    socket.socket = _denied
    socket.create_connection = _denied
    socket.socketpair = _denied

allowed = [p.split(".") for p in job.get("allowed_symbol_patterns") or []]
forbidden = job.get("forbidden_symbols") or []

def _import_permitted(name):
    for entry in forbidden:
        if name == entry or name.startswith(entry + "."):
            return False
    segments = name.split(".")
    for pattern in allowed:
        if pattern and pattern[-1] == "*":
            prefix = pattern[:-1]
            if segments[:len(prefix)] == prefix:
                return True
        elif segments == pattern:
            return True
    return False

_real_import = __import__

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level != 0 or not _import_permitted(name):
        raise PermissionError("import of %r is not permitted by policy" % name)
    return _real_import(name, globals, locals, fromlist, level)

import builtins

safe_builtins = dict(vars(builtins))
for blocked in ("eval", "exec", "compile", "open", "input", "breakpoint"):
    safe_builtins.pop(blocked, None)
safe_builtins["__import__"] = _guarded_import

namespace = {"__builtins__": safe_builtins}
namespace.update(job.get("bindings") or {})

ok = True
error = None
summary = None
try:
    tree = ast.parse(job["source"], "<snippet>", "exec")
    trailing = None
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        trailing = ast.Expression(tree.body[-1].value)
        tree.body = tree.body[:-1]
    exec(compile(tree, "<snippet>", "exec"), namespace)
    if trailing is not None:
        value = eval(compile(trailing, "<snippet>", "eval"), namespace)
        if value is not None:
            summary = repr(value)
except BaseException as exc:
    ok = False
    error = "".join(traceback.format_exception_only(type(exc), exc)).strip()

bindings = {}
if ok:
    for key, value in namespace.items():
        if key.startswith("__"):
            continue
        try:
            json.dumps(value)
        except (TypeError, ValueError):
            continue
        bindings[key] = value

sys.stdout.flush()
sys.stderr.flush()
envelope = {"ok": ok, "error": error, "bindings": bindings, "return_summary": summary}
sys.stdout.write("\n" + marker + json.dumps(envelope) + "\n")
sys.stdout.flush()
"#;

/// Environment variable carrying the per-run envelope marker
pub const MARKER_ENV: &str = "SNIPBOX_MARKER";

/// One unit of work handed to a worker on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    /// Snippet source text
    pub source: String,
    /// Context bindings injected as the initial environment
    pub bindings: Bindings,
    /// Whether the worker keeps outbound network capability
    pub network_allowed: bool,
    /// Symbol patterns the runtime import guard accepts
    pub allowed_symbol_patterns: Vec<String>,
    /// Symbols the runtime import guard rejects outright
    pub forbidden_symbols: Vec<String>,
}

/// Envelope emitted by the worker after the snippet finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    /// Whether the snippet ran to completion
    pub ok: bool,
    /// Error text on failure
    #[serde(default)]
    pub error: Option<String>,
    /// Surviving JSON-serializable top-level bindings
    #[serde(default)]
    pub bindings: Bindings,
    /// Repr of the trailing expression value, if any
    #[serde(default)]
    pub return_summary: Option<String>,
}

/// Split captured stdout into snippet output and the worker envelope
///
/// Searches for the last marker occurrence so snippet output that happens
/// to print earlier marker text cannot truncate the real envelope.
#[must_use]
pub fn split_envelope(stdout: &[u8], marker: &str) -> Option<(Vec<u8>, WorkerEnvelope)> {
    let needle = marker.as_bytes();
    let start = stdout
        .windows(needle.len())
        .rposition(|window| window == needle)?;
    let mut prefix = stdout[..start].to_vec();
    if prefix.last() == Some(&b'\n') {
        prefix.pop();
    }
    let tail = &stdout[start + needle.len()..];
    let envelope = serde_json::from_slice(tail).ok()?;
    Some((prefix, envelope))
}

/// Seam between the executor and the worker process
///
/// Implementations spawn a process that speaks the stdin-job /
/// marker-envelope protocol; the executor owns timeout, memory sampling
/// and termination for the returned child.
#[async_trait]
pub trait WorkerBackend: Send + Sync + std::fmt::Debug {
    /// Spawn a worker for one job
    ///
    /// # Errors
    /// Returns the underlying I/O error when the process cannot start.
    async fn launch(&self, job: &WorkerJob, marker: &str) -> std::io::Result<Child>;
}

/// Production backend: `python3 -c <bootstrap>` in a scrubbed environment
#[derive(Debug, Clone)]
pub struct PythonBackend {
    program: PathBuf,
    network_deny_wrapper: Option<Vec<String>>,
}

impl PythonBackend {
    /// Backend using the given interpreter binary
    #[inline]
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            network_deny_wrapper: None,
        }
    }

    /// Add an OS-level wrapper for network-denied jobs
    ///
    /// Typically `["unshare", "-r", "-n"]` on hosts that support user
    /// namespaces; the language-level socket guard still applies either
    /// way.
    #[must_use]
    pub fn with_network_deny_wrapper(mut self, wrapper: Vec<String>) -> Self {
        self.network_deny_wrapper = Some(wrapper);
        self
    }
}

impl Default for PythonBackend {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl WorkerBackend for PythonBackend {
    async fn launch(&self, job: &WorkerJob, marker: &str) -> std::io::Result<Child> {
        let mut command = match (&self.network_deny_wrapper, job.network_allowed) {
            (Some(wrapper), false) if !wrapper.is_empty() => {
                let mut command = Command::new(&wrapper[0]);
                command.args(&wrapper[1..]);
                command.arg(&self.program);
                command
            }
            _ => Command::new(&self.program),
        };
        command
            .arg("-c")
            .arg(PY_BOOTSTRAP)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env(MARKER_ENV, marker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.spawn()
    }
}
