//! The worker-process supervisor: framing, concurrent task multiplexing
//! over one stdio channel, event fan-out, cancellation, teardown (§4.5).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::{Map as JsonMap, Value as Json};
use uuid::Uuid;

use crate::codec::{json_to_value, Value, ValueMap};
use crate::error::{CodecError, ServiceError};
use crate::proxy::WorkerObject;
use crate::task::Task;

/// Sink for stderr lines and decode/listener diagnostics that aren't
/// surfaced to a caller directly (§7 items 6-7).
pub trait DebugSink: Send + Sync {
    fn on_debug(&self, line: &str);
}

/// Writes every debug line to stderr, tagged with the service's pid.
pub struct StderrDebugSink;

impl DebugSink for StderrDebugSink {
    fn on_debug(&self, line: &str) {
        eprintln!("[appose] {line}");
    }
}

/// Discards every debug line.
pub struct NullDebugSink;

impl DebugSink for NullDebugSink {
    fn on_debug(&self, _line: &str) {}
}

/// Depth of the response-dispatch queue between the stdout reader
/// thread and the dispatcher thread that runs task listeners. Bounded
/// so a slow listener applies backpressure rather than letting an
/// unread queue grow without limit, without blocking the reader thread
/// itself on listener work (§9 "Coroutine/async concerns").
const DISPATCH_QUEUE_DEPTH: usize = 256;

/// A controller -> worker request frame (§6.1).
#[derive(Debug, Clone)]
pub enum Request {
    Execute {
        task: String,
        script: String,
        inputs: ValueMap,
        queue: Option<String>,
    },
    Cancel {
        task: String,
    },
}

impl Request {
    fn to_line(&self) -> Result<String, CodecError> {
        let mut obj = JsonMap::new();
        match self {
            Request::Execute {
                task,
                script,
                inputs,
                queue,
            } => {
                obj.insert("requestType".into(), Json::from("EXECUTE"));
                obj.insert("task".into(), Json::from(task.clone()));
                obj.insert("script".into(), Json::from(script.clone()));
                obj.insert("inputs".into(), Json::Object(crate::codec::map_to_json(inputs)));
                if let Some(q) = queue {
                    obj.insert("queue".into(), Json::from(q.clone()));
                }
            }
            Request::Cancel { task } => {
                obj.insert("requestType".into(), Json::from("CANCEL"));
                obj.insert("task".into(), Json::from(task.clone()));
            }
        }
        Ok(serde_json::to_string(&Json::Object(obj))?)
    }
}

/// A worker -> controller response frame (§6.1).
#[derive(Debug, Clone)]
pub enum Response {
    Launch { task: String },
    Update {
        task: String,
        message: Option<String>,
        current: Option<i64>,
        maximum: Option<i64>,
    },
    Completion { task: String, outputs: ValueMap },
    Cancelation { task: String },
    Failure { task: String, error: String },
}

impl Response {
    pub fn task_id(&self) -> &str {
        match self {
            Response::Launch { task }
            | Response::Update { task, .. }
            | Response::Completion { task, .. }
            | Response::Cancelation { task }
            | Response::Failure { task, .. } => task,
        }
    }

    fn from_line(line: &str) -> Result<Response, CodecError> {
        let json: Json = serde_json::from_str(line)?;
        let mut obj = match json {
            Json::Object(o) => o,
            _ => return Err(CodecError::NotAnObject),
        };

        let task = obj
            .remove("task")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or(CodecError::MissingField("task"))?;
        let response_type = obj
            .remove("responseType")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or(CodecError::MissingField("responseType"))?;

        match response_type.as_str() {
            "LAUNCH" => Ok(Response::Launch { task }),
            "UPDATE" => Ok(Response::Update {
                task,
                message: obj.remove("message").and_then(|v| v.as_str().map(str::to_string)),
                current: obj.remove("current").and_then(|v| v.as_i64()),
                maximum: obj.remove("maximum").and_then(|v| v.as_i64()),
            }),
            "COMPLETION" => {
                let outputs = match obj.remove("outputs") {
                    Some(Json::Object(o)) => o
                        .into_iter()
                        .map(|(k, v)| Ok((k, json_to_value(v)?)))
                        .collect::<Result<ValueMap, CodecError>>()?,
                    Some(_) => return Err(CodecError::MissingField("outputs")),
                    None => ValueMap::new(),
                };
                Ok(Response::Completion { task, outputs })
            }
            "CANCELATION" => Ok(Response::Cancelation { task }),
            "FAILURE" => {
                let error = obj
                    .remove("error")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or(CodecError::MissingField("error"))?;
                Ok(Response::Failure { task, error })
            }
            other => Err(CodecError::UnknownResponseType(other.to_string())),
        }
    }
}

/// Configures and spawns a [`Service`].
pub struct ServiceBuilder {
    exe: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env_vars: HashMap<String, String>,
    debug_sink: Arc<dyn DebugSink>,
}

impl ServiceBuilder {
    pub fn new(exe: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            exe: exe.into(),
            args: Vec::new(),
            current_dir: None,
            env_vars: HashMap::new(),
            debug_sink: Arc::new(StderrDebugSink),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> ServiceBuilder {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> ServiceBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> ServiceBuilder {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> ServiceBuilder {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn debug_sink(mut self, sink: Arc<dyn DebugSink>) -> ServiceBuilder {
        self.debug_sink = sink;
        self
    }

    /// Spawns the worker process and starts its reader threads.
    pub fn spawn(self) -> Result<Service, ServiceError> {
        let mut command = Command::new(&self.exe);
        command
            .args(&self.args)
            .envs(&self.env_vars)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(ServiceError::Spawn)?;
        let pid = child.id();
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (dispatch_tx, dispatch_rx) = bounded(DISPATCH_QUEUE_DEPTH);

        let inner = Arc::new(ServiceInner {
            pid,
            child: Mutex::new(Some(child)),
            writer: Mutex::new(Some(stdin)),
            tasks: Mutex::new(HashMap::new()),
            debug_sink: self.debug_sink,
            closed: AtomicBool::new(false),
            dispatch_tx: Mutex::new(Some(dispatch_tx)),
            stdout_thread: Mutex::new(None),
            stderr_thread: Mutex::new(None),
            dispatch_thread: Mutex::new(None),
        });

        let stdout_thread = spawn_stdout_reader(Arc::clone(&inner), stdout);
        let stderr_thread = spawn_stderr_reader(Arc::clone(&inner), stderr);
        let dispatch_thread = spawn_dispatch_thread(Arc::clone(&inner), dispatch_rx);
        *inner.stdout_thread.lock().unwrap() = Some(stdout_thread);
        *inner.stderr_thread.lock().unwrap() = Some(stderr_thread);
        *inner.dispatch_thread.lock().unwrap() = Some(dispatch_thread);

        tracing::debug!(pid, "spawned worker process");
        Ok(Service(inner))
    }
}

pub(crate) struct ServiceInner {
    pid: u32,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<std::process::ChildStdin>>,
    tasks: Mutex<HashMap<String, Task>>,
    debug_sink: Arc<dyn DebugSink>,
    closed: AtomicBool,
    /// Decouples line parsing (on the stdout reader thread) from running
    /// task listeners (on the dispatch thread), so a listener that does
    /// real work never stalls reading the worker's stdout. Taken at
    /// close time so the dispatch thread's receive loop can end.
    dispatch_tx: Mutex<Option<Sender<Response>>>,
    stdout_thread: Mutex<Option<JoinHandle<()>>>,
    stderr_thread: Mutex<Option<JoinHandle<()>>>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceInner {
    pub(crate) fn register_task(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.uuid().to_string(), task);
    }

    pub(crate) fn send_request(&self, request: &Request) -> Result<(), ServiceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServiceError::Closed);
        }
        let line = request.to_line()?;
        tracing::trace!(pid = self.pid, %line, "writing request");

        let result: Result<(), ServiceError> = (|| {
            let mut guard = self.writer.lock().unwrap();
            let writer = guard.as_mut().ok_or(ServiceError::Closed)?;
            writer.write_all(line.as_bytes()).map_err(ServiceError::Io)?;
            writer.write_all(b"\n").map_err(ServiceError::Io)?;
            writer.flush().map_err(ServiceError::Io)
        })();

        // A broken stdin pipe (worker died but stdout hasn't EOF'd yet)
        // strands every other in-flight task with no way to ever reach a
        // terminal state unless we crash them here (§7 IO_ERROR).
        if let Err(ServiceError::Io(_)) = &result {
            self.crash_all_tasks("worker crashed");
        }
        result
    }

    fn dispatch_response(self: &Arc<Self>, response: Response) {
        let task_id = response.task_id().to_string();
        let task = self.tasks.lock().unwrap().get(&task_id).cloned();

        match task {
            Some(task) => {
                task.apply_response(response);
                if task.is_terminal() {
                    self.tasks.lock().unwrap().remove(&task_id);
                }
            }
            None => {
                self.debug_sink
                    .on_debug(&format!("response for unknown task {task_id:?}"));
            }
        }
    }

    /// Transitions every surviving task to `CRASHED` with a stable
    /// reason. Called when the worker tears down unexpectedly or the
    /// service is explicitly closed (§4.5).
    fn crash_all_tasks(&self, reason: &str) {
        let tasks: Vec<Task> = self.tasks.lock().unwrap().drain().map(|(_, t)| t).collect();
        for task in tasks {
            task.crash(reason.to_string());
        }
    }
}

/// Owns a worker subprocess: its stdin writer, stdout/stderr reader
/// threads, and the registry of in-flight tasks.
#[derive(Clone)]
pub struct Service(Arc<ServiceInner>);

impl Service {
    pub fn builder(exe: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(exe)
    }

    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    /// Creates a task, but does not start it - call [`Task::start`] (or
    /// use [`Service::run`]) to submit it.
    pub fn task(&self, script: impl Into<String>, inputs: ValueMap) -> Task {
        self.task_with_queue(script, inputs, None)
    }

    pub fn task_with_queue(
        &self,
        script: impl Into<String>,
        inputs: ValueMap,
        queue: Option<impl Into<String>>,
    ) -> Task {
        let uuid = Uuid::new_v4().to_string();
        let task = Task::new(
            uuid.clone(),
            script.into(),
            inputs,
            queue.map(Into::into),
            Arc::downgrade(&self.0),
        );
        self.0.tasks.lock().unwrap().insert(uuid, task.clone());
        task
    }

    /// Creates, starts, and returns a task in one call.
    pub fn run(&self, script: impl Into<String>, inputs: ValueMap) -> Result<Task, ServiceError> {
        let task = self.task(script, inputs);
        task.start()?;
        Ok(task)
    }

    /// Reads a named variable from the worker's global scope (§4.5
    /// "detail requests"). Expressed as an ordinary task whose script is
    /// the bare variable name, whose result is `outputs["result"]`.
    pub fn get_var(&self, name: &str) -> Result<Value, crate::error::TaskError> {
        let task = self.task(name.to_string(), ValueMap::new());
        task.start().map_err(|e| crate::error::TaskError {
            uuid: task.uuid().to_string(),
            status: crate::task::Status::Crashed,
            error: Some(e.to_string()),
        })?;
        task.wait_for()?;
        Ok(task.result().unwrap_or(Value::Null))
    }

    /// Writes a named variable in the worker's global scope.
    pub fn put_var(&self, name: &str, value: Value) -> Result<(), crate::error::TaskError> {
        let mut inputs = ValueMap::new();
        inputs.insert("value".to_string(), value);
        let script = format!("{name} = value");
        let task = self.task(script, inputs);
        task.start().map_err(|e| crate::error::TaskError {
            uuid: task.uuid().to_string(),
            status: crate::task::Status::Crashed,
            error: Some(e.to_string()),
        })?;
        task.wait_for()?;
        Ok(())
    }

    /// Returns a handle whose method calls are submitted as scripted
    /// tasks against the named worker-side variable (§4.7).
    pub fn proxy(&self, var_name: impl Into<String>) -> WorkerObject {
        self.proxy_on_queue(var_name, None::<String>)
    }

    pub fn proxy_on_queue(
        &self,
        var_name: impl Into<String>,
        queue: Option<impl Into<String>>,
    ) -> WorkerObject {
        WorkerObject::new(Arc::downgrade(&self.0), var_name.into(), queue.map(Into::into))
    }

    pub(crate) fn weak(&self) -> Weak<ServiceInner> {
        Arc::downgrade(&self.0)
    }

    /// Closes stdin, waits for the worker to exit, joins the reader
    /// threads, and transitions every surviving task to `CRASHED`.
    pub fn close(&self) -> Result<(), ServiceError> {
        self.close_impl(None)
    }

    /// As [`Service::close`], but kills the worker if it has not exited
    /// within `timeout`.
    pub fn close_timeout(&self, timeout: Duration) -> Result<(), ServiceError> {
        self.close_impl(Some(timeout))
    }

    fn close_impl(&self, timeout: Option<Duration>) -> Result<(), ServiceError> {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.0.writer.lock().unwrap().take();

        if let Some(mut child) = self.0.child.lock().unwrap().take() {
            match timeout {
                None => {
                    let _ = child.wait();
                }
                Some(timeout) => wait_with_timeout(&mut child, timeout),
            }
        }

        if let Some(handle) = self.0.stdout_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.0.stderr_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        // Dropping the sender closes the channel; the dispatch thread's
        // receive loop then ends on its own.
        self.0.dispatch_tx.lock().unwrap().take();
        if let Some(handle) = self.0.dispatch_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        self.0.crash_all_tasks("worker crashed");
        Ok(())
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.writer.lock().unwrap().take();
            self.dispatch_tx.lock().unwrap().take();
            if let Some(mut child) = self.child.lock().unwrap().take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            self.crash_all_tasks("worker crashed");
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) {
    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => return,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(_) => return,
        }
    }
}

fn spawn_stdout_reader(inner: Arc<ServiceInner>, stdout: std::process::ChildStdout) -> JoinHandle<()> {
    thread::Builder::new()
        .name("appose-stdout-reader".into())
        .spawn(move || {
            let pid = inner.pid;
            let _span = tracing::debug_span!("service", pid).entered();
            let reader = BufReader::new(stdout);

            for line in reader.lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::error!("stdout read error: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                match Response::from_line(&line) {
                    Ok(response) => {
                        let tx = inner.dispatch_tx.lock().unwrap().clone();
                        if let Some(tx) = tx {
                            if tx.send(response).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        inner
                            .debug_sink
                            .on_debug(&format!("decode error: {e}: {line}"));
                    }
                }
            }

            tracing::debug!("stdout closed; crashing surviving tasks");
            inner.crash_all_tasks("worker crashed");
        })
        .expect("failed to spawn stdout reader thread")
}

/// Runs task listeners off the reader thread: receives parsed responses
/// from the bounded queue and applies them to the matching task. Exits
/// once the channel closes (every sender clone dropped).
fn spawn_dispatch_thread(inner: Arc<ServiceInner>, rx: Receiver<Response>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("appose-dispatch".into())
        .spawn(move || {
            for response in rx {
                inner.dispatch_response(response);
            }
        })
        .expect("failed to spawn dispatch thread")
}

fn spawn_stderr_reader(inner: Arc<ServiceInner>, stderr: std::process::ChildStderr) -> JoinHandle<()> {
    thread::Builder::new()
        .name("appose-stderr-reader".into())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(l) => inner.debug_sink.on_debug(&l),
                    Err(e) => {
                        tracing::warn!("stderr read error: {e}");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn stderr reader thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses_launch() {
        let resp = Response::from_line(r#"{"task":"abc","responseType":"LAUNCH"}"#).unwrap();
        assert!(matches!(resp, Response::Launch { task } if task == "abc"));
    }

    #[test]
    fn response_parses_update_with_optional_fields() {
        let resp = Response::from_line(
            r#"{"task":"abc","responseType":"UPDATE","message":"[0] -> 29998","current":0,"maximum":91}"#,
        )
        .unwrap();
        match resp {
            Response::Update {
                message,
                current,
                maximum,
                ..
            } => {
                assert_eq!(message.as_deref(), Some("[0] -> 29998"));
                assert_eq!(current, Some(0));
                assert_eq!(maximum, Some(91));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn response_rejects_unknown_response_type() {
        let err = Response::from_line(r#"{"task":"abc","responseType":"WAT"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownResponseType(_)));
    }

    #[test]
    fn execute_request_serializes_inputs_inline() {
        let mut inputs = ValueMap::new();
        inputs.insert("arg0".into(), Value::Int(5));
        let req = Request::Execute {
            task: "abc".into(),
            script: "v.walk(arg0)".into(),
            inputs,
            queue: Some("main".into()),
        };
        let line = req.to_line().unwrap();
        assert!(line.contains("\"requestType\":\"EXECUTE\""));
        assert!(line.contains("\"queue\":\"main\""));
        assert!(line.contains("\"arg0\":5"));
    }
}
