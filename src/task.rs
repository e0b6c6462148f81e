//! The per-submission state machine observable by callers (§4.4).

use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::codec::{Value, ValueMap};
use crate::error::{ServiceError, TaskError};
use crate::service::{Request, Response, ServiceInner};

/// A task's lifecycle state. Transitions are monotone; the four listed
/// last are terminal and final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initial,
    Queued,
    Running,
    Complete,
    Canceled,
    Failed,
    Crashed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Complete | Status::Canceled | Status::Failed | Status::Crashed
        )
    }
}

/// Invoked on the dispatcher thread for every response the owning task
/// receives. Must not block; errors are caught by the caller and never
/// propagate (`LISTENER_ERROR`, §7).
pub type Listener = Box<dyn Fn(&Task) + Send + Sync>;

struct State {
    status: Status,
    message: Option<String>,
    current: i64,
    maximum: i64,
    error: Option<String>,
    outputs: ValueMap,
    cancel_pending: bool,
}

struct Inner {
    uuid: String,
    script: String,
    inputs: ValueMap,
    queue: Option<String>,
    service: Weak<ServiceInner>,
    state: Mutex<State>,
    terminal_cv: Condvar,
    listeners: Mutex<Vec<Listener>>,
}

/// A submission in flight on a [`crate::service::Service`]. Cheap to
/// clone; clones share the same underlying state (an `Arc`), matching
/// how the registry and the caller's own handle both need to observe
/// the same task.
#[derive(Clone)]
pub struct Task(Arc<Inner>);

impl Task {
    pub(crate) fn new(
        uuid: String,
        script: String,
        inputs: ValueMap,
        queue: Option<String>,
        service: Weak<ServiceInner>,
    ) -> Task {
        Task(Arc::new(Inner {
            uuid,
            script,
            inputs,
            queue,
            service,
            state: Mutex::new(State {
                status: Status::Initial,
                message: None,
                current: 0,
                maximum: 0,
                error: None,
                outputs: ValueMap::new(),
                cancel_pending: false,
            }),
            terminal_cv: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn uuid(&self) -> &str {
        &self.0.uuid
    }

    pub fn script(&self) -> &str {
        &self.0.script
    }

    pub fn inputs(&self) -> &ValueMap {
        &self.0.inputs
    }

    pub fn queue(&self) -> Option<&str> {
        self.0.queue.as_deref()
    }

    pub fn status(&self) -> Status {
        self.0.state.lock().unwrap().status
    }

    pub fn message(&self) -> Option<String> {
        self.0.state.lock().unwrap().message.clone()
    }

    pub fn progress(&self) -> (i64, i64) {
        let state = self.0.state.lock().unwrap();
        (state.current, state.maximum)
    }

    pub fn error(&self) -> Option<String> {
        self.0.state.lock().unwrap().error.clone()
    }

    /// Removes and returns `outputs["result"]`, if present. Taking
    /// ownership (rather than cloning) is unavoidable for outputs that
    /// wrap live OS resources (`Value::Shm`, `Value::NDArray`).
    pub fn result(&self) -> Option<Value> {
        self.take_output("result")
    }

    /// Removes and returns a named output.
    pub fn take_output(&self, name: &str) -> Option<Value> {
        self.0.state.lock().unwrap().outputs.remove(name)
    }

    /// Registers a listener, invoked on the dispatcher thread for every
    /// response this task receives from here on.
    pub fn listen(&self, listener: impl Fn(&Task) + Send + Sync + 'static) {
        self.0.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Emits the `EXECUTE` request, transitioning `INITIAL -> QUEUED`.
    pub fn start(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.status != Status::Initial {
                return Err(ServiceError::AlreadyStarted);
            }
            state.status = Status::Queued;
        }

        let service = self.0.service.upgrade().ok_or(ServiceError::Closed)?;
        let result = service.send_request(&Request::Execute {
            task: self.0.uuid.clone(),
            script: self.0.script.clone(),
            inputs: self.0.inputs.clone_shallow(),
            queue: self.0.queue.clone(),
        });

        if result.is_err() {
            self.crash("failed to submit task".to_string());
        }
        result
    }

    /// Sends a `CANCEL` request. Cooperative: the worker may ignore it.
    /// A no-op on a terminal task. If the task has not yet received its
    /// `LAUNCH` response, the cancel is queued and sent as soon as it
    /// does, to avoid a lost-cancel race (§9 Open Question 2).
    pub fn cancel(&self) -> Result<(), ServiceError> {
        let already_launched = {
            let mut state = self.0.state.lock().unwrap();
            if state.status.is_terminal() {
                return Ok(());
            }
            if state.status == Status::Running {
                true
            } else {
                state.cancel_pending = true;
                false
            }
        };

        if already_launched {
            let service = self.0.service.upgrade().ok_or(ServiceError::Closed)?;
            service.send_request(&Request::Cancel {
                task: self.0.uuid.clone(),
            })?;
        }
        Ok(())
    }

    /// Blocks until the task reaches a terminal state. Returns `Ok(self)`
    /// if it completed successfully, or `Err` carrying the task's status
    /// and error message otherwise.
    pub fn wait_for(&self) -> Result<Task, TaskError> {
        let state = self.0.state.lock().unwrap();
        let state = self
            .0
            .terminal_cv
            .wait_while(state, |s| !s.status.is_terminal())
            .unwrap();

        if state.status == Status::Complete {
            drop(state);
            Ok(self.clone())
        } else {
            Err(TaskError {
                uuid: self.0.uuid.clone(),
                status: state.status,
                error: state.error.clone(),
            })
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Applies a response from the worker, performing the §4.4 state
    /// transition, then fans out to listeners. Called on the stdout
    /// reader thread via the owning service's dispatch loop.
    pub(crate) fn apply_response(&self, response: Response) {
        let mut pending_cancel_to_send = false;

        {
            let mut state = self.0.state.lock().unwrap();
            match response {
                Response::Launch { .. } => {
                    state.status = Status::Running;
                    if state.cancel_pending {
                        state.cancel_pending = false;
                        pending_cancel_to_send = true;
                    }
                }
                Response::Update {
                    message,
                    current,
                    maximum,
                    ..
                } => {
                    if message.is_some() {
                        state.message = message;
                    }
                    if let Some(c) = current {
                        state.current = c;
                    }
                    if let Some(m) = maximum {
                        state.maximum = m;
                    }
                }
                Response::Completion { outputs, .. } => {
                    state.status = Status::Complete;
                    state.outputs = outputs;
                }
                Response::Cancelation { .. } => {
                    state.status = Status::Canceled;
                }
                Response::Failure { error, .. } => {
                    state.status = Status::Failed;
                    state.error = Some(error);
                }
            }

            if state.status.is_terminal() {
                self.0.terminal_cv.notify_all();
            }
        }

        if pending_cancel_to_send {
            if let Some(service) = self.0.service.upgrade() {
                let _ = service.send_request(&Request::Cancel {
                    task: self.0.uuid.clone(),
                });
            }
        }

        for listener in self.0.listeners.lock().unwrap().iter() {
            listener(self);
        }
    }

    /// Forces the task into `CRASHED` with a stable reason. Used by the
    /// owning service on teardown and by I/O failures at submission
    /// time.
    pub(crate) fn crash(&self, reason: String) {
        let mut state = self.0.state.lock().unwrap();
        if !state.status.is_terminal() {
            state.status = Status::Crashed;
            state.error = Some(reason);
            self.0.terminal_cv.notify_all();
        }
    }
}

/// Inputs are frozen at submission (§3); cloning here is a shallow copy
/// of JSON-like leaves plus a re-attach of any `SharedMemory`/`NDArray`
/// by name, since those variants don't implement `Clone` (they own a
/// live OS mapping). This lets `start()` hand a snapshot to the writer
/// while the `Task` itself keeps the original handles for local reuse.
trait CloneShallow {
    fn clone_shallow(&self) -> Self;
}

impl CloneShallow for ValueMap {
    fn clone_shallow(&self) -> ValueMap {
        self.iter()
            .map(|(k, v)| (k.clone(), v.clone_shallow()))
            .collect()
    }
}

impl CloneShallow for Value {
    fn clone_shallow(&self) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) => Value::Float(*f),
            Value::Str(s) => Value::Str(s.clone()),
            Value::List(items) => Value::List(items.iter().map(|v| v.clone_shallow()).collect()),
            Value::Map(map) => Value::Map(map.clone_shallow()),
            Value::Shm(shm) => {
                Value::Shm(crate::shmem::SharedMemory::attach(shm.name(), shm.rsize()).expect(
                    "re-attaching a shared memory segment owned by this process must succeed",
                ))
            }
            Value::NDArray(arr) => {
                let shm = crate::shmem::SharedMemory::attach(arr.shm().name(), arr.shm().rsize())
                    .expect("re-attaching a shared memory segment owned by this process must succeed");
                Value::NDArray(
                    crate::ndarray::NDArray::new(arr.dtype(), arr.shape().clone(), shm)
                        .expect("shape must still fit after re-attaching"),
                )
            }
            Value::WorkerObject(name) => Value::WorkerObject(name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_task_starts_initial() {
        let task = Task::new(
            "uuid-1".into(),
            "1 + 1".into(),
            ValueMap::new(),
            None,
            Weak::new(),
        );
        assert_eq!(task.status(), Status::Initial);
    }

    #[test]
    fn starting_without_a_live_service_crashes() {
        let task = Task::new(
            "uuid-2".into(),
            "1 + 1".into(),
            ValueMap::new(),
            None,
            Weak::new(),
        );
        let err = task.start().unwrap_err();
        assert!(matches!(err, ServiceError::Closed));
    }

    #[test]
    fn double_start_is_illegal_state() {
        let task = Task::new(
            "uuid-3".into(),
            "1 + 1".into(),
            ValueMap::new(),
            None,
            Weak::new(),
        );
        // First start fails for lack of a service, but still consumes
        // the INITIAL -> QUEUED transition's precondition check... no:
        // a failed send leaves the task CRASHED (terminal), so a second
        // start must report the terminal/illegal state, never silently
        // re-queue.
        let _ = task.start();
        let err = task.start().unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyStarted | ServiceError::Closed));
    }

    #[test]
    fn cancel_on_terminal_task_is_a_no_op() {
        let task = Task::new(
            "uuid-4".into(),
            "1 + 1".into(),
            ValueMap::new(),
            None,
            Weak::new(),
        );
        task.crash("test".into());
        assert!(task.cancel().is_ok());
    }

    #[test]
    fn wait_for_surfaces_failure() {
        let task = Task::new(
            "uuid-5".into(),
            "1 + 1".into(),
            ValueMap::new(),
            None,
            Weak::new(),
        );
        task.apply_response(Response::Failure {
            task: "uuid-5".into(),
            error: "NameError: x is not defined".into(),
        });

        let err = task.wait_for().unwrap_err();
        assert_eq!(err.status, Status::Failed);
        assert!(err.error.unwrap().contains("NameError"));
    }

    #[test]
    fn update_events_do_not_change_status() {
        let task = Task::new(
            "uuid-6".into(),
            "1 + 1".into(),
            ValueMap::new(),
            None,
            Weak::new(),
        );
        task.apply_response(Response::Launch {
            task: "uuid-6".into(),
        });
        assert_eq!(task.status(), Status::Running);

        task.apply_response(Response::Update {
            task: "uuid-6".into(),
            message: Some("[0] -> 29998".into()),
            current: Some(0),
            maximum: Some(91),
        });
        assert_eq!(task.status(), Status::Running);
        assert_eq!(task.message().as_deref(), Some("[0] -> 29998"));
    }
}
