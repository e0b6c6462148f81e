//! Turning a named remote variable into a locally callable interface
//! (§4.7).

use std::sync::Weak;

use crate::codec::{Value, ValueMap};
use crate::error::TaskError;
use crate::service::ServiceInner;
use crate::task::Status;

/// A controller-side handle to a worker-side object: calling a method on
/// it builds `var.method(arg0,arg1,...)`, submits it as a task on the
/// bound queue, and waits for the result.
///
/// Also the target of worker-initiated auto-proxying (§4.7): when a
/// worker returns a value no converter can serialize, it exports the
/// value under a generated name and the controller wraps the resulting
/// `worker_object` descriptor in one of these.
pub struct WorkerObject {
    service: Weak<ServiceInner>,
    var_name: String,
    queue: Option<String>,
}

impl WorkerObject {
    pub(crate) fn new(service: Weak<ServiceInner>, var_name: String, queue: Option<String>) -> WorkerObject {
        WorkerObject {
            service,
            var_name,
            queue,
        }
    }

    pub fn var_name(&self) -> &str {
        &self.var_name
    }

    /// Builds `arg0,arg1,...` inputs, submits `var.method(arg0,arg1,...)`
    /// as a task, blocks on it, and returns `outputs["result"]`.
    ///
    /// The worker language must use dot-call syntax; no other call
    /// convention is supported (§4.7).
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, TaskError> {
        let service = self.service.upgrade().ok_or_else(|| TaskError {
            uuid: String::new(),
            status: Status::Crashed,
            error: Some("service closed".to_string()),
        })?;

        let mut inputs = ValueMap::new();
        let mut arg_names = Vec::with_capacity(args.len());
        for (i, arg) in args.into_iter().enumerate() {
            let name = format!("arg{i}");
            inputs.insert(name.clone(), arg);
            arg_names.push(name);
        }

        let script = format!("{}.{}({})", self.var_name, method, arg_names.join(","));
        let uuid = uuid::Uuid::new_v4().to_string();
        let task = crate::task::Task::new(
            uuid,
            script,
            inputs,
            self.queue.clone(),
            Weak::clone(&self.service),
        );
        service.register_task(task.clone());

        task.start().map_err(|e| TaskError {
            uuid: task.uuid().to_string(),
            status: Status::Crashed,
            error: Some(e.to_string()),
        })?;
        task.wait_for()?;
        Ok(task.result().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_without_a_live_service_fails() {
        let obj = WorkerObject::new(Weak::new(), "bird".into(), None);
        let err = obj.call("walk", vec![Value::Int(1)]).unwrap_err();
        assert_eq!(err.error.as_deref(), Some("service closed"));
    }
}
