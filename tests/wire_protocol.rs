//! Wire-format round-trips, plus end-to-end scenarios against the Python
//! fixture worker under `tests/fixtures/echo_worker.py`.
//!
//! The subprocess-backed tests are `#[ignore]`d by default: they need a
//! `python3` on `PATH`. The precondition is documented in each
//! `.expect(...)` message rather than silently skipped.

use std::collections::BTreeMap;
use std::time::Duration;

use appose::{DType, MessageCodec, NDArray, Service, SharedMemory, Shape, Status, Value, ValueMap};

fn fixture_path() -> String {
    format!("{}/tests/fixtures/echo_worker.py", env!("CARGO_MANIFEST_DIR"))
}

fn spawn_echo_worker() -> Service {
    Service::builder("python3")
        .arg("-u")
        .arg(fixture_path())
        .spawn()
        .expect("spawn python3 -u tests/fixtures/echo_worker.py; is python3 on PATH?")
}

#[test]
fn message_codec_round_trips_plain_values() {
    let mut map: ValueMap = BTreeMap::new();
    map.insert("count".into(), Value::Int(42));
    map.insert("ratio".into(), Value::Float(0.5));
    map.insert("label".into(), Value::Str("ok".into()));
    map.insert(
        "items".into(),
        Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
    );

    let codec = MessageCodec::new();
    let line = codec.encode(&map).expect("encode");
    let decoded = codec.decode(&line).expect("decode");

    assert_eq!(decoded.get("count").and_then(Value::as_i64), Some(42));
    assert_eq!(decoded.get("ratio").and_then(Value::as_f64), Some(0.5));
    assert_eq!(decoded.get("label").and_then(Value::as_str), Some("ok"));
    match decoded.get("items") {
        Some(Value::List(items)) => assert_eq!(items.len(), 3),
        other => panic!("expected List, got {other:?}"),
    }
}

#[test]
#[ignore = "requires python3 on PATH"]
fn collatz_script_emits_ninety_one_updates_then_completes() {
    let service = spawn_echo_worker();

    let updates = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let updates_for_listener = updates.clone();

    let script = r#"
v = 9999
steps = 0
while v != 1:
    v = v // 2 if v % 2 == 0 else 3 * v + 1
    steps += 1
    task.update(message=f"[{steps-1}] -> {v}")
result = steps
"#;

    let task = service.task(script, ValueMap::new());
    task.listen(move |t| {
        if t.status() == Status::Running {
            if let Some(message) = t.message() {
                updates_for_listener.lock().unwrap().push(message);
            }
        }
    });
    task.start().expect("start");
    let task = task.wait_for().expect("collatz task should complete");

    assert_eq!(updates.lock().unwrap().len(), 91);
    assert_eq!(task.result().and_then(|v| v.as_i64()), Some(91));

    service.close().expect("close");
}

#[test]
#[ignore = "requires python3 on PATH"]
fn undefined_variable_fails_with_a_name_error() {
    let service = spawn_echo_worker();

    let task = service.run("result = undefined_variable", ValueMap::new()).expect("start");
    let err = task.wait_for().unwrap_err();

    assert_eq!(err.status, Status::Failed);
    assert!(err.error.unwrap().contains("NameError"));

    service.close().expect("close");
}

#[test]
#[ignore = "requires python3 on PATH"]
fn cancelling_a_long_running_loop_ends_in_canceled_not_completion() {
    let service = spawn_echo_worker();

    let script = r#"
import time
while not task.cancel_requested():
    time.sleep(0.01)
result = "should never get here"
"#;

    let task = service.run(script, ValueMap::new()).expect("start");
    std::thread::sleep(Duration::from_millis(50));
    task.cancel().expect("cancel");

    let err = task.wait_for().unwrap_err();
    assert_eq!(err.status, Status::Canceled);

    service.close().expect("close");
}

#[test]
#[ignore = "requires python3 on PATH"]
fn shared_memory_buffer_is_summed_by_the_worker() {
    let service = spawn_echo_worker();

    let mut shm = SharedMemory::create(None, 96).expect("create");
    for (i, byte) in shm.as_mut_slice().iter_mut().enumerate() {
        *byte = i as u8;
    }

    let mut inputs = ValueMap::new();
    inputs.insert("buf".into(), Value::Shm(shm));

    let task = service.run("result = sum(buf)", inputs).expect("start");
    let task = task.wait_for().expect("sum task should complete");

    assert_eq!(task.result().and_then(|v| v.as_i64()), Some(4560));

    service.close().expect("close");
}

#[test]
#[ignore = "requires python3 and numpy on PATH"]
fn ndarray_values_round_trip_through_numpy_formatting() {
    let service = spawn_echo_worker();

    let shape = Shape::c_order(vec![2, 3, 4]);
    let dtype = DType::Float32;
    let nbytes = shape.product() as u64 * dtype.size() as u64;
    let shm = SharedMemory::create(None, nbytes).expect("create");
    let mut arr = NDArray::new(dtype, shape, shm).expect("wrap");
    for (i, chunk) in arr.as_bytes_mut().chunks_mut(4).enumerate() {
        chunk.copy_from_slice(&(i as f32).to_le_bytes());
    }

    let mut inputs = ValueMap::new();
    inputs.insert("arr".into(), Value::NDArray(arr));

    let task = service.run("result = str(arr)", inputs).expect("start");
    let task = task.wait_for().expect("ndarray task should complete");

    let result = task.result().and_then(|v| v.as_str().map(str::to_string));
    assert!(result.unwrap_or_default().starts_with("[[[ 0.  1.  2.  3.]"));

    service.close().expect("close");
}
