//! Encoding and decoding of the line-oriented JSON wire format (§4.3, §6).
//!
//! Values round-trip through a small dynamic [`Value`] type rather than
//! directly through `serde_json::Value`, because two of its variants
//! (`Shm` and `NDArray`) own live OS resources that a plain JSON value
//! can't represent - decoding one of those attaches a real
//! [`SharedMemory`] segment as a side effect.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use serde_json::{Map as JsonMap, Value as Json};

use crate::error::CodecError;
use crate::ndarray::{DType, NDArray, Shape};
use crate::shmem::SharedMemory;

/// A mapping from argument/output name to [`Value`], in the order
/// callers inserted entries (a `BTreeMap` gives deterministic wire
/// output, which matters for reproducing test fixtures).
pub type ValueMap = BTreeMap<String, Value>;

/// A dynamically-typed message value.
#[derive(Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(ValueMap),
    Shm(SharedMemory),
    NDArray(NDArray),
    /// A reference to a non-serializable worker-side object, auto-proxied
    /// per §4.7.
    WorkerObject(String),
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

/// Failure of a narrowing conversion from the dynamic [`Value`] to a
/// concrete Rust type, e.g. when a proxy stub expects a `bool` back but
/// the worker returned a string.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueTypeError {
    pub expected: &'static str,
}

impl std::fmt::Display for ValueTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a {} value", self.expected)
    }
}

impl std::error::Error for ValueTypeError {}

impl TryFrom<Value> for bool {
    type Error = ValueTypeError;
    fn try_from(value: Value) -> Result<bool, ValueTypeError> {
        match value {
            Value::Bool(b) => Ok(b),
            _ => Err(ValueTypeError { expected: "bool" }),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = ValueTypeError;
    fn try_from(value: Value) -> Result<i64, ValueTypeError> {
        value.as_i64().ok_or(ValueTypeError { expected: "int" })
    }
}

impl TryFrom<Value> for f64 {
    type Error = ValueTypeError;
    fn try_from(value: Value) -> Result<f64, ValueTypeError> {
        value.as_f64().ok_or(ValueTypeError { expected: "float" })
    }
}

impl TryFrom<Value> for String {
    type Error = ValueTypeError;
    fn try_from(value: Value) -> Result<String, ValueTypeError> {
        match value {
            Value::Str(s) => Ok(s),
            _ => Err(ValueTypeError { expected: "string" }),
        }
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

/// Encodes and decodes the newline-delimited JSON message format.
///
/// Carried as an explicit value rather than a process-wide registry (the
/// original implementation registered converters globally) so callers
/// can't accidentally share converter state across unrelated services.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> MessageCodec {
        MessageCodec
    }

    /// Encodes a mapping to a single line of UTF-8 JSON (no trailing
    /// newline; callers append their own framing).
    pub fn encode(&self, map: &ValueMap) -> Result<String, CodecError> {
        let json = Json::Object(map_to_json(map));
        Ok(serde_json::to_string(&json)?)
    }

    /// Decodes a single line of UTF-8 JSON into a mapping. `SharedMemory`
    /// and `NDArray` converters attach to the named segments they
    /// reference as a side effect of decoding.
    pub fn decode(&self, line: &str) -> Result<ValueMap, CodecError> {
        let json: Json = serde_json::from_str(line)?;
        match json {
            Json::Object(obj) => json_map_to_value_map(obj),
            _ => Err(CodecError::NotAnObject),
        }
    }
}

pub(crate) fn map_to_json(map: &ValueMap) -> JsonMap<String, Json> {
    map.iter().map(|(k, v)| (k.clone(), value_to_json(v))).collect()
}

pub(crate) fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => Json::from(*f),
        Value::Str(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => Json::Object(map_to_json(map)),
        Value::Shm(shm) => shm_to_json(shm),
        Value::NDArray(arr) => {
            let mut obj = JsonMap::new();
            obj.insert("appose_type".into(), Json::from("ndarray"));
            obj.insert("dtype".into(), Json::from(arr.dtype().label()));
            obj.insert(
                "shape".into(),
                Json::Array(arr.shape().as_c_order().into_iter().map(Json::from).collect()),
            );
            obj.insert("shm".into(), shm_to_json(arr.shm()));
            Json::Object(obj)
        }
        Value::WorkerObject(var_name) => {
            let mut obj = JsonMap::new();
            obj.insert("appose_type".into(), Json::from("worker_object"));
            obj.insert("var_name".into(), Json::from(var_name.clone()));
            Json::Object(obj)
        }
    }
}

fn shm_to_json(shm: &SharedMemory) -> Json {
    let mut obj = JsonMap::new();
    obj.insert("appose_type".into(), Json::from("shm"));
    obj.insert("name".into(), Json::from(shm.name()));
    obj.insert("rsize".into(), Json::from(shm.rsize()));
    Json::Object(obj)
}

fn json_map_to_value_map(obj: JsonMap<String, Json>) -> Result<ValueMap, CodecError> {
    obj.into_iter()
        .map(|(k, v)| Ok((k, json_to_value(v)?)))
        .collect()
}

pub(crate) fn json_to_value(json: Json) -> Result<Value, CodecError> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Json::String(s) => Ok(Value::Str(s)),
        Json::Array(items) => Ok(Value::List(
            items.into_iter().map(json_to_value).collect::<Result<_, _>>()?,
        )),
        Json::Object(mut obj) => match obj.remove("appose_type") {
            Some(Json::String(tag)) if tag == "shm" => decode_shm(obj).map(Value::Shm),
            Some(Json::String(tag)) if tag == "ndarray" => decode_ndarray(obj).map(Value::NDArray),
            Some(Json::String(tag)) if tag == "worker_object" => {
                let var_name = obj
                    .remove("var_name")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or(CodecError::MissingField("var_name"))?;
                Ok(Value::WorkerObject(var_name))
            }
            Some(Json::String(_)) | None => json_map_to_value_map(obj).map(Value::Map),
            Some(_) => Err(CodecError::MissingField("appose_type")),
        },
    }
}

fn decode_shm(mut obj: JsonMap<String, Json>) -> Result<SharedMemory, CodecError> {
    let name = obj
        .remove("name")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or(CodecError::MissingField("name"))?;
    let rsize = obj
        .remove("rsize")
        .and_then(|v| v.as_u64())
        .ok_or(CodecError::MissingField("rsize"))?;
    Ok(SharedMemory::attach(&name, rsize)?)
}

fn decode_ndarray(mut obj: JsonMap<String, Json>) -> Result<NDArray, CodecError> {
    let dtype_label = obj
        .remove("dtype")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or(CodecError::MissingField("dtype"))?;
    let dtype = DType::from_label(&dtype_label).ok_or(CodecError::MissingField("dtype"))?;

    let shape_values = obj
        .remove("shape")
        .and_then(|v| v.as_array().cloned())
        .ok_or(CodecError::MissingField("shape"))?;
    let extents = shape_values
        .into_iter()
        .map(|v| v.as_i64().ok_or(CodecError::MissingField("shape")))
        .collect::<Result<Vec<_>, _>>()?;
    let shape = Shape::c_order(extents);

    let shm_json = obj
        .remove("shm")
        .and_then(|v| match v {
            Json::Object(o) => Some(o),
            _ => None,
        })
        .ok_or(CodecError::MissingField("shm"))?;
    let shm = decode_shm(shm_json)?;

    Ok(NDArray::new(dtype, shape, shm)?)
}
