//! Appose: multi-language interprocess cooperation with shared memory.
//!
//! A host program (the *controller*) drives one or more worker
//! subprocesses that read line-oriented JSON requests on stdin and write
//! line-oriented JSON responses on stdout. The controller submits
//! scripts as [`Task`]s, exchanges structured values - including
//! zero-copy n-dimensional arrays - over named shared-memory segments,
//! and tears everything down cleanly when done.
//!
//! The crate does not build worker environments (interpreters, package
//! managers); it consumes an [`Environment`] describing where to find a
//! worker executable and how to launch it.

#![allow(dead_code)]

pub mod codec;
pub mod error;
pub mod ndarray;
pub mod proxy;
pub mod service;
pub mod shmem;
pub mod task;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use codec::{MessageCodec, Value, ValueMap, ValueTypeError};
pub use error::{CodecError, ServiceError, ShmError, TaskError};
pub use ndarray::{DType, NDArray, Order, Shape};
pub use proxy::WorkerObject;
pub use service::{DebugSink, NullDebugSink, Service, ServiceBuilder, StderrDebugSink};
pub use shmem::SharedMemory;
pub use task::{Status, Task};

/// A launch descriptor for a worker: where its executable lives, what
/// argv prefix to launch it with, and what environment overlay to apply.
/// Building environments (installing interpreters, resolving package
/// managers) is explicitly out of scope - this is a boundary value
/// only (§6.4).
#[derive(Debug, Clone)]
pub struct Environment {
    pub base: PathBuf,
    pub bin_paths: Vec<PathBuf>,
    pub launch_args: Vec<String>,
    pub env_vars: HashMap<String, String>,
}

impl Environment {
    /// An environment with no dedicated install tree: executables are
    /// resolved against the caller's `PATH`.
    pub fn system() -> Environment {
        Environment {
            base: get_data_dir(),
            bin_paths: Vec::new(),
            launch_args: Vec::new(),
            env_vars: HashMap::new(),
        }
    }

    /// Resolves `exe` against `bin_paths` (falling back to a bare name,
    /// letting the OS search `PATH`) and returns a builder pre-seeded
    /// with `launch_args` and `env_vars`.
    pub fn service(&self, exe: &str, args: &[&str]) -> ServiceBuilder {
        let resolved = self.resolve_exe(exe);
        let mut builder = Service::builder(resolved.to_string_lossy().into_owned());
        for arg in &self.launch_args {
            builder = builder.arg(arg.clone());
        }
        for arg in args {
            builder = builder.arg(*arg);
        }
        for (k, v) in &self.env_vars {
            builder = builder.env(k.clone(), v.clone());
        }
        builder
    }

    /// Convenience for a Python worker: `service("python3", args)` with
    /// an unbuffered-stdio flag, matching how the reference worker is
    /// expected to be launched.
    pub fn python(&self, args: &[&str]) -> ServiceBuilder {
        let mut builder = self.service("python3", &["-u"]);
        for arg in args {
            builder = builder.arg(*arg);
        }
        builder
    }

    /// Convenience for a Groovy worker.
    pub fn groovy(&self, args: &[&str]) -> ServiceBuilder {
        self.service("groovy", args)
    }

    fn resolve_exe(&self, exe: &str) -> PathBuf {
        for dir in &self.bin_paths {
            let candidate = dir.join(exe);
            if candidate.is_file() {
                return candidate;
            }
        }
        Path::new(exe).to_path_buf()
    }
}

/// Base directory for this process's Appose state (generated worker
/// shims, etc.), following OS conventions via `dirs`.
pub fn get_data_dir() -> PathBuf {
    let mut dir = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    dir.push("appose");
    dir
}

/// Generates the stub boilerplate for a typed [`WorkerObject`] facade:
/// given a trait describing the remote interface, emits a struct that
/// implements it by delegating every method to
/// [`WorkerObject::call`](proxy::WorkerObject::call).
///
/// ```ignore
/// trait Bird {
///     fn walk(&self, rate: i64) -> String;
///     fn fly(&self, altitude: i64, speed: i64) -> bool;
/// }
///
/// appose::appose_proxy! {
///     struct BirdProxy;
///     impl Bird {
///         fn walk(&self, rate: i64) -> String;
///         fn fly(&self, altitude: i64, speed: i64) -> bool;
///     }
/// }
/// ```
#[macro_export]
macro_rules! appose_proxy {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident;
        impl $trait_path:path {
            $(fn $method:ident(&self $(, $arg:ident : $arg_ty:ty)*) -> $ret:ty;)+
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            handle: $crate::proxy::WorkerObject,
        }

        impl $name {
            pub fn new(handle: $crate::proxy::WorkerObject) -> Self {
                Self { handle }
            }
        }

        impl $trait_path for $name {
            $(
                fn $method(&self $(, $arg: $arg_ty)*) -> $ret {
                    #[allow(unused_mut)]
                    let mut args: Vec<$crate::codec::Value> = Vec::new();
                    $(args.push($crate::codec::Value::from($arg));)*
                    let result = self
                        .handle
                        .call(stringify!($method), args)
                        .expect("proxy call failed");
                    std::convert::TryFrom::try_from(result)
                        .expect("unexpected return type from worker")
                }
            )+
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_environment_has_no_bin_paths() {
        let env = Environment::system();
        assert!(env.bin_paths.is_empty());
    }

    #[test]
    fn resolve_exe_falls_back_to_bare_name() {
        let env = Environment {
            base: PathBuf::from("/tmp"),
            bin_paths: vec![PathBuf::from("/definitely/not/a/real/dir")],
            launch_args: Vec::new(),
            env_vars: HashMap::new(),
        };
        assert_eq!(env.resolve_exe("python3"), PathBuf::from("python3"));
    }
}
