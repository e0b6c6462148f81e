//! Named, size-typed, OS-backed byte regions shared between this process
//! and a worker subprocess.
//!
//! Platform dispatch is handled by the `shared_memory` crate; this
//! module layers Appose's create/attach/close/unlink contract on top of
//! it, including the size-conflict and auto-naming rules.

use std::fmt;

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::error::ShmError;

/// Maximum length, in characters, of an auto-generated segment name.
const AUTO_NAME_MAX_LEN: usize = 14;

#[cfg(unix)]
const AUTO_NAME_PREFIX: &str = "/psm_";
#[cfg(windows)]
const AUTO_NAME_PREFIX: &str = "wnsm_";
#[cfg(not(any(unix, windows)))]
const AUTO_NAME_PREFIX: &str = "/psm_";

/// A handle to a named OS-backed byte region.
///
/// A name may be attached multiple times, within one process or across
/// processes; each handle independently tracks its own mapping. Closing a
/// handle unmaps it; unlinking removes the underlying OS object (where the
/// platform makes that a distinct operation from closing).
pub struct SharedMemory {
    inner: Option<Shmem>,
    /// The exact id string passed to `ShmemConf::os_id`, kept around so
    /// `unlink()` can reopen the segment by name after a prior `close()`.
    os_id: String,
    name: String,
    rsize: u64,
    size: u64,
    unlink_on_close: bool,
    unlinked: bool,
}

// `Shmem` maps raw memory; the mapping itself is safe to hand across
// threads as long as callers serialize their own writes (the protocol
// does this at the task-boundary level, per the concurrency model).
unsafe impl Send for SharedMemory {}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("rsize", &self.rsize)
            .field("size", &self.size)
            .finish()
    }
}

impl SharedMemory {
    /// Creates or attaches a named segment.
    ///
    /// - `name = None`: a fresh, unique name is generated and a new
    ///   segment of `rsize` bytes is created.
    /// - `name = Some(n)`, region `n` exists and is `>= rsize`: attaches
    ///   to the existing (possibly larger) region.
    /// - `name = Some(n)`, region `n` exists and is smaller than `rsize`:
    ///   fails with [`ShmError::SizeConflict`].
    /// - `name = Some(n)`, no such region exists: creates one of `rsize`
    ///   bytes (the OS may round this up).
    pub fn create(name: Option<&str>, rsize: u64) -> Result<SharedMemory, ShmError> {
        match name {
            None => Self::create_with_generated_name(rsize),
            Some(name) => Self::create_named(name, rsize),
        }
    }

    /// Attaches to an existing named segment. Fails with
    /// [`ShmError::NotFound`] if no such segment exists.
    pub fn attach(name: &str, rsize: u64) -> Result<SharedMemory, ShmError> {
        let shm = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|_| ShmError::NotFound {
                name: name.to_string(),
            })?;

        Ok(Self::from_shmem(name.to_string(), rsize, shm, false))
    }

    fn create_with_generated_name(rsize: u64) -> Result<SharedMemory, ShmError> {
        for _ in 0..64 {
            let candidate = generate_name();
            match ShmemConf::new()
                .os_id(&candidate)
                .size(rsize as usize)
                .create()
            {
                Ok(shm) => return Ok(Self::from_shmem(candidate, rsize, shm, false)),
                Err(ShmemError::MappingIdExists) => continue,
                Err(e) => return Err(map_shmem_err(e)),
            }
        }

        Err(ShmError::Os(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "exhausted attempts to generate a unique shared memory name",
        )))
    }

    fn create_named(name: &str, rsize: u64) -> Result<SharedMemory, ShmError> {
        match ShmemConf::new().os_id(name).open() {
            Ok(existing) => {
                let existing_size = existing.len() as u64;
                if existing_size >= rsize {
                    Ok(Self::from_shmem(name.to_string(), rsize, existing, false))
                } else {
                    Err(ShmError::SizeConflict {
                        name: name.to_string(),
                        requested: rsize,
                        existing: existing_size,
                    })
                }
            }
            Err(_not_found) => {
                let shm = ShmemConf::new()
                    .os_id(name)
                    .size(rsize as usize)
                    .create()
                    .map_err(map_shmem_err)?;
                Ok(Self::from_shmem(name.to_string(), rsize, shm, false))
            }
        }
    }

    fn from_shmem(name: String, rsize: u64, shm: Shmem, unlink_on_close: bool) -> SharedMemory {
        let size = shm.len() as u64;
        SharedMemory {
            inner: Some(shm),
            name: strip_leading_slash(&name),
            os_id: name,
            rsize,
            size,
            unlink_on_close,
            unlinked: false,
        }
    }

    /// Requests that [`close`](SharedMemory::close) also unlink the
    /// underlying OS object. No-op on platforms without a distinct unlink
    /// step (the last handle's close already removes the object there).
    pub fn with_unlink_on_close(mut self, unlink: bool) -> SharedMemory {
        self.unlink_on_close = unlink;
        self
    }

    /// Canonical name, without any leading `/` (POSIX caller-interop
    /// convention, §4.1).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual allocated size in bytes; may exceed `rsize()` due to page
    /// rounding.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size, in bytes, originally requested at creation/attachment time.
    /// Preserved verbatim for wire round-tripping.
    pub fn rsize(&self) -> u64 {
        self.rsize
    }

    /// Raw byte view of the mapped region (`size()` bytes).
    pub fn as_slice(&self) -> &[u8] {
        match &self.inner {
            Some(shm) => unsafe { std::slice::from_raw_parts(shm.as_ptr(), self.size as usize) },
            None => &[],
        }
    }

    /// Mutable raw byte view of the mapped region (`size()` bytes).
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.inner {
            Some(shm) => unsafe {
                std::slice::from_raw_parts_mut(shm.as_ptr(), self.size as usize)
            },
            None => &mut [],
        }
    }

    /// Unmaps and closes the handle. Idempotent.
    ///
    /// `shared_memory` deletes the OS object on drop for whichever handle
    /// owns it (usually the one that called `create()`); a plain `close()`
    /// must not trigger that, or the close/unlink distinction §4.1
    /// requires would collapse into one operation. So before dropping the
    /// mapping we strip ownership, leaving the OS object in place for any
    /// other attached handle (or a later explicit `unlink()`).
    pub fn close(&mut self) {
        if let Some(mut shm) = self.inner.take() {
            shm.set_owner(false);
        }
    }

    /// Removes the OS object backing this segment, where the platform
    /// distinguishes that from closing. Idempotent per handle.
    ///
    /// Unlike `close()`, this forces ownership before dropping the
    /// mapping so the OS object is actually deleted, regardless of
    /// whether this handle created or merely attached to it (matching
    /// POSIX `shm_unlink`, which any process holding the name may call).
    /// If the handle was already closed, the segment is reopened by name
    /// first so there is still a mapping to force ownership onto.
    pub fn unlink(&mut self) -> Result<(), ShmError> {
        if self.unlinked {
            return Ok(());
        }
        self.unlinked = true;

        let mut shm = match self.inner.take() {
            Some(shm) => shm,
            None => match ShmemConf::new().os_id(&self.os_id).open() {
                Ok(shm) => shm,
                // Already gone (e.g. unlinked by another handle); unlink
                // is idempotent, so this is success, not an error.
                Err(_) => return Ok(()),
            },
        };

        shm.set_owner(true);
        drop(shm);
        Ok(())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.unlink_on_close {
            let _ = self.unlink();
        } else {
            self.close();
        }
    }
}

fn strip_leading_slash(name: &str) -> String {
    name.strip_prefix('/').unwrap_or(name).to_string()
}

fn map_shmem_err(e: ShmemError) -> ShmError {
    match e {
        ShmemError::MappingIdExists => ShmError::AlreadyExists {
            name: String::new(),
        },
        ShmemError::LinkDoesNotExist | ShmemError::MapOpenFailed(_) => ShmError::NotFound {
            name: String::new(),
        },
        other => ShmError::Os(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
    }
}

/// Generates a short, unique segment name: the platform prefix
/// (`/psm_` on POSIX, `wnsm_` on Windows) followed by hex digits taken
/// from a fresh UUID, kept under [`AUTO_NAME_MAX_LEN`] characters total.
fn generate_name() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    let budget = AUTO_NAME_MAX_LEN.saturating_sub(AUTO_NAME_PREFIX.len()).max(4);
    let trimmed: String = uuid.chars().take(budget).collect();

    format!("{AUTO_NAME_PREFIX}{trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_attach_round_trips_name_and_size() {
        let created = SharedMemory::create(None, 64).expect("create");
        let name = created.name().to_string();
        assert!(created.size() >= 64);

        let attached = SharedMemory::attach(&name, 64).expect("attach");
        assert_eq!(attached.name(), name);
        assert!(attached.rsize() >= 64);
    }

    #[test]
    fn attach_missing_segment_fails_not_found() {
        let err = SharedMemory::attach("definitely-not-a-real-segment-xyz", 8).unwrap_err();
        assert!(matches!(err, ShmError::NotFound { .. }));
    }

    #[test]
    fn create_named_smaller_than_existing_reattaches() {
        let name = generate_name();
        let name = name.trim_start_matches('/').to_string();
        let _big = SharedMemory::create(Some(&name), 128).expect("create big");

        // Creating again with the same name and a smaller size just
        // re-attaches, since the existing region already satisfies it.
        let reattached = SharedMemory::create(Some(&name), 16);
        assert!(reattached.is_ok());
    }

    #[test]
    fn writes_are_visible_across_two_handles() {
        let mut a = SharedMemory::create(None, 16).expect("create");
        let name = a.name().to_string();
        a.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);

        let b = SharedMemory::attach(&name, 16).expect("attach");
        assert_eq!(&b.as_slice()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn close_and_unlink_are_idempotent() {
        let mut shm = SharedMemory::create(None, 8).expect("create");
        shm.close();
        shm.close();
        shm.unlink().expect("unlink");
        shm.unlink().expect("unlink again");
    }

    #[test]
    fn close_without_unlink_leaves_the_segment_attachable() {
        let mut shm = SharedMemory::create(None, 32).expect("create");
        let name = shm.name().to_string();

        shm.close();

        let reattached = SharedMemory::attach(&name, 32).expect("segment should still exist");
        assert_eq!(reattached.name(), name);
    }

    #[test]
    fn unlink_on_close_removes_the_os_object() {
        let shm = SharedMemory::create(None, 8).expect("create").with_unlink_on_close(true);
        let name = shm.name().to_string();

        drop(shm);

        let err = SharedMemory::attach(&name, 8).unwrap_err();
        assert!(matches!(err, ShmError::NotFound { .. }));
    }
}
