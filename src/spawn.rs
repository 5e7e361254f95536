//! The child spawner: resolves the traced command on `PATH`, creates its task suspended,
//! installs a send-wrapper for its task port as `TASK_KERNEL_PORT`, then resumes it.
//!
//! The goal is to get a task into existence with nothing running in it yet, swap in the
//! interposed kernel port, and only then let any code execute. Darwin gives a tracer no RPC to
//! create a task directly, so the sequence here is `posix_spawn` with
//! `POSIX_SPAWN_START_SUSPENDED` (the child exists but runs nothing), `task_for_pid` to recover
//! its task port, the special-port swap, then `task_resume`. See DESIGN.md for the grounding
//! behind this sequence.

use crate::{
    bucket::Bucket, error::SpawnError, registry::Registry, rewrite, rights::SendRight,
    traits::AsRawName, wrapper::WrapperRef,
};
use mach2::{
    kern_return::KERN_SUCCESS,
    port::mach_port_t,
    task::{task_resume, task_set_special_port},
    task_special_ports::TASK_KERNEL_PORT,
    traps::{mach_task_self, task_for_pid},
};
use std::{
    ffi::{CString, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
    ptr,
};

/// The traced child: its pid (for the caller's wait loop) and the wrapper standing in for its
/// task port.
#[derive(Debug)]
pub struct SpawnedChild {
    /// The child's process id.
    pub pid: libc::pid_t,
    /// The send-wrapper around the child's task port, named `task<pid>`.
    pub task_wrapper: WrapperRef,
}

/// Resolves `command` to an executable path: used as-is if it contains a `/`, otherwise searched
/// for on `PATH`, mirroring a shell's own lookup rule.
fn resolve(command: &std::ffi::OsStr) -> Result<PathBuf, SpawnError> {
    let candidate = Path::new(command);

    if command.as_bytes().contains(&b'/') {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(SpawnError::CommandNotFound(candidate.to_path_buf()))
        };
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(command);
        if full.is_file() {
            return Ok(full);
        }
    }

    Err(SpawnError::CommandNotFound(candidate.to_path_buf()))
}

fn to_cstring(s: &std::ffi::OsStr) -> CString {
    CString::new(s.as_bytes()).expect("argument contains an interior NUL")
}

/// Spawns `command` suspended, installs a send-wrapper for its task port in `registry`/`bucket`,
/// then resumes it. The traced program has not executed a single instruction before the wrapper
/// is in place: every RPC it ever sends from `TASK_KERNEL_PORT` goes through our interposition.
pub fn spawn(
    command: &[OsString],
    registry: &mut Registry,
    bucket: &mut Bucket,
) -> Result<SpawnedChild, SpawnError> {
    let program = resolve(&command[0])?;
    let program_c = to_cstring(program.as_os_str());

    let argv_c: Vec<CString> = command.iter().map(|arg| to_cstring(arg)).collect();
    let mut argv_ptrs: Vec<*mut libc::c_char> = argv_c
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .collect();
    argv_ptrs.push(ptr::null_mut());

    let env_c: Vec<CString> = std::env::vars_os()
        .map(|(key, value)| {
            let mut pair = key.into_vec();
            pair.push(b'=');
            pair.extend(value.into_vec());
            CString::new(pair).expect("environment variable contains an interior NUL")
        })
        .collect();
    let mut envp_ptrs: Vec<*mut libc::c_char> = env_c
        .iter()
        .map(|s| s.as_ptr() as *mut libc::c_char)
        .collect();
    envp_ptrs.push(ptr::null_mut());

    let mut attr: libc::posix_spawnattr_t = unsafe { std::mem::zeroed() };
    unsafe {
        if libc::posix_spawnattr_init(&mut attr) != 0 {
            return Err(SpawnError::PosixSpawn(std::io::Error::last_os_error()));
        }
        if libc::posix_spawnattr_setflags(&mut attr, libc::POSIX_SPAWN_START_SUSPENDED as _) != 0 {
            libc::posix_spawnattr_destroy(&mut attr);
            return Err(SpawnError::PosixSpawn(std::io::Error::last_os_error()));
        }
    }

    let mut pid: libc::pid_t = 0;
    let spawn_result = unsafe {
        libc::posix_spawn(
            &mut pid,
            program_c.as_ptr(),
            ptr::null(),
            &attr,
            argv_ptrs.as_ptr(),
            envp_ptrs.as_ptr(),
        )
    };
    unsafe {
        libc::posix_spawnattr_destroy(&mut attr);
    }

    if spawn_result != 0 {
        return Err(SpawnError::PosixSpawn(std::io::Error::from_raw_os_error(
            spawn_result,
        )));
    }

    let mut child_task: mach_port_t = 0;
    let kr = unsafe { task_for_pid(mach_task_self(), pid, &mut child_task) };
    if kr != KERN_SUCCESS {
        return Err(SpawnError::Kernel {
            operation: "task_for_pid",
            kern_return: kr,
        });
    }

    let real_task = SendRight::from_raw_name(child_task);
    let wrapper = rewrite::wrap_new_forward(real_task, registry, bucket, Some(format!("task<{pid}>")));

    let our_send = wrapper.borrow().make_send();
    let kr = unsafe { task_set_special_port(child_task, TASK_KERNEL_PORT, our_send.as_raw_name()) };
    drop(our_send);
    if kr != KERN_SUCCESS {
        return Err(SpawnError::Kernel {
            operation: "task_set_special_port",
            kern_return: kr,
        });
    }

    let kr = unsafe { task_resume(child_task) };
    if kr != KERN_SUCCESS {
        return Err(SpawnError::Kernel {
            operation: "task_resume",
            kern_return: kr,
        });
    }

    Ok(SpawnedChild {
        pid,
        task_wrapper: wrapper,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_missing_absolute_path() {
        let err = resolve(std::ffi::OsStr::new("/no/such/binary-rpctrace-test")).unwrap_err();
        assert!(matches!(err, SpawnError::CommandNotFound(_)));
    }

    #[test]
    fn test_resolve_finds_on_path() {
        // `sh` is present on every Darwin system this crate targets.
        let resolved = resolve(std::ffi::OsStr::new("sh"));
        assert!(resolved.is_ok());
    }
}
