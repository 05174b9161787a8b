//! Local user lookups

use std::path::PathBuf;

/// Name of the user this process runs as
pub fn current_username() -> String {
    whoami::username()
}

/// Home directory of `user`, or of the current user when `None`
pub fn home_dir(user: Option<&str>) -> Option<PathBuf> {
    match user {
        None => dirs::home_dir(),
        Some(name) if name == current_username() => dirs::home_dir(),
        Some(name) => passwd_entry(name).map(|entry| entry.home),
    }
}

/// Login shell of `user`, falling back to `$SHELL` and then `/bin/sh`
pub fn login_shell(user: Option<&str>) -> String {
    let name = user.map(str::to_string).unwrap_or_else(current_username);
    if let Some(shell) = passwd_entry(&name)
        .map(|entry| entry.shell)
        .filter(|shell| !shell.is_empty())
    {
        return shell;
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    if std::path::Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

struct PasswdEntry {
    home: PathBuf,
    shell: String,
}

#[cfg(unix)]
fn passwd_entry(name: &str) -> Option<PasswdEntry> {
    use std::ffi::{CStr, CString, OsStr};
    use std::os::unix::ffi::OsStrExt;

    let c_name = CString::new(name).ok()?;
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    // SAFETY: passwd is plain old data; getpwnam_r fills it in or leaves result null.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: every pointer is valid for the duration of the call and buf.len() is its size.
    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_dir.is_null() {
        return None;
    }

    // SAFETY: on success pw_dir and pw_shell point into buf, which is still alive.
    let home = unsafe { CStr::from_ptr(pwd.pw_dir) };
    let shell = if pwd.pw_shell.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(pwd.pw_shell) }
            .to_string_lossy()
            .into_owned()
    };

    Some(PasswdEntry {
        home: PathBuf::from(OsStr::from_bytes(home.to_bytes())),
        shell,
    })
}

#[cfg(not(unix))]
fn passwd_entry(_name: &str) -> Option<PasswdEntry> {
    None
}
