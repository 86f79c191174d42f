//! The environment writer seam.
//!
//! Parameter and env parsing deliberately side-effect the process
//! environment so later entries and later steps can interpolate earlier
//! ones. Routing every write and every expansion through this module keeps
//! that behavior in one place, so tests can sandbox it by re-pointing the
//! variables they touch.

use crate::error::{Error, Result};
use std::process::Command;

/// Export a variable into the process environment.
pub fn set_var(key: &str, value: &str) {
    std::env::set_var(key, value);
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
/// Unknown variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&(_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(&(_, c2)) if c2.is_ascii_alphanumeric() || c2 == '_' => {
                let mut name = String::new();
                while let Some(&(_, c2)) = chars.peek() {
                    if c2.is_ascii_alphanumeric() || c2 == '_' {
                        name.push(c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Expand a value that may contain backtick command substitutions in
/// addition to `${VAR}` references. Each `` `cmd` `` segment is run under
/// `sh -c` and replaced with its trimmed stdout.
pub fn eval_value(input: &str) -> Result<String> {
    let expanded = expand_env(input);
    if !expanded.contains('`') {
        return Ok(expanded);
    }

    let mut out = String::with_capacity(expanded.len());
    let mut rest = expanded.as_str();
    while let Some(start) = rest.find('`') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('`') {
            Some(end) => {
                out.push_str(&run_subcommand(&after[..end])?);
                rest = &after[end + 1..];
            }
            None => {
                // unmatched backtick, keep it literal
                out.push('`');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn run_subcommand(cmd: &str) -> Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .map_err(|e| Error::Other(format!("command substitution `{cmd}` failed: {e}")))?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    // Process env and $HOME are global; tests that touch them serialize here.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
