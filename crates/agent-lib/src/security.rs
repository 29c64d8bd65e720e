//! Scoped acquisition of Linux capability sets.
//!
//! The source's goroutine-local sandbox (raise a capability, run a closure,
//! restore, all pinned to one OS thread so the scheduler can't migrate the
//! elevated flow mid-syscall) becomes a dedicated `std::thread` here: the
//! closure and its result cross the thread boundary over a channel, never
//! through shared mutable state, and the thread exits (dropping the
//! pinning) as soon as the closure returns.

use crate::error::{CollectError, Result};
use caps::{CapSet, Capability};
use std::sync::mpsc;

/// A capability-scoped execution context. Configured once with the
/// capability set an operation needs (e.g. `CAP_SYS_PTRACE` for
/// `perf_event_open` on another process's pid), then reused across scrapes.
#[derive(Clone)]
pub struct SecurityContext {
    capabilities: Vec<Capability>,
}

impl SecurityContext {
    pub fn new(capabilities: Vec<Capability>) -> Self {
        Self { capabilities }
    }

    /// Runs `f` on a freshly spawned, pinned OS thread with `capabilities`
    /// raised in its effective set for the duration of the call. Capability
    /// acquisition failure is fatal to this call only (`CollectError::Security`);
    /// the caller's scrape continues without this operation's result.
    pub fn exec<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let capabilities = self.capabilities.clone();
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name("ceems-secctx".into())
            .spawn(move || {
                let outcome = raise_effective(&capabilities).and_then(|_| f());
                let _ = lower_effective(&capabilities);
                let _ = tx.send(outcome);
            })
            .map_err(|e| CollectError::Security(format!("failed to spawn security context thread: {e}")))?;

        let outcome = rx
            .recv()
            .map_err(|e| CollectError::Security(format!("security context thread exited without a result: {e}")))?;

        if handle.join().is_err() {
            return Err(CollectError::Security("security context thread panicked".into()));
        }

        outcome.map_err(|e| CollectError::Security(e.to_string()))
    }
}

fn raise_effective(capabilities: &[Capability]) -> anyhow::Result<()> {
    for cap in capabilities {
        caps::raise(None, CapSet::Effective, *cap)
            .map_err(|e| anyhow::anyhow!("raising {cap:?} in effective set: {e}"))?;
    }
    Ok(())
}

fn lower_effective(capabilities: &[Capability]) -> anyhow::Result<()> {
    for cap in capabilities {
        caps::drop(None, CapSet::Effective, *cap)
            .map_err(|e| anyhow::anyhow!("dropping {cap:?} from effective set: {e}"))?;
    }
    Ok(())
}

/// Permanently drops root down to `username`'s uid/gid, for
/// `--security.run-as-user` + `--security.drop-privileges`. Looks the user
/// up with the raw `getpwnam` syscall since no higher-level user-lookup
/// crate is already part of the dependency set; `setgid` is called before
/// `setuid` since dropping the uid first would make the gid change fail.
pub fn drop_privileges(username: &str) -> anyhow::Result<()> {
    let name = std::ffi::CString::new(username)?;
    let pwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if pwd.is_null() {
        anyhow::bail!("no such user: {username}");
    }
    let (uid, gid) = unsafe { ((*pwd).pw_uid, (*pwd).pw_gid) };

    if unsafe { libc::setgid(gid) } != 0 {
        anyhow::bail!("setgid({gid}) failed: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        anyhow::bail!("setuid({uid}) failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_closure_and_returns_its_value_without_any_capabilities() {
        // No capabilities requested: raise/lower are no-ops, exercising the
        // thread/channel plumbing in isolation from actual privilege checks
        // (which require root and aren't assumed in a test environment).
        let ctx = SecurityContext::new(vec![]);
        let result = ctx.exec(|| Ok(21 + 21));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn propagates_closure_error() {
        let ctx = SecurityContext::new(vec![]);
        let result: Result<()> = ctx.exec(|| anyhow::bail!("boom"));
        assert!(matches!(result, Err(CollectError::Security(_))));
    }
}
