//! Script-cache-miss recovery.
//!
//! Scripts are executed by SHA. When the server has flushed its script
//! cache (restart, failover, `SCRIPT FLUSH`) the call fails with
//! `NOSCRIPT`; the script is then loaded and the call retried exactly once.

use std::future::Future;

use tracing::warn;

/// Run `exec`; on a script-cache miss, run `load` and retry `exec` once.
///
/// Any other error, and any error from the retry, is returned as is.
pub async fn eval_with_reload<T, E, Exec, ExecFut, Load, LoadFut>(
    mut exec: Exec,
    load: Load,
    is_cache_miss: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    Exec: FnMut() -> ExecFut,
    ExecFut: Future<Output = Result<T, E>>,
    Load: FnOnce() -> LoadFut,
    LoadFut: Future<Output = Result<(), E>>,
{
    match exec().await {
        Err(e) if is_cache_miss(&e) => {
            warn!("Script missing from server cache, reloading");
            load().await?;
            exec().await
        }
        other => other,
    }
}
