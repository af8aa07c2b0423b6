//! Loop supervision and shutdown signalling.
//!
//! Each long-running loop runs on its own task. When it ends, for any reason,
//! a [`LoopExit`] is sent on a one-shot completion channel; [`supervise`]
//! waits on that channel and restarts the loop unless shutdown was requested.

use crate::error::LoopError;
use std::any::Any;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

/// How a supervised loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Returned normally, which loops only do on shutdown.
    Shutdown,
    /// Returned an error.
    Failed(String),
    /// Panicked.
    Panicked(String),
}

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns `true` if the caller should keep running. A dropped shutdown sender
/// counts as shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `fut` on its own task and report how it ended on a one-shot channel.
pub fn spawn_loop<F>(name: &'static str, fut: F) -> oneshot::Receiver<LoopExit>
where
    F: Future<Output = Result<(), LoopError>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        let exit = match handle.await {
            Ok(Ok(())) => LoopExit::Shutdown,
            Ok(Err(e)) => LoopExit::Failed(e.to_string()),
            Err(e) if e.is_panic() => LoopExit::Panicked(panic_message(e.into_panic())),
            Err(e) => LoopExit::Failed(format!("task cancelled: {e}")),
        };
        if tx.send(exit).is_err() {
            warn!(loop_name = name, "Nobody is waiting for loop completion");
        }
    });
    rx
}

/// Keep a loop running until shutdown. Returns the number of restarts.
///
/// `make` builds a fresh loop future for every (re)start.
pub async fn supervise<M, F>(
    name: &'static str,
    restart_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut make: M,
) -> u32
where
    M: FnMut() -> F,
    F: Future<Output = Result<(), LoopError>> + Send + 'static,
{
    let mut restarts = 0u32;
    loop {
        let exit = spawn_loop(name, make())
            .await
            .unwrap_or_else(|_| LoopExit::Failed("completion channel dropped".to_string()));

        match exit {
            LoopExit::Shutdown => {
                info!(loop_name = name, restarts, "Loop stopped");
                return restarts;
            }
            LoopExit::Failed(reason) => {
                error!(loop_name = name, reason = %reason, "Loop terminated with error");
            }
            LoopExit::Panicked(reason) => {
                error!(loop_name = name, reason = %reason, "Loop panicked");
            }
        }

        if !sleep_or_shutdown(restart_delay, &mut shutdown).await {
            info!(loop_name = name, restarts, "Shutdown requested, not restarting");
            return restarts;
        }
        restarts += 1;
        warn!(loop_name = name, restarts, "Restarting loop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_spawn_loop_reports_exit_kinds() {
        let exit = spawn_loop("ok", async { Ok::<(), LoopError>(()) })
            .await
            .unwrap();
        assert_eq!(exit, LoopExit::Shutdown);

        let exit = spawn_loop("err", async {
            Err::<(), LoopError>(LoopError::Ledger(LedgerError::Corrupt("bad".into())))
        })
        .await
        .unwrap();
        assert!(matches!(exit, LoopExit::Failed(r) if r.contains("bad")));

        let exit = spawn_loop("panic", async {
            if true {
                panic!("boom");
            }
            Ok::<(), LoopError>(())
        })
        .await
        .unwrap();
        assert_eq!(exit, LoopExit::Panicked("boom".to_string()));
    }

    #[tokio::test]
    async fn test_supervise_restarts_after_panic() {
        let (_tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicU32::new(0));

        let counter = runs.clone();
        let restarts = supervise("flaky", Duration::from_millis(10), rx, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("transient failure");
                }
                Ok::<(), LoopError>(())
            }
        })
        .await;

        assert_eq!(restarts, 2);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_supervise_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let restarts = supervise("failing", Duration::from_secs(60), rx, || async {
            Err::<(), LoopError>(LoopError::Ledger(LedgerError::Corrupt("x".into())))
        })
        .await;
        assert_eq!(restarts, 0);
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(sleep_or_shutdown(Duration::from_millis(1), &mut rx).await);

        let waiter = tokio::spawn(async move {
            sleep_or_shutdown(Duration::from_secs(60), &mut rx).await
        });
        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }
}
