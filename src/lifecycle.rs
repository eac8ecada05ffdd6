//! Process lifecycle: make sure the pool is shut down on termination signals.

use std::future::Future;

use tracing::info;

use crate::pool::ConnectionPool;

/// Resolves when the process receives ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Run `work` until it completes or `signal` fires, then shut the pool down.
///
/// Returns the work's output, or `None` if the signal won.
pub async fn run_until<W, S, T>(pool: &ConnectionPool, work: W, signal: S) -> Option<T>
where
    W: Future<Output = T>,
    S: Future<Output = ()>,
{
    let output = tokio::select! {
        output = work => Some(output),
        _ = signal => {
            info!("Shutdown signal received");
            None
        }
    };

    pool.shutdown().await;
    output
}

/// [`run_until`] driven by [`shutdown_signal`].
pub async fn run_until_signal<W, T>(pool: &ConnectionPool, work: W) -> Option<T>
where
    W: Future<Output = T>,
{
    run_until(pool, work, shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testkit;
    use crate::testkit::connector::MockConnector;

    #[tokio::test]
    async fn signal_shuts_pool_down() {
        let pool = ConnectionPool::new(testkit::config::pool(2), MockConnector::new()).unwrap();
        pool.acquire("a").await.unwrap();

        let output = run_until(
            &pool,
            std::future::pending::<()>(),
            tokio::time::sleep(Duration::from_millis(10)),
        )
        .await;

        assert!(output.is_none());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn completed_work_still_shuts_pool_down() {
        let pool = ConnectionPool::new(testkit::config::pool(2), MockConnector::new()).unwrap();
        let worker = pool.clone();

        let output = run_until(
            &pool,
            async move { worker.acquire("a").await.map(|h| h.connection_id()) },
            std::future::pending::<()>(),
        )
        .await;

        assert_eq!(output, Some(Ok(1)));
        assert_eq!(pool.stats().total, 0);
    }
}
