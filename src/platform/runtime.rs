use std::future::Future;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

static BACKGROUND_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    let runtime = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("care-sync-background")
        .enable_all()
        .build();
    match runtime {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::error!("failed to build background tokio runtime: {err}");
            None
        }
    }
});

/// Spawns a future that runs in the background, detached from the caller.
///
/// Uses the ambient tokio runtime when one is entered, otherwise a lazily built
/// crate-owned runtime.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        let _ = runtime.spawn(future);
    } else {
        thread::spawn(move || futures::executor::block_on(future));
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}
