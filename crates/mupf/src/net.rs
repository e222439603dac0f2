//! # Network Thread
//!
//! All sockets of an app are served from one OS thread running a
//! current-thread tokio runtime. Application threads never enter the runtime;
//! they hand work over through its [`Handle`] and through channels.

use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;

pub struct NetworkThread {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl NetworkThread {
    /// Starts the thread and waits until its runtime is up.
    pub fn spawn(name: &str) -> Result<Self> {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new().name(name.to_string()).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = handle_tx.send(Err(Error::Io(e.to_string())));
                    return;
                }
            };
            let _ = handle_tx.send(Ok(runtime.handle().clone()));
            runtime.block_on(async {
                let _ = shutdown_rx.await;
            });
            debug!("network runtime stopped");
        })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::Io("network thread exited during startup".into()))??;
        Ok(Self { handle, shutdown: Some(shutdown_tx), thread: Some(thread) })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Stops the runtime and joins the thread. Tasks still running are dropped.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                warn!("network thread asked to join itself");
                return;
            }
            if thread.join().is_err() {
                warn!("network thread panicked");
            }
        }
    }
}

impl Drop for NetworkThread {
    fn drop(&mut self) {
        self.stop();
    }
}
