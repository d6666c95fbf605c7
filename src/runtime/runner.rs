//! Coordinates the watcher lifecycle and handles OS signals for graceful
//! shutdowns.

use crate::exec::CancelHandle;
use crate::watcher::{BlockProcessor, Watcher};
use anyhow::Result;
use tokio::signal;

pub struct Runner<P: BlockProcessor> {
    watcher: Watcher<P>,
    cancel: CancelHandle,
    started: bool,
}

impl<P: BlockProcessor> Runner<P> {
    /// Wraps a watcher, adopting its root cancellation handle so external
    /// callers can integrate their own shutdown triggers.
    pub fn new(watcher: Watcher<P>) -> Self {
        let cancel = watcher.cancel_handle();
        Self {
            watcher,
            cancel,
            started: false,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn watcher(&self) -> &Watcher<P> {
        &self.watcher
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.watcher.start()?;
        self.started = true;
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.cancel.abort();
        self.watcher.stop().await?;
        self.started = false;
        Ok(())
    }

    /// Runs until Ctrl-C (SIGINT) is received or the cancellation handle
    /// is aborted elsewhere, then stops the watcher gracefully.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.cancel.aborted() => {
                tracing::info!("runner cancellation handle aborted");
            }
        }

        self.cancel.abort();
        self.watcher.stop().await?;
        self.started = false;
        Ok(())
    }
}
