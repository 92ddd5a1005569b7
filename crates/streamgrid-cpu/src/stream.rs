//! Stream workers.
//!
//! Each stream is a dedicated thread draining a crossbeam channel of
//! commands in submission order. An asynchronous failure is sticky: later
//! commands on the stream are skipped until the next barrier reports and
//! clears it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, unbounded, Sender};
use tracing::{debug, trace};

use streamgrid_core::device::{HostSlice, HostSliceMut};
use streamgrid_core::error::{DeviceError, DeviceResult};

use crate::kernels::{self, ResolvedLaunch};
use crate::memory::DeviceMemory;

/// Work queued on a stream.
pub(crate) enum Command {
    CopyToDevice {
        dst: Arc<DeviceMemory>,
        offset: usize,
        src: HostSlice,
    },
    CopyToHost {
        src: Arc<DeviceMemory>,
        offset: usize,
        dst: HostSliceMut,
    },
    Launch {
        launch: Box<ResolvedLaunch>,
        inject_failure: bool,
    },
    Barrier(Sender<Option<DeviceError>>),
}

/// Handle to one stream's worker thread.
pub(crate) struct StreamWorker {
    index: usize,
    sender: Option<Sender<Command>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Start a worker for the stream with creation index `index`.
    pub(crate) fn spawn(index: usize) -> DeviceResult<Self> {
        let (sender, receiver) = unbounded::<Command>();
        let handle = thread::Builder::new()
            .name(format!("streamgrid-stream-{}", index))
            .spawn(move || {
                let mut sticky: Option<DeviceError> = None;
                for command in receiver.iter() {
                    if let Command::Barrier(reply) = command {
                        // The waiter may have given up; nothing to report to then.
                        let _ = reply.send(sticky.take());
                        continue;
                    }
                    if sticky.is_some() {
                        continue;
                    }
                    if let Err(err) = run(command) {
                        debug!(stream = index, error = %err, "Stream entered error state");
                        sticky = Some(err);
                    }
                }
                trace!(stream = index, "Stream worker exiting");
            })
            .map_err(|e| DeviceError::Stream(format!("failed to spawn stream worker: {}", e)))?;

        Ok(Self {
            index,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Creation index.
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Sender for enqueueing commands.
    pub(crate) fn sender(&self) -> DeviceResult<Sender<Command>> {
        self.sender
            .clone()
            .ok_or_else(|| DeviceError::Stream(format!("stream {} is shut down", self.index)))
    }

    /// Stop accepting work and join the thread after it drains its queue.
    pub(crate) fn shutdown(&mut self) -> DeviceResult<()> {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let index = self.index;
            handle
                .join()
                .map_err(|_| DeviceError::Stream(format!("stream {} worker panicked", index)))?;
        }
        Ok(())
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Enqueue a barrier on `sender` and wait for it, returning the sticky error.
pub(crate) fn barrier(index: usize, sender: &Sender<Command>) -> DeviceResult<()> {
    let (reply, wait) = bounded(1);
    sender
        .send(Command::Barrier(reply))
        .map_err(|_| DeviceError::Stream(format!("stream {} is gone", index)))?;
    match wait.recv() {
        Ok(None) => Ok(()),
        Ok(Some(err)) => Err(err),
        Err(_) => Err(DeviceError::Stream(format!(
            "stream {} worker stopped before the barrier",
            index
        ))),
    }
}

fn run(command: Command) -> DeviceResult<()> {
    match command {
        // SAFETY (both copies): the issuer keeps host memory alive and
        // unaliased until this stream is synchronized, and device regions
        // of concurrent streams are disjoint.
        Command::CopyToDevice { dst, offset, src } => unsafe { dst.write(offset, src.as_slice()) }
            .map_err(|e| DeviceError::Transfer(e.to_string())),
        Command::CopyToHost { src, offset, dst } => unsafe { src.read(offset, dst.as_mut_slice()) }
            .map_err(|e| DeviceError::Transfer(e.to_string())),
        Command::Launch {
            launch,
            inject_failure,
        } => {
            if inject_failure {
                return Err(DeviceError::Launch(format!(
                    "injected failure in {} launch at offset {}",
                    launch.launch.kind(),
                    launch.launch.chunk.offset
                )));
            }
            kernels::execute(&launch)
        }
        Command::Barrier(_) => Ok(()),
    }
}
