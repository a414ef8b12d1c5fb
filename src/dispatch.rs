//! Delivery of listener callbacks on one designated execution context.
//!
//! Workers never call listeners directly. They [`post`](Dispatcher::post) closures into a FIFO
//! queue, and whichever thread owns the [`DispatchQueue`] runs them. Jobs run in the order they
//! were posted, which is what puts `on_pre_get` ahead of the terminal callback for a request.

use std::io;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TryRecvError};

type Job = Box<dyn FnOnce() + Send>;

/// Sending half, cloned into every worker.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Job>,
}

/// Receiving half, owned by the designated context.
pub struct DispatchQueue {
    receiver: mpsc::UnboundedReceiver<Job>,
}

pub fn channel() -> (Dispatcher, DispatchQueue) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Dispatcher { sender }, DispatchQueue { receiver })
}

impl Dispatcher {
    /// Queues `job`. Returns false if the queue has been dropped, in which case the job is too.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let posted = self.sender.send(Box::new(job)).is_ok();
        if !posted {
            tracing::debug!("dispatch queue is gone, dropping callback");
        }
        posted
    }
}

impl DispatchQueue {
    /// Runs every job queued right now without waiting. Suited to polling from an event loop.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Waits for and runs the next job. Returns false once every [`Dispatcher`] is gone.
    pub async fn run_next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs jobs until every [`Dispatcher`] is gone.
    pub async fn run(mut self) {
        while self.run_next().await {}
    }

    /// Blocking form of [`run`](Self::run). Must not be called from inside an async context.
    pub fn run_blocking(mut self) {
        while let Some(job) = self.receiver.blocking_recv() {
            job();
        }
    }

    /// Moves the queue onto a dedicated thread that becomes the designated context.
    pub fn spawn_thread(self, name: &str) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || self.run_blocking())
    }
}
