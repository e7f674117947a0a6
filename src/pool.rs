// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Small shared-queue worker pool
///
/// Used to release node kvset lists off the teardown path, since the
/// last reference drop may trigger block deletion I/O.
pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();

        let workers = (0..threads.max(1))
            .map(|idx| {
                let rx: Receiver<Job> = rx.clone();

                std::thread::Builder::new()
                    .name(format!("kvset-tree-destroy-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        log::trace!("destroy worker exits");
                    })
                    .expect("should spawn destroy worker")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(Box::new(job)) {
                log::warn!("destroy pool is gone, running job inline");
                (e.into_inner())();
            }
        }
    }

    /// Waits for every submitted job to finish and stops the workers.
    pub fn join(mut self) {
        // Closing the channel lets the workers drain and exit
        self.tx = None;

        for worker in std::mem::take(&mut self.workers) {
            if worker.join().is_err() {
                log::error!("destroy worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx = None;

        for worker in std::mem::take(&mut self.workers) {
            let _ = worker.join();
        }
    }
}
