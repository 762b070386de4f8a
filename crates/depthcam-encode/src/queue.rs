//! A bounded, single-worker job queue.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};

/// Runs jobs one at a time, in submission order, on a dedicated thread.
pub struct SerialQueue<T: Send + 'static> {
    name: String,
    tx: Option<Sender<T>>,
    worker: Option<JoinHandle<()>>,
}

/// Why a job was not queued.
#[derive(Debug)]
pub enum Rejected<T> {
    Full(T),
    Closed(T),
}

impl<T> Rejected<T> {
    pub fn into_inner(self) -> T {
        match self {
            Rejected::Full(job) | Rejected::Closed(job) => job,
        }
    }
}

impl<T: Send + 'static> SerialQueue<T> {
    /// Spawn a worker that feeds each job to `handler`. At most `depth` jobs
    /// wait at any time.
    pub fn spawn<F>(name: impl Into<String>, depth: usize, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = bounded::<T>(depth.max(1));
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in rx.iter() {
                    handler(job);
                }
            })?;
        Ok(Self {
            name,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue without blocking.
    pub fn try_submit(&self, job: T) -> Result<(), Rejected<T>> {
        let Some(tx) = &self.tx else {
            return Err(Rejected::Closed(job));
        };
        tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(job) => Rejected::Full(job),
            TrySendError::Disconnected(job) => Rejected::Closed(job),
        })
    }

    /// Queue, waiting for room. Used for control jobs that must not be lost.
    pub fn submit(&self, job: T) -> Result<(), Rejected<T>> {
        let Some(tx) = &self.tx else {
            return Err(Rejected::Closed(job));
        };
        tx.send(job).map_err(|e| Rejected::Closed(e.into_inner()))
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    /// Stop accepting jobs, drain what is queued and join the worker.
    pub fn close(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("{} worker panicked", self.name);
            }
        }
    }
}

impl<T: Send + 'static> Drop for SerialQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_jobs_run_in_order() {
        let (out_tx, out_rx) = unbounded();
        let mut queue = SerialQueue::spawn("order", 8, move |n: u32| {
            out_tx.send(n).unwrap();
        })
        .unwrap();
        for n in 0..100 {
            queue.submit(n).unwrap();
        }
        queue.close();
        let seen: Vec<u32> = out_rx.try_iter().collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let gate = Arc::new(Barrier::new(2));
        let worker_gate = Arc::clone(&gate);
        let queue = SerialQueue::spawn("full", 1, move |first: bool| {
            if first {
                worker_gate.wait();
            }
        })
        .unwrap();

        queue.submit(true).unwrap();
        // Wait until the worker has taken the first job off the channel.
        while queue.pending() > 0 {
            std::thread::yield_now();
        }
        queue.try_submit(false).unwrap();
        assert!(matches!(queue.try_submit(false), Err(Rejected::Full(false))));
        gate.wait();
    }

    #[test]
    fn test_closed_queue_returns_job() {
        let mut queue = SerialQueue::spawn("closed", 1, |_: u8| {}).unwrap();
        queue.close();
        assert_eq!(queue.try_submit(9).unwrap_err().into_inner(), 9);
        assert!(matches!(queue.submit(3), Err(Rejected::Closed(3))));
    }
}
