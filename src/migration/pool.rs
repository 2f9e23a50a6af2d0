//! Fixed-size worker pool draining a FIFO job queue.
//!
//! One mutex guards the queue and the working count; `work_available` wakes
//! sleeping workers, `all_idle` wakes callers of [WorkerPool::wait]. A
//! caller observing `wait` returning knows every previously submitted job
//! has finished.

use std::{collections::VecDeque, sync::Arc, thread::JoinHandle};

use parking_lot::{Condvar, Mutex};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Job>,
    working: usize,
    stop: bool,
}

struct Shared {
    state: Mutex<State>,
    work_available: Condvar,
    all_idle: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `num` workers; a pool smaller than two threads is promoted to
    /// two.
    pub fn new(num: usize) -> std::io::Result<WorkerPool> {
        let num = num.max(2);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                working: 0,
                stop: false,
            }),
            work_available: Condvar::new(),
            all_idle: Condvar::new(),
        });
        let mut handles = Vec::with_capacity(num);
        for i in 0..num {
            let worker = std::thread::Builder::new()
                .name(format!("migration-worker-{}", i))
                .spawn({
                    let shared = Arc::clone(&shared);
                    move || worker_main(shared)
                });
            match worker {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.state.lock().stop = true;
                    shared.work_available.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("migration worker pool of {} threads up", num);
        Ok(WorkerPool {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Appends a job and wakes one worker.
    pub fn submit(&self, job: Job) {
        let mut state = self.shared.state.lock();
        if state.stop {
            return;
        }
        state.queue.push_back(job);
        drop(state);
        self.shared.work_available.notify_one();
    }

    /// Blocks until the queue is empty and no worker is inside a job.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.working != 0 || !state.queue.is_empty() {
            self.shared.all_idle.wait(&mut state);
        }
    }

    /// Drops all pending jobs unexecuted, stops the workers and joins them.
    /// Jobs already running finish first. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.queue.clear();
            state.stop = true;
        }
        self.shared.work_available.notify_all();
        self.shared.all_idle.notify_all();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.stop {
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    state.working += 1;
                    break job;
                }
                shared.work_available.wait(&mut state);
            }
        };

        job();

        let mut state = shared.state.lock();
        state.working -= 1;
        if state.working == 0 && state.queue.is_empty() {
            shared.all_idle.notify_all();
        }
    }
}
