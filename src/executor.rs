//! Single-threaded `mio` reactor that also accepts cross-thread work,
//! generalized from `neutronium::net::endpoint::Endpoint`'s `mio::Poll` +
//! `mio::Events` loop into a connection-agnostic `Executor<C>`.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::{Evented, Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

pub(crate) const JOB_TOKEN: Token = Token(usize::max_value());

/// Work posted onto the executor's owning thread. Closures capture only the
/// `Send` data they need (ids, messages); the registry/connection state
/// they mutate lives exclusively on the executor thread, so no
/// `Arc<Mutex<Connection>>` is ever required.
pub(crate) type Job<C> = Box<dyn FnOnce(&mut C) + Send>;

pub(crate) struct Executor<C> {
    poll: Poll,
    jobs: Arc<Mutex<VecDeque<Job<C>>>>,
    set_readiness: SetReadiness,
    _job_source: Registration,
    running: Arc<AtomicBool>,
}

pub(crate) struct ExecutorHandle<C> {
    jobs: Arc<Mutex<VecDeque<Job<C>>>>,
    set_readiness: SetReadiness,
    running: Arc<AtomicBool>,
}

impl<C> Clone for ExecutorHandle<C> {
    fn clone(&self) -> Self {
        ExecutorHandle {
            jobs: self.jobs.clone(),
            set_readiness: self.set_readiness.clone(),
            running: self.running.clone(),
        }
    }
}

impl<C> Executor<C> {
    pub fn new() -> io::Result<Executor<C>> {
        let poll = Poll::new()?;
        let (registration, set_readiness) = Registration::new2();
        poll.register(&registration, JOB_TOKEN, Ready::readable(), PollOpt::edge())?;
        Ok(Executor {
            poll,
            jobs: Arc::new(Mutex::new(VecDeque::new())),
            set_readiness,
            _job_source: registration,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn register(&self, source: &dyn Evented, token: Token, interest: Ready) -> io::Result<()> {
        self.poll.register(source, token, interest, PollOpt::edge())
    }

    pub fn deregister(&self, source: &dyn Evented) -> io::Result<()> {
        self.poll.deregister(source)
    }

    pub fn handle(&self) -> ExecutorHandle<C> {
        ExecutorHandle {
            jobs: self.jobs.clone(),
            set_readiness: self.set_readiness.clone(),
            running: self.running.clone(),
        }
    }

    /// Runs the reactor loop on the calling thread until a handle calls
    /// `stop()`. `on_event` fires for every non-job readiness event; posted
    /// jobs are drained in between. Returns `context` once stopped, so the
    /// caller can inspect or drop it cleanly after `join()`.
    pub fn run<F>(self, mut context: C, mut on_event: F) -> C
    where
        F: FnMut(&mut C, &Executor<C>, Token, Ready),
    {
        let mut events = Events::with_capacity(1024);
        while self.running.load(Ordering::Acquire) {
            if self
                .poll
                .poll(&mut events, Some(Duration::from_millis(250)))
                .is_err()
            {
                break;
            }

            for event in &events {
                if event.token() == JOB_TOKEN {
                    self.drain_jobs(&mut context);
                } else {
                    on_event(&mut context, &self, event.token(), event.readiness());
                }
            }
        }
        context
    }

    fn drain_jobs(&self, context: &mut C) {
        loop {
            let job = self.jobs.lock().unwrap().pop_front();
            match job {
                Some(job) => job(context),
                None => break,
            }
        }
    }
}

impl<C> ExecutorHandle<C> {
    pub fn post(&self, job: Job<C>) {
        self.jobs.lock().unwrap().push_back(job);
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.set_readiness.set_readiness(Ready::readable());
    }
}
