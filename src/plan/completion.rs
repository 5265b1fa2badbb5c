//! One-shot completion signals.
//!
//! Every node owns a [`Completion`] that resolves exactly once, successfully
//! or with an error. The plan's own signal is [`Completion::all`] over its
//! nodes. Waiting never blocks a worker: callers either register a
//! callback, await the signal, or block their own thread with
//! [`Completion::wait_timeout`].

use crate::error::{ExecError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce(&Result<()>) + Send>;

#[derive(Default)]
struct State {
    result: Option<Result<()>>,
    callbacks: Vec<Callback>,
    wakers: Vec<Waker>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Cloneable handle to a single-resolution result.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that is already resolved.
    pub fn finished(result: Result<()>) -> Self {
        let completion = Self::new();
        completion.mark_finished(result);
        completion
    }

    /// Resolve the signal. Returns `false` if it was already resolved, in
    /// which case `result` is dropped.
    ///
    /// Callbacks run on the calling thread after the internal lock is
    /// released.
    pub fn mark_finished(&self, result: Result<()>) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.inner.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        self.inner.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    pub fn result(&self) -> Option<Result<()>> {
        self.inner.state.lock().result.clone()
    }

    /// Run `f` once resolved; immediately if that has already happened.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<()>) + Send + 'static,
    {
        let result = {
            let mut state = self.inner.state.lock();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.callbacks.push(Box::new(f));
                    return;
                }
            }
        };
        f(&result);
    }

    /// A future resolving with this signal's result.
    pub fn wait(&self) -> CompletionFuture {
        CompletionFuture {
            inner: self.inner.clone(),
        }
    }

    /// Block the current thread for up to `timeout`. `None` if the signal is
    /// still pending afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.result.is_none() {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.result.clone()
    }

    /// Resolves once every input has resolved. The result is the error of
    /// the first failed input in slice order, or ok.
    pub fn all(completions: &[Completion]) -> Completion {
        let out = Completion::new();
        if completions.is_empty() {
            out.mark_finished(Ok(()));
            return out;
        }
        let remaining = Arc::new(AtomicUsize::new(completions.len()));
        let errors: Arc<Mutex<Vec<Option<ExecError>>>> =
            Arc::new(Mutex::new(vec![None; completions.len()]));
        for (index, completion) in completions.iter().enumerate() {
            let remaining = remaining.clone();
            let errors = errors.clone();
            let out = out.clone();
            completion.on_complete(move |result| {
                if let Err(err) = result {
                    errors.lock()[index] = Some(err.clone());
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let first = errors.lock().iter().flatten().next().cloned();
                    out.mark_finished(first.map_or(Ok(()), Err));
                }
            });
        }
        out
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("result", &self.result())
            .finish()
    }
}

impl IntoFuture for Completion {
    type Output = Result<()>;
    type IntoFuture = CompletionFuture;

    fn into_future(self) -> CompletionFuture {
        self.wait()
    }
}

/// Future returned by [`Completion::wait`].
pub struct CompletionFuture {
    inner: Arc<Inner>,
}

impl Future for CompletionFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(result) = &state.result {
            return Poll::Ready(result.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_first_result_wins() {
        let c = Completion::new();
        assert!(!c.is_finished());
        assert!(c.mark_finished(Err(ExecError::invalid("first"))));
        assert!(!c.mark_finished(Ok(())));
        assert_eq!(c.result(), Some(Err(ExecError::invalid("first"))));
    }

    #[test]
    fn test_on_complete_before_and_after() {
        let c = Completion::new();
        let before = Arc::new(AtomicBool::new(false));
        let flag = before.clone();
        c.on_complete(move |r| flag.store(r.is_ok(), Ordering::SeqCst));
        assert!(!before.load(Ordering::SeqCst));
        c.mark_finished(Ok(()));
        assert!(before.load(Ordering::SeqCst));

        let after = Arc::new(AtomicBool::new(false));
        let flag = after.clone();
        c.on_complete(move |_| flag.store(true, Ordering::SeqCst));
        assert!(after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_all_reports_first_error_in_discovery_order() {
        let parts: Vec<Completion> = (0..3).map(|_| Completion::new()).collect();
        let all = Completion::all(&parts);
        parts[2].mark_finished(Err(ExecError::invalid("late but first in time")));
        parts[0].mark_finished(Ok(()));
        assert!(!all.is_finished());
        parts[1].mark_finished(Err(ExecError::Io("second slot".to_string())));
        assert_eq!(all.result(), Some(Err(ExecError::Io("second slot".to_string()))));
    }

    #[test]
    fn test_all_of_nothing_is_ok() {
        assert_eq!(Completion::all(&[]).result(), Some(Ok(())));
    }

    #[test]
    fn test_wait_future_and_timeout() {
        let c = Completion::new();
        assert_eq!(c.wait_timeout(Duration::from_millis(10)), None);

        let remote = c.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.mark_finished(Ok(()));
        });
        assert_eq!(futures::executor::block_on(c.wait()), Ok(()));
        handle.join().unwrap();
        assert_eq!(c.wait_timeout(Duration::from_millis(1)), Some(Ok(())));
    }
}
