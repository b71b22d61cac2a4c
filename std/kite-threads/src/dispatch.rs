//!
//! Dispatch Broker
//!
//! Runs a job against a transferred argument and parks the outcome under a
//! caller-chosen callback id until the submitter pulls it.
//!
//! Job lifecycle:
//!
//! ```text
//! Submitted -> Running -> Completed | Faulted -> Delivered
//! ```
//!
//! `Delivered` means the completion thread has told the listener that the
//! result is ready. The state entry is dropped once the result is pulled.
//!
//! A job that fails (returns a fault or panics) never reaches the submitter:
//! the fault goes to the broker's `FaultReporter` and an empty result is
//! stored so the callback id still resolves.
//!

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use kite_core::{
    fault_set, fault_take, transfer, Fault, FaultReporter, HeapObject, ManagedRef, StablePtr, Transfer,
    TransferMode, TracingReporter, FAULT_TYPE_INVALID_STATE,
};
use kite_handles::{Handle, HandleError, HandleTable};

use crate::error::AccessError;
use crate::queue::CompletionQueue;

/// Signature of a job body exported by the host. The argument is borrowed
/// for the duration of the call; the returned reference (or null) is owned
/// by the caller.
pub type ForeignJobFn = unsafe extern "C" fn(*const HeapObject) -> *const HeapObject;

type JobBody = Box<dyn FnOnce(ManagedRef) -> Result<Option<ManagedRef>, Fault> + Send>;

/// Callback run on the completion thread when a result becomes available.
pub type CompletionListener = Arc<dyn Fn(Handle) + Send + Sync>;

pub struct Job(JobBody);

impl Job {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(ManagedRef) -> Result<Option<ManagedRef>, Fault> + Send + 'static,
    {
        Job(Box::new(body))
    }

    /// Wrap a host function. A fault the host leaves in the thread's fault
    /// slot during the call counts as the job failing; a fault pending before
    /// the call is restored once it returns.
    pub fn from_foreign(func: ForeignJobFn) -> Self {
        Job::new(move |argument| {
            // A fault already pending on this thread belongs to the host,
            // not to the job. Set it aside and put it back afterwards.
            let pending = fault_take();

            let raw = argument.into_raw();
            let produced = unsafe { func(raw) };
            // SAFETY: `raw` came from `into_raw` above and was only lent out.
            drop(unsafe { ManagedRef::from_raw(raw) });

            let produced = if produced.is_null() {
                None
            } else {
                // SAFETY: the host hands back an owned reference.
                Some(unsafe { ManagedRef::from_raw(produced) })
            };

            let outcome = match fault_take() {
                Some(fault) => Err(fault),
                None => Ok(produced),
            };
            if let Some(pending) = pending {
                fault_set(pending);
            }
            outcome
        })
    }

    fn run(self, argument: ManagedRef) -> Result<Option<ManagedRef>, Fault> {
        (self.0)(argument)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Job")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Faulted,
    Delivered,
}

type StateMap = Arc<Mutex<HashMap<Handle, JobState>>>;

fn lock_states(states: &StateMap) -> MutexGuard<'_, HashMap<Handle, JobState>> {
    states.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct DispatchBroker {
    results: HandleTable<StablePtr>,
    states: StateMap,
    reporter: Arc<dyn FaultReporter>,
    listener: CompletionListener,
    completions: CompletionQueue,
}

impl DispatchBroker {
    /// Broker that logs faults and logs completions.
    pub fn new() -> Result<Self, AccessError> {
        Self::with_reporter(Arc::new(TracingReporter))
    }

    pub fn with_reporter(reporter: Arc<dyn FaultReporter>) -> Result<Self, AccessError> {
        let listener: CompletionListener = Arc::new(|callback_id| {
            tracing::debug!(%callback_id, "result ready");
        });
        Self::with_listener(reporter, listener)
    }

    pub fn with_listener(
        reporter: Arc<dyn FaultReporter>,
        listener: CompletionListener,
    ) -> Result<Self, AccessError> {
        Ok(Self {
            results: HandleTable::new("result"),
            states: Arc::new(Mutex::new(HashMap::new())),
            reporter,
            listener,
            completions: CompletionQueue::new("kite-completion")?,
        })
    }

    /// Reserve a callback id that no other dispatch through this broker
    /// will hand out.
    pub fn next_callback_id(&self) -> Result<Handle, HandleError> {
        self.results.reserve()
    }

    fn set_state(&self, callback_id: Handle, state: JobState) {
        lock_states(&self.states).insert(callback_id, state);
    }

    pub fn state(&self, callback_id: Handle) -> Option<JobState> {
        lock_states(&self.states).get(&callback_id).copied()
    }

    fn report(&self, callback_id: Handle, fault: Fault) {
        tracing::warn!(%callback_id, %fault, "job faulted");
        self.reporter.report(&fault);
    }

    /// Run `job` on the calling thread against the object `producer` builds,
    /// store the outcome under `callback_id` and queue a completion notice.
    ///
    /// Only a rejected argument transfer or a shut-down broker is returned
    /// to the caller; job faults go to the reporter. Nothing runs and nothing
    /// is stored when an error is returned.
    pub fn dispatch<P>(
        &self,
        mode: TransferMode,
        producer: P,
        job: Job,
        callback_id: Handle,
    ) -> Result<(), AccessError>
    where
        P: FnOnce() -> ManagedRef,
    {
        if self.completions.is_shutdown() {
            return Err(AccessError::QueueClosed);
        }
        let argument = transfer(producer(), mode).into_result()?;
        self.set_state(callback_id, JobState::Submitted);
        tracing::trace!(%callback_id, ?mode, "job submitted");

        self.set_state(callback_id, JobState::Running);
        let argument = argument.adopt();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || job.run(argument)))
            .unwrap_or_else(|payload| Err(Fault::from_panic(payload)));

        let stored = match outcome {
            Ok(Some(produced)) => match transfer(produced, mode) {
                Transfer::Transferred(token) => Some(token),
                Transfer::Rejected(reason) => {
                    self.report(
                        callback_id,
                        Fault::new(FAULT_TYPE_INVALID_STATE, format!("Illegal transfer state: {reason}")),
                    );
                    self.set_state(callback_id, JobState::Faulted);
                    None
                }
            },
            Ok(None) => None,
            Err(fault) => {
                self.report(callback_id, fault);
                self.set_state(callback_id, JobState::Faulted);
                None
            }
        };
        if self.state(callback_id) == Some(JobState::Running) {
            self.set_state(callback_id, JobState::Completed);
        }

        self.results.upsert(callback_id, stored);

        let states = Arc::clone(&self.states);
        let listener = Arc::clone(&self.listener);
        let posted = self.completions.post(move || {
            if let Some(state) = lock_states(&states).get_mut(&callback_id) {
                *state = JobState::Delivered;
            }
            listener(callback_id);
        });
        if posted.is_err() {
            // Shut down while the job ran: nobody will be told to pull.
            let _ = self.results.take(callback_id);
            lock_states(&self.states).remove(&callback_id);
        }
        posted
    }

    /// Hand the stored result to the submitter. A callback id resolves once.
    pub fn pull_result(&self, callback_id: Handle) -> Result<Option<ManagedRef>, HandleError> {
        let token = self.results.take(callback_id)?;
        lock_states(&self.states).remove(&callback_id);
        Ok(token.map(StablePtr::adopt))
    }

    /// Results stored but not yet pulled.
    pub fn pending(&self) -> usize {
        self.results.len()
    }

    pub fn delivered(&self) -> usize {
        self.completions.delivered()
    }

    /// Block until every queued completion notice has run.
    pub fn wait_idle(&self) {
        self.completions.wait_idle();
    }

    /// Drain the completion queue and dispose every unpulled result.
    pub fn shutdown(&self) {
        self.completions.shutdown();
        let dropped = self.results.clear();
        lock_states(&self.states).clear();
        if dropped > 0 {
            tracing::debug!(dropped, "unpulled results disposed");
        }
    }
}
