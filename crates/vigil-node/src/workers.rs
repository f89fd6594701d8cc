//! Agent invocation workers.
//!
//! Agent calls block on model services, so they run on a small pool of
//! dedicated threads fed through a bounded, lock-free queue. When the
//! queue is full the submitter gets the job back (backpressure) instead
//! of queueing unbounded work. Each call runs under the standard guard:
//! circuit breaker, deadline, retries with backoff.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use vigil_agent::{
    Agent, AgentError, BreakerConfig, CircuitBreaker, InvocationGuard, RetryPolicy,
    SpecialistAgent,
};
use vigil_types::{AgentType, Incident, Recommendation, ReplicaId, Timestamp};

/// One dispatched agent call.
pub struct AgentJob {
    pub incident: Incident,
    pub agent_type: AgentType,
    pub replica: ReplicaId,
    pub agent: Arc<SpecialistAgent>,
    pub deadline_ms: u64,
}

/// The result fed back into the coordinator.
pub struct AgentJobOutcome {
    pub incident_id: vigil_types::IncidentId,
    pub agent_type: AgentType,
    pub replica: ReplicaId,
    pub elapsed_ms: u64,
    pub result: Result<Recommendation, AgentError>,
}

/// Fixed-size worker pool over a bounded job queue.
pub struct AgentWorkerPool {
    queue: Arc<ArrayQueue<AgentJob>>,
    results: Receiver<AgentJobOutcome>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl AgentWorkerPool {
    pub fn new(workers: usize, queue_capacity: usize, retry: RetryPolicy) -> Self {
        let queue = Arc::new(ArrayQueue::new(queue_capacity.max(1)));
        let (tx, results) = channel::<AgentJobOutcome>();
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for worker_index in 0..workers.max(1) {
            let queue = Arc::clone(&queue);
            let tx: Sender<AgentJobOutcome> = tx.clone();
            let shutdown = Arc::clone(&shutdown);
            let retry = retry.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("vigil-agent-worker-{worker_index}"))
                    .spawn(move || {
                        // One breaker per worker keeps hot failure paths
                        // from hammering a struggling dependency
                        let breaker = Mutex::new(CircuitBreaker::new(BreakerConfig::default()));
                        loop {
                            if shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                                return;
                            }
                            let Some(job) = queue.pop() else {
                                std::thread::sleep(Duration::from_millis(5));
                                continue;
                            };
                            let outcome = Self::run_job(&retry, &breaker, job);
                            if tx.send(outcome).is_err() {
                                return;
                            }
                        }
                    })
                    .expect("spawn agent worker"),
            );
        }

        Self {
            queue,
            results,
            shutdown,
            handles,
        }
    }

    /// Submits a job. Returns it on backpressure.
    pub fn submit(&self, job: AgentJob) -> Result<(), AgentJob> {
        self.queue.push(job)
    }

    /// Non-blocking drain of finished jobs.
    pub fn drain_outcomes(&self) -> Vec<AgentJobOutcome> {
        self.results.try_iter().collect()
    }

    /// Blocks up to `timeout` for at least one outcome, then drains the
    /// rest. Test convenience.
    pub fn wait_for_outcome(&self, timeout: Duration) -> Vec<AgentJobOutcome> {
        let mut outcomes = Vec::new();
        if let Ok(first) = self.results.recv_timeout(timeout) {
            outcomes.push(first);
        }
        outcomes.extend(self.results.try_iter());
        outcomes
    }

    fn run_job(
        retry: &RetryPolicy,
        breaker: &Mutex<CircuitBreaker>,
        job: AgentJob,
    ) -> AgentJobOutcome {
        let started = Timestamp::now();
        let guard = InvocationGuard::new(retry.clone(), job.deadline_ms);
        let agent = Arc::clone(&job.agent);
        let incident = job.incident.clone();

        let result = {
            let mut breaker = breaker.lock().expect("breaker lock");
            guard.invoke(&mut breaker, started, move || {
                agent.process_incident(&incident)
            })
        };

        AgentJobOutcome {
            incident_id: job.incident.id.clone(),
            agent_type: job.agent_type,
            replica: job.replica,
            elapsed_ms: Timestamp::now().millis_since(started),
            result,
        }
    }
}

impl Drop for AgentWorkerPool {
    fn drop(&mut self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
