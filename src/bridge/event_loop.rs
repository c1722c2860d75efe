//! The bridge event loop: admission control, correlation, supervision.
//!
//! All mutable bridge state (pending map, wait queue, limits, worker
//! handle) is owned by a single task. [`DispatchBridge`] is a cheap handle
//! that talks to it over an mpsc command channel, so no caller ever holds a
//! lock across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{self, WorkerLine, WorkerRequest, WorkerResponse};
use super::worker::WorkerLink;
use super::{BridgeLimits, BridgeSettings, WorkerState};
use crate::DispatchError;

/// How often in-flight and queued calls are checked against their deadline.
const TIMEOUT_TICK: Duration = Duration::from_millis(25);

/// Command channel depth. Senders that outrun the loop briefly park here;
/// real backpressure is the admission check inside the loop.
const COMMAND_CAPACITY: usize = 256;

type Reply = oneshot::Sender<Result<WorkerResponse, DispatchError>>;

enum Command {
    Call {
        request: WorkerRequest,
        reply: Reply,
    },
    UpdateLimits {
        limits: BridgeLimits,
        reply: oneshot::Sender<()>,
    },
    Limits {
        reply: oneshot::Sender<BridgeLimits>,
    },
    Shutdown,
}

/// Handle to one worker's event loop.
///
/// Cloneable; all clones talk to the same worker. Dropping every clone
/// closes the command channel and shuts the loop down.
#[derive(Clone)]
pub struct DispatchBridge {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<WorkerState>,
}

impl std::fmt::Debug for DispatchBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchBridge")
            .field("worker_state", &self.worker_state())
            .finish()
    }
}

impl DispatchBridge {
    /// Spawn the event loop and start the worker.
    ///
    /// Calls are rejected with [`DispatchError::WorkerUnavailable`] until
    /// the worker prints its ready line.
    pub fn spawn(link: Arc<dyn WorkerLink>, settings: BridgeSettings) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);

        let event_loop = EventLoop {
            link,
            limits: settings.limits.clone(),
            settings,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            worker_tx: None,
            state_tx,
            restart_failures: 0,
        };
        tokio::spawn(event_loop.run(command_rx));

        Self {
            commands: command_tx,
            state: state_rx,
        }
    }

    /// Send one prompt through the worker.
    ///
    /// The prompt and token cap are clamped to the current limits before
    /// hitting the wire. Admission control may answer `Overloaded`,
    /// `Timeout`, or `WorkerUnavailable` without the worker seeing the call.
    pub async fn call(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<WorkerResponse, DispatchError> {
        let request = WorkerRequest {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.to_string(),
            max_tokens,
            temperature,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DispatchError::BridgeClosed)?;
        reply_rx.await.map_err(|_| DispatchError::BridgeClosed)?
    }

    /// Replace the admission limits without restarting the worker.
    ///
    /// Applies to subsequent admissions; already-admitted calls keep their
    /// original deadline. Idempotent.
    pub async fn update_limits(&self, limits: BridgeLimits) -> Result<(), DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::UpdateLimits {
                limits,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DispatchError::BridgeClosed)?;
        reply_rx.await.map_err(|_| DispatchError::BridgeClosed)
    }

    /// The limits currently in force.
    pub async fn limits(&self) -> Result<BridgeLimits, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Limits { reply: reply_tx })
            .await
            .map_err(|_| DispatchError::BridgeClosed)?;
        reply_rx.await.map_err(|_| DispatchError::BridgeClosed)
    }

    /// Current worker lifecycle state.
    pub fn worker_state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Wait until the worker reports [`WorkerState::Ready`].
    pub async fn wait_ready(&self) -> Result<(), DispatchError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == WorkerState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| DispatchError::BridgeClosed)
    }

    /// Fail outstanding calls and stop the event loop.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

// ── Event loop ───────────────────────────────────────────────────────────

struct InFlight {
    reply: Reply,
    deadline: Instant,
}

struct Queued {
    request: WorkerRequest,
    reply: Reply,
    deadline: Instant,
}

struct EventLoop {
    link: Arc<dyn WorkerLink>,
    settings: BridgeSettings,
    limits: BridgeLimits,
    /// Calls on the wire, keyed by request id.
    pending: HashMap<String, InFlight>,
    /// Admitted calls waiting for a concurrency slot, FIFO.
    queue: VecDeque<Queued>,
    worker_tx: Option<mpsc::Sender<String>>,
    state_tx: watch::Sender<WorkerState>,
    restart_failures: u32,
}

/// A receiver that pends forever, standing in for worker output while the
/// worker is down. The paired sender keeps it from closing.
fn idle_output() -> (mpsc::Receiver<String>, mpsc::Sender<String>) {
    let (tx, rx) = mpsc::channel(1);
    (rx, tx)
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl EventLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (mut worker_rx, mut _keepalive) = idle_output();
        // First start attempt fires immediately.
        let mut restart_at = Some(Instant::now());
        let mut timeout_tick = tokio::time::interval(TIMEOUT_TICK);
        timeout_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(self.settings.sweep_interval());
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let restart_deadline = restart_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Call { request, reply }) => {
                        self.admit(request, reply);
                    }
                    Some(Command::UpdateLimits { limits, reply }) => {
                        if limits != self.limits {
                            info!(?limits, "bridge limits updated");
                        }
                        self.limits = limits;
                        self.drain_queue();
                        let _ = reply.send(());
                    }
                    Some(Command::Limits { reply }) => {
                        let _ = reply.send(self.limits.clone());
                    }
                    Some(Command::Shutdown) | None => {
                        self.fail_all(DispatchError::BridgeClosed);
                        info!("bridge event loop shutting down");
                        return;
                    }
                },
                line = worker_rx.recv() => match line {
                    Some(line) => self.on_worker_line(&line),
                    None => {
                        self.on_worker_exit();
                        let (rx, tx) = idle_output();
                        worker_rx = rx;
                        _keepalive = tx;
                        restart_at = Some(Instant::now() + self.settings.restart_backoff());
                    }
                },
                _ = timeout_tick.tick() => {
                    self.expire_deadlines();
                },
                _ = sweep_tick.tick() => {
                    self.sweep_orphans();
                },
                _ = sleep_until_opt(restart_deadline), if restart_deadline.is_some() => {
                    restart_at = None;
                    match self.link.start().await {
                        Ok(io) => {
                            self.worker_tx = Some(io.input);
                            worker_rx = io.output;
                            self.set_state(WorkerState::Starting);
                            info!("worker started, awaiting ready handshake");
                        }
                        Err(e) => {
                            self.restart_failures += 1;
                            if self.restart_failures >= self.settings.degraded_after_failures {
                                self.set_state(WorkerState::Degraded);
                            }
                            warn!(
                                error = %e,
                                attempts = self.restart_failures,
                                "worker start failed, backing off"
                            );
                            restart_at = Some(Instant::now() + self.settings.restart_backoff());
                        }
                    }
                },
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        let _ = self.state_tx.send(state);
    }

    fn is_ready(&self) -> bool {
        *self.state_tx.borrow() == WorkerState::Ready
    }

    // ── Admission ────────────────────────────────────────────────────────

    fn admit(&mut self, mut request: WorkerRequest, reply: Reply) {
        if !self.is_ready() {
            let _ = reply.send(Err(DispatchError::WorkerUnavailable));
            return;
        }
        if self.pending.len() + self.queue.len() >= self.limits.max_pending {
            debug!(
                pending = self.pending.len(),
                queued = self.queue.len(),
                "call rejected: overloaded"
            );
            let _ = reply.send(Err(DispatchError::Overloaded));
            return;
        }

        request.prompt = protocol::clamp_prompt(&request.prompt, self.limits.max_prompt_chars);
        request.max_tokens = request.max_tokens.min(self.limits.max_output_tokens);
        let deadline = Instant::now() + self.limits.call_timeout();

        if self.pending.len() >= self.limits.max_concurrency {
            self.queue.push_back(Queued {
                request,
                reply,
                deadline,
            });
        } else {
            self.start_call(request, reply, deadline);
        }
    }

    fn start_call(&mut self, request: WorkerRequest, reply: Reply, deadline: Instant) {
        let line = match protocol::encode_request(&request) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode request");
                let _ = reply.send(Err(DispatchError::WorkerUnavailable));
                return;
            }
        };
        let Some(worker_tx) = &self.worker_tx else {
            let _ = reply.send(Err(DispatchError::WorkerUnavailable));
            return;
        };
        if worker_tx.try_send(line).is_err() {
            // Channel full or closed: either way the worker is not keeping
            // up with max_concurrency-many lines, treat as unavailable.
            let _ = reply.send(Err(DispatchError::WorkerUnavailable));
            return;
        }
        self.pending.insert(request.id, InFlight { reply, deadline });
    }

    fn drain_queue(&mut self) {
        while self.pending.len() < self.limits.max_concurrency {
            let Some(next) = self.queue.pop_front() else {
                return;
            };
            if next.reply.is_closed() {
                continue;
            }
            self.start_call(next.request, next.reply, next.deadline);
        }
    }

    // ── Worker output ────────────────────────────────────────────────────

    fn on_worker_line(&mut self, line: &str) {
        match protocol::parse_line(line) {
            Some(WorkerLine::Ready) => {
                self.restart_failures = 0;
                self.set_state(WorkerState::Ready);
                info!("worker ready");
            }
            Some(WorkerLine::Response(response)) => {
                match self.pending.remove(&response.request_id) {
                    Some(in_flight) => {
                        let _ = in_flight.reply.send(Ok(response));
                        self.drain_queue();
                    }
                    None => {
                        // Timed-out or swept call answering late.
                        debug!(request_id = %response.request_id, "dropping late response");
                    }
                }
            }
            None => {}
        }
    }

    fn on_worker_exit(&mut self) {
        warn!(
            pending = self.pending.len(),
            queued = self.queue.len(),
            "worker exited"
        );
        self.worker_tx = None;
        self.set_state(WorkerState::Restarting);
        self.fail_all(DispatchError::WorkerUnavailable);
    }

    // ── Housekeeping ─────────────────────────────────────────────────────

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        let timeout = DispatchError::Timeout {
            after_ms: self.limits.call_timeout_ms,
        };

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, in_flight)| in_flight.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(in_flight) = self.pending.remove(&id) {
                debug!(request_id = %id, "in-flight call timed out");
                let _ = in_flight.reply.send(Err(timeout.clone()));
            }
        }

        let mut still_queued = VecDeque::with_capacity(self.queue.len());
        for queued in self.queue.drain(..) {
            if queued.deadline <= now {
                let _ = queued.reply.send(Err(timeout.clone()));
            } else {
                still_queued.push_back(queued);
            }
        }
        self.queue = still_queued;

        self.drain_queue();
    }

    /// Drop calls nobody is waiting on any more and pending entries far
    /// past their deadline (which the tick should already have expired).
    fn sweep_orphans(&mut self) {
        let hard_deadline = Instant::now() - self.limits.call_timeout();
        self.pending
            .retain(|_, in_flight| !in_flight.reply.is_closed() && in_flight.deadline > hard_deadline);
        self.queue.retain(|queued| !queued.reply.is_closed());
        self.drain_queue();
    }

    fn fail_all(&mut self, error: DispatchError) {
        for (_, in_flight) in self.pending.drain() {
            let _ = in_flight.reply.send(Err(error.clone()));
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(error.clone()));
        }
    }
}
