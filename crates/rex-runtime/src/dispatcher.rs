//! [`CommandDispatcher`] – the single ordered stream of commands to the
//! robot link.
//!
//! Producers hold a cloneable [`DispatcherHandle`]. Commands go out one at a
//! time, in submission order, each waiting for its acknowledgement or for
//! `ack_timeout_ms`. The one exception is [`DispatcherHandle::emergency_stop`]:
//!
//! 1. every queued non-stop command is discarded;
//! 2. a `Stop` is placed at the head of the queue;
//! 3. a non-stop command already waiting for its ack is abandoned, so the
//!    stop goes out without waiting behind it.
//!
//! Every outcome is published on the [`Topic::Commands`] lane of the status
//! bus and reported on the `reports` channel, where the safety worker picks
//! up timeouts and link faults as link-health signals.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rex_link::{EventBus, RobotLink, Topic};
use rex_types::{Event, EventPayload, RexError, RobotCommand};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};

const SOURCE: &str = "rex-runtime::dispatcher";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub ack_timeout_ms: u64,
    /// Non-stop commands beyond this are refused.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 1500,
            queue_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Acked,
    Failed(RexError),
    TimedOut,
    /// Abandoned in flight by an emergency stop.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub seq: u64,
    pub command: RobotCommand,
    pub outcome: DispatchOutcome,
}

impl DispatchReport {
    /// Whether the safety monitor should count this against link health.
    pub fn is_link_fault(&self) -> bool {
        match &self.outcome {
            DispatchOutcome::TimedOut => true,
            DispatchOutcome::Failed(e) => e.is_link_fault(),
            DispatchOutcome::Acked | DispatchOutcome::Aborted => false,
        }
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<(u64, RobotCommand)>,
    next_seq: u64,
    closed: bool,
}

impl Queue {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

struct Shared {
    queue: Mutex<Queue>,
    notify: Notify,
    /// Bumped on every emergency stop.
    preempt: watch::Sender<u64>,
    capacity: usize,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    /// Queue `command` behind everything already submitted.
    ///
    /// # Errors
    ///
    /// [`RexError::Channel`] when the dispatcher is closed or the queue is
    /// full.
    pub fn submit(&self, command: RobotCommand) -> Result<u64, RexError> {
        let mut queue = self.shared.queue();
        if queue.closed {
            return Err(RexError::Channel("dispatcher closed".into()));
        }
        if !command.is_stop() && queue.items.len() >= self.shared.capacity {
            return Err(RexError::Channel("command queue full".into()));
        }
        let seq = queue.seq();
        debug!(seq, command = command.name(), "command queued");
        queue.items.push_back((seq, command));
        drop(queue);
        self.shared.notify.notify_one();
        Ok(seq)
    }

    /// Put a `Stop` at the head of the queue, dropping queued motion and
    /// abandoning any command still waiting for its ack.
    pub fn emergency_stop(&self) -> u64 {
        let mut queue = self.shared.queue();
        let before = queue.items.len();
        queue.items.retain(|(_, c)| c.is_stop());
        let discarded = before - queue.items.len();
        let seq = match queue.items.front() {
            Some((seq, _)) => *seq,
            None => {
                let seq = queue.seq();
                queue.items.push_front((seq, RobotCommand::Stop));
                seq
            }
        };
        drop(queue);
        self.shared.preempt.send_modify(|epoch| *epoch += 1);
        self.shared.notify.notify_one();
        warn!(seq, discarded, "emergency stop queued");
        seq
    }

    /// Commands not yet handed to the link.
    pub fn pending(&self) -> Vec<RobotCommand> {
        self.shared.queue().items.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Stop accepting commands. Already-queued commands are still sent.
    pub fn close(&self) {
        self.shared.queue().closed = true;
        self.shared.notify.notify_one();
    }
}

pub struct CommandDispatcher {
    link: Arc<dyn RobotLink>,
    shared: Arc<Shared>,
    ack_timeout: Duration,
    bus: EventBus,
    reports: mpsc::Sender<DispatchReport>,
}

/// Build a dispatcher for `link` and the handle producers submit through.
pub fn command_dispatcher(
    link: Arc<dyn RobotLink>,
    config: &DispatcherConfig,
    bus: EventBus,
    reports: mpsc::Sender<DispatchReport>,
) -> (CommandDispatcher, DispatcherHandle) {
    let (preempt, _) = watch::channel(0);
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue::default()),
        notify: Notify::new(),
        preempt,
        capacity: config.queue_capacity.max(1),
    });
    let dispatcher = CommandDispatcher {
        link,
        shared: shared.clone(),
        ack_timeout: Duration::from_millis(config.ack_timeout_ms),
        bus,
        reports,
    };
    (dispatcher, DispatcherHandle { shared })
}

enum Next {
    Deliver(u64, RobotCommand),
    Idle,
    Closed,
}

impl CommandDispatcher {
    /// Deliver commands until the handle is closed and the queue drained.
    pub async fn run(self) {
        let mut preempt = self.shared.preempt.subscribe();
        loop {
            match self.take_next(&mut preempt) {
                Next::Deliver(seq, command) => self.deliver(seq, command, &mut preempt).await,
                Next::Idle => self.shared.notify.notified().await,
                Next::Closed => break,
            }
        }
        info!("command dispatcher stopped");
    }

    /// Pop the next command. The preemption epoch is marked seen under the
    /// queue lock, so any emergency stop after the pop aborts this command.
    fn take_next(&self, preempt: &mut watch::Receiver<u64>) -> Next {
        let mut queue = self.shared.queue();
        preempt.borrow_and_update();
        match queue.items.pop_front() {
            Some((seq, command)) => Next::Deliver(seq, command),
            None if queue.closed => Next::Closed,
            None => Next::Idle,
        }
    }

    async fn deliver(&self, seq: u64, command: RobotCommand, preempt: &mut watch::Receiver<u64>) {
        let outcome = if command.is_stop() {
            ack_outcome(tokio::time::timeout(self.ack_timeout, self.link.send_command(seq, &command)).await)
        } else if preempt.has_changed().unwrap_or(false) {
            DispatchOutcome::Aborted
        } else {
            let send = tokio::time::timeout(self.ack_timeout, self.link.send_command(seq, &command));
            tokio::select! {
                result = send => ack_outcome(result),
                Ok(()) = preempt.changed() => DispatchOutcome::Aborted,
            }
        };

        let payload = match &outcome {
            DispatchOutcome::Acked => {
                debug!(seq, command = command.name(), "command acknowledged");
                EventPayload::CommandDispatched {
                    seq,
                    command: command.clone(),
                }
            }
            other => {
                warn!(seq, command = command.name(), outcome = ?other, "command not acknowledged");
                EventPayload::CommandFailed {
                    seq,
                    command: command.clone(),
                    error: describe(other),
                }
            }
        };
        self.bus.publish_to(Topic::Commands, Event::new(SOURCE, payload));
        let report = DispatchReport { seq, command, outcome };
        if self.reports.send(report).await.is_err() {
            debug!("dispatch report receiver gone");
        }
    }
}

fn ack_outcome(result: Result<Result<(), RexError>, tokio::time::error::Elapsed>) -> DispatchOutcome {
    match result {
        Ok(Ok(())) => DispatchOutcome::Acked,
        Ok(Err(e)) => DispatchOutcome::Failed(e),
        Err(_) => DispatchOutcome::TimedOut,
    }
}

fn describe(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::Acked => "acknowledged".to_string(),
        DispatchOutcome::Failed(e) => e.to_string(),
        DispatchOutcome::TimedOut => "no acknowledgement".to_string(),
        DispatchOutcome::Aborted => "abandoned for emergency stop".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rex_link::SimLink;
    use rex_types::{Direction, Gesture};

    fn walk() -> RobotCommand {
        RobotCommand::Walk {
            direction: Direction::Forward,
            speed: 0.3,
        }
    }

    fn setup(link: Arc<SimLink>) -> (DispatcherHandle, mpsc::Receiver<DispatchReport>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let (dispatcher, handle) = command_dispatcher(link, &DispatcherConfig::default(), EventBus::new(64), tx);
        let task = tokio::spawn(dispatcher.run());
        (handle, rx, task)
    }

    #[tokio::test]
    async fn delivers_in_submission_order() {
        let link = Arc::new(SimLink::new());
        let (handle, mut reports, task) = setup(link.clone());
        let sit = RobotCommand::Gesture(Gesture::Sit);
        handle.submit(walk()).unwrap();
        handle.submit(sit.clone()).unwrap();
        handle.submit(RobotCommand::Stop).unwrap();
        for _ in 0..3 {
            assert_eq!(reports.recv().await.unwrap().outcome, DispatchOutcome::Acked);
        }
        handle.close();
        task.await.unwrap();
        assert_eq!(link.sent_commands(), vec![walk(), sit, RobotCommand::Stop]);
        assert_eq!(link.sent_seqs(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_jumps_the_queue() {
        let link = Arc::new(SimLink::new());
        link.set_ack_delay(Duration::from_millis(500));
        let (handle, mut reports, _task) = setup(link.clone());

        handle.submit(walk()).unwrap();
        handle.submit(RobotCommand::Gesture(Gesture::Dance)).unwrap();
        handle.submit(RobotCommand::Gesture(Gesture::Heart)).unwrap();
        // Let the walk go in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.emergency_stop();
        assert_eq!(handle.pending(), vec![RobotCommand::Stop]);

        let first = reports.recv().await.unwrap();
        assert_eq!(first.command, walk());
        assert_eq!(first.outcome, DispatchOutcome::Aborted);
        let second = reports.recv().await.unwrap();
        assert_eq!(second.command, RobotCommand::Stop);
        assert_eq!(second.outcome, DispatchOutcome::Acked);
        assert_eq!(link.sent_commands(), vec![RobotCommand::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_right_after_the_pop_aborts_the_popped_command() {
        let link = Arc::new(SimLink::new());
        link.set_ack_delay(Duration::from_secs(10));
        let (tx, mut reports) = mpsc::channel(8);
        let (dispatcher, handle) = command_dispatcher(link.clone(), &DispatcherConfig::default(), EventBus::new(8), tx);
        let mut preempt = dispatcher.shared.preempt.subscribe();

        handle.submit(walk()).unwrap();
        let Next::Deliver(seq, command) = dispatcher.take_next(&mut preempt) else {
            panic!("walk should be next");
        };
        // Stop lands after the pop, before the walk reaches the link.
        handle.emergency_stop();

        let started = tokio::time::Instant::now();
        dispatcher.deliver(seq, command, &mut preempt).await;
        assert!(started.elapsed() < Duration::from_millis(10));
        let report = reports.recv().await.unwrap();
        assert_eq!(report.command, walk());
        assert_eq!(report.outcome, DispatchOutcome::Aborted);

        assert!(matches!(
            dispatcher.take_next(&mut preempt),
            Next::Deliver(_, RobotCommand::Stop)
        ));
        assert!(link.sent_commands().is_empty());
    }

    #[tokio::test]
    async fn repeated_emergency_stops_queue_one_stop() {
        let link = Arc::new(SimLink::new());
        link.set_online(false);
        let (tx, _rx) = mpsc::channel(8);
        let (_dispatcher, handle) = command_dispatcher(link, &DispatcherConfig::default(), EventBus::new(8), tx);
        handle.submit(walk()).unwrap();
        let a = handle.emergency_stop();
        let b = handle.emergency_stop();
        assert_eq!(a, b);
        assert_eq!(handle.pending(), vec![RobotCommand::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_is_reported_as_link_fault() {
        let link = Arc::new(SimLink::new());
        link.set_ack_delay(Duration::from_secs(10));
        let (handle, mut reports, _task) = setup(link);
        handle.submit(RobotCommand::Gesture(Gesture::Sit)).unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.outcome, DispatchOutcome::TimedOut);
        assert!(report.is_link_fault());
    }

    #[tokio::test]
    async fn offline_link_failure_counts_as_fault() {
        let link = Arc::new(SimLink::new());
        link.set_online(false);
        let (handle, mut reports, _task) = setup(link);
        handle.submit(RobotCommand::Stop).unwrap();
        let report = reports.recv().await.unwrap();
        assert!(matches!(report.outcome, DispatchOutcome::Failed(_)));
        assert!(report.is_link_fault());
    }

    #[tokio::test]
    async fn bus_sees_dispatch_results() {
        let link = Arc::new(SimLink::new());
        let bus = EventBus::new(16);
        let mut commands = bus.subscribe_to(Topic::Commands);
        let (tx, _rx) = mpsc::channel(8);
        let (dispatcher, handle) = command_dispatcher(link, &DispatcherConfig::default(), bus, tx);
        tokio::spawn(dispatcher.run());
        handle.submit(RobotCommand::Stop).unwrap();
        let event = commands.recv().await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::CommandDispatched {
                command: RobotCommand::Stop,
                ..
            }
        ));
    }

    #[test]
    fn closed_dispatcher_refuses_commands() {
        let (tx, _rx) = mpsc::channel(1);
        let (_d, handle) = command_dispatcher(
            Arc::new(SimLink::new()),
            &DispatcherConfig::default(),
            EventBus::new(4),
            tx,
        );
        handle.close();
        assert!(handle.submit(RobotCommand::Stop).is_err());
    }
}
