//! [`Agent`] – wires perception, cognition, behavior and safety into a small
//! fixed set of workers.
//!
//! | Worker     | Owns                                   | Waits on                              |
//! |------------|----------------------------------------|---------------------------------------|
//! | wake       | [`WakeDetector`]                       | transcript fragments                  |
//! | microphone | a [`SpeechRecognizer`] (optional)      | audio frames                          |
//! | camera     | [`VisionTracker`] (optional)           | camera frames                         |
//! | safety     | [`SafetyMonitor`]                      | heartbeat interval, dispatch reports  |
//! | dispatch   | [`CommandDispatcher`]                  | its command queue                     |
//! | control    | [`ConversationEngine`], [`BehaviorScheduler`], [`ActionGate`] | everything above, plus operator controls |
//!
//! Workers talk over bounded `mpsc` channels. The robot link state is owned
//! by the safety worker and read elsewhere through a `watch` snapshot.
//!
//! When the safety worker declares the link Lost it injects the stop into
//! the dispatcher itself, then tells the control task, so the stop never
//! waits behind conversation work. Operator stops do the same from
//! [`AgentHandle::emergency_stop`], which is safe to call from a signal
//! handler thread.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rex_kernel::{
    ActionGate, ChannelOwner, Grant, HeartbeatOutcome, Interlock, MotionLimits, SafetyAction, SafetyConfig,
    SafetyMonitor,
};
use rex_link::{EventBus, RobotLink, Topic};
use rex_memory::{MemoryConfig, MemoryStore};
use rex_perception::{
    AudioFrame, CameraFrame, FaceEmbedder, SceneDescriber, SensorFeed, SpeechRecognizer, TranscriptFragment,
    VisionConfig, VisionEvent, VisionTracker, WakeConfig, WakeDetector, WakeEvent, transcribe,
};
use rex_types::{ConversationPhase, Event, EventPayload, LinkStatus, RexError, RobotCommand, RobotLinkState};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::behavior::{BehaviorConfig, BehaviorKind, BehaviorOutput, BehaviorScheduler};
use crate::cognition::CognitionService;
use crate::conversation::{
    ConversationConfig, ConversationEffect, ConversationEngine, ConversationInput, StopOrigin,
};
use crate::dispatcher::{CommandDispatcher, DispatchReport, DispatcherConfig, DispatcherHandle, command_dispatcher};
use crate::speech::TextToSpeech;

const SOURCE: &str = "rex-runtime::agent";
const FAREWELL_BUDGET: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub wake: WakeConfig,
    pub vision: VisionConfig,
    pub conversation: ConversationConfig,
    pub behavior: BehaviorConfig,
    pub safety: SafetyConfig,
    pub dispatcher: DispatcherConfig,
    pub memory: MemoryConfig,
    pub limits: MotionLimits,
    /// Period of the control task's clock (timeouts, behavior scheduling).
    pub tick_ms: u64,
    /// Capacity of every inter-worker channel.
    pub channel_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            wake: WakeConfig::default(),
            vision: VisionConfig::default(),
            conversation: ConversationConfig::default(),
            behavior: BehaviorConfig::default(),
            safety: SafetyConfig::default(),
            dispatcher: DispatcherConfig::default(),
            memory: MemoryConfig::default(),
            limits: MotionLimits::default(),
            tick_ms: 200,
            channel_capacity: 64,
        }
    }
}

/// External collaborators the agent drives.
pub struct Collaborators {
    pub link: Arc<dyn RobotLink>,
    pub cognition: Arc<dyn CognitionService>,
    pub voice: Arc<dyn TextToSpeech>,
    pub memory: Arc<MemoryStore>,
    pub bus: EventBus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

enum ControlMsg {
    Resume,
    OperatorStop,
    Safety(SafetyAction),
    Shutdown(oneshot::Sender<()>),
}

enum Completion {
    Cognition {
        request_id: u64,
        result: Result<rex_types::CognitionReply, RexError>,
    },
    Speech {
        utterance_id: u64,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable emergency stop, usable from any thread.
#[derive(Clone)]
pub struct EmergencyStopper {
    dispatcher: DispatcherHandle,
    control: mpsc::Sender<ControlMsg>,
}

impl EmergencyStopper {
    pub fn stop(&self) {
        self.dispatcher.emergency_stop();
        if self.control.try_send(ControlMsg::OperatorStop).is_err() {
            warn!("control task busy or gone, stop sent to dispatcher only");
        }
    }
}

pub struct AgentHandle {
    control: mpsc::Sender<ControlMsg>,
    fragments: mpsc::Sender<TranscriptFragment>,
    vision_events: mpsc::Sender<VisionEvent>,
    phase: watch::Receiver<ConversationPhase>,
    link: watch::Receiver<RobotLinkState>,
    bus: EventBus,
    dispatcher: DispatcherHandle,
    memory: Arc<MemoryStore>,
    vision_config: VisionConfig,
    dispatch_task: JoinHandle<()>,
    control_task: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn phase(&self) -> ConversationPhase {
        *self.phase.borrow()
    }

    pub fn link_state(&self) -> RobotLinkState {
        self.link.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConversationPhase> {
        self.phase.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Feed for recognizer output; the CLI harness pushes typed lines here.
    pub fn transcripts(&self) -> mpsc::Sender<TranscriptFragment> {
        self.fragments.clone()
    }

    pub fn stopper(&self) -> EmergencyStopper {
        EmergencyStopper {
            dispatcher: self.dispatcher.clone(),
            control: self.control.clone(),
        }
    }

    pub fn emergency_stop(&self) {
        self.stopper().stop();
    }

    /// Leave EmergencyStopped. Ignored in any other state.
    pub async fn resume(&self) -> Result<(), RexError> {
        self.control
            .send(ControlMsg::Resume)
            .await
            .map_err(|_| RexError::Channel("control task gone".into()))
    }

    /// Run `recognizer` over `audio`, feeding the wake detector.
    pub fn attach_microphone<R: SpeechRecognizer + 'static>(&mut self, recognizer: R, audio: SensorFeed<AudioFrame>) {
        let fragments = self.fragments.clone();
        self.workers.push(tokio::spawn(transcribe(recognizer, audio, fragments)));
    }

    /// Sample `frames` for faces and scenes.
    pub fn attach_camera(
        &mut self,
        embedder: Arc<dyn FaceEmbedder>,
        describer: Option<Arc<dyn SceneDescriber>>,
        frames: SensorFeed<CameraFrame>,
    ) {
        let tracker = VisionTracker::new(self.vision_config.clone(), self.memory.clone());
        let events = self.vision_events.clone();
        self.workers.push(tokio::spawn(async move {
            if let Err(e) = tracker.run(embedder, describer, frames, events).await {
                error!(error = %e, "vision worker stopped");
            }
        }));
    }

    /// Stop the robot, say goodbye and wind every worker down.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control.send(ControlMsg::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        } else {
            self.dispatcher.submit(RobotCommand::Stop).ok();
            self.dispatcher.close();
        }
        let _ = self.control_task.await;
        if tokio::time::timeout(FAREWELL_BUDGET, self.dispatch_task).await.is_err() {
            warn!("dispatcher did not drain in time");
        }
        for worker in self.workers {
            worker.abort();
        }
        info!("agent stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

pub struct Agent;

impl Agent {
    /// Spawn every worker on the current Tokio runtime.
    pub fn spawn(config: AgentConfig, parts: Collaborators) -> AgentHandle {
        let capacity = config.channel_capacity.max(1);
        let Collaborators {
            link,
            cognition,
            voice,
            memory,
            bus,
        } = parts;

        match memory.prune(&config.memory.prune, Utc::now()) {
            Ok(0) => {}
            Ok(n) => info!(pruned = n, "old memories pruned"),
            Err(e) => warn!(error = %e, "memory pruning failed"),
        }

        let (report_tx, report_rx) = mpsc::channel(capacity);
        let (dispatcher, dispatch) = command_dispatcher(link.clone(), &config.dispatcher, bus.clone(), report_tx);
        let dispatch_task = tokio::spawn(dispatcher_worker(dispatcher));

        let (control_tx, control_rx) = mpsc::channel(capacity);
        let (fragment_tx, fragment_rx) = mpsc::channel(capacity);
        let (wake_tx, wake_rx) = mpsc::channel(capacity);
        let (vision_tx, vision_rx) = mpsc::channel(capacity);
        let (phase_tx, phase_rx) = watch::channel(ConversationPhase::Idle);

        let monitor = SafetyMonitor::new(config.safety.clone());
        let link_rx = monitor.subscribe();

        let mut workers = Vec::new();
        workers.push(tokio::spawn(WakeDetector::new(config.wake.clone()).run(fragment_rx, wake_tx)));
        workers.push(tokio::spawn(safety_worker(
            monitor,
            link.clone(),
            dispatch.clone(),
            report_rx,
            control_tx.clone(),
            bus.clone(),
        )));

        let now = Utc::now();
        let control = ControlTask {
            engine: ConversationEngine::new(config.conversation.clone(), memory.clone(), &config.memory),
            scheduler: BehaviorScheduler::new(config.behavior.clone(), config.vision.greeting_cooldown(), now),
            gate: ActionGate::new(Interlock::standard(&config.limits)),
            conversation: config.conversation.clone(),
            cognition,
            voice,
            memory: memory.clone(),
            dispatcher: dispatch.clone(),
            bus: bus.clone(),
            link: link_rx.clone(),
            phase: phase_tx,
            cognition_cancel: CancellationToken::new(),
            speech_cancel: CancellationToken::new(),
            announce_cancel: CancellationToken::new(),
            completions: None,
        };
        let tick = Duration::from_millis(config.tick_ms.max(1));
        let control_task = tokio::spawn(control.run(control_rx, wake_rx, vision_rx, tick, capacity));

        AgentHandle {
            control: control_tx,
            fragments: fragment_tx,
            vision_events: vision_tx,
            phase: phase_rx,
            link: link_rx,
            bus,
            dispatcher: dispatch,
            memory,
            vision_config: config.vision,
            dispatch_task,
            control_task,
            workers,
        }
    }
}

async fn dispatcher_worker(dispatcher: CommandDispatcher) {
    dispatcher.run().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Safety worker
// ─────────────────────────────────────────────────────────────────────────────

async fn safety_worker(
    mut monitor: SafetyMonitor,
    link: Arc<dyn RobotLink>,
    dispatcher: DispatcherHandle,
    mut reports: mpsc::Receiver<DispatchReport>,
    control: mpsc::Sender<ControlMsg>,
    bus: EventBus,
) {
    let mut poll = tokio::time::interval(monitor.config().heartbeat_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let timeout = monitor.config().heartbeat_timeout();

    loop {
        let actions = tokio::select! {
            _ = poll.tick() => {
                let outcome = match tokio::time::timeout(timeout, link.heartbeat()).await {
                    Ok(Ok(heartbeat)) => HeartbeatOutcome::Answered(heartbeat),
                    Ok(Err(e)) => {
                        debug!(error = %e, "heartbeat failed");
                        HeartbeatOutcome::Missed
                    }
                    Err(_) => HeartbeatOutcome::Missed,
                };
                monitor.record(outcome, Utc::now())
            }
            report = reports.recv() => match report {
                Some(report) if report.is_link_fault() => {
                    warn!(seq = report.seq, outcome = ?report.outcome, "dispatch fault counted against link");
                    monitor.record_dispatch_timeout(Utc::now())
                }
                Some(_) => Vec::new(),
                None => break,
            },
        };

        for action in actions {
            match &action {
                SafetyAction::StatusChanged { to, .. } => {
                    bus.publish_to(Topic::Safety, Event::new(SOURCE, EventPayload::Link(*to)));
                }
                SafetyAction::EmergencyStop { reason } => {
                    dispatcher.emergency_stop();
                    bus.publish_to(
                        Topic::Safety,
                        Event::new(SOURCE, EventPayload::EmergencyStop { reason: reason.clone() }),
                    );
                }
                SafetyAction::LowBattery { percent } => {
                    bus.publish_to(Topic::Safety, Event::new(SOURCE, EventPayload::LowBattery { percent: *percent }));
                }
            }
            if control.send(ControlMsg::Safety(action)).await.is_err() {
                return;
            }
        }
    }
    debug!("safety worker stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Control task
// ─────────────────────────────────────────────────────────────────────────────

struct ControlTask {
    engine: ConversationEngine,
    scheduler: BehaviorScheduler,
    gate: ActionGate,
    conversation: ConversationConfig,
    cognition: Arc<dyn CognitionService>,
    voice: Arc<dyn TextToSpeech>,
    memory: Arc<MemoryStore>,
    dispatcher: DispatcherHandle,
    bus: EventBus,
    link: watch::Receiver<RobotLinkState>,
    phase: watch::Sender<ConversationPhase>,
    cognition_cancel: CancellationToken,
    speech_cancel: CancellationToken,
    announce_cancel: CancellationToken,
    completions: Option<mpsc::Sender<Completion>>,
}

impl ControlTask {
    async fn run(
        mut self,
        mut control: mpsc::Receiver<ControlMsg>,
        mut wake: mpsc::Receiver<WakeEvent>,
        mut vision: mpsc::Receiver<VisionEvent>,
        tick: Duration,
        capacity: usize,
    ) {
        let (completion_tx, mut completions) = mpsc::channel(capacity);
        self.completions = Some(completion_tx);
        let mut clock = tokio::time::interval(tick);
        clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.announce(format!(
            "Hi, I'm {}. Say my name when you need me.",
            self.conversation.robot_name
        ));

        loop {
            tokio::select! {
                Some(msg) = control.recv() => match msg {
                    ControlMsg::Resume => self.feed(ConversationInput::Resume),
                    ControlMsg::OperatorStop => self.feed(ConversationInput::OperatorStop),
                    ControlMsg::Safety(action) => self.on_safety(action),
                    ControlMsg::Shutdown(done) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                },
                Some(event) = wake.recv() => self.feed(ConversationInput::Heard(event)),
                Some(event) = vision.recv() => self.on_vision(event),
                Some(done) = completions.recv() => match done {
                    Completion::Cognition { request_id, result: Ok(reply) } => {
                        self.feed(ConversationInput::CognitionSucceeded { request_id, reply })
                    }
                    Completion::Cognition { request_id, result: Err(error) } => {
                        self.feed(ConversationInput::CognitionFailed { request_id, error })
                    }
                    Completion::Speech { utterance_id } => {
                        self.feed(ConversationInput::SpeechFinished { utterance_id })
                    }
                },
                _ = clock.tick() => {
                    self.feed(ConversationInput::Tick);
                    self.schedule_behavior();
                }
                else => break,
            }
        }
        debug!("control task stopped");
    }

    fn feed(&mut self, input: ConversationInput) {
        let effects = self.engine.handle(input, Utc::now());
        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: ConversationEffect) {
        let now = Utc::now();
        match effect {
            ConversationEffect::PhaseChanged(phase) => {
                self.phase.send_replace(phase);
                self.publish(Topic::Conversation, EventPayload::Phase(phase));
            }
            ConversationEffect::AcquireChannel => match self.gate.arbiter_mut().try_acquire(ChannelOwner::Conversation) {
                Ok(Grant::Preempted(ChannelOwner::Behavior)) => {
                    if self.scheduler.preempted(now) == Some(BehaviorKind::IdleWalk) {
                        self.submit(RobotCommand::Stop);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "conversation could not take the action channel"),
            },
            ConversationEffect::ReleaseChannel => {
                self.gate.arbiter_mut().release(ChannelOwner::Conversation);
            }
            ConversationEffect::Heard(text) => self.publish(Topic::Conversation, EventPayload::Heard(text)),
            ConversationEffect::StartCognition { request_id, request } => {
                self.cognition_cancel = CancellationToken::new();
                let cancel = self.cognition_cancel.clone();
                let cognition = self.cognition.clone();
                let Some(done) = self.completions.clone() else { return };
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => debug!(request_id, "cognition request cancelled"),
                        result = cognition.respond(&request) => {
                            let _ = done.send(Completion::Cognition { request_id, result }).await;
                        }
                    }
                });
            }
            ConversationEffect::CancelCognition => self.cognition_cancel.cancel(),
            ConversationEffect::Speak { utterance_id, text } => {
                self.speech_cancel.cancel();
                self.speech_cancel = CancellationToken::new();
                self.publish(Topic::Conversation, EventPayload::Spoke(text.clone()));
                let cancel = self.speech_cancel.clone();
                let voice = self.voice.clone();
                let Some(done) = self.completions.clone() else { return };
                tokio::spawn(async move {
                    if let Err(e) = voice.speak(&text, cancel).await {
                        warn!(error = %e, "text-to-speech failed");
                    }
                    let _ = done.send(Completion::Speech { utterance_id }).await;
                });
            }
            ConversationEffect::CancelSpeech => {
                self.speech_cancel.cancel();
                self.announce_cancel.cancel();
                self.announce_cancel = CancellationToken::new();
            }
            ConversationEffect::Announce(text) => self.announce(text),
            ConversationEffect::EmergencyStop { reason, origin } => {
                // Safety and operator stops were injected by their callers.
                if origin == StopOrigin::Voice {
                    self.dispatcher.emergency_stop();
                    self.publish(Topic::Safety, EventPayload::EmergencyStop { reason });
                }
                self.gate.latch_emergency();
                if let Ok(Grant::Preempted(ChannelOwner::Behavior)) =
                    self.gate.arbiter_mut().try_acquire(ChannelOwner::ConversationEmergency)
                {
                    self.scheduler.preempted(now);
                }
            }
            ConversationEffect::Resumed => {
                self.gate.clear_emergency();
                self.gate.arbiter_mut().release(ChannelOwner::ConversationEmergency);
                info!("resumed after emergency stop");
            }
            ConversationEffect::Command(command) => {
                let link = self.link.borrow().clone();
                match self.gate.authorize(ChannelOwner::Conversation, &command, &link) {
                    Ok(()) => self.submit(command),
                    Err(e) => warn!(error = %e, command = command.name(), "conversation command rejected"),
                }
            }
            ConversationEffect::Follow { enabled, target } => self.scheduler.set_follow(enabled, target, now),
            ConversationEffect::Thought(thought) => {
                self.publish(Topic::Conversation, EventPayload::AgentThought(thought))
            }
            ConversationEffect::PersonEnrolled(person) => {
                info!(person_id = %person.id, name = %person.name, "new person remembered");
                self.publish(
                    Topic::Perception,
                    EventPayload::PersonRecognized {
                        person_id: person.id,
                        name: person.name,
                        similarity: 1.0,
                    },
                );
            }
        }
    }

    fn on_safety(&mut self, action: SafetyAction) {
        match action {
            SafetyAction::EmergencyStop { reason } => self.feed(ConversationInput::SafetyStop { reason }),
            SafetyAction::StatusChanged {
                to: LinkStatus::Lost, ..
            } => self.announce("I lost the connection to my body. Stopping.".to_string()),
            SafetyAction::StatusChanged {
                from: LinkStatus::Lost,
                to: LinkStatus::Connected,
            } => self.announce("Connection restored.".to_string()),
            SafetyAction::StatusChanged { .. } => {}
            SafetyAction::LowBattery { percent } => {
                self.announce(format!("My battery is at {percent} percent."))
            }
        }
    }

    fn on_vision(&mut self, event: VisionEvent) {
        if let VisionEvent::PersonRecognized { person, similarity } = &event {
            self.publish(
                Topic::Perception,
                EventPayload::PersonRecognized {
                    person_id: person.id,
                    name: person.name.clone(),
                    similarity: *similarity,
                },
            );
            self.scheduler.on_person_recognized(person, Utc::now());
        }
        self.feed(ConversationInput::Vision(event));
    }

    fn schedule_behavior(&mut self) {
        let link = self.link.borrow().clone();
        for output in self.scheduler.tick(Utc::now(), &mut self.gate, &link) {
            match output {
                BehaviorOutput::Command(command) => self.submit(command),
                BehaviorOutput::Announce(text) => self.announce(text),
                BehaviorOutput::Greeted { person, until } => {
                    if let Err(e) = self.memory.mark_greeted(person, until) {
                        warn!(person_id = %person, error = %e, "failed to store greeting cooldown");
                    }
                }
            }
        }
    }

    fn submit(&self, command: RobotCommand) {
        if let Err(e) = self.dispatcher.submit(command) {
            warn!(error = %e, "command not queued");
        }
    }

    fn announce(&self, text: String) {
        self.publish(Topic::Conversation, EventPayload::Spoke(text.clone()));
        let voice = self.voice.clone();
        let cancel = self.announce_cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = voice.speak(&text, cancel).await {
                warn!(error = %e, "announcement failed");
            }
        });
    }

    fn publish(&self, topic: Topic, payload: EventPayload) {
        self.bus.publish_to(topic, Event::new(SOURCE, payload));
    }

    async fn shutdown(&mut self) {
        info!("shutting down");
        self.cognition_cancel.cancel();
        self.speech_cancel.cancel();
        self.announce_cancel.cancel();
        self.submit(RobotCommand::Stop);
        self.publish(Topic::Conversation, EventPayload::Spoke("Goodbye!".to_string()));
        let farewell = self.voice.speak("Goodbye!", CancellationToken::new());
        if tokio::time::timeout(FAREWELL_BUDGET, farewell).await.is_err() {
            warn!("farewell cut short");
        }
        self.dispatcher.close();
    }
}
