//! [`BehaviorScheduler`] – what the robot does when nobody is talking to it.
//!
//! Pending [`BehaviorTask`]s compete for the action channel on every
//! [`BehaviorScheduler::tick`]:
//!
//! | Kind       | Created by                                   | Priority |
//! |------------|----------------------------------------------|----------|
//! | `Follow`   | an explicit follow on/off from conversation  | highest  |
//! | `Greet`    | `PersonRecognized`, once per cooldown        |          |
//! | `IdleWalk` | completion of the previous idle walk, jittered | lowest |
//!
//! A task whose channel request is denied (the conversation holds it) stays
//! pending and is retried on the next tick. The only way a pending task
//! disappears without running is the supersede rule: a newer Greet for the
//! same person replaces the older one, and a new follow signal replaces any
//! pending follow task.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rex_kernel::{ActionGate, ChannelOwner};
use rex_memory::Person;
use rex_types::{DEFAULT_WALK_SPEED, Direction, Gesture, PersonId, RobotCommand, RobotLinkState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub idle_walk_enabled: bool,
    pub idle_walk_min_secs: i64,
    pub idle_walk_max_secs: i64,
    /// How long one idle stroll lasts before the robot stops again.
    pub idle_walk_duration_secs: i64,
    /// Channel hold after a greeting gesture.
    pub greet_hold_ms: i64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            idle_walk_enabled: true,
            idle_walk_min_secs: 30,
            idle_walk_max_secs: 90,
            idle_walk_duration_secs: 3,
            greet_hold_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorKind {
    IdleWalk,
    Greet,
    Follow { enabled: bool },
}

impl BehaviorKind {
    fn priority(self) -> u8 {
        match self {
            BehaviorKind::IdleWalk => 0,
            BehaviorKind::Greet => 1,
            BehaviorKind::Follow { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorTask {
    pub id: u64,
    pub kind: BehaviorKind,
    pub target: Option<PersonId>,
    pub target_name: Option<String>,
    pub eligible_at: DateTime<Utc>,
}

/// What the owning task must do after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum BehaviorOutput {
    /// Already authorized by the gate; submit as-is.
    Command(RobotCommand),
    Announce(String),
    /// Persist the greeting cooldown for `person`.
    Greeted { person: PersonId, until: DateTime<Utc> },
}

pub struct BehaviorScheduler {
    config: BehaviorConfig,
    greeting_cooldown: Duration,
    rng: StdRng,
    pending: Vec<BehaviorTask>,
    active: Option<(BehaviorTask, DateTime<Utc>)>,
    offered: HashMap<PersonId, DateTime<Utc>>,
    following: bool,
    next_id: u64,
}

impl BehaviorScheduler {
    /// `greeting_cooldown` is shared with the vision tracker so both agree
    /// on when a person may be greeted again.
    pub fn new(config: BehaviorConfig, greeting_cooldown: Duration, now: DateTime<Utc>) -> Self {
        Self::with_rng(config, greeting_cooldown, StdRng::from_entropy(), now)
    }

    /// Deterministic jitter for tests.
    pub fn with_seed(
        config: BehaviorConfig,
        greeting_cooldown: Duration,
        seed: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_rng(config, greeting_cooldown, StdRng::seed_from_u64(seed), now)
    }

    fn with_rng(config: BehaviorConfig, greeting_cooldown: Duration, rng: StdRng, now: DateTime<Utc>) -> Self {
        let mut scheduler = Self {
            config,
            greeting_cooldown,
            rng,
            pending: Vec::new(),
            active: None,
            offered: HashMap::new(),
            following: false,
            next_id: 0,
        };
        scheduler.schedule_idle_walk(now);
        scheduler
    }

    pub fn pending(&self) -> &[BehaviorTask] {
        &self.pending
    }

    pub fn active(&self) -> Option<&BehaviorTask> {
        self.active.as_ref().map(|(task, _)| task)
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    /// Offer a greeting for `person`. Returns whether a Greet task was
    /// created.
    pub fn on_person_recognized(&mut self, person: &Person, now: DateTime<Utc>) -> bool {
        if !person.greeting_due(now) {
            debug!(person_id = %person.id, "greeting still in cooldown");
            return false;
        }
        if let Some(offered) = self.offered.get(&person.id) {
            if now - *offered < self.greeting_cooldown {
                debug!(person_id = %person.id, "greeting already offered");
                return false;
            }
        }
        self.pending
            .retain(|t| !(t.kind == BehaviorKind::Greet && t.target == Some(person.id)));
        let task = self.task(BehaviorKind::Greet, Some(person.id), Some(person.name.clone()), now);
        info!(person_id = %person.id, name = %person.name, "greeting scheduled");
        self.pending.push(task);
        self.offered.insert(person.id, now);
        true
    }

    /// Follow on/off requested by the conversation.
    pub fn set_follow(&mut self, enabled: bool, target: Option<PersonId>, now: DateTime<Utc>) {
        self.pending.retain(|t| !matches!(t.kind, BehaviorKind::Follow { .. }));
        if enabled || self.following {
            let task = self.task(BehaviorKind::Follow { enabled }, target, None, now);
            self.pending.push(task);
        }
    }

    /// The conversation took the channel away. Returns the interrupted
    /// task kind, if any.
    pub fn preempted(&mut self, now: DateTime<Utc>) -> Option<BehaviorKind> {
        let (task, _) = self.active.take()?;
        debug!(kind = ?task.kind, "behavior preempted");
        self.after(task.kind, now);
        Some(task.kind)
    }

    /// Run one scheduling round.
    pub fn tick(&mut self, now: DateTime<Utc>, gate: &mut ActionGate, link: &RobotLinkState) -> Vec<BehaviorOutput> {
        let mut outputs = Vec::new();

        if let Some((task, until)) = &self.active {
            if !gate.arbiter().is_held_by(ChannelOwner::Behavior) {
                self.preempted(now);
            } else if now >= *until {
                let kind = task.kind;
                self.active = None;
                if kind == BehaviorKind::IdleWalk {
                    outputs.push(BehaviorOutput::Command(RobotCommand::Stop));
                }
                gate.arbiter_mut().release(ChannelOwner::Behavior);
                self.after(kind, now);
                return outputs;
            } else {
                return outputs;
            }
        }

        if gate.is_latched() {
            return outputs;
        }
        let Some(index) = self.best_eligible(now) else {
            return outputs;
        };
        let commands = plan(&mut self.rng, &self.pending[index]);

        if let Err(e) = gate.arbiter_mut().try_acquire(ChannelOwner::Behavior) {
            debug!(error = %e, kind = ?self.pending[index].kind, "channel busy, task stays pending");
            return outputs;
        }
        for command in &commands {
            if let Err(e) = gate.authorize(ChannelOwner::Behavior, command, link) {
                warn!(error = %e, kind = ?self.pending[index].kind, "behavior command rejected");
                gate.arbiter_mut().release(ChannelOwner::Behavior);
                return outputs;
            }
        }

        let task = self.pending.remove(index);
        info!(kind = ?task.kind, task_id = task.id, "behavior started");
        outputs.extend(commands.into_iter().map(BehaviorOutput::Command));
        let hold = match task.kind {
            BehaviorKind::IdleWalk => Duration::seconds(self.config.idle_walk_duration_secs),
            BehaviorKind::Greet => {
                if let Some(person) = task.target {
                    let name = task.target_name.as_deref().unwrap_or("there");
                    outputs.push(BehaviorOutput::Announce(format!("Hi {name}!")));
                    outputs.push(BehaviorOutput::Greeted {
                        person,
                        until: now + self.greeting_cooldown,
                    });
                }
                Duration::milliseconds(self.config.greet_hold_ms)
            }
            BehaviorKind::Follow { enabled } => {
                self.following = enabled;
                Duration::zero()
            }
        };
        self.active = Some((task, now + hold));
        outputs
    }

    fn best_eligible(&self, now: DateTime<Utc>) -> Option<usize> {
        let idle_allowed = self.config.idle_walk_enabled && !self.following;
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, t)| t.eligible_at <= now)
            .filter(|(_, t)| t.kind != BehaviorKind::IdleWalk || idle_allowed)
            .max_by(|(_, a), (_, b)| {
                a.kind
                    .priority()
                    .cmp(&b.kind.priority())
                    .then(b.eligible_at.cmp(&a.eligible_at))
            })
            .map(|(i, _)| i)
    }

    fn after(&mut self, kind: BehaviorKind, now: DateTime<Utc>) {
        if let BehaviorKind::Follow { enabled } = kind {
            self.following = enabled;
        }
        self.schedule_idle_walk(now);
    }

    fn schedule_idle_walk(&mut self, now: DateTime<Utc>) {
        if !self.config.idle_walk_enabled || self.pending.iter().any(|t| t.kind == BehaviorKind::IdleWalk) {
            return;
        }
        let lo = self.config.idle_walk_min_secs.min(self.config.idle_walk_max_secs);
        let hi = self.config.idle_walk_min_secs.max(self.config.idle_walk_max_secs);
        let delay = Duration::seconds(self.rng.gen_range(lo..=hi));
        let task = self.task(BehaviorKind::IdleWalk, None, None, now + delay);
        debug!(eligible_at = %task.eligible_at, "idle walk scheduled");
        self.pending.push(task);
    }

    fn task(
        &mut self,
        kind: BehaviorKind,
        target: Option<PersonId>,
        target_name: Option<String>,
        eligible_at: DateTime<Utc>,
    ) -> BehaviorTask {
        self.next_id += 1;
        BehaviorTask {
            id: self.next_id,
            kind,
            target,
            target_name,
            eligible_at,
        }
    }
}

fn plan(rng: &mut StdRng, task: &BehaviorTask) -> Vec<RobotCommand> {
    match task.kind {
        BehaviorKind::IdleWalk => {
            let directions = [Direction::Forward, Direction::Left, Direction::Right];
            let direction = directions[rng.gen_range(0..directions.len())];
            vec![RobotCommand::Walk {
                direction,
                speed: DEFAULT_WALK_SPEED,
            }]
        }
        BehaviorKind::Greet => vec![RobotCommand::Gesture(Gesture::Wave)],
        BehaviorKind::Follow { enabled } => vec![RobotCommand::Follow {
            enabled,
            target: task.target,
        }],
    }
}
