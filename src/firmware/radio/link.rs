use embassy_time::Instant;
use statig::prelude::*;

/// Accumulated radio time per phase. Milliseconds saturate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RadioStats {
    pub connecting_ms: u64,
    pub up_ms: u64,
    pub down_ms: u64,
    pub sessions: u32,
    pub failures: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkPhase {
    Off,
    Connecting,
    Up,
}

impl LinkPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Connecting => "connecting",
            Self::Up => "up",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(super) enum LinkEvent {
    PowerOn { at: Instant },
    Joined { at: Instant },
    JoinFailed,
    LinkLost { at: Instant },
    PowerOff { at: Instant },
}

#[derive(Clone, Copy, Debug)]
pub(super) struct RadioLink {
    pub(super) stats: RadioStats,
    pub(super) phase: LinkPhase,
    since: Instant,
}

impl RadioLink {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            stats: RadioStats::default(),
            phase: LinkPhase::Off,
            since: now,
        }
    }

    fn elapsed_ms(&mut self, at: Instant) -> u64 {
        let elapsed = at.saturating_duration_since(self.since).as_millis();
        self.since = at;
        elapsed
    }

    fn enter(&mut self, phase: LinkPhase) {
        log::debug!("radio: phase={}->{}", self.phase.as_str(), phase.as_str());
        self.phase = phase;
    }
}

#[state_machine(initial = "State::off()")]
impl RadioLink {
    #[state]
    fn off(&mut self, event: &LinkEvent) -> Outcome<State> {
        match event {
            LinkEvent::PowerOn { at } => {
                let down = self.elapsed_ms(*at);
                self.stats.down_ms = self.stats.down_ms.saturating_add(down);
                self.enter(LinkPhase::Connecting);
                Transition(State::connecting())
            }
            _ => Handled,
        }
    }

    #[state(superstate = "powered")]
    fn connecting(&mut self, event: &LinkEvent) -> Outcome<State> {
        match event {
            LinkEvent::Joined { at } => {
                let connecting = self.elapsed_ms(*at);
                self.stats.connecting_ms = self.stats.connecting_ms.saturating_add(connecting);
                self.stats.sessions = self.stats.sessions.saturating_add(1);
                self.enter(LinkPhase::Up);
                Transition(State::up())
            }
            LinkEvent::JoinFailed => {
                self.stats.failures = self.stats.failures.saturating_add(1);
                Handled
            }
            LinkEvent::PowerOff { at } => {
                let connecting = self.elapsed_ms(*at);
                self.stats.connecting_ms = self.stats.connecting_ms.saturating_add(connecting);
                self.enter(LinkPhase::Off);
                Transition(State::off())
            }
            _ => Super,
        }
    }

    #[state(superstate = "powered")]
    fn up(&mut self, event: &LinkEvent) -> Outcome<State> {
        match event {
            LinkEvent::LinkLost { at } => {
                let up = self.elapsed_ms(*at);
                self.stats.up_ms = self.stats.up_ms.saturating_add(up);
                self.enter(LinkPhase::Connecting);
                Transition(State::connecting())
            }
            LinkEvent::PowerOff { at } => {
                let up = self.elapsed_ms(*at);
                self.stats.up_ms = self.stats.up_ms.saturating_add(up);
                self.enter(LinkPhase::Off);
                Transition(State::off())
            }
            _ => Super,
        }
    }

    /// Hardware is already initialised; a second power-on is a no-op.
    #[superstate]
    fn powered(&mut self, event: &LinkEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}
