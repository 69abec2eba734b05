//! The continue decision: for each debug event, should the virtual process
//! halt and be reported, and should the underlying exception be delivered to
//! the debuggee? This is where "only the guest exists" is enforced.

use crate::debug_event::{exception, DebugEventInfo, EngineEvent};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecisionStrength {
    None,
    Weak,
    Strong,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    strength: DecisionStrength,
    halt: bool,
    pass_exception: bool,
}

impl Default for Decision {
    fn default() -> Self {
        Decision {
            strength: DecisionStrength::None,
            halt: false,
            pass_exception: true,
        }
    }
}

impl Decision {
    pub fn new(strength: DecisionStrength, halt: bool, pass_exception: bool) -> Self {
        Decision {
            strength,
            halt,
            pass_exception,
        }
    }

    pub fn strength(&self) -> DecisionStrength {
        self.strength
    }

    /// Halting requires an actual decision, not just the default.
    pub fn is_halt(&self) -> bool {
        self.strength != DecisionStrength::None && self.halt
    }

    pub fn pass_exception(&self) -> bool {
        self.pass_exception
    }

    /// A stronger decision overwrites a weaker one (and anything overwrites
    /// no decision). Identical decisions combine trivially. Returns `false`
    /// on an equal-strength disagreement, which is a policy bug.
    #[must_use]
    pub fn combine(&mut self, other: Decision) -> bool {
        if other == *self {
            return true;
        }
        if other.strength == self.strength {
            return false;
        }
        if other.strength > self.strength {
            *self = other;
        }
        true
    }
}

/// The standard policy, a pure function over (event, is-the-thread-guest).
///
/// Rules, in order:
/// 1. recognised guest announcements halt (weakly), nothing is passed;
/// 2. other debug strings do not halt;
/// 3. exceptions: the thread-naming artifact is swallowed; breakpoints on
///    guest threads halt strongly without delivery; any other guest
///    exception halts and is delivered; host exceptions are delivered
///    without halting;
/// 4. a guest thread exit halts, a host thread exit does not;
/// 5. process exit always halts (the client must see `W`/`X`);
/// 6. everything else neither halts nor passes.
pub fn make_continue_decision(event: &EngineEvent, thread_is_guest: bool) -> Decision {
    use DecisionStrength::{Strong, Weak};

    let mut decision = Decision::default();
    let combined = if event.guest.is_guest() {
        decision.combine(Decision::new(Weak, true, false))
    } else {
        match event.os.info {
            DebugEventInfo::OutputDebugString { .. } => {
                decision.combine(Decision::new(Weak, false, false))
            }
            DebugEventInfo::Exception { code, .. } => {
                if code == exception::THREAD_NAMING {
                    decision.combine(Decision::new(Weak, false, false))
                } else if exception::is_breakpoint(code) && thread_is_guest {
                    decision.combine(Decision::new(Strong, true, false))
                } else if thread_is_guest {
                    decision.combine(Decision::new(Weak, true, true))
                } else {
                    decision.combine(Decision::new(Weak, false, true))
                }
            }
            DebugEventInfo::ExitThread { .. } => {
                decision.combine(Decision::new(Weak, thread_is_guest, false))
            }
            DebugEventInfo::ExitProcess { .. } => decision.combine(Decision::new(Strong, true, false)),
            _ => decision.combine(Decision::new(Weak, false, false)),
        }
    };
    // The rule chain above issues one decision per event kind; a conflict
    // cannot come out of it.
    debug_assert!(combined);
    decision
}
