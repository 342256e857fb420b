/// Lifecycle of the one stream a coordinator may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Starting,
    Streaming,
    Completing,
    Cancelling,
    Erroring,
}

/// State transition input for the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Admit,
    Open,
    Complete,
    Cancel,
    Fail,
    Reset,
}

/// Rejection reason for illegal phase transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyActive {
        active: SessionPhase,
    },
    NoActiveSession,
    Illegal {
        from: SessionPhase,
        transition: PhaseTransition,
    },
}

pub type PhaseResult = Result<SessionPhase, PhaseRejection>;

impl SessionPhase {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// True while stream frames are still being folded into the message.
    pub fn accepts_frames(self) -> bool {
        matches!(self, Self::Streaming | Self::Completing)
    }

    /// Applies one transition deterministically.
    ///
    /// Only `Idle` admits a new session. Terminal transitions need a live session,
    /// and `Reset` is always legal so every exit path can return to `Idle`.
    pub fn apply(self, transition: PhaseTransition) -> PhaseResult {
        match transition {
            PhaseTransition::Admit => self.apply_admit(),
            PhaseTransition::Open => self.apply_open(),
            PhaseTransition::Complete => self.apply_complete(),
            PhaseTransition::Cancel => self.apply_terminal(transition, Self::Cancelling),
            PhaseTransition::Fail => self.apply_terminal(transition, Self::Erroring),
            PhaseTransition::Reset => Ok(Self::Idle),
        }
    }

    fn apply_admit(self) -> PhaseResult {
        match self {
            Self::Idle => Ok(Self::Starting),
            active => Err(PhaseRejection::AlreadyActive { active }),
        }
    }

    fn apply_open(self) -> PhaseResult {
        match self {
            Self::Starting => Ok(Self::Streaming),
            Self::Idle => Err(PhaseRejection::NoActiveSession),
            from => Err(PhaseRejection::Illegal {
                from,
                transition: PhaseTransition::Open,
            }),
        }
    }

    fn apply_complete(self) -> PhaseResult {
        match self {
            Self::Streaming | Self::Completing => Ok(Self::Completing),
            Self::Idle => Err(PhaseRejection::NoActiveSession),
            from => Err(PhaseRejection::Illegal {
                from,
                transition: PhaseTransition::Complete,
            }),
        }
    }

    fn apply_terminal(self, transition: PhaseTransition, next: Self) -> PhaseResult {
        match self {
            Self::Starting | Self::Streaming | Self::Completing => Ok(next),
            Self::Idle => Err(PhaseRejection::NoActiveSession),
            from => Err(PhaseRejection::Illegal { from, transition }),
        }
    }
}
