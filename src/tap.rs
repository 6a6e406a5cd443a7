//! Table-driven TAP controller state tracking.
//!
//! Only the states the shift primitives ever need to rest in are tracked.
//! Exit1 and Pause stand for both their DR and IR variants, and Shift-DR and
//! Shift-IR are interchangeable when a caller just needs "shifting".

use crate::buffer::{CommandBuffer, Result, Transport};
use crate::mpsse::{Command, MAX_TMS_CLOCKS};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TapState {
    /// Not yet known, such as right after power-on.
    Unknown,
    Reset,
    Idle,
    SelectDr,
    SelectIr,
    ShiftDr,
    ShiftIr,
    Exit1,
    Pause,
    Update,
}

impl TapState {
    pub fn is_shift(&self) -> bool {
        matches!(self, TapState::ShiftDr | TapState::ShiftIr)
    }
}

/// One legal transition: TMS values to clock, first element first.
struct Transition {
    from: TapState,
    to: TapState,
    tms: &'static [u8],
}

const fn t(from: TapState, to: TapState, tms: &'static [u8]) -> Transition {
    Transition { from, to, tms }
}

use TapState::*;

const TRANSITIONS: &[Transition] = &[
    t(Reset,    Idle,     &[0]),
    t(Reset,    ShiftDr,  &[0, 1, 0, 0]),
    t(Reset,    ShiftIr,  &[0, 1, 1, 0, 0]),
    t(Idle,     Reset,    &[1, 1, 1]),
    t(Idle,     SelectDr, &[1]),
    t(Idle,     SelectIr, &[1, 1]),
    t(Idle,     ShiftDr,  &[1, 0, 0]),
    t(Idle,     ShiftIr,  &[1, 1, 0, 0]),
    t(SelectDr, ShiftDr,  &[0, 0]),
    t(SelectDr, SelectIr, &[1]),
    t(SelectIr, ShiftIr,  &[0, 0]),
    t(SelectIr, Reset,    &[1]),
    t(ShiftDr,  Exit1,    &[1]),
    t(ShiftIr,  Exit1,    &[1]),
    t(ShiftDr,  Pause,    &[1, 0]),
    t(ShiftIr,  Pause,    &[1, 0]),
    t(ShiftDr,  Update,   &[1, 1]),
    t(ShiftIr,  Update,   &[1, 1]),
    t(ShiftDr,  Idle,     &[1, 1, 0]),
    t(ShiftIr,  Idle,     &[1, 1, 0]),
    t(ShiftDr,  Reset,    &[1, 1, 1, 1, 1]),
    t(ShiftIr,  Reset,    &[1, 1, 1, 1, 1]),
    t(Exit1,    Pause,    &[0]),
    t(Exit1,    Update,   &[1]),
    t(Exit1,    Idle,     &[1, 0]),
    t(Exit1,    Reset,    &[1, 1, 1, 1]),
    t(Pause,    ShiftDr,  &[1, 0]),
    t(Pause,    ShiftIr,  &[1, 0]),
    t(Pause,    Idle,     &[1, 1, 0]),
    t(Pause,    Reset,    &[1, 1, 1, 1, 1]),
    t(Update,   Idle,     &[0]),
    t(Update,   ShiftDr,  &[1, 0, 0]),
    t(Update,   ShiftIr,  &[1, 1, 0, 0]),
    t(Update,   Reset,    &[1, 1, 1]),
    t(Unknown,  Reset,    &[1, 1, 1, 1, 1]),
];

/// TMS sequence reaching Test-Logic-Reset from any state.
const FORCE_RESET: &[u8] = &[1, 1, 1, 1, 1];

/// Look up the TMS sequence for `from` -> `to`.
pub fn tms_path(from: TapState, to: TapState) -> Option<&'static [u8]> {
    TRANSITIONS.iter().find(|t| t.from == from && t.to == to).map(|t| t.tms)
}

/// Pack a TMS sequence into the LSB-first operand of a TMS command.
fn pack(tms: &[u8]) -> u8 {
    tms.iter().enumerate().fold(0, |acc, (i, &b)| acc | ((b & 1) << i))
}

/// Tracks the TAP controller state and emits transitions into a `CommandBuffer`.
#[derive(Clone, Debug)]
pub struct TapController {
    state: TapState,
}

impl Default for TapController {
    fn default() -> Self {
        TapController { state: TapState::Unknown }
    }
}

impl TapController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    /// Whether being in the current state satisfies a requirement for `required`.
    pub fn satisfies(&self, required: TapState) -> bool {
        self.state == TapState::Unknown
            || self.state == required
            || (self.state.is_shift() && required.is_shift())
    }

    /// Move to `required` if not already there, with TDI held low and no capture.
    pub fn require<T: Transport>(&mut self, buf: &mut CommandBuffer<T>, required: TapState)
        -> Result<()>
    {
        self.transition(buf, required, false, false)?;
        Ok(())
    }

    /// Move to `required` if not already there.
    ///
    /// `tdi` is driven during every clock of the transition, so the first
    /// clock (which leaves a Shift state) shifts it in as a data bit. If `read`
    /// is set, TDO is captured on each clock of the transition.
    ///
    /// Returns whether a transition was emitted.
    pub fn transition<T: Transport>(
        &mut self, buf: &mut CommandBuffer<T>, required: TapState, tdi: bool, read: bool
    ) -> Result<bool> {
        if self.satisfies(required) {
            return Ok(false);
        }
        match tms_path(self.state, required) {
            Some(tms) => {
                log::trace!("TAP {:?} -> {:?} via {:?}", self.state, required, tms);
                buf.push(&Command::tms(tms.len(), pack(tms), tdi, read))?;
                self.state = required;
                Ok(true)
            },
            None => {
                log::error!("No TAP transition from {:?} to {:?}", self.state, required);
                Ok(false)
            },
        }
    }

    /// Drive the TAP into Test-Logic-Reset and then hold TMS high for
    /// `hold` further clocks.
    ///
    /// States without a table entry to Reset, including Unknown, are forced
    /// there with five TMS-high clocks.
    pub fn reset<T: Transport>(&mut self, buf: &mut CommandBuffer<T>, hold: usize) -> Result<()> {
        if self.state != TapState::Reset {
            let tms = match self.state {
                TapState::Unknown => FORCE_RESET,
                state => tms_path(state, TapState::Reset).unwrap_or(FORCE_RESET),
            };
            buf.push(&Command::tms(tms.len(), pack(tms), false, false))?;
            self.state = TapState::Reset;
        }
        let mut remaining = hold;
        while remaining > 0 {
            let clocks = remaining.min(MAX_TMS_CLOCKS);
            buf.push(&Command::tms(clocks, 0x7F, false, false))?;
            remaining -= clocks;
        }
        Ok(())
    }

    /// Forget the current state, for example after the adapter was reset.
    pub fn invalidate(&mut self) {
        self.state = TapState::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Full IEEE 1149.1 controller, used as an independent reference.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    enum Ieee {
        TestLogicReset, RunTestIdle,
        SelectDr, CaptureDr, ShiftDr, Exit1Dr, PauseDr, Exit2Dr, UpdateDr,
        SelectIr, CaptureIr, ShiftIr, Exit1Ir, PauseIr, Exit2Ir, UpdateIr,
    }

    const ALL: [Ieee; 16] = [
        Ieee::TestLogicReset, Ieee::RunTestIdle,
        Ieee::SelectDr, Ieee::CaptureDr, Ieee::ShiftDr, Ieee::Exit1Dr, Ieee::PauseDr,
        Ieee::Exit2Dr, Ieee::UpdateDr,
        Ieee::SelectIr, Ieee::CaptureIr, Ieee::ShiftIr, Ieee::Exit1Ir, Ieee::PauseIr,
        Ieee::Exit2Ir, Ieee::UpdateIr,
    ];

    fn next(state: Ieee, tms: u8) -> Ieee {
        use Ieee::*;
        match (state, tms != 0) {
            (TestLogicReset, true) => TestLogicReset,
            (TestLogicReset, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDr,
            (RunTestIdle, false) => RunTestIdle,
            (SelectDr, true) => SelectIr,
            (SelectDr, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDr,
            (UpdateDr, false) => RunTestIdle,
            (SelectIr, true) => TestLogicReset,
            (SelectIr, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDr,
            (UpdateIr, false) => RunTestIdle,
        }
    }

    /// Concrete states a tracked state stands for.
    fn concrete(state: TapState) -> Vec<Ieee> {
        match state {
            Unknown => ALL.to_vec(),
            Reset => vec![Ieee::TestLogicReset],
            Idle => vec![Ieee::RunTestIdle],
            SelectDr => vec![Ieee::SelectDr],
            SelectIr => vec![Ieee::SelectIr],
            ShiftDr => vec![Ieee::ShiftDr],
            ShiftIr => vec![Ieee::ShiftIr],
            Exit1 => vec![Ieee::Exit1Dr, Ieee::Exit1Ir],
            Pause => vec![Ieee::PauseDr, Ieee::PauseIr],
            Update => vec![Ieee::UpdateDr, Ieee::UpdateIr],
        }
    }

    #[test]
    fn test_every_transition_lands_in_target() {
        for transition in TRANSITIONS {
            assert!(transition.tms.len() <= MAX_TMS_CLOCKS);
            for start in concrete(transition.from) {
                let end = transition.tms.iter().fold(start, |s, &tms| next(s, tms));
                let targets = match transition.to {
                    // Returning from Pause resumes whichever register was paused.
                    ShiftDr | ShiftIr if transition.from == Pause =>
                        vec![Ieee::ShiftDr, Ieee::ShiftIr],
                    to => concrete(to),
                };
                assert!(targets.contains(&end),
                        "{:?} -> {:?} from {:?} ended in {:?}",
                        transition.from, transition.to, start, end);
            }
        }
    }

    #[test]
    fn test_table_has_no_duplicates() {
        for (i, a) in TRANSITIONS.iter().enumerate() {
            for b in &TRANSITIONS[i + 1..] {
                assert!(!(a.from == b.from && a.to == b.to), "{:?} -> {:?}", a.from, a.to);
            }
        }
    }

    #[test]
    fn test_pack() {
        assert_eq!(pack(&[1, 1, 0, 0]), 0b0011);
        assert_eq!(pack(&[0, 1, 0, 0]), 0b0010);
        assert_eq!(pack(FORCE_RESET), 0b11111);
    }

    #[test]
    fn test_satisfies() {
        let mut tap = TapController::new();
        assert!(tap.satisfies(Idle));
        tap.state = ShiftIr;
        assert!(tap.satisfies(ShiftDr));
        assert!(!tap.satisfies(Idle));
    }
}
