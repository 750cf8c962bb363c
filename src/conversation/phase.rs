use rust_fsm::*;

state_machine! {
    conversation_phase(Active)

    Active(HydrateConfirming) => Confirming,
    Active(HydrateDone) => Done,
    Active(HydrateCancelled) => Cancelled,

    Active(Note) => Active,
    Active(ShowConfirm) => Confirming,
    Active(Finish) => Done,
    Active(Cancel) => Cancelled,

    Confirming(Affirm) => Done,
    Confirming(Branch) => Active,
    Confirming(Cancel) => Cancelled
}

/// Coarse lifecycle of a conversation session. Field-level steps all happen
/// inside `Active`; `Confirming` is entered only by summary/override
/// confirmation states, and `Done`/`Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Active,
    Confirming,
    Done,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseAction {
    Note,
    ShowConfirm,
    Finish,
    Affirm,
    Branch,
    Cancel,
}

fn hydrate(machine: &mut conversation_phase::StateMachine, phase: Phase) -> Result<(), ()> {
    let input = match phase {
        Phase::Active => return Ok(()),
        Phase::Confirming => conversation_phase::Input::HydrateConfirming,
        Phase::Done => conversation_phase::Input::HydrateDone,
        Phase::Cancelled => conversation_phase::Input::HydrateCancelled,
    };
    machine.consume(&input).map_err(|_| ())?;
    Ok(())
}

fn expected_next_phase(current: Phase, action: PhaseAction) -> Option<Phase> {
    match (current, action) {
        (Phase::Active, PhaseAction::Note) => Some(Phase::Active),
        (Phase::Active, PhaseAction::ShowConfirm) => Some(Phase::Confirming),
        (Phase::Active, PhaseAction::Finish) => Some(Phase::Done),
        (Phase::Active, PhaseAction::Cancel) => Some(Phase::Cancelled),
        (Phase::Confirming, PhaseAction::Affirm) => Some(Phase::Done),
        (Phase::Confirming, PhaseAction::Branch) => Some(Phase::Active),
        (Phase::Confirming, PhaseAction::Cancel) => Some(Phase::Cancelled),
        _ => None,
    }
}

pub fn transition(current: Phase, action: PhaseAction) -> Option<Phase> {
    let mut machine = conversation_phase::StateMachine::new();
    hydrate(&mut machine, current).ok()?;

    let input = match action {
        PhaseAction::Note => conversation_phase::Input::Note,
        PhaseAction::ShowConfirm => conversation_phase::Input::ShowConfirm,
        PhaseAction::Finish => conversation_phase::Input::Finish,
        PhaseAction::Affirm => conversation_phase::Input::Affirm,
        PhaseAction::Branch => conversation_phase::Input::Branch,
        PhaseAction::Cancel => conversation_phase::Input::Cancel,
    };

    machine.consume(&input).ok()?;
    expected_next_phase(current, action)
}
