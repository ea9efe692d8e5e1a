//! Veth link state machine
//!
//! Tracks one container's veth pair through an attach or detach using the
//! state-machines crate in dynamic mode. The macro expansion names the std
//! `Result` directly, so this module keeps the crate alias out of scope.

use crate::error::Error;
use crate::network::veth::VethNames;
use state_machines::state_machine;
use tracing::debug;

state_machine! {
    name: LinkMachine,
    dynamic: true,
    initial: Absent,
    states: [Absent, Created, Bound, Unbound],
    events {
        create {
            transition: { from: Absent, to: Created }
        }
        adopt {
            transition: { from: Absent, to: Created }
        }
        bind {
            transition: { from: [Created, Unbound], to: Bound }
        }
        unbind {
            transition: { from: Bound, to: Unbound }
        }
        teardown {
            transition: { from: Unbound, to: Absent }
        }
        abort {
            transition: { from: [Created, Bound], to: Absent }
        }
    }
}

/// Link state of one container's veth pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No pair
    Absent,
    /// Pair exists, host end on the bridge
    Created,
    /// Address present on the container-facing end
    Bound,
    /// Pair exists, the address just removed
    Unbound,
}

impl LinkState {
    /// Parse the state machine's state name
    pub fn from_name(name: &str) -> Self {
        match name {
            "Created" => LinkState::Created,
            "Bound" => LinkState::Bound,
            "Unbound" => LinkState::Unbound,
            _ => LinkState::Absent,
        }
    }
}

/// Tracks one pair through an attach or detach
pub struct LinkTracker {
    machine: DynamicLinkMachine<()>,
    local: String,
}

impl LinkTracker {
    pub fn new(names: &VethNames) -> Self {
        Self {
            machine: LinkMachine::new(()).into_dynamic(),
            local: names.local.clone(),
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_name(self.machine.current_state())
    }

    /// The pair was just created
    pub fn create(&mut self) -> crate::error::Result<()> {
        self.fire(LinkMachineEvent::Create)
    }

    /// The pair already existed
    pub fn adopt(&mut self) -> crate::error::Result<()> {
        self.fire(LinkMachineEvent::Adopt)
    }

    pub fn bind(&mut self) -> crate::error::Result<()> {
        self.fire(LinkMachineEvent::Bind)
    }

    pub fn unbind(&mut self) -> crate::error::Result<()> {
        self.fire(LinkMachineEvent::Unbind)
    }

    /// The last address went and the pair with it
    pub fn teardown(&mut self) -> crate::error::Result<()> {
        self.fire(LinkMachineEvent::Teardown)
    }

    /// A half-configured pair was rolled back
    pub fn abort(&mut self) -> crate::error::Result<()> {
        self.fire(LinkMachineEvent::Abort)
    }

    fn fire(&mut self, event: LinkMachineEvent) -> crate::error::Result<()> {
        let from = self.state();
        self.machine
            .handle(event)
            .map_err(|e| Error::StateMachine(format!("{} in state {:?}: {:?}", self.local, from, e)))?;
        debug!("{}: {:?} -> {:?}", self.local, from, self.state());
        Ok(())
    }
}
