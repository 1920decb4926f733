//! # Dispatch
//!
//! Listing interfaces and querying the version run as soon as they are seen
//! and disarm any pending action. Link types, configuration schema and capture
//! are only armed: the last one armed runs once all options are handled.
//! Help runs right away and ends everything.

use anyhow::Result;
use log::debug;

use super::SessionConfig;

/// Actions that wait for all options to be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Deferred {
    LinkTypes,
    ConfigSchema,
    Capture,
}

/// What a single option asks for, in option order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    ListInterfaces,
    Version,
    Help,
    Arm(Deferred),
}

#[derive(Debug)]
pub(crate) struct Invocation {
    pub(crate) config: SessionConfig,
    pub(crate) steps: Vec<Step>,
}

pub(crate) trait Actions {
    fn list_interfaces(&mut self, config: &SessionConfig) -> Result<()>;
    fn version(&mut self) -> Result<()>;
    fn help(&mut self) -> Result<()>;
    fn link_types(&mut self, config: &SessionConfig) -> Result<()>;
    fn config_schema(&mut self, config: &SessionConfig) -> Result<()>;
    fn capture(&mut self, config: &SessionConfig) -> Result<()>;
}

pub(crate) fn dispatch(invocation: &Invocation, actions: &mut dyn Actions) -> Result<()> {
    let config = &invocation.config;
    let mut armed = None;

    for step in invocation.steps.iter() {
        match step {
            Step::Help => return actions.help(),
            Step::ListInterfaces => {
                armed = None;
                actions.list_interfaces(config)?;
            }
            Step::Version => {
                armed = None;
                actions.version()?;
            }
            Step::Arm(deferred) => armed = Some(*deferred),
        }
    }

    match armed {
        Some(Deferred::LinkTypes) => actions.link_types(config),
        Some(Deferred::ConfigSchema) => actions.config_schema(config),
        Some(Deferred::Capture) => actions.capture(config),
        None => {
            debug!("Nothing left to do");
            Ok(())
        }
    }
}
