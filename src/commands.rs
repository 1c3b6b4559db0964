//! Command action registry.
//!
//! Inbound commands name their action as a string. The table below is the
//! only place an action string is interpreted; everything else dispatches
//! on [`CommandKind`]. Unknown actions fail with [`Error::UnknownAction`]
//! instead of being derived into a method name.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Build the initiation config, store the pending blob and return the
    /// SMS payloads through the task-close pipe.
    Format,
    /// Send a free-text command to the live device.
    Execute,
    /// Read the full device configuration back.
    ReadSettings,
    /// Apply a single configuration option.
    SetOption,
    /// A protocol wire command addressed to the live connection.
    Device,
}

const ACTIONS: &[(&str, CommandKind)] = &[
    ("format", CommandKind::Format),
    ("execute", CommandKind::Execute),
    ("readSettings", CommandKind::ReadSettings),
    ("setOption", CommandKind::SetOption),
    ("getStatus", CommandKind::Device),
    ("getImei", CommandKind::Device),
    ("getRegisteredIButtons", CommandKind::Device),
    ("getPhones", CommandKind::Device),
    ("getTrackParams", CommandKind::Device),
    ("removeTrackFromBuffer", CommandKind::Device),
    ("restart", CommandKind::Device),
    ("setGprsParams", CommandKind::Device),
    ("getImage", CommandKind::Device),
];

pub fn lookup(action: &str) -> Result<CommandKind> {
    ACTIONS
        .iter()
        .find(|(name, _)| *name == action)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| Error::UnknownAction(action.to_string()))
}
