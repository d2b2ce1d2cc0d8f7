//! Command grammar carried inside request payloads.
//!
//! Payloads are whitespace-tokenized text. They are decoded exactly once,
//! at the boundary where they enter a component, into tagged enums that
//! the rest of the system matches on exhaustively:
//!
//! - the broker splits `<identity> <command…>` with [`split_target`]
//! - the daemon decodes `<command…>` into a [`DaemonCommand`]
//! - device commands carry a [`DeviceOp`] down to the session worker

use std::fmt;
use std::time::Duration;

use kasa_core::{DeviceKey, Identity};
use thiserror::Error;

/// Errors produced while decoding a payload.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("empty request")]
    Empty,

    #[error("missing command after target '{0}'")]
    MissingCommand(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("'{command}' requires <{argument}>")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("'{command}' takes at most {max} arguments, got {got}")]
    TooManyArguments {
        command: &'static str,
        max: usize,
        got: usize,
    },

    #[error("invalid {argument} '{value}' for '{command}'")]
    InvalidArgument {
        command: &'static str,
        argument: &'static str,
        value: String,
    },
}

// ============================================================================
// Broker: target split
// ============================================================================

/// A client payload split into routing target and forwarded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedPayload {
    /// Identity of the daemon that must receive the command
    pub target: Identity,
    /// Remaining tokens, single-space joined
    pub command: String,
}

/// Splits a client payload at its first whitespace-delimited token.
pub fn split_target(payload: &str) -> Result<RoutedPayload, CommandError> {
    let mut tokens = payload.split_whitespace();
    let target = tokens.next().ok_or(CommandError::Empty)?;
    let command = tokens.collect::<Vec<_>>().join(" ");

    if command.is_empty() {
        return Err(CommandError::MissingCommand(target.to_string()));
    }

    Ok(RoutedPayload {
        target: Identity::new(target),
        command,
    })
}

// ============================================================================
// Daemon: command decoding
// ============================================================================

/// A command addressed to a daemon's session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonCommand {
    /// Open (or reuse) the session for a device
    Connect(DeviceKey),
    /// Close the session for a device and stop its worker
    Disconnect(DeviceKey),
    /// List tracked device keys (`active` and `list`)
    Active,
    /// List tracked sessions with their state
    Sessions,
    /// Scan for reachable devices
    Discover,
    /// Forward an operation to the device's worker
    Device { key: DeviceKey, op: DeviceOp },
}

impl DaemonCommand {
    /// Decodes `<command> [<key> <args…>]`.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let (verb, rest) = tokens.split_first().ok_or(CommandError::Empty)?;

        match *verb {
            "active" | "list" => no_arguments("active", rest).map(|()| Self::Active),
            "sessions" => no_arguments("sessions", rest).map(|()| Self::Sessions),
            "discover" => no_arguments("discover", rest).map(|()| Self::Discover),
            "connect" => only_key("connect", rest).map(Self::Connect),
            "disconnect" => only_key("disconnect", rest).map(Self::Disconnect),
            other => {
                let verb = DeviceOp::known_verb(other)
                    .ok_or_else(|| CommandError::UnknownCommand(other.to_string()))?;
                let (key, args) = rest.split_first().ok_or(CommandError::MissingArgument {
                    command: verb,
                    argument: "key",
                })?;
                let op = DeviceOp::parse(verb, args)?;
                Ok(Self::Device {
                    key: DeviceKey::new(*key),
                    op,
                })
            }
        }
    }

    /// Extracts the device key from the text of a device command without
    /// validating its arguments.
    ///
    /// Lets a daemon answer `unknown_device` for a key it has no session
    /// for before complaining about the argument list.
    pub fn device_target(text: &str) -> Option<DeviceKey> {
        let mut tokens = text.split_whitespace();
        let verb = tokens.next()?;
        DeviceOp::known_verb(verb)?;
        tokens.next().map(DeviceKey::new)
    }

    /// Returns the device this command targets, if any.
    pub fn key(&self) -> Option<&DeviceKey> {
        match self {
            Self::Connect(key) | Self::Disconnect(key) | Self::Device { key, .. } => Some(key),
            Self::Active | Self::Sessions | Self::Discover => None,
        }
    }
}

fn no_arguments(command: &'static str, rest: &[&str]) -> Result<(), CommandError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(CommandError::TooManyArguments {
            command,
            max: 0,
            got: rest.len(),
        })
    }
}

fn only_key(command: &'static str, rest: &[&str]) -> Result<DeviceKey, CommandError> {
    match rest {
        [key] => Ok(DeviceKey::new(*key)),
        [] => Err(CommandError::MissingArgument {
            command,
            argument: "key",
        }),
        _ => Err(CommandError::TooManyArguments {
            command,
            max: 1,
            got: rest.len(),
        }),
    }
}

// ============================================================================
// Worker: device operations
// ============================================================================

/// An operation executed by a session worker against its device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOp {
    /// Read the value at a handle
    Read { addr: String },
    /// Write a value to a handle
    Write { addr: String, value: String },
    /// Enable a sensor, wait, read it, disable it
    ReadValue {
        ctrl_addr: String,
        read_addr: String,
        enable_cmd: String,
        disable_cmd: String,
        /// Settle time between enable and read; `None` uses the configured default
        settle: Option<Duration>,
    },
    /// Switch on
    On,
    /// Switch off
    Off,
    /// Query switch state (`on`/`off`)
    State,
}

impl DeviceOp {
    const VERBS: [&'static str; 6] = ["read", "write", "read_value", "on", "off", "state"];

    fn known_verb(verb: &str) -> Option<&'static str> {
        Self::VERBS.iter().copied().find(|v| *v == verb)
    }

    /// Decodes a device operation from its verb and the arguments after the key.
    pub fn parse(verb: &str, args: &[&str]) -> Result<Self, CommandError> {
        let verb = Self::known_verb(verb)
            .ok_or_else(|| CommandError::UnknownCommand(verb.to_string()))?;

        match (verb, args) {
            ("read", [addr]) => Ok(Self::Read {
                addr: addr.to_string(),
            }),
            ("write", [addr, value]) => Ok(Self::Write {
                addr: addr.to_string(),
                value: value.to_string(),
            }),
            ("read_value", [ctrl, read, enable, disable, rest @ ..]) if rest.len() <= 1 => {
                let settle = match rest.first() {
                    Some(raw) => Some(parse_settle(raw)?),
                    None => None,
                };
                Ok(Self::ReadValue {
                    ctrl_addr: ctrl.to_string(),
                    read_addr: read.to_string(),
                    enable_cmd: enable.to_string(),
                    disable_cmd: disable.to_string(),
                    settle,
                })
            }
            ("on", []) => Ok(Self::On),
            ("off", []) => Ok(Self::Off),
            ("state", []) => Ok(Self::State),
            (verb, args) => Err(arity_error(verb, args.len())),
        }
    }

    /// Returns the command verb.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::ReadValue { .. } => "read_value",
            Self::On => "on",
            Self::Off => "off",
            Self::State => "state",
        }
    }
}

fn arity_error(verb: &'static str, got: usize) -> CommandError {
    let (max, missing) = match verb {
        "read" => (1, "addr"),
        "write" => (2, if got == 0 { "addr" } else { "value" }),
        "read_value" => (5, "ctrl_addr read_addr enable_cmd disable_cmd"),
        _ => (0, ""),
    };
    if got > max {
        CommandError::TooManyArguments {
            command: verb,
            max,
            got,
        }
    } else {
        CommandError::MissingArgument {
            command: verb,
            argument: missing,
        }
    }
}

fn parse_settle(raw: &str) -> Result<Duration, CommandError> {
    raw.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| CommandError::InvalidArgument {
            command: "read_value",
            argument: "sleep",
            value: raw.to_string(),
        })
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { addr } => write!(f, "read {addr}"),
            Self::Write { addr, value } => write!(f, "write {addr} {value}"),
            Self::ReadValue {
                ctrl_addr,
                read_addr,
                enable_cmd,
                disable_cmd,
                settle,
            } => {
                write!(
                    f,
                    "read_value {ctrl_addr} {read_addr} {enable_cmd} {disable_cmd}"
                )?;
                if let Some(settle) = settle {
                    write!(f, " {}", settle.as_secs_f64())?;
                }
                Ok(())
            }
            Self::On | Self::Off | Self::State => f.write_str(self.verb()),
        }
    }
}
