//! Command channel
//!
//! Control messages arrive on the subscribed control topic while the
//! client is being polled. They are queued here and drained by the
//! scheduler after its telemetry work, strictly in arrival order.

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};

use crate::Millis;

/// Queued control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    /// Monotonic receipt time
    pub received_at: Millis,
    /// First whitespace-separated token
    pub command: String,
    /// Remainder after the token, if any
    pub argument: Option<String>,
}

impl CommandEntry {
    /// Split a payload into command and argument
    ///
    /// Leading whitespace is skipped, the token ends at the next whitespace
    /// run, and the argument is everything after that run. Returns `None`
    /// for a blank payload.
    pub fn parse(payload: &str, received_at: Millis) -> Option<Self> {
        let trimmed = payload.trim_start();
        if trimmed.is_empty() {
            return None;
        }
        let (command, argument) = match trimmed.find(char::is_whitespace) {
            None => (trimmed, None),
            Some(end) => {
                let rest = trimmed[end..].trim_start();
                (&trimmed[..end], (!rest.is_empty()).then_some(rest))
            }
        };
        Some(Self {
            received_at,
            command: command.to_string(),
            argument: argument.map(ToString::to_string),
        })
    }

    /// Interpret the entry
    pub fn to_command(&self) -> Command {
        Command::parse(&self.command, self.argument.as_deref())
    }
}

/// Recognised commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// `reboot` or `reset`: announce and restart
    Reboot,
    /// `switchap`: logged only
    SwitchAp,
    /// `rescanwifi`: logged only
    RescanWifi,
    /// `measure [mask]`: sample now with the given trigger bits
    Measure(Option<u8>),
    Unknown,
}

impl Command {
    pub fn parse(command: &str, argument: Option<&str>) -> Self {
        match command {
            "reboot" | "reset" => Command::Reboot,
            "switchap" => Command::SwitchAp,
            "rescanwifi" => Command::RescanWifi,
            "measure" => Command::Measure(argument.and_then(|a| a.trim().parse().ok())),
            _ => Command::Unknown,
        }
    }
}

/// FIFO of received commands
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: VecDeque<CommandEntry>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a message from the control topic
    ///
    /// Retained messages are replays of old commands and are dropped, as
    /// are blank and non-UTF-8 payloads. Returns true if an entry was queued.
    pub fn on_message(&mut self, payload: &[u8], retained: bool, now: Millis) -> bool {
        let Ok(text) = core::str::from_utf8(payload) else {
            warn!("control payload is not UTF-8 ({=usize} bytes)", payload.len());
            return false;
        };
        let Some(entry) = CommandEntry::parse(text, now) else {
            return false;
        };
        if retained {
            debug!("ignoring retained command");
            return false;
        }
        info!("queued command at {=u64}", entry.received_at);
        self.entries.push_back(entry);
        true
    }

    /// Oldest pending entry
    pub fn pop_next(&mut self) -> Option<CommandEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
