//! The text forms shared with remote control clients: loop control settings
//! and MIDI binding descriptions. Formatting and parsing are exact inverses
//! so clients can echo back anything the engine publishes.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::control_table::{LoopAction, MidiControlType};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unknown control type {0:?}")]
    UnknownControlType(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("{0:?} is not a MIDI channel")]
    ChannelRange(String),
    #[error("{0:?} is not a MIDI value")]
    ValueRange(String),
    #[error("expected \"<channel> <type> <value> <action> <loop_name>\"")]
    MappingShape,
    #[error("expected \"<midi_through> <playback_after_recording>\"")]
    ControlsShape,
}

impl fmt::Display for MidiControlType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MidiControlType::NoteOn => "on",
            MidiControlType::NoteOff => "off",
            MidiControlType::CcOn => "cc_on",
            MidiControlType::CcOff => "cc_off",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for MidiControlType {
    type Err = ParseError;

    fn from_str(token: &str) -> Result<Self, ParseError> {
        match token {
            "on" => Ok(MidiControlType::NoteOn),
            "off" => Ok(MidiControlType::NoteOff),
            "cc_on" => Ok(MidiControlType::CcOn),
            "cc_off" => Ok(MidiControlType::CcOff),
            other => Err(ParseError::UnknownControlType(other.to_owned())),
        }
    }
}

impl fmt::Display for LoopAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LoopAction::TogglePlayback => "toggle_playback",
            LoopAction::ToggleRecording => "toggle_recording",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LoopAction {
    type Err = ParseError;

    fn from_str(token: &str) -> Result<Self, ParseError> {
        match token {
            "toggle_playback" => Ok(LoopAction::TogglePlayback),
            "toggle_recording" => Ok(LoopAction::ToggleRecording),
            other => Err(ParseError::UnknownAction(other.to_owned())),
        }
    }
}

/// One control table binding in its wire form.
#[derive(Clone, Debug, PartialEq)]
pub struct MappingSpec {
    pub channel: u8,
    pub control_type: MidiControlType,
    pub value: u8,
    pub action: LoopAction,
    pub loop_name: String,
}

impl fmt::Display for MappingSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.channel, self.control_type, self.value, self.action, self.loop_name
        )
    }
}

impl FromStr for MappingSpec {
    type Err = ParseError;

    fn from_str(serialized: &str) -> Result<Self, ParseError> {
        let mut tokens = serialized.split_whitespace();

        let channel_token = tokens.next().ok_or(ParseError::MappingShape)?;
        let channel: u8 = channel_token
            .parse()
            .ok()
            .filter(|channel| *channel < 16)
            .ok_or_else(|| ParseError::ChannelRange(channel_token.to_owned()))?;

        let control_type = tokens.next().ok_or(ParseError::MappingShape)?.parse()?;

        let value_token = tokens.next().ok_or(ParseError::MappingShape)?;
        let value: u8 = value_token
            .parse()
            .ok()
            .filter(|value| *value < 128)
            .ok_or_else(|| ParseError::ValueRange(value_token.to_owned()))?;

        let action = tokens.next().ok_or(ParseError::MappingShape)?.parse()?;
        let loop_name = tokens.next().ok_or(ParseError::MappingShape)?.to_owned();

        Ok(MappingSpec {
            channel,
            control_type,
            value,
            action,
            loop_name,
        })
    }
}

/// A loop settings update in the protocol's
/// `"<midi_through> <playback_after_recording>"` form. The token `same`
/// leaves a field untouched, and a trailing field may be omitted entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoopControlUpdate {
    pub midi_through: Option<bool>,
    pub playback_after_recording: Option<bool>,
}

impl FromStr for LoopControlUpdate {
    type Err = ParseError;

    fn from_str(serialized: &str) -> Result<Self, ParseError> {
        let mut tokens = serialized.split_whitespace();
        let first = tokens.next().ok_or(ParseError::ControlsShape)?;

        Ok(LoopControlUpdate {
            midi_through: parse_control(first)?,
            playback_after_recording: match tokens.next() {
                Some(second) => parse_control(second)?,
                None => None,
            },
        })
    }
}

fn parse_control(token: &str) -> Result<Option<bool>, ParseError> {
    if token == "same" {
        return Ok(None);
    }
    token
        .parse::<i32>()
        .map(|flag| Some(flag != 0))
        .map_err(|_| ParseError::ControlsShape)
}

/// The loop controls serialization published to remote clients.
pub fn format_loop_controls(midi_through: bool, playback_after_recording: bool) -> String {
    format!(
        "{} {}",
        midi_through as i32, playback_after_recording as i32
    )
}
