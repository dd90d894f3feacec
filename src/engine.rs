use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{error, trace, warn};

use crate::control_table::{ChangeHandler, ControlActionTable, LoopAction, MidiControlType};
use crate::midi_loop::{ConfigError, MidiLoop};
use crate::midi_message::MidiMessage;
use crate::protocol::{LoopControlUpdate, MappingSpec};

const NOTE_OFF: u8 = 0x80;
const NOTE_ON: u8 = 0x90;
const CONTROL_CHANGE: u8 = 0xb0;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a loop named {0:?} already exists")]
    DuplicateLoop(String),
    #[error("no loop named {0:?}")]
    UnknownLoop(String),
    #[error(transparent)]
    Loop(#[from] ConfigError),
}

/// Owns the loop set and the control mapping table and drives both from the
/// process callback. The RT cycle takes the two locks with try_lock and
/// skips its dispatch when a control thread holds either one, so it can
/// never block on configuration edits.
pub struct Engine {
    loops: Mutex<HashMap<String, MidiLoop>>,
    bindings: Mutex<ControlActionTable>,
}

impl Engine {
    pub fn new(change_handler: ChangeHandler) -> Self {
        Engine {
            loops: Mutex::new(HashMap::new()),
            bindings: Mutex::new(ControlActionTable::new(change_handler)),
        }
    }

    /// RT entry point, one call per cycle: decodes the control port, fires
    /// the matching loop actions, then runs every loop's process routine.
    pub fn run_cycle(&self, control_input: &jack::Port<jack::MidiIn>, ps: &jack::ProcessScope) {
        let (mut loops, bindings) = match (self.loops.try_lock(), self.bindings.try_lock()) {
            (Ok(loops), Ok(bindings)) => (loops, bindings),
            _ => {
                trace!("control tables held, skipping cycle dispatch");
                return;
            }
        };

        for raw in control_input.iter(ps) {
            let message = match MidiMessage::try_from(raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "ignoring control event");
                    continue;
                }
            };
            if let Some((channel, control_type, value)) = decode_control(&message) {
                bindings.invoke(channel, control_type, value, message.time, |name, action, time| {
                    if let Some(target) = loops.get_mut(name) {
                        match action {
                            LoopAction::TogglePlayback => target.toggle_playback(time),
                            LoopAction::ToggleRecording => target.toggle_recording(time),
                        }
                    }
                });
            }
        }

        for (name, midi_loop) in loops.iter_mut() {
            if let Err(err) = midi_loop.process(ps) {
                error!(%name, %err, "cycle failed");
            }
        }
    }

    /// Creates a loop with its ports and makes it visible to the RT cycle.
    pub fn add_loop(
        &self,
        client: &jack::Client,
        name: &str,
        midi_through: bool,
        playback_after_recording: bool,
    ) -> Result<(), EngineError> {
        let mut loops = self.loops.lock().unwrap();
        if loops.contains_key(name) {
            return Err(EngineError::DuplicateLoop(name.to_owned()));
        }
        let new_loop = MidiLoop::new(client, name, midi_through, playback_after_recording)?;
        loops.insert(name.to_owned(), new_loop);
        Ok(())
    }

    /// Drops a loop. Its mappings are purged first so no binding ever
    /// outlives its target.
    pub fn remove_loop(&self, client: &jack::Client, name: &str) -> Result<(), EngineError> {
        let mut loops = self.loops.lock().unwrap();
        let mut bindings = self.bindings.lock().unwrap();
        let removed = loops
            .remove(name)
            .ok_or_else(|| EngineError::UnknownLoop(name.to_owned()))?;
        bindings.remove_loop_mappings(name);
        if let Err(err) = removed.unregister(client) {
            warn!(%name, %err, "could not unregister loop ports");
        }
        Ok(())
    }

    pub fn loop_names(&self) -> Vec<String> {
        self.loops.lock().unwrap().keys().cloned().collect()
    }

    pub fn loop_count(&self) -> usize {
        self.loops.lock().unwrap().len()
    }

    /// Current (midi_through, playback_after_recording) for a loop.
    pub fn loop_controls(&self, name: &str) -> Result<(bool, bool), EngineError> {
        let loops = self.loops.lock().unwrap();
        let target = loops
            .get(name)
            .ok_or_else(|| EngineError::UnknownLoop(name.to_owned()))?;
        Ok((target.midi_through(), target.playback_after_recording()))
    }

    /// Applies a controls update and reports the resulting settings.
    pub fn update_loop_controls(
        &self,
        name: &str,
        update: LoopControlUpdate,
    ) -> Result<(bool, bool), EngineError> {
        let mut loops = self.loops.lock().unwrap();
        let target = loops
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownLoop(name.to_owned()))?;
        if let Some(midi_through) = update.midi_through {
            target.set_midi_through(midi_through);
        }
        if let Some(playback) = update.playback_after_recording {
            target.set_playback_after_recording(playback);
        }
        Ok((target.midi_through(), target.playback_after_recording()))
    }

    /// Registers a binding; the loop must exist.
    pub fn add_binding(&self, spec: &MappingSpec) -> Result<(), EngineError> {
        let loops = self.loops.lock().unwrap();
        let mut bindings = self.bindings.lock().unwrap();
        if !loops.contains_key(&spec.loop_name) {
            return Err(EngineError::UnknownLoop(spec.loop_name.clone()));
        }
        bindings.insert(
            spec.channel,
            spec.control_type,
            spec.value,
            &spec.loop_name,
            spec.action,
        );
        Ok(())
    }

    pub fn remove_binding(&self, spec: &MappingSpec) {
        let _loops = self.loops.lock().unwrap();
        let mut bindings = self.bindings.lock().unwrap();
        bindings.remove(
            spec.channel,
            spec.control_type,
            spec.value,
            &spec.loop_name,
            spec.action,
        );
    }

    pub fn clear_bindings(&self) {
        self.bindings.lock().unwrap().clear_mappings();
    }

    /// Every registered binding in its wire form.
    pub fn bindings(&self) -> Vec<MappingSpec> {
        let bindings = self.bindings.lock().unwrap();
        let mut specs = Vec::new();
        bindings.for_each_mapping(|channel, control_type, value, loop_name, action| {
            specs.push(MappingSpec {
                channel,
                control_type,
                value,
                action,
                loop_name: loop_name.to_owned(),
            });
        });
        specs
    }
}

/// Maps a control port event to a binding key. Control changes split into
/// on/off halves on the controller value, everything but notes and control
/// changes is ignored.
fn decode_control(message: &MidiMessage) -> Option<(u8, MidiControlType, u8)> {
    let control_type = match message.status() {
        NOTE_ON => MidiControlType::NoteOn,
        NOTE_OFF => MidiControlType::NoteOff,
        CONTROL_CHANGE => {
            if message.data[2] > 63 {
                MidiControlType::CcOn
            } else {
                MidiControlType::CcOff
            }
        }
        _ => return None,
    };
    Some((message.channel(), control_type, message.data[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(bytes: &[u8]) -> MidiMessage {
        let mut data = [0; 3];
        data[..bytes.len()].copy_from_slice(bytes);
        MidiMessage {
            time: 0,
            len: bytes.len(),
            data,
        }
    }

    #[test]
    fn decodes_notes_with_their_channel() {
        assert_eq!(
            decode_control(&message(&[0x93, 0x40, 0x7f])),
            Some((3, MidiControlType::NoteOn, 0x40))
        );
        assert_eq!(
            decode_control(&message(&[0x8f, 0x24, 0x00])),
            Some((15, MidiControlType::NoteOff, 0x24))
        );
    }

    #[test]
    fn splits_control_changes_on_the_value() {
        assert_eq!(
            decode_control(&message(&[0xb0, 0x40, 0x40])),
            Some((0, MidiControlType::CcOn, 0x40))
        );
        assert_eq!(
            decode_control(&message(&[0xb0, 0x40, 0x3f])),
            Some((0, MidiControlType::CcOff, 0x40))
        );
    }

    #[test]
    fn ignores_other_status_bytes() {
        assert_eq!(decode_control(&message(&[0xf8])), None);
        assert_eq!(decode_control(&message(&[0xe0, 0x00, 0x40])), None);
        assert_eq!(decode_control(&message(&[0xc0, 0x05])), None);
    }
}
