use std::convert::TryFrom;

use thiserror::Error;

pub const MAX_MIDI: usize = 3;

/// A fixed size container so MIDI data can be copied between ring buffers
/// without touching the allocator. The only difference from the host's event
/// type is that the raw bytes live inside the struct instead of behind a
/// buffer pointer.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct MidiMessage {
    /// Frame index. Cycle-relative on the input and output sides; an offset
    /// from the start of the recording while stored in a loop buffer.
    pub time: jack::Frames,
    pub len: usize,
    pub data: [u8; MAX_MIDI],
}

/// Inbound event that does not fit the fixed three byte payload, which in
/// practice means a SysEx.
#[derive(Debug, Error)]
#[error("MIDI event of {0} bytes does not fit a short message, probably a SysEx")]
pub struct OversizedEvent(pub usize);

impl MidiMessage {
    /// The bytes actually carried by the message.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn status(&self) -> u8 {
        self.data[0] & 0xf0
    }

    pub fn channel(&self) -> u8 {
        self.data[0] & 0x0f
    }
}

impl TryFrom<jack::RawMidi<'_>> for MidiMessage {
    type Error = OversizedEvent;

    fn try_from(midi: jack::RawMidi<'_>) -> Result<Self, OversizedEvent> {
        let len = midi.bytes.len();
        if len == 0 || len > MAX_MIDI {
            return Err(OversizedEvent(len));
        }
        let mut data = [0; MAX_MIDI];
        data[..len].copy_from_slice(midi.bytes);
        Ok(MidiMessage {
            len,
            data,
            time: midi.time,
        })
    }
}

impl std::fmt::Debug for MidiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Midi {{ time: {}, len: {}, data: {:?} }}",
            self.time,
            self.len,
            &self.data[..self.len]
        )
    }
}
