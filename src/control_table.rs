use crate::constants::CONTROL_TABLE_SLOTS;

/// Which of a loop's toggle entry points a binding invokes. A closed set so
/// bindings can round trip through the text protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopAction {
    TogglePlayback,
    ToggleRecording,
}

/// The four kinds of control events a binding can match. Control changes
/// split on their value so one knob or pedal can act as an on/off pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MidiControlType {
    NoteOn,
    NoteOff,
    CcOn,
    CcOff,
}

impl MidiControlType {
    fn index(self) -> usize {
        match self {
            MidiControlType::NoteOn => 0,
            MidiControlType::NoteOff => 1,
            MidiControlType::CcOn => 2,
            MidiControlType::CcOff => 3,
        }
    }

    fn from_index(index: usize) -> Self {
        match index & 0x3 {
            0 => MidiControlType::NoteOn,
            1 => MidiControlType::NoteOff,
            2 => MidiControlType::CcOn,
            _ => MidiControlType::CcOff,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableChange {
    Add,
    Remove,
}

/// One registered (loop, action) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub loop_name: String,
    pub action: LoopAction,
}

/// Invoked on every effective insert and removal so remote clients can
/// mirror the mapping set.
pub type ChangeHandler =
    Box<dyn FnMut(TableChange, u8, MidiControlType, u8, &str, LoopAction) + Send>;

// Basically a direct hash: 4 channel bits, 2 type bits, 7 value bits.
fn slot_index(channel: u8, control_type: MidiControlType, value: u8) -> usize {
    ((channel as usize) << 9) | (control_type.index() << 7) | value as usize
}

fn derive_key(slot: usize) -> (u8, MidiControlType, u8) {
    (
        (slot >> 9) as u8,
        MidiControlType::from_index(slot >> 7),
        (slot & 0x7f) as u8,
    )
}

/// Direct indexed dispatch from a 13 bit (channel, type, value) key to the
/// bindings registered for it. Lookup never hashes and never allocates, so
/// the RT path can walk it; mutation happens on the control thread, under
/// the same lock the RT path probes with try_lock.
pub struct ControlActionTable {
    slots: Vec<Vec<Binding>>,
    change_handler: ChangeHandler,
}

impl ControlActionTable {
    pub fn new(change_handler: ChangeHandler) -> Self {
        ControlActionTable {
            slots: vec![Vec::new(); CONTROL_TABLE_SLOTS],
            change_handler,
        }
    }

    /// Registers a binding at the key's slot head. An identical pair already
    /// at the key is removed first, so no key ever holds duplicates.
    pub fn insert(
        &mut self,
        channel: u8,
        control_type: MidiControlType,
        value: u8,
        loop_name: &str,
        action: LoopAction,
    ) {
        self.remove(channel, control_type, value, loop_name, action);
        self.slots[slot_index(channel, control_type, value)].insert(
            0,
            Binding {
                loop_name: loop_name.to_owned(),
                action,
            },
        );
        (self.change_handler)(TableChange::Add, channel, control_type, value, loop_name, action);
    }

    /// Removes every binding at the key matching (loop, action).
    pub fn remove(
        &mut self,
        channel: u8,
        control_type: MidiControlType,
        value: u8,
        loop_name: &str,
        action: LoopAction,
    ) {
        let ControlActionTable {
            slots,
            change_handler,
        } = self;
        // Should only ever remove one, but keeps going to squash
        // inconsistencies.
        slots[slot_index(channel, control_type, value)].retain(|binding| {
            if binding.loop_name == loop_name && binding.action == action {
                change_handler(
                    TableChange::Remove,
                    channel,
                    control_type,
                    value,
                    loop_name,
                    action,
                );
                false
            } else {
                true
            }
        });
    }

    fn remove_where<P>(&mut self, mut predicate: P)
    where
        P: FnMut(&Binding) -> bool,
    {
        let ControlActionTable {
            slots,
            change_handler,
        } = self;
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_empty() {
                continue;
            }
            let (channel, control_type, value) = derive_key(index);
            slot.retain(|binding| {
                if predicate(binding) {
                    change_handler(
                        TableChange::Remove,
                        channel,
                        control_type,
                        value,
                        &binding.loop_name,
                        binding.action,
                    );
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Walks the whole table; meant for loop deletion, not the RT path.
    pub fn remove_loop_mappings(&mut self, loop_name: &str) {
        self.remove_where(|binding| binding.loop_name == loop_name);
    }

    pub fn clear_mappings(&mut self) {
        self.remove_where(|_| true);
    }

    /// RT dispatch: hands every binding at the key to the caller, in slot
    /// order.
    pub fn invoke<F>(
        &self,
        channel: u8,
        control_type: MidiControlType,
        value: u8,
        time: jack::Frames,
        mut dispatch: F,
    ) where
        F: FnMut(&str, LoopAction, jack::Frames),
    {
        for binding in &self.slots[slot_index(channel, control_type, value)] {
            dispatch(&binding.loop_name, binding.action, time);
        }
    }

    /// Non-RT enumeration of every binding; used to serialize the mapping
    /// set for remote clients.
    pub fn for_each_mapping<F>(&self, mut mapping: F)
    where
        F: FnMut(u8, MidiControlType, u8, &str, LoopAction),
    {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.is_empty() {
                continue;
            }
            let (channel, control_type, value) = derive_key(index);
            for binding in slot {
                mapping(channel, control_type, value, &binding.loop_name, binding.action);
            }
        }
    }
}
