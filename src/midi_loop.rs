use std::convert::TryFrom;
use std::iter::Peekable;

use ringbuf::{Consumer, Producer, RingBuffer};
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{LOOP_BUFFER_CAPACITY, OUTPUT_RING_CAPACITY, STATE_RING_CAPACITY};
use crate::loop_buffer::LoopBuffer;
use crate::midi_message::MidiMessage;

/// What a loop is doing with its input and its recording.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Recording,
    Playback,
}

/// A state change anchored to the frame it takes effect at, relative to the
/// start of the cycle it was scheduled in.
#[derive(Copy, Clone, Debug)]
pub struct StateSchedule {
    pub state: LoopState,
    pub time: jack::Frames,
}

/// Loop construction failure. Everything registered before the failing step
/// is torn back down, so a failed loop is never visible to the process
/// callback.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not register port {port}: {source}")]
    PortRegistration { port: String, source: jack::Error },
}

/// Per-cycle processing fault. The engine logs it and starts fresh on the
/// next cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("loop buffer full while recording")]
    LoopBufferFull,
    #[error("no space in the output ring for a through event")]
    OutputRingFull,
    #[error("could not write to the output port: {0}")]
    OutputWrite(#[from] jack::Error),
}

/// The real-time half of a loop: the state machine, the recording, and the
/// rings it communicates through. Host-independent, so the cycle logic can
/// be driven directly by the tests.
///
/// Both ends of each ring live here. Producer and consumer keep fixed roles
/// (toggles feed the state ring, the playback and through paths feed the
/// output ring, the cycle drains both) and every caller holds the engine's
/// loop set lock, the RT side via try_lock.
pub struct LoopCore {
    name: String,
    midi_through: bool,
    playback_after_recording: bool,

    state_tx: Producer<StateSchedule>,
    state_rx: Consumer<StateSchedule>,
    output_tx: Producer<MidiMessage>,
    output_rx: Consumer<MidiMessage>,
    /// Head of the output queue when it ran ahead of the current cycle.
    deferred_output: Option<MidiMessage>,

    recording: LoopBuffer,

    current_state: StateSchedule,
    /// Absolute frame at which the current playback pass replays offset 0.
    /// Advances by one recording length every time the read cursor wraps.
    last_playback_start: jack::Frames,
    recording_start: jack::Frames,
    recording_end: jack::Frames,
    /// Saves recomputing it once per callback invocation.
    recording_length: jack::Frames,
}

impl LoopCore {
    pub fn new(
        name: &str,
        midi_through: bool,
        playback_after_recording: bool,
        now: jack::Frames,
    ) -> Self {
        let (state_tx, state_rx) = RingBuffer::new(STATE_RING_CAPACITY).split();
        let (output_tx, output_rx) = RingBuffer::new(OUTPUT_RING_CAPACITY).split();
        LoopCore {
            name: name.to_owned(),
            midi_through,
            playback_after_recording,
            state_tx,
            state_rx,
            output_tx,
            output_rx,
            deferred_output: None,
            recording: LoopBuffer::with_capacity(LOOP_BUFFER_CAPACITY),
            current_state: StateSchedule {
                state: LoopState::Idle,
                time: now,
            },
            last_playback_start: 0,
            recording_start: 0,
            recording_end: 0,
            recording_length: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn midi_through(&self) -> bool {
        self.midi_through
    }

    pub fn set_midi_through(&mut self, set: bool) {
        self.midi_through = set;
    }

    pub fn playback_after_recording(&self) -> bool {
        self.playback_after_recording
    }

    pub fn set_playback_after_recording(&mut self, set: bool) {
        self.playback_after_recording = set;
    }

    pub fn state(&self) -> LoopState {
        self.current_state.state
    }

    /// May be invoked from the process callback, so it must stay RT safe.
    pub fn toggle_playback(&mut self, time: jack::Frames) {
        debug!(name = %self.name, "toggle playback");
        let target = if self.current_state.state == LoopState::Playback {
            LoopState::Idle
        } else {
            LoopState::Playback
        };
        self.schedule_state_change(target, time);
    }

    /// Ends a take into playback or silence depending on the
    /// playback-after-recording control; arms a new take otherwise.
    pub fn toggle_recording(&mut self, time: jack::Frames) {
        debug!(name = %self.name, "toggle recording");
        let target = if self.current_state.state == LoopState::Recording {
            if self.playback_after_recording {
                LoopState::Playback
            } else {
                LoopState::Idle
            }
        } else {
            LoopState::Recording
        };
        self.schedule_state_change(target, time);
    }

    fn schedule_state_change(&mut self, state: LoopState, time: jack::Frames) {
        let change = StateSchedule { state, time };
        if self.state_tx.push(change).is_err() {
            warn!(name = %self.name, "state ring full, change lost");
        }
    }

    /// Runs the state machine over one cycle's input: applies scheduled
    /// state changes at their frames, records or replays across each state
    /// interval, and queues everything the cycle emits on the output ring.
    pub fn run_cycle<I>(
        &mut self,
        nframes: jack::Frames,
        last_frame_time: jack::Frames,
        input: I,
    ) -> Result<(), CycleError>
    where
        I: Iterator<Item = MidiMessage>,
    {
        let mut input = input.peekable();
        let mut previous_state = self.current_state;

        loop {
            let (mut next, ring_empty) = match self.state_rx.pop() {
                Some(change) => (change, false),
                None => (
                    StateSchedule {
                        state: self.current_state.state,
                        time: nframes,
                    },
                    true,
                ),
            };

            // Entry actions for the state this interval is spent in. These
            // anchor to the frame the state was entered at, and they must
            // run before the interval's input so a take that starts mid
            // cycle captures the rest of that cycle.
            match self.current_state.state {
                LoopState::Recording if previous_state.state != LoopState::Recording => {
                    self.recording_start = self.current_state.time.wrapping_add(last_frame_time);
                    self.recording.reset_write();
                }
                LoopState::Playback if previous_state.state != LoopState::Playback => {
                    self.last_playback_start =
                        self.current_state.time.wrapping_add(last_frame_time);
                }
                _ => {}
            }

            self.consume_input(&mut input, next.time, last_frame_time)?;

            if self.current_state.state == LoopState::Playback {
                self.replay_until(next.time, last_frame_time);
            }

            // Transition actions.
            if self.current_state.state == LoopState::Recording
                && next.state != LoopState::Recording
            {
                self.recording_end = next.time.wrapping_add(last_frame_time);
                self.recording_length = self.recording_end.wrapping_sub(self.recording_start);
            }

            if next.state == LoopState::Playback && self.current_state.state != LoopState::Playback
            {
                if self.recording_length == 0 {
                    // A playback pass over a zero length recording could
                    // never advance, so the change lands on Idle instead.
                    debug!(name = %self.name, "nothing recorded, staying idle");
                    next.state = LoopState::Idle;
                } else {
                    self.recording.reset_read();
                }
            }

            previous_state = self.current_state;
            self.current_state = next;

            if ring_empty {
                break;
            }
        }

        Ok(())
    }

    /// Walks input events up to the end of the current state interval,
    /// echoing them when through mode is on and storing them while
    /// recording.
    fn consume_input<I>(
        &mut self,
        input: &mut Peekable<I>,
        end_of_state: jack::Frames,
        last_frame_time: jack::Frames,
    ) -> Result<(), CycleError>
    where
        I: Iterator<Item = MidiMessage>,
    {
        loop {
            match input.peek() {
                Some(event) if event.time < end_of_state => {}
                _ => break,
            }
            let mut event = match input.next() {
                Some(event) => event,
                None => break,
            };

            if self.midi_through && self.output_tx.push(event).is_err() {
                warn!(name = %self.name, "output ring full, through event lost");
                return Err(CycleError::OutputRingFull);
            }

            if self.current_state.state == LoopState::Recording {
                // Store the offset into the recording, not the cycle time.
                event.time = last_frame_time
                    .wrapping_add(event.time)
                    .wrapping_sub(self.recording_start);
                if self.recording.push(event).is_err() {
                    warn!(name = %self.name, "loop buffer full, recording cannot continue");
                    return Err(CycleError::LoopBufferFull);
                }
            }
        }

        Ok(())
    }

    /// Emits every recorded message that falls before the end of the
    /// playback interval, wrapping to the start of the recording as many
    /// times as the interval covers.
    fn replay_until(&mut self, end_of_state: jack::Frames, last_frame_time: jack::Frames) {
        loop {
            let recorded = match self.recording.peek() {
                Some(recorded) => *recorded,
                None => break,
            };

            let playback_time = recorded.time.wrapping_add(self.last_playback_start);
            if playback_time >= last_frame_time.wrapping_add(end_of_state) {
                break;
            }

            let mut due = recorded;
            due.time = playback_time.wrapping_sub(last_frame_time);
            if self.output_tx.push(due).is_err() {
                warn!(name = %self.name, "output ring full, playback event lost");
            }
            if self.recording.advance_read() {
                self.last_playback_start = self
                    .last_playback_start
                    .wrapping_add(self.recording_length);
            }
        }
    }

    /// The next queued output event due within this cycle. Events timed at
    /// or past the end of the cycle stay queued for the next one; events
    /// that slipped into the past (after an xrun) are clamped to the start
    /// of the cycle.
    pub fn pop_due_output(&mut self, nframes: jack::Frames) -> Option<MidiMessage> {
        let mut event = self.deferred_output.take().or_else(|| self.output_rx.pop())?;
        let time = event.time as i32;
        if time >= nframes as i32 {
            self.deferred_output = Some(event);
            return None;
        }
        if time < 0 {
            event.time = 0;
        }
        Some(event)
    }
}

/// A named loop bound to its JACK ports.
pub struct MidiLoop {
    core: LoopCore,
    input: jack::Port<jack::MidiIn>,
    output: jack::Port<jack::MidiOut>,
}

impl MidiLoop {
    /// Registers the loop's ports and sets up its buffers. Not RT safe. If
    /// the input port cannot be registered the output port is unregistered
    /// again before returning.
    pub fn new(
        client: &jack::Client,
        name: &str,
        midi_through: bool,
        playback_after_recording: bool,
    ) -> Result<Self, ConfigError> {
        let output_name = format!("loop_{}_output", name);
        let output = client
            .register_port(&output_name, jack::MidiOut::default())
            .map_err(|source| ConfigError::PortRegistration {
                port: output_name.clone(),
                source,
            })?;

        let input_name = format!("loop_{}_input", name);
        let input = match client.register_port(&input_name, jack::MidiIn::default()) {
            Ok(port) => port,
            Err(source) => {
                if let Err(unregister) = client.unregister_port(output) {
                    warn!(port = %output_name, error = %unregister, "rollback unregister failed");
                }
                return Err(ConfigError::PortRegistration {
                    port: input_name,
                    source,
                });
            }
        };

        Ok(MidiLoop {
            core: LoopCore::new(
                name,
                midi_through,
                playback_after_recording,
                client.frame_time(),
            ),
            input,
            output,
        })
    }

    /// Unregisters the loop's ports; used when a loop is deleted at runtime.
    pub fn unregister(self, client: &jack::Client) -> Result<(), jack::Error> {
        let input = client.unregister_port(self.input);
        let output = client.unregister_port(self.output);
        input.and(output)
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn midi_through(&self) -> bool {
        self.core.midi_through()
    }

    pub fn set_midi_through(&mut self, set: bool) {
        self.core.set_midi_through(set);
    }

    pub fn playback_after_recording(&self) -> bool {
        self.core.playback_after_recording()
    }

    pub fn set_playback_after_recording(&mut self, set: bool) {
        self.core.set_playback_after_recording(set);
    }

    pub fn toggle_playback(&mut self, time: jack::Frames) {
        self.core.toggle_playback(time);
    }

    pub fn toggle_recording(&mut self, time: jack::Frames) {
        self.core.toggle_recording(time);
    }

    /// RT entry point, invoked once per cycle.
    pub fn process(&mut self, ps: &jack::ProcessScope) -> Result<(), CycleError> {
        let nframes = ps.n_frames();
        let last_frame_time = ps.last_frame_time();

        let input = self.input.iter(ps).filter_map(|raw| {
            match MidiMessage::try_from(raw) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(%err, "ignoring inbound event");
                    None
                }
            }
        });
        self.core.run_cycle(nframes, last_frame_time, input)?;

        let mut writer = self.output.writer(ps);
        while let Some(event) = self.core.pop_due_output(nframes) {
            writer.write(&jack::RawMidi {
                time: event.time,
                bytes: event.bytes(),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NFRAMES: jack::Frames = 1000;

    fn message(time: jack::Frames, bytes: &[u8]) -> MidiMessage {
        let mut data = [0; 3];
        data[..bytes.len()].copy_from_slice(bytes);
        MidiMessage {
            time,
            len: bytes.len(),
            data,
        }
    }

    fn core(midi_through: bool) -> LoopCore {
        LoopCore::new("test", midi_through, true, 0)
    }

    fn drain(looper: &mut LoopCore, nframes: jack::Frames) -> Vec<MidiMessage> {
        let mut emitted = Vec::new();
        while let Some(event) = looper.pop_due_output(nframes) {
            emitted.push(event);
        }
        emitted
    }

    fn run(
        looper: &mut LoopCore,
        last_frame_time: jack::Frames,
        events: &[MidiMessage],
    ) -> Vec<MidiMessage> {
        looper
            .run_cycle(NFRAMES, last_frame_time, events.iter().copied())
            .unwrap();
        drain(looper, NFRAMES)
    }

    #[test]
    fn records_then_replays_with_wrap() {
        let mut looper = core(false);
        let note_on = message(200, &[0x90, 0x40, 0x7f]);
        let note_off = message(500, &[0x80, 0x40, 0x00]);

        // Cycle 1000..2000: the take is armed at its first frame and the
        // events land 200 and 500 frames in.
        looper.toggle_recording(0);
        assert!(run(&mut looper, 1000, &[note_on, note_off]).is_empty());
        assert_eq!(looper.state(), LoopState::Recording);

        // Cycle 2000..3000: the take ends and playback starts at frame
        // 2000, so the first pass replays at 2200 and 2500.
        looper.toggle_recording(0);
        let first_pass = run(&mut looper, 2000, &[]);
        assert_eq!(looper.state(), LoopState::Playback);
        assert_eq!(looper.recording_length, 1000);
        assert_eq!(first_pass, vec![note_on, note_off]);
        // The read cursor wrapped at 3000, re-anchoring the next pass.
        assert_eq!(looper.last_playback_start, 3000);

        // Cycle 3000..4000 replays the pair at 3200 and 3500.
        assert_eq!(run(&mut looper, 3000, &[]), vec![note_on, note_off]);
        assert_eq!(looper.last_playback_start, 4000);

        // Cycle 4000..5000 replays the pair at 4200 and 4500.
        assert_eq!(run(&mut looper, 4000, &[]), vec![note_on, note_off]);
        assert_eq!(looper.last_playback_start, 5000);
    }

    #[test]
    fn through_mode_echoes_input_while_idle() {
        let mut looper = core(true);
        let pedal = message(50, &[0xb0, 0x07, 0x7f]);
        assert_eq!(run(&mut looper, 0, &[pedal]), vec![pedal]);
        assert_eq!(looper.state(), LoopState::Idle);
    }

    #[test]
    fn without_through_mode_idle_input_vanishes() {
        let mut looper = core(false);
        let pedal = message(50, &[0xb0, 0x07, 0x7f]);
        assert!(run(&mut looper, 0, &[pedal]).is_empty());
    }

    #[test]
    fn toggles_coalesce_against_the_current_state() {
        let mut looper = core(false);

        looper.toggle_playback(0);
        run(&mut looper, 0, &[]);
        // Nothing recorded yet, so playback never engages.
        assert_eq!(looper.state(), LoopState::Idle);

        looper.toggle_recording(0);
        run(&mut looper, 1000, &[message(100, &[0x90, 0x40, 0x7f])]);
        assert_eq!(looper.state(), LoopState::Recording);

        // Out of recording the toggle lands on playback, not idle.
        looper.toggle_recording(0);
        run(&mut looper, 2000, &[]);
        assert_eq!(looper.state(), LoopState::Playback);

        // And a playback toggle stops the loop.
        looper.toggle_playback(0);
        run(&mut looper, 3000, &[]);
        assert_eq!(looper.state(), LoopState::Idle);
    }

    #[test]
    fn recording_toggle_can_stop_without_playback() {
        let mut looper = core(false);
        looper.set_playback_after_recording(false);

        looper.toggle_recording(0);
        run(&mut looper, 1000, &[message(100, &[0x90, 0x40, 0x7f])]);
        looper.toggle_recording(0);
        run(&mut looper, 2000, &[]);
        assert_eq!(looper.state(), LoopState::Idle);
    }

    #[test]
    fn scheduled_changes_apply_in_order_within_one_cycle() {
        let mut looper = core(false);

        // Arm at frame 100 and switch to playback at frame 200, all within
        // the same cycle starting at absolute frame 1000. Both toggles see
        // the idle state, so the pair really is (record, play).
        looper.toggle_recording(100);
        looper.toggle_playback(200);
        let emitted = run(
            &mut looper,
            1000,
            &[
                message(50, &[0x90, 0x3c, 0x7f]),
                message(150, &[0x90, 0x40, 0x7f]),
                message(250, &[0x90, 0x43, 0x7f]),
            ],
        );

        assert_eq!(looper.state(), LoopState::Playback);
        // Only the event inside the 100..200 take was captured.
        assert_eq!(looper.recording.len(), 1);
        assert_eq!(looper.recording_start, 1100);
        assert_eq!(looper.recording_length, 100);
        // The 100 frame take then wraps through the rest of the cycle: the
        // recorded event (offset 50 into the take, playback anchored at
        // 1200) comes around every 100 frames from 250 on.
        let expected: Vec<_> = (0..8)
            .map(|pass| message(250 + pass * 100, &[0x90, 0x40, 0x7f]))
            .collect();
        assert_eq!(emitted, expected);
        assert_eq!(looper.last_playback_start, 2000);
    }

    #[test]
    fn transition_frame_splits_recording_from_playback() {
        let mut looper = core(false);

        // A take over a full cycle, 0..256.
        looper.toggle_recording(0);
        looper
            .run_cycle(256, 0, [message(100, &[0x90, 0x40, 0x7f])].iter().copied())
            .unwrap();
        assert!(drain(&mut looper, 256).is_empty());

        // Mid-cycle stop at frame 128: the event at 100 joins the take, the
        // event at 200 does not.
        looper.toggle_recording(128);
        looper
            .run_cycle(
                256,
                256,
                [
                    message(100, &[0x90, 0x41, 0x7f]),
                    message(200, &[0x90, 0x42, 0x7f]),
                ]
                .iter()
                .copied(),
            )
            .unwrap();
        assert_eq!(looper.state(), LoopState::Playback);
        assert_eq!(looper.recording.len(), 2);
        assert_eq!(looper.recording_length, 384);

        // Playback anchors to the transition frame (absolute 384), so the
        // first take event (offset 100) replays at 484 and nothing lands
        // before frame 128 of the transition cycle.
        let emitted = drain(&mut looper, 256);
        assert_eq!(emitted, vec![message(228, &[0x90, 0x40, 0x7f])]);
        assert!(emitted.iter().all(|event| event.time >= 128));

        // The second take event (offset 356) comes due in the next cycle,
        // and the read cursor wraps for the pass after that.
        let emitted = run_with_nframes(&mut looper, 256, 512, &[]);
        assert_eq!(emitted, vec![message(228, &[0x90, 0x41, 0x7f])]);
        assert_eq!(looper.last_playback_start, 768);
    }

    fn run_with_nframes(
        looper: &mut LoopCore,
        nframes: jack::Frames,
        last_frame_time: jack::Frames,
        events: &[MidiMessage],
    ) -> Vec<MidiMessage> {
        looper
            .run_cycle(nframes, last_frame_time, events.iter().copied())
            .unwrap();
        drain(looper, nframes)
    }

    #[test]
    fn empty_take_never_enters_playback() {
        let mut looper = core(false);
        // Arm and switch to playback on the same frame: the take seals with
        // zero length, which must not anchor a playback pass.
        looper.toggle_recording(500);
        looper.toggle_playback(500);
        assert!(run(&mut looper, 1000, &[]).is_empty());
        assert_eq!(looper.state(), LoopState::Idle);
    }

    #[test]
    fn recording_overflow_fails_the_cycle() {
        let mut looper = core(false);
        looper.toggle_recording(0);
        run(&mut looper, 0, &[]);

        let flood: Vec<_> = (0..LOOP_BUFFER_CAPACITY as u32 + 1)
            .map(|i| message(i % NFRAMES, &[0x90, 0x40, 0x7f]))
            .collect();
        let result = looper.run_cycle(NFRAMES, NFRAMES, flood.iter().copied());
        assert!(matches!(result, Err(CycleError::LoopBufferFull)));
    }

    #[test]
    fn output_past_the_cycle_end_is_deferred_and_late_output_clamped() {
        let mut looper = core(false);

        looper.output_tx.push(message(1500, &[0x90, 0x40, 0x7f])).unwrap();
        assert_eq!(looper.pop_due_output(NFRAMES), None);
        // Still queued: a longer cycle delivers it untouched.
        assert_eq!(
            looper.pop_due_output(2000),
            Some(message(1500, &[0x90, 0x40, 0x7f]))
        );

        // An event that slipped behind the cycle start comes out at frame 0.
        looper
            .output_tx
            .push(message(0u32.wrapping_sub(10), &[0x80, 0x40, 0x00]))
            .unwrap();
        assert_eq!(
            looper.pop_due_output(NFRAMES),
            Some(message(0, &[0x80, 0x40, 0x00]))
        );
    }

    #[test]
    fn state_ring_overflow_drops_the_change() {
        let mut looper = core(false);
        for _ in 0..STATE_RING_CAPACITY + 5 {
            looper.toggle_recording(0);
        }
        // The survivors still apply cleanly in order.
        run(&mut looper, 0, &[]);
        assert_eq!(looper.state(), LoopState::Recording);
    }
}
