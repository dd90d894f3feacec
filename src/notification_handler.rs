//! JACK lifecycle notifications. Adapted from the playback_capture example
//! in the jack crate.

use tracing::{error, info, warn};

/// Everything the engine records and replays is anchored to one fixed frame
/// clock. If the server's sample rate moves underneath us those anchors are
/// garbage, so a rate change after activation terminates the process.
pub struct Notifications {
    saw_initial_sample_rate: bool,
}

impl Notifications {
    pub fn new() -> Self {
        Notifications {
            saw_initial_sample_rate: false,
        }
    }
}

impl jack::NotificationHandler for Notifications {
    fn thread_init(&self, _: &jack::Client) {
        info!("JACK: thread init");
    }

    fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        info!(
            "JACK: shutdown with status {:?} because \"{}\"",
            status, reason
        );
    }

    fn sample_rate(&mut self, _: &jack::Client, srate: jack::Frames) -> jack::Control {
        // JACK reports the rate once on activation; only a change counts.
        if !self.saw_initial_sample_rate {
            info!("JACK: sample rate is {}", srate);
            self.saw_initial_sample_rate = true;
            return jack::Control::Continue;
        }
        error!("JACK: sample rate changed to {}, cannot keep time", srate);
        std::process::exit(-1);
    }

    fn xrun(&mut self, _: &jack::Client) -> jack::Control {
        warn!("JACK: xrun occurred");
        jack::Control::Continue
    }

    fn port_registration(&mut self, _: &jack::Client, port_id: jack::PortId, is_reg: bool) {
        info!(
            "JACK: {} port with id {}",
            if is_reg { "registered" } else { "unregistered" },
            port_id
        );
    }
}
