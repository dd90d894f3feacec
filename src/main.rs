use std::error::Error;
use std::net::UdpSocket;
use std::sync::Arc;

use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use midi_looper::control_table::TableChange;
use midi_looper::engine::Engine;
use midi_looper::notification_handler::Notifications;
use midi_looper::osc::{OscServer, Updater};
use midi_looper::protocol::MappingSpec;

#[derive(Debug, StructOpt)]
struct Opt {
    /// UDP port the OSC remote control listens on
    #[structopt(short, long, default_value = "7770")]
    port: u16,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opt = Opt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // The OSC socket comes first: the engine's mapping change handler
    // publishes over it, so it has to exist before the engine does.
    let socket = UdpSocket::bind(("0.0.0.0", opt.port))?;
    let updater = Arc::new(Updater::new(socket.try_clone()?));

    let mapping_updater = Arc::clone(&updater);
    let engine = Arc::new(Engine::new(Box::new(
        move |change, channel, control_type, value, loop_name: &str, action| {
            let spec = MappingSpec {
                channel,
                control_type,
                value,
                action,
                loop_name: loop_name.to_owned(),
            };
            let change = match change {
                TableChange::Add => "add",
                TableChange::Remove => "remove",
            };
            mapping_updater.publish("mappings", change, &spec.to_string());
        },
    )));

    let (client, _status) =
        jack::Client::new("midi_looper", jack::ClientOptions::NO_START_SERVER)?;
    let control_input = client.register_port("control_input", jack::MidiIn::default())?;

    let process_engine = Arc::clone(&engine);
    let process_callback = move |_: &jack::Client, ps: &jack::ProcessScope| -> jack::Control {
        process_engine.run_cycle(&control_input, ps);
        jack::Control::Continue
    };
    let process = jack::ClosureProcessHandler::new(process_callback);

    let active_client = client.activate_async(Notifications::new(), process)?;

    // Loops and mappings arrive over OSC; this blocks until a /quit.
    let mut server = OscServer::new(socket, Arc::clone(&engine), updater);
    server.run(active_client.as_client())?;

    info!("shutting down");
    active_client.deactivate()?;
    Ok(())
}
