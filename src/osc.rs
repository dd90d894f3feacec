//! The OSC remote control surface: a single threaded UDP server exposing
//! loop and mapping management, plus an auto-update registry that pushes
//! changes back out to subscribed clients.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};

use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, info, warn};

use crate::constants::MAX_LOOP_NAME;
use crate::engine::Engine;
use crate::protocol::{format_loop_controls, LoopControlUpdate, MappingSpec};

const MAX_INCOMING_PACKET_SIZE: usize = 10_000;

/// Update keys that exist independently of any loop.
const GLOBAL_UPDATE_KEYS: [&str; 3] = ["loops", "mappings", "errors"];

#[derive(Clone, PartialEq)]
struct Subscriber {
    address: SocketAddr,
    return_path: String,
}

/// Fans "<change> <data>" pairs out to the clients subscribed to a key. A
/// key is either one of the global keys or a loop name, so the key set
/// doubles as the reserved-name check for new loops.
pub struct Updater {
    socket: UdpSocket,
    subscriptions: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Updater {
    pub fn new(socket: UdpSocket) -> Self {
        let mut subscriptions = HashMap::new();
        for key in &GLOBAL_UPDATE_KEYS {
            subscriptions.insert((*key).to_owned(), Vec::new());
        }
        Updater {
            socket,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    /// Loops get their own subscription key while they exist.
    fn add_key(&self, key: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_insert_with(Vec::new);
    }

    fn remove_key(&self, key: &str) {
        if !GLOBAL_UPDATE_KEYS.contains(&key) {
            self.subscriptions.lock().unwrap().remove(key);
        }
    }

    fn has_key(&self, key: &str) -> bool {
        self.subscriptions.lock().unwrap().contains_key(key)
    }

    /// Subscriptions only attach to keys that exist.
    fn subscribe(&self, key: &str, return_url: &str, return_path: &str) {
        let address = match resolve(return_url) {
            Some(address) => address,
            None => {
                warn!(%return_url, "cannot resolve update address");
                return;
            }
        };
        let mut subscriptions = self.subscriptions.lock().unwrap();
        if let Some(subscribers) = subscriptions.get_mut(key) {
            subscribers.push(Subscriber {
                address,
                return_path: return_path.to_owned(),
            });
        } else {
            debug!(%key, "subscription to unknown key ignored");
        }
    }

    fn unsubscribe(&self, key: &str, return_url: &str, return_path: &str) {
        let address = match resolve(return_url) {
            Some(address) => address,
            None => return,
        };
        let reference = Subscriber {
            address,
            return_path: return_path.to_owned(),
        };
        if let Some(subscribers) = self.subscriptions.lock().unwrap().get_mut(key) {
            subscribers.retain(|subscriber| *subscriber != reference);
        }
    }

    /// Sends "<change> <data>" to everyone subscribed to the key.
    pub fn publish(&self, key: &str, change: &str, data: &str) {
        debug!(%key, %change, %data, "auto update");
        let subscriptions = self.subscriptions.lock().unwrap();
        if let Some(subscribers) = subscriptions.get(key) {
            for subscriber in subscribers {
                self.send(
                    subscriber.address,
                    &subscriber.return_path,
                    vec![
                        OscType::String(change.to_owned()),
                        OscType::String(data.to_owned()),
                    ],
                );
            }
        }
    }

    fn send(&self, address: SocketAddr, path: &str, args: Vec<OscType>) {
        let packet = OscPacket::Message(OscMessage {
            addr: path.to_owned(),
            args,
        });
        match rosc::encoder::encode(&packet) {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, address) {
                    warn!(%address, %err, "OSC send failed");
                }
            }
            Err(err) => warn!(?err, "could not encode OSC reply"),
        }
    }
}

fn resolve(return_url: &str) -> Option<SocketAddr> {
    return_url.to_socket_addrs().ok()?.next()
}

/// Serves the remote control protocol until a /quit arrives.
pub struct OscServer {
    socket: UdpSocket,
    engine: Arc<Engine>,
    updater: Arc<Updater>,
    done: bool,
}

impl OscServer {
    pub fn new(socket: UdpSocket, engine: Arc<Engine>, updater: Arc<Updater>) -> Self {
        OscServer {
            socket,
            engine,
            updater,
            done: false,
        }
    }

    /// Blocks on the socket, dispatching requests as they arrive. The JACK
    /// client handle is needed because loop management registers and
    /// unregisters ports.
    pub fn run(&mut self, client: &jack::Client) -> std::io::Result<()> {
        let mut buffer = [0u8; MAX_INCOMING_PACKET_SIZE];
        info!(address = %self.socket.local_addr()?, "serving OSC remote control");

        while !self.done {
            let (received, _from) = match self.socket.recv_from(&mut buffer) {
                Ok(incoming) => incoming,
                Err(err) => {
                    warn!(%err, "OSC receive failed");
                    continue;
                }
            };
            match rosc::decoder::decode_udp(&buffer[..received]) {
                Ok((_remainder, packet)) => self.dispatch(client, packet),
                Err(err) => warn!(?err, "could not decode OSC packet"),
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, client: &jack::Client, packet: OscPacket) {
        match packet {
            OscPacket::Message(message) => self.handle(client, message),
            OscPacket::Bundle(bundle) => {
                for inner in bundle.content {
                    self.dispatch(client, inner);
                }
            }
        }
    }

    fn handle(&mut self, client: &jack::Client, message: OscMessage) {
        debug!(path = %message.addr, "OSC request");
        match message.addr.as_str() {
            "/quit" => self.done = true,
            "/ping" => self.ping(&message),
            "/loop_list" => self.loop_list(&message),
            "/loop_add" => self.loop_add(client, &message),
            "/loop_del" => self.loop_del(client, &message),
            "/register_auto_update" => self.global_subscription(&message, true),
            "/unregister_auto_update" => self.global_subscription(&message, false),
            "/midi_binding_list" => self.binding_list(&message),
            "/clear_midi_bindings" => self.engine.clear_bindings(),
            "/add_midi_binding" => self.add_binding(&message),
            "/remove_midi_binding" => self.remove_binding(&message),
            path => self.loop_scoped(path, &message),
        }
    }

    fn ping(&self, message: &OscMessage) {
        if let Some((return_url, return_path)) = two_strings(message) {
            if let Some(address) = resolve(return_url) {
                let server = match self.socket.local_addr() {
                    Ok(local) => local.to_string(),
                    Err(_) => String::new(),
                };
                self.updater.send(
                    address,
                    return_path,
                    vec![
                        OscType::String(server),
                        OscType::String(env!("CARGO_PKG_VERSION").to_owned()),
                        OscType::Int(self.engine.loop_count() as i32),
                    ],
                );
            }
        }
    }

    fn loop_list(&self, message: &OscMessage) {
        if let Some((return_url, return_path)) = two_strings(message) {
            if let Some(address) = resolve(return_url) {
                for name in self.engine.loop_names() {
                    self.updater.send(
                        address,
                        return_path,
                        vec![
                            OscType::String("add".to_owned()),
                            OscType::String(name),
                        ],
                    );
                }
            }
        }
    }

    fn loop_add(&self, client: &jack::Client, message: &OscMessage) {
        let name = match one_string(message) {
            Some(name) => name,
            None => return,
        };
        if !valid_loop_name(name) || self.updater.has_key(name) {
            warn!(%name, "rejecting loop name");
            return;
        }
        match self.engine.add_loop(client, name, true, true) {
            Ok(()) => {
                self.updater.add_key(name);
                self.updater.publish("loops", "add", name);
            }
            Err(err) => warn!(%name, %err, "could not add loop"),
        }
    }

    fn loop_del(&self, client: &jack::Client, message: &OscMessage) {
        let name = match one_string(message) {
            Some(name) => name,
            None => return,
        };
        match self.engine.remove_loop(client, name) {
            Ok(()) => {
                self.updater.remove_key(name);
                self.updater.publish("loops", "remove", name);
            }
            Err(err) => warn!(%name, %err, "could not remove loop"),
        }
    }

    fn global_subscription(&self, message: &OscMessage, register: bool) {
        let mut args = string_args(message);
        let (key, return_url, return_path) = match (args.next(), args.next(), args.next()) {
            (Some(key), Some(url), Some(path)) => (key, url, path),
            _ => return,
        };
        if register {
            self.updater.subscribe(key, return_url, return_path);
        } else {
            self.updater.unsubscribe(key, return_url, return_path);
        }
    }

    fn binding_list(&self, message: &OscMessage) {
        if let Some((return_url, return_path)) = two_strings(message) {
            if let Some(address) = resolve(return_url) {
                for spec in self.engine.bindings() {
                    self.updater.send(
                        address,
                        return_path,
                        vec![
                            OscType::String("add".to_owned()),
                            OscType::String(spec.to_string()),
                        ],
                    );
                }
            }
        }
    }

    fn add_binding(&self, message: &OscMessage) {
        if let Some(serialized) = one_string(message) {
            match serialized.parse::<MappingSpec>() {
                Ok(spec) => {
                    if let Err(err) = self.engine.add_binding(&spec) {
                        warn!(%err, "could not add binding");
                    }
                }
                Err(err) => warn!(%serialized, %err, "bad binding"),
            }
        }
    }

    fn remove_binding(&self, message: &OscMessage) {
        if let Some(serialized) = one_string(message) {
            match serialized.parse::<MappingSpec>() {
                Ok(spec) => self.engine.remove_binding(&spec),
                Err(err) => warn!(%serialized, %err, "bad binding"),
            }
        }
    }

    /// The per-loop methods live under `/jml/<name>/<operation>`.
    fn loop_scoped(&self, path: &str, message: &OscMessage) {
        let scoped = match path.strip_prefix("/jml/") {
            Some(scoped) => scoped,
            None => {
                debug!(%path, "unroutable OSC path");
                return;
            }
        };
        let mut parts = scoped.splitn(2, '/');
        let name = parts.next().unwrap_or("");
        let operation = parts.next().unwrap_or("");

        match operation {
            "get" => self.loop_get_controls(name, message),
            "set" => self.loop_set_controls(name, message),
            "register_auto_update" => {
                if let Some((return_url, return_path)) = two_strings(message) {
                    self.updater.subscribe(name, return_url, return_path);
                }
            }
            "unregister_auto_update" => {
                if let Some((return_url, return_path)) = two_strings(message) {
                    self.updater.unsubscribe(name, return_url, return_path);
                }
            }
            _ => debug!(%path, "unroutable OSC path"),
        }
    }

    fn loop_get_controls(&self, name: &str, message: &OscMessage) {
        if let Some((return_url, return_path)) = two_strings(message) {
            if let Some(address) = resolve(return_url) {
                match self.engine.loop_controls(name) {
                    Ok((midi_through, playback_after_recording)) => {
                        self.updater.send(
                            address,
                            return_path,
                            vec![
                                OscType::String("controls".to_owned()),
                                OscType::String(format_loop_controls(
                                    midi_through,
                                    playback_after_recording,
                                )),
                            ],
                        );
                    }
                    Err(err) => warn!(%name, %err, "could not read controls"),
                }
            }
        }
    }

    fn loop_set_controls(&self, name: &str, message: &OscMessage) {
        let serialized = match one_string(message) {
            Some(serialized) => serialized,
            None => return,
        };
        let update = match serialized.parse::<LoopControlUpdate>() {
            Ok(update) => update,
            Err(err) => {
                warn!(%serialized, %err, "bad controls");
                return;
            }
        };
        match self.engine.update_loop_controls(name, update) {
            Ok((midi_through, playback_after_recording)) => {
                self.updater.publish(
                    name,
                    "controls",
                    &format_loop_controls(midi_through, playback_after_recording),
                );
            }
            Err(err) => warn!(%name, %err, "could not update controls"),
        }
    }
}

fn string_args<'a>(message: &'a OscMessage) -> impl Iterator<Item = &'a str> {
    message.args.iter().filter_map(|arg| match arg {
        OscType::String(value) => Some(value.as_str()),
        _ => None,
    })
}

fn one_string(message: &OscMessage) -> Option<&str> {
    string_args(message).next()
}

fn two_strings(message: &OscMessage) -> Option<(&str, &str)> {
    let mut args = string_args(message);
    Some((args.next()?, args.next()?))
}

fn valid_loop_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < MAX_LOOP_NAME
        && !name.contains('/')
        && !name.contains(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_names_are_validated() {
        assert!(valid_loop_name("drums"));
        assert!(valid_loop_name("drums_2"));
        assert!(!valid_loop_name(""));
        assert!(!valid_loop_name("drums loop"));
        assert!(!valid_loop_name("jml/drums"));
        assert!(!valid_loop_name(&"x".repeat(MAX_LOOP_NAME)));
    }

    #[test]
    fn reserved_keys_stay_after_removal() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let updater = Updater::new(socket);

        updater.add_key("drums");
        assert!(updater.has_key("drums"));
        updater.remove_key("drums");
        assert!(!updater.has_key("drums"));

        updater.remove_key("mappings");
        assert!(updater.has_key("mappings"));
        assert!(updater.has_key("loops"));
        assert!(updater.has_key("errors"));
    }

    #[test]
    fn subscriptions_require_an_existing_key() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let updater = Updater::new(socket);

        updater.subscribe("nonexistent", "127.0.0.1:9000", "/reply");
        assert!(!updater.has_key("nonexistent"));

        updater.subscribe("loops", "127.0.0.1:9000", "/reply");
        updater.unsubscribe("loops", "127.0.0.1:9000", "/reply");
        assert!(updater.subscriptions.lock().unwrap()["loops"].is_empty());
    }

    #[test]
    fn publishing_reaches_a_subscriber() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let client_address = client.local_addr().unwrap().to_string();

        let updater = Updater::new(server);
        updater.subscribe("mappings", &client_address, "/mappings_update");
        updater.publish("mappings", "add", "3 cc_on 64 toggle_playback drums");

        let mut buffer = [0u8; MAX_INCOMING_PACKET_SIZE];
        let (received, _) = client.recv_from(&mut buffer).unwrap();
        let (_remainder, packet) = rosc::decoder::decode_udp(&buffer[..received]).unwrap();
        match packet {
            OscPacket::Message(message) => {
                assert_eq!(message.addr, "/mappings_update");
                assert_eq!(
                    message.args,
                    vec![
                        OscType::String("add".to_owned()),
                        OscType::String("3 cc_on 64 toggle_playback drums".to_owned()),
                    ]
                );
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }
}
