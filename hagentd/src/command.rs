//! Per-connection command loop.
//!
//! Each iteration reads one action byte and one framed parameter message,
//! even for actions that take no parameters, so the stream stays
//! self-synchronising. Nothing carries over between iterations besides the
//! open connection.

use hagent_wire::protocol::{split_body, Action, Component, LifecycleAction, RESPONSE_MESSAGE};
use hagent_wire::{Connection, ExpandableBuffer, MessageBuilder, Stream, TransportError};
use tracing::{debug, trace};

use crate::components::Services;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    AwaitingAction,
    ReadingParameters,
    Dispatching,
    Closed,
}

/// Why the loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent the finish action.
    Finished,
    /// The client closed the connection between commands.
    PeerClosed,
}

pub struct CommandProtocol<'a, S> {
    conn: &'a mut Connection<S>,
    services: &'a Services,
    max_parameter_length: usize,
    params: ExpandableBuffer,
    state: ProtocolState,
    handled: u64,
}

impl<'a, S: Stream> CommandProtocol<'a, S> {
    pub fn new(conn: &'a mut Connection<S>, services: &'a Services, max_parameter_length: usize) -> Self {
        Self {
            conn,
            services,
            max_parameter_length,
            params: ExpandableBuffer::new(),
            state: ProtocolState::AwaitingAction,
            handled: 0,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Number of commands answered so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Serve commands until the client finishes or disconnects.
    pub fn run(&mut self) -> Result<CloseReason, TransportError> {
        loop {
            if let Some(reason) = self.step()? {
                return Ok(reason);
            }
        }
    }

    /// Handle one command. `Some` once the session is over.
    pub fn step(&mut self) -> Result<Option<CloseReason>, TransportError> {
        self.conn.check_interrupts()?;
        self.state = ProtocolState::AwaitingAction;

        self.conn.start_message_read()?;
        let Some(code) = self.conn.read_byte()? else {
            self.conn.end_message_read();
            self.state = ProtocolState::Closed;
            return Ok(Some(CloseReason::PeerClosed));
        };

        self.state = ProtocolState::ReadingParameters;
        self.conn
            .read_framed_message(&mut self.params, self.max_parameter_length)?;

        self.state = ProtocolState::Dispatching;
        trace!(code = %char::from(code), len = self.params.len(), "command received");
        let response = match Action::from_code(code) {
            Some(Action::Finish) => {
                debug!(remote = %self.conn.remote_label(), "client finished session");
                self.state = ProtocolState::Closed;
                return Ok(Some(CloseReason::Finished));
            }
            Some(Action::Lifecycle(action)) => self.lifecycle(action),
            Some(Action::SetParameter(component)) => self.set_parameter(component),
            None => format!("Unknown command 0x{code:02x}.\n"),
        };

        self.respond(&response)?;
        self.handled += 1;
        self.state = ProtocolState::AwaitingAction;
        Ok(None)
    }

    fn respond(&mut self, text: &str) -> Result<(), TransportError> {
        let mut msg = MessageBuilder::begin(RESPONSE_MESSAGE);
        msg.append_counted_text(text.as_bytes())?;
        msg.end_message(&mut *self.conn)?;
        self.conn.flush()
    }

    fn lifecycle(&self, action: LifecycleAction) -> String {
        let (raw_component, raw_args) = split_body(self.params.as_bytes());
        let raw_component = String::from_utf8_lossy(raw_component);
        let component = match raw_component.parse::<Component>() {
            Ok(component) => component,
            Err(_) => return format!("Unknown component '{raw_component}'.\n"),
        };

        let args_text = String::from_utf8_lossy(raw_args);
        let args: Vec<&str> = if args_text.is_empty() {
            Vec::new()
        } else {
            args_text.split('\0').collect()
        };
        debug!(component = component.id(), action = action.name(), ?args, "lifecycle request");
        self.services
            .lifecycle
            .component_action(component, action, &args)
    }

    fn set_parameter(&self, component: Component) -> String {
        let configuration = &self.services.configuration;
        if !configuration.is_installed(component) {
            return format!("{component} is not installed.\n");
        }

        let (raw_name, raw_value) = split_body(self.params.as_bytes());
        let raw_name = String::from_utf8_lossy(raw_name);
        let value = String::from_utf8_lossy(raw_value);

        let Some(lookup) = configuration.lookup_canonical_param(component, &raw_name) else {
            return format!("Unknown {component} parameter: {raw_name}\n");
        };
        if let Err(reason) = configuration.validate(component, &lookup.canonical_name, &value) {
            return format!(
                "Invalid value '{value}' for {}: {reason}\n",
                lookup.canonical_name
            );
        }
        configuration.apply_config(component, &lookup.canonical_name, &value, &lookup.config_file)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::components::{ComponentLifecycle, Configuration, InvalidValue, ParamLookup};
    use hagent_wire::MessageReader;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ComponentLifecycle for Recorder {
        fn component_action(
            &self,
            component: Component,
            action: LifecycleAction,
            args: &[&str],
        ) -> String {
            let call = format!("{action} {} {}", component.id(), args.join(","));
            self.calls.lock().unwrap().push(call.clone());
            format!("ran {call}\n")
        }
    }

    /// Only ZooKeeper is installed and it knows one integer parameter.
    struct FakeConfig;

    impl Configuration for FakeConfig {
        fn is_installed(&self, component: Component) -> bool {
            component == Component::ZooKeeper
        }

        fn lookup_canonical_param(&self, _: Component, raw_name: &str) -> Option<ParamLookup> {
            (raw_name == "tickTime" || raw_name == "zk.tick").then(|| ParamLookup {
                canonical_name: "tickTime".into(),
                config_file: "zoo.cfg".into(),
            })
        }

        fn validate(&self, _: Component, _: &str, value: &str) -> Result<(), InvalidValue> {
            value.parse::<u32>().map(|_| ()).map_err(|_| InvalidValue::NotAnInteger)
        }

        fn apply_config(&self, component: Component, name: &str, value: &str, file: &str) -> String {
            format!("{component}: {name}={value} -> {file}\n")
        }
    }

    fn services() -> Services {
        Services::new(Recorder::default(), FakeConfig)
    }

    fn send(client: &mut UnixStream, code: u8, body: &[u8]) {
        let mut frame = vec![code];
        frame.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        frame.extend_from_slice(body);
        client.write_all(&frame).expect("send");
    }

    fn receive(client: &mut UnixStream) -> String {
        let mut header = [0u8; 5];
        client.read_exact(&mut header).expect("response header");
        assert_eq!(header[0], RESPONSE_MESSAGE);
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut body = vec![0u8; len - 4];
        client.read_exact(&mut body).expect("response body");
        let mut reader = MessageReader::from_bytes(&body);
        let text = reader.get_counted_text().expect("counted text").to_string();
        reader.verify_fully_consumed().expect("no trailing bytes");
        text
    }

    /// Run the protocol on one end of a socket pair in a thread.
    fn serve(max: usize) -> (UnixStream, thread::JoinHandle<Result<(CloseReason, u64), String>>) {
        let (client, server) = UnixStream::pair().expect("socket pair");
        let handle = thread::spawn(move || {
            let services = services();
            let mut conn = Connection::new(server, "test", "peer");
            let mut protocol = CommandProtocol::new(&mut conn, &services, max);
            let result = protocol.run().map_err(|e| e.to_string());
            result.map(|reason| (reason, protocol.handled()))
        });
        (client, handle)
    }

    #[test]
    fn not_installed_component_keeps_the_session_open() {
        let (mut client, handle) = serve(4096);
        send(&mut client, b'h', b"hdfs.replication\x003");
        assert_eq!(receive(&mut client), "HDFS is not installed.\n");

        send(&mut client, b'z', b"zk.tick\x002000");
        assert_eq!(receive(&mut client), "ZooKeeper: tickTime=2000 -> zoo.cfg\n");

        send(&mut client, b'X', b"");
        assert_eq!(handle.join().expect("thread"), Ok((CloseReason::Finished, 2)));
    }

    #[test]
    fn parameter_errors_are_reported_in_order() {
        let (mut client, handle) = serve(4096);
        send(&mut client, b'z', b"maxClientCnxns\x0010");
        assert_eq!(receive(&mut client), "Unknown ZooKeeper parameter: maxClientCnxns\n");
        send(&mut client, b'z', b"tickTime\x00soon");
        assert_eq!(
            receive(&mut client),
            "Invalid value 'soon' for tickTime: expected an integer\n"
        );
        drop(client);
        assert_eq!(handle.join().expect("thread"), Ok((CloseReason::PeerClosed, 2)));
    }

    #[test]
    fn lifecycle_args_are_split_on_separator() {
        let (mut client, handle) = serve(4096);
        send(&mut client, b'S', b"kafka\0--broker\x001");
        assert_eq!(receive(&mut client), "ran start kafka --broker,1\n");
        send(&mut client, b'T', b"yarn");
        assert_eq!(receive(&mut client), "ran stop yarn \n");
        send(&mut client, b'R', b"cassandra");
        assert_eq!(receive(&mut client), "Unknown component 'cassandra'.\n");
        send(&mut client, b'X', b"");
        assert!(handle.join().expect("thread").is_ok());
    }

    #[test]
    fn unknown_command_is_not_fatal() {
        let (mut client, handle) = serve(4096);
        send(&mut client, b'Q', b"");
        assert_eq!(receive(&mut client), "Unknown command 0x51.\n");
        send(&mut client, 0xff, b"whatever");
        assert_eq!(receive(&mut client), "Unknown command 0xff.\n");
        send(&mut client, b'X', b"");
        assert_eq!(handle.join().expect("thread"), Ok((CloseReason::Finished, 2)));
    }

    #[test]
    fn oversized_parameters_end_the_session() {
        let (mut client, handle) = serve(16);
        send(&mut client, b'z', &[b'a'; 64]);
        let err = handle.join().expect("thread").expect_err("must fail");
        assert!(err.contains("exceeds maximum"), "{err}");
    }

    #[test]
    fn eof_inside_parameters_is_an_error() {
        let (mut client, handle) = serve(4096);
        client.write_all(&[b'z', 0, 0, 0, 20, b'x']).expect("send");
        drop(client);
        let err = handle.join().expect("thread").expect_err("must fail");
        assert!(err.contains("unexpected EOF"), "{err}");
    }
}
