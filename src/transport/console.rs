//! Console control channel for host development.
//!
//! Stands in for the BLE GATT service on a development machine: each line
//! typed on stdin becomes the same event a remote configurator would
//! produce, and status notifications are printed.
//!
//! # Commands
//!
//! - `ssid <name>` - write the SSID attribute
//! - `password [<secret>]` - write the password attribute (empty = open)
//! - `status <0|1>` - write the status attribute
//! - `connect` / `disconnect` - shorthand for `status 1` / `status 0`
//! - `write <handle> <text>` - raw write to any attribute handle
//! - `drop` - simulate the configurator's link dropping
//! - `lose-wifi` - simulate the access point going away
//! - `show` - print the attribute table
//! - `help` - show help
//!
//! # Example Session
//!
//! ```text
//! > ssid HomeNet
//! > password
//! [notify] status = 1
//! > show
//! ssid     = "HomeNet"
//! password = (0 bytes)
//! status   = 1
//! ```

use super::{ControlChannel, TransportError};
use crate::config::{PASSWORD_CHAR_UUID, SERVICE_UUID, SSID_CHAR_UUID, STATUS_CHAR_UUID};
use crate::network::HostNetwork;
use crate::provisioning::{Attribute, AttributeStore, ControlEvent, EventQueue};
use log::{info, warn};
use std::io::{BufRead, Write};
use std::sync::Arc;

/// Help text for available commands.
pub const HELP_TEXT: &str = r#"
Available commands:
  ssid <name>            Write the SSID attribute
  password [<secret>]    Write the password attribute (starts a join)
  status <0|1>           Write the status attribute
  connect                Same as 'status 1'
  disconnect             Same as 'status 0'
  write <handle> <text>  Raw write to an attribute handle
  drop                   Simulate the configurator disconnecting
  lose-wifi              Simulate the access point going away
  show                   Print the attribute table
  help                   Show this help
"#;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Write raw bytes to an attribute handle.
    Write { handle: u16, data: Vec<u8> },
    /// Configurator link dropped.
    Drop,
    /// Access point went away.
    LoseWifi,
    /// Print the attribute table.
    Show,
    /// Show help.
    Help,
    /// Unknown or invalid command.
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a command from an input line.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let mut parts = input.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        match cmd.to_lowercase().as_str() {
            "ssid" => Self::write(Attribute::Ssid, args.as_bytes().to_vec()),
            "password" | "pass" => Self::write(Attribute::Password, args.as_bytes().to_vec()),
            "status" => match args {
                "0" | "false" => Self::write(Attribute::Status, vec![0]),
                "1" | "true" => Self::write(Attribute::Status, vec![1]),
                _ => Self::Unknown("Usage: status <0|1>".to_string()),
            },
            "connect" => Self::write(Attribute::Status, vec![1]),
            "disconnect" => Self::write(Attribute::Status, vec![0]),
            "write" => {
                let mut write_parts = args.splitn(2, ' ');
                let handle = write_parts.next().unwrap_or("").parse::<u16>();
                let text = write_parts.next().unwrap_or("");
                match handle {
                    Ok(handle) => Self::Write {
                        handle,
                        data: text.as_bytes().to_vec(),
                    },
                    Err(_) => Self::Unknown("Usage: write <handle> <text>".to_string()),
                }
            }
            "drop" => Self::Drop,
            "lose-wifi" => Self::LoseWifi,
            "show" | "s" => Self::Show,
            "help" | "h" | "?" => Self::Help,
            "" => Self::Unknown(String::new()),
            _ => Self::Unknown(format!(
                "Unknown command: {}. Type 'help' for commands.",
                cmd
            )),
        }
    }

    fn write(attribute: Attribute, data: Vec<u8>) -> Self {
        Self::Write {
            handle: attribute.handle(),
            data,
        }
    }
}

/// Render the attribute table. The password is shown by length only.
pub fn format_attributes(store: &AttributeStore) -> String {
    format!(
        "ssid     = {:?}\npassword = ({} bytes)\nstatus   = {}",
        String::from_utf8_lossy(&store.read(Attribute::Ssid)),
        store.read(Attribute::Password).len(),
        u8::from(store.status())
    )
}

/// Console implementation of [`ControlChannel`].
pub struct ConsoleChannel {
    device_name: String,
}

impl ConsoleChannel {
    /// Create a console channel advertising under `device_name`.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }

    /// Feed console lines into the event queue until `input` ends.
    ///
    /// Returns when the input is exhausted; dropping `events` afterwards
    /// lets the dispatcher finish.
    pub fn run_input<R, W>(
        input: R,
        mut output: W,
        store: &AttributeStore,
        events: &EventQueue,
        network: Option<&Arc<HostNetwork>>,
    ) where
        R: BufRead,
        W: Write,
    {
        for line in input.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                }
            };

            let (event, reply) = match ConsoleCommand::parse(&line) {
                ConsoleCommand::Write { handle, data } => {
                    (Some(ControlEvent::AttributeWritten { handle, data }), None)
                }
                ConsoleCommand::Drop => (Some(ControlEvent::LinkDisconnected), None),
                ConsoleCommand::LoseWifi => match network {
                    Some(network) => {
                        network.simulate_link_loss();
                        (None, None)
                    }
                    None => (None, Some("No simulated network attached".to_string())),
                },
                ConsoleCommand::Show => (None, Some(format_attributes(store))),
                ConsoleCommand::Help => (None, Some(HELP_TEXT.to_string())),
                ConsoleCommand::Unknown(msg) => (None, (!msg.is_empty()).then_some(msg)),
            };

            if let Some(event) = event {
                if let Err(e) = events.post(event) {
                    warn!("Console event dropped: {}", e);
                }
            }

            if let Some(reply) = reply {
                if let Err(e) = writeln!(output, "{}", reply).and_then(|()| output.flush()) {
                    warn!("Console write failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl ControlChannel for ConsoleChannel {
    fn start_discoverable(&self) -> Result<(), TransportError> {
        info!(
            "Advertising as \"{}\" (console, service {})",
            self.device_name, SERVICE_UUID
        );
        info!(
            "Characteristics: ssid {}, password {}, status {}",
            SSID_CHAR_UUID, PASSWORD_CHAR_UUID, STATUS_CHAR_UUID
        );
        Ok(())
    }

    fn notify_status(&self, connected: bool) -> Result<(), TransportError> {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "[notify] status = {}", u8::from(connected))?;
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::event_queue;
    use std::io::Cursor;
    use std::time::Duration;

    #[test]
    fn test_parse_attribute_writes() {
        assert_eq!(
            ConsoleCommand::parse("ssid Home Net"),
            ConsoleCommand::Write {
                handle: Attribute::Ssid.handle(),
                data: b"Home Net".to_vec()
            }
        );
        assert_eq!(
            ConsoleCommand::parse("password"),
            ConsoleCommand::Write {
                handle: Attribute::Password.handle(),
                data: Vec::new()
            }
        );
        assert_eq!(
            ConsoleCommand::parse("STATUS 1"),
            ConsoleCommand::Write {
                handle: Attribute::Status.handle(),
                data: vec![1]
            }
        );
        assert_eq!(
            ConsoleCommand::parse("disconnect"),
            ConsoleCommand::Write {
                handle: Attribute::Status.handle(),
                data: vec![0]
            }
        );
    }

    #[test]
    fn test_parse_raw_write() {
        assert_eq!(
            ConsoleCommand::parse("write 9 hello"),
            ConsoleCommand::Write {
                handle: 9,
                data: b"hello".to_vec()
            }
        );
        assert!(matches!(
            ConsoleCommand::parse("write x hello"),
            ConsoleCommand::Unknown(_)
        ));
    }

    #[test]
    fn test_parse_other_commands() {
        assert_eq!(ConsoleCommand::parse("drop"), ConsoleCommand::Drop);
        assert_eq!(ConsoleCommand::parse("lose-wifi"), ConsoleCommand::LoseWifi);
        assert_eq!(ConsoleCommand::parse(" show "), ConsoleCommand::Show);
        assert_eq!(ConsoleCommand::parse("?"), ConsoleCommand::Help);
        assert!(matches!(
            ConsoleCommand::parse("status maybe"),
            ConsoleCommand::Unknown(_)
        ));
        assert!(matches!(
            ConsoleCommand::parse("reboot"),
            ConsoleCommand::Unknown(msg) if msg.contains("reboot")
        ));
    }

    #[test]
    fn test_run_input_posts_events() {
        let store = AttributeStore::new();
        let (events, inbox) = event_queue();
        let input = Cursor::new("ssid HomeNet\nshow\npassword\ndrop\n");
        let mut output = Vec::new();

        ConsoleChannel::run_input(input, &mut output, &store, &events, None);

        let received: Vec<ControlEvent> = std::iter::from_fn(|| {
            inbox.recv_timeout(Duration::from_millis(10))
        })
        .collect();
        assert_eq!(received.len(), 3);
        assert!(matches!(
            &received[0],
            ControlEvent::AttributeWritten { handle: 1, data } if data == b"HomeNet"
        ));
        assert!(matches!(received[2], ControlEvent::LinkDisconnected));
        assert!(String::from_utf8(output).unwrap().contains("status   = 0"));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_run_input_stops_when_output_fails() {
        let store = AttributeStore::new();
        let (events, inbox) = event_queue();
        let input = Cursor::new("ssid HomeNet
help
drop
");

        ConsoleChannel::run_input(input, BrokenPipe, &store, &events, None);

        // The write before the failing reply went through, nothing after it.
        assert!(matches!(
            inbox.recv_timeout(Duration::from_millis(10)),
            Some(ControlEvent::AttributeWritten { handle: 1, .. })
        ));
        assert!(inbox.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_format_attributes_hides_password() {
        let store = AttributeStore::new();
        store.write(Attribute::Password, b"hunter22").unwrap();
        let text = format_attributes(&store);
        assert!(text.contains("(8 bytes)"));
        assert!(!text.contains("hunter22"));
    }
}
