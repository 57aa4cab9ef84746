//! BLE GATT control channel for ESP32.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service: WiFi Provisioning
//! ├── SSID     (Read, Write)          handle 1
//! ├── Password (Read, Write)          handle 2
//! └── Status   (Read, Write, Notify)  handle 3
//! ```
//!
//! NimBLE callbacks run on the host task, so they only post events to the
//! dispatcher. Reads are served straight from the attribute store.
//!
//! # Security Considerations
//!
//! Credentials travel as plaintext at the application layer. Provision in a
//! physically controlled environment; pairing is not enforced.

use super::{ControlChannel, TransportError};
use crate::config::{PASSWORD_CHAR_UUID, SERVICE_UUID, SSID_CHAR_UUID, STATUS_CHAR_UUID};
use crate::provisioning::{Attribute, AttributeStore, ControlEvent, EventQueue};
use esp32_nimble::utilities::mutex::Mutex as NimbleMutex;
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLECharacteristic, BLEDevice, NimbleProperties};
use log::{info, warn};
use std::sync::Arc;

fn parse_uuid(uuid: &str) -> Result<BleUuid, TransportError> {
    BleUuid::from_uuid128_string(uuid)
        .map_err(|e| TransportError::Ble(format!("bad UUID {}: {:?}", uuid, e)))
}

/// NimBLE implementation of [`ControlChannel`].
pub struct NimbleControlChannel {
    device_name: String,
    status_char: Arc<NimbleMutex<BLECharacteristic>>,
}

impl NimbleControlChannel {
    /// Register the provisioning service and hook its callbacks to `events`.
    pub fn new(
        device_name: &str,
        store: AttributeStore,
        events: EventQueue,
    ) -> Result<Self, TransportError> {
        let device = BLEDevice::take();
        BLEDevice::set_device_name(device_name)
            .map_err(|e| TransportError::Ble(format!("{:?}", e)))?;

        let server = device.get_server();
        // Advertising resumes through the dispatcher after a link drop.
        server.advertise_on_disconnect(false);
        server.on_connect(|_server, desc| {
            info!("Configurator connected: {}", desc.address());
        });
        let disconnect_events = events.clone();
        server.on_disconnect(move |_desc, reason| {
            info!("Configurator disconnected ({:?})", reason);
            if let Err(e) = disconnect_events.post(ControlEvent::LinkDisconnected) {
                warn!("Disconnect event dropped: {}", e);
            }
        });

        let service = server.create_service(parse_uuid(SERVICE_UUID)?);

        let mut status_char = None;
        for (attribute, uuid) in [
            (Attribute::Ssid, SSID_CHAR_UUID),
            (Attribute::Password, PASSWORD_CHAR_UUID),
            (Attribute::Status, STATUS_CHAR_UUID),
        ] {
            let mut props = NimbleProperties::READ | NimbleProperties::WRITE;
            if attribute == Attribute::Status {
                props |= NimbleProperties::NOTIFY;
            }
            let characteristic = service
                .lock()
                .create_characteristic(parse_uuid(uuid)?, props);

            let read_store = store.clone();
            characteristic.lock().on_read(move |value, _desc| {
                value.set_value(&read_store.read(attribute));
            });

            let write_events = events.clone();
            characteristic.lock().on_write(move |args| {
                let event = ControlEvent::written(attribute, args.recv_data());
                if let Err(e) = write_events.post(event) {
                    warn!("{} write dropped: {}", attribute, e);
                }
            });

            if attribute == Attribute::Status {
                characteristic.lock().set_value(&store.read(Attribute::Status));
                status_char = Some(characteristic);
            }
        }

        let status_char = status_char
            .ok_or_else(|| TransportError::Ble("status characteristic missing".into()))?;

        Ok(Self {
            device_name: device_name.to_string(),
            status_char,
        })
    }
}

impl ControlChannel for NimbleControlChannel {
    fn start_discoverable(&self) -> Result<(), TransportError> {
        let advertising = BLEDevice::take().get_advertising();
        // A 128-bit service UUID does not fit next to the name.
        advertising
            .lock()
            .set_data(BLEAdvertisementData::new().name(&self.device_name))
            .map_err(|e| TransportError::Advertising(format!("{:?}", e)))?;
        advertising
            .lock()
            .start()
            .map_err(|e| TransportError::Advertising(format!("{:?}", e)))?;
        info!("BLE advertising as \"{}\"", self.device_name);
        Ok(())
    }

    fn notify_status(&self, connected: bool) -> Result<(), TransportError> {
        self.status_char
            .lock()
            .set_value(&[u8::from(connected)])
            .notify();
        Ok(())
    }
}
