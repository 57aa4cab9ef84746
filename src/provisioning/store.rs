//! Attribute store for the provisioning record.
//!
//! Holds the three remotely visible values (SSID, password, connection
//! status) behind a single lock. The store only stores: deciding what a
//! write *means* is up to the dispatcher and the status synchronizer.
//!
//! # Write semantics
//!
//! - Values are treated as C strings: anything after the first NUL byte is
//!   past the terminator and is dropped.
//! - A value longer than the attribute's maximum is rejected as a whole,
//!   the stored value is left untouched.
//! - The status attribute takes exactly one byte, non-zero means `true`.
//!
//! # Example
//!
//! ```
//! use ble_wifi_provisioner::provisioning::{Attribute, AttributeStore};
//!
//! let store = AttributeStore::new();
//! store.write(Attribute::Ssid, b"HomeNet").unwrap();
//! assert_eq!(store.read(Attribute::Ssid), b"HomeNet");
//! assert!(store.write(Attribute::Ssid, &[b'x'; 33]).is_err());
//! ```

use crate::config::{MAX_PASSWORD_LEN, MAX_SSID_LEN, STATUS_LEN};
use crate::network::AuthMode;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Stable handle numbers of the attribute table.
const SSID_HANDLE: u16 = 1;
const PASSWORD_HANDLE: u16 = 2;
const STATUS_HANDLE: u16 = 3;

/// The closed set of attributes exposed over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Network name, up to 32 bytes.
    Ssid,
    /// Network passphrase, up to 64 bytes. Empty means open network.
    Password,
    /// Connection status, one byte boolean.
    Status,
}

impl Attribute {
    /// All attributes in table order.
    pub const ALL: [Attribute; 3] = [Self::Ssid, Self::Password, Self::Status];

    /// Maximum value length in bytes (excluding terminator).
    pub const fn max_len(self) -> usize {
        match self {
            Self::Ssid => MAX_SSID_LEN,
            Self::Password => MAX_PASSWORD_LEN,
            Self::Status => STATUS_LEN,
        }
    }

    /// Stable handle used by transports to address this attribute.
    pub const fn handle(self) -> u16 {
        match self {
            Self::Ssid => SSID_HANDLE,
            Self::Password => PASSWORD_HANDLE,
            Self::Status => STATUS_HANDLE,
        }
    }

    /// Look up an attribute by handle. Unknown handles yield `None`.
    pub fn from_handle(handle: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.handle() == handle)
    }

    /// Short name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ssid => "ssid",
            Self::Password => "password",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-capacity byte field with an explicit length.
#[derive(Zeroize)]
struct Field<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> Field<N> {
    const fn empty() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Replace the contents. The caller has already checked the length.
    fn set(&mut self, value: &[u8]) {
        self.bytes.zeroize();
        self.bytes[..value.len()].copy_from_slice(value);
        self.len = value.len();
    }
}

/// The provisioning record: SSID, password and connection status.
///
/// Zeroed on drop so the passphrase does not linger in freed memory.
#[derive(Zeroize, ZeroizeOnDrop)]
struct ProvisioningRecord {
    ssid: Field<MAX_SSID_LEN>,
    password: Field<MAX_PASSWORD_LEN>,
    status: bool,
}

impl ProvisioningRecord {
    const fn new() -> Self {
        Self {
            ssid: Field::empty(),
            password: Field::empty(),
            status: false,
        }
    }
}

/// Snapshot of the credentials taken under one lock.
pub struct Credentials {
    /// Network name.
    pub ssid: Vec<u8>,
    /// Network passphrase, wiped when the snapshot is dropped.
    pub password: Zeroizing<Vec<u8>>,
}

impl Credentials {
    /// Open authentication for an empty password, WPA/WPA2 otherwise.
    pub fn auth_mode(&self) -> AuthMode {
        if self.password.is_empty() {
            AuthMode::Open
        } else {
            AuthMode::WpaWpa2
        }
    }

    /// SSID for display, with invalid UTF-8 replaced.
    pub fn ssid_lossy(&self) -> String {
        String::from_utf8_lossy(&self.ssid).into_owned()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid_lossy())
            .field("password_len", &self.password.len())
            .finish()
    }
}

/// Shared handle to the provisioning record.
///
/// Cloning is cheap and every clone refers to the same record. The lock is
/// held only for the duration of a single read or write.
#[derive(Clone)]
pub struct AttributeStore {
    record: Arc<Mutex<ProvisioningRecord>>,
}

impl Default for AttributeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeStore {
    /// Create a store with empty SSID and password and status `false`.
    pub fn new() -> Self {
        Self {
            record: Arc::new(Mutex::new(ProvisioningRecord::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProvisioningRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a value into an attribute.
    ///
    /// On error the stored value is unchanged.
    pub fn write(&self, attribute: Attribute, data: &[u8]) -> Result<(), StoreError> {
        let value = until_terminator(data);
        let max = attribute.max_len();
        if value.len() > max {
            return Err(StoreError::TooLong {
                attribute,
                len: value.len(),
                max,
            });
        }

        match attribute {
            Attribute::Ssid => self.lock().ssid.set(value),
            Attribute::Password => self.lock().password.set(value),
            Attribute::Status => {
                // The status byte is a boolean, so NUL is a value here.
                let byte = *data.first().ok_or(StoreError::Empty(attribute))?;
                if data.len() > STATUS_LEN {
                    return Err(StoreError::TooLong {
                        attribute,
                        len: data.len(),
                        max,
                    });
                }
                self.lock().status = byte != 0;
            }
        }
        Ok(())
    }

    /// Read the current value of an attribute.
    pub fn read(&self, attribute: Attribute) -> Vec<u8> {
        let record = self.lock();
        match attribute {
            Attribute::Ssid => record.ssid.as_slice().to_vec(),
            Attribute::Password => record.password.as_slice().to_vec(),
            Attribute::Status => vec![u8::from(record.status)],
        }
    }

    /// Current connection status.
    pub fn status(&self) -> bool {
        self.lock().status
    }

    /// Mirror a status value into the store.
    ///
    /// Returns `true` if the stored value changed, so the caller knows
    /// whether remote readers must be told.
    pub fn set_status_if_changed(&self, status: bool) -> bool {
        let mut record = self.lock();
        if record.status == status {
            return false;
        }
        record.status = status;
        true
    }

    /// Whether an SSID has been written.
    pub fn is_configured(&self) -> bool {
        self.lock().ssid.len > 0
    }

    /// Take a consistent snapshot of SSID and password.
    pub fn credentials(&self) -> Credentials {
        let record = self.lock();
        Credentials {
            ssid: record.ssid.as_slice().to_vec(),
            password: Zeroizing::new(record.password.as_slice().to_vec()),
        }
    }
}

/// Cut a value at its first NUL terminator, if any.
fn until_terminator(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}

/// Errors returned for malformed attribute writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Value exceeds the attribute's maximum length.
    TooLong {
        attribute: Attribute,
        len: usize,
        max: usize,
    },
    /// Write carried no data where a value is required.
    Empty(Attribute),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLong {
                attribute,
                len,
                max,
            } => write!(f, "{} too long: {} bytes (max {})", attribute, len, max),
            Self::Empty(attribute) => write!(f, "{} write carried no data", attribute),
        }
    }
}

impl std::error::Error for StoreError {}
