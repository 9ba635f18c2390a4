use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::endpoint::error::EndpointError;
use crate::kernel::constants;
use crate::plugin_system::traits::BridgedDevice;
use crate::storage::context::StorageContext;

pub type EndpointId = String;

const IDENTITY_KEY: &str = "identity";
const MAX_PASSCODE: u32 = 99_999_998;
const MAX_DISCRIMINATOR: u16 = 0x0fff;

/// Passcodes rejected by commissioners
const INVALID_PASSCODES: [u32; 12] = [
    0, 11_111_111, 22_222_222, 33_333_333, 44_444_444, 55_555_555, 66_666_666, 77_777_777, 88_888_888,
    99_999_999, 12_345_678, 87_654_321,
];

/// Id of the shared aggregator endpoint in bridge topology
pub fn bridge_endpoint_id() -> EndpointId {
    "bridge".to_string()
}

/// Id of a plugin's own endpoint in childbridge topology
pub fn plugin_endpoint_id(plugin: &str) -> EndpointId {
    format!("plugin.{}", plugin)
}

/// Persistence namespace holding an endpoint's identity
pub fn storage_namespace(id: &str) -> String {
    format!("endpoint.{}", id)
}

/// What an endpoint is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EndpointOwner {
    /// The shared bridge (bridge topology)
    Bridge,
    /// A single dynamic platform plugin (childbridge topology)
    Plugin { plugin: String },
    /// The single device of an accessory platform plugin (childbridge topology)
    Device { plugin: String, device: String },
}

impl EndpointOwner {
    pub fn plugin(&self) -> Option<&str> {
        match self {
            EndpointOwner::Bridge => None,
            EndpointOwner::Plugin { plugin } | EndpointOwner::Device { plugin, .. } => Some(plugin),
        }
    }
}

/// Fabric a controller joined, without key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricInfo {
    pub fabric_index: u8,
    pub vendor_id: u16,
    pub label: String,
}

/// Controller session, without key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u32,
    pub peer_node_id: u64,
    pub fabric_index: u8,
    pub active: bool,
}

/// Commissioning view mirrored onto plugins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissioningState {
    pub paired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_pairing_code: Option<String>,
    #[serde(default)]
    pub fabrics: Vec<FabricInfo>,
    #[serde(default)]
    pub sessions: Vec<SessionInfo>,
}

/// Durable part of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointIdentity {
    pub port: u16,
    pub passcode: u32,
    pub discriminator: u16,
    #[serde(default)]
    pub commissioned: bool,
    #[serde(default)]
    pub fabrics: Vec<FabricInfo>,
}

/// Values used when an endpoint has no persisted identity yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDefaults {
    pub port: u16,
    pub passcode: Option<u32>,
    pub discriminator: Option<u16>,
}

impl Default for EndpointDefaults {
    fn default() -> Self {
        Self {
            port: constants::DEFAULT_PORT,
            passcode: None,
            discriminator: None,
        }
    }
}

/// Serializable view of an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub id: EndpointId,
    pub owner: EndpointOwner,
    pub port: u16,
    pub passcode: u32,
    pub discriminator: u16,
    pub commissioned: bool,
    pub aggregator: bool,
    pub started: bool,
    pub online: bool,
    pub reachable: bool,
    pub devices: usize,
    pub commissioning: CommissioningState,
}

/// Server identity bound to the bridge, a plugin, or a single device
#[derive(Debug)]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub owner: EndpointOwner,
    pub storage: StorageContext,
    pub identity: EndpointIdentity,
    pub aggregator: bool,
    pub started: bool,
    pub online: bool,
    pub reachable: bool,
    pub commissioning: CommissioningState,
    pub devices: BTreeMap<String, BridgedDevice>,
}

impl EndpointRecord {
    /// Open an endpoint, reusing its persisted identity or creating one
    pub async fn open(
        id: &str,
        owner: EndpointOwner,
        aggregator: bool,
        storage: StorageContext,
        port: u16,
        defaults: &EndpointDefaults,
    ) -> Result<Self, EndpointError> {
        let persisted: Option<EndpointIdentity> = storage.get(IDENTITY_KEY, None).await?;
        let identity = match persisted {
            Some(identity) => identity,
            None => {
                let mut rng = rand::thread_rng();
                let passcode = match defaults.passcode {
                    Some(passcode) => passcode,
                    None => generate_passcode(&mut rng),
                };
                let discriminator = match defaults.discriminator {
                    Some(discriminator) => discriminator,
                    None => rng.gen_range(0..=MAX_DISCRIMINATOR),
                };
                EndpointIdentity {
                    port,
                    passcode,
                    discriminator,
                    commissioned: false,
                    fabrics: Vec::new(),
                }
            }
        };
        validate_passcode(identity.passcode)?;
        if identity.discriminator > MAX_DISCRIMINATOR {
            return Err(EndpointError::InvalidDiscriminator(identity.discriminator));
        }

        let mut record = Self {
            id: id.to_string(),
            owner,
            storage,
            identity,
            aggregator,
            started: false,
            online: false,
            reachable: false,
            commissioning: CommissioningState::default(),
            devices: BTreeMap::new(),
        };
        record.persist_identity().await?;
        record.refresh_commissioning();
        Ok(record)
    }

    pub async fn persist_identity(&self) -> Result<(), EndpointError> {
        self.storage.set(IDENTITY_KEY, &self.identity).await?;
        Ok(())
    }

    pub fn manual_pairing_code(&self) -> String {
        manual_pairing_code(self.identity.passcode, self.identity.discriminator)
    }

    pub fn qr_pairing_code(&self) -> String {
        qr_pairing_code(
            constants::VENDOR_ID,
            constants::PRODUCT_ID,
            self.identity.passcode,
            self.identity.discriminator,
        )
    }

    /// Recompute the commissioning view from the identity. Pairing codes are
    /// only shown while the endpoint still accepts commissioning.
    pub fn refresh_commissioning(&mut self) {
        let commissioned = self.identity.commissioned;
        self.commissioning.paired = commissioned;
        self.commissioning.fabrics = self.identity.fabrics.clone();
        if commissioned {
            self.commissioning.manual_pairing_code = None;
            self.commissioning.qr_pairing_code = None;
        } else {
            self.commissioning.manual_pairing_code = Some(self.manual_pairing_code());
            self.commissioning.qr_pairing_code = Some(self.qr_pairing_code());
        }
    }

    /// Offline endpoints expose nothing about commissioning
    pub fn clear_commissioning(&mut self) {
        self.commissioning = CommissioningState::default();
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.id.clone(),
            owner: self.owner.clone(),
            port: self.identity.port,
            passcode: self.identity.passcode,
            discriminator: self.identity.discriminator,
            commissioned: self.identity.commissioned,
            aggregator: self.aggregator,
            started: self.started,
            online: self.online,
            reachable: self.reachable,
            devices: self.devices.len(),
            commissioning: self.commissioning.clone(),
        }
    }
}

pub fn validate_passcode(passcode: u32) -> Result<(), EndpointError> {
    if passcode == 0 || passcode > MAX_PASSCODE || INVALID_PASSCODES.contains(&passcode) {
        return Err(EndpointError::InvalidPasscode(passcode));
    }
    Ok(())
}

pub fn generate_passcode<R: Rng>(rng: &mut R) -> u32 {
    loop {
        let candidate = rng.gen_range(1..=MAX_PASSCODE);
        if !INVALID_PASSCODES.contains(&candidate) {
            return candidate;
        }
    }
}

/// 11-digit manual pairing code with a trailing Verhoeff check digit
pub fn manual_pairing_code(passcode: u32, discriminator: u16) -> String {
    let short_discriminator = u32::from((discriminator >> 8) & 0x0f);
    let chunk1 = short_discriminator >> 2;
    let chunk2 = ((short_discriminator & 0x03) << 14) | (passcode & 0x3fff);
    let chunk3 = passcode >> 14;
    let digits = format!("{:01}{:05}{:04}", chunk1, chunk2, chunk3);
    let check = verhoeff_check_digit(&digits);
    format!("{}{}", digits, check)
}

/// `MT:` onboarding payload, base38 encoded
pub fn qr_pairing_code(vendor_id: u16, product_id: u16, passcode: u32, discriminator: u16) -> String {
    // version(3) vendor(16) product(16) flow(2) rendezvous(8) discriminator(12) passcode(27) padding(4)
    const ON_NETWORK: u128 = 0x04;
    let mut bits: u128 = 0;
    let mut offset = 0u32;
    let mut push = |value: u128, width: u32| {
        bits |= (value & ((1u128 << width) - 1)) << offset;
        offset += width;
    };
    push(0, 3);
    push(u128::from(vendor_id), 16);
    push(u128::from(product_id), 16);
    push(0, 2);
    push(ON_NETWORK, 8);
    push(u128::from(discriminator), 12);
    push(u128::from(passcode), 27);
    push(0, 4);

    let bytes = bits.to_le_bytes();
    format!("MT:{}", base38_encode(&bytes[..11]))
}

const BASE38_ALPHABET: &[u8; 38] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-.";

fn base38_encode(bytes: &[u8]) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let (mut value, chars) = match chunk.len() {
            3 => (u32::from(chunk[0]) | u32::from(chunk[1]) << 8 | u32::from(chunk[2]) << 16, 5),
            2 => (u32::from(chunk[0]) | u32::from(chunk[1]) << 8, 4),
            _ => (u32::from(chunk[0]), 2),
        };
        for _ in 0..chars {
            out.push(char::from(BASE38_ALPHABET[(value % 38) as usize]));
            value /= 38;
        }
    }
    out
}

const VERHOEFF_D: [[u8; 10]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 2, 3, 4, 0, 6, 7, 8, 9, 5],
    [2, 3, 4, 0, 1, 7, 8, 9, 5, 6],
    [3, 4, 0, 1, 2, 8, 9, 5, 6, 7],
    [4, 0, 1, 2, 3, 9, 5, 6, 7, 8],
    [5, 9, 8, 7, 6, 0, 4, 3, 2, 1],
    [6, 5, 9, 8, 7, 1, 0, 4, 3, 2],
    [7, 6, 5, 9, 8, 2, 1, 0, 4, 3],
    [8, 7, 6, 5, 9, 3, 2, 1, 0, 4],
    [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
];

const VERHOEFF_P: [[u8; 10]; 8] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 5, 7, 6, 2, 8, 3, 0, 9, 4],
    [5, 8, 0, 3, 7, 9, 6, 1, 4, 2],
    [8, 9, 1, 6, 0, 4, 3, 5, 2, 7],
    [9, 4, 5, 3, 1, 2, 6, 8, 7, 0],
    [4, 2, 8, 6, 5, 7, 3, 9, 0, 1],
    [2, 7, 9, 3, 8, 0, 6, 4, 1, 5],
    [7, 0, 4, 6, 9, 1, 3, 2, 5, 8],
];

const VERHOEFF_INV: [u8; 10] = [0, 4, 3, 2, 1, 5, 6, 7, 8, 9];

pub fn verhoeff_check_digit(digits: &str) -> char {
    let mut c = 0u8;
    for (i, digit) in digits.bytes().rev().filter(u8::is_ascii_digit).enumerate() {
        let d = digit - b'0';
        c = VERHOEFF_D[c as usize][VERHOEFF_P[(i + 1) % 8][d as usize] as usize];
    }
    char::from(b'0' + VERHOEFF_INV[c as usize])
}

/// Whether `code` ends in a valid Verhoeff check digit
pub fn verhoeff_validate(code: &str) -> bool {
    let mut c = 0u8;
    for (i, digit) in code.bytes().rev().enumerate() {
        if !digit.is_ascii_digit() {
            return false;
        }
        let d = digit - b'0';
        c = VERHOEFF_D[c as usize][VERHOEFF_P[i % 8][d as usize] as usize];
    }
    c == 0
}
