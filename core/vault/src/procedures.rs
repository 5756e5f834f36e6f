//! Cryptographic procedures over vault records.
//!
//! Procedures read secrets by location and write results to other
//! locations. Only non-secret values leave the engine: public keys,
//! signatures, and the phrase of a freshly generated mnemonic.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

use crate::record::{ClientState, RecordKind, Secret};
use bastion_common::{Error, Location, RecordHint, Result, VaultPath};
use bastion_crypto::ed25519;
use bastion_crypto::mnemonic::{generate_mnemonic, mnemonic_to_seed};
use bastion_crypto::slip10::{EXTENDED_KEY_LENGTH, MIN_SEED_LENGTH};
use bastion_crypto::{random_bytes, Chain, ExtendedKey};

/// Default seed size for [`Procedure::Slip10Generate`].
pub const DEFAULT_SEED_SIZE: usize = 64;

/// Largest seed [`Procedure::Slip10Generate`] produces.
pub const MAX_SEED_SIZE: usize = 1024;

/// Where a procedure stores its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLocation {
    pub location: Location,
    #[serde(default)]
    pub hint: RecordHint,
    /// Replace a live record already at `location`.
    #[serde(default)]
    pub overwrite: bool,
}

impl OutputLocation {
    pub fn new(location: Location, hint: RecordHint) -> Self {
        Self {
            location,
            hint,
            overwrite: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

impl From<Location> for OutputLocation {
    fn from(location: Location) -> Self {
        Self::new(location, RecordHint::default())
    }
}

/// Supported key types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519,
}

/// Source of a SLIP-0010 derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Slip10DeriveInput {
    /// Derive from a seed; the chain starts at the master key.
    Seed(Location),
    /// Derive further from an extended key.
    Key(Location),
}

impl Slip10DeriveInput {
    pub fn location(&self) -> &Location {
        match self {
            Self::Seed(location) | Self::Key(location) => location,
        }
    }
}

/// A cryptographic operation on vault records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Procedure {
    /// Generate a random seed.
    #[serde(rename = "SLIP10Generate", rename_all = "camelCase")]
    Slip10Generate {
        output: OutputLocation,
        size_bytes: Option<usize>,
    },
    /// Derive an extended key along `chain`.
    #[serde(rename = "SLIP10Derive")]
    Slip10Derive {
        chain: Chain,
        input: Slip10DeriveInput,
        output: OutputLocation,
    },
    /// Generate a mnemonic and store its seed.
    #[serde(rename = "BIP39Generate")]
    Bip39Generate {
        passphrase: Option<String>,
        output: OutputLocation,
    },
    /// Store the seed of an existing mnemonic.
    #[serde(rename = "BIP39Recover")]
    Bip39Recover {
        mnemonic: String,
        passphrase: Option<String>,
        output: OutputLocation,
    },
    /// Generate a random private key.
    GenerateKey { ty: KeyType, output: OutputLocation },
    /// Return the public key of a private key record.
    #[serde(alias = "Ed25519PublicKey", rename_all = "camelCase")]
    PublicKey { ty: KeyType, private_key: Location },
    /// Sign a message with a private key record.
    #[serde(rename_all = "camelCase")]
    Ed25519Sign { private_key: Location, msg: Vec<u8> },
}

impl Procedure {
    /// Locations whose secrets the procedure reads.
    pub fn inputs(&self) -> Vec<&Location> {
        match self {
            Self::Slip10Derive { input, .. } => vec![input.location()],
            Self::PublicKey { private_key, .. } | Self::Ed25519Sign { private_key, .. } => {
                vec![private_key]
            }
            Self::Slip10Generate { .. }
            | Self::Bip39Generate { .. }
            | Self::Bip39Recover { .. }
            | Self::GenerateKey { .. } => Vec::new(),
        }
    }

    /// Location the procedure writes, if any.
    pub fn output(&self) -> Option<&OutputLocation> {
        match self {
            Self::Slip10Generate { output, .. }
            | Self::Slip10Derive { output, .. }
            | Self::Bip39Generate { output, .. }
            | Self::Bip39Recover { output, .. }
            | Self::GenerateKey { output, .. } => Some(output),
            Self::PublicKey { .. } | Self::Ed25519Sign { .. } => None,
        }
    }

    /// Vaults the procedure reads from.
    pub fn input_vaults(&self) -> impl Iterator<Item = &VaultPath> {
        self.inputs().into_iter().map(Location::vault_path)
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Slip10Generate { .. } => "SLIP10Generate",
            Self::Slip10Derive { .. } => "SLIP10Derive",
            Self::Bip39Generate { .. } => "BIP39Generate",
            Self::Bip39Recover { .. } => "BIP39Recover",
            Self::GenerateKey { .. } => "GenerateKey",
            Self::PublicKey { .. } => "PublicKey",
            Self::Ed25519Sign { .. } => "Ed25519Sign",
        }
    }
}

/// Non-secret result of a procedure.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ProcedureOutput {
    /// The procedure only wrote a record.
    None,
    /// Phrase of a generated mnemonic, for backup. Wiped on drop.
    Mnemonic(Zeroizing<String>),
    PublicKey(Vec<u8>),
    Signature(Vec<u8>),
}

impl ProcedureOutput {
    pub fn into_public_key(self) -> Option<Vec<u8>> {
        match self {
            Self::PublicKey(key) => Some(key),
            _ => None,
        }
    }

    pub fn into_signature(self) -> Option<Vec<u8>> {
        match self {
            Self::Signature(sig) => Some(sig),
            _ => None,
        }
    }

    pub fn into_mnemonic(self) -> Option<Zeroizing<String>> {
        match self {
            Self::Mnemonic(phrase) => Some(phrase),
            _ => None,
        }
    }
}

impl fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Mnemonic(_) => write!(f, "Mnemonic([REDACTED])"),
            Self::PublicKey(key) => write!(f, "PublicKey({})", hex::encode(key)),
            Self::Signature(sig) => write!(f, "Signature({})", hex::encode(sig)),
        }
    }
}

/// Run `procedures` in order against `client`.
///
/// Either every procedure succeeds and all writes land, or `client` is left
/// exactly as it was.
pub(crate) fn execute_all(
    client: &mut ClientState,
    procedures: &[Procedure],
) -> Result<Vec<ProcedureOutput>> {
    if let [procedure] = procedures {
        return execute(client, procedure).map(|out| vec![out]);
    }

    let mut staged = client.clone();
    let outputs = procedures
        .iter()
        .map(|p| execute(&mut staged, p))
        .collect::<Result<Vec<_>>>()?;
    *client = staged;
    Ok(outputs)
}

/// Run a single procedure. All reads and checks happen before the write.
pub(crate) fn execute(client: &mut ClientState, procedure: &Procedure) -> Result<ProcedureOutput> {
    debug!(procedure = procedure.name(), "Executing procedure");

    if let Some(output) = procedure.output() {
        if !output.overwrite && client.contains_record(&output.location) {
            return Err(Error::InvalidParameter(format!(
                "Output location already holds a record: {}",
                output.location
            )));
        }
    }

    match procedure {
        Procedure::Slip10Generate { output, size_bytes } => {
            let size = size_bytes.unwrap_or(DEFAULT_SEED_SIZE);
            if !(MIN_SEED_LENGTH..=MAX_SEED_SIZE).contains(&size) {
                return Err(Error::InvalidParameter(format!(
                    "Seed size must be between {} and {} bytes, got {}",
                    MIN_SEED_LENGTH, MAX_SEED_SIZE, size
                )));
            }
            let seed = random_bytes(size);
            store(client, output, &seed, RecordKind::Seed)?;
            Ok(ProcedureOutput::None)
        }
        Procedure::Slip10Derive {
            chain,
            input,
            output,
        } => {
            let parent = match input {
                Slip10DeriveInput::Seed(location) => {
                    let secret = client.read_secret(location)?;
                    ExtendedKey::from_seed(seed_bytes(&secret, location)?)?
                }
                Slip10DeriveInput::Key(location) => {
                    let secret = client.read_secret(location)?;
                    if secret.kind != RecordKind::ExtendedKey {
                        return Err(wrong_kind(location, secret.kind, "an extended key"));
                    }
                    ExtendedKey::from_bytes(&secret.bytes)?
                }
            };
            let child = parent.derive(chain)?;
            store(client, output, &child.to_bytes(), RecordKind::ExtendedKey)?;
            Ok(ProcedureOutput::None)
        }
        Procedure::Bip39Generate { passphrase, output } => {
            let phrase = generate_mnemonic()?;
            let seed = mnemonic_to_seed(&phrase, passphrase.as_deref())?;
            store(client, output, &seed[..], RecordKind::Seed)?;
            Ok(ProcedureOutput::Mnemonic(phrase))
        }
        Procedure::Bip39Recover {
            mnemonic,
            passphrase,
            output,
        } => {
            let seed = mnemonic_to_seed(mnemonic, passphrase.as_deref())?;
            store(client, output, &seed[..], RecordKind::Seed)?;
            Ok(ProcedureOutput::None)
        }
        Procedure::GenerateKey {
            ty: KeyType::Ed25519,
            output,
        } => {
            let key = ed25519::generate_secret_key();
            store(client, output, &key, RecordKind::Ed25519Key)?;
            Ok(ProcedureOutput::None)
        }
        Procedure::PublicKey {
            ty: KeyType::Ed25519,
            private_key,
        } => {
            let secret = client.read_secret(private_key)?;
            let key = ed25519_secret(&secret, private_key)?;
            Ok(ProcedureOutput::PublicKey(ed25519::public_key(&key)?.to_vec()))
        }
        Procedure::Ed25519Sign { private_key, msg } => {
            let secret = client.read_secret(private_key)?;
            let key = ed25519_secret(&secret, private_key)?;
            Ok(ProcedureOutput::Signature(ed25519::sign(&key, msg)?.to_vec()))
        }
    }
}

fn store(
    client: &mut ClientState,
    output: &OutputLocation,
    secret: &[u8],
    kind: RecordKind,
) -> Result<()> {
    client.write(&output.location, secret, output.hint, kind)?;
    Ok(())
}

fn seed_bytes<'a>(secret: &'a Secret, location: &Location) -> Result<&'a [u8]> {
    match secret.kind {
        RecordKind::Seed => Ok(secret.bytes.as_slice()),
        RecordKind::Opaque if secret.bytes.len() >= MIN_SEED_LENGTH => {
            Ok(secret.bytes.as_slice())
        }
        kind => Err(wrong_kind(location, kind, "a seed")),
    }
}

/// Extract a raw ed25519 private key from a record.
fn ed25519_secret(secret: &Secret, location: &Location) -> Result<Zeroizing<Vec<u8>>> {
    let bytes: &[u8] = match secret.kind {
        RecordKind::ExtendedKey if secret.bytes.len() == EXTENDED_KEY_LENGTH => {
            &secret.bytes[..ed25519::SECRET_KEY_LENGTH]
        }
        RecordKind::Ed25519Key => secret.bytes.as_slice(),
        RecordKind::Opaque if secret.bytes.len() == ed25519::SECRET_KEY_LENGTH => {
            secret.bytes.as_slice()
        }
        kind => return Err(wrong_kind(location, kind, "an ed25519 private key")),
    };
    Ok(Zeroizing::new(bytes.to_vec()))
}

fn wrong_kind(location: &Location, kind: RecordKind, expected: &str) -> Error {
    Error::WrongKeyType(format!(
        "Record at {} holds {:?}, expected {}",
        location, kind, expected
    ))
}
