//! Access control for remote peers.
//!
//! Permissions resolve in two levels: peer, then client. Within a
//! [`ClientAccess`], a vault-path exception replaces the vault default
//! entirely. Anything not granted is denied.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use bastion_common::{ClientId, PeerId, VaultPath};

/// Access rights on one vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultAccess {
    /// Run procedures reading the vault and check its records exist.
    #[serde(rename = "use", default)]
    pub use_: bool,
    /// Write, revoke and delete records.
    #[serde(default)]
    pub write: bool,
    /// See the vault in the remote hierarchy.
    #[serde(default)]
    pub clone: bool,
}

impl VaultAccess {
    pub const fn new(use_: bool, write: bool, clone: bool) -> Self {
        Self { use_, write, clone }
    }

    pub const fn none() -> Self {
        Self::new(false, false, false)
    }

    pub const fn all() -> Self {
        Self::new(true, true, true)
    }
}

/// What a peer may do inside one client.
///
/// In JSON each axis has its own default and exception map
/// (`useVaultDefault`, `useVaultExceptions`, `writeVaultDefault`, ...). A
/// vault named under any axis becomes an exception, denied on the axes it
/// is not named under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AccessFlags", into = "AccessFlags")]
pub struct ClientAccess {
    pub default_vault_access: VaultAccess,
    pub vault_exceptions: HashMap<VaultPath, VaultAccess>,
    pub read_store: bool,
    pub write_store: bool,
}

/// Wire layout of [`ClientAccess`].
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AccessFlags {
    use_vault_default: bool,
    use_vault_exceptions: HashMap<VaultPath, bool>,
    write_vault_default: bool,
    write_vault_exceptions: HashMap<VaultPath, bool>,
    clone_vault_default: bool,
    clone_vault_exceptions: HashMap<VaultPath, bool>,
    read_store: bool,
    write_store: bool,
}

impl From<AccessFlags> for ClientAccess {
    fn from(flags: AccessFlags) -> Self {
        let mut vault_exceptions: HashMap<VaultPath, VaultAccess> = HashMap::new();
        for (path, flag) in flags.use_vault_exceptions {
            vault_exceptions.entry(path).or_default().use_ = flag;
        }
        for (path, flag) in flags.write_vault_exceptions {
            vault_exceptions.entry(path).or_default().write = flag;
        }
        for (path, flag) in flags.clone_vault_exceptions {
            vault_exceptions.entry(path).or_default().clone = flag;
        }

        Self {
            default_vault_access: VaultAccess::new(
                flags.use_vault_default,
                flags.write_vault_default,
                flags.clone_vault_default,
            ),
            vault_exceptions,
            read_store: flags.read_store,
            write_store: flags.write_store,
        }
    }
}

impl From<ClientAccess> for AccessFlags {
    fn from(access: ClientAccess) -> Self {
        let mut flags = Self {
            use_vault_default: access.default_vault_access.use_,
            write_vault_default: access.default_vault_access.write,
            clone_vault_default: access.default_vault_access.clone,
            read_store: access.read_store,
            write_store: access.write_store,
            ..Default::default()
        };
        for (path, rights) in access.vault_exceptions {
            flags.use_vault_exceptions.insert(path.clone(), rights.use_);
            flags.write_vault_exceptions.insert(path.clone(), rights.write);
            flags.clone_vault_exceptions.insert(path, rights.clone);
        }
        flags
    }
}

impl ClientAccess {
    /// Deny everything.
    pub fn allow_none() -> Self {
        Self::default()
    }

    /// Allow everything on every vault and the store.
    pub fn allow_all() -> Self {
        Self {
            default_vault_access: VaultAccess::all(),
            vault_exceptions: HashMap::new(),
            read_store: true,
            write_store: true,
        }
    }

    pub fn with_default_vault_access(mut self, use_: bool, write: bool, clone: bool) -> Self {
        self.default_vault_access = VaultAccess::new(use_, write, clone);
        self
    }

    /// Override the default for one vault.
    pub fn with_vault_access(
        mut self,
        vault_path: impl Into<VaultPath>,
        use_: bool,
        write: bool,
        clone: bool,
    ) -> Self {
        self.vault_exceptions
            .insert(vault_path.into(), VaultAccess::new(use_, write, clone));
        self
    }

    pub fn with_store_access(mut self, read: bool, write: bool) -> Self {
        self.read_store = read;
        self.write_store = write;
        self
    }

    /// Effective rights on `vault_path`.
    pub fn vault_access(&self, vault_path: &VaultPath) -> VaultAccess {
        self.vault_exceptions
            .get(vault_path)
            .copied()
            .unwrap_or(self.default_vault_access)
    }

    pub fn can_use(&self, vault_path: &VaultPath) -> bool {
        self.vault_access(vault_path).use_
    }

    pub fn can_write(&self, vault_path: &VaultPath) -> bool {
        self.vault_access(vault_path).write
    }

    pub fn can_clone(&self, vault_path: &VaultPath) -> bool {
        self.vault_access(vault_path).clone
    }
}

/// Per-peer permissions: a default plus per-client overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub default: ClientAccess,
    pub exceptions: HashMap<ClientId, ClientAccess>,
}

impl Permissions {
    pub fn new(default: ClientAccess) -> Self {
        Self {
            default,
            exceptions: HashMap::new(),
        }
    }

    pub fn allow_none() -> Self {
        Self::new(ClientAccess::allow_none())
    }

    pub fn allow_all() -> Self {
        Self::new(ClientAccess::allow_all())
    }

    pub fn with_client_permissions(
        mut self,
        client: impl Into<ClientId>,
        access: ClientAccess,
    ) -> Self {
        self.exceptions.insert(client.into(), access);
        self
    }

    /// Access for `client`: its override, else the default.
    pub fn client_access(&self, client: &ClientId) -> &ClientAccess {
        self.exceptions.get(client).unwrap_or(&self.default)
    }
}

/// Limits on transport connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionLimits {
    pub max_pending_incoming: Option<u32>,
    pub max_pending_outgoing: Option<u32>,
    pub max_established_incoming: Option<u32>,
    pub max_established_outgoing: Option<u32>,
    pub max_established_per_peer: Option<u32>,
    pub max_established_total: Option<u32>,
}

/// Network settings and the peer firewall.
///
/// The transport itself lives outside this crate; it reads the timeouts,
/// limits and discovery toggles from here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub request_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub connections_limit: Option<ConnectionLimits>,
    pub enable_mdns: bool,
    pub enable_relay: bool,
    pub peer_permissions: HashMap<PeerId, Permissions>,
    pub permissions_default: Permissions,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(30)),
            connection_timeout: Some(Duration::from_secs(30)),
            connections_limit: Some(ConnectionLimits {
                max_established_incoming: Some(10),
                max_pending_incoming: Some(5),
                max_established_per_peer: Some(5),
                ..Default::default()
            }),
            enable_mdns: false,
            enable_relay: false,
            peer_permissions: HashMap::new(),
            permissions_default: Permissions::allow_none(),
        }
    }
}

impl NetworkConfig {
    pub fn new(permissions_default: Permissions) -> Self {
        Self {
            permissions_default,
            ..Default::default()
        }
    }

    pub fn with_peer_permissions(mut self, peer: PeerId, permissions: Permissions) -> Self {
        self.peer_permissions.insert(peer, permissions);
        self
    }

    /// Grant every peer full access, dropping per-peer rules.
    pub fn allow_all_requests(&mut self) {
        self.peer_permissions.clear();
        self.permissions_default = Permissions::allow_all();
    }

    /// Deny every peer, dropping per-peer rules.
    pub fn reject_all_requests(&mut self) {
        self.peer_permissions.clear();
        self.permissions_default = Permissions::allow_none();
    }

    pub fn set_peer_permissions(&mut self, peer: PeerId, permissions: Permissions) {
        self.peer_permissions.insert(peer, permissions);
    }

    /// Remove the rule for `peer`; it falls back to the default.
    pub fn remove_peer_permissions(&mut self, peer: &PeerId) -> Option<Permissions> {
        self.peer_permissions.remove(peer)
    }

    pub fn permissions_for(&self, peer: &PeerId) -> &Permissions {
        self.peer_permissions
            .get(peer)
            .unwrap_or(&self.permissions_default)
    }

    /// Resolved access of `peer` on `client`.
    pub fn client_access(&self, peer: &PeerId, client: &ClientId) -> &ClientAccess {
        self.permissions_for(peer).client_access(client)
    }
}
