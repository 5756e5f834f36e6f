//! Requests from remote peers.
//!
//! The transport authenticates the peer and hands the request over; this
//! module checks the peer's permissions and runs the request against the
//! snapshot. Peers never learn whether a target is missing or forbidden:
//! existence checks answer `false` and everything else fails with
//! `PermissionDenied`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::access::ClientAccess;
use crate::procedures::{self, Procedure, ProcedureOutput};
use crate::record::{ClientState, RecordId, RecordKind, SnapshotState};
use crate::snapshot::Snapshot;
use bastion_common::{
    ClientId, Error, Location, PeerId, RecordHint, Result, StoreKey, VaultPath,
};

/// Request addressed to one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientRequest {
    CheckVault {
        #[serde(rename = "vaultPath")]
        vault_path: VaultPath,
    },
    CheckRecord {
        location: Location,
    },
    WriteToVault {
        location: Location,
        payload: Vec<u8>,
    },
    /// Revoke without purging.
    RevokeData {
        location: Location,
    },
    /// Revoke and purge.
    DeleteData {
        location: Location,
    },
    ReadFromStore {
        key: StoreKey,
    },
    WriteToStore {
        key: StoreKey,
        payload: Vec<u8>,
        lifetime: Option<Duration>,
    },
    DeleteFromStore {
        key: StoreKey,
    },
    Procedures {
        procedures: Vec<Procedure>,
    },
}

/// Request addressed to the snapshot as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SnapshotRequest {
    /// Vaults and record hints the peer may clone.
    GetRemoteHierarchy,
}

/// Any request a peer can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RemoteRequest {
    ClientRequest {
        #[serde(rename = "clientPath")]
        client_path: ClientId,
        request: ClientRequest,
    },
    SnapshotRequest {
        request: SnapshotRequest,
    },
}

/// A live record as listed in the remote hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub id: RecordId,
    pub hint: RecordHint,
}

/// Clients, vaults and records visible to a peer.
pub type RemoteHierarchy = BTreeMap<ClientId, BTreeMap<VaultPath, Vec<RecordEntry>>>;

/// Answer to a [`RemoteRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RemoteResponse {
    /// Existence check result.
    Exists(bool),
    /// The request took effect.
    Done,
    /// Store value, if present.
    Data(Option<Vec<u8>>),
    Procedures(Vec<ProcedureOutput>),
    Hierarchy(RemoteHierarchy),
}

impl Snapshot {
    /// Handle a request from `peer`.
    ///
    /// # Errors
    /// - `PermissionDenied` if the peer lacks a permission or the target
    ///   does not exist
    /// - `Locked` while the snapshot is locked
    pub async fn serve_remote(
        &self,
        peer: &PeerId,
        request: RemoteRequest,
    ) -> Result<RemoteResponse> {
        let (client_id, request) = match request {
            RemoteRequest::SnapshotRequest {
                request: SnapshotRequest::GetRemoteHierarchy,
            } => {
                return self
                    .read(|view| {
                        Ok(RemoteResponse::Hierarchy(hierarchy(view.state, |client| {
                            view.network.client_access(peer, client)
                        })))
                    })
                    .await;
            }
            RemoteRequest::ClientRequest {
                client_path,
                request,
            } => (client_path, request),
        };

        debug!(%peer, client = %client_id, "Serving remote request");
        let result = match request {
            ClientRequest::CheckVault { vault_path } => {
                self.read(|view| {
                    let access = view.network.client_access(peer, &client_id);
                    Ok(access.can_use(&vault_path)
                        && view
                            .state
                            .client(&client_id)
                            .is_ok_and(|client| client.has_vault(&vault_path)))
                })
                .await
                .map(RemoteResponse::Exists)
            }
            ClientRequest::CheckRecord { location } => {
                self.read(|view| {
                    let access = view.network.client_access(peer, &client_id);
                    Ok(access.can_use(location.vault_path())
                        && view
                            .state
                            .client(&client_id)
                            .is_ok_and(|client| client.contains_record(&location)))
                })
                .await
                .map(RemoteResponse::Exists)
            }
            ClientRequest::ReadFromStore { key } => {
                self.read(|view| {
                    let client = view.state.client(&client_id)?;
                    require(view.network.client_access(peer, &client_id).read_store)?;
                    Ok(client.store_get(&key, Utc::now()))
                })
                .await
                .map(RemoteResponse::Data)
            }
            ClientRequest::WriteToVault { location, payload } => {
                self.mutate(peer, &client_id, |client, access| {
                    require(access.can_write(location.vault_path()))?;
                    client.write(
                        &location,
                        &payload,
                        RecordHint::default(),
                        RecordKind::Opaque,
                    )?;
                    Ok(RemoteResponse::Done)
                })
                .await
            }
            ClientRequest::RevokeData { location } => {
                self.mutate(peer, &client_id, |client, access| {
                    require(access.can_write(location.vault_path()))?;
                    client.remove(&location, false)?;
                    Ok(RemoteResponse::Done)
                })
                .await
            }
            ClientRequest::DeleteData { location } => {
                self.mutate(peer, &client_id, |client, access| {
                    require(access.can_write(location.vault_path()))?;
                    client.remove(&location, true)?;
                    Ok(RemoteResponse::Done)
                })
                .await
            }
            ClientRequest::WriteToStore {
                key,
                payload,
                lifetime,
            } => {
                self.mutate(peer, &client_id, |client, access| {
                    require(access.write_store)?;
                    client.store_insert(key, payload, lifetime, Utc::now())?;
                    Ok(RemoteResponse::Done)
                })
                .await
            }
            ClientRequest::DeleteFromStore { key } => {
                self.mutate(peer, &client_id, |client, access| {
                    require(access.write_store)?;
                    Ok(RemoteResponse::Data(client.store_remove(&key, Utc::now())))
                })
                .await
            }
            ClientRequest::Procedures { procedures } => {
                self.mutate(peer, &client_id, |client, access| {
                    authorize_procedures(access, &procedures)?;
                    procedures::execute_all(client, &procedures).map(RemoteResponse::Procedures)
                })
                .await
            }
        };

        result.or_else(|e| conceal(peer, e))
    }

    /// Run `f` under the write lock on `client_id`, with the peer's access
    /// to that client.
    async fn mutate<T>(
        &self,
        peer: &PeerId,
        client_id: &ClientId,
        f: impl FnOnce(&mut ClientState, &ClientAccess) -> Result<T>,
    ) -> Result<T> {
        self.write(|view| {
            let access = view.network.client_access(peer, client_id);
            let client = view.state.client_mut(client_id)?;
            f(client, access)
        })
        .await
    }
}

/// Every procedure needs `use` on its inputs and `write` on its output.
fn authorize_procedures(access: &ClientAccess, procedures: &[Procedure]) -> Result<()> {
    for procedure in procedures {
        require(procedure.input_vaults().all(|v| access.can_use(v)))?;
        if let Some(output) = procedure.output() {
            require(access.can_write(output.location.vault_path()))?;
        }
    }
    Ok(())
}

/// Vaults `access_for` grants `clone` on, with their live records.
fn hierarchy<'a>(
    state: &SnapshotState,
    access_for: impl Fn(&ClientId) -> &'a ClientAccess,
) -> RemoteHierarchy {
    let mut visible = RemoteHierarchy::new();
    for (client_id, client) in &state.clients {
        let access = access_for(client_id);
        let vaults: BTreeMap<VaultPath, Vec<RecordEntry>> = client
            .vault_paths()
            .filter(|path| access.can_clone(path))
            .filter_map(|path| {
                let records = client.list_hints(path).ok()?;
                let entries = records
                    .into_iter()
                    .map(|(id, hint)| RecordEntry { id, hint })
                    .collect();
                Some((path.clone(), entries))
            })
            .collect();
        if !vaults.is_empty() {
            visible.insert(client_id.clone(), vaults);
        }
    }
    visible
}

fn require(allowed: bool) -> Result<()> {
    if allowed {
        Ok(())
    } else {
        Err(Error::PermissionDenied("Request not permitted".to_string()))
    }
}

/// Fold "missing" into "denied" so peers cannot map the snapshot.
fn conceal(peer: &PeerId, error: Error) -> Result<RemoteResponse> {
    match error {
        Error::NotFound(_) | Error::PermissionDenied(_) => {
            warn!(%peer, "Remote request denied");
            Err(Error::PermissionDenied("Request not permitted".to_string()))
        }
        other => Err(other),
    }
}
