// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Client bookkeeping: who asked for which CPUs.
//!
//! Clients are identified by [`ClientId`]. The built-in requesters have
//! dedicated variants, everything registered at runtime goes through
//! [`ClientId::Named`]. Clients are kept in registration order so listings
//! are stable.

use crate::Cpumask;
use log::debug;
use serde::Serialize;
use std::fmt;

/// Longest accepted client name in bytes.
pub const CLIENT_NAME_MAX: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientId {
    /// Platform policy, registered at engine construction.
    System,
    /// Administrative override, registered at engine construction.
    Sysfs,
    /// Maximum online CPU count coming from PM QoS.
    Qos,
    Named(String),
}

impl ClientId {
    /// Parse a client name. Built-in spellings map to their dedicated
    /// variants.
    pub fn parse(name: &str) -> Result<ClientId, RegistryError> {
        if name.is_empty()
            || name.len() > CLIENT_NAME_MAX
            || !name.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        Ok(match name {
            "SYSTEM" => ClientId::System,
            "SYSFS" => ClientId::Sysfs,
            "HP_QOS" => ClientId::Qos,
            _ => ClientId::Named(name.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            ClientId::System => "SYSTEM",
            ClientId::Sysfs => "SYSFS",
            ClientId::Qos => "HP_QOS",
            ClientId::Named(name) => name,
        }
    }

    /// Is this one of the clients the engine itself knows about?
    pub fn is_builtin(&self) -> bool {
        !matches!(self, ClientId::Named(_))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Internal,
    Registered,
}

#[derive(Debug, Clone)]
pub struct Client {
    id: ClientId,
    kind: ClientKind,
    requested: Cpumask,
}

impl Client {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// The most recent mask this client asked for.
    pub fn requested(&self) -> &Cpumask {
        &self.requested
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    AlreadyRegistered(ClientId),
    UnknownClient(ClientId),
    InvalidName(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyRegistered(id) => write!(f, "client {id} already registered"),
            RegistryError::UnknownClient(id) => write!(f, "no client named {id}"),
            RegistryError::InvalidName(name) => write!(
                f,
                "invalid client name {name:?} (1-{CLIENT_NAME_MAX} printable characters)"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug, Default)]
pub struct Registry {
    clients: Vec<Client>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: ClientId,
        mask: Cpumask,
        kind: ClientKind,
    ) -> Result<(), RegistryError> {
        if self.find(&id).is_some() {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        debug!("registering client {} ({:?}) mask={}", id, kind, mask);
        self.clients.push(Client {
            id,
            kind,
            requested: mask,
        });
        Ok(())
    }

    pub fn request(&mut self, id: &ClientId, mask: Cpumask) -> Result<(), RegistryError> {
        match self.clients.iter_mut().find(|c| c.id == *id) {
            Some(client) => {
                debug!("client {} requests mask={}", id, mask);
                client.requested = mask;
                Ok(())
            }
            None => Err(RegistryError::UnknownClient(id.clone())),
        }
    }

    /// Clients are never removed once registered; this only acknowledges the
    /// call.
    pub fn unregister(&mut self, id: &ClientId) -> Result<(), RegistryError> {
        debug!("ignoring unregister of client {}", id);
        Ok(())
    }

    pub fn find(&self, id: &ClientId) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }

    pub fn masks(&self) -> impl Iterator<Item = &Cpumask> {
        self.clients.iter().map(|c| &c.requested)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
