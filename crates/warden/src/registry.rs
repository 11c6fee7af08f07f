//! Module registry
//!
//! A module is a unit of isolated work identified by a small dense id. The
//! registry maps each id to the identity the worker must assume and to the
//! behavior it runs once that identity is in place. It is built once at
//! start-up and never mutated afterwards.

use crate::error::{ProtocolError, Result, WardenError};
use crate::ipc::Channel;
use serde::Deserialize;

/// Identifier of a module. Dense, so it doubles as a registry index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ModuleId {
    Imei = 0,
    Phone = 1,
    Mac = 2,
    Logger = 3,
    Sender = 4,
    DbCleaner = 5,
}

impl ModuleId {
    /// Number of module ids.
    pub const COUNT: usize = 6;

    /// All ids in index order.
    pub const ALL: [ModuleId; Self::COUNT] = [
        ModuleId::Imei,
        ModuleId::Phone,
        ModuleId::Mac,
        ModuleId::Logger,
        ModuleId::Sender,
        ModuleId::DbCleaner,
    ];

    /// Display name used in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ModuleId::Imei => "IMEI",
            ModuleId::Phone => "Phone",
            ModuleId::Mac => "MAC",
            ModuleId::Logger => "Logger",
            ModuleId::Sender => "Sender",
            ModuleId::DbCleaner => "DBCleaner",
        }
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Built-in identity for this module, used unless configuration overrides it.
    #[must_use]
    pub fn default_identity(self) -> Identity {
        let (id, label) = match self {
            ModuleId::Imei => (1001, "u:r:isolated_imei:s0"),
            ModuleId::Phone => (1002, "u:r:isolated_app:s0"),
            ModuleId::Mac => (1003, "u:r:isolated_app:s0"),
            ModuleId::Logger | ModuleId::Sender => (1004, "u:r:isolated_net:s0"),
            ModuleId::DbCleaner => (1001, "u:r:isolated_app:s0"),
        };
        Identity {
            uid: id,
            gid: id,
            label: Some(label.to_string()),
        }
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The process identity a worker runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Target user id
    pub uid: u32,
    /// Target group id
    pub gid: u32,
    /// Mandatory-access-control (SELinux) context; `None` skips labelling
    pub label: Option<String>,
}

/// The behavior a worker runs after privilege drop.
///
/// Implementations must send exactly one message on `channel` before
/// returning. Anything else is only visible to the supervisor as "whatever
/// arrived first" or a timeout. A send error is returned so the worker can
/// exit with a status that tells the supervisor the reply was lost.
pub trait ModuleEntry {
    fn run(&self, channel: &Channel, arg: Option<&str>) -> std::result::Result<(), ProtocolError>;
}

/// Everything the supervisor needs to launch one module.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor<E> {
    pub id: ModuleId,
    pub identity: Identity,
    pub entry: E,
}

impl<E> ModuleDescriptor<E> {
    #[must_use]
    pub fn new(id: ModuleId, identity: Identity, entry: E) -> Self {
        ModuleDescriptor {
            id,
            identity,
            entry,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.id.name()
    }
}

/// Immutable id → descriptor table.
#[derive(Debug)]
pub struct Registry<E> {
    slots: Vec<Option<ModuleDescriptor<E>>>,
}

impl<E> Registry<E> {
    /// Build a registry. Registering the same id twice is rejected.
    pub fn new(descriptors: impl IntoIterator<Item = ModuleDescriptor<E>>) -> Result<Self> {
        let mut slots: Vec<Option<ModuleDescriptor<E>>> =
            std::iter::repeat_with(|| None).take(ModuleId::COUNT).collect();

        for desc in descriptors {
            let slot = &mut slots[desc.id.index()];
            if slot.is_some() {
                return Err(WardenError::ConfigInvalid(format!(
                    "module {} registered twice",
                    desc.id
                )));
            }
            *slot = Some(desc);
        }

        Ok(Registry { slots })
    }

    /// Look up a module. `None` means the caller asked for an id that was
    /// never registered.
    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&ModuleDescriptor<E>> {
        self.slots[id.index()].as_ref()
    }

    /// Registered descriptors in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor<E>> {
        self.slots.iter().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
