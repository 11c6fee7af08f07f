//! Concrete module bodies
//!
//! [`ModuleBody`] is the closed set of behaviors the daemon can run. Each
//! variant carries its own slice of the configuration, captured before fork,
//! and replies exactly once through [`reply`].

pub mod database;
pub mod netif;
pub mod network;
pub mod prefs;
pub mod property;

use crate::config::{
    DatabaseConfig, ImeiConfig, MacConfig, NetworkConfig, PhoneConfig, WardenConfig,
};
use crate::error::{ProtocolError, Result, WorkerError};
use crate::ipc::{Channel, Message};
use crate::registry::{ModuleDescriptor, ModuleEntry, ModuleId, Registry};
use tracing::{error, warn};

/// Entry behavior of one module.
#[derive(Debug, Clone)]
pub enum ModuleBody {
    Imei(ImeiConfig),
    Phone(PhoneConfig),
    Mac(MacConfig),
    Logger(NetworkConfig),
    Sender(NetworkConfig),
    DbCleaner(DatabaseConfig),
}

impl ModuleBody {
    /// The body for `module`, configured from `config`.
    #[must_use]
    pub fn for_module(module: ModuleId, config: &WardenConfig) -> Self {
        let m = &config.modules;
        match module {
            ModuleId::Imei => ModuleBody::Imei(m.imei.clone()),
            ModuleId::Phone => ModuleBody::Phone(m.phone.clone()),
            ModuleId::Mac => ModuleBody::Mac(m.mac.clone()),
            ModuleId::Logger => ModuleBody::Logger(m.network.clone()),
            ModuleId::Sender => ModuleBody::Sender(m.network.clone()),
            ModuleId::DbCleaner => ModuleBody::DbCleaner(m.database.clone()),
        }
    }

    #[must_use]
    pub fn module(&self) -> ModuleId {
        match self {
            ModuleBody::Imei(_) => ModuleId::Imei,
            ModuleBody::Phone(_) => ModuleId::Phone,
            ModuleBody::Mac(_) => ModuleId::Mac,
            ModuleBody::Logger(_) => ModuleId::Logger,
            ModuleBody::Sender(_) => ModuleId::Sender,
            ModuleBody::DbCleaner(_) => ModuleId::DbCleaner,
        }
    }

    /// Do the work. `Ok(None)` is a success without payload.
    fn execute(&self, arg: Option<&str>) -> std::result::Result<Option<Vec<u8>>, WorkerError> {
        match self {
            ModuleBody::Imei(c) => property::lookup(&c.property_files, &c.key).map(text),
            ModuleBody::Phone(c) => prefs::read_value(&c.prefs_path, &c.key).map(text),
            ModuleBody::Mac(c) => netif::hardware_address(&c.sysfs_net, &c.interface).map(text),
            ModuleBody::Logger(c) => {
                let line = arg.ok_or(WorkerError::InvalidArgument)?;
                // Logging is best effort: an unreachable endpoint is not a
                // stage failure.
                if let Err(e) = network::send_log(c, line) {
                    warn!("[{}] Log delivery failed: {}", ModuleId::Logger, e);
                }
                Ok(Some(b"Success".to_vec()))
            }
            ModuleBody::Sender(c) => {
                let summary = arg.ok_or(WorkerError::InvalidArgument)?;
                network::upload(c, summary).map(Some)
            }
            ModuleBody::DbCleaner(c) => database::clean(c).map(|_| None),
        }
    }
}

fn text(value: String) -> Option<Vec<u8>> {
    Some(value.into_bytes())
}

impl ModuleEntry for ModuleBody {
    fn run(&self, channel: &Channel, arg: Option<&str>) -> std::result::Result<(), ProtocolError> {
        reply(channel, self.module(), self.execute(arg))
    }
}

/// Send the single reply for `module`.
pub fn reply(
    channel: &Channel,
    module: ModuleId,
    result: std::result::Result<Option<Vec<u8>>, WorkerError>,
) -> std::result::Result<(), ProtocolError> {
    let mut msg = Message::new();
    match result {
        Ok(data) => {
            msg.set_data(data.as_deref());
        }
        Err(e) => {
            msg.set_error(e.code(), Some(&e.to_string()));
        }
    }
    channel.send(&msg).map_err(|e| {
        error!("[{}] Failed to send reply to supervisor: {}", module, e);
        e
    })
}

/// Registry of every module with its configured identity and body.
pub fn standard_registry(config: &WardenConfig) -> Result<Registry<ModuleBody>> {
    Registry::new(ModuleId::ALL.iter().map(|&id| {
        ModuleDescriptor::new(id, config.identity_for(id), ModuleBody::for_module(id, config))
    }))
}
