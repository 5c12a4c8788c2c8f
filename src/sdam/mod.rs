pub(crate) mod description;
mod monitor;
pub mod public;
mod server;
#[cfg(feature = "dns-resolver")]
mod srv_polling;
#[cfg(test)]
mod test;
mod topology;

pub use self::public::{ServerInfo, ServerType, TopologyType};

pub(crate) use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::{choose_n, server_selection::SelectedServer, TopologyDescription},
    },
    monitor::{Monitor, DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    server::Server,
    topology::{Topology, TopologyUpdater, TopologyWatcher},
};
