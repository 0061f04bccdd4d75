pub mod broker;
pub mod catalog;
pub mod config;
pub mod correlator;
pub mod events;
pub mod gateway;
pub mod listener;
pub mod logger;
pub mod registry;
pub mod router;
pub mod session;
pub mod tools;
pub mod watcher;

pub use broker::Broker;
pub use catalog::{AssetCatalog, DiskCatalog};
pub use config::BrokerConfig;
pub use events::BrokerEvent;
pub use gateway::{ExecutionGateway, GatewayError, Target};
