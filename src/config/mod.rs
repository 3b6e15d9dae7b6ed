pub mod schema;

pub use schema::{
    AgentConfig, BusSettings, Config, ProxyRole, ProxySettings, TopicGroupConfig,
};
