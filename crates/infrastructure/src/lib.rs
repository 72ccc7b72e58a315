pub mod broker_factory;
pub mod in_memory_broker;
pub mod redis_broker;

pub use broker_factory::BrokerFactory;
pub use in_memory_broker::{InMemoryBroker, InMemoryBrokerConfig};
pub use redis_broker::{RedisBroker, RedisBrokerConfig};
