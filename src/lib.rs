pub mod decomposition;
pub mod engine;
pub mod engine_config;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod phase;
pub mod pool;
pub mod resolver;
pub mod signals;
pub mod store;
pub mod workspace;
