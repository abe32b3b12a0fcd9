//! Server configuration

use cuepoint_core::Config as EngineConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address the JSON-line server listens on
    pub bind_addr: String,
    /// Worker threads for batch reads
    pub max_workers: usize,
    /// Engine settings handed to every registry and the store
    pub engine: EngineConfig,
}
