// demos/webserver.rs
//
// Serve a document root over HTTP/1.1:
//   cargo run --example webserver -- [config.toml]
use nocturne::{MemoryStore, NocturneResult, Server, ServerConfig};
use std::sync::Arc;

fn main() -> NocturneResult<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            ServerConfig::from_toml_str(&raw)?
        }
        None => ServerConfig {
            install_ctrl_c: true,
            ..Default::default()
        },
    };

    let store = Arc::new(MemoryStore::new().with_user("demo", "demo"));
    let mut server = Server::new(cfg)?.with_store(store);
    server.run()
}
