use std::net::Ipv4Addr;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[clap(name = "mundi-server", about = "Mundi agentic GIS chat runtime")]
pub struct ServerConfig {
    /// Host interface to bind to
    #[clap(short, long, default_value = "0.0.0.0")]
    pub interface: Ipv4Addr,

    /// Port to bind to
    #[clap(short, long, default_value = "8000")]
    pub port: u16,

    /// Directory for the layer file cache
    #[clap(long, default_value = "/cache")]
    pub cache_dir: String,
}

impl ServerConfig {
    pub fn bind_address(&self) -> (Ipv4Addr, u16) {
        (self.interface, self.port)
    }
}
