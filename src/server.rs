//! TCP accept loop.

use std::net::{SocketAddr, TcpListener};

use log::{info, warn};

use crate::broker::Broker;
use crate::error::Result;

/// Accepts connections and hands them to the broker.
pub struct Server {
    listener: TcpListener,
    broker: Broker,
}

impl Server {
    pub fn bind(addr: SocketAddr, broker: Broker) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("mqrelay listening on {}", listener.local_addr()?);
        Ok(Self { listener, broker })
    }

    /// The bound address, useful when binding to port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails.
    pub fn run(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.broker.handle(stream),
                // a single failed accept does not take the server down
                Err(e) => warn!("accept failed: {}", e),
            }
        }
        Ok(())
    }
}
