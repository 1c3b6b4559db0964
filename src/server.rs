//! TCP accept loop: one task per device connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::Result;
use crate::handler::{Services, Session};
use crate::pipe::BrokerStore;
use crate::protocols::SessionProtocol;

pub async fn run_server<P>(protocol: Arc<P>, services: Arc<Services>) -> Result<()>
where
    P: SessionProtocol,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], services.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, protocol = protocol.alias(), "listening");
    loop {
        let (mut socket, peer) = listener.accept().await?;
        let protocol = protocol.clone();
        let services = services.clone();
        let store = BrokerStore::new(services.broker.clone());
        tokio::spawn(async move {
            debug!(%peer, "connection accepted");
            let mut session = Session::new(protocol, store, services);
            session.run(&mut socket).await;
            debug!(%peer, "connection finished");
        });
    }
}
