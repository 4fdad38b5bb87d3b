//! Echo service: every bundle received on an endpoint is sent back to its source.

use std::sync::Arc;

use dtnap_core::loopback::LoopbackBp;
use dtnap_core::{worker, AccessPoint, BpSendOptions, Error};
use log::{debug, info, warn};

/// Serve until the access point is closed. Returns the number of bundles echoed.
pub async fn serve(ap: Arc<AccessPoint<LoopbackBp>>) -> u64 {
    let name = ap.address().to_string();
    info!("{name}: echo service started");
    let mut echoed = 0;
    loop {
        let received = match worker::receive(ap.clone()).await {
            Ok(received) => received,
            Err(e) if !ap.is_open() => {
                debug!("{name}: echo stopped ({e})");
                break;
            }
            Err(Error::Interrupted { .. }) => continue,
            Err(e @ Error::ConnectionAborted { .. }) => {
                warn!("{name}: {e}; echo stopped");
                break;
            }
            Err(e) => {
                warn!("{name}: receive failed: {e}");
                continue;
            }
        };
        let source = received.meta.source;
        if source.is_none() {
            debug!("{name}: anonymous bundle, nothing to echo");
            continue;
        }
        let len = received.payload.len();
        match worker::send(ap.clone(), source.clone(), received.payload.into_vec(), BpSendOptions::default()).await {
            Ok(()) => {
                echoed += 1;
                debug!("{name}: echoed {len} bytes to {source}");
            }
            Err(e) => warn!("{name}: echo to {source} failed: {e}"),
        }
    }
    info!("{name}: echo service stopped after {echoed} bundles");
    echoed
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtnap_core::admin::AdminDatabase;
    use dtnap_core::{Eid, LoopbackNode, OpenOptions, Proxy};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_until_shutdown() {
        let node = LoopbackNode::new(3, 1 << 16);
        let (server, client) = (Eid::ipn(3, 7), Eid::ipn(3, 8));
        node.add_endpoint(&server, false).unwrap();
        node.add_endpoint(&client, false).unwrap();
        let proxy = Proxy::attach(node.bp(), 3).unwrap();
        let echo_ap = proxy.open(server.clone(), OpenOptions::default()).unwrap();
        let client_ap = proxy.open(client, OpenOptions::default()).unwrap();
        let task = tokio::spawn(serve(echo_ap));

        for ping in [&b"ping"[..], &[0xab; 2000][..]] {
            worker::send(client_ap.clone(), server.clone(), ping.to_vec(), BpSendOptions::default())
                .await
                .unwrap();
            let pong = worker::receive(client_ap.clone()).await.unwrap();
            assert_eq!(&*pong.payload, ping);
            assert_eq!(pong.meta.source, server);
        }

        proxy.shutdown();
        assert_eq!(task.await.unwrap(), 2);
        assert_eq!(node.usage().objects, 0);
    }
}
