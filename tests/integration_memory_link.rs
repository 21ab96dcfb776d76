//! Full-stack smoke test: two runtimes on one cooperative thread, joined
//! by an in-memory link, playing a real round trip through the loopback
//! fabrics.

use anyhow::Result;
use rpc_proxy::config::{
    ExportedServer, LinkTransport, ProxyConfig, RequiredClient, ServiceBinding, SystemLink,
};
use rpc_proxy::fabric::loopback::LoopbackFabric;
use rpc_proxy::fabric::LocalMessage;
use rpc_proxy::transport::MemoryTransport;
use rpc_proxy::wire::cbor;
use rpc_proxy::{Proxy, ProxyRuntime};
use std::time::Duration;

fn host_cfg() -> ProxyConfig {
    ProxyConfig {
        local_system_name: "alpha".into(),
        links: vec![SystemLink {
            system_name: "beta".into(),
            transport: LinkTransport::InProcess,
        }],
        servers: vec![ExportedServer {
            service_name: "svc.echo".into(),
            protocol_id: "P1".into(),
            max_msg_size: 4096,
        }],
        bindings: vec![ServiceBinding {
            service_name: "svc.echo".into(),
            system_name: "beta".into(),
            remote_service_name: "svc.echo".into(),
        }],
        ..Default::default()
    }
}

fn consumer_cfg() -> ProxyConfig {
    ProxyConfig {
        local_system_name: "beta".into(),
        links: vec![SystemLink {
            system_name: "alpha".into(),
            transport: LinkTransport::InProcess,
        }],
        clients: vec![RequiredClient {
            service_name: "svc.echo".into(),
            protocol_id: "P1".into(),
            max_msg_size: 4096,
        }],
        bindings: vec![ServiceBinding {
            service_name: "svc.echo".into(),
            system_name: "alpha".into(),
            remote_service_name: "svc.echo".into(),
        }],
        ..Default::default()
    }
}

#[tokio::test(flavor = "current_thread")]
async fn echo_round_trip_over_memory_link() -> Result<()> {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (alpha_fabric, alpha_handle) = LoopbackFabric::new();
            let (beta_fabric, beta_handle) = LoopbackFabric::new();
            beta_handle.register_server("svc.echo", "P1");

            let mut alpha_rt = ProxyRuntime::new(Proxy::new(host_cfg(), Box::new(alpha_fabric)));
            let mut beta_rt = ProxyRuntime::new(Proxy::new(consumer_cfg(), Box::new(beta_fabric)));

            let (link_a, link_b) = MemoryTransport::pair("alpha", "beta");
            alpha_rt.install_transport("beta", Box::new(link_a));
            beta_rt.install_transport("alpha", Box::new(link_b));

            alpha_handle.set_notifier(alpha_rt.fabric_kick_sender());
            beta_handle.set_notifier(beta_rt.fabric_kick_sender());
            let beta_kick = beta_rt.fabric_kick_sender();

            tokio::task::spawn_local(async move {
                let _ = alpha_rt.run().await;
            });
            tokio::task::spawn_local(async move {
                let _ = beta_rt.run().await;
            });

            // Echo server on beta's fabric.
            let echo_handle = beta_handle.clone();
            tokio::task::spawn_local(async move {
                loop {
                    while let Some((token, message)) = echo_handle.next_delivered("svc.echo") {
                        echo_handle.complete(token, LocalMessage::new(message.payload));
                        let _ = beta_kick.send(());
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });

            // Wait for the service to come up on alpha.
            let mut advertised = false;
            for _ in 0..200 {
                if alpha_handle.is_advertised("svc.echo") {
                    advertised = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(advertised, "svc.echo never advertised on alpha");

            let (service, session) = alpha_handle.connect_client("svc.echo").unwrap();
            let mut payload = 0x42u32.to_be_bytes().to_vec();
            cbor::emit_text(&mut payload, "over the wire");
            payload.push(cbor::BREAK);
            alpha_handle.client_request(service, session, LocalMessage::new(payload.clone()), true);

            let mut completion = None;
            for _ in 0..200 {
                if let Some(msg) = alpha_handle.next_completion(session) {
                    completion = Some(msg);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let completion = completion.expect("echo response arrived");
            assert_eq!(completion.payload, payload);
            Ok(())
        })
        .await
}
