//! Thin binary entry point. Building a real deployment means supplying a
//! concrete adapter (backed by a maildir, a database, whatever) and a
//! loaded configuration, both explicitly out of this crate's scope. This
//! binary wires up logging and the listener with a placeholder adapter
//! that refuses every login, so `cargo run` produces something that
//! starts, listens, and behaves correctly while declining to serve real
//! mail. Embedders are expected to replace `placeholder_adapter_factory`
//! with their own `AdapterFactory` and supply a real `RawConfig`.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use pop3d::adapter::{Adapter, AdapterError, AdapterFactory, AdapterResult};
use pop3d::config::{Config, ListenEndpoint, RawConfig};
use pop3d::listener::Listener;

struct PlaceholderAdapter;

#[async_trait]
impl Adapter for PlaceholderAdapter {
    async fn verify_login_credentials(&mut self, _username: &str, _password: &str) -> AdapterResult<bool> {
        Ok(false)
    }

    async fn login_successful(&mut self, _username: &str, _read_only: bool) -> AdapterResult<()> {
        Err(AdapterError::CloseConnection("no adapter configured".into()))
    }

    async fn get_message_count(&mut self) -> AdapterResult<usize> {
        Ok(0)
    }

    async fn get_message_content(&mut self, _index: usize, _encoding: &str) -> AdapterResult<String> {
        Err(AdapterError::CloseConnection("no adapter configured".into()))
    }

    async fn get_message_unique_id(&mut self, _index: usize) -> AdapterResult<String> {
        Err(AdapterError::CloseConnection("no adapter configured".into()))
    }

    async fn is_message_marked_as_deleted(&mut self, _index: usize) -> AdapterResult<bool> {
        Ok(false)
    }

    async fn mark_message_as_deleted(&mut self, _index: usize) -> AdapterResult<()> {
        Ok(())
    }

    async fn unmark_messages_marked_as_deleted(&mut self) -> AdapterResult<()> {
        Ok(())
    }

    async fn commit_deletions(&mut self) -> AdapterResult<()> {
        Ok(())
    }

    async fn connection_closed(&mut self) -> AdapterResult<()> {
        Ok(())
    }
}

fn placeholder_adapter_factory() -> AdapterFactory {
    Arc::new(|| Box::new(PlaceholderAdapter) as Box<dyn Adapter>)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut raw = RawConfig::default();
    raw.listen.push(ListenEndpoint {
        address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 110,
        tls: None,
    });
    let config = Config::new(raw, placeholder_adapter_factory());

    Listener::new().run(config).await?;
    Ok(())
}
