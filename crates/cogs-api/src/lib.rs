//! cogs-api: API server for cogs
//!
//! This crate exposes the broker to clients:
//! - Node status and device wait endpoints
//! - The RPC tunnel behind `CONNECT /api`
//! - Unix and TCP listeners

pub mod rest;
pub mod rpc;
pub mod serve;

pub use rest::{create_router, AppState};
pub use serve::{bind_unix, serve_tcp, serve_unix, Api, API_PATH, CONNECTED};

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use cogs_broker::{ClaimBroker, StateStore, Wait};
    use cogs_core::{BrokerConfig, CogsError, CogsResult, Device, Peer, ProcessInfo};
    use cogs_identity::Identify;
    use std::sync::Arc;

    use crate::rest::AppState;

    /// Identity with a fixed answer for every peer
    pub enum FixedIdentity {
        Owner(String),
        Unknown,
        Broken,
    }

    impl FixedIdentity {
        pub fn owner(owner: &str) -> Self {
            FixedIdentity::Owner(owner.to_string())
        }
    }

    #[async_trait]
    impl Identify for FixedIdentity {
        async fn identify_process(&self, pid: u32) -> CogsResult<ProcessInfo> {
            Err(CogsError::ProcessNotFound(pid))
        }

        async fn identify_peer(&self, peer: &Peer) -> CogsResult<String> {
            match self {
                FixedIdentity::Owner(owner) => Ok(owner.clone()),
                FixedIdentity::Unknown => Err(CogsError::ContainerNotFound(peer.to_string())),
                FixedIdentity::Broken => Err(CogsError::Infrastructure("docker down".to_string())),
            }
        }
    }

    pub fn app_state(count: u32, identity: FixedIdentity) -> Arc<AppState> {
        let identity: Arc<dyn Identify> = Arc::new(identity);
        let devices = (0..count)
            .map(|i| Device::new(i, format!("GPU-{:04}", i), "Tesla T4"))
            .collect();
        let store = Arc::new(StateStore::new(devices, identity.clone()));
        let broker = Arc::new(ClaimBroker::new(store.clone(), &BrokerConfig::default()));

        Arc::new(AppState {
            store,
            broker,
            identity,
            default_wait: Wait::Immediate,
        })
    }

    /// Request from a local client with uid 1000
    pub fn request(method: Method, uri: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(Peer::Unix {
            pid: Some(4242),
            uid: Some(1000),
        });
        request
    }
}
