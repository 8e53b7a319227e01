//! Purpose: In-process gateway harness shared by the integration tests.
//! Role: Runs the HTTP and RPC transports on loopback ports of a private runtime.
//! Invariants: Each harness owns a fresh in-memory store; dropping it stops the servers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use framegate::api::Api;
use framegate::backends::IoContext;
use framegate::client::{Client, RpcClient};
use framegate::config::Config;
use framegate::core::request::Session;
use framegate::server::{DEFAULT_MAX_BODY_BYTES, Gateway, ServeConfig};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

pub const CONTAINER: &str = "bigdata";

pub struct TestGateway {
    runtime: tokio::runtime::Runtime,
    gateway: Option<Gateway>,
    pub url: String,
    pub rpc_addr: SocketAddr,
}

impl TestGateway {
    pub fn start() -> TestResult<Self> {
        let mut config = Config::with_kv_backend();
        config.container = CONTAINER.to_string();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()?;
        let gateway = runtime.block_on(async {
            let api = Arc::new(Api::new(Arc::new(config), IoContext::default())?);
            let serve = ServeConfig {
                http: Some("127.0.0.1:0".parse().expect("http addr")),
                rpc: Some("127.0.0.1:0".parse().expect("rpc addr")),
                max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            };
            Gateway::start(api, &serve).await
        })?;
        let http_addr = gateway.http_addr.ok_or("http listener missing")?;
        let rpc_addr = gateway.rpc_addr.ok_or("rpc listener missing")?;
        Ok(Self {
            runtime,
            gateway: Some(gateway),
            url: format!("http://{http_addr}"),
            rpc_addr,
        })
    }

    pub fn client(&self) -> TestResult<Client> {
        Ok(Client::new(&self.url)?.with_basic_auth("tester", "not-logged"))
    }

    pub fn rpc(&self) -> RpcClient {
        RpcClient::new(self.rpc_addr)
    }

    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(gateway) = self.gateway.take() {
            let _ = self.runtime.block_on(gateway.stop());
        }
    }
}

pub fn session() -> Session {
    Session {
        container: CONTAINER.to_string(),
        ..Session::default()
    }
}
