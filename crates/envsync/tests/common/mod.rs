//! Shared harness: one in-memory server, one clock, clients per device.

#![allow(dead_code)]

use std::sync::Arc;

use envsync::perms::NativeProvider;
use envsync::store::{MemoryStore, Store};
use envsync::sync::{Api, MemoryApi};
use envsync::{Client, ClientConfig, Clock, FixedClock, Session};
use envsync_testkit::OrgFixture;

pub const START: i64 = 1_700_000_000_000;

pub type TestClient<A = MemoryApi, S = MemoryStore> = Client<A, NativeProvider, S>;

pub struct Org {
    pub fixture: OrgFixture,
    pub api: Arc<MemoryApi>,
    pub clock: Arc<FixedClock>,
}

impl Org {
    pub fn new(fixture: OrgFixture) -> Self {
        init_tracing();
        let clock = Arc::new(FixedClock::new(START));
        let server_clock = clock.clone();
        let api = MemoryApi::new(fixture.graph().clone()).with_clock(move || server_clock.now());
        Self {
            fixture,
            api: Arc::new(api),
            clock,
        }
    }

    pub fn session(&self, keyholder_id: &str) -> Session {
        Session::from_seed(keyholder_id, &self.fixture.seed(keyholder_id), self.fixture.roots())
    }

    /// A refreshed client for a fixture keyholder.
    pub async fn client(&self, keyholder_id: &str) -> anyhow::Result<TestClient> {
        self.client_for(self.session(keyholder_id)).await
    }

    pub async fn client_for(&self, session: Session) -> anyhow::Result<TestClient> {
        let client = self.open(session, self.api.clone(), MemoryStore::new()).await?;
        Ok(client)
    }

    pub async fn open<A: Api, S: Store>(
        &self,
        session: Session,
        api: Arc<A>,
        store: S,
    ) -> anyhow::Result<TestClient<A, S>> {
        let mut client = Client::open(session, api, NativeProvider, store, ClientConfig::default())
            .await?
            .with_clock(self.clock.clone());
        client.refresh().await?;
        Ok(client)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}
