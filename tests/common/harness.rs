use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tempfile::TempDir;
use renter_rs::{
    config::Configuration,
    contractor::allowance::Allowance,
    renter::{Renter, RenterSpec},
    types::{currency::Currency, data_types::NetAddress},
};

use super::{
    chain::{MockChain, MockGateway, MockWallet},
    host::{MockDialer, MockHost},
};

/// Poll `condition` every 500 milliseconds until it holds. Panics after `timeout`.
pub(crate) fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("Timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(500));
    }
}

/// What makes one renter distinct from another: its persist directory, which is removed when the identity
/// is dropped, its signing key, and its wallet seed.
pub(crate) struct RenterIdentity {
    persist_dir: TempDir,
    renter_key: SigningKey,
    wallet_seed: [u8; 32],
}

impl RenterIdentity {
    pub(crate) fn new(test_name: &str) -> RenterIdentity {
        RenterIdentity {
            persist_dir: tempfile::Builder::new()
                .prefix(&format!("renter_rs-{}-", test_name))
                .tempdir()
                .unwrap(),
            renter_key: SigningKey::generate(&mut OsRng {}),
            wallet_seed: rand::random(),
        }
    }
}

/// A chain, a set of hosts announced on it, and everything a renter needs to use them.
pub(crate) struct TestCluster {
    pub(crate) chain: Arc<MockChain>,
    pub(crate) dialer: Arc<MockDialer>,
    pub(crate) hosts: Vec<MockHost>,
    identity: RenterIdentity,
}

impl TestCluster {
    /// Create a chain and `num_hosts` hosts, and mine a block announcing the hosts.
    pub(crate) fn new(test_name: &str, num_hosts: usize) -> TestCluster {
        let chain = MockChain::new();
        let dialer = MockDialer::new();
        let hosts: Vec<MockHost> = (0..num_hosts)
            .map(|i| MockHost::new(NetAddress::new(format!("10.0.{}.1:9982", i + 1))))
            .collect();
        for host in &hosts {
            dialer.register(host.clone());
        }
        chain.announce_hosts(hosts.iter().map(MockHost::announcement).collect());

        TestCluster {
            chain,
            dialer,
            hosts,
            identity: RenterIdentity::new(test_name),
        }
    }

    /// A configuration with short intervals, for renters that must react within a test's lifetime.
    pub(crate) fn configuration(&self, identity: &RenterIdentity) -> Configuration {
        Configuration::builder()
            .persist_dir(identity.persist_dir.path().to_path_buf())
            .renter_key(identity.renter_key.clone())
            .log_events(true)
            .cache_ttl(Duration::from_millis(500))
            .rpc_timeout(Duration::from_secs(10))
            .offline_check_frequency(Duration::from_millis(200))
            .upload_failure_cooldown(Duration::from_millis(200))
            .download_failure_cooldown(Duration::from_millis(200))
            .memory_limit(64 << 20)
            .priority_memory_limit(32 << 20)
            .repair_interval(Duration::from_secs(2))
            .download_timeout(Duration::from_secs(30))
            .worker_pool_update_interval(Duration::from_secs(1))
            .maintenance_interval(Duration::from_secs(1))
            .scan_interval(Duration::from_secs(60 * 60))
            .scan_check_interval(Duration::from_millis(200))
            .ip_filter(false)
            .build()
    }

    /// Start a renter on the cluster. Starting a second renter after the first was closed resumes from
    /// the same persisted state.
    pub(crate) fn start_renter(&self) -> Renter {
        self.start_renter_as(&self.identity)
    }

    /// Start a renter with its own identity on the cluster's chain and hosts.
    pub(crate) fn start_renter_as(&self, identity: &RenterIdentity) -> Renter {
        RenterSpec::builder()
            .consensus_set(self.chain.clone())
            .gateway(Arc::new(MockGateway))
            .transaction_pool(self.chain.clone())
            .wallet(Arc::new(MockWallet {
                seed: identity.wallet_seed,
            }))
            .host_dialer(self.dialer.clone())
            .configuration(self.configuration(identity))
            .build()
            .start()
            .unwrap()
    }

    /// An allowance forming one contract with every host of the cluster.
    pub(crate) fn allowance(&self) -> Allowance {
        Allowance::builder()
            .funds(Currency::coins(10_000))
            .hosts(self.hosts.len() as u64)
            .period(100)
            .renew_window(20)
            .expected_storage(1 << 30)
            .expected_upload(1 << 30)
            .expected_download(1 << 30)
            .build()
    }

    /// Set the cluster's allowance on `renter` and wait until it has a contract and a worker that is good
    /// for upload for every host. The formation transactions are then mined.
    pub(crate) fn form_contracts(&self, renter: &Renter) {
        renter.set_allowance(self.allowance()).unwrap();
        let num_hosts = self.hosts.len();
        wait_until("a contract is formed with every host", Duration::from_secs(60), || {
            renter.contracts().len() == num_hosts
        });
        self.chain.mine_block(Vec::new());
        wait_until("every worker is good for upload", Duration::from_secs(60), || {
            let status = renter.worker_pool_status();
            status
                .workers
                .iter()
                .filter(|worker| worker.contract_id.is_some() && worker.utility.good_for_upload)
                .count()
                == num_hosts
        });
    }
}
