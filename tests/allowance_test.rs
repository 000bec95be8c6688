use std::{io::Cursor, time::Duration};

use log::LevelFilter;
use renter_rs::{erasure::ErasureCode, filesystem::path::SiaPath, upload::FileUploadParams};

mod common;

use crate::common::{
    harness::{wait_until, TestCluster},
    logging::setup_logger,
};

#[test]
fn cancel_allowance_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create a chain with 3 hosts, start a renter, and form a contract with every host.
    let cluster = TestCluster::new("cancel-allowance", 3);
    let renter = cluster.start_renter();
    cluster.form_contracts(&renter);
    assert_eq!(cluster.chain.confirmed_contracts(), 3);
    assert!(renter.alerts().is_empty());

    // 1.2. Upload a file while the allowance is set.
    let data: Vec<u8> = (0..100_000).map(|_| rand::random::<u8>()).collect();
    let path = SiaPath::new("docs/report.txt").unwrap();
    let params = FileUploadParams::builder()
        .path(path.clone())
        .erasure_code(ErasureCode::new(1, 2).unwrap())
        .build();
    renter.upload(params, &mut Cursor::new(data.clone())).unwrap();

    // 2. Test cancelling the allowance.

    // 2.1. Cancel the allowance and wait for maintenance to mark every contract as not good for upload.
    log::debug!("Cancelling the allowance.");
    renter.cancel_allowance().unwrap();
    assert!(renter.allowance().is_cancelled());
    wait_until("no worker is good for upload", Duration::from_secs(30), || {
        renter
            .worker_pool_status()
            .workers
            .iter()
            .all(|worker| !worker.utility.good_for_upload)
    });

    // 2.2. The renter raises an alert about the missing allowance.
    assert!(renter
        .alerts()
        .iter()
        .any(|alert| alert.module == "renter" && alert.message == "No allowance is set"));

    // 2.3. New uploads are refused.
    let params = FileUploadParams::builder()
        .path(SiaPath::new("docs/draft.txt").unwrap())
        .erasure_code(ErasureCode::new(1, 2).unwrap())
        .build();
    assert!(renter.upload(params, &mut Cursor::new(vec![7u8; 1_000])).is_err());

    // 2.4. The contracts are kept, and the file uploaded before the cancellation can still be downloaded.
    assert_eq!(renter.contracts().len(), 3);
    let mut downloaded = Vec::new();
    renter.download(&path, 0, None, &mut downloaded).unwrap();
    assert_eq!(downloaded, data);

    // 3. Test setting an allowance again.

    // 3.1. Set the allowance and wait for the workers to be good for upload again.
    log::debug!("Setting the allowance again.");
    cluster.form_contracts(&renter);
    assert!(renter.alerts().iter().all(|alert| alert.message != "No allowance is set"));

    renter.close().unwrap();
}
