use std::{io::Cursor, time::Duration};

use log::LevelFilter;
use renter_rs::{erasure::ErasureCode, filesystem::path::SiaPath, upload::FileUploadParams};

mod common;

use crate::common::{
    harness::{wait_until, TestCluster},
    logging::setup_logger,
};

#[test]
fn upload_download_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create a chain with 3 hosts announced on it.
    let cluster = TestCluster::new("upload-download", 3);

    // 1.2. Start a renter and form a contract with every host.
    log::debug!("Starting a renter and forming contracts with 3 hosts.");
    let renter = cluster.start_renter();
    cluster.form_contracts(&renter);

    // 2. Test uploading a file and downloading it back.

    // 2.1. Upload 1.5 MiB of random data as a 1-of-3 file.
    log::debug!("Uploading a 1.5 MiB file.");
    let data: Vec<u8> = (0..(3 << 19)).map(|_| rand::random::<u8>()).collect();
    let path = SiaPath::new("home/user/photo.bin").unwrap();
    let params = FileUploadParams::builder()
        .path(path.clone())
        .erasure_code(ErasureCode::new(1, 2).unwrap())
        .build();
    renter.upload(params, &mut Cursor::new(data.clone())).unwrap();

    // 2.2. Check that the file is listed with its size and is fully redundant.
    let info = renter.file_info(&path).unwrap();
    assert_eq!(info.size, data.len() as u64);
    assert_eq!(info.num_chunks, 1);
    assert!(info.recoverable);
    let listed = renter.file_list(&SiaPath::new("home").unwrap(), true).unwrap();
    assert!(listed.iter().any(|file| file.path == path));

    // 2.3. Download the whole file.
    log::debug!("Downloading the whole file.");
    let mut downloaded = Vec::new();
    let written = renter.download(&path, 0, None, &mut downloaded).unwrap();
    assert_eq!(written, data.len() as u64);
    assert_eq!(downloaded, data);

    // 2.4. Download a range that does not start at a segment boundary.
    log::debug!("Downloading a range of the file.");
    let mut range = Vec::new();
    renter.download(&path, 1_000, Some(70_001), &mut range).unwrap();
    assert_eq!(range, data[1_000..71_001].to_vec());

    // 2.5. Downloading past the end of the file fails.
    let mut past_end = Vec::new();
    assert!(renter
        .download(&path, data.len() as u64 - 10, Some(20), &mut past_end)
        .is_err());

    // 3. Test that the file survives losing a host.

    // 3.1. Take the first host offline.
    log::debug!("Taking host 0 offline.");
    cluster.hosts[0].set_online(false);

    // 3.2. Download the file again from the remaining hosts.
    let mut downloaded = Vec::new();
    renter.download(&path, 0, None, &mut downloaded).unwrap();
    assert_eq!(downloaded, data);
    cluster.hosts[0].set_online(true);

    // 4. Test renaming and deleting files.

    // 4.1. Rename the file and check it is only found under its new name.
    let renamed = SiaPath::new("home/user/renamed.bin").unwrap();
    renter.rename_file(&path, &renamed).unwrap();
    assert!(renter.file_info(&path).unwrap_err().is_not_found());
    let mut downloaded = Vec::new();
    renter.download(&renamed, 0, None, &mut downloaded).unwrap();
    assert_eq!(downloaded, data);

    // 4.2. Uploading to an existing path without force fails.
    let params = FileUploadParams::builder()
        .path(renamed.clone())
        .erasure_code(ErasureCode::new(1, 2).unwrap())
        .build();
    assert!(renter
        .upload(params, &mut Cursor::new(vec![1u8; 100]))
        .unwrap_err()
        .is_exists());

    // 5. Test that a restarted renter still finds its files and contracts.

    // 5.1. Close the renter and start a new one on the same persist directory.
    log::debug!("Restarting the renter.");
    renter.close().unwrap();
    let renter = cluster.start_renter();
    assert_eq!(renter.contracts().len(), 3);

    // 5.2. Wait for the workers to come back and download the file again.
    wait_until("the workers are rebuilt", Duration::from_secs(30), || {
        renter.worker_pool_status().num_workers == 3
    });
    let mut downloaded = Vec::new();
    renter.download(&renamed, 0, None, &mut downloaded).unwrap();
    assert_eq!(downloaded, data);

    // 5.3. Delete the file.
    renter.delete_file(&renamed).unwrap();
    assert!(renter.file_info(&renamed).unwrap_err().is_not_found());

    renter.close().unwrap();
}
