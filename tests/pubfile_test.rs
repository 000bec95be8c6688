use std::{io::Cursor, str::FromStr};

use log::LevelFilter;
use renter_rs::{
    filesystem::path::SiaPath,
    pubfile::{
        layout::LAYOUT_SIZE,
        metadata::PubfileMetadata,
        publink::{Publink, ENCODED_PUBLINK_LEN},
        PubfileUploadParams,
    },
};

mod common;

use crate::common::{harness::TestCluster, logging::setup_logger};

fn params(path: &str) -> PubfileUploadParams {
    PubfileUploadParams::builder()
        .path(SiaPath::new(path).unwrap())
        .metadata(PubfileMetadata::for_file("hello skynet", 0o644, 0))
        .base_chunk_redundancy(3)
        .build()
}

#[test]
fn small_pubfile_and_blacklist_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create a chain with 3 hosts, start a renter, and form a contract with every host.
    let cluster = TestCluster::new("pubfile", 3);
    let renter = cluster.start_renter();
    cluster.form_contracts(&renter);

    // 2. Test publishing a small file.

    // 2.1. Upload "hello skynet\n" as a pubfile.
    log::debug!("Uploading a small pubfile.");
    let data = b"hello skynet\n".to_vec();
    let upload = renter
        .upload_pubfile(params("hello"), &mut Cursor::new(data.clone()))
        .unwrap();

    // 2.2. The base sector holds the layout, the metadata, and the data, in that order.
    let metadata_len = PubfileMetadata::for_file("hello skynet", 0o644, data.len() as u64)
        .to_json()
        .unwrap()
        .len() as u64;
    assert_eq!(upload.fetch_size, LAYOUT_SIZE as u64 + metadata_len + data.len() as u64);
    assert_eq!(upload.size, data.len() as u64);

    // 2.3. The publink survives being written out and parsed back.
    let encoded = upload.publink.to_string();
    assert_eq!(encoded.len(), ENCODED_PUBLINK_LEN);
    let publink = Publink::from_str(&encoded).unwrap();
    assert_eq!(publink, upload.publink);

    // 2.4. A dry run of the same content yields the same publink.
    let dry_run = PubfileUploadParams::builder()
        .path(SiaPath::new("hello-dry-run").unwrap())
        .metadata(PubfileMetadata::for_file("hello skynet", 0o644, 0))
        .base_chunk_redundancy(3)
        .dry_run(true)
        .build();
    let dry = renter.upload_pubfile(dry_run, &mut Cursor::new(data.clone())).unwrap();
    assert_eq!(dry.publink, publink);

    // 3. Test fetching the pubfile by its publink.
    log::debug!("Downloading the pubfile by publink.");
    let (metadata, mut stream) = renter.download_pubfile(&publink).unwrap();
    assert_eq!(metadata.filename, "hello skynet");
    assert_eq!(metadata.mode, 0o644);
    assert_eq!(metadata.length, data.len() as u64);
    assert_eq!(stream.read_all().unwrap(), data);

    // 4. Test the blacklist.

    // 4.1. Blacklist the publink.
    log::debug!("Blacklisting the publink.");
    renter.update_blacklist(&[publink], &[]).unwrap();
    assert_eq!(renter.blacklist(), vec![publink.merkle_root()]);

    // 4.2. Neither downloading nor uploading the same content is allowed any more.
    assert!(renter.download_pubfile(&publink).unwrap_err().is_blacklisted());
    assert!(renter
        .upload_pubfile(params("hello-again"), &mut Cursor::new(data.clone()))
        .unwrap_err()
        .is_blacklisted());

    // 4.3. Other content is unaffected.
    let other = renter
        .upload_pubfile(params("goodbye"), &mut Cursor::new(b"goodbye skynet\n".to_vec()))
        .unwrap();
    assert_ne!(other.publink, publink);

    // 4.4. Removing the publink from the blacklist makes it downloadable again.
    renter.update_blacklist(&[], &[publink]).unwrap();
    assert!(renter.blacklist().is_empty());
    let (_, mut stream) = renter.download_pubfile(&publink).unwrap();
    assert_eq!(stream.read_all().unwrap(), data);

    // 5. Test that the blacklist is persisted.
    renter.update_blacklist(&[publink], &[]).unwrap();
    renter.close().unwrap();
    let renter = cluster.start_renter();
    assert_eq!(renter.blacklist(), vec![publink.merkle_root()]);

    renter.close().unwrap();
}
