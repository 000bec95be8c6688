use std::io::{Cursor, Read, Seek, SeekFrom};

use log::LevelFilter;
use renter_rs::{
    erasure::ErasureCode,
    filesystem::path::SiaPath,
    pubfile::{layout::LAYOUT_SIZE, metadata::PubfileMetadata, PubfileUploadParams, PUBACCESS_FOLDER},
    renter::Renter,
    types::constants::SECTOR_SIZE,
};

mod common;

use crate::common::{
    harness::{RenterIdentity, TestCluster},
    logging::setup_logger,
};

const FILENAME: &str = "large skynet";

/// Parameters storing both the base sector and the data 1-of-3, so that 3 hosts are enough.
fn params(path: &str) -> PubfileUploadParams {
    PubfileUploadParams::builder()
        .path(SiaPath::new(path).unwrap())
        .metadata(PubfileMetadata::for_file(FILENAME, 0o644, 0))
        .base_chunk_redundancy(3)
        .fanout_erasure_code(ErasureCode::new(1, 2).unwrap())
        .build()
}

fn pubaccess_path(path: &str) -> SiaPath {
    SiaPath::var().join(PUBACCESS_FOLDER).unwrap().join(path).unwrap()
}

fn random_data(len: u64) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

fn metadata_len(length: u64) -> u64 {
    PubfileMetadata::for_file(FILENAME, 0o644, length).to_json().unwrap().len() as u64
}

fn has_extended_file(renter: &Renter, path: &str) -> bool {
    match renter.file_info(&pubaccess_path(&format!("{}-extended", path))) {
        Ok(_) => true,
        Err(err) if err.is_not_found() => false,
        Err(err) => panic!("{}", err),
    }
}

#[test]
fn small_and_large_boundary_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.
    let cluster = TestCluster::new("pubfile_boundary", 3);
    let renter = cluster.start_renter();
    cluster.form_contracts(&renter);

    // 2. Find the largest file that fits in the base sector next to the layout and its metadata.
    let mut largest_small = SECTOR_SIZE - LAYOUT_SIZE as u64;
    loop {
        let fitting = SECTOR_SIZE - LAYOUT_SIZE as u64 - metadata_len(largest_small);
        if fitting == largest_small {
            break;
        }
        largest_small = fitting;
    }

    // 3. A file of exactly that size is stored inline, filling the base sector.
    log::debug!("Uploading a pubfile of {} bytes.", largest_small);
    let data = random_data(largest_small);
    let upload = renter.upload_pubfile(params("fits"), &mut Cursor::new(data.clone())).unwrap();
    assert_eq!(upload.fetch_size, SECTOR_SIZE);
    assert_eq!(upload.size, largest_small);
    assert!(!has_extended_file(&renter, "fits"));
    let (metadata, mut stream) = renter.download_pubfile(&upload.publink).unwrap();
    assert_eq!(metadata.length, largest_small);
    assert_eq!(stream.read_all().unwrap(), data);

    // 4. One more byte makes it a large pubfile with a fanout.
    log::debug!("Uploading a pubfile of {} bytes.", largest_small + 1);
    let data = random_data(largest_small + 1);
    let upload = renter.upload_pubfile(params("overflows"), &mut Cursor::new(data.clone())).unwrap();
    assert!(upload.fetch_size < SECTOR_SIZE);
    assert_eq!(upload.size, largest_small + 1);
    assert!(has_extended_file(&renter, "overflows"));
    let (metadata, mut stream) = renter.download_pubfile(&upload.publink).unwrap();
    assert_eq!(metadata.length, largest_small + 1);
    assert_eq!(stream.len(), largest_small + 1);
    assert_eq!(stream.read_all().unwrap(), data);

    renter.close().unwrap();
}

#[test]
fn large_pubfile_pin_and_unpin_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create a chain with 3 hosts, start a renter, and form a contract with every host.
    let cluster = TestCluster::new("pubfile_large", 3);
    let publisher = cluster.start_renter();
    cluster.form_contracts(&publisher);

    // 1.2. Start a second renter with its own contracts on the same hosts.
    let identity = RenterIdentity::new("pubfile_large_pinner");
    let pinner = cluster.start_renter_as(&identity);
    cluster.form_contracts(&pinner);

    // 2. Test publishing a file of three chunks. The last chunk is partial.
    log::debug!("Uploading a large pubfile.");
    let data = random_data(2 * SECTOR_SIZE + 12_345);
    let upload = publisher.upload_pubfile(params("large"), &mut Cursor::new(data.clone())).unwrap();
    let publink = upload.publink;
    assert_eq!(upload.size, data.len() as u64);
    assert!(upload.fetch_size < SECTOR_SIZE);

    // 2.1. Both the base sector file and the extended file are tagged with the publink.
    let tag = publink.to_string();
    let base = publisher.file_info(&pubaccess_path("large")).unwrap();
    let extended = publisher.file_info(&pubaccess_path("large-extended")).unwrap();
    assert_eq!(base.publinks, vec![tag.clone()]);
    assert_eq!(extended.publinks, vec![tag.clone()]);
    assert_eq!(extended.size, data.len() as u64);
    assert_eq!(extended.num_chunks, 3);

    // 3. Test reading the pubfile through the fanout.

    // 3.1. The whole file.
    let (metadata, mut stream) = publisher.download_pubfile(&publink).unwrap();
    assert_eq!(metadata.filename, FILENAME);
    assert_eq!(metadata.length, data.len() as u64);
    assert_eq!(stream.read_all().unwrap(), data);

    // 3.2. A read straddling the end of the first chunk.
    let boundary = SECTOR_SIZE as usize;
    stream.seek(SeekFrom::Start(SECTOR_SIZE - 10)).unwrap();
    let mut straddling = [0u8; 20];
    stream.read_exact(&mut straddling).unwrap();
    assert_eq!(&straddling[..], &data[boundary - 10..boundary + 10]);

    // 3.3. A read starting exactly on the second boundary.
    stream.seek(SeekFrom::Start(2 * SECTOR_SIZE)).unwrap();
    let mut first_of_last = [0u8; 100];
    stream.read_exact(&mut first_of_last).unwrap();
    assert_eq!(&first_of_last[..], &data[2 * boundary..2 * boundary + 100]);

    // 3.4. The tail of the file, and nothing past it.
    stream.seek(SeekFrom::End(-5)).unwrap();
    let mut tail = Vec::new();
    stream.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, &data[data.len() - 5..]);
    assert_eq!(stream.read(&mut [0u8; 8]).unwrap(), 0);

    // 4. Test pinning the pubfile from the second renter.
    log::debug!("Pinning the pubfile from a second renter.");
    pinner.pin_pubfile(&publink, params("pinned")).unwrap();
    let pinned_base = pinner.file_info(&pubaccess_path("pinned")).unwrap();
    let pinned_extended = pinner.file_info(&pubaccess_path("pinned-extended")).unwrap();
    assert_eq!(pinned_base.publinks, vec![tag.clone()]);
    assert_eq!(pinned_extended.publinks, vec![tag.clone()]);
    assert_eq!(pinned_extended.size, data.len() as u64);

    // 5. Test unpinning from the publisher.

    // 5.1. Both of the publisher's files are deleted.
    log::debug!("Unpinning the pubfile from the publisher.");
    let mut deleted = publisher.unpin_pubfile(&publink).unwrap();
    deleted.sort_by_key(|path| path.to_string());
    assert_eq!(deleted, vec![pubaccess_path("large"), pubaccess_path("large-extended")]);
    assert!(publisher.file_info(&pubaccess_path("large")).unwrap_err().is_not_found());
    assert!(publisher.file_info(&pubaccess_path("large-extended")).unwrap_err().is_not_found());
    assert!(publisher.unpin_pubfile(&publink).unwrap().is_empty());

    // 5.2. The second renter keeps the pubfile alive and can still read it.
    let (_, mut stream) = pinner.download_pubfile(&publink).unwrap();
    assert_eq!(stream.read_all().unwrap(), data);

    pinner.close().unwrap();
    publisher.close().unwrap();
}
