use std::io::Cursor;

use log::LevelFilter;
use renter_rs::{erasure::ErasureCode, filesystem::path::SiaPath, upload::FileUploadParams};

mod common;

use crate::common::{harness::TestCluster, logging::setup_logger};

#[test]
fn backup_and_restore_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Initialize test components.

    // 1.1. Create a chain with 3 hosts, start a renter, and form a contract with every host.
    let cluster = TestCluster::new("backup", 3);
    let renter = cluster.start_renter();
    cluster.form_contracts(&renter);

    // 1.2. Create a directory and upload two files into it.
    log::debug!("Uploading two files.");
    let dir = SiaPath::new("music").unwrap();
    renter.create_dir(&dir, 0o700).unwrap();
    let mut files = Vec::new();
    for name in ["music/a.flac", "music/b.flac"] {
        let data: Vec<u8> = (0..30_000).map(|_| rand::random::<u8>()).collect();
        let path = SiaPath::new(name).unwrap();
        let params = FileUploadParams::builder()
            .path(path.clone())
            .erasure_code(ErasureCode::new(1, 2).unwrap())
            .build();
        renter.upload(params, &mut Cursor::new(data.clone())).unwrap();
        files.push((path, data));
    }

    // 2. Test creating a backup.

    // 2.1. Back up the file system.
    log::debug!("Creating backup 'monday'.");
    let entry = renter.create_backup("monday").unwrap();
    assert_eq!(entry.name, "monday");

    // 2.2. The backup is listed by the hosts.
    let backups = renter.backups().unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].uid, entry.uid);
    assert_eq!(backups[0].size, entry.size);

    // 2.3. The backup archive is stored as a file under the snapshots directory.
    let snapshot = SiaPath::snapshots().join("monday").unwrap();
    assert_eq!(renter.file_info(&snapshot).unwrap().size, entry.size);
    assert_eq!(renter.file_list(&dir, true).unwrap().len(), 2);

    // 3. Test restoring the backup.

    // 3.1. Delete one of the files.
    log::debug!("Deleting music/a.flac.");
    renter.delete_file(&files[0].0).unwrap();
    assert!(renter.file_info(&files[0].0).unwrap_err().is_not_found());

    // 3.2. Restore the backup. The deleted file comes back, and the file that still exists is left alone.
    log::debug!("Restoring backup 'monday'.");
    let report = renter.restore_backup("monday").unwrap();
    assert_eq!(report.files_restored, 1);
    assert_eq!(report.files_skipped, 1);
    assert_eq!(report.dirs_created, 0);

    // 3.3. Both files can be downloaded.
    for (path, data) in &files {
        let mut downloaded = Vec::new();
        renter.download(path, 0, None, &mut downloaded).unwrap();
        assert_eq!(&downloaded, data);
    }

    // 4. Restoring an unknown backup fails.
    assert!(renter.restore_backup("tuesday").unwrap_err().is_not_found());

    renter.close().unwrap();
}
