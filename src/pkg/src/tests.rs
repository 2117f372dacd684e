use crate::entry::Entry;
use crate::header::ContentType;
use crate::keystore::KeyStore;
use crate::testpkg::{self, PkgOptions, CONTENT_ID, ENTITLEMENT_KEY};
use crate::{ExtractEntryError, Pkg, ValidationStatus};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use tempfile::TempDir;

const CUSTOM_PASSCODE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";

fn write_pkg(opts: &PkgOptions) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pkg");

    std::fs::write(&path, testpkg::build(opts)).unwrap();

    (dir, path)
}

fn open_with(opts: &PkgOptions, store: &mut KeyStore) -> (TempDir, Pkg) {
    let (dir, path) = write_pkg(opts);
    let pkg = Pkg::open(path, store).unwrap();

    (dir, pkg)
}

#[test]
fn zero_passcode_unlocks_the_image() {
    let mut store = KeyStore::default();
    let (_dir, pkg) = open_with(&PkgOptions::default(), &mut store);

    assert_eq!(pkg.passcode(), Some(crypto::ZERO_PASSCODE));
    assert!(pkg.is_file_system_accessible());
    assert_eq!(pkg.header().content_id(), CONTENT_ID);
    assert_eq!(store.passcode(CONTENT_ID), Some(crypto::ZERO_PASSCODE));

    // The PFS actually opens and walks.
    let inner = pkg.inner_pfs().unwrap();
    let tree = inner.build_tree().unwrap();

    assert!(tree.resolve("/eboot.bin").is_some());
}

#[test]
fn extract_param_sfo() {
    let mut store = KeyStore::default();
    let (_dir, pkg) = open_with(&PkgOptions::default(), &mut store);
    let (index, entry) = pkg.find_entry(Entry::PARAM_SFO).unwrap();
    let size = entry.data_size();
    let data = pkg.extract_entry(index, true).unwrap();

    assert_eq!(data.len(), size);
    assert_eq!(&data[..4], &[0x00, 0x50, 0x53, 0x46]);

    let param = pkg.param().unwrap();

    assert_eq!(param.get("TITLE").unwrap().as_str(), Some("Example Title"));
    assert_eq!(param.get("TITLE_ID").unwrap().as_str(), Some("ZZZZ99999"));
}

#[test]
fn encrypted_entries_round_trip() {
    let mut store = KeyStore::default();
    let (_dir, pkg) = open_with(&PkgOptions::default(), &mut store);

    for id in [Entry::NPTITLE_DAT, Entry::NPBIND_DAT] {
        let (index, entry) = pkg.find_entry(id).unwrap();
        let plain = pkg.extract_entry(index, true).unwrap();
        let raw = pkg.extract_entry(index, false).unwrap();

        assert_eq!(plain.len(), entry.data_size());
        assert_eq!(raw.len(), entry.disk_size());
        assert_ne!(&plain, &raw[..plain.len()]);
    }

    let (index, _) = pkg.find_entry(Entry::NPTITLE_DAT).unwrap();

    assert_eq!(
        pkg.extract_entry(index, true).unwrap(),
        b"nptitle payload, not block aligned"
    );
}

#[test]
fn image_key_recovers_ekpfs_for_unknown_passcode() {
    let mut store = KeyStore::default();
    let opts = PkgOptions {
        passcode: CUSTOM_PASSCODE.to_owned(),
        ..Default::default()
    };
    let (_dir, mut pkg) = open_with(&opts, &mut store);

    // Ladder step 3: EKPFS out of the image key entry.
    assert!(pkg.is_file_system_accessible());
    assert_eq!(pkg.passcode(), None);
    assert!(store.ekpfs(CONTENT_ID).is_some());

    // Passcode-keyed entries stay locked until the passcode arrives.
    let (index, _) = pkg.find_entry(Entry::NPBIND_DAT).unwrap();

    assert!(matches!(
        pkg.extract_entry(index, true),
        Err(ExtractEntryError::NoEntryKey(_))
    ));

    assert!(!pkg.try_passcode("00000000000000000000000000000001", &mut store));
    assert!(pkg.try_passcode(CUSTOM_PASSCODE, &mut store));
    assert_eq!(pkg.extract_entry(index, true).unwrap(), b"npbind payload");
    assert_eq!(store.passcode(CONTENT_ID), Some(CUSTOM_PASSCODE));
}

#[test]
fn ladder_uses_cached_passcode() {
    let mut store = KeyStore::default();

    store.set_passcode(CONTENT_ID, CUSTOM_PASSCODE);

    let opts = PkgOptions {
        passcode: CUSTOM_PASSCODE.to_owned(),
        with_image_key: false,
        ..Default::default()
    };
    let (_dir, pkg) = open_with(&opts, &mut store);

    assert_eq!(pkg.passcode(), Some(CUSTOM_PASSCODE));
    assert!(pkg.is_file_system_accessible());
}

#[test]
fn ladder_uses_cached_ekpfs() {
    let mut store = KeyStore::default();
    let ekpfs = crypto::ekpfs_from_passcode(CONTENT_ID, CUSTOM_PASSCODE).unwrap();

    store.set_ekpfs(CONTENT_ID, &ekpfs);

    let opts = PkgOptions {
        passcode: CUSTOM_PASSCODE.to_owned(),
        with_image_key: false,
        ..Default::default()
    };
    let (_dir, pkg) = open_with(&opts, &mut store);

    assert_eq!(pkg.passcode(), None);
    assert!(pkg.is_file_system_accessible());
    assert!(pkg.inner_pfs().is_ok());
}

#[test]
fn ladder_uses_cached_xts_keys() {
    let mut store = KeyStore::default();
    let ekpfs = crypto::ekpfs_from_passcode(CONTENT_ID, CUSTOM_PASSCODE).unwrap();
    let (data, tweak) = crypto::xts_keys(&ekpfs, &testpkg::KEY_SEED, false);

    store.set_xts(CONTENT_ID, &data, &tweak);

    let opts = PkgOptions {
        passcode: CUSTOM_PASSCODE.to_owned(),
        with_image_key: false,
        ..Default::default()
    };
    let (_dir, pkg) = open_with(&opts, &mut store);

    assert!(pkg.is_file_system_accessible());
    assert!(pkg.inner_pfs().is_ok());
}

#[test]
fn package_without_pfs_opens() {
    let mut store = KeyStore::default();
    let opts = PkgOptions {
        with_pfs: false,
        with_image_key: false,
        ..Default::default()
    };
    let (_dir, pkg) = open_with(&opts, &mut store);

    assert!(!pkg.is_file_system_accessible());
    assert!(pkg.pfs_image().is_none());
    assert!(pkg.inner_pfs().is_err());
    assert!(pkg.param().is_ok());
}

#[test]
fn validator_passes_a_clean_package() {
    let mut store = KeyStore::default();
    let (_dir, pkg) = open_with(&PkgOptions::default(), &mut store);
    let results = pkg.validate();

    assert!(!results.is_empty());
    assert!(results.windows(2).all(|w| w[0].location <= w[1].location));

    for row in &results {
        assert_eq!(row.status, ValidationStatus::Ok, "{}", row.name);
    }

    assert!(results.iter().any(|r| r.name == "pfs image digest"));
    assert!(results.iter().any(|r| r.name == "playgo chunk digests"));
    assert!(results.iter().any(|r| r.name.contains("param.sfo")));
}

#[test]
fn validator_reports_missing_keys_as_no_key() {
    let mut store = KeyStore::default();
    let opts = PkgOptions {
        passcode: CUSTOM_PASSCODE.to_owned(),
        with_image_key: false,
        ..Default::default()
    };
    let (_dir, pkg) = open_with(&opts, &mut store);

    assert!(!pkg.is_file_system_accessible());

    let results = pkg.validate();
    let npbind = results
        .iter()
        .find(|r| r.name.contains("npbind.dat"))
        .unwrap();

    // Key index 0 needs the passcode; key index 3 comes from the entry
    // keys meta and still verifies.
    assert_eq!(npbind.status, ValidationStatus::NoKey);

    let nptitle = results
        .iter()
        .find(|r| r.name.contains("nptitle.dat"))
        .unwrap();

    assert_eq!(nptitle.status, ValidationStatus::Ok);
}

#[test]
fn validator_detects_corruption() {
    let mut store = KeyStore::default();
    let (_dir, path) = write_pkg(&PkgOptions::default());
    let icon_offset = {
        let pkg = Pkg::open(&path, &mut store).unwrap();
        let (_, entry) = pkg.find_entry(Entry::ICON0_PNG).unwrap();

        entry.data_offset() as usize
    };

    let mut raw = std::fs::read(&path).unwrap();

    raw[icon_offset] ^= 0xff;
    std::fs::write(&path, raw).unwrap();

    let pkg = Pkg::open(&path, &mut store).unwrap();
    let results = pkg.validate();
    let icon = results
        .iter()
        .find(|r| r.name.contains("icon0.png"))
        .unwrap();
    let body = results.iter().find(|r| r.name == "body digest").unwrap();

    assert_eq!(icon.status, ValidationStatus::Fail);
    assert_eq!(body.status, ValidationStatus::Fail);
}

#[test]
fn entitlement_key_comes_from_the_license_secret() {
    let mut store = KeyStore::default();
    let opts = PkgOptions {
        content_type: ContentType::Ac,
        with_license: true,
        ..Default::default()
    };
    let (_dir, pkg) = open_with(&opts, &mut store);

    assert_eq!(pkg.entitlement_key().unwrap(), ENTITLEMENT_KEY);
}

#[test]
fn export_rebuilds_the_project_tree() {
    let mut store = KeyStore::default();
    let (_dir, pkg) = open_with(&PkgOptions::default(), &mut store);
    let out = tempfile::tempdir().unwrap();
    let mut percents = Vec::new();
    let cancel = AtomicBool::new(false);

    let report = pkg
        .export_project(
            out.path(),
            true,
            &mut |p, _| percents.push(p),
            &cancel,
        )
        .unwrap();

    assert!(report.failures.is_empty());

    // Progress never overshoots and only ends at 100.
    assert_eq!(*percents.last().unwrap(), 100);
    assert!(percents[..percents.len() - 1].iter().all(|&p| p <= 99));

    // Meta entries.
    assert_eq!(
        std::fs::read(out.path().join("sce_sys/icon0.png")).unwrap(),
        b"fake png"
    );
    assert_eq!(
        std::fs::read(out.path().join("sce_sys/nptitle.dat")).unwrap(),
        b"nptitle payload, not block aligned"
    );
    assert!(!out.path().join("sce_sys/nameless").exists());

    // Inner tree, relative paths preserved.
    assert_eq!(
        std::fs::read(out.path().join("eboot.bin")).unwrap(),
        vec![0x7e; 0x2345]
    );
    assert_eq!(
        std::fs::read(out.path().join("sce_module/libc.prx")).unwrap(),
        b"prx bytes"
    );
    assert_eq!(
        std::fs::read(out.path().join("assets/level1.dat")).unwrap(),
        vec![0x11; 600]
    );

    // param.sfo is rewritten without the packaging tool fields.
    let param = sfo::Sfo::read(&std::fs::read(out.path().join("sce_sys/param.sfo")).unwrap()).unwrap();

    assert!(param.get("PUBTOOLINFO").is_none());
    assert!(param.get("PUBTOOLVER").is_none());
    assert_eq!(param.get("TITLE").unwrap().as_str(), Some("Example Title"));

    // The project file carries the metadata pulled out of the package.
    let gp4 = std::fs::read_to_string(out.path().join("Project.gp4")).unwrap();

    assert!(gp4.contains("<volume_type>pkg_ps4_app</volume_type>"));
    assert!(gp4.contains("c_date=\"2024-01-02 03:04:05\""));
    assert!(gp4.contains("<volume_ts>2023-11-14 22:13:20</volume_ts>"));
    assert!(gp4.contains(&format!("content_id=\"{CONTENT_ID}\"")));
    assert!(gp4.contains("targ_path=\"eboot.bin\""));
    assert!(gp4.contains("targ_path=\"sce_sys/param.sfo\""));
}

#[test]
fn export_records_the_entitlement_key() {
    let mut store = KeyStore::default();
    let opts = PkgOptions {
        content_type: ContentType::Ac,
        with_license: true,
        ..Default::default()
    };
    let (_dir, pkg) = open_with(&opts, &mut store);
    let out = tempfile::tempdir().unwrap();
    let cancel = AtomicBool::new(false);

    pkg.export_project(out.path(), true, &mut |_, _| {}, &cancel)
        .unwrap();

    let gp4 = std::fs::read_to_string(out.path().join("Project.gp4")).unwrap();

    assert!(gp4.contains("<volume_type>pkg_ps4_ac_data</volume_type>"));
    assert!(gp4.contains("entitlement_key=\"00112233445566778899aabbccddeeff\""));

    // license.dat is generated at packaging time, never exported.
    assert!(!out.path().join("sce_sys/license.dat").exists());
}

#[test]
fn export_honors_cancellation() {
    let mut store = KeyStore::default();
    let (_dir, pkg) = open_with(&PkgOptions::default(), &mut store);
    let out = tempfile::tempdir().unwrap();
    let cancel = AtomicBool::new(true);

    assert!(matches!(
        pkg.export_project(out.path(), true, &mut |_, _| {}, &cancel),
        Err(crate::ExportError::Cancelled)
    ));
}
