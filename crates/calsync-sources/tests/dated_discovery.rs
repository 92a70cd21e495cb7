use std::fs;

use calsync_core::ExtractPayload;
use calsync_sources::{deterministic_extract_id, DatedDirectoryDiscovery, ExtractDiscovery};
use chrono::NaiveDate;
use tempfile::tempdir;

#[tokio::test]
async fn discovery_filters_derived_files_and_flags_processed_inputs() {
    let root = tempdir().expect("tempdir");
    let day = NaiveDate::from_ymd_opt(2025, 5, 14).unwrap();
    let dated = root.path().join("2025-05-14");
    fs::create_dir_all(&dated).unwrap();
    for name in [
        "2025-05-14_lexp_cd.csv",
        "2025-05-14_cvr_registration_cd.csv",
        "cleaned_2025-05-14_lexp_cd.csv",
        "projects_2025-05-14.csv",
        "2025-05-14_readme.txt",
    ] {
        fs::write(dated.join(name), "A\n1\n").unwrap();
    }

    let discovery = DatedDirectoryDiscovery::new(root.path(), day);
    let extracts = discovery.discover().await.expect("discover");

    let tables: Vec<_> = extracts.iter().map(|e| e.table.as_str()).collect();
    assert_eq!(tables, vec!["cvr_registration_cd", "lexp_cd"]);

    let registration = &extracts[0];
    assert!(!registration.already_processed);
    assert_eq!(registration.created_on, day);
    assert_eq!(
        registration.id,
        deterministic_extract_id("cvr_registration_cd", "2025-05-14_cvr_registration_cd.csv", day)
    );
    assert!(matches!(&registration.payload, ExtractPayload::Csv(p) if p.ends_with("2025-05-14_cvr_registration_cd.csv")));

    assert!(extracts[1].already_processed, "sidecar marks lexp_cd as handled");
}
