//! local-storage 扫描集成测试

use ses_daemon::ingest::scan_directory;
use tempfile::TempDir;

#[test]
fn test_two_files_dedup_case_fold() {
    let tmp = TempDir::new().unwrap();

    // 文件 A：同一 UUID 的大小写两种写法
    let mut file_a = Vec::new();
    file_a.extend_from_slice(b"\x00\x01\x02");
    file_a.extend_from_slice(b"LSS-002bb01a-b420-4b1e-862a-ec01b9897bd1:attachment");
    file_a.extend_from_slice(b"\x00\xff");
    file_a.extend_from_slice(b"LSS-002BB01A-B420-4B1E-862A-EC01B9897BD1:textInput");
    std::fs::write(tmp.path().join("000001.ldb"), &file_a).unwrap();

    // 文件 B：另一个 UUID
    std::fs::write(
        tmp.path().join("000002.ldb"),
        b"LSS-0450fa6e-6900-43c7-9327-158813b8b531:files",
    )
    .unwrap();

    let ids = scan_directory(tmp.path());

    assert_eq!(ids.len(), 2);
    assert!(ids.contains("002bb01a-b420-4b1e-862a-ec01b9897bd1"));
    assert!(ids.contains("0450fa6e-6900-43c7-9327-158813b8b531"));
}

#[test]
fn test_missing_directory_degrades_to_empty() {
    let ids = scan_directory(std::path::Path::new("/nonexistent/leveldb"));
    assert!(ids.is_empty());
}

#[test]
fn test_binary_noise_degrades_to_empty() {
    let tmp = TempDir::new().unwrap();
    // 无明文 key 的"压缩"内容：优雅退化为空集，不报错
    let noise: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(tmp.path().join("000001.ldb"), &noise).unwrap();

    let ids = scan_directory(tmp.path());
    assert!(ids.is_empty());
}

#[test]
fn test_representative_fixture_yields_ids() {
    let tmp = TempDir::new().unwrap();

    // 代表性 fixture：key 混杂在二进制记录结构中间
    let mut fixture = Vec::new();
    for i in 0..64 {
        fixture.push(i as u8);
    }
    fixture.extend_from_slice(b"/!lss-claude-");
    fixture.extend_from_slice(b"\x01\x08\x00");
    fixture.extend_from_slice(b"_file://\x00\x01LSS-11111111-2222-3333-4444-555555555555:draft\x00");
    fixture.extend_from_slice(&[0u8; 128]);
    std::fs::write(tmp.path().join("000042.ldb"), &fixture).unwrap();

    let ids = scan_directory(tmp.path());
    assert!(!ids.is_empty());
    assert!(ids.contains("11111111-2222-3333-4444-555555555555"));
}
