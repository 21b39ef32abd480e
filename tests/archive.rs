use std::fs;
use std::path::Path;

use huffarc::aes::Aes128;
use huffarc::errors::ArchiveError;
use huffarc::format::{AUTH_BYTES, END_DATA, END_PATH, END_TREE, MAGIC_BYTES, VERSION};
use huffarc::{
    key_from_password, md5, read_archive, write_archive, ArchiveReader, ArchiveWriter, Codec,
    DirSink, Entry, EntrySink,
};
use tempfile::TempDir;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn write_input(root: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn round_trip_directory_tree() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let mixed: Vec<u8> = (0..=255u8).cycle().take(3000).collect();

    let a = write_input(root, "a.txt", b"aaabbc");
    let b = write_input(root, "sub/b.bin", &mixed);
    let empty = write_input(root, "empty.txt", b"");

    let archive = root.join("tree.hfa");
    write_archive(
        &archive,
        &[
            Entry::file(&a, "a.txt"),
            Entry::file(&b, "sub/b.bin"),
            Entry::file(&empty, "empty.txt"),
            Entry::empty_dir("hollow"),
        ],
    )
    .unwrap();

    let out = root.join("out");
    let report = read_archive(&archive, &out, None).unwrap();
    assert_eq!(report.files, 3);
    assert_eq!(report.dirs, 1);
    assert!(report.skipped.is_empty());

    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"aaabbc");
    assert_eq!(fs::read(out.join("sub/b.bin")).unwrap(), mixed);
    assert_eq!(fs::read(out.join("empty.txt")).unwrap(), b"");
    assert!(out.join("hollow").is_dir());
}

#[test]
fn preamble_and_degenerate_payload_layout() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let input = write_input(root, "a", b"aaaa");
    let archive = root.join("a.hfa");
    write_archive(&archive, &[Entry::file(&input, "a")]).unwrap();

    let bytes = fs::read(&archive).unwrap();
    assert_eq!(&bytes[..4], &MAGIC_BYTES);
    assert_eq!(bytes[4], VERSION);
    assert_eq!(bytes[5], 0, "binary codec flag");
    assert!(bytes[6..36].iter().all(|&b| b == 0), "reserved bytes");
    assert_eq!(&bytes[36..39], &[0x01, 0x01, 0x00], "entry flags");

    // a single-symbol file encodes as one `1` bit per byte: 1111 padded
    // to 0xF0 with a pad count of 4
    let path_end = find(&bytes, &END_PATH).unwrap();
    let tree_end = find(&bytes, &END_TREE).unwrap();
    let data_end = find(&bytes, &END_DATA).unwrap();
    let tree_raw = &bytes[path_end + 4..tree_end];
    assert_eq!(&bytes[tree_end + 4..data_end], &[0xF0, 0x04]);

    // the trailer covers path, plaintext tree, and decoded payload
    let mut hasher = md5::Md5::new();
    hasher.update(b"a");
    hasher.update(tree_raw);
    hasher.update(b"aaaa");
    assert_eq!(&bytes[data_end + 4..], &hasher.finalize());
}

#[test]
fn aligned_payload_has_lone_pad_count() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    // two equal-weight symbols get 1-bit codes; 8 symbols fill one byte
    let input = write_input(root, "ab.bin", b"aaaabbbb");
    let archive = root.join("ab.hfa");
    write_archive(&archive, &[Entry::file(&input, "ab.bin")]).unwrap();

    let bytes = fs::read(&archive).unwrap();
    let tree_end = find(&bytes, &END_TREE).unwrap();
    let data_end = find(&bytes, &END_DATA).unwrap();
    assert_eq!(&bytes[tree_end + 4..data_end], &[0x0F, 0x00]);

    let out = root.join("out");
    read_archive(&archive, &out, None).unwrap();
    assert_eq!(fs::read(out.join("ab.bin")).unwrap(), b"aaaabbbb");
}

#[test]
fn empty_file_entry_layout() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let input = write_input(root, "e", b"");
    let archive = root.join("e.hfa");
    write_archive(&archive, &[Entry::file(&input, "e")]).unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&MAGIC_BYTES);
    expected.push(VERSION);
    expected.extend_from_slice(&[0u8; 31]);
    expected.extend_from_slice(&[0x01, 0x00, 0x00]);
    expected.extend_from_slice(b"e");
    expected.extend_from_slice(&END_PATH);
    expected.extend_from_slice(&END_DATA);
    expected.extend_from_slice(&md5::digest(b"e"));
    assert_eq!(fs::read(&archive).unwrap(), expected);
}

#[test]
fn empty_dir_entry_layout() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let archive = root.join("d.hfa");
    write_archive(&archive, &[Entry::empty_dir("only/dir")]).unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&MAGIC_BYTES);
    expected.push(VERSION);
    expected.extend_from_slice(&[0u8; 31]);
    expected.extend_from_slice(&[0x00, 0x00, 0x00]);
    expected.extend_from_slice(b"only/dir");
    expected.extend_from_slice(&END_PATH);
    expected.extend_from_slice(&END_DATA);
    expected.extend_from_slice(&md5::digest(b"only/dir"));
    assert_eq!(fs::read(&archive).unwrap(), expected);
}

#[test]
fn encrypted_entry_round_trip() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let content = b"attack at dawn, regroup at dusk, attack again at dawn";
    let input = write_input(root, "secret.bin", content);
    let archive = root.join("s.hfa");
    let key = key_from_password("pw");

    let mut writer = ArchiveWriter::create(&archive).unwrap();
    let mut lookup = |path: &str, _: u32| {
        if path == "secret.bin" {
            Some(key)
        } else {
            None
        }
    };
    writer.with_keys(&mut lookup);
    writer.write_entries(&[Entry::file(&input, "secret.bin")]).unwrap();
    writer.finish().unwrap();

    let bytes = fs::read(&archive).unwrap();
    assert_eq!(&bytes[36..39], &[0x01, 0x01, 0x01]);
    let mut auth = [0u8; 16];
    auth.copy_from_slice(&bytes[39..55]);
    assert_eq!(Aes128::new(&key).decrypt_block(&auth), AUTH_BYTES);

    // encrypted tree region: whole cipher blocks plus one pad-count byte
    let path_end = find(&bytes, &END_PATH).unwrap();
    let tree_end = find(&bytes, &END_TREE).unwrap();
    let tree_region = &bytes[path_end + 4..tree_end];
    assert_eq!((tree_region.len() - 1) % 16, 0);
    assert!(*tree_region.last().unwrap() <= 15);

    let out = root.join("out");
    let mut unlock = |_: &str, _: u32| Some(key);
    let report = read_archive(&archive, &out, Some(&mut unlock)).unwrap();
    assert!(report.skipped.is_empty());
    assert_eq!(fs::read(out.join("secret.bin")).unwrap(), content);
}

#[test]
fn missing_key_skips_entry_and_continues() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let one = write_input(root, "one.txt", b"first file body");
    let secret = write_input(root, "secret.txt", b"classified material");
    let three = write_input(root, "three.txt", b"third file body");
    let archive = root.join("mixed.hfa");
    let key = key_from_password("pw");

    let mut writer = ArchiveWriter::create(&archive).unwrap();
    let mut lookup = |path: &str, _: u32| {
        if path == "secret.txt" {
            Some(key)
        } else {
            None
        }
    };
    writer.with_keys(&mut lookup);
    writer
        .write_entries(&[
            Entry::file(&one, "one.txt"),
            Entry::file(&secret, "secret.txt"),
            Entry::file(&three, "three.txt"),
        ])
        .unwrap();
    writer.finish().unwrap();

    // no key source at all: the protected entry is skipped, the rest extract
    let out = root.join("out");
    let report = read_archive(&archive, &out, None).unwrap();
    assert_eq!(report.files, 2);
    assert_eq!(report.skipped, vec!["secret.txt".to_string()]);
    assert_eq!(fs::read(out.join("one.txt")).unwrap(), b"first file body");
    assert_eq!(fs::read(out.join("three.txt")).unwrap(), b"third file body");
    assert!(!out.join("secret.txt").exists());
}

#[test]
fn wrong_key_is_offered_three_times() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let secret = write_input(root, "secret.txt", b"classified material");
    let archive = root.join("locked.hfa");
    let key = key_from_password("pw");

    let mut writer = ArchiveWriter::create(&archive).unwrap();
    let mut lookup = |_: &str, _: u32| Some(key);
    writer.with_keys(&mut lookup);
    writer
        .write_entries(&[Entry::file(&secret, "secret.txt")])
        .unwrap();
    writer.finish().unwrap();

    let mut attempts = 0u32;
    let out = root.join("out");
    let report = {
        let mut bad = |_: &str, _: u32| {
            attempts += 1;
            Some(key_from_password("wrong"))
        };
        read_archive(&archive, &out, Some(&mut bad)).unwrap()
    };
    assert_eq!(attempts, 3);
    assert_eq!(report.files, 0);
    assert_eq!(report.skipped, vec!["secret.txt".to_string()]);
}

#[test]
fn payload_tampering_is_detected() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    // byte-aligned two-symbol payload, so every payload bit is real
    let input = write_input(root, "t.bin", b"abababab");
    let archive = root.join("t.hfa");
    write_archive(&archive, &[Entry::file(&input, "t.bin")]).unwrap();

    let mut bytes = fs::read(&archive).unwrap();
    let data_end = find(&bytes, &END_DATA).unwrap();
    bytes[data_end - 2] ^= 0x01;
    fs::write(&archive, &bytes).unwrap();

    let out = root.join("out");
    let err = read_archive(&archive, &out, None).unwrap_err();
    assert!(
        matches!(&err, ArchiveError::HashMismatch(path) if path == "t.bin"),
        "unexpected error: {err}"
    );
}

#[test]
fn truncated_archive_names_the_entry() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let input = write_input(root, "trunc.bin", b"some payload that will lose its digest");
    let archive = root.join("cut.hfa");
    write_archive(&archive, &[Entry::file(&input, "trunc.bin")]).unwrap();

    let mut bytes = fs::read(&archive).unwrap();
    bytes.truncate(bytes.len() - 10);
    fs::write(&archive, &bytes).unwrap();

    let out = root.join("out");
    let err = read_archive(&archive, &out, None).unwrap_err();
    assert!(
        matches!(&err, ArchiveError::Truncated(path) if path == "trunc.bin"),
        "unexpected error: {err}"
    );
}

#[test]
fn utf8_codec_round_trip() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let text = "příliš žluťoučký kůň úpěl ďábelské ódy ✓ and some ascii";
    let input = write_input(root, "text.txt", text.as_bytes());
    let archive = root.join("text.hfa");

    // tiny blocks force multi-byte scalars to straddle read boundaries
    let mut writer = ArchiveWriter::create(&archive).unwrap();
    writer.codec(Codec::Utf8).block_size(3);
    writer
        .write_entries(&[Entry::file(&input, "text.txt")])
        .unwrap();
    writer.finish().unwrap();

    let mut reader = ArchiveReader::open(&archive).unwrap();
    reader.block_size(1);
    assert_eq!(reader.header().unwrap().codec, Codec::Utf8);
    let out = root.join("out");
    let mut sink = DirSink::new(&out);
    let report = reader.extract_to(&mut sink).unwrap();
    assert_eq!(report.files, 1);
    assert_eq!(fs::read(out.join("text.txt")).unwrap(), text.as_bytes());
}

#[test]
fn utf8_codec_rejects_binary_input() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let input = write_input(root, "bad.bin", &[0x66, 0xFF, 0xFE, 0x67]);
    let archive = root.join("bad.hfa");

    let mut writer = ArchiveWriter::create(&archive).unwrap();
    writer.codec(Codec::Utf8);
    let err = writer
        .write_entries(&[Entry::file(&input, "bad.bin")])
        .unwrap_err();
    assert!(
        matches!(&err, ArchiveError::InvalidUtf8(path) if path == "bad.bin"),
        "unexpected error: {err}"
    );
}

#[test]
fn writer_refuses_existing_archive() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let archive = root.join("exists.hfa");
    fs::write(&archive, b"already here").unwrap();

    let err = write_archive(&archive, &[]).unwrap_err();
    assert!(matches!(err, ArchiveError::ArchiveExists(_)));
    // the original file is untouched
    assert_eq!(fs::read(&archive).unwrap(), b"already here");
}

#[test]
fn writer_refuses_missing_input() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let archive = root.join("m.hfa");

    let err = write_archive(
        &archive,
        &[Entry::file(root.join("does-not-exist"), "ghost")],
    )
    .unwrap_err();
    assert!(matches!(err, ArchiveError::MissingInput(_)));
}

#[test]
fn dir_sink_rejects_unsafe_paths() {
    let dir = TempDir::new().unwrap();
    let mut sink = DirSink::new(dir.path());
    assert!(sink.begin_file("../evil.txt").is_err());
    assert!(sink.create_dir("/absolute").is_err());
    assert!(sink.begin_file("nested/fine.txt").is_ok());
    sink.write_chunk(b"ok").unwrap();
    sink.finish_file().unwrap();
    assert_eq!(
        fs::read(dir.path().join("nested/fine.txt")).unwrap(),
        b"ok"
    );
}

#[test]
fn entries_append_across_batches() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let a = write_input(root, "a.txt", b"first batch");
    let b = write_input(root, "b.txt", b"second batch");
    let archive = root.join("batched.hfa");

    let mut writer = ArchiveWriter::create(&archive).unwrap();
    writer.write_entries(&[Entry::file(&a, "a.txt")]).unwrap();
    writer.write_entries(&[Entry::file(&b, "b.txt")]).unwrap();
    writer.finish().unwrap();

    let out = root.join("out");
    let report = read_archive(&archive, &out, None).unwrap();
    assert_eq!(report.files, 2);
    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"first batch");
    assert_eq!(fs::read(out.join("b.txt")).unwrap(), b"second batch");
}
