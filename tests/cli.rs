//! Integration tests against the built `zfs-replicate` binary, driven through a
//! fake `zfs` shell script on `PATH` (grounded on the same "spawn the real binary,
//! stand a tool in on PATH" pattern used in the pack's `backups.rs` end-to-end
//! suite) so these run without a real ZFS pool.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{Command, Output};

const BIN: &str = env!("CARGO_BIN_EXE_zfs-replicate");

/// A `PATH` directory holding a fake `zfs` that answers a fixed script of
/// expected invocations (matched on the exact argv it was given, joined by
/// spaces) and fails loudly on anything else.
struct FakeZfs {
    _dir: tempfile::TempDir,
    bin_dir: PathBuf,
}

impl FakeZfs {
    fn new(script_body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().to_path_buf();
        let zfs_path = bin_dir.join("zfs");
        fs::write(&zfs_path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        let mut perms = fs::metadata(&zfs_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&zfs_path, perms).unwrap();
        FakeZfs { _dir: dir, bin_dir }
    }

    fn path_env(&self) -> String {
        let existing = std::env::var("PATH").unwrap_or_default();
        format!("{}:{existing}", self.bin_dir.display())
    }
}

fn run(path_env: &str, args: &[&str]) -> Output {
    Command::new(BIN).args(args).env("PATH", path_env).output().unwrap_or_else(|e| panic!("failed to spawn {BIN}: {e}"))
}

/// Two datasets already sharing their newest snapshot: INSPECT finds a common
/// base whose GUID matches the newest candidate on both sides, so PLAN should
/// short-circuit to `Skipped` and the process should exit zero without ever
/// invoking `zfs send`/`zfs receive`.
#[test]
fn already_up_to_date_pair_exits_zero_without_transfer() {
    let fake = FakeZfs::new(
        r#"
case "$*" in
  "list -Hp -o name,guid,createtxg -t snapshot -r tank/foo")
    printf 'tank/foo@s1\t1\t10\n' ;;
  "list -Hp -o name,guid,createtxg -t snapshot -r tank2/foo")
    printf 'tank2/foo@s1\t1\t10\n' ;;
  *)
    echo "fake zfs: unexpected invocation: $*" >&2
    exit 1 ;;
esac
"#,
    );
    let path = fake.path_env();
    let out = run(&path, &["--no-bookmarks", "--no-privilege-elevation", "tank/foo", "tank2/foo"]);
    assert!(out.status.success(), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));
}

/// A destination with no existing dataset and no conflicting state drives a full
/// send: a capability-free local pipeline of just `zfs send | zfs receive`, an
/// ancestor probe that finds `tank2` already there (so no `zfs create`), and a
/// bookmark of the transferred snapshot afterward.
#[test]
fn initial_send_walks_through_probe_send_receive_bookmark() {
    let fake = FakeZfs::new(
        r#"
case "$*" in
  "get -Hp -o value bookmarks tank")
    printf 'enabled\n' ;;
  "list -Hp -o name,guid,createtxg -t snapshot,bookmark -r tank/foo")
    printf 'tank/foo@s1\t1\t10\n' ;;
  "list -Hp -o name,guid,createtxg -t snapshot -r tank2/foo")
    echo "cannot open 'tank2/foo': dataset does not exist" >&2
    exit 1 ;;
  "list -Hp -o name tank2")
    printf 'tank2\n' ;;
  "send tank/foo@s1")
    exit 0 ;;
  "receive tank2/foo")
    exit 0 ;;
  "bookmark tank/foo@s1 tank/foo#s1")
    exit 0 ;;
  *)
    echo "fake zfs: unexpected invocation: $*" >&2
    exit 1 ;;
esac
"#,
    );
    let path = fake.path_env();
    let out = run(&path, &["--no-privilege-elevation", "tank/foo", "tank2/foo"]);
    assert!(out.status.success(), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));
}

/// `<destination>` is required unless `<source>` is a `+file` indirection; with
/// neither, argument resolution should fail before any dataset is ever touched,
/// and the binary should report the usage-error exit code.
#[test]
fn missing_destination_is_a_usage_error() {
    let out = Command::new(BIN).arg("tank/foo").output().unwrap();
    assert_eq!(out.status.code(), Some(1));
}

/// A colon may only introduce the optional host portion of a dataset spec, and
/// only before the first slash; one appearing after it is a parse error caught
/// before any endpoint or subprocess is even constructed.
#[test]
fn dataset_spec_with_colon_after_slash_is_a_usage_error() {
    let out = Command::new(BIN).args(["tank/foo:bar", "tank2/foo"]).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
}
