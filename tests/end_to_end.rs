//! Literal end-to-end scenarios from spec.md §8, driven against the public
//! `engine`/`traversal`/`reader` surface rather than the `driftvault` binary
//! itself (exercising the same code the daemon and companion readers use).

use std::fs;
use std::fs::File;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::time::{Duration, SystemTime};

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use driftvault::config::Config;
use driftvault::engine;
use driftvault::exclude::ExclusionSet;
use driftvault::reader::{purge, restore::{self, RestoreOptions}};
use driftvault::shadow::ShadowPaths;
use driftvault::traversal;

fn open_dir(path: &Path) -> Dir {
    Dir::open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()).unwrap()
}

fn test_config(source: &Path, dest: &Path) -> Config {
    Config {
        source: source.to_path_buf(),
        dest: dest.to_path_buf(),
        debounce: Duration::from_secs(0),
        full_sync_interval: Duration::from_secs(3600),
        exclusions: ExclusionSet::empty(),
        threads: 1,
        max_watches: 64,
        max_bsdiff: 16 * 1024 * 1024,
    }
}

fn process_once(config: &Config, source: &Path, dest: &Path, name: &str) -> engine::Outcome {
    let source_dir = open_dir(source);
    let dest_dir = open_dir(dest);
    engine::process(config, &source_dir, &dest_dir, name, Path::new(name)).unwrap()
}

fn set_met_mtime(path: &Path, secs: i64) {
    let file = File::options().write(true).open(path).unwrap();
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64);
    let times = std::fs::FileTimes::new().set_modified(time);
    file.set_times(times).unwrap();
}

/// Scenarios 1 and 2: create, modify, delete a single file, checking the
/// marker/metadata/content layout at each step plus RT2 idempotence and the
/// I2 "exactly one payload representation" invariant.
#[test]
fn file_lifecycle_create_modify_delete() {
    let source_td = tempfile::tempdir().unwrap();
    let dest_td = tempfile::tempdir().unwrap();
    let source = source_td.path();
    let dest = dest_td.path();

    fs::write(source.join("a.txt"), b"hello").unwrap();
    let config = test_config(source, dest);
    let paths = ShadowPaths::for_name("a.txt");

    let outcome = process_once(&config, source, dest, "a.txt");
    assert!(outcome.new_revision);
    assert_eq!(fs::read_to_string(dest.join(&paths.marker)).unwrap().trim(), "1");
    assert_eq!(fs::read(dest.join(&paths.content_dir).join("1.dat")).unwrap(), b"hello");

    // RT2: a second no-op observation must not advance the revision.
    let outcome = process_once(&config, source, dest, "a.txt");
    assert!(!outcome.new_revision, "RT2: identical metadata must produce no new revision");
    assert_eq!(fs::read_to_string(dest.join(&paths.marker)).unwrap().trim(), "1");

    // Scenario 1's follow-on: modify content, run again.
    fs::write(source.join("a.txt"), b"world!").unwrap();
    let outcome = process_once(&config, source, dest, "a.txt");
    assert!(outcome.new_revision);
    assert_eq!(fs::read_to_string(dest.join(&paths.marker)).unwrap().trim(), "2");
    assert_eq!(fs::read(dest.join(&paths.content_dir).join("2.dat")).unwrap(), b"world!");

    // I2: exactly one of {1.dat, 1.bsp, 1.x3p} must survive the regress step,
    // regardless of whether the external diff helpers are actually installed
    // (a failed helper demotes to keeping the full payload, per §4.5 step 8).
    let content_dir = dest.join(&paths.content_dir);
    let present: Vec<_> =
        ["1.dat", "1.bsp", "1.x3p"].into_iter().filter(|n| content_dir.join(n).exists()).collect();
    assert_eq!(present.len(), 1, "I2: exactly one payload representation of revision 1: {present:?}");

    // Scenario 2: delete, run again -> tombstone revision, no new payload.
    fs::remove_file(source.join("a.txt")).unwrap();
    let outcome = process_once(&config, source, dest, "a.txt");
    assert!(outcome.new_revision);
    assert!(outcome.descent.is_none());
    assert_eq!(fs::read_to_string(dest.join(&paths.marker)).unwrap().trim(), "3");

    let meta3 = fs::read_to_string(dest.join(&paths.metadata_dir).join("3.met")).unwrap();
    assert!(meta3.starts_with('n'), "tombstone revision must record type=n, got {meta3:?}");
    for ext in ["dat", "bsp", "x3p"] {
        assert!(!content_dir.join(format!("3.{ext}")).exists(), "deletion revision carries no payload");
    }
}

/// Boundary case: a zero-byte file is captured and round-trips with no
/// special handling (size 0 is a valid metadata field, not an error case).
#[test]
fn zero_byte_file_round_trips() {
    let source_td = tempfile::tempdir().unwrap();
    let dest_td = tempfile::tempdir().unwrap();
    let source = source_td.path();
    let dest = dest_td.path();

    fs::write(source.join("empty"), b"").unwrap();
    let config = test_config(source, dest);
    process_once(&config, source, dest, "empty");

    let paths = ShadowPaths::for_name("empty");
    assert_eq!(fs::read_to_string(dest.join(&paths.marker)).unwrap().trim(), "1");
    let content = fs::read(dest.join(&paths.content_dir).join("1.dat")).unwrap();
    assert!(content.is_empty());
}

/// Scenario 3: a directory containing a symlink is discovered by a full
/// sync, with the symlink's target text stored as its payload.
#[test]
fn nested_directory_with_symlink_child() {
    let source_td = tempfile::tempdir().unwrap();
    let dest_td = tempfile::tempdir().unwrap();
    let source = source_td.path();
    let dest = dest_td.path();

    fs::create_dir(source.join("dir")).unwrap();
    symlink("../x", source.join("dir").join("b")).unwrap();

    let config = test_config(source, dest);
    traversal::full_sync(&config).unwrap();

    let dir_paths = ShadowPaths::for_name("dir");
    let descent = dest.join(&dir_paths.descent_dir);
    assert!(descent.is_dir(), "a directory child must get a descent dir");

    let b_paths = ShadowPaths::for_name("b");
    assert_eq!(fs::read_to_string(descent.join(&b_paths.marker)).unwrap().trim(), "1");
    let payload = fs::read(descent.join(&b_paths.content_dir).join("1.dat")).unwrap();
    assert_eq!(payload, b"../x");
    let meta = fs::read_to_string(descent.join(&b_paths.metadata_dir).join("1.met")).unwrap();
    assert!(meta.starts_with('l'), "symlink revision must record type=l, got {meta:?}");
}

/// An empty-target symlink (boundary case from §8) must not be confused
/// with "no payload": it has an empty, but present, content file.
#[test]
fn symlink_with_empty_target() {
    let source_td = tempfile::tempdir().unwrap();
    let dest_td = tempfile::tempdir().unwrap();
    let source = source_td.path();
    let dest = dest_td.path();

    symlink("", source.join("link")).unwrap();
    let config = test_config(source, dest);
    process_once(&config, source, dest, "link");

    let paths = ShadowPaths::for_name("link");
    let payload = fs::read(dest.join(&paths.content_dir).join("1.dat")).unwrap();
    assert!(payload.is_empty());
}

/// Scenario 4: an anchored exclusion regex keeps an entire subtree out of
/// the shadow tree entirely, while unrelated siblings are still backed up.
#[test]
fn excluded_paths_get_no_shadow_entry() {
    let source_td = tempfile::tempdir().unwrap();
    let dest_td = tempfile::tempdir().unwrap();
    let source = source_td.path();
    let dest = dest_td.path();

    fs::create_dir(source.join(".cache")).unwrap();
    fs::write(source.join(".cache").join("foo"), b"x").unwrap();
    fs::write(source.join("keep.txt"), b"y").unwrap();

    let mut config = test_config(source, dest);
    config.exclusions = ExclusionSet::from_lines(["\\.cache(/.*)?"].into_iter(), false).unwrap();
    traversal::full_sync(&config).unwrap();

    let cache_paths = ShadowPaths::for_name(".cache");
    assert!(!dest.join(&cache_paths.marker).exists());
    assert!(!dest.join(&cache_paths.descent_dir).exists());

    let keep_paths = ShadowPaths::for_name("keep.txt");
    assert!(dest.join(&keep_paths.marker).exists());
}

/// Scenarios 5 and 6: purge a time-thresholded prefix of revisions, and
/// restore reconstructs the object as it stood at three different instants,
/// including one after the object was deleted (RT1).
#[test]
fn purge_and_restore_reconstruct_past_states() {
    let source_td = tempfile::tempdir().unwrap();
    let dest_td = tempfile::tempdir().unwrap();
    let target_td = tempfile::tempdir().unwrap();
    let source = source_td.path();
    let dest = dest_td.path();
    let target = target_td.path();

    let config = test_config(source, dest);
    let paths = ShadowPaths::for_name("a.txt");

    fs::write(source.join("a.txt"), b"hello").unwrap();
    process_once(&config, source, dest, "a.txt");
    set_met_mtime(&dest.join(&paths.metadata_dir).join("1.met"), 100);

    fs::write(source.join("a.txt"), b"world!").unwrap();
    process_once(&config, source, dest, "a.txt");
    set_met_mtime(&dest.join(&paths.metadata_dir).join("2.met"), 200);

    fs::remove_file(source.join("a.txt")).unwrap();
    process_once(&config, source, dest, "a.txt");
    set_met_mtime(&dest.join(&paths.metadata_dir).join("3.met"), 300);

    restore::restore(dest, None, target, &RestoreOptions { at: 150 }).unwrap();
    assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"hello");

    fs::remove_file(target.join("a.txt")).unwrap();
    restore::restore(dest, None, target, &RestoreOptions { at: 250 }).unwrap();
    assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"world!");

    fs::remove_file(target.join("a.txt")).unwrap();
    restore::restore(dest, None, target, &RestoreOptions { at: 350 }).unwrap();
    assert!(!target.join("a.txt").exists(), "restoring after deletion must leave the file absent");

    // Purge with cutoff 250: revisions 1 (mtime 100) and 2 (mtime 200) are
    // dead; revision 3 is a trailing tombstone and collapses the entire
    // ShadowEntry away.
    purge::purge(dest, 250).unwrap();
    assert!(!dest.join(&paths.marker).exists(), "fully-dead ShadowEntry must be removed");
    assert!(!dest.join(&paths.metadata_dir).exists());
    assert!(!dest.join(&paths.content_dir).exists());
}

/// A purge cutoff that lands before any dead revision must leave history
/// untouched.
#[test]
fn purge_is_a_noop_when_nothing_is_old_enough() {
    let source_td = tempfile::tempdir().unwrap();
    let dest_td = tempfile::tempdir().unwrap();
    let source = source_td.path();
    let dest = dest_td.path();

    let config = test_config(source, dest);
    let paths = ShadowPaths::for_name("a.txt");

    fs::write(source.join("a.txt"), b"hello").unwrap();
    process_once(&config, source, dest, "a.txt");
    set_met_mtime(&dest.join(&paths.metadata_dir).join("1.met"), 1_000);

    purge::purge(dest, 500).unwrap();
    assert!(dest.join(&paths.marker).exists(), "nothing predates the cutoff; entry must survive");
    assert!(dest.join(&paths.metadata_dir).join("1.met").exists());
}
