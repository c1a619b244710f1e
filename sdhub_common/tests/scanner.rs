use std::{fs, path::Path, time::Duration};

use sdhub_common::{DirectoryCache, ExtensionFilter};

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, b"x").unwrap();
}

#[test]
fn debounced_rescan_serves_cached_listing() {
    let root = tempfile::tempdir().unwrap();
    let model = root.path().join("sd/v1-5.safetensors");
    touch(&model);

    let mut cache = DirectoryCache::new(Duration::from_secs(3600));
    assert_eq!(cache.files([root.path()], true), vec![model.clone()]);

    fs::remove_dir_all(root.path().join("sd")).unwrap();
    touch(&root.path().join("new.safetensors"));

    assert!(!cache.has_changed(root.path(), true));
    assert_eq!(cache.files([root.path()], true), vec![model]);
}

#[test]
fn vanished_directories_are_purged() {
    let root = tempfile::tempdir().unwrap();
    touch(&root.path().join("keep.ckpt"));
    touch(&root.path().join("sub/gone.ckpt"));

    let mut cache = DirectoryCache::new(Duration::ZERO);
    assert_eq!(cache.files([root.path()], true).len(), 2);

    fs::remove_dir_all(root.path().join("sub")).unwrap();
    assert!(cache.has_changed(root.path(), true));
    assert_eq!(
        cache.files([root.path()], true),
        vec![root.path().join("keep.ckpt")]
    );
    assert!(cache.get(&root.path().join("sub")).is_none());
}

#[test]
fn reserved_prefix_directories_are_never_listed() {
    let root = tempfile::tempdir().unwrap();
    touch(&root.path().join("Lora/style.safetensors"));
    touch(&root.path().join("models--org--repo/snapshots/abc/unet/model.safetensors"));
    touch(&root.path().join("models--org--repo/blobs/abc"));

    let mut cache = DirectoryCache::default();
    let files = cache.files([root.path()], true);
    assert_eq!(files, vec![root.path().join("Lora/style.safetensors")]);
    assert!(cache
        .directories(root.path(), true)
        .keys()
        .all(|dir| !dir.to_string_lossy().contains("models--")));
}

#[test]
fn overlapping_roots_do_not_duplicate_files() {
    let root = tempfile::tempdir().unwrap();
    touch(&root.path().join("a/one.pt"));
    touch(&root.path().join("two.pt"));

    let mut cache = DirectoryCache::default();
    let mut files = cache.files(
        [root.path().to_path_buf(), root.path().join("a"), root.path().to_path_buf()],
        true,
    );
    files.sort();
    assert_eq!(
        files,
        vec![root.path().join("a/one.pt"), root.path().join("two.pt")]
    );
}

#[test]
fn missing_root_yields_nothing() {
    let root = tempfile::tempdir().unwrap();
    let mut cache = DirectoryCache::default();
    assert!(cache.files([root.path().join("nope")], true).is_empty());
    assert!(cache.is_empty());
}

#[test]
fn filtered_listing() {
    let root = tempfile::tempdir().unwrap();
    touch(&root.path().join("model.safetensors"));
    touch(&root.path().join("model.vae.pt"));
    touch(&root.path().join("notes.txt"));

    let mut cache = DirectoryCache::default();
    let filter = ExtensionFilter::new(&[".safetensors", ".pt"], &[".vae.pt"]);
    let files = cache
        .files([root.path()], true)
        .into_iter()
        .filter(|f| filter.matches(f))
        .collect::<Vec<_>>();
    assert_eq!(files, vec![root.path().join("model.safetensors")]);
}

#[cfg(unix)]
mod links {
    use std::{ffi::OsString, io, os::unix::fs::symlink, path::PathBuf};

    use sdhub_common::{walk, DirectoryCache};

    use super::touch;

    fn walk_collect(top: &std::path::Path) -> (Vec<(PathBuf, Vec<OsString>)>, Vec<PathBuf>) {
        let mut errors = Vec::new();
        let walked = walk(top, &mut |_: io::Error, path: &std::path::Path| {
            errors.push(path.to_path_buf())
        });
        (walked, errors)
    }

    #[test]
    fn dangling_link_counts_as_file() {
        let root = tempfile::tempdir().unwrap();
        symlink(
            root.path().join("gone.safetensors"),
            root.path().join("link.safetensors"),
        )
        .unwrap();

        let (walked, errors) = walk_collect(root.path());
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(
            walked,
            vec![(
                root.path().to_path_buf(),
                vec![OsString::from("link.safetensors")]
            )]
        );
    }

    #[test]
    fn two_paths_to_one_directory_are_both_listed() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("real/m.ckpt"));
        symlink(root.path().join("real"), root.path().join("alias")).unwrap();

        let mut cache = DirectoryCache::new(std::time::Duration::ZERO);
        let mut files = cache.files([root.path()], true);
        files.sort();
        assert_eq!(
            files,
            vec![root.path().join("alias/m.ckpt"), root.path().join("real/m.ckpt")]
        );
        assert!(cache.get(&root.path().join("real")).is_some());
    }

    #[test]
    fn link_to_ancestor_is_reported_and_not_followed() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("sub/model.pt"));
        symlink(root.path(), root.path().join("sub/up")).unwrap();

        let (walked, errors) = walk_collect(root.path());
        assert_eq!(errors, vec![root.path().join("sub/up")]);
        let dirs = walked.iter().map(|(dir, _)| dir.clone()).collect::<Vec<_>>();
        assert_eq!(dirs, vec![root.path().join("sub"), root.path().to_path_buf()]);
        assert_eq!(walked[0].1, vec![OsString::from("model.pt")]);
    }
}
