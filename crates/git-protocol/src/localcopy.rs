//! Local-clone shortcut: bypass the wire protocol for repositories on
//! the same filesystem.
//!
//! Pack files and loose objects are hard-linked into the destination
//! (falling back to plain copies when linking fails, e.g. across
//! filesystems), and the source's refs are read directly so the caller
//! can rewrite them. Not used for bundles, and not when the user forces
//! the wire protocol.

use std::fs;
use std::path::Path;

use bstr::{BString, ByteSlice};
use git_hash::ObjectId;

use crate::refs::{Ref, RefList};
use crate::ProtocolError;

/// Copy or hard-link the source repository's objects into the
/// destination git directory. Returns the number of files landed.
pub fn link_or_copy_objects(src_gitdir: &Path, dst_gitdir: &Path) -> Result<usize, ProtocolError> {
    let src_objects = src_gitdir.join("objects");
    let dst_objects = dst_gitdir.join("objects");
    let mut copied = 0;

    for entry in walk_files(&src_objects)? {
        let rel = entry
            .strip_prefix(&src_objects)
            .expect("walk stays under the root");
        // info/ holds caches that do not transfer
        if rel.starts_with("info") {
            continue;
        }
        let dst = dst_objects.join(rel);
        if dst.exists() {
            continue;
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::hard_link(&entry, &dst).is_err() {
            fs::copy(&entry, &dst)?;
        }
        copied += 1;
    }
    Ok(copied)
}

/// Read the source repository's refs: `packed-refs` first, loose files
/// under `refs/` override, peeled `^` lines fold into their tags.
pub fn read_repository_refs(gitdir: &Path) -> Result<RefList, ProtocolError> {
    let mut list = RefList::new();

    let packed = gitdir.join("packed-refs");
    match fs::read_to_string(&packed) {
        Ok(contents) => {
            for line in contents.lines() {
                let line = line.trim_end();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some(hex) = line.strip_prefix('^') {
                    let id: ObjectId = hex.trim().parse().map_err(|e| {
                        ProtocolError::Protocol(format!("bad peeled line in packed-refs: {}", e))
                    })?;
                    if let Some(&last) = list.indices().last() {
                        list.get_mut(last).peeled = Some(id);
                    }
                    continue;
                }
                let (hex, name) = line.split_once(' ').ok_or_else(|| {
                    ProtocolError::Protocol(format!("malformed packed-refs line: {}", line))
                })?;
                let id: ObjectId = hex.parse().map_err(|e| {
                    ProtocolError::Protocol(format!("bad id in packed-refs: {}", e))
                })?;
                list.push(Ref::new(name, id));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ProtocolError::Io(e)),
    }

    let refs_dir = gitdir.join("refs");
    for file in walk_files(&refs_dir)? {
        let rel = file
            .strip_prefix(gitdir)
            .expect("walk stays under the root");
        let name = BString::from(rel.to_string_lossy().replace('\\', "/"));
        let contents = fs::read_to_string(&file)?;
        let contents = contents.trim();

        let r = if let Some(target) = contents.strip_prefix("ref:") {
            let mut r = Ref::new(name.clone(), ObjectId::NULL_SHA1);
            r.symref_target = Some(BString::from(target.trim()));
            r
        } else {
            let id: ObjectId = contents.parse().map_err(|e| {
                ProtocolError::Protocol(format!("bad loose ref {}: {}", name, e))
            })?;
            Ref::new(name.clone(), id)
        };

        // Loose wins over packed
        match list.find(name.as_bstr()) {
            Some(idx) => *list.get_mut(idx) = r,
            None => {
                list.push(r);
            }
        }
    }

    Ok(list)
}

/// The whole shortcut: land the objects, return the source's refs.
pub fn clone_shortcut(src_gitdir: &Path, dst_gitdir: &Path) -> Result<RefList, ProtocolError> {
    link_or_copy_objects(src_gitdir, dst_gitdir)?;
    read_repository_refs(src_gitdir)
}

fn walk_files(root: &Path) -> Result<Vec<std::path::PathBuf>, ProtocolError> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID1: &str = "95d09f2b10159347eece71399a7e2e907ea3df4f";
    const ID2: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn make_source(dir: &Path) {
        fs::create_dir_all(dir.join("objects/95")).unwrap();
        fs::write(dir.join("objects/95").join(&ID1[2..]), b"loose object").unwrap();
        fs::create_dir_all(dir.join("objects/pack")).unwrap();
        fs::write(dir.join("objects/pack/pack-abc.pack"), b"pack bytes").unwrap();
        fs::write(dir.join("objects/pack/pack-abc.idx"), b"idx bytes").unwrap();

        fs::write(
            dir.join("packed-refs"),
            format!(
                "# pack-refs with: peeled fully-peeled sorted\n{} refs/tags/v1.0\n^{}\n",
                ID1, ID2
            ),
        )
        .unwrap();
        fs::create_dir_all(dir.join("refs/heads")).unwrap();
        fs::write(dir.join("refs/heads/main"), format!("{}\n", ID1)).unwrap();
    }

    #[test]
    fn objects_are_linked_or_copied() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        make_source(src.path());

        let copied = link_or_copy_objects(src.path(), dst.path()).unwrap();
        assert!(copied >= 3);
        assert!(dst.path().join("objects/pack/pack-abc.pack").exists());
        assert!(dst
            .path()
            .join("objects/95")
            .join(&ID1[2..])
            .exists());

        // Second run is a no-op
        assert_eq!(link_or_copy_objects(src.path(), dst.path()).unwrap(), 0);
    }

    #[test]
    fn refs_come_from_packed_and_loose() {
        let src = tempfile::tempdir().unwrap();
        make_source(src.path());

        let refs = read_repository_refs(src.path()).unwrap();
        let tag_idx = refs.find(b"refs/tags/v1.0".as_bstr()).unwrap();
        assert_eq!(refs.get(tag_idx).old_id.to_hex(), ID1);
        assert_eq!(refs.get(tag_idx).peeled.map(|p| p.to_hex()), Some(ID2.into()));

        let main_idx = refs.find(b"refs/heads/main".as_bstr()).unwrap();
        assert_eq!(refs.get(main_idx).old_id.to_hex(), ID1);
    }

    #[test]
    fn loose_overrides_packed() {
        let src = tempfile::tempdir().unwrap();
        fs::write(
            src.path().join("packed-refs"),
            format!("{} refs/heads/main\n", ID2),
        )
        .unwrap();
        fs::create_dir_all(src.path().join("refs/heads")).unwrap();
        fs::write(src.path().join("refs/heads/main"), format!("{}\n", ID1)).unwrap();

        let refs = read_repository_refs(src.path()).unwrap();
        let idx = refs.find(b"refs/heads/main".as_bstr()).unwrap();
        assert_eq!(refs.get(idx).old_id.to_hex(), ID1);
        assert_eq!(refs.len(), 1);
    }
}
