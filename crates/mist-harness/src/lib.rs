#![forbid(unsafe_code)]
//! Shared scaffolding for MistFS end-to-end tests.

use anyhow::{Context, Result, bail};
use asupersync::Cx;
use mist::{
    DirectoryFile, LinkId, NodeId, OpenFile, RegularFile, SemanticFlags, Tmpfs,
};
use std::sync::Arc;

/// A mounted scratch filesystem plus the ids tests keep reaching for.
pub struct TestMount {
    pub fs: Arc<Tmpfs>,
    pub root_link: LinkId,
    pub root: NodeId,
}

pub fn test_cx() -> Cx {
    Cx::for_testing()
}

pub fn mount_empty() -> Result<TestMount> {
    let cx = test_cx();
    let (fs, root_link) = mist::mount(&cx).context("mount tmpfs")?;
    let root = fs.link_target(root_link).context("resolve root")?;
    Ok(TestMount {
        fs,
        root_link,
        root,
    })
}

/// Create a fresh regular node and link it under `name` in `dir`.
pub fn create_file(mount: &TestMount, dir: NodeId, name: &str) -> Result<LinkId> {
    let cx = test_cx();
    let node = mount.fs.create_regular(&cx).context("create regular")?;
    mount
        .fs
        .link(&cx, dir, name, node)
        .with_context(|| format!("link {name}"))
}

/// Open a link expecting the regular-file kind.
pub fn open_regular(mount: &TestMount, link: LinkId) -> Result<RegularFile> {
    let cx = test_cx();
    match mount
        .fs
        .open(&cx, link, SemanticFlags::READ | SemanticFlags::WRITE)?
    {
        OpenFile::Regular(file) => Ok(file),
        _ => bail!("expected a regular file"),
    }
}

/// Open a link expecting the directory kind.
pub fn open_listing(mount: &TestMount, link: LinkId) -> Result<DirectoryFile> {
    let cx = test_cx();
    match mount.fs.open(&cx, link, SemanticFlags::READ)? {
        OpenFile::Directory(file) => Ok(file),
        _ => bail!("expected a directory"),
    }
}

/// Drain a directory listing into a vector of names.
pub fn list_names(mount: &TestMount, link: LinkId) -> Result<Vec<String>> {
    let cx = test_cx();
    let mut listing = open_listing(mount, link)?;
    let mut names = Vec::new();
    while let Some(name) = listing.read_entries(&cx)? {
        names.push(name);
    }
    Ok(names)
}
