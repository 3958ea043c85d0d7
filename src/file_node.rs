//! Cached write path to the panel's sysfs control nodes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

pub const TE2_RATE_HZ: &str = "te2_rate_hz";
pub const TE2_OPTION: &str = "te2_option";
pub const REFRESH_CTRL: &str = "refresh_ctrl";
pub const LOCAL_HBM_MODE: &str = "local_hbm_mode";
pub const HBM_MODE: &str = "hbm_mode";

/// Nodes under one sysfs directory.
///
/// Write descriptors stay open after the first write, since the present path writes to the same
/// few nodes over and over.
#[derive(Debug)]
pub struct FileNode {
    root: PathBuf,
    files: HashMap<String, File>,
    last_written: HashMap<String, u32>,
}

impl FileNode {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: HashMap::new(),
            last_written: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node_path(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    fn file(&mut self, node: &str) -> anyhow::Result<&mut File> {
        if !self.files.contains_key(node) {
            let path = self.node_path(node);
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_context(|| format!("error opening {path:?}"))?;
            self.files.insert(node.to_owned(), file);
        }
        self.files
            .get_mut(node)
            .with_context(|| format!("{node} missing from the file cache"))
    }

    /// Writes `value` as a decimal string.
    pub fn write_u32(&mut self, node: &str, value: u32) -> anyhow::Result<()> {
        let _span = tracy_client::span!("FileNode::write_u32");

        let text = value.to_string();
        let file = self.file(node)?;
        let result = file
            .rewind()
            .and_then(|()| file.write_all(text.as_bytes()));
        if result.is_ok() {
            // Drops stale trailing digits on regular files. Sysfs attributes have no size.
            let _ = file.set_len(text.len() as u64);
        }
        if let Err(err) = result {
            // Reopen on the next write in case the node was recreated.
            self.files.remove(node);
            return Err(err).with_context(|| format!("error writing {value} to {node}"));
        }

        trace!("wrote {value} to {node}");
        self.last_written.insert(node.to_owned(), value);
        Ok(())
    }

    pub fn last_written_value(&self, node: &str) -> Option<u32> {
        self.last_written.get(node).copied()
    }

    /// Reads the whole node. Nothing is cached.
    pub fn read_string(&self, node: &str) -> anyhow::Result<String> {
        let path = self.node_path(node);
        let contents =
            std::fs::read_to_string(&path).with_context(|| format!("error reading {path:?}"))?;
        Ok(contents.trim_end().to_owned())
    }
}

/// Registry of [`FileNode`]s keyed by their root directory.
#[derive(Debug, Default)]
pub struct FileNodeWriter {
    nodes: HashMap<PathBuf, FileNode>,
}

impl FileNodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, root: &Path) -> &mut FileNode {
        self.nodes
            .entry(root.to_owned())
            .or_insert_with(|| FileNode::new(root))
    }

    pub fn get(&self, root: &Path) -> Option<&FileNode> {
        self.nodes.get(root)
    }

    pub fn write_u32(&mut self, root: &Path, node: &str, value: u32) -> anyhow::Result<()> {
        self.get_or_create(root).write_u32(node, value)
    }
}
