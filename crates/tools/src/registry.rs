//! Dynamic tool catalog.
//!
//! Built-ins are registered at startup; manifest artefacts are discovered by
//! scanning the tool directories. Artefacts in the quarantine subtree stay
//! invisible to dispatch until approved. Registry writes are serialised
//! behind the `RwLock`; readers snapshot the current map.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::dynamic::DynamicTool;
use crate::{Tool, ToolSpec};

/// The manifest artefact suffix.
pub const MANIFEST_SUFFIX: &str = ".tool.toml";

#[derive(Debug, Clone)]
pub struct ToolDirs {
    pub tools_dir: PathBuf,
    pub community_dir: PathBuf,
    pub quarantine_dir: PathBuf,
}

pub struct ToolRegistry {
    dirs: ToolDirs,
    builtins: Mutex<Vec<Arc<dyn Tool>>>,
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new(dirs: ToolDirs) -> Self {
        Self {
            dirs,
            builtins: Mutex::new(Vec::new()),
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn dirs(&self) -> &ToolDirs {
        &self.dirs
    }

    /// Register a built-in. Survives every `reload()`.
    pub fn register_builtin(&self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        self.builtins
            .lock()
            .expect("builtin list lock poisoned")
            .push(tool.clone());
        self.tools
            .write()
            .expect("registry lock poisoned")
            .insert(name, tool);
    }

    /// Clear the catalog and re-discover: built-ins first, then manifest
    /// artefacts from the tool directories (quarantine excluded). Returns the
    /// number of registered tools.
    pub fn reload(&self) -> Result<usize> {
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in self.builtins.lock().expect("builtin list lock poisoned").iter() {
            map.insert(tool.spec().name, tool.clone());
        }

        for dir in [&self.dirs.tools_dir, &self.dirs.community_dir] {
            for tool in scan_manifests(dir) {
                let name = tool.spec().name;
                map.insert(name, Arc::new(tool));
            }
        }

        let count = map.len();
        *self.tools.write().expect("registry lock poisoned") = map;
        info!(tools = count, "tool registry reloaded");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .contains_key(name)
    }

    /// Snapshot of the current catalog.
    pub fn snapshot(&self) -> HashMap<String, Arc<dyn Tool>> {
        self.tools.read().expect("registry lock poisoned").clone()
    }

    /// Specs of every registered tool, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .values()
            .map(|t| t.spec())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs().into_iter().map(|s| s.name).collect()
    }

    /// Names of the tools whose successful responses must not be cached.
    pub fn non_cacheable_names(&self) -> Vec<String> {
        self.specs()
            .into_iter()
            .filter(|s| !s.cacheable)
            .map(|s| s.name)
            .collect()
    }

    // ── Quarantine lifecycle ─────────────────────────────────────────────────

    /// Quarantined artefact filenames.
    pub fn quarantined(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dirs.quarantine_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(MANIFEST_SUFFIX))
            .collect();
        names.sort();
        names
    }

    /// Raw content of one quarantined artefact, for review.
    pub fn read_quarantined(&self, filename: &str) -> Result<String> {
        let path = self.quarantine_path(filename)?;
        std::fs::read_to_string(&path)
            .with_context(|| format!("reading quarantined artefact {}", path.display()))
    }

    /// Move a quarantined artefact into the approved directory and reload.
    pub fn approve(&self, filename: &str) -> Result<()> {
        let source = self.quarantine_path(filename)?;
        if !source.exists() {
            bail!("tool '{filename}' not found in quarantine");
        }
        std::fs::create_dir_all(&self.dirs.community_dir)?;
        let destination = self.dirs.community_dir.join(filename);
        std::fs::rename(&source, &destination)
            .with_context(|| format!("moving {} to {}", source.display(), destination.display()))?;
        info!(filename, "tool approved");
        self.reload()?;
        Ok(())
    }

    /// Delete a quarantined artefact.
    pub fn reject(&self, filename: &str) -> Result<()> {
        let path = self.quarantine_path(filename)?;
        if !path.exists() {
            bail!("tool '{filename}' not found in quarantine");
        }
        std::fs::remove_file(&path)?;
        info!(filename, "tool rejected");
        Ok(())
    }

    /// Resolve a filename inside the quarantine directory, refusing path
    /// separators.
    pub fn quarantine_path(&self, filename: &str) -> Result<PathBuf> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            bail!("invalid tool filename '{filename}'");
        }
        Ok(self.dirs.quarantine_dir.join(filename))
    }
}

fn scan_manifests(dir: &Path) -> Vec<DynamicTool> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut tools = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(MANIFEST_SUFFIX) {
            continue;
        }
        match DynamicTool::load(&path) {
            Ok(tool) => tools.push(tool),
            Err(err) => warn!(%err, path = %path.display(), "skipping invalid tool manifest"),
        }
    }
    tools
}
