use std::path::{Path, PathBuf};

/// The `.fastband/` directory layout, rooted at a project directory.
///
/// Every component derives its storage location from here so that no two
/// components ever mutate the same file.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    /// Layout rooted at `<project>/.fastband`.
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            root: project_root.as_ref().join(".fastband"),
        }
    }

    /// The `.fastband/` root itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    /// Ticket store backing file; extension depends on the backend.
    pub fn tickets_file(&self, backend: &str) -> PathBuf {
        match backend {
            "sqlite" => self.root.join("tickets.db"),
            _ => self.root.join("tickets.json"),
        }
    }

    pub fn handoffs_dir(&self) -> PathBuf {
        self.root.join("handoffs")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn cache_stats_file(&self) -> PathBuf {
        self.root.join("cache").join("stats.json")
    }

    pub fn webhooks_file(&self) -> PathBuf {
        self.root.join("webhooks.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_dot_fastband() {
        let paths = ProjectPaths::new("/srv/project");
        assert_eq!(paths.root(), Path::new("/srv/project/.fastband"));
        assert!(paths.tickets_file("json").ends_with("tickets.json"));
        assert!(paths.tickets_file("sqlite").ends_with("tickets.db"));
        assert!(paths.webhooks_file().ends_with("webhooks.json"));
        assert!(paths.handoffs_dir().ends_with("handoffs"));
        assert!(paths.config_file().ends_with("config.yaml"));
        assert!(paths.cache_stats_file().ends_with("stats.json"));
    }
}
