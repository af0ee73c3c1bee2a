//! Kasane core functionality
//!
//! This crate holds the image definition store, the dependency graph
//! resolver and the build-plan compiler. It never talks to Docker;
//! everything here fails fast before any engine call is made.

pub mod defs;
pub mod error;
pub mod graph;
pub mod naming;
pub mod plan;

pub use defs::{CopySpec, ImageDef, ImageDefs};
pub use error::{DefError, Result};
pub use graph::{DockerfileRegistry, ExternalBase, ExternalDockerfile};
pub use naming::generate_name;
pub use plan::{BuildTarget, FileCopyStep, LayerStep, PlanOptions, Step};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::ImageDefs;
    use tempfile::TempDir;

    /// YAML文字列から定義ストアを作る。TempDirは呼び出し側で保持する
    pub fn load_yaml(yaml: &str) -> (TempDir, ImageDefs) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kasane.yml");
        std::fs::write(&path, yaml).unwrap();
        let defs = ImageDefs::load(&path).unwrap();
        (dir, defs)
    }
}
