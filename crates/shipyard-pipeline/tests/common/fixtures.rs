//! Test fixtures for pipeline integration tests.

use std::path::Path;

use shipyard_pipeline::{DeploymentContext, OrgId, ProjectId, SourceRef, UserId};
use tempfile::TempDir;

/// A source tree containing one deployable file plus entries sync must skip.
pub fn source_tree() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    std::fs::create_dir_all(root.join("src")).unwrap();
    std::fs::write(root.join("src/index.js"), "console.log(1);\n").unwrap();

    std::fs::create_dir_all(root.join("node_modules/left-pad")).unwrap();
    std::fs::write(root.join("node_modules/left-pad/index.js"), "module.exports = 1;\n").unwrap();

    std::fs::create_dir_all(root.join(".git")).unwrap();
    std::fs::write(root.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();

    std::fs::write(root.join(".env"), "SECRET=1\n").unwrap();

    dir
}

/// Context for project `p1` in `org`, deploying `root` to production.
pub fn context(org: &str, root: &Path) -> DeploymentContext {
    DeploymentContext::new(
        ProjectId::new("p1"),
        OrgId::new(org),
        UserId::new("u1"),
        "production",
        SourceRef::Git {
            branch: "main".to_owned(),
            commit: "0123456789abcdef".to_owned(),
            checkout: root.to_path_buf(),
        },
    )
}
