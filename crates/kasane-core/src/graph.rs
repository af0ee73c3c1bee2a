//! 依存グラフの解決
//!
//! `requires` の推移閉包からスタック全体の外部ベースを一意に決め、
//! ビルド順をトポロジカルソートで確定する。

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::defs::ImageDefs;
use crate::error::{DefError, Result};

/// スタックの根として使う外部Dockerfileへの参照
///
/// 同一パスへの参照は [`DockerfileRegistry`] でメモ化され、
/// 複数スタックから依存されても一度しかビルドされない。
/// ビルド済みかどうかの状態はエグゼキュータのセッションが持つ。
#[derive(Debug)]
pub struct ExternalDockerfile {
    pub path: PathBuf,
    /// ビルド結果に付ける一意なタグ
    pub tag: String,
}

impl ExternalDockerfile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            tag: format!("kasane_extbase_{}", Uuid::new_v4().simple()),
        }
    }
}

impl PartialEq for ExternalDockerfile {
    /// 同一性は解決済みパスで決まる（タグは毎回生成される）
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl fmt::Display for ExternalDockerfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dockerfile at {}", self.path.display())
    }
}

/// スタックの最初のレイヤーを与える外部ベース
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalBase {
    /// 普通のイメージ参照（`FROM` フィールド）
    Image(String),
    /// 外部Dockerfile（`FROM_DOCKERFILE` フィールド）
    Dockerfile(Arc<ExternalDockerfile>),
}

impl ExternalBase {
    /// 最初のステップが `FROM` に使うイメージ名
    pub fn tag(&self) -> &str {
        match self {
            ExternalBase::Image(name) => name,
            ExternalBase::Dockerfile(df) => &df.tag,
        }
    }
}

impl fmt::Display for ExternalBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalBase::Image(name) => f.write_str(name),
            ExternalBase::Dockerfile(df) => df.fmt(f),
        }
    }
}

/// 外部Dockerfile参照のパス単位のメモ化
#[derive(Debug, Default)]
pub struct DockerfileRegistry {
    entries: HashMap<PathBuf, Arc<ExternalDockerfile>>,
}

impl DockerfileRegistry {
    pub fn get_or_insert(&mut self, path: &Path) -> Arc<ExternalDockerfile> {
        self.entries
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(ExternalDockerfile::new(path)))
            .clone()
    }
}

impl ImageDefs {
    /// `requires` の推移閉包から唯一の外部ベースを決定する
    ///
    /// どこにも見つからなければ `Ok(None)`（`NoBase` にするかは呼び出し側）。
    /// 異なるベースが2つ見つかれば `ConflictingBase`、
    /// 巡回があれば `CircularDependency`。
    pub fn resolve_external_base(&mut self, image: &str) -> Result<Option<ExternalBase>> {
        let mut stack = Vec::new();
        self.walk_external_base(image, &mut stack)
    }

    fn walk_external_base(
        &mut self,
        image: &str,
        stack: &mut Vec<String>,
    ) -> Result<Option<ExternalBase>> {
        if stack.iter().any(|s| s == image) {
            stack.push(image.to_string());
            return Err(DefError::CircularDependency {
                cycle: stack.join(" -> "),
            });
        }
        stack.push(image.to_string());

        let referenced_by = stack.len().checked_sub(2).map(|i| stack[i].clone());
        let (from, from_dockerfile, requires) = {
            let def = self.def(image, referenced_by.as_deref())?;
            (
                def.from.clone(),
                def.from_dockerfile.clone(),
                def.requires()?,
            )
        };

        if from.is_some() && from_dockerfile.is_some() {
            return Err(DefError::MultipleBase {
                image: image.to_string(),
            });
        }

        let mut external = match (from, from_dockerfile) {
            (Some(name), None) => Some(ExternalBase::Image(name)),
            (None, Some(path)) => Some(ExternalBase::Dockerfile(
                self.dockerfiles.get_or_insert(&path),
            )),
            _ => None,
        };

        for dep in requires {
            let other = self.walk_external_base(&dep, stack)?;
            match (&external, other) {
                (_, None) => {}
                (None, Some(other)) => external = Some(other),
                (Some(current), Some(other)) if *current == other => {}
                (Some(current), Some(other)) => {
                    return Err(DefError::ConflictingBase {
                        image: image.to_string(),
                        base: current.to_string(),
                        other_image: dep,
                        other_base: other.to_string(),
                    });
                }
            }
        }

        stack.pop();
        Ok(external)
    }

    /// `requires` をトポロジカルソートしたビルド順を返す
    ///
    /// 深さ優先の後行順。依存が先、依存元が後。各名前は一度だけ現れる。
    /// 巡回は通常 [`Self::resolve_external_base`] が先に検出するが、
    /// ここでも無限再帰しないよう防御的に検査する。
    pub fn sort_dependencies(&self, image: &str) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut active = Vec::new();
        self.visit_dependencies(image, &mut order, &mut active)?;
        Ok(order)
    }

    fn visit_dependencies(
        &self,
        image: &str,
        order: &mut Vec<String>,
        active: &mut Vec<String>,
    ) -> Result<()> {
        if order.iter().any(|s| s == image) {
            return Ok(());
        }
        if active.iter().any(|s| s == image) {
            active.push(image.to_string());
            return Err(DefError::CircularDependency {
                cycle: active.join(" -> "),
            });
        }
        active.push(image.to_string());

        let referenced_by = active.len().checked_sub(2).map(|i| active[i].clone());
        let requires = self.def(image, referenced_by.as_deref())?.requires()?;
        for dep in requires {
            self.visit_dependencies(&dep, order, active)?;
        }

        active.pop();
        order.push(image.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::load_yaml;

    #[test]
    fn test_single_base_resolved() {
        let (_dir, mut defs) = load_yaml(
            r#"
base:
  FROM: x
a:
  requires: [base]
  build: A
b:
  requires: [base]
  build: B
c:
  requires: [a, b]
"#,
        );
        let base = defs.resolve_external_base("c").unwrap().unwrap();
        assert_eq!(base, ExternalBase::Image("x".to_string()));
    }

    #[test]
    fn test_sort_is_topological() {
        let (_dir, defs) = load_yaml(
            r#"
base:
  FROM: x
a:
  requires: [base]
b:
  requires: [base]
c:
  requires: [a, b]
"#,
        );
        let order = defs.sort_dependencies("c").unwrap();
        assert_eq!(order, vec!["base", "a", "b", "c"]);

        // 各名前は一度だけ、依存より後に現れる
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("base") < pos("a"));
        assert!(pos("base") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_duplicate_requires_collapsed() {
        let (_dir, defs) = load_yaml(
            r#"
base:
  FROM: x
a:
  requires: [base, base]
"#,
        );
        assert_eq!(defs.sort_dependencies("a").unwrap(), vec!["base", "a"]);
    }

    #[test]
    fn test_circular_requires() {
        let (_dir, mut defs) = load_yaml(
            r#"
x:
  requires: [y]
y:
  requires: [x]
"#,
        );
        let err = defs.resolve_external_base("x").unwrap_err();
        match &err {
            DefError::CircularDependency { cycle } => {
                assert_eq!(cycle, "x -> y -> x");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.exit_code(), 45);

        // ソート側の防御的検出も無限再帰しない
        assert!(matches!(
            defs.sort_dependencies("x").unwrap_err(),
            DefError::CircularDependency { .. }
        ));
    }

    #[test]
    fn test_conflicting_bases() {
        let (_dir, mut defs) = load_yaml(
            r#"
a:
  FROM: img1
b:
  FROM: img2
c:
  requires: [a, b]
"#,
        );
        let err = defs.resolve_external_base("c").unwrap_err();
        match &err {
            DefError::ConflictingBase {
                base, other_base, ..
            } => {
                assert_eq!(base, "img1");
                assert_eq!(other_base, "img2");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.exit_code(), 41);
    }

    #[test]
    fn test_same_base_via_two_paths_is_not_conflict() {
        let (_dir, mut defs) = load_yaml(
            r#"
base:
  FROM: x
a:
  requires: [base]
b:
  requires: [base]
c:
  requires: [a, b]
"#,
        );
        assert!(defs.resolve_external_base("c").unwrap().is_some());
    }

    #[test]
    fn test_multiple_base_fields() {
        let (_dir, mut defs) = load_yaml(
            r#"
a:
  FROM: img1
  FROM_DOCKERFILE: ./Dockerfile
"#,
        );
        let err = defs.resolve_external_base("a").unwrap_err();
        assert!(matches!(err, DefError::MultipleBase { .. }));
        assert_eq!(err.exit_code(), 40);
    }

    #[test]
    fn test_no_base_returns_none() {
        let (_dir, mut defs) = load_yaml("a:\n  build: RUN true\n");
        assert!(defs.resolve_external_base("a").unwrap().is_none());
    }

    #[test]
    fn test_dockerfile_registry_memoizes_by_path() {
        let mut registry = DockerfileRegistry::default();
        let first = registry.get_or_insert(Path::new("/tmp/Dockerfile"));
        let second = registry.get_or_insert(Path::new("/tmp/Dockerfile"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.tag, second.tag);

        let other = registry.get_or_insert(Path::new("/tmp/other/Dockerfile"));
        assert_ne!(first.tag, other.tag);
    }

    #[test]
    fn test_shared_dockerfile_base_is_equal_across_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(
            dir.path().join("kasane.yml"),
            r#"
root:
  FROM_DOCKERFILE: ./Dockerfile
a:
  requires: [root]
b:
  requires: [root]
c:
  requires: [a, b]
"#,
        )
        .unwrap();
        let mut defs = crate::ImageDefs::load(dir.path().join("kasane.yml")).unwrap();
        // 同じDockerfileに収束するので競合にならない
        let base = defs.resolve_external_base("c").unwrap().unwrap();
        assert!(matches!(base, ExternalBase::Dockerfile(_)));
    }
}
