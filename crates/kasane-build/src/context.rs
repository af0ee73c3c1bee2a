//! ビルドコンテキストの組み立て
//!
//! レンダリング済みのDockerfileを `Dockerfile` として注入した
//! tar.gzアーカイブを作る。コンテキストディレクトリがある場合は
//! 除外パターンを適用しながらツリーを追加する。

use std::fs::File;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use glob::Pattern;
use tar::Builder;

use crate::error::{BuildError, Result};

/// ビルドコンテキストをtar.gzアーカイブとして作成
pub fn create_context(
    dockerfile: &str,
    context_dir: Option<&Path>,
    exclude: Option<&[String]>,
) -> Result<Vec<u8>> {
    let mut archive_data = Vec::new();
    {
        let encoder = GzEncoder::new(&mut archive_data, Compression::default());
        let mut tar = Builder::new(encoder);

        if let Some(dir) = context_dir {
            if !dir.is_dir() {
                return Err(BuildError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "ビルドコンテキスト {} がディレクトリではありません",
                        dir.display()
                    ),
                )));
            }
            let patterns = compile_patterns(exclude.unwrap_or(&[]));
            tracing::debug!("Creating build context from: {}", dir.display());
            add_dir(&mut tar, dir, dir, &patterns)?;
        }

        // Dockerfileを "Dockerfile" として注入する。
        // ディレクトリ内の同名ファイルより後に追加されたものが優先される
        let content = dockerfile.as_bytes();
        let mut header = tar::Header::new_gnu();
        header
            .set_path("Dockerfile")
            .map_err(BuildError::Io)?;
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, content).map_err(BuildError::Io)?;

        tar.finish().map_err(BuildError::Io)?;
    }

    tracing::debug!("Build context created: {} bytes", archive_data.len());
    Ok(archive_data)
}

fn compile_patterns(exclude: &[String]) -> Vec<Pattern> {
    exclude
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!("除外パターン \"{}\" を解釈できません: {}", p, e);
                None
            }
        })
        .collect()
}

/// 相対パスまたはその祖先がパターンに一致すれば除外
fn is_excluded(rel: &Path, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|pattern| {
        rel.ancestors()
            .filter(|a| !a.as_os_str().is_empty())
            .any(|a| pattern.matches_path(a))
    })
}

fn add_dir(
    tar: &mut Builder<GzEncoder<&mut Vec<u8>>>,
    root: &Path,
    dir: &Path,
    patterns: &[Pattern],
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        let rel = path
            .strip_prefix(root)
            .map_err(|e| BuildError::DockerApi(e.to_string()))?
            .to_path_buf();
        if is_excluded(&rel, patterns) {
            tracing::debug!("コンテキストから除外: {}", rel.display());
            continue;
        }

        if path.is_dir() {
            tar.append_dir(&rel, &path).map_err(BuildError::Io)?;
            add_dir(tar, root, &path, patterns)?;
        } else {
            let mut file = File::open(&path)?;
            tar.append_file(&rel, &mut file).map_err(BuildError::Io)?;
        }
    }
    Ok(())
}
