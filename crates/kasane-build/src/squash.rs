//! squash結果のキャッシュ
//!
//! squashすると以降のレイヤーキャッシュが効かなくなるため、
//! squash前のレイヤー範囲をキーに結果イメージを覚えておき、
//! 同じ範囲のsquashは前回の結果へのタグ付けで済ませる。
//!
//! レイヤー範囲はイメージ履歴のコメント `merge {sha} to {sha}` から
//! 復元する。解釈できなければ警告して続行する（キャッシュ層の失敗は
//! ユーザーエラーにしない）。

use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::engine::Engine;
use crate::error::Result;
use crate::staging::{cache_root, copy_tmp_dir};

fn squash_cache_dir() -> PathBuf {
    cache_root().join("squashes")
}

/// squash直後のイメージをキャッシュと突き合わせる
///
/// ヒットしたら前回のsquash結果を `buildname` にタグ付けし直す。
/// キャッシュ済みイメージが消えていたら（prune等）作り直す。
pub async fn resolve_squash_cache(engine: &Engine, buildname: &str) -> Result<()> {
    let history = engine.history(buildname).await?;
    let Some(head) = history.first() else {
        return Ok(());
    };

    let Some((start, end)) = parse_merge_comment(&head.comment) else {
        println!(
            "{}",
            "警告: squash前の履歴を解釈できませんでした。ビルドは続行しますが、以降のレイヤーは再ビルドされます"
                .yellow()
        );
        return Ok(());
    };

    let squashed_sha = head.id.clone();
    println!(
        "  {}",
        format!("レイヤー {} から {} がsquashされました", start, end).yellow()
    );

    let cache_dir = squash_cache_dir();
    std::fs::create_dir_all(&cache_dir)?;
    let cache_path = cache_dir.join(format!(
        "{}-{}",
        start.trim_start_matches("sha256:"),
        end.trim_start_matches("sha256:")
    ));

    if cache_path.exists() {
        let cached = std::fs::read_to_string(&cache_path)?.trim().to_string();
        if engine.image_exists(&cached).await? {
            println!(
                "  {}",
                format!("キャッシュ済みのsquash結果 {} を使用します", cached).yellow()
            );
            engine.tag(&cached, buildname).await?;
            return Ok(());
        }
        println!(
            "  {}",
            format!("以前のキャッシュイメージ {} はもう存在しません", cached).yellow()
        );
    }

    cache_squashed_layer(&cache_path, &squashed_sha)
}

/// squash結果のshaをキャッシュに記録する（temp + atomic rename）
fn cache_squashed_layer(cache_path: &Path, squashed_sha: &str) -> Result<()> {
    println!(
        "  {}",
        format!("新しくビルドしたレイヤー {} を記録します", squashed_sha).yellow()
    );
    let tmp_root = copy_tmp_dir();
    std::fs::create_dir_all(&tmp_root)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&tmp_root)?;
    use std::io::Write;
    tmp.write_all(squashed_sha.as_bytes())?;
    tmp.persist(cache_path)
        .map_err(|e| crate::error::BuildError::Io(e.error))?;
    Ok(())
}

/// `merge {sha} to {sha}` 形式の履歴コメントを解釈する
pub fn parse_merge_comment(comment: &str) -> Option<(String, String)> {
    let words: Vec<&str> = comment.split_whitespace().collect();
    match words.as_slice() {
        ["merge", start, "to", end] => Some((start.to_string(), end.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_merge_comment() {
        let comment = "merge sha256:aaa to sha256:bbb";
        assert_eq!(
            parse_merge_comment(comment),
            Some(("sha256:aaa".to_string(), "sha256:bbb".to_string()))
        );
    }

    #[test]
    fn test_parse_merge_comment_rejects_other_comments() {
        assert_eq!(parse_merge_comment(""), None);
        assert_eq!(parse_merge_comment("buildkit.dockerfile.v0"), None);
        assert_eq!(parse_merge_comment("merge a b c"), None);
        assert_eq!(parse_merge_comment("merge a to b extra"), None);
    }
}
