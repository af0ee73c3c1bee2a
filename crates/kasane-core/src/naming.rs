//! イメージ名の組み立て

/// リポジトリ/タグ指定から最終的なイメージ名を組み立てる
///
/// リポジトリが `:` か `/` で終わる場合はそのまま連結し、
/// それ以外は `/` で区切る。すでに `:` を含む名前にタグを足す場合は
/// `-` で連結する（`elvis/repo:hello-world-1.0` の形式）。
pub fn generate_name(image: &str, repository: Option<&str>, tag: Option<&str>) -> String {
    let mut name = match repository {
        Some(repo) if !repo.is_empty() => {
            if repo.ends_with(':') || repo.ends_with('/') {
                format!("{repo}{image}")
            } else {
                format!("{repo}/{image}")
            }
        }
        _ => image.to_string(),
    };

    if let Some(tag) = tag.filter(|t| !t.is_empty()) {
        if name.contains(':') {
            name.push('-');
        } else {
            name.push(':');
        }
        name.push_str(tag);
    }

    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name() {
        assert_eq!(generate_name("hello", None, None), "hello");
    }

    #[test]
    fn test_repository_prefix() {
        assert_eq!(
            generate_name("hello", Some("quay.io/elvis"), None),
            "quay.io/elvis/hello"
        );
    }

    #[test]
    fn test_repository_as_tag_prefix() {
        assert_eq!(
            generate_name("hello", Some("quay.io/elvis/repo:"), None),
            "quay.io/elvis/repo:hello"
        );
    }

    #[test]
    fn test_tag_appended() {
        assert_eq!(
            generate_name("hello", Some("quay.io/elvis"), Some("1.0")),
            "quay.io/elvis/hello:1.0"
        );
    }

    #[test]
    fn test_tag_appended_with_dash_when_already_tagged() {
        assert_eq!(
            generate_name("hello", Some("quay.io/elvis/repo:"), Some("1.0")),
            "quay.io/elvis/repo:hello-1.0"
        );
    }
}
