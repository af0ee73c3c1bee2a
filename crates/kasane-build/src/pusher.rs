//! イメージプッシュ処理
//!
//! ビルドしたイメージをコンテナレジストリにプッシュします。
//! 認証情報は `~/.docker/config.json` から取得します。

use colored::Colorize;
use futures_util::StreamExt;

use crate::engine::{Engine, split_image_tag};
use crate::error::{BuildError, Result};

/// Docker config.json からレジストリの認証情報を取得
pub fn get_docker_credentials(registry: &str) -> Option<bollard::auth::DockerCredentials> {
    let home = std::env::var("HOME").ok()?;
    let config_path = format!("{}/.docker/config.json", home);
    let config_content = std::fs::read_to_string(&config_path).ok()?;
    let config: serde_json::Value = serde_json::from_str(&config_content).ok()?;

    let auths = config.get("auths")?.as_object()?;
    let auth_entry = auths.get(registry)?;
    let auth_b64 = auth_entry.get("auth")?.as_str()?;

    // Base64 デコード (username:password 形式)
    use base64::Engine as _;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64)
        .ok()?;
    let auth_str = String::from_utf8(decoded).ok()?;
    let (username, password) = auth_str.split_once(':')?;

    Some(bollard::auth::DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    })
}

/// イメージ名からレジストリを抽出
///
/// 最初の `/` の前の要素が `.` か `:` を含む場合だけレジストリとみなす
/// （例: ghcr.io, localhost:5000）。
pub fn extract_registry(image: &str) -> Option<&str> {
    let first = image.split('/').next()?;
    if first != image && (first.contains('.') || first.contains(':')) {
        Some(first)
    } else {
        None
    }
}

/// イメージをレジストリにプッシュ
///
/// リポジトリ名にレジストリURLが含まれない場合はプッシュせず警告を返す。
/// 戻り値は (成功したか, 警告のリスト)。
pub async fn push(engine: &Engine, name: &str) -> Result<(bool, Vec<String>)> {
    let mut warnings = Vec::new();

    let Some(registry) = extract_registry(name) else {
        let warning = format!(
            "警告: {} をプッシュできません - リポジトリ名にレジストリURLが含まれていません",
            name
        );
        println!("{}", warning.yellow());
        warnings.push(warning);
        return Ok((false, warnings));
    };

    println!("  {} {} → {}", "プッシュ中:".cyan(), name, registry);

    let credentials = get_docker_credentials(registry);
    let (image, tag) = split_image_tag(name);

    #[allow(deprecated)]
    let options = bollard::image::PushImageOptions::<String> {
        tag: tag.to_string(),
    };

    #[allow(deprecated)]
    let mut stream = engine.docker.push_image(image, Some(options), credentials);

    let mut error_message: Option<String> = None;
    while let Some(result) = stream.next().await {
        match result {
            Ok(info) => {
                if let Some(err) = info.error {
                    error_message = Some(err);
                } else if let Some(status) = info.status {
                    tracing::debug!("push {}: {}", name, status);
                }
            }
            Err(e) => {
                return Err(BuildError::PushFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    if let Some(err) = error_message {
        let warning = format!("警告: {} のプッシュに失敗しました。メッセージ: {}", name, err);
        println!("{}", warning.yellow());
        warnings.push(warning);
        return Ok((false, warnings));
    }

    Ok((true, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_registry() {
        assert_eq!(extract_registry("ghcr.io/owner/repo:tag"), Some("ghcr.io"));
        assert_eq!(extract_registry("localhost:5000/app"), Some("localhost:5000"));
        assert_eq!(extract_registry("elvis/hello"), None);
        assert_eq!(extract_registry("hello"), None);
    }
}
