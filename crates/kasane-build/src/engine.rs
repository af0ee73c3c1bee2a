//! ビルドエンジン（Docker）のラッパー
//!
//! コアはこのインターフェースだけを知っていればよい。
//! コンテキストを渡してビルドし、タグ付け・削除・pull・履歴取得・
//! コンテナからのアーカイブ取得を提供する。

use std::collections::HashMap;

use bollard::Docker;
use bollard::image::BuildImageOptions;
use colored::Colorize;
use futures_util::stream::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{BuildError, Result};
use crate::progress::PullProgress;

/// 1回のビルド呼び出しのオプション
#[derive(Debug, Clone, Default)]
pub struct BuildOpts {
    /// ビルド結果に付けるタグ
    pub tag: String,
    /// レイヤーキャッシュを使わない
    pub nocache: bool,
    /// ベースイメージを毎回pullし直す
    pub pull: bool,
    /// レイヤーをsquashする（experimentalデーモンが必要）
    pub squash: bool,
    /// キャッシュのシードに使う候補イメージ
    pub cache_from: Vec<String>,
    pub build_args: HashMap<String, String>,
}

pub struct Engine {
    pub(crate) docker: Docker,
}

impl Engine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BuildError::DockerConnectionFailed(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// tar.gz形式のビルドコンテキストからイメージをビルドする
    pub async fn build(&self, context: Vec<u8>, opts: &BuildOpts) -> Result<()> {
        tracing::debug!("Building image: {} (nocache={})", opts.tag, opts.nocache);

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: opts.tag.clone(),
            nocache: opts.nocache,
            pull: opts.pull,
            squash: opts.squash,
            cachefrom: opts.cache_from.clone(),
            buildargs: opts.build_args.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        use bytes::Bytes;
        use http_body_util::{Either, Full};
        let body = Full::new(Bytes::from(context));
        let mut stream = self.docker.build_image(options, None, Some(Either::Left(body)));

        while let Some(msg) = stream.next().await {
            self.handle_build_output(msg?)?;
        }

        tracing::debug!("Successfully built: {}", opts.tag);
        Ok(())
    }

    /// ビルド出力の処理
    fn handle_build_output(&self, output: bollard::models::BuildInfo) -> Result<()> {
        if let Some(stream) = output.stream {
            print!("{}", stream);
        }

        if let Some(error) = output.error {
            return Err(BuildError::DockerApi(error));
        }

        if let Some(error_detail) = output.error_detail {
            let message = error_detail
                .message
                .unwrap_or_else(|| "Unknown build error".to_string());
            return Err(BuildError::DockerApi(message));
        }

        if let Some(status) = output.status {
            println!("{}", status.cyan());
        }

        Ok(())
    }

    /// イメージの存在確認
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// イメージのコンテンツダイジェスト（`sha256:` なし）
    pub async fn image_digest(&self, image: &str) -> Result<String> {
        let inspect = self.docker.inspect_image(image).await?;
        let id = inspect
            .id
            .ok_or_else(|| BuildError::DockerApi(format!("イメージ {} にIDがありません", image)))?;
        Ok(id.trim_start_matches("sha256:").to_string())
    }

    /// `image` に `name` のタグを付ける
    pub async fn tag(&self, image: &str, name: &str) -> Result<()> {
        let (repo, tag) = split_image_tag(name);
        #[allow(deprecated)]
        let options = bollard::image::TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        #[allow(deprecated)]
        self.docker.tag_image(image, Some(options)).await?;
        Ok(())
    }

    /// イメージのタグを外す（中間タグの掃除用）
    pub async fn remove_image(&self, name: &str) -> Result<()> {
        #[allow(deprecated)]
        let options = bollard::image::RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_image(name, Some(options), None).await?;
        Ok(())
    }

    /// イメージをpullする
    pub async fn pull(&self, image: &str) -> Result<()> {
        let (name, tag) = split_image_tag(image);
        let progress = PullProgress::new(image);

        #[allow(deprecated)]
        let options = bollard::image::CreateImageOptions {
            from_image: name,
            tag,
            ..Default::default()
        };

        #[allow(deprecated)]
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(info) = stream.next().await {
            let info = info?;
            if let Some(error) = info.error {
                progress.finish_error(&error);
                return Err(BuildError::DockerApi(error));
            }
            if let Some(status) = info.status {
                progress.set_message(&status);
            }
        }

        progress.finish();
        Ok(())
    }

    /// イメージのレイヤー履歴。先頭が最新レイヤー
    pub async fn history(&self, image: &str) -> Result<Vec<bollard::models::HistoryResponseItem>> {
        Ok(self.docker.image_history(image).await?)
    }

    /// イメージ内のパスをtarアーカイブとして `dest` に書き出す
    ///
    /// 使い捨てコンテナを作って中身を取り出す。パスが存在しなければ
    /// `MissingFile`。コンテナは成否にかかわらず削除する。
    pub async fn export_path(
        &self,
        image: &str,
        path: &str,
        dest: &std::path::Path,
    ) -> Result<()> {
        #[allow(deprecated)]
        let container = self
            .docker
            .create_container(
                None::<bollard::container::CreateContainerOptions<String>>,
                bollard::container::Config {
                    image: Some(image.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let result = self.download_archive(&container.id, image, path, dest).await;

        #[allow(deprecated)]
        let remove = self
            .docker
            .remove_container(
                &container.id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = remove {
            tracing::warn!("一時コンテナ {} を削除できませんでした: {}", container.id, e);
        }

        result
    }

    async fn download_archive(
        &self,
        container_id: &str,
        image: &str,
        path: &str,
        dest: &std::path::Path,
    ) -> Result<()> {
        #[allow(deprecated)]
        let options = bollard::container::DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(container_id, Some(options));

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => file.write_all(&bytes).await?,
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(BuildError::MissingFile {
                        path: path.to_string(),
                        image: image.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// デーモンがexperimentalモードか
    pub async fn is_experimental(&self) -> bool {
        match self.docker.version().await {
            Ok(version) => version.experimental.unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// イメージ名をリポジトリとタグに分ける
///
/// タグ区切りの `:` は最後の `/` より後ろにあるものだけを見る
/// （`localhost:5000/app` のポート番号を誤認しないため）。
pub fn split_image_tag(name: &str) -> (&str, &str) {
    let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[slash..].rfind(':') {
        Some(colon) => {
            let colon = slash + colon;
            (&name[..colon], &name[colon + 1..])
        }
        None => (name, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_tag() {
        assert_eq!(split_image_tag("redis:7-alpine"), ("redis", "7-alpine"));
        assert_eq!(split_image_tag("postgres"), ("postgres", "latest"));
        assert_eq!(
            split_image_tag("localhost:5000/app"),
            ("localhost:5000/app", "latest")
        );
        assert_eq!(
            split_image_tag("localhost:5000/app:1.0"),
            ("localhost:5000/app", "1.0")
        );
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_build_simple_image() {
        let engine = Engine::connect().unwrap();
        let context = crate::context::create_context(
            "FROM alpine:latest\nCMD echo 'test'",
            None,
            None,
        )
        .unwrap();

        let opts = BuildOpts {
            tag: "kasane-test:latest".to_string(),
            ..Default::default()
        };
        engine.build(context, &opts).await.unwrap();
        assert!(engine.image_exists("kasane-test:latest").await.unwrap());

        engine.remove_image("kasane-test:latest").await.ok();
    }
}
