//! イメージ定義ストア
//!
//! YAMLの定義ファイルを読み込み、`_SOURCES_` の再帰マージと
//! フィールド検証を済ませたフラットなマッピングとして保持する。

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{DefError, Result};
use crate::graph::DockerfileRegistry;

/// トップレベルの予約キー
pub const SPECIAL_FIELDS: [&str; 2] = ["_ALL_", "_SOURCES_"];

const RECOGNIZED_KEYS: [&str; 9] = [
    "requires",
    "build",
    "build_directory",
    "FROM",
    "FROM_DOCKERFILE",
    "copy_from",
    "ignore",
    "ignore_file",
    "description",
];

/// `copy_from` の1ソースイメージ分の指定
#[derive(Debug, Clone, PartialEq)]
pub struct CopySpec {
    pub source_image: String,
    /// (ソースイメージ内のパス, コピー先パス)
    pub files: Vec<(String, String)>,
}

/// 1イメージ分の定義
///
/// フィールドはクローズドなスキーマとして型で表現する。
/// `requires` だけは「リストでない」ことを専用エラーで報告するため、
/// 生のYAML値のまま保持して参照時に検査する。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageDef {
    #[serde(default)]
    requires: Option<Value>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub build_directory: Option<PathBuf>,
    #[serde(default, rename = "FROM")]
    pub from: Option<String>,
    #[serde(default, rename = "FROM_DOCKERFILE")]
    pub from_dockerfile: Option<PathBuf>,
    #[serde(default)]
    copy_from: Option<Value>,
    #[serde(default)]
    pub ignore: Option<String>,
    #[serde(default)]
    pub ignore_file: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,

    /// このイメージ自身の名前（読み込み時に設定）
    #[serde(skip)]
    pub name: String,
    /// どの定義ファイルで宣言されたか（診断用）
    #[serde(skip)]
    pub source_file: PathBuf,
    #[serde(skip)]
    copy_specs: Vec<CopySpec>,
}

impl ImageDef {
    /// `requires` をリストとして取り出す
    pub fn requires(&self) -> Result<Vec<String>> {
        match &self.requires {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Sequence(seq)) => seq
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| DefError::InvalidRequiresList {
                            image: self.name.clone(),
                        })
                })
                .collect(),
            Some(_) => Err(DefError::InvalidRequiresList {
                image: self.name.clone(),
            }),
        }
    }

    /// 検証済みの `copy_from` 指定
    pub fn copy_specs(&self) -> &[CopySpec] {
        &self.copy_specs
    }

    /// ビルドコンテキストの除外パターン
    ///
    /// `ignore` はインライン指定、`ignore_file` はファイル参照。
    /// 両立しないことは読み込み時に検証済み。
    pub fn exclude_patterns(&self) -> Result<Option<Vec<String>>> {
        let lines: Vec<String> = if let Some(text) = &self.ignore {
            text.lines().map(str::to_owned).collect()
        } else if let Some(path) = &self.ignore_file {
            std::fs::read_to_string(path)
                .map_err(|e| DefError::ParsingFailure {
                    message: format!("ignore_file {} を読めません: {}", path.display(), e),
                })?
                .lines()
                .map(str::to_owned)
                .collect()
        } else {
            return Ok(None);
        };

        Ok(Some(lines.into_iter().filter(|l| !l.is_empty()).collect()))
    }

    /// 読み込み直後の検証とパス解決
    fn finalize(&mut self, name: &str, file: &Path, base_dir: &Path) -> Result<()> {
        self.name = name.to_string();
        self.source_file = file.to_path_buf();

        if self.ignore.is_some() && self.ignore_file.is_some() {
            return Err(DefError::MultipleIgnore {
                image: name.to_string(),
            });
        }

        // `~` はホームに展開し、相対パスは宣言したファイルのある
        // ディレクトリ基準で解決する
        for path in [
            self.build_directory.as_mut(),
            self.from_dockerfile.as_mut(),
            self.ignore_file.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(expanded) = expand_home(path) {
                *path = expanded;
            } else if path.is_relative() {
                let resolved = base_dir.join(path.as_path());
                *path = resolved;
            }
        }

        self.copy_specs = match self.copy_from.take() {
            None => Vec::new(),
            Some(Value::Mapping(map)) => {
                let mut specs = Vec::new();
                for (source, files) in map {
                    let source_image =
                        source
                            .as_str()
                            .map(str::to_owned)
                            .ok_or_else(|| DefError::ParsingFailure {
                                message: format!(
                                    "{} の copy_from のキーが文字列ではありません",
                                    name
                                ),
                            })?;
                    let Value::Mapping(files) = files else {
                        return Err(DefError::ParsingFailure {
                            message: format!(
                                "{} . copy_from . {} の各要素は \"ソースパス: コピー先\" の形式で指定してください（ファイル: {}）",
                                name,
                                source_image,
                                file.display()
                            ),
                        });
                    };
                    let mut entries = Vec::new();
                    for (src, dest) in files {
                        match (src.as_str(), dest.as_str()) {
                            (Some(s), Some(d)) => entries.push((s.to_owned(), d.to_owned())),
                            _ => {
                                return Err(DefError::ParsingFailure {
                                    message: format!(
                                        "{} . copy_from . {} のパス指定が文字列ではありません",
                                        name, source_image
                                    ),
                                });
                            }
                        }
                    }
                    specs.push(CopySpec {
                        source_image,
                        files: entries,
                    });
                }
                specs
            }
            Some(_) => {
                return Err(DefError::ParsingFailure {
                    message: format!(
                        "ファイル \"{}\" のイメージ定義 \"{}\" の copy_from が key:value のマッピングではありません",
                        file.display(),
                        name
                    ),
                });
            }
        };

        Ok(())
    }
}

/// 検証済みイメージ定義のマッピング
#[derive(Debug)]
pub struct ImageDefs {
    pub makefile_path: PathBuf,
    /// `_ALL_` で指定された「全部ビルド」時のターゲット
    pub all_targets: Vec<String>,
    pub(crate) defs: BTreeMap<String, ImageDef>,
    pub(crate) dockerfiles: DockerfileRegistry,
}

impl ImageDefs {
    /// 定義ファイルを読み込む
    ///
    /// `_SOURCES_` を再帰的にマージし、同名エントリは後から読んだものが勝つ。
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = expand_home(path).unwrap_or_else(|| path.to_path_buf());
        let mut loading = HashSet::new();
        let mut defs = BTreeMap::new();
        let mut all_targets = Vec::new();
        load_file(&path, &mut loading, &mut defs, &mut all_targets)?;

        tracing::debug!(
            "{} 件のイメージ定義を読み込みました: {}",
            defs.len(),
            path.display()
        );

        Ok(Self {
            makefile_path: path,
            all_targets,
            defs,
            dockerfiles: DockerfileRegistry::default(),
        })
    }

    /// 定義済みイメージ名（ソート済み）
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    /// イメージ定義を引く。存在しない場合は参照元つきのエラー
    pub fn def(&self, name: &str, referenced_by: Option<&str>) -> Result<&ImageDef> {
        self.defs
            .get(name)
            .ok_or_else(|| DefError::UnknownComponent {
                name: name.to_string(),
                referenced_by: referenced_by.unwrap_or("コマンドライン引数").to_string(),
            })
    }

    /// `--requires/--name` 用のアドホックなターゲットを合成する
    pub fn add_synthetic_target(&mut self, name: &str, requires: Vec<String>) -> Result<()> {
        if self.defs.contains_key(name) {
            return Err(DefError::ParsingFailure {
                message: format!("イメージ \"{}\" は定義ファイル内に既に存在します", name),
            });
        }
        let def = ImageDef {
            requires: Some(Value::Sequence(
                requires.into_iter().map(Value::String).collect(),
            )),
            name: name.to_string(),
            source_file: PathBuf::from("コマンドライン引数"),
            ..Default::default()
        };
        self.defs.insert(name.to_string(), def);
        Ok(())
    }
}

fn load_file(
    file: &Path,
    loading: &mut HashSet<PathBuf>,
    out: &mut BTreeMap<String, ImageDef>,
    all_targets: &mut Vec<String>,
) -> Result<()> {
    let canonical = file
        .canonicalize()
        .map_err(|e| DefError::ParsingFailure {
            message: format!("{} を読めません: {}", file.display(), e),
        })?;

    if !loading.insert(canonical.clone()) {
        return Err(DefError::CircularSources {
            path: file.to_path_buf(),
        });
    }

    tracing::info!("読み込み中: {}", file.display());

    let text = std::fs::read_to_string(&canonical).map_err(|e| DefError::ParsingFailure {
        message: format!("{} を読めません: {}", file.display(), e),
    })?;
    let mapping: serde_yaml::Mapping =
        serde_yaml::from_str(&text).map_err(|e| DefError::ParsingFailure {
            message: format!("{} の解析に失敗しました: {}", file.display(), e),
        })?;

    let base_dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    // _SOURCES_ を先に取り込む。自ファイルの定義が後勝ちでマージされる
    if let Some(sources) = mapping.get("_SOURCES_") {
        for source in string_list(sources, file, "_SOURCES_")? {
            let mut path = PathBuf::from(source);
            if let Some(expanded) = expand_home(&path) {
                path = expanded;
            } else if path.is_relative() {
                path = base_dir.join(path);
            }
            load_file(&path, loading, out, all_targets)?;
        }
    }

    if let Some(all) = mapping.get("_ALL_") {
        *all_targets = string_list(all, file, "_ALL_")?;
    }

    for (key, value) in &mapping {
        let name = key.as_str().ok_or_else(|| DefError::ParsingFailure {
            message: format!(
                "{} のトップレベルキーが文字列ではありません",
                file.display()
            ),
        })?;
        if SPECIAL_FIELDS.contains(&name) {
            continue;
        }

        let Value::Mapping(fields) = value else {
            return Err(DefError::ParsingFailure {
                message: format!(
                    "ファイル \"{}\" のイメージ定義 \"{}\" がマッピングではありません",
                    file.display(),
                    name
                ),
            });
        };

        for field in fields.keys() {
            // 文字列でないキー（数値など）もそのままの表記で報告する
            let Some(field) = field.as_str() else {
                return Err(DefError::UnrecognizedField {
                    field: serde_yaml::to_string(field)
                        .map(|s| s.trim().to_owned())
                        .unwrap_or_else(|_| format!("{field:?}")),
                    image: name.to_string(),
                    file: file.to_path_buf(),
                });
            };
            if !RECOGNIZED_KEYS.contains(&field) {
                return Err(DefError::UnrecognizedField {
                    field: field.to_string(),
                    image: name.to_string(),
                    file: file.to_path_buf(),
                });
            }
        }

        let mut def: ImageDef =
            serde_yaml::from_value(value.clone()).map_err(|e| DefError::ParsingFailure {
                message: format!(
                    "ファイル \"{}\" のイメージ定義 \"{}\" を解析できません: {}",
                    file.display(),
                    name,
                    e
                ),
            })?;
        def.finalize(name, file, &base_dir)?;
        out.insert(name.to_string(), def);
    }

    loading.remove(&canonical);
    Ok(())
}

/// 先頭の `~` をホームディレクトリに展開する
fn expand_home(path: &Path) -> Option<PathBuf> {
    let rest = path.strip_prefix("~").ok()?;
    Some(dirs::home_dir()?.join(rest))
}

fn string_list(value: &Value, file: &Path, key: &str) -> Result<Vec<String>> {
    let Value::Sequence(seq) = value else {
        return Err(DefError::ParsingFailure {
            message: format!("{} の {} はリストで指定してください", file.display(), key),
        });
    };
    seq.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| DefError::ParsingFailure {
                    message: format!(
                        "{} の {} の要素が文字列ではありません",
                        file.display(),
                        key
                    ),
                })
        })
        .collect()
}
