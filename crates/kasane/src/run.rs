//! CLIのコマンド実行本体
//!
//! フラグを解釈し、定義の読み込み → プランのコンパイル → ビルド実行
//! の順で進める。構造エラーはエンジンに触れる前にすべて出し切る。

use anyhow::Result;
use colored::Colorize;
use kasane_build::{Engine, ExecuteOptions, Executor};
use kasane_core::{BuildTarget, ImageDefs, PlanOptions, generate_name};

use crate::cli::Cli;

pub async fn run(cli: Cli) -> Result<()> {
    if cli.clear_copy_cache {
        let removed = kasane_build::clear_copy_cache()?;
        if removed.is_empty() {
            println!("削除するキャッシュはありませんでした");
        } else {
            for dir in removed {
                println!("{} {}", "削除しました:".green(), dir.display());
            }
        }
        return Ok(());
    }

    let mut defs = ImageDefs::load(&cli.makefile)?;

    if cli.list {
        print_target_list(&defs);
        return Ok(());
    }

    if let Some(name) = &cli.name {
        defs.add_synthetic_target(name, cli.requires.clone())?;
    }

    let targets = select_targets(&cli, &defs);
    if targets.is_empty() {
        println!(
            "{}",
            "ビルドするターゲットが指定されていません（--all で全ターゲットをビルドできます）"
                .yellow()
        );
        print_target_list(&defs);
        return Ok(());
    }

    // ターゲットの実在チェックはプラン構築に先立って行う
    for target in &targets {
        defs.def(target, None)?;
    }

    if cli.push && cli.repository.is_none() {
        return Err(kasane_build::BuildError::NoRegistry.into());
    }

    // --secret-file は --squash を含む
    let plan_opts = PlanOptions {
        squash: cli.squash || !cli.secret_files.is_empty(),
        secret_files: cli.secret_files.clone(),
        cache_repo: cli.cache_repo.clone(),
        cache_tag: cli.cache_tag.clone(),
    };

    // 全ターゲットのプランを先にコンパイルする。
    // どれか1つでも構造エラーがあれば何もビルドしない
    let mut plans: Vec<BuildTarget> = Vec::new();
    for target in &targets {
        let name = generate_name(target, cli.repository.as_deref(), cli.tag.as_deref());
        plans.push(defs.generate_build(target, &name, &cli.bust_cache, &plan_opts)?);
    }

    if cli.no_build {
        for plan in &plans {
            let path = plan.write_dockerfile(&cli.dockerfile_dir)?;
            println!("{} {}", "書き出しました:".green(), path.display());
        }
        println!(
            "{}",
            "--no-build が指定されているためビルドをスキップします".yellow()
        );
        return Ok(());
    }

    let engine = Engine::connect()?;
    let exec_opts = ExecuteOptions {
        usecache: !cli.no_cache,
        pull: cli.pull,
        keep_build_tags: cli.keep_build_tags,
    };
    let mut executor = Executor::new(&engine, exec_opts);

    let mut built = Vec::new();
    let mut warnings = Vec::new();
    for plan in &plans {
        let name = executor.execute(plan).await?;

        // Dockerfileはビルドが成功したターゲットの分だけ書き出す
        if cli.print_dockerfiles {
            let path = plan.write_dockerfile(&cli.dockerfile_dir)?;
            println!("{} {}", "書き出しました:".green(), path.display());
        }

        if cli.push {
            let (pushed, push_warnings) = kasane_build::push(&engine, &name).await?;
            warnings.extend(push_warnings);
            if pushed {
                println!("{} {}", "プッシュしました:".green(), name);
            }
        }

        built.push(name);
    }

    println!();
    println!("{}", "すべてのビルドが完了しました:".green().bold());
    for name in &built {
        println!("  {}", name.bold());
    }
    for warning in &warnings {
        println!("{}", warning.yellow());
    }

    Ok(())
}

/// ビルド対象の決定
///
/// `--name` のアドホックターゲット、`--all`（`_ALL_` があればその内容）、
/// 位置引数の順で解釈する。
fn select_targets(cli: &Cli, defs: &ImageDefs) -> Vec<String> {
    if let Some(name) = &cli.name {
        return vec![name.clone()];
    }
    if cli.all {
        if defs.all_targets.is_empty() {
            return defs.names().map(str::to_owned).collect();
        }
        return defs.all_targets.clone();
    }
    cli.targets.clone()
}

fn print_target_list(defs: &ImageDefs) {
    println!(
        "{} {}",
        "定義済みターゲット".bold(),
        format!("({})", defs.makefile_path.display()).dimmed()
    );
    for name in defs.names() {
        let marker = if defs.all_targets.contains(&name.to_string()) {
            " *".green().to_string()
        } else {
            String::new()
        };
        match defs
            .def(name, None)
            .ok()
            .and_then(|d| d.description.clone())
        {
            Some(desc) => println!("  {}{} - {}", name, marker, desc.dimmed()),
            None => println!("  {}{}", name, marker),
        }
    }
    if !defs.all_targets.is_empty() {
        println!("{}", "(* は --all でビルドされるターゲット)".dimmed());
    }
}
