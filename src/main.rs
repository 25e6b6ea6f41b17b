use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use glob::glob;
use meshprobe::config::{
    ConfigError, EffectiveConfig, default_config_yaml, expand_tilde, load_effective_config,
};
use meshprobe::detect::CancelToken;
use meshprobe::store::export::write_point_cloud;
use meshprobe::store::{ObjectStore, StoreError};
use meshprobe::tape::replay::replay_live;
use meshprobe::tape::{ReplayHarness, Tape, TapeError};
use meshprobe::tracking::AnchorId;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const STATE_DIR: &str = ".meshprobe";
const DB_FILE: &str = "objects.sqlite";
const LOG_ENV: &str = "MESHPROBE_LOG";
const TAPE_SUFFIXES: [&str; 2] = [".jsonl", ".jsonl.zst"];

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(value: StoreError) -> Self {
        Self::new("store_error", value.to_string())
    }
}

impl From<TapeError> for CliError {
    fn from(value: TapeError) -> Self {
        match value {
            TapeError::Store(err) => err.into(),
            other => Self::new("tape_error", other.to_string()),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "meshprobe")]
#[command(about = "Aim at a scanned mesh, fit primitives, and keep them anchored")]
struct Cli {
    #[arg(long, global = true)]
    global: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Replay(ReplayArgs),
    Objects,
    Show(AnchorArgs),
    Export(ExportArgs),
    Remove(AnchorArgs),
    Clear,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[arg(required = true)]
    tapes: Vec<String>,
    #[arg(long)]
    live: bool,
    #[arg(long)]
    dump_points: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct AnchorArgs {
    anchor_id: String,
}

#[derive(Args, Debug)]
struct ExportArgs {
    anchor_id: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    RepoLocal,
    Global,
}

#[derive(Debug, Clone)]
struct StatePaths {
    root: PathBuf,
    db: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
    home: PathBuf,
    mode: StorageMode,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = state_paths(&cwd, cli.global)?;
    match cli.command {
        Command::Init => cmd_init(&paths),
        Command::Replay(args) => cmd_replay(&cwd, &paths, args),
        Command::Objects => cmd_objects(&cwd, &paths),
        Command::Show(args) => cmd_show(&cwd, &paths, args),
        Command::Export(args) => cmd_export(&cwd, &paths, args),
        Command::Remove(args) => cmd_remove(&cwd, &paths, args),
        Command::Clear => cmd_clear(&cwd, &paths),
    }
}

fn cmd_init(paths: &StatePaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    let _ = ObjectStore::open(&paths.db)?;
    write_default_config(paths)?;

    print_json(&json!({
        "status": "ok",
        "state_dir": paths.root,
        "db": paths.db,
        "mode": match paths.mode {
            StorageMode::RepoLocal => "repo",
            StorageMode::Global => "global",
        },
    }))
}

fn cmd_replay(cwd: &Path, paths: &StatePaths, args: ReplayArgs) -> Result<(), CliError> {
    require_initialized(paths)?;
    let config = load_config(cwd, paths)?;
    let db = db_path(paths, &config);
    let tape_paths = resolve_tape_paths(cwd, &paths.home, &args.tapes)?;
    if tape_paths.is_empty() {
        return Err(CliError::new("no_tapes", "no session tapes matched"));
    }

    let cancel = CancelToken::new();
    if args.live {
        let token = cancel.clone();
        ctrlc::set_handler(move || token.cancel())
            .map_err(|err| CliError::new("signal_error", err.to_string()))?;
    }

    let mut reports = Vec::with_capacity(tape_paths.len());
    let mut final_points = Vec::new();
    for path in &tape_paths {
        if cancel.is_cancelled() {
            break;
        }
        let tape = Tape::read(path)?;
        let store = ObjectStore::open(&db)?;
        let (report, points) = if args.live {
            replay_live(&tape, store, &config, &cancel)?
        } else {
            let mut harness = ReplayHarness::new(store, &config)?;
            let report = harness.run(&tape)?;
            (report, harness.snapshot_vertices())
        };
        tracing::info!(tape = %tape.id, committed = report.committed.len(), "replayed tape");
        let mut value = serde_json::to_value(&report)?;
        if let Value::Object(map) = &mut value {
            map.insert("path".to_string(), json!(path));
        }
        reports.push(value);
        final_points = points;
    }

    let mut dumped = Value::Null;
    if let Some(out) = &args.dump_points {
        let written = write_point_cloud(out, &final_points)
            .map_err(|err| CliError::io("export_error", err))?;
        dumped = json!({ "path": out, "points": written });
    }

    print_json(&json!({
        "reports": reports,
        "cancelled": cancel.is_cancelled(),
        "dump_points": dumped,
    }))
}

fn cmd_objects(cwd: &Path, paths: &StatePaths) -> Result<(), CliError> {
    let store = open_store(cwd, paths)?;
    let objects = store.list()?;
    print_json(&json!({
        "count": objects.len(),
        "objects": objects,
    }))
}

fn cmd_show(cwd: &Path, paths: &StatePaths, args: AnchorArgs) -> Result<(), CliError> {
    let store = open_store(cwd, paths)?;
    let anchor_id = parse_anchor_id(&args.anchor_id)?;
    let object = store
        .find(anchor_id)?
        .ok_or_else(|| object_not_found(&args.anchor_id))?;
    print_json(&json!({
        "object": object,
        "kind": object.kind().as_str(),
        "inlier_count": object.inliers.len(),
    }))
}

fn cmd_export(cwd: &Path, paths: &StatePaths, args: ExportArgs) -> Result<(), CliError> {
    let store = open_store(cwd, paths)?;
    let anchor_id = parse_anchor_id(&args.anchor_id)?;
    let object = store
        .find(anchor_id)?
        .ok_or_else(|| object_not_found(&args.anchor_id))?;
    let written = write_point_cloud(&args.out, &object.inliers)
        .map_err(|err| CliError::io("export_error", err))?;
    print_json(&json!({
        "status": "ok",
        "anchor_id": anchor_id,
        "name": object.name,
        "path": args.out,
        "points": written,
    }))
}

fn cmd_remove(cwd: &Path, paths: &StatePaths, args: AnchorArgs) -> Result<(), CliError> {
    let store = open_store(cwd, paths)?;
    let anchor_id = parse_anchor_id(&args.anchor_id)?;
    if !store.delete(anchor_id)? {
        return Err(object_not_found(&args.anchor_id));
    }
    print_json(&json!({
        "status": "ok",
        "removed": anchor_id,
    }))
}

fn cmd_clear(cwd: &Path, paths: &StatePaths) -> Result<(), CliError> {
    let store = open_store(cwd, paths)?;
    let removed = store.clear()?;
    print_json(&json!({
        "status": "ok",
        "removed_count": removed,
    }))
}

fn resolve_tape_paths(cwd: &Path, home: &Path, raw: &[String]) -> Result<Vec<PathBuf>, CliError> {
    let mut out = Vec::new();
    for raw_path in raw {
        let raw_path = raw_path.trim();
        if raw_path.is_empty() {
            continue;
        }
        let expanded = expand_tilde(raw_path, home);
        let expanded = if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        };

        if looks_like_glob(raw_path) {
            out.extend(glob_paths(&expanded)?);
        } else if expanded.is_dir() {
            let mut found = WalkDir::new(&expanded)
                .into_iter()
                .filter_map(Result::ok)
                .map(|entry| entry.path().to_path_buf())
                .filter(|path| path.is_file() && is_tape_file(path))
                .collect::<Vec<_>>();
            found.sort();
            out.extend(found);
        } else if expanded.is_file() {
            out.push(expanded);
        } else {
            return Err(CliError::new(
                "tape_not_found",
                format!("tape `{raw_path}` not found"),
            ));
        }
    }
    let mut seen = std::collections::HashSet::new();
    out.retain(|path| seen.insert(path.clone()));
    Ok(out)
}

fn is_tape_file(path: &Path) -> bool {
    let name = path.to_string_lossy();
    TAPE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn looks_like_glob(path: &str) -> bool {
    ['*', '?', '[', ']', '{', '}']
        .iter()
        .any(|ch| path.contains(*ch))
}

fn glob_paths(pattern: &Path) -> Result<Vec<PathBuf>, CliError> {
    let pattern_str = pattern.to_string_lossy();
    let mut out = Vec::new();
    let entries = glob(&pattern_str)
        .map_err(|err| CliError::new("glob_error", format!("{} ({pattern_str})", err.msg)))?;
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => out.push(path),
            Ok(_) => {}
            Err(err) => {
                return Err(CliError::new("glob_error", err.to_string()));
            }
        }
    }
    Ok(out)
}

fn parse_anchor_id(raw: &str) -> Result<AnchorId, CliError> {
    raw.parse::<AnchorId>()
        .map_err(|err| CliError::new("invalid_anchor_id", format!("`{raw}`: {err}")))
}

fn object_not_found(raw: &str) -> CliError {
    CliError::new("object_not_found", format!("no object anchored at `{raw}`"))
}

fn state_paths(cwd: &Path, global: bool) -> Result<StatePaths, CliError> {
    let home = home_dir()?;
    let (root, mode) = if global {
        (home.join(STATE_DIR), StorageMode::Global)
    } else {
        (cwd.join(STATE_DIR), StorageMode::RepoLocal)
    };

    Ok(StatePaths {
        db: root.join(DB_FILE),
        repo_config: cwd.join(STATE_DIR).join("config.yml"),
        user_config: home.join(STATE_DIR).join("config.yml"),
        root,
        home,
        mode,
    })
}

fn require_initialized(paths: &StatePaths) -> Result<(), CliError> {
    if !paths.root.exists() {
        return Err(CliError::new(
            "not_initialized",
            "meshprobe is not initialized here; run `meshprobe init`",
        ));
    }
    Ok(())
}

fn load_config(cwd: &Path, paths: &StatePaths) -> Result<EffectiveConfig, CliError> {
    Ok(load_effective_config(
        cwd,
        Some(&paths.repo_config),
        Some(&paths.user_config),
        &paths.home,
    )?)
}

fn db_path(paths: &StatePaths, config: &EffectiveConfig) -> PathBuf {
    config.db_path.clone().unwrap_or_else(|| paths.db.clone())
}

fn open_store(cwd: &Path, paths: &StatePaths) -> Result<ObjectStore, CliError> {
    require_initialized(paths)?;
    let config = load_config(cwd, paths)?;
    Ok(ObjectStore::open(&db_path(paths, &config))?)
}

fn write_default_config(paths: &StatePaths) -> Result<(), CliError> {
    let config_path = match paths.mode {
        StorageMode::RepoLocal => &paths.repo_config,
        StorageMode::Global => &paths.user_config,
    };
    if config_path.exists() {
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    fs::write(config_path, default_config_yaml()).map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
