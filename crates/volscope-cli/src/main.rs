//! volscope - memory-forensics workbench client
//!
//! 1. 設定を読む（volscope.toml → VOLSCOPE__* → CLI フラグ）
//! 2. subcommand を実行
//! 3. table は stdout、ログは stderr

mod render;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use volscope_core::app::{AnalysisSession, PollConfig, PollHandle};
use volscope_core::config::ClientConfig;
use volscope_core::domain::{
    AnalysisId, ExportFormat, JobKey, JobStatus, NewTrackedPid, Pid, PluginName, ProjectUpdate,
    ResultSchema, ResultSet, StatusReport, SymbolId, SymbolJobId, TrackedPidUpdate,
    build_timeline, detect_time_column,
};
use volscope_core::error::PollError;
use volscope_core::impls::{HttpAnalysisClient, ScriptedAnalysisApi, Step, batch_report};
use volscope_core::ports::AnalysisApi;

#[derive(Parser, Debug)]
#[command(name = "volscope", version)]
#[command(about = "Client for a memory-forensics analysis service")]
struct Cli {
    /// Config file (defaults to ./volscope.toml if present)
    #[arg(long, global = true, env = "VOLSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Override `base_url`
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Override `poll_interval_ms`
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a memory dump
    Upload {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },

    /// Uploaded dumps
    #[command(subcommand)]
    Projects(ProjectCommand),

    /// List available plugins
    Plugins {
        /// Mark plugins that already completed for this analysis
        #[arg(long)]
        analysis: Option<AnalysisId>,
    },

    /// Run plugin(s) and wait for the result
    Run(RunArgs),

    /// Run several plugins as one batch and wait for all of them
    Batch {
        analysis_id: AnalysisId,
        #[arg(required = true)]
        plugins: Vec<String>,
        #[arg(long)]
        force: bool,
    },

    /// One-shot status query (aggregate when no plugin is given)
    Status {
        analysis_id: AnalysisId,
        #[arg(long)]
        plugin: Option<String>,
        #[arg(long)]
        pid: Option<Pid>,
    },

    /// Show stored results of a plugin
    Results(ResultsArgs),

    /// Print (or download) an export of a plugin's results
    Export {
        analysis_id: AnalysisId,
        plugin: String,
        #[arg(long, default_value = "csv")]
        format: ExportFormat,
        /// Download to this file instead of printing the link
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Cross-plugin view of one process
    Correlate { analysis_id: AnalysisId, pid: Pid },

    /// Processes pinned for follow-up
    #[command(subcommand)]
    Tracked(TrackedCommand),

    /// Browse registry hives and keys
    #[command(subcommand)]
    Registry(RegistryCommand),

    /// Manage symbol tables
    #[command(subcommand)]
    Symbols(SymbolCommand),

    /// Run a scripted batch against the in-memory service
    Demo,
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    List,
    Show {
        analysis_id: AnalysisId,
    },
    Update {
        analysis_id: AnalysisId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        os_type: Option<String>,
    },
    DetectOs {
        analysis_id: AnalysisId,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    analysis_id: AnalysisId,

    /// Plugin names; several are allowed with `--pid`
    #[arg(required = true)]
    plugins: Vec<String>,

    /// Scope the run to one process
    #[arg(long)]
    pid: Option<Pid>,

    /// Re-run even if results exist
    #[arg(long)]
    force: bool,

    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug)]
struct ResultsArgs {
    analysis_id: AnalysisId,
    plugin: String,
    #[arg(long)]
    pid: Option<Pid>,
    #[command(flatten)]
    view: ViewArgs,
}

#[derive(Args, Debug, Default)]
struct ViewArgs {
    /// Keep rows containing this text (case-insensitive)
    #[arg(long)]
    filter: Option<String>,

    /// Comma-separated column list (inferred from the rows otherwise)
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Arrange rows by PID / PPID
    #[arg(long)]
    tree: bool,

    /// Place rows on a time axis
    #[arg(long, conflicts_with = "tree")]
    timeline: bool,

    /// Timestamp column for --timeline (detected otherwise)
    #[arg(long, requires = "timeline")]
    time_column: Option<String>,
}

#[derive(Subcommand, Debug)]
enum TrackedCommand {
    List {
        analysis_id: AnalysisId,
    },
    Add {
        analysis_id: AnalysisId,
        pid: Pid,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Update {
        analysis_id: AnalysisId,
        pid: Pid,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Remove {
        analysis_id: AnalysisId,
        pid: Pid,
    },
}

#[derive(Subcommand, Debug)]
enum RegistryCommand {
    Hives {
        analysis_id: AnalysisId,
    },
    Keys {
        analysis_id: AnalysisId,
        hive_offset: u64,
        #[arg(long)]
        key_path: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SymbolCommand {
    List,
    Job {
        job_id: SymbolJobId,
        /// Keep checking until the job completes or fails
        #[arg(long)]
        wait: bool,
    },
    UploadVmlinux { path: PathBuf },
    UploadIsf { path: PathBuf },
    Delete { id: SymbolId },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::load_from(cli.config.as_deref()).context("loading config")?;
    if let Some(url) = &cli.base_url {
        config.base_url = url.clone();
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    config.validate().context("invalid config")?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn show_results(results: &ResultSet, view: &ViewArgs, json: bool) -> Result<()> {
    let results = match &view.filter {
        Some(needle) => results.filter(needle),
        None => results.clone(),
    };
    if json {
        return print_json(&results);
    }
    if results.is_empty() {
        println!("(no rows)");
        return Ok(());
    }

    let schema = if view.columns.is_empty() {
        ResultSchema::infer(&results)
    } else {
        ResultSchema::declared(view.columns.iter())
    };
    if view.timeline {
        let column = match view.time_column.clone() {
            Some(column) => column,
            None => detect_time_column(&results)
                .context("no timestamp column found (use --time-column)")?,
        };
        let timeline = build_timeline(&results, &column, render::TIMELINE_WIDTH);
        render::print_timeline(&timeline, &schema)?;
    } else if view.tree {
        render::print_tree(&results, &schema)?;
    } else {
        render::print_table(&results, &schema)?;
    }
    Ok(())
}

/// Log every status change until the sender goes away.
fn log_progress(mut rx: watch::Receiver<JobStatus>, label: String) {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = *rx.borrow_and_update();
            info!(job = %label, %status, "status changed");
        }
    });
}

/// Join a poller, cancelling it on Ctrl-C.
async fn join_or_interrupt<T, S>(handle: PollHandle<T, S>) -> Result<T, PollError>
where
    T: Send + 'static,
    S: Clone,
{
    tokio::select! {
        result = handle.join() => result,
        _ = tokio::signal::ctrl_c() => Err(PollError::Cancelled),
    }
}

/// Plugin names in first-seen order, repeats dropped.
fn unique_plugins(names: &[String]) -> Vec<PluginName> {
    let mut plugins: Vec<PluginName> = Vec::new();
    for name in names {
        let plugin = PluginName::new(name.as_str());
        if !plugins.contains(&plugin) {
            plugins.push(plugin);
        }
    }
    plugins
}

async fn run(session: &AnalysisSession, args: RunArgs, json: bool) -> Result<()> {
    let plugins = unique_plugins(&args.plugins);

    let Some(pid) = args.pid else {
        let [plugin] = plugins.as_slice() else {
            bail!("several plugins without --pid: use `volscope batch`");
        };
        let job = JobKey::new(args.analysis_id, plugin.clone());
        let handle = session.run_and_poll(job.clone(), args.force).await?;
        info!(%job, attempt = %handle.attempt(), "polling");
        log_progress(handle.subscribe(), job.to_string());
        let results = join_or_interrupt(handle)
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))?;
        return show_results(&results, &args.view, json);
    };

    let mut pollers = session.pid_pollers(args.analysis_id, pid);
    for plugin in &plugins {
        pollers.start(plugin.clone(), args.force).await?;
        if let Some(rx) = pollers.subscribe(plugin) {
            log_progress(rx, format!("{plugin}@{pid}"));
        }
    }

    let mut failures = 0;
    for plugin in &plugins {
        let waited = tokio::select! {
            outcome = pollers.wait(plugin) => Some(outcome),
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(outcome) = waited else {
            pollers.cancel_all();
            bail!("interrupted");
        };
        match outcome {
            Some(Ok(results)) => {
                println!("== {plugin} (pid {pid})");
                show_results(&results, &args.view, json)?;
            }
            Some(Err(err)) => {
                failures += 1;
                eprintln!("{plugin}: {}", err.user_message());
            }
            None => {}
        }
    }

    for (plugin, status) in pollers.statuses() {
        info!(%plugin, %status, "final");
    }
    if failures == plugins.len() {
        bail!("every plugin failed for pid {pid}");
    }
    Ok(())
}

async fn batch(
    session: &AnalysisSession,
    analysis_id: AnalysisId,
    plugins: Vec<String>,
    force: bool,
    json: bool,
) -> Result<()> {
    let plugins = plugins.into_iter().map(PluginName::new).collect();
    let handle = session.run_batch_and_poll(analysis_id, plugins, force).await?;

    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let counts = rx.borrow_and_update().counts();
            info!(
                done = counts.terminal(),
                total = counts.total(),
                completed = counts.completed,
                failed = counts.failed,
                "batch progress"
            );
        }
    });

    match join_or_interrupt(handle).await {
        Ok(outcome) => {
            render::print_members(&outcome.progress);
            let others: Vec<String> = outcome
                .completed()
                .iter()
                .filter(|p| **p != outcome.selected)
                .map(ToString::to_string)
                .collect();
            println!();
            println!("== {}", outcome.selected);
            show_results(&outcome.results, &ViewArgs::default(), json)?;
            if !others.is_empty() {
                println!();
                println!("also completed: {}", others.join(", "));
            }
            Ok(())
        }
        Err(PollError::BatchFailed { members, .. }) => {
            for member in &members {
                eprintln!(
                    "{}: {}",
                    member.plugin,
                    member.error.as_deref().unwrap_or("failed")
                );
            }
            bail!("no plugin in the batch completed");
        }
        Err(err) => Err(anyhow::anyhow!(err.user_message())),
    }
}

/// Scripted batch: A completes, B fails, C completes on the third tick.
async fn demo(config: PollConfig) -> Result<()> {
    use JobStatus::*;

    let api = ScriptedAnalysisApi::new();
    let analysis_id = AnalysisId::new("demo");
    api.script_batch(
        analysis_id.clone(),
        [
            Step::Report(batch_report([
                ("windows.info.Info", Running),
                ("windows.malfind.Malfind", Running),
            ])),
            Step::Report(batch_report([
                ("windows.info.Info", Completed),
                ("windows.malfind.Malfind", Failed),
                ("windows.pslist.PsList", Running),
            ])),
            Step::Report(batch_report([
                ("windows.info.Info", Completed),
                ("windows.malfind.Malfind", Failed),
                ("windows.pslist.PsList", Completed),
            ])),
        ],
    );
    let rows: ResultSet = serde_json::from_value(serde_json::json!([
        { "Variable": "Kernel Base", "Value": "0xf80002a5d000" },
        { "Variable": "NtMajorVersion", "Value": 6 },
        { "Variable": "SystemTime", "Value": "2012-07-22 02:45:08" },
    ]))?;
    api.set_results(
        JobKey::new(analysis_id.clone(), PluginName::new("windows.info.Info")),
        rows,
    );

    let session = AnalysisSession::new(Arc::new(api.clone()), config);
    batch(
        &session,
        analysis_id,
        vec![
            "windows.info.Info".to_string(),
            "windows.malfind.Malfind".to_string(),
            "windows.pslist.PsList".to_string(),
        ],
        false,
        false,
    )
    .await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let json = cli.json;

    if let Command::Demo = cli.command {
        // demo は待ち時間を短くする
        return demo(PollConfig {
            interval: Duration::from_millis(cli.poll_interval_ms.unwrap_or(300)),
        })
        .await;
    }

    let client = HttpAnalysisClient::new(&config).context("building http client")?;
    let api: Arc<dyn AnalysisApi> = Arc::new(client.clone());
    let session = AnalysisSession::new(api.clone(), PollConfig::from(&config));
    info!(base_url = %config.base_url, "connected");

    match cli.command {
        Command::Upload { path, name } => {
            let receipt = client
                .upload(&path, name.as_deref())
                .await
                .with_context(|| format!("uploading {}", path.display()))?;
            println!("{}", receipt.analysis_id);
        }

        Command::Projects(cmd) => match cmd {
            ProjectCommand::List => {
                let projects = client.list_projects().await?;
                if json {
                    return print_json(&projects);
                }
                for p in projects {
                    let os = p.os_type.as_deref().unwrap_or("-");
                    println!("{:<28} {:<8} {}", p.id, os, p.display_name());
                }
            }
            ProjectCommand::Show { analysis_id } => {
                print_json(&client.get_project(&analysis_id).await?)?;
            }
            ProjectCommand::Update {
                analysis_id,
                name,
                os_type,
            } => {
                let update = ProjectUpdate {
                    project_name: name,
                    os_type,
                };
                if update.is_empty() {
                    bail!("nothing to update (use --name or --os-type)");
                }
                print_json(&client.update_project(&analysis_id, &update).await?)?;
            }
            ProjectCommand::DetectOs { analysis_id } => {
                let detected = client.detect_os(&analysis_id).await?;
                println!("{}", detected.os_type.as_deref().unwrap_or("unknown"));
            }
        },

        Command::Plugins { analysis } => {
            let plugins = client.list_plugins().await?;
            if json {
                return print_json(&plugins);
            }
            let done = match &analysis {
                Some(id) => session.completed_plugins(id, Vec::new()).await,
                None => Vec::new(),
            };
            for p in plugins {
                let mark = if done.contains(&p.name) { "*" } else { " " };
                println!("{mark} {:<40} {}", p.name, p.description.as_deref().unwrap_or(""));
            }
        }

        Command::Run(args) => run(&session, args, json).await?,

        Command::Batch {
            analysis_id,
            plugins,
            force,
        } => batch(&session, analysis_id, plugins, force, json).await?,

        Command::Status {
            analysis_id,
            plugin,
            pid,
        } => match plugin {
            Some(plugin) => {
                let mut job = JobKey::new(analysis_id, PluginName::new(plugin));
                if let Some(pid) = pid {
                    job = job.with_pid(pid);
                }
                let StatusReport { status, error } = api.job_status(&job).await?;
                match error {
                    Some(error) => println!("{status}: {error}"),
                    None => println!("{status}"),
                }
            }
            None => {
                let report = api.batch_status(&analysis_id).await?;
                let mut members: Vec<_> = report.plugins.iter().collect();
                members.sort_by(|a, b| a.0.cmp(b.0));
                for (plugin, member) in members {
                    println!("{:<40} {}", plugin, member.status());
                }
            }
        },

        Command::Results(args) => {
            let mut job = JobKey::new(args.analysis_id, PluginName::new(args.plugin));
            if let Some(pid) = args.pid {
                job = job.with_pid(pid);
            }
            let results = session.fetch_results(&job).await?;
            show_results(&results, &args.view, json)?;
        }

        Command::Export {
            analysis_id,
            plugin,
            format,
            output,
        } => {
            let plugin = PluginName::new(plugin);
            match output {
                Some(path) => {
                    let bytes = client.export(&analysis_id, &plugin, format).await?;
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), bytes = bytes.len(), "export saved");
                }
                None => println!("{}", client.export_url(&analysis_id, &plugin, format)?),
            }
        }

        Command::Correlate { analysis_id, pid } => {
            print_json(&client.correlate(&analysis_id, pid).await?)?;
        }

        Command::Tracked(cmd) => match cmd {
            TrackedCommand::List { analysis_id } => {
                let tracked = client.tracked_pids(&analysis_id).await?;
                if json {
                    return print_json(&tracked);
                }
                for t in tracked {
                    println!(
                        "{:<8} {:<24} {}",
                        t.pid,
                        t.label.as_deref().unwrap_or("-"),
                        t.notes.as_deref().unwrap_or("")
                    );
                }
            }
            TrackedCommand::Add {
                analysis_id,
                pid,
                label,
                notes,
            } => {
                client
                    .track_pid(&analysis_id, &NewTrackedPid { pid, label, notes })
                    .await?;
            }
            TrackedCommand::Update {
                analysis_id,
                pid,
                label,
                notes,
            } => {
                client
                    .update_tracked_pid(&analysis_id, pid, &TrackedPidUpdate { label, notes })
                    .await?;
            }
            TrackedCommand::Remove { analysis_id, pid } => {
                client.untrack_pid(&analysis_id, pid).await?;
            }
        },

        Command::Registry(cmd) => match cmd {
            RegistryCommand::Hives { analysis_id } => {
                let hives = client.registry_hives(&analysis_id).await?;
                if json {
                    return print_json(&hives);
                }
                for h in hives {
                    println!("{:#x}  {}", h.offset, h.name.as_deref().unwrap_or(""));
                }
            }
            RegistryCommand::Keys {
                analysis_id,
                hive_offset,
                key_path,
            } => {
                let keys = client
                    .registry_keys(&analysis_id, hive_offset, key_path.as_deref())
                    .await?;
                show_results(&keys, &ViewArgs::default(), json)?;
            }
        },

        Command::Symbols(cmd) => match cmd {
            SymbolCommand::List => {
                let symbols = client.list_symbols().await?;
                if json {
                    return print_json(&symbols);
                }
                for s in symbols {
                    println!(
                        "{:<28} {:<8} {}",
                        s.id,
                        s.os_type.as_deref().unwrap_or("-"),
                        s.name.as_deref().unwrap_or("")
                    );
                }
            }
            SymbolCommand::Job { job_id, wait } => {
                let mut job = client.symbol_job(&job_id).await?;
                while wait && !job.is_finished() {
                    info!(%job_id, status = job.status.as_deref().unwrap_or("-"), "symbol job");
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval()) => {}
                        _ = tokio::signal::ctrl_c() => bail!("interrupted"),
                    }
                    job = client.symbol_job(&job_id).await?;
                }
                print_json(&job)?;
            }
            SymbolCommand::UploadVmlinux { path } => {
                let job = client.upload_vmlinux(&path).await?;
                println!("{}", job.id);
            }
            SymbolCommand::UploadIsf { path } => client.upload_isf(&path).await?,
            SymbolCommand::Delete { id } => client.delete_symbol(&id).await?,
        },

        Command::Demo => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_pid_and_view_flags() {
        let cli = Cli::try_parse_from([
            "volscope",
            "run",
            "a-1",
            "windows.dlllist.DllList",
            "windows.handles.Handles",
            "--pid",
            "1337",
            "--columns",
            "Base,Name",
            "--filter",
            "ntdll",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.analysis_id, AnalysisId::new("a-1"));
        assert_eq!(args.pid, Some(Pid::new(1337)));
        assert_eq!(args.plugins.len(), 2);
        assert_eq!(args.view.columns, vec!["Base", "Name"]);
        assert_eq!(args.view.filter.as_deref(), Some("ntdll"));
    }

    #[test]
    fn repeated_plugins_collapse_in_order() {
        let names = vec![
            "windows.dlllist.DllList".to_string(),
            "windows.handles.Handles".to_string(),
            "windows.dlllist.DllList".to_string(),
        ];

        assert_eq!(
            unique_plugins(&names),
            vec![
                PluginName::new("windows.dlllist.DllList"),
                PluginName::new("windows.handles.Handles"),
            ]
        );
    }

    #[test]
    fn timeline_flags() {
        let cli = Cli::try_parse_from([
            "volscope",
            "results",
            "a-1",
            "windows.pslist.PsList",
            "--timeline",
            "--time-column",
            "ExitTime",
        ])
        .unwrap();
        let Command::Results(args) = cli.command else {
            panic!("expected results");
        };
        assert!(args.view.timeline);
        assert_eq!(args.view.time_column.as_deref(), Some("ExitTime"));

        let clash = Cli::try_parse_from([
            "volscope", "results", "a-1", "windows.pslist.PsList", "--timeline", "--tree",
        ]);
        assert!(clash.is_err());
    }

    #[test]
    fn symbol_job_wait_flag() {
        let cli = Cli::try_parse_from(["volscope", "symbols", "job", "job-9", "--wait"]).unwrap();
        let Command::Symbols(SymbolCommand::Job { job_id, wait }) = cli.command else {
            panic!("expected symbols job");
        };
        assert_eq!(job_id, SymbolJobId::new("job-9"));
        assert!(wait);
    }

    #[test]
    fn export_format_is_parsed() {
        let cli = Cli::try_parse_from([
            "volscope", "export", "a-1", "windows.pslist.PsList", "--format", "JSON",
        ])
        .unwrap();
        let Command::Export { format, output, .. } = cli.command else {
            panic!("expected export");
        };
        assert_eq!(format, ExportFormat::Json);
        assert!(output.is_none());
    }
}
