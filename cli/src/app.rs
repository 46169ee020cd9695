use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use autopilot_core::api::{
    parse_plan, AppConfig, AppContext, CliError, EngineError, EventKind, HealingRequest,
    Orchestrator, TaskOutcome,
};
use autopilot_plugins::services::PluginServicesFactory;

use crate::commands::cli::{
    CheckpointCommand, Commands, ExecArgs, HistoryArgs, OutputFormat, ResumeArgs, RunArgs,
};
use crate::render;

pub async fn dispatch(
    cmd: Commands,
    format: OutputFormat,
    mut cfg: AppConfig,
) -> Result<i32, CliError> {
    match cmd {
        Commands::Run(args) => {
            if let Some(t) = args.timeout_secs {
                cfg.sandbox.timeout_secs = t;
            }
            if let Some(r) = args.max_retries {
                cfg.healing.max_retries = r;
            }
            run_cmd(args, format, orchestrator(cfg).await?).await
        }
        Commands::Resume(args) => resume_cmd(args, format, orchestrator(cfg).await?).await,
        Commands::Exec(args) => {
            if let Some(t) = args.timeout_secs {
                cfg.sandbox.timeout_secs = t;
            }
            if args.no_heal {
                cfg.healing.max_retries = 1;
            }
            exec_cmd(args, format, orchestrator(cfg).await?).await
        }
        Commands::History(args) => history_cmd(args, format, orchestrator(cfg).await?).await,
        Commands::Checkpoints { action } => {
            checkpoints_cmd(action, format, orchestrator(cfg).await?).await
        }
        Commands::Tasks => tasks_cmd(format, orchestrator(cfg).await?).await,
    }
}

async fn orchestrator(cfg: AppConfig) -> Result<Orchestrator, CliError> {
    let ctx = AppContext::new(cfg, Arc::new(PluginServicesFactory)).await?;
    Ok(ctx.orchestrator().await?)
}

async fn run_cmd(
    args: RunArgs,
    format: OutputFormat,
    orchestrator: Orchestrator,
) -> Result<i32, CliError> {
    let description = read_description(&args).await?;

    let task = match &args.plan_file {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            let steps = parse_plan(&text).map_err(EngineError::from)?;
            orchestrator.submit_planned(&description, steps).await?
        }
        None => orchestrator.submit(&description).await?,
    };
    tracing::info!(task_id = %task.id, steps = task.steps.len(), "task planned");

    let follower = args.follow.then(|| follow(&orchestrator, &task.id));
    let outcome = interruptible(&orchestrator, &task.id, orchestrator.run(&task.id)).await?;
    finish_follow(follower).await;
    report_outcome(&outcome, format)
}

async fn resume_cmd(
    args: ResumeArgs,
    format: OutputFormat,
    orchestrator: Orchestrator,
) -> Result<i32, CliError> {
    let follower = args.follow.then(|| follow(&orchestrator, &args.task_id));
    let outcome =
        interruptible(&orchestrator, &args.task_id, orchestrator.resume(&args.task_id)).await?;
    finish_follow(follower).await;
    report_outcome(&outcome, format)
}

async fn exec_cmd(
    args: ExecArgs,
    format: OutputFormat,
    orchestrator: Orchestrator,
) -> Result<i32, CliError> {
    let code = match (&args.code, &args.file) {
        (Some(code), _) => code.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => read_stdin().await?,
    };
    let mut request = HealingRequest::new(&args.language, code);
    if let Some(goal) = &args.goal {
        request = request.with_goal(goal);
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; cancelling execution");
            trigger.cancel();
        }
    });
    let result = orchestrator.exec(request, &cancel).await;
    watcher.abort();

    let record = match result {
        Ok(record) => record,
        Err(EngineError::HealingExhausted { last_record, .. }) if format == OutputFormat::Text => {
            print!("{}", last_record.stdout);
            eprint!("{}", last_record.stderr);
            eprintln!("{}", render::record_line(&last_record));
            return Err(CliError::TaskFailed {
                task_id: "adhoc".to_string(),
                status: "failed".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    match format {
        OutputFormat::Json => println!("{}", to_json(&record)?),
        OutputFormat::Text => {
            print!("{}", record.stdout);
            eprint!("{}", record.stderr);
            tracing::debug!(record = %render::record_line(&record), "exec finished");
        }
    }
    Ok(0)
}

async fn history_cmd(
    args: HistoryArgs,
    format: OutputFormat,
    orchestrator: Orchestrator,
) -> Result<i32, CliError> {
    let records = match &args.task {
        Some(task_id) => {
            let mut all = orchestrator.history().for_task(task_id).await?;
            let skip = all.len().saturating_sub(args.limit);
            all.split_off(skip)
        }
        None => orchestrator.history().adhoc(args.limit).await?,
    };

    match format {
        OutputFormat::Json => println!("{}", to_json(&records)?),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("no executions recorded");
            }
            for record in &records {
                println!("{}", render::record_line(record));
            }
        }
    }
    Ok(0)
}

async fn checkpoints_cmd(
    action: CheckpointCommand,
    format: OutputFormat,
    orchestrator: Orchestrator,
) -> Result<i32, CliError> {
    match action {
        CheckpointCommand::List { task } => {
            let store = orchestrator.checkpoints();
            let tasks = match task {
                Some(t) => vec![t],
                None => store.tasks().await.map_err(EngineError::from)?,
            };
            let mut all = Vec::new();
            for task_id in tasks {
                all.extend(store.list(&task_id).await.map_err(EngineError::from)?);
            }
            match format {
                OutputFormat::Json => println!("{}", to_json(&all)?),
                OutputFormat::Text => {
                    if all.is_empty() {
                        println!("no checkpoints");
                    }
                    for cp in &all {
                        println!("{}", render::checkpoint_line(cp));
                    }
                }
            }
        }
        CheckpointCommand::Gc => {
            let removed = orchestrator.collect_checkpoints().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
                OutputFormat::Text => println!("removed {removed} checkpoint(s)"),
            }
        }
    }
    Ok(0)
}

async fn tasks_cmd(format: OutputFormat, orchestrator: Orchestrator) -> Result<i32, CliError> {
    let tasks = orchestrator.tasks().await?;
    match format {
        OutputFormat::Json => println!("{}", to_json(&tasks)?),
        OutputFormat::Text => {
            for task in &tasks {
                println!(
                    "{} {:<9} {} step(s)  {}",
                    task.id,
                    task.status,
                    task.steps.len(),
                    task.description
                );
            }
        }
    }
    Ok(0)
}

/// Drive `fut` to completion, cancelling the task on Ctrl-C and waiting for it to settle.
async fn interruptible<F>(
    orchestrator: &Orchestrator,
    task_id: &str,
    fut: F,
) -> Result<TaskOutcome, CliError>
where
    F: std::future::Future<Output = Result<TaskOutcome, EngineError>>,
{
    tokio::pin!(fut);
    tokio::select! {
        res = &mut fut => Ok(res?),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(task_id, "interrupted; cancelling task");
            orchestrator.cancel(task_id).await?;
            Ok(fut.await?)
        }
    }
}

fn follow(orchestrator: &Orchestrator, task_id: &str) -> JoinHandle<()> {
    let journal = orchestrator.journal().clone();
    let task_id = task_id.to_string();
    tokio::spawn(async move {
        let mut sub = journal.subscribe(&task_id, None).await;
        while let Some(event) = sub.next().await {
            eprintln!("{}", render::event_line(&event));
            if matches!(event.kind, EventKind::TaskFinished { .. }) {
                break;
            }
        }
    })
}

async fn finish_follow(follower: Option<JoinHandle<()>>) {
    if let Some(handle) = follower {
        if tokio::time::timeout(Duration::from_millis(500), handle).await.is_err() {
            tracing::debug!("progress follower did not see the final event");
        }
    }
}

fn report_outcome(outcome: &TaskOutcome, format: OutputFormat) -> Result<i32, CliError> {
    match format {
        OutputFormat::Json => println!("{}", to_json(outcome)?),
        OutputFormat::Text => println!("{}", render::outcome_text(outcome)),
    }
    if outcome.is_success() {
        Ok(0)
    } else {
        Err(CliError::TaskFailed {
            task_id: outcome.task.id.clone(),
            status: outcome.status().to_string(),
        })
    }
}

async fn read_description(args: &RunArgs) -> Result<String, CliError> {
    let text = if let Some(d) = &args.description {
        d.clone()
    } else if let Some(path) = &args.prompt_file {
        tokio::fs::read_to_string(path).await?
    } else if args.stdin {
        read_stdin().await?
    } else {
        return Err(CliError::Command(
            "a task description is required (argument, --prompt-file or --stdin)".into(),
        ));
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(CliError::Command("task description is empty".into()));
    }
    Ok(text)
}

async fn read_stdin() -> Result<String, CliError> {
    let mut buf = String::new();
    tokio::io::stdin().read_to_string(&mut buf).await?;
    Ok(buf)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value).map_err(|e| CliError::Command(e.to_string()))
}
