// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Operational tooling for continuous log backup tasks: stop, pause, resume
//! and inspect them through the meta service.

#[macro_use]
extern crate slog;
#[macro_use]
extern crate slog_scope;

use slog::Drain;
use structopt::StructOpt;

use log_backup_advancer::{
    errors::{Error, Result},
    metadata::{store::EtcdStore, MetadataClient},
    types::TimeStamp,
};

#[derive(StructOpt)]
#[structopt(
    name = "backup-stream-ctl",
    about = "Operate continuous log backup tasks."
)]
struct Opt {
    /// The endpoints of the meta service.
    #[structopt(long = "pd", default_value = "127.0.0.1:2379", use_delimiter = true)]
    pd: Vec<String>,
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Stop the task and remove its metadata.
    Stop {
        #[structopt(long)]
        task: String,
    },
    /// Pause the task, recording the reason.
    Pause {
        #[structopt(long)]
        task: String,
        #[structopt(long, default_value = "paused by the operator")]
        reason: String,
    },
    /// Resume a paused task.
    Resume {
        #[structopt(long)]
        task: String,
    },
    /// Print the task, its checkpoint and the pause state.
    Status {
        #[structopt(long)]
        task: String,
    },
}

#[tokio::main]
async fn main() {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, slog::o!());
    let guard = slog_scope::set_global_logger(logger);

    let opt = Opt::from_args();
    if let Err(err) = run(opt).await {
        error!("the operation failed"; "err" => %err);
        // Flush the async drain before bailing out.
        drop(guard);
        std::process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<()> {
    let store = EtcdStore::connect(&opt.pd).await?;
    let cli = MetadataClient::new(store);
    match opt.cmd {
        Command::Stop { task } => {
            ensure_exists(&cli, &task).await?;
            cli.remove_task(&task).await?;
            info!("the task has been stopped"; "task" => %task);
        }
        Command::Pause { task, reason } => {
            ensure_exists(&cli, &task).await?;
            cli.pause(&task, &reason).await?;
            info!("the task has been paused"; "task" => %task, "reason" => %reason);
        }
        Command::Resume { task } => {
            ensure_exists(&cli, &task).await?;
            cli.resume(&task).await?;
            info!("the task has been resumed"; "task" => %task);
        }
        Command::Status { task } => {
            let info = cli.get_task(&task).await?.ok_or_else(|| Error::NoSuchTask {
                task_name: task.clone(),
            })?;
            let checkpoint = cli.global_checkpoint_of(&task).await?;
            let paused = cli.paused(&task).await?;
            let last_error = cli.get_last_error(&task).await?;
            println!("task: {}", info.info.name);
            println!("start-ts: {}", info.info.start_ts);
            match checkpoint {
                Some(ts) => println!(
                    "checkpoint: {} ({} ms since epoch)",
                    ts,
                    ts.physical()
                ),
                None => println!("checkpoint: <never published>"),
            }
            match paused {
                Some(reason) => println!("paused: yes ({})", reason),
                None => println!("paused: no"),
            }
            if let Some(err) = last_error {
                println!(
                    "last-error: {} (at {})",
                    err.error_message,
                    TimeStamp::compose(err.happen_at, 0)
                );
            }
        }
    }
    Ok(())
}

async fn ensure_exists<S: log_backup_advancer::metadata::store::MetaStore>(
    cli: &MetadataClient<S>,
    task: &str,
) -> Result<()> {
    cli.get_task(task)
        .await?
        .map(|_| ())
        .ok_or_else(|| Error::NoSuchTask {
            task_name: task.to_owned(),
        })
}
